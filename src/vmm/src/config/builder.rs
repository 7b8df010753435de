use super::{Config, Error, GuestImage, PageSize, HUGE_PAGE_SIZE};

/// See [`Config`] for explanation of the produced fields.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    memory_mib: u32,
    page_size_flag: u32,
    guests: Vec<String>,
    shared_files: Vec<String>,
}

impl ConfigBuilder {
    pub fn new(memory_mib: u32, page_size_flag: u32) -> Self {
        ConfigBuilder {
            memory_mib,
            page_size_flag,
            guests: Vec::new(),
            shared_files: Vec::new(),
        }
    }

    pub fn guest(mut self, path: String) -> Self {
        self.guests.push(path);
        self
    }

    pub fn guests(mut self, paths: impl IntoIterator<Item = String>) -> Self {
        self.guests.extend(paths);
        self
    }

    pub fn shared_file(mut self, name: String) -> Self {
        self.shared_files.push(name);
        self
    }

    pub fn shared_files(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.shared_files.extend(names);
        self
    }

    /// Validate and produce the final [`Config`].
    ///
    /// Rejects the `page=2MiB` / `memory=2MiB` combination per spec.md §6:
    /// 2 MiB huge-page mode reserves the first 2 MiB huge page for the
    /// page-table block, so a 2 MiB-total guest would have no room left
    /// for a loadable image.
    pub fn build(self) -> Result<Config, Error> {
        if self.memory_mib == 0 || (self.memory_mib as u64 * 1024 * 1024) % HUGE_PAGE_SIZE != 0 {
            return Err(Error::MemorySize(self.memory_mib));
        }
        let memory_size = self.memory_mib as u64 * 1024 * 1024;
        let page_size = PageSize::from(self.page_size_flag);

        if page_size == PageSize::HugePage2MiB && memory_size == HUGE_PAGE_SIZE {
            return Err(Error::TooSmallForHugePages);
        }

        if self.guests.is_empty() {
            return Err(Error::NoGuests);
        }
        let guests = self
            .guests
            .into_iter()
            .map(GuestImage::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Config {
            memory_size,
            page_size,
            guests,
            shared_files: self.shared_files,
        })
    }
}
