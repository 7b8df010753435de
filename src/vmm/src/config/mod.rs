use std::path::PathBuf;

mod builder;
pub use builder::ConfigBuilder;

/// Size of one huge page / one page-directory-covered range, in bytes.
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("guest image path does not exist: {0}")]
    GuestImage(String),
    #[error("memory size must be a non-zero multiple of 2 MiB, got {0} MiB")]
    MemorySize(u32),
    #[error("page=2MiB with memory=2MiB leaves no room for a loadable image")]
    TooSmallForHugePages,
    #[error("at least one guest image must be given with --guest/-g")]
    NoGuests,
}

/// Paging granularity used to map a guest's physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    HugePage2MiB,
    SmallPage4KiB,
}

impl From<u32> for PageSize {
    /// Per spec.md §6: `--page 4` selects 4 KiB pages, any other value
    /// (including the default) selects 2 MiB huge pages.
    fn from(value: u32) -> Self {
        if value == 4 {
            PageSize::SmallPage4KiB
        } else {
            PageSize::HugePage2MiB
        }
    }
}

/// One guest image to launch, identified only by its path on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestImage {
    pub path: PathBuf,
}

impl TryFrom<String> for GuestImage {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let path = PathBuf::from(&value);
        if !path.exists() {
            return Err(Error::GuestImage(value));
        }
        Ok(GuestImage { path })
    }
}

/// Resolved, validated configuration shared by every guest the
/// [`crate::GuestSupervisor`] launches.
#[derive(Debug, Clone)]
pub struct Config {
    /// Guest-physical memory size, in bytes, applied to every guest.
    pub memory_size: u64,
    pub page_size: PageSize,
    pub guests: Vec<GuestImage>,
    /// Names guests may read directly from the host filesystem (§4.4 OPEN
    /// resolution step 3), subject to copy-on-write.
    pub shared_files: Vec<String>,
}

impl Config {
    pub fn builder(memory_mib: u32, page_size_flag: u32) -> ConfigBuilder {
        ConfigBuilder::new(memory_mib, page_size_flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_from_flag() {
        assert_eq!(PageSize::from(4), PageSize::SmallPage4KiB);
        assert_eq!(PageSize::from(2), PageSize::HugePage2MiB);
        assert_eq!(PageSize::from(0), PageSize::HugePage2MiB);
    }

    #[test]
    fn guest_image_rejects_missing_path() {
        let result: Result<GuestImage, Error> = "/no/such/path/ever".to_string().try_into();
        assert!(matches!(result, Err(Error::GuestImage(_))));
    }

    #[test]
    fn guest_image_accepts_existing_path() {
        let path = "Cargo.toml".to_string();
        let image: GuestImage = path.clone().try_into().expect("file exists");
        assert_eq!(image.path, PathBuf::from(path));
    }

    #[test]
    fn builder_rejects_memory_not_multiple_of_2mib() {
        let result = Config::builder(3, 2).guest("Cargo.toml".into()).build();
        assert!(matches!(result, Err(Error::MemorySize(3))));
    }

    #[test]
    fn builder_rejects_2mib_huge_pages_with_2mib_memory() {
        let result = Config::builder(2, 2).guest("Cargo.toml".into()).build();
        assert!(matches!(result, Err(Error::TooSmallForHugePages)));
    }

    #[test]
    fn builder_rejects_no_guests() {
        let result = Config::builder(4, 2).build();
        assert!(matches!(result, Err(Error::NoGuests)));
    }

    #[test]
    fn builder_accepts_valid_config() {
        let config = Config::builder(4, 2)
            .guest("Cargo.toml".into())
            .shared_file("primer.txt".into())
            .build()
            .expect("valid config");
        assert_eq!(config.memory_size, 4 * 1024 * 1024);
        assert_eq!(config.page_size, PageSize::HugePage2MiB);
        assert_eq!(config.guests.len(), 1);
        assert_eq!(config.shared_files, vec!["primer.txt".to_string()]);
    }
}
