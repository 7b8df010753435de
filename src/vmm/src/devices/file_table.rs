//! Per-guest open file records (spec.md §3 "File record") and the OPEN
//! resolution rule that gives guests isolated, copy-on-write views of
//! shared host files (spec.md §4.4 "OPEN resolution").

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::path::PathBuf;

/// Name bound from spec.md §3: at most 49 bytes plus the terminating NUL.
pub const MAX_NAME_LEN: usize = 49;
const COPY_CHUNK: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("file name exceeds the {MAX_NAME_LEN}-byte bound")]
    NameTooLong,
    #[error("unknown host descriptor {0}")]
    UnknownFd(i32),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("name contains an interior NUL")]
    InteriorNul,
}

pub type Result<T> = std::result::Result<T, Error>;

/// One open file, as described in spec.md §3. `next`/linked-list structure
/// from the original is replaced by `FileTable`'s `Vec`, per design note
/// "Linked FileTable".
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub host_fd: RawFd,
    pub flags: i32,
    pub mode: u32,
    /// Accumulates name bytes during OPEN's `ReadName` state; also used as
    /// the eventual record name.
    pub name: Vec<u8>,
    pub pending_addr: u64,
    pub pending_size: u64,
}

impl FileRecord {
    fn new() -> Self {
        FileRecord {
            host_fd: -1,
            flags: 0,
            mode: 0,
            name: Vec::new(),
            pending_addr: 0,
            pending_size: 0,
        }
    }

    pub fn protocol_cnt(&self) -> usize {
        self.name.len()
    }

    /// Append one `ReadName` byte. The buffer holds at most `MAX_NAME_LEN`
    /// content bytes plus their terminating NUL (spec.md §3: "≤49 bytes +
    /// NUL"), so the cap checked here is one past `MAX_NAME_LEN`.
    pub fn push_name_byte(&mut self, byte: u8) -> Result<()> {
        if self.protocol_cnt() >= MAX_NAME_LEN + 1 {
            return Err(Error::NameTooLong);
        }
        self.name.push(byte);
        Ok(())
    }

    /// Strip the single trailing NUL terminator `push_name_byte` always
    /// leaves in place. A `0` byte anywhere else in the buffer, or a missing
    /// terminator, is a genuine protocol violation.
    pub fn name_str(&self) -> Result<String> {
        match self.name.split_last() {
            Some((&0, content)) if !content.contains(&0) => {
                Ok(String::from_utf8_lossy(content).into_owned())
            }
            _ => Err(Error::InteriorNul),
        }
    }
}

/// Ordered list of a guest's open files, keyed by host descriptor (design
/// note "Linked FileTable": any small ordered container is acceptable; a
/// `Vec` with scan-and-swap_remove is simplest at this scale).
#[derive(Debug, Default)]
pub struct FileTable {
    records: Vec<FileRecord>,
}

impl FileTable {
    pub fn new() -> Self {
        FileTable::default()
    }

    /// Insert a freshly-constructed, still-incomplete record (OPEN just
    /// began) and return its index so the protocol cursor can address it as
    /// `current` through the remaining OPEN states.
    pub fn insert_new(&mut self) -> usize {
        self.records.push(FileRecord::new());
        self.records.len() - 1
    }

    pub fn get(&self, idx: usize) -> Option<&FileRecord> {
        self.records.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut FileRecord> {
        self.records.get_mut(idx)
    }

    /// Find the index of the record with guest-visible descriptor `fd`,
    /// consulted on AwaitFd (READ/WRITE/CLOSE).
    pub fn find_by_fd(&self, fd: i32) -> Option<usize> {
        self.records.iter().position(|r| r.host_fd == fd)
    }

    /// Remove and return the record at `idx` (CLOSE completion).
    pub fn remove(&mut self, idx: usize) -> FileRecord {
        self.records.swap_remove(idx)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Host descriptors for every record still open, e.g. for the cleanup
    /// path on guest exit (spec.md §5 "resource discipline").
    pub fn open_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.records.iter().map(|r| r.host_fd)
    }
}

/// Process-wide, write-once-before-any-guest-runs set of file names guests
/// may read directly from the host filesystem (spec.md §3 "SharedFiles
/// registry").
#[derive(Debug, Default, Clone)]
pub struct SharedFiles {
    names: Vec<String>,
}

impl SharedFiles {
    pub fn new(names: Vec<String>) -> Self {
        SharedFiles { names }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

fn wants_write(flags: i32) -> bool {
    let accmode = flags & libc::O_ACCMODE;
    accmode == libc::O_WRONLY
        || accmode == libc::O_RDWR
        || flags & libc::O_APPEND != 0
        || flags & libc::O_CREAT != 0
}

fn private_name(guest_id: u32, name: &str) -> String {
    format!("vm{guest_id}_{name}")
}

fn open_raw(path: &std::path::Path, flags: i32, mode: u32) -> io::Result<RawFd> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // Safety: `c_path` is a valid NUL-terminated string for the duration of
    // this call; the returned fd is owned by the caller.
    let fd = unsafe { libc::open(c_path.as_ptr(), flags, mode) };
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

/// Implements spec.md §4.4's four-step OPEN resolution. The caller must hold
/// a lock across this call (spec.md's concurrency note: the
/// exists/create/copy sequence below is not atomic). `base_dir` is the
/// current working directory in production (spec.md §6 "Persisted state");
/// tests pass an isolated scratch directory instead.
pub fn resolve_open(
    base_dir: &std::path::Path,
    guest_id: u32,
    name: &str,
    flags: i32,
    mode: u32,
    shared: &SharedFiles,
) -> Result<RawFd> {
    if name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong);
    }
    let private = base_dir.join(private_name(guest_id, name));
    let shared_path = base_dir.join(name);

    // Step 2: the private copy already exists — always use it.
    if private.exists() {
        return Ok(open_raw(&private, flags, mode)?);
    }

    // Step 3: shared, read-only access falls through to the host file
    // directly, with no private copy created.
    if shared.contains(name) && !wants_write(flags) {
        return Ok(open_raw(&shared_path, flags, mode)?);
    }

    // Step 4: a mutating open of a not-yet-materialized name first creates
    // the private copy (copying shared content into it if applicable), then
    // opens the private copy with the guest's requested flags.
    if flags & libc::O_CREAT != 0 {
        materialize_private(&private, &shared_path, name, shared)?;
        return Ok(open_raw(&private, flags, mode)?);
    }

    // Neither a private copy nor a shared source exists, and the guest did
    // not ask to create one: surface the host's own ENOENT.
    Ok(open_raw(&private, flags, mode)?)
}

fn materialize_private(
    private: &std::path::Path,
    shared_path: &std::path::Path,
    name: &str,
    shared: &SharedFiles,
) -> Result<()> {
    let mut dst = File::create(private)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        dst.set_permissions(std::fs::Permissions::from_mode(0o777))?;
    }

    if shared.contains(name) {
        let mut src = File::open(shared_path)?;
        let mut buf = [0u8; COPY_CHUNK];
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n])?;
        }
    }

    Ok(())
}
