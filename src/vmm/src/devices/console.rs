//! Console port 0xE9: a byte-oriented pseudo-terminal (spec.md §4.5, §6).

use std::io;
use std::os::unix::io::RawFd;

/// The one port the console answers to (spec.md §6).
pub const CONSOLE_PORT: u16 = 0xE9;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to allocate a pseudo-terminal: {0}")]
    PtyAlloc(io::Error),
    #[error("console io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A guest's console: a pty pair, with the master end read/written by the
/// host on every 0xE9 exit and the slave end handed to the outside (e.g.
/// attached to a terminal emulator by the CLI's caller).
pub struct Console {
    master: RawFd,
    slave: RawFd,
}

impl Console {
    /// Allocate a new pty pair. Per spec.md §9(c), a negative return from
    /// the allocation call is the only failure signal — the source's
    /// inverted check is not replicated here.
    pub fn new() -> Result<Self> {
        let mut master: RawFd = -1;
        let mut slave: RawFd = -1;
        // Safety: `openpty` fills `master`/`slave` with valid, owned fds on
        // success; we pass null for name/termios/winsize, matching the
        // original's unconditional pty allocation.
        let ret = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(Error::PtyAlloc(io::Error::last_os_error()));
        }

        Ok(Console { master, slave })
    }

    /// The slave-side fd, handed to the outside world (e.g. to be exposed
    /// as a terminal device for an operator to attach to).
    pub fn slave_fd(&self) -> RawFd {
        self.slave
    }

    /// Write one byte the guest sent via `OUT 0xE9` to the pty master.
    pub fn write_byte(&self, byte: u8) -> Result<()> {
        let buf = [byte];
        let n = unsafe { libc::write(self.master, buf.as_ptr() as *const _, 1) };
        if n < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Read one byte from the pty master to answer an `IN 0xE9` guest read.
    pub fn read_byte(&self) -> Result<u8> {
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(self.master, buf.as_mut_ptr() as *mut _, 1) };
        if n < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(buf[0])
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.master);
            libc::close(self.slave);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_through_the_slave_end() {
        let console = Console::new().expect("allocate pty");

        console.write_byte(b'H').unwrap();
        console.write_byte(b'i').unwrap();
        console.write_byte(b'\n').unwrap();

        let mut buf = [0u8; 3];
        let n = unsafe { libc::read(console.slave_fd(), buf.as_mut_ptr() as *mut _, buf.len()) };
        assert_eq!(n, 3);
        assert_eq!(&buf, b"Hi\n");
    }

    #[test]
    fn host_can_read_bytes_the_slave_side_wrote() {
        let console = Console::new().expect("allocate pty");

        let data = b"ok\n";
        let n = unsafe { libc::write(console.slave_fd(), data.as_ptr() as *const _, data.len()) };
        assert_eq!(n as usize, data.len());

        assert_eq!(console.read_byte().unwrap(), b'o');
        assert_eq!(console.read_byte().unwrap(), b'k');
        assert_eq!(console.read_byte().unwrap(), b'\n');
    }
}
