//! The file-service state machine (spec.md §4.4): parses the guest's wire
//! protocol on port 0x278 across successive I/O exits and drives
//! `FileTable` + the host filesystem in response.

use std::path::Path;
use std::sync::Mutex;

use crate::devices::file_table::{self, FileTable, SharedFiles};
use crate::memory::GuestMemory;

/// The one port the file-service protocol answers to (spec.md §6).
pub const FILE_PORT: u16 = 0x278;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Open = 1,
    Close = 2,
    Read = 3,
    Write = 4,
}

impl Opcode {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Opcode::Open),
            2 => Some(Opcode::Close),
            3 => Some(Opcode::Read),
            4 => Some(Opcode::Write),
            _ => None,
        }
    }
}

/// Which state of the protocol will consume the next I/O exit for a guest
/// (spec.md §3 "Protocol cursor", §4.4's transition table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Idle,
    ReadName,
    AwaitFlags,
    AwaitMode,
    ReturnFd,
    AwaitFd,
    AwaitAddrLow,
    AwaitAddrHigh,
    AwaitSizeLow,
    AwaitSizeHigh,
    AwaitReadStatus,
    AwaitWriteStatus,
    AwaitCloseStatus,
}

/// An access the guest made to port 0x278 during one I/O exit.
pub enum Access {
    Out32(u32),
    Out8(u8),
    In32,
}

#[derive(Debug)]
pub enum Error {
    /// Wrong direction/width for the current cursor (spec.md §4.4).
    ProtocolViolation(&'static str, Cursor),
    /// OUT 32 at `Idle` named an opcode outside `{OPEN, CLOSE, READ, WRITE}`.
    UnknownOpcode(u32),
    /// Propagated from `FileTable`/OPEN resolution.
    FileTable(file_table::Error),
}

impl From<file_table::Error> for Error {
    fn from(e: file_table::Error) -> Self {
        Error::FileTable(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Everything the protocol needs to service one guest's requests, borrowed
/// for the duration of a single `advance` call.
pub struct ProtocolCtx<'a> {
    pub table: &'a mut FileTable,
    pub memory: &'a GuestMemory,
    pub shared: &'a SharedFiles,
    pub base_dir: &'a Path,
    pub guest_id: u32,
    /// Serializes the non-atomic OPEN resolution steps across guest threads
    /// (spec.md §4.4 "Concurrency note").
    pub open_lock: &'a Mutex<()>,
}

/// Per-guest file-service state machine.
#[derive(Debug)]
pub struct FileProtocol {
    cursor: Cursor,
    lock: u32,
    current: Option<usize>,
}

impl Default for FileProtocol {
    fn default() -> Self {
        FileProtocol {
            cursor: Cursor::Idle,
            lock: 0,
            current: None,
        }
    }
}

impl FileProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Consume one I/O exit, returning `Some(reply)` if `access` was an
    /// `In32` read that must be written back to the reply slot.
    pub fn advance(&mut self, ctx: &mut ProtocolCtx, access: Access) -> Result<Option<u32>> {
        match (self.cursor, access) {
            (Cursor::Idle, Access::Out32(data)) => self.start_operation(ctx, data),
            (Cursor::ReadName, Access::Out8(byte)) => self.read_name_byte(ctx, byte),
            (Cursor::AwaitFlags, Access::Out32(data)) => {
                self.current_mut(ctx)?.flags = data as i32;
                self.cursor = Cursor::AwaitMode;
                Ok(None)
            }
            (Cursor::AwaitMode, Access::Out32(data)) => self.finish_open(ctx, data),
            (Cursor::ReturnFd, Access::In32) => self.return_fd(ctx),
            (Cursor::AwaitFd, Access::Out32(data)) => self.bind_fd(ctx, data),
            (Cursor::AwaitAddrLow, Access::Out32(data)) => {
                self.current_mut(ctx)?.pending_addr = data as u64;
                self.cursor = Cursor::AwaitAddrHigh;
                Ok(None)
            }
            (Cursor::AwaitAddrHigh, Access::Out32(data)) => {
                let rec = self.current_mut(ctx)?;
                rec.pending_addr |= (data as u64) << 32;
                self.cursor = Cursor::AwaitSizeLow;
                Ok(None)
            }
            (Cursor::AwaitSizeLow, Access::Out32(data)) => {
                self.current_mut(ctx)?.pending_size = data as u64;
                self.cursor = Cursor::AwaitSizeHigh;
                Ok(None)
            }
            (Cursor::AwaitSizeHigh, Access::Out32(data)) => {
                let rec = self.current_mut(ctx)?;
                rec.pending_size |= (data as u64) << 32;
                self.cursor = if self.lock == Opcode::Read as u32 {
                    Cursor::AwaitReadStatus
                } else {
                    Cursor::AwaitWriteStatus
                };
                Ok(None)
            }
            (Cursor::AwaitReadStatus, Access::In32) => self.do_read(ctx).map(Some),
            (Cursor::AwaitWriteStatus, Access::In32) => self.do_write(ctx).map(Some),
            (Cursor::AwaitCloseStatus, Access::In32) => self.do_close(ctx).map(Some),
            (cursor, access) => Err(Error::ProtocolViolation(access.kind(), cursor)),
        }
    }

    fn current_mut<'a>(
        &self,
        ctx: &'a mut ProtocolCtx,
    ) -> Result<&'a mut file_table::FileRecord> {
        let idx = self.current.expect("current set before this state is reachable");
        Ok(ctx.table.get_mut(idx).expect("current index stays valid for this operation"))
    }

    fn start_operation(&mut self, ctx: &mut ProtocolCtx, data: u32) -> Result<Option<u32>> {
        let opcode = Opcode::from_u32(data).ok_or(Error::UnknownOpcode(data))?;
        self.lock = data;

        if opcode == Opcode::Open {
            let idx = ctx.table.insert_new();
            self.current = Some(idx);
            self.cursor = Cursor::ReadName;
        } else {
            self.cursor = Cursor::AwaitFd;
        }
        Ok(None)
    }

    fn read_name_byte(&mut self, ctx: &mut ProtocolCtx, byte: u8) -> Result<Option<u32>> {
        self.current_mut(ctx)?.push_name_byte(byte)?;
        if byte == 0 {
            self.cursor = Cursor::AwaitFlags;
        }
        Ok(None)
    }

    fn finish_open(&mut self, ctx: &mut ProtocolCtx, mode: u32) -> Result<Option<u32>> {
        let idx = self.current.expect("set in start_operation for OPEN");
        let (name, flags) = {
            let rec = ctx.table.get_mut(idx).expect("current index valid");
            rec.mode = mode;
            let name = rec.name_str()?;
            (name, rec.flags)
        };

        let host_fd = {
            let _guard = ctx.open_lock.lock().unwrap();
            file_table::resolve_open(ctx.base_dir, ctx.guest_id, &name, flags, mode, ctx.shared)
        };

        let fd = match host_fd {
            Ok(fd) => fd,
            Err(_) => -1,
        };
        ctx.table.get_mut(idx).expect("current index valid").host_fd = fd;

        self.cursor = Cursor::ReturnFd;
        Ok(None)
    }

    fn return_fd(&mut self, ctx: &mut ProtocolCtx) -> Result<Option<u32>> {
        let fd = self.current_mut(ctx)?.host_fd;
        self.cursor = Cursor::Idle;
        self.lock = 0;
        self.current = None;
        Ok(Some(fd as u32))
    }

    fn bind_fd(&mut self, ctx: &mut ProtocolCtx, data: u32) -> Result<Option<u32>> {
        let idx = ctx
            .table
            .find_by_fd(data as i32)
            .ok_or(Error::FileTable(file_table::Error::UnknownFd(data as i32)))?;
        self.current = Some(idx);

        self.cursor = if self.lock == Opcode::Close as u32 {
            Cursor::AwaitCloseStatus
        } else {
            Cursor::AwaitAddrLow
        };
        Ok(None)
    }

    fn do_read(&mut self, ctx: &mut ProtocolCtx) -> Result<u32> {
        let idx = self.current.expect("bound by AwaitFd");
        let (fd, addr, size) = {
            let rec = ctx.table.get(idx).expect("current index valid");
            (rec.host_fd, rec.pending_addr, rec.pending_size)
        };

        let n = if size == 0 {
            0
        } else {
            // Safety: `translate` is valid for the guest's declared memory
            // size (spec.md §8); a `None` here means the guest named an
            // address outside its memory, which we treat as a protocol bug
            // rather than a host I/O error.
            let ptr = unsafe { ctx.memory.translate(addr) }
                .ok_or(Error::ProtocolViolation("unmapped guest address", Cursor::AwaitReadStatus))?;
            let ret = unsafe { libc::read(fd, ptr as *mut _, size as usize) };
            if ret < 0 {
                -1i32
            } else {
                ret as i32
            }
        };

        self.finish_transfer();
        Ok(n as u32)
    }

    fn do_write(&mut self, ctx: &mut ProtocolCtx) -> Result<u32> {
        let idx = self.current.expect("bound by AwaitFd");
        let (fd, addr, size) = {
            let rec = ctx.table.get(idx).expect("current index valid");
            (rec.host_fd, rec.pending_addr, rec.pending_size)
        };

        let n = if size == 0 {
            0
        } else {
            let ptr = unsafe { ctx.memory.translate(addr) }
                .ok_or(Error::ProtocolViolation("unmapped guest address", Cursor::AwaitWriteStatus))?;
            let ret = unsafe { libc::write(fd, ptr as *const _, size as usize) };
            if ret < 0 {
                -1i32
            } else {
                ret as i32
            }
        };

        self.finish_transfer();
        Ok(n as u32)
    }

    fn do_close(&mut self, ctx: &mut ProtocolCtx) -> Result<u32> {
        let idx = self.current.expect("bound by AwaitFd");
        let fd = ctx.table.get(idx).expect("current index valid").host_fd;
        let status = unsafe { libc::close(fd) };
        ctx.table.remove(idx);

        self.finish_transfer();
        Ok(status as u32)
    }

    fn finish_transfer(&mut self) {
        self.cursor = Cursor::Idle;
        self.lock = 0;
        self.current = None;
    }
}

impl Access {
    fn kind(&self) -> &'static str {
        match self {
            Access::Out32(_) => "OUT 32",
            Access::Out8(_) => "OUT 8",
            Access::In32 => "IN 32",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> GuestMemory {
        // `GuestMemory::new` needs a real VmFd to register the KVM memory
        // slot, which isn't available outside a `/dev/kvm`-backed test; the
        // tests below exercise the protocol state machine and never
        // translate an address, so a small real-but-unregistered instance is
        // enough. Tests that need real translation live in `memory.rs`.
        GuestMemory::for_test(4 * crate::config::HUGE_PAGE_SIZE)
    }

    struct Harness {
        table: FileTable,
        shared: SharedFiles,
        lock: Mutex<()>,
        dir: std::path::PathBuf,
    }

    impl Harness {
        fn new(shared_names: Vec<String>) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "multivmm-proto-test-{}-{}",
                std::process::id(),
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_nanos()
            ));
            std::fs::create_dir_all(&dir).unwrap();
            Harness {
                table: FileTable::new(),
                shared: SharedFiles::new(shared_names),
                lock: Mutex::new(()),
                dir,
            }
        }

        fn ctx<'a>(&'a mut self, memory: &'a GuestMemory) -> ProtocolCtx<'a> {
            ProtocolCtx {
                table: &mut self.table,
                memory,
                shared: &self.shared,
                base_dir: &self.dir,
                guest_id: 0,
                open_lock: &self.lock,
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[test]
    fn open_sequence_reaches_idle_with_new_record() {
        let mem = memory();
        let mut harness = Harness::new(vec![]);
        let mut proto = FileProtocol::new();

        {
            let mut ctx = harness.ctx(&mem);
            assert_eq!(proto.advance(&mut ctx, Access::Out32(1)).unwrap(), None); // OPEN
            assert_eq!(proto.cursor(), Cursor::ReadName);

            for b in b"a\0" {
                proto.advance(&mut ctx, Access::Out8(*b)).unwrap();
            }
            assert_eq!(proto.cursor(), Cursor::AwaitFlags);

            proto.advance(&mut ctx, Access::Out32(0)).unwrap(); // flags
            assert_eq!(proto.cursor(), Cursor::AwaitMode);

            proto.advance(&mut ctx, Access::Out32(0)).unwrap(); // mode
            assert_eq!(proto.cursor(), Cursor::ReturnFd);

            let fd = proto.advance(&mut ctx, Access::In32).unwrap();
            assert!(fd.is_some());
            assert_eq!(proto.cursor(), Cursor::Idle);
        }

        assert_eq!(harness.table.len(), 1);
    }

    #[test]
    fn read_on_unknown_descriptor_is_a_protocol_violation() {
        let mem = memory();
        let mut harness = Harness::new(vec![]);
        let mut proto = FileProtocol::new();
        let mut ctx = harness.ctx(&mem);

        proto.advance(&mut ctx, Access::Out32(Opcode::Read as u32)).unwrap();
        assert_eq!(proto.cursor(), Cursor::AwaitFd);

        let err = proto.advance(&mut ctx, Access::Out32(9999)).unwrap_err();
        assert!(matches!(err, Error::FileTable(file_table::Error::UnknownFd(9999))));
    }

    #[test]
    fn wrong_width_at_a_state_is_a_protocol_violation() {
        let mem = memory();
        let mut harness = Harness::new(vec![]);
        let mut proto = FileProtocol::new();
        let mut ctx = harness.ctx(&mem);

        // Idle expects OUT 32, not OUT 8.
        let err = proto.advance(&mut ctx, Access::Out8(1)).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation("OUT 8", Cursor::Idle)));
    }

    #[test]
    fn close_removes_the_record_and_returns_to_idle() {
        let mem = memory();
        let mut harness = Harness::new(vec![]);
        let mut proto = FileProtocol::new();

        let idx = harness.table.insert_new();
        harness.table.get_mut(idx).unwrap().host_fd = -1;

        let mut ctx = harness.ctx(&mem);
        proto.advance(&mut ctx, Access::Out32(Opcode::Close as u32)).unwrap();
        proto.advance(&mut ctx, Access::Out32(-1i32 as u32)).unwrap();
        assert_eq!(proto.cursor(), Cursor::AwaitCloseStatus);

        proto.advance(&mut ctx, Access::In32).unwrap();
        assert_eq!(proto.cursor(), Cursor::Idle);
        assert!(harness.table.is_empty());
    }

    #[test]
    fn open_write_close_round_trips_through_advance() {
        let mem = memory();
        let mut harness = Harness::new(vec![]);
        let mut proto = FileProtocol::new();

        let payload = b"hello";
        let gva = mem.load_addr();
        unsafe {
            let ptr = mem.translate(gva).expect("mapped");
            std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr, payload.len());
        }

        let fd = {
            let mut ctx = harness.ctx(&mem);
            assert_eq!(proto.advance(&mut ctx, Access::Out32(Opcode::Open as u32)).unwrap(), None);
            assert_eq!(proto.cursor(), Cursor::ReadName);
            for b in b"out.txt\0" {
                proto.advance(&mut ctx, Access::Out8(*b)).unwrap();
            }
            assert_eq!(proto.cursor(), Cursor::AwaitFlags);

            let flags = (libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC) as u32;
            proto.advance(&mut ctx, Access::Out32(flags)).unwrap();
            assert_eq!(proto.cursor(), Cursor::AwaitMode);

            proto.advance(&mut ctx, Access::Out32(0o644)).unwrap();
            assert_eq!(proto.cursor(), Cursor::ReturnFd);

            let fd = proto.advance(&mut ctx, Access::In32).unwrap().expect("fd reply");
            assert_eq!(proto.cursor(), Cursor::Idle);
            fd
        };
        assert!((fd as i32) >= 0, "open must return a valid descriptor");

        {
            let mut ctx = harness.ctx(&mem);
            proto.advance(&mut ctx, Access::Out32(Opcode::Write as u32)).unwrap();
            assert_eq!(proto.cursor(), Cursor::AwaitFd);

            proto.advance(&mut ctx, Access::Out32(fd)).unwrap();
            assert_eq!(proto.cursor(), Cursor::AwaitAddrLow);

            proto.advance(&mut ctx, Access::Out32(gva as u32)).unwrap();
            proto.advance(&mut ctx, Access::Out32((gva >> 32) as u32)).unwrap();
            assert_eq!(proto.cursor(), Cursor::AwaitSizeLow);

            proto.advance(&mut ctx, Access::Out32(payload.len() as u32)).unwrap();
            proto.advance(&mut ctx, Access::Out32(0)).unwrap();
            assert_eq!(proto.cursor(), Cursor::AwaitWriteStatus);

            let written = proto.advance(&mut ctx, Access::In32).unwrap().expect("write reply");
            assert_eq!(written as usize, payload.len());
            assert_eq!(proto.cursor(), Cursor::Idle);
        }

        {
            let mut ctx = harness.ctx(&mem);
            proto.advance(&mut ctx, Access::Out32(Opcode::Close as u32)).unwrap();
            proto.advance(&mut ctx, Access::Out32(fd)).unwrap();
            assert_eq!(proto.cursor(), Cursor::AwaitCloseStatus);

            let status = proto.advance(&mut ctx, Access::In32).unwrap().expect("close reply");
            assert_eq!(status, 0);
            assert_eq!(proto.cursor(), Cursor::Idle);
        }
        assert!(harness.table.is_empty());

        let on_disk = std::fs::read(harness.dir.join("vm0_out.txt")).unwrap();
        assert_eq!(on_disk, payload);
    }
}
