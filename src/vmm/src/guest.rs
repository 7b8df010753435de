//! Guest construction: memory, vCPU, console, and raw image loading
//! (spec.md §3 "Guest", §4.6).

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;

use kvm_ioctls::VmFd;

use crate::config::PageSize;
use crate::cpu::Vcpu;
use crate::devices::console::Console;
use crate::devices::file_table::{FileTable, SharedFiles};
use crate::file_protocol::FileProtocol;
use crate::io_dispatcher::IoDispatcher;
use crate::memory::GuestMemory;
use crate::{Error, HostVmm, Result};

const LOAD_CHUNK: usize = 1024;

/// A constructed, not-yet-running guest. Everything it owns is handed to an
/// [`IoDispatcher`] once its supervisor is ready to spawn its thread.
pub struct Guest {
    pub id: u32,
    /// Kept alive for the guest's lifetime: dropping it tears down the
    /// kernel-side VM that `memory` and `vcpu` are backed by.
    #[allow(dead_code)]
    vm_fd: VmFd,
    memory: GuestMemory,
    vcpu: Vcpu,
    console: Console,
}

impl Guest {
    /// Build guest `id`: a fresh VM, its memory and page tables, its vCPU
    /// with boot registers programmed, its console pty, and its loaded
    /// image. `image` is read in 1 KiB chunks starting at the memory's
    /// declared load address, per spec.md §4.6.
    pub fn new(vmm: &HostVmm, id: u32, memory_size: u64, page_size: PageSize, image: &Path) -> Result<Self> {
        let vm_fd = vmm.create_vm()?;
        let memory = GuestMemory::new(&vm_fd, memory_size, page_size).map_err(Error::Memory)?;
        let vcpu = Vcpu::new(&vm_fd, memory.pml4_addr()).map_err(Error::Vcpu)?;
        let console = Console::new().map_err(Error::Console)?;

        load_image(&memory, image)?;

        Ok(Guest { id, vm_fd, memory, vcpu, console })
    }

    /// The pty slave end, handed to the outside world per spec.md §3.
    pub fn console_slave_fd(&self) -> std::os::unix::io::RawFd {
        self.console.slave_fd()
    }

    /// Consume this guest into the dispatcher that will run it.
    pub fn into_dispatcher<'a>(self, shared: &'a SharedFiles, open_lock: &'a Mutex<()>) -> IoDispatcher<'a> {
        IoDispatcher {
            guest_id: self.id,
            vcpu: self.vcpu,
            memory: self.memory,
            console: self.console,
            files: FileTable::new(),
            protocol: FileProtocol::new(),
            shared,
            open_lock,
        }
    }
}

fn load_image(memory: &GuestMemory, path: &Path) -> Result<()> {
    let mut file = File::open(path).map_err(Error::ImageLoad)?;
    let limit = memory.size();
    let mut addr = memory.load_addr();
    let mut buf = [0u8; LOAD_CHUNK];

    loop {
        let n = file.read(&mut buf).map_err(Error::ImageLoad)?;
        if n == 0 {
            return Ok(());
        }
        if addr + n as u64 > limit {
            return Err(Error::ImageTooLarge(path.to_path_buf()));
        }
        memory.write(addr, &buf[..n]).map_err(Error::Memory)?;
        addr += n as u64;
    }
}
