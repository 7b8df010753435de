//! Per-guest exit loop: resumes the vCPU, classifies the exit, and routes
//! it to the console or the file-service protocol (spec.md §4.5).

use std::sync::Mutex;

use kvm_ioctls::VcpuExit;

use crate::cpu::Vcpu;
use crate::devices::console::{Console, CONSOLE_PORT};
use crate::devices::file_table::{FileTable, SharedFiles};
use crate::file_protocol::{Access, FileProtocol, ProtocolCtx, FILE_PORT};
use crate::memory::GuestMemory;

#[derive(Debug)]
pub enum Error {
    Vcpu(crate::cpu::Error),
    Console(crate::devices::console::Error),
    Protocol(crate::file_protocol::Error),
    /// The platform reported `VcpuExit::InternalError`.
    Internal,
    /// An I/O exit on a port neither the console nor the file service owns.
    UnknownPort(u16),
    /// An exit reason this hypervisor does not emulate anything for.
    UnhandledExit,
}

impl From<crate::cpu::Error> for Error {
    fn from(e: crate::cpu::Error) -> Self {
        Error::Vcpu(e)
    }
}

impl From<crate::devices::console::Error> for Error {
    fn from(e: crate::devices::console::Error) -> Self {
        Error::Console(e)
    }
}

impl From<crate::file_protocol::Error> for Error {
    fn from(e: crate::file_protocol::Error) -> Self {
        Error::Protocol(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Everything one guest's exit loop needs for its lifetime.
pub struct IoDispatcher<'a> {
    pub guest_id: u32,
    pub vcpu: Vcpu,
    pub memory: GuestMemory,
    pub console: Console,
    pub files: FileTable,
    pub protocol: FileProtocol,
    pub shared: &'a SharedFiles,
    pub open_lock: &'a Mutex<()>,
}

impl<'a> IoDispatcher<'a> {
    /// Run until the guest halts, shuts down, or hits an error. Always
    /// closes every descriptor still open in the FileTable before returning,
    /// per spec.md §5's resource-discipline requirement.
    pub fn run(&mut self) -> Result<()> {
        let result = self.run_inner();
        self.close_open_files();
        result
    }

    fn run_inner(&mut self) -> Result<()> {
        loop {
            match self.vcpu.step()? {
                VcpuExit::Hlt => {
                    println!("guest {}: halted", self.guest_id);
                    return Ok(());
                }
                VcpuExit::Shutdown => {
                    println!("guest {}: shutdown", self.guest_id);
                    return Ok(());
                }
                VcpuExit::InternalError => {
                    eprintln!("guest {}: internal platform error", self.guest_id);
                    return Err(Error::Internal);
                }
                VcpuExit::IoOut(port, data) => self.dispatch_out(port, data)?,
                VcpuExit::IoIn(port, data) => self.dispatch_in(port, data)?,
                other => {
                    eprintln!("guest {}: unhandled exit: {:?}", self.guest_id, other);
                    return Err(Error::UnhandledExit);
                }
            }
        }
    }

    fn dispatch_out(&mut self, port: u16, data: &[u8]) -> Result<()> {
        match port {
            CONSOLE_PORT => {
                if data.len() != 1 {
                    eprintln!("guest {}: console OUT with width {}", self.guest_id, data.len());
                    return Err(Error::UnknownPort(port));
                }
                self.console.write_byte(data[0])?;
                Ok(())
            }
            FILE_PORT => {
                let access = match data.len() {
                    4 => Access::Out32(u32::from_le_bytes([data[0], data[1], data[2], data[3]])),
                    1 => Access::Out8(data[0]),
                    _ => {
                        eprintln!("guest {}: file-protocol OUT with width {}", self.guest_id, data.len());
                        return Err(Error::Protocol(crate::file_protocol::Error::ProtocolViolation(
                            "unsupported width",
                            self.protocol.cursor(),
                        )));
                    }
                };
                self.advance_protocol(access)?;
                Ok(())
            }
            other => {
                eprintln!("guest {}: OUT to unhandled port {:#x}", self.guest_id, other);
                Err(Error::UnknownPort(other))
            }
        }
    }

    fn dispatch_in(&mut self, port: u16, data: &mut [u8]) -> Result<()> {
        match port {
            CONSOLE_PORT => {
                if data.len() != 1 {
                    eprintln!("guest {}: console IN with width {}", self.guest_id, data.len());
                    return Err(Error::UnknownPort(port));
                }
                data[0] = self.console.read_byte()?;
                Ok(())
            }
            FILE_PORT => {
                if data.len() != 4 {
                    eprintln!("guest {}: file-protocol IN with width {}", self.guest_id, data.len());
                    return Err(Error::Protocol(crate::file_protocol::Error::ProtocolViolation(
                        "unsupported width",
                        self.protocol.cursor(),
                    )));
                }
                if let Some(reply) = self.advance_protocol(Access::In32)? {
                    data.copy_from_slice(&reply.to_le_bytes());
                }
                Ok(())
            }
            other => {
                eprintln!("guest {}: IN from unhandled port {:#x}", self.guest_id, other);
                Err(Error::UnknownPort(other))
            }
        }
    }

    fn advance_protocol(&mut self, access: Access) -> Result<Option<u32>> {
        let mut ctx = ProtocolCtx {
            table: &mut self.files,
            memory: &self.memory,
            shared: self.shared,
            base_dir: std::path::Path::new("."),
            guest_id: self.guest_id,
            open_lock: self.open_lock,
        };
        Ok(self.protocol.advance(&mut ctx, access)?)
    }

    fn close_open_files(&mut self) {
        for fd in self.files.open_fds() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
