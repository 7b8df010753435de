//! The virtual CPU: a thin wrapper over `kvm_ioctls::VcpuFd` exposing the
//! single blocking `step()` operation described in spec.md §4.3.

use kvm_bindings::kvm_regs;
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};

/// Initial stack pointer for every guest (spec.md §9(b): `1<<19`, not
/// `1<<21` — matches the more complete of the two variants found upstream).
const BOOT_STACK_POINTER: u64 = 1 << 19;

const X86_CR0_PE: u64 = 1 << 0;
const X86_CR0_PG: u64 = 1 << 31;
const X86_CR4_PAE: u64 = 1 << 5;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

const CODE_SELECTOR: u16 = 0x8;
const DATA_SELECTOR: u16 = 0x10;
/// Execute/read, accessed.
const CODE_SEGMENT_TYPE: u8 = 0xb;
/// Read/write, accessed.
const DATA_SEGMENT_TYPE: u8 = 0x3;

#[derive(Debug)]
pub enum Error {
    /// Error issuing an ioctl to KVM.
    KvmIoctl(kvm_ioctls::Error),
}

impl From<kvm_ioctls::Error> for Error {
    fn from(e: kvm_ioctls::Error) -> Self {
        Error::KvmIoctl(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct Vcpu {
    vcpu_fd: VcpuFd,
}

impl Vcpu {
    /// Create vCPU 0 for `vm_fd`, program its initial general-purpose
    /// registers (`rflags=2, rip=0, rsp=1<<19`, spec.md §4.3) and its
    /// long-mode special registers (`CR3=phys(PML4), CR4|=PAE, CR0|=PE|PG,
    /// EFER|=LME|LMA`, plus a flat 64-bit code segment with data selectors
    /// derived from it, spec.md §4.2) against the page tables already built
    /// in `pml4_addr`'s [`crate::memory::GuestMemory`].
    pub fn new(vm_fd: &VmFd, pml4_addr: u64) -> Result<Self> {
        let vcpu_fd = vm_fd.create_vcpu(0)?;

        let regs = kvm_regs {
            rflags: 0x2,
            rip: 0,
            rsp: BOOT_STACK_POINTER,
            ..Default::default()
        };
        vcpu_fd.set_regs(&regs)?;

        let mut sregs = vcpu_fd.get_sregs()?;

        sregs.cr3 = pml4_addr;
        sregs.cr4 |= X86_CR4_PAE;
        sregs.cr0 |= X86_CR0_PE | X86_CR0_PG;
        sregs.efer |= EFER_LME | EFER_LMA;

        // No GDT is written to guest memory: KVM lets the hidden descriptor
        // fields below stand in for it directly, so `gdt.limit` stays 0.
        sregs.cs.l = 1;
        sregs.cs.db = 0;
        sregs.cs.s = 1;
        sregs.cs.present = 1;
        sregs.cs.dpl = 0;
        sregs.cs.type_ = CODE_SEGMENT_TYPE;
        sregs.cs.selector = CODE_SELECTOR;

        for data_seg in [
            &mut sregs.ds,
            &mut sregs.es,
            &mut sregs.fs,
            &mut sregs.gs,
            &mut sregs.ss,
        ] {
            data_seg.s = 1;
            data_seg.present = 1;
            data_seg.dpl = 0;
            data_seg.type_ = DATA_SEGMENT_TYPE;
            data_seg.selector = DATA_SELECTOR;
        }

        vcpu_fd.set_sregs(&sregs)?;

        Ok(Vcpu { vcpu_fd })
    }

    /// Block until the guest next exits, returning the raw `kvm_ioctls`
    /// classification. Resumable: calling this again continues the guest
    /// from where it stopped (`KVM_RUN` on the same vCPU fd). Callers must
    /// service any `IoIn` reply slot before the borrowed `VcpuExit` is
    /// dropped, i.e. before calling `step()` again.
    pub fn step(&mut self) -> Result<VcpuExit> {
        Ok(self.vcpu_fd.run()?)
    }
}
