//! Guest physical memory and the long-mode (4-level) page tables that back
//! it. See spec.md §4.2.

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemory as _, GuestMemoryMmap};

use crate::config::{PageSize, HUGE_PAGE_SIZE};

const PML4_ADDR: u64 = 0x0000;
const PDPT_ADDR: u64 = 0x1000;
const PD_ADDR: u64 = 0x2000;
/// First 4 KiB page table in small-page mode.
const PT_BASE_ADDR: u64 = 0x3000;

const PDE64_PRESENT: u64 = 1 << 0;
const PDE64_RW: u64 = 1 << 1;
const PDE64_USER: u64 = 1 << 2;
const PDE64_PS: u64 = 1 << 7;
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

const PAGE_SIZE_4K: u64 = 0x1000;

#[derive(Debug)]
pub enum Error {
    /// Failed to operate on guest memory.
    GuestMemory(vm_memory::GuestMemoryError),
    /// Failed to build guest memory from the configured ranges.
    FromRanges(vm_memory::mmap::FromRangesError),
    /// Error issuing an ioctl to KVM.
    KvmIoctl(kvm_ioctls::Error),
}

impl From<vm_memory::GuestMemoryError> for Error {
    fn from(e: vm_memory::GuestMemoryError) -> Self {
        Error::GuestMemory(e)
    }
}

impl From<vm_memory::mmap::FromRangesError> for Error {
    fn from(e: vm_memory::mmap::FromRangesError) -> Self {
        Error::FromRanges(e)
    }
}

impl From<kvm_ioctls::Error> for Error {
    fn from(e: kvm_ioctls::Error) -> Self {
        Error::KvmIoctl(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A guest's physical memory: one host-mapped region registered with KVM as
/// slot 0, plus the long-mode page tables built inside it.
pub struct GuestMemory {
    mem: GuestMemoryMmap,
    /// Guest-physical address at which the loadable image begins.
    load_addr: u64,
}

impl GuestMemory {
    /// Allocate `size` bytes of guest-physical memory, register it with
    /// `vm_fd` as slot 0, and populate it with 4-level page tables for
    /// `page_size`. `size` must be a non-zero multiple of 2 MiB (enforced by
    /// [`crate::config::ConfigBuilder`]).
    pub fn new(vm_fd: &VmFd, size: u64, page_size: PageSize) -> Result<Self> {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size as usize)])?;
        let userspace_addr = mem.get_host_address(GuestAddress(0))? as u64;

        // Safety: the mmap'd region outlives the KVM memory slot registration
        // for the lifetime of this `GuestMemory`.
        unsafe {
            vm_fd.set_user_memory_region(kvm_userspace_memory_region {
                slot: 0,
                flags: 0,
                guest_phys_addr: 0,
                memory_size: size,
                userspace_addr,
            })?;
        }

        let load_addr = match page_size {
            PageSize::HugePage2MiB => Self::build_huge_pages(&mem, size)?,
            PageSize::SmallPage4KiB => Self::build_small_pages(&mem, size)?,
        };

        Ok(GuestMemory { mem, load_addr })
    }

    pub fn load_addr(&self) -> u64 {
        self.load_addr
    }

    /// Physical address of the PML4 this memory was built with, for
    /// programming `CR3` (spec.md §4.2).
    pub fn pml4_addr(&self) -> u64 {
        PML4_ADDR
    }

    pub fn size(&self) -> u64 {
        self.mem.last_addr().raw_value() + 1
    }

    /// Write `PML4[0]` and `PDPT[0]`, the only two entries ever populated:
    /// they flatten the first gigabyte into a single PD.
    fn write_root_entries(mem: &GuestMemoryMmap) -> Result<()> {
        mem.write_obj(PDPT_ADDR | PDE64_PRESENT | PDE64_RW | PDE64_USER, GuestAddress(PML4_ADDR))?;
        mem.write_obj(PD_ADDR | PDE64_PRESENT | PDE64_RW | PDE64_USER, GuestAddress(PDPT_ADDR))?;
        Ok(())
    }

    /// 2 MiB huge-page mode (spec.md §4.2): reserves the first 2 MiB huge
    /// page for PML4/PDPT/PD, then maps the remainder of memory 1:1 with
    /// `PS`-set PD entries.
    fn build_huge_pages(mem: &GuestMemoryMmap, size: u64) -> Result<u64> {
        Self::write_root_entries(mem)?;

        let first_page = ceil_to(3 * PAGE_SIZE_4K, HUGE_PAGE_SIZE);
        let entries = size / HUGE_PAGE_SIZE - 1;
        for i in 0..entries {
            let phys = first_page + i * HUGE_PAGE_SIZE;
            let entry = phys | PDE64_PRESENT | PDE64_RW | PDE64_USER | PDE64_PS;
            mem.write_obj(entry, GuestAddress(PD_ADDR + i * 8))?;
        }

        Ok(first_page)
    }

    /// 4 KiB mode (spec.md §4.2): one 4 KiB page table per 2 MiB PD entry,
    /// starting at 0x3000, filled with consecutive 4 KiB pages until memory
    /// is exhausted. The image load address is the first address beyond all
    /// page-table pages.
    fn build_small_pages(mem: &GuestMemoryMmap, size: u64) -> Result<u64> {
        Self::write_root_entries(mem)?;

        let pd_entries = size / HUGE_PAGE_SIZE;
        for i in 0..pd_entries {
            let pt_addr = PT_BASE_ADDR + i * PAGE_SIZE_4K;
            let entry = pt_addr | PDE64_PRESENT | PDE64_RW | PDE64_USER;
            mem.write_obj(entry, GuestAddress(PD_ADDR + i * 8))?;
        }

        let mut page_addr = PT_BASE_ADDR + pd_entries * PAGE_SIZE_4K;
        let load_addr = page_addr;
        'outer: for i in 0..pd_entries {
            let pt_addr = PT_BASE_ADDR + i * PAGE_SIZE_4K;
            for j in 0..512u64 {
                if page_addr > size {
                    break 'outer;
                }
                let entry = page_addr | PDE64_PRESENT | PDE64_RW | PDE64_USER;
                mem.write_obj(entry, GuestAddress(pt_addr + j * 8))?;
                page_addr += PAGE_SIZE_4K;
            }
        }

        Ok(load_addr)
    }

    /// Copy `data` into guest memory starting at `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.mem.write_slice(data, GuestAddress(addr))?;
        Ok(())
    }

    pub fn backing(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    /// A real, minimally-populated instance for tests elsewhere in the crate
    /// that need a `&GuestMemory` but never dereference a translated address
    /// (no `/dev/kvm` memory slot is registered).
    #[cfg(test)]
    pub(crate) fn for_test(size: u64) -> Self {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size as usize)]).unwrap();
        let load_addr = Self::build_huge_pages(&mem, size).unwrap();
        GuestMemory { mem, load_addr }
    }

    /// Walk PML4 → PDPT → PD → PT for `gva` and return the host pointer it
    /// resolves to, or `None` if any level is not present. Used only to
    /// resolve the guest buffer addresses named in file-protocol READ/WRITE
    /// requests (spec.md §4.2, §4.4).
    ///
    /// # Safety
    /// The returned pointer is valid only as long as `self` is alive and the
    /// guest does not concurrently unmap the backing region (it never does:
    /// guest memory is fixed-size for this hypervisor's lifetime).
    pub unsafe fn translate(&self, gva: u64) -> Option<*mut u8> {
        let pml4_idx = (gva >> 39) & 0x1ff;
        let pdpt_idx = (gva >> 30) & 0x1ff;
        let pd_idx = (gva >> 21) & 0x1ff;
        let pt_idx = (gva >> 12) & 0x1ff;

        let pml4e: u64 = self.mem.read_obj(GuestAddress(PML4_ADDR + pml4_idx * 8)).ok()?;
        if pml4e & PDE64_PRESENT == 0 {
            return None;
        }
        let pdpt_addr = pml4e & ADDR_MASK;

        let pdpte: u64 = self.mem.read_obj(GuestAddress(pdpt_addr + pdpt_idx * 8)).ok()?;
        if pdpte & PDE64_PRESENT == 0 {
            return None;
        }
        let pd_addr = pdpte & ADDR_MASK;

        let pde: u64 = self.mem.read_obj(GuestAddress(pd_addr + pd_idx * 8)).ok()?;
        if pde & PDE64_PRESENT == 0 {
            return None;
        }

        let phys = if pde & PDE64_PS != 0 {
            (pde & ADDR_MASK) + (gva & (HUGE_PAGE_SIZE - 1))
        } else {
            let pt_addr = pde & ADDR_MASK;
            let pte: u64 = self.mem.read_obj(GuestAddress(pt_addr + pt_idx * 8)).ok()?;
            if pte & PDE64_PRESENT == 0 {
                return None;
            }
            (pte & ADDR_MASK) + (gva & 0xfff)
        };

        self.mem.get_host_address(GuestAddress(phys)).ok()
    }
}

fn ceil_to(value: u64, multiple: u64) -> u64 {
    (value + multiple - 1) / multiple * multiple
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem(size: u64) -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size as usize)]).unwrap()
    }

    fn read_pte(m: &GuestMemoryMmap, addr: u64) -> u64 {
        m.read_obj(GuestAddress(addr)).unwrap()
    }

    #[test]
    fn huge_page_first_page_is_2mib() {
        let m = mem(4 * HUGE_PAGE_SIZE);
        let load_addr = GuestMemory::build_huge_pages(&m, 4 * HUGE_PAGE_SIZE).unwrap();
        assert_eq!(load_addr, HUGE_PAGE_SIZE);

        let pml4 = read_pte(&m, PML4_ADDR);
        assert_eq!(pml4 & ADDR_MASK, PDPT_ADDR);
        assert_eq!(pml4 & (PDE64_PRESENT | PDE64_RW | PDE64_USER), PDE64_PRESENT | PDE64_RW | PDE64_USER);

        // 3 PD entries cover memory beyond the reserved first huge page.
        let pd0 = read_pte(&m, PD_ADDR);
        assert_eq!(pd0 & ADDR_MASK, HUGE_PAGE_SIZE);
        assert_ne!(pd0 & PDE64_PS, 0);
        let pd1 = read_pte(&m, PD_ADDR + 8);
        assert_eq!(pd1 & ADDR_MASK, 2 * HUGE_PAGE_SIZE);
        let pd2 = read_pte(&m, PD_ADDR + 16);
        assert_eq!(pd2 & ADDR_MASK, 3 * HUGE_PAGE_SIZE);
    }

    #[test]
    fn small_page_last_pt_partially_filled() {
        // 3 * 2MiB of memory: exercises a last PT that is not fully populated.
        let size = 3 * HUGE_PAGE_SIZE + 4096;
        let m = mem(size);
        let load_addr = GuestMemory::build_small_pages(&m, size).unwrap();

        let pd_entries = size / HUGE_PAGE_SIZE;
        assert_eq!(load_addr, PT_BASE_ADDR + pd_entries * PAGE_SIZE_4K);

        let last_pt = PT_BASE_ADDR + (pd_entries - 1) * PAGE_SIZE_4K;
        // Only the entries up to `size` were written; far entries stay zero.
        let far_entry = read_pte(&m, last_pt + 511 * 8);
        assert_eq!(far_entry, 0);
    }

    #[test]
    fn translate_huge_page_round_trips() {
        let size = 4 * HUGE_PAGE_SIZE;
        let vm_mem = {
            let m = mem(size);
            GuestMemory::build_huge_pages(&m, size).unwrap();
            GuestMemory { mem: m, load_addr: HUGE_PAGE_SIZE }
        };

        let gva = HUGE_PAGE_SIZE + 0x1234;
        let host_ptr = unsafe { vm_mem.translate(gva) }.expect("mapped");
        unsafe {
            *host_ptr = 0x42;
        }
        let mut buf = [0u8; 1];
        vm_mem.mem.read_slice(&mut buf, GuestAddress(gva)).unwrap();
        assert_eq!(buf[0], 0x42);
    }

    #[test]
    fn translate_unmapped_address_is_none() {
        let size = 2 * HUGE_PAGE_SIZE;
        let vm_mem = {
            let m = mem(size);
            GuestMemory::build_huge_pages(&m, size).unwrap();
            GuestMemory { mem: m, load_addr: HUGE_PAGE_SIZE }
        };

        // Only PML4[0] is populated; this address lives in PML4[1].
        let far = 1u64 << 39;
        assert!(unsafe { vm_mem.translate(far) }.is_none());
    }
}
