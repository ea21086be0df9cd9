//! Memory management: physical frames, page tables, user address spaces,
//! and copy-on-write fault resolution.

pub mod address_space;
pub mod fault;
pub mod paging;
pub mod phys;

pub use address_space::{AddressSpace, MapFlags, MmapRegion, ProtFlags};
pub use paging::USER_SPACE_END;
pub use phys::{phys_to_virt, PAGE_SIZE};

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::KernelError;

/// Root of the kernel address space. Kernel tasks run on it directly and
/// every user root aliases its upper half.
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

pub fn kernel_root() -> u64 {
    KERNEL_ROOT.load(Ordering::Acquire)
}

pub fn set_kernel_root(root: u64) {
    KERNEL_ROOT.store(root, Ordering::Release);
}

/// Bring up the memory subsystem on the boot processor: record the active
/// kernel root, then hand the frame allocator the bootable region.
pub fn init(phys_base: u64, phys_len: u64, phys_offset: u64) -> Result<(), KernelError> {
    set_kernel_root(crate::arch::current_root());
    phys::init(phys_base, phys_len, phys_offset);
    Ok(())
}
