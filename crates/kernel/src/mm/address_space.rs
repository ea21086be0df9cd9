//! Per-task user address spaces.
//!
//! An `AddressSpace` owns a page-table root sharing the kernel half, plus
//! the layout bookkeeping the syscalls mutate: program break, mmap cursor,
//! and the fixed-size memory-map region slots. Dropping the handle releases
//! every user frame reference and the table frames themselves.

use bitflags::bitflags;

use crate::config::MAX_MMAP_REGIONS;
use crate::error::KernelError;
use crate::mm::paging::{self, PteFlags};
use crate::mm::phys::{self, PAGE_SIZE};

/// Top of the user stack, one guard page below the user-half boundary.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// Address space reserved for the user stack, below [`USER_STACK_TOP`].
pub const USER_STACK_RESERVE: u64 = 16 * 1024 * 1024;

/// Initially mapped stack pages for a fresh user task.
pub const USER_STACK_INITIAL_PAGES: u64 = 8;

/// Lowest address of the stack reservation; the mmap cursor starts here
/// and grows downward.
pub const USER_MMAP_TOP: u64 = USER_STACK_TOP - USER_STACK_RESERVE;

/// The heap may never come closer than this to the mmap/stack area.
pub const BRK_GAP: u64 = 2 * 1024 * 1024;

/// Default start of the program break.
pub const USER_HEAP_START: u64 = 0x0000_0000_4000_0000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProtFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        const SHARED = 1 << 0;
        const PRIVATE = 1 << 1;
        const FIXED = 1 << 4;
        const ANONYMOUS = 1 << 5;
    }
}

/// One memory-map slot. `fd` is -1 for anonymous mappings.
#[derive(Debug, Clone, Copy)]
pub struct MmapRegion {
    pub start: u64,
    pub len: u64,
    pub prot: ProtFlags,
    pub flags: MapFlags,
    pub fd: i32,
    pub offset: u64,
    pub used: bool,
}

impl MmapRegion {
    pub const fn empty() -> Self {
        Self {
            start: 0,
            len: 0,
            prot: ProtFlags::empty(),
            flags: MapFlags::empty(),
            fd: -1,
            offset: 0,
            used: false,
        }
    }

    fn end(&self) -> u64 {
        self.start + self.len
    }

    fn overlaps(&self, start: u64, len: u64) -> bool {
        self.used && start < self.end() && self.start < start + len
    }
}

pub fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

pub fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Owning handle to a user page-table root.
#[derive(Debug)]
pub struct AddressSpace {
    root: u64,
    pub brk_start: u64,
    pub brk: u64,
    pub mmap_cursor: u64,
    pub stack_top: u64,
    pub regions: [MmapRegion; MAX_MMAP_REGIONS],
}

impl AddressSpace {
    /// Fresh user address space: empty user half, kernel half aliased from
    /// the kernel root.
    pub fn new_user() -> Result<Self, KernelError> {
        let root = paging::new_user_root(crate::mm::kernel_root())?;
        Ok(Self {
            root,
            brk_start: USER_HEAP_START,
            brk: USER_HEAP_START,
            mmap_cursor: USER_MMAP_TOP,
            stack_top: USER_STACK_TOP,
            regions: [MmapRegion::empty(); MAX_MMAP_REGIONS],
        })
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    fn pte_flags(prot: ProtFlags) -> PteFlags {
        let mut flags = PteFlags::PRESENT | PteFlags::USER;
        if prot.contains(ProtFlags::WRITE) {
            flags |= PteFlags::WRITABLE;
        }
        if !prot.contains(ProtFlags::EXEC) {
            flags |= PteFlags::NO_EXECUTE;
        }
        flags
    }

    /// Map one freshly zeroed page at `va`.
    pub fn map_anon_page(&mut self, va: u64, prot: ProtFlags) -> Result<(), KernelError> {
        let frame = phys::alloc_frame()?;
        paging::map_page(self.root, va, frame, Self::pte_flags(prot)).map_err(|e| {
            phys::free_frame(frame);
            e
        })
    }

    /// Unmap one page and drop its frame reference.
    pub fn unmap_user_page(&mut self, va: u64) -> bool {
        match paging::unmap_page(self.root, va) {
            Some((pa, _)) => {
                phys::free_frame(pa);
                crate::arch::flush_tlb_page(va);
                true
            }
            None => false,
        }
    }

    /// Map the initial user stack pages below `stack_top`.
    pub fn map_initial_stack(&mut self) -> Result<(), KernelError> {
        let first = self.stack_top - USER_STACK_INITIAL_PAGES * PAGE_SIZE as u64;
        for i in 0..USER_STACK_INITIAL_PAGES {
            self.map_anon_page(
                first + i * PAGE_SIZE as u64,
                ProtFlags::READ | ProtFlags::WRITE,
            )?;
        }
        Ok(())
    }

    fn brk_ceiling(&self) -> u64 {
        let mut ceiling = USER_MMAP_TOP - BRK_GAP;
        for region in self.regions.iter().filter(|r| r.used) {
            if region.start >= self.brk_start {
                ceiling = ceiling.min(region.start);
            }
        }
        ceiling
    }

    /// Move the program break. Returns the break in force afterwards: the
    /// new value on success, the old one when the request cannot be
    /// honoured (brk reports failure by leaving the break unchanged).
    pub fn brk_to(&mut self, new_break: u64) -> u64 {
        if new_break == 0 {
            return self.brk;
        }
        if new_break < self.brk_start || new_break > self.brk_ceiling() {
            return self.brk;
        }
        let old_page = page_align_up(self.brk);
        let new_page = page_align_up(new_break);
        if new_page > old_page {
            let mut va = old_page;
            while va < new_page {
                if let Err(e) = self.map_anon_page(va, ProtFlags::READ | ProtFlags::WRITE) {
                    crate::warn!("brk: mapping {:#x} failed: {:?}", va, e);
                    // unwind this call's pages, break unchanged
                    let mut undo = old_page;
                    while undo < va {
                        self.unmap_user_page(undo);
                        undo += PAGE_SIZE as u64;
                    }
                    return self.brk;
                }
                va += PAGE_SIZE as u64;
            }
        } else if new_page < old_page {
            let mut va = new_page;
            while va < old_page {
                self.unmap_user_page(va);
                va += PAGE_SIZE as u64;
            }
        }
        self.brk = new_break;
        self.brk
    }

    /// Choose a base for a new mapping by walking the cursor downward,
    /// skipping existing regions and stopping above the heap.
    pub fn find_mmap_base(&self, len: u64) -> Option<u64> {
        let mut base = page_align_down(self.mmap_cursor.checked_sub(len)?);
        'retry: loop {
            if base < page_align_up(self.brk) + BRK_GAP {
                return None;
            }
            for region in self.regions.iter() {
                if region.overlaps(base, len) {
                    base = page_align_down(region.start.checked_sub(len)?);
                    continue 'retry;
                }
            }
            return Some(base);
        }
    }

    /// Record a region in a free slot. Rejects overlap with existing
    /// regions or the heap.
    pub fn insert_region(&mut self, region: MmapRegion) -> Result<(), KernelError> {
        if region.start + region.len > USER_MMAP_TOP.min(self.stack_top) {
            return Err(KernelError::InvalidArgument);
        }
        if self.regions.iter().any(|r| r.overlaps(region.start, region.len)) {
            return Err(KernelError::InvalidArgument);
        }
        let heap_end = page_align_up(self.brk.max(self.brk_start));
        if region.start < heap_end + BRK_GAP && region.end() > self.brk_start {
            return Err(KernelError::InvalidArgument);
        }
        match self.regions.iter_mut().find(|r| !r.used) {
            Some(slot) => {
                let mut region = region;
                region.used = true;
                *slot = region;
                Ok(())
            }
            None => Err(KernelError::OutOfMemory),
        }
    }

    /// Remove the region starting exactly at `start` with length `len`.
    /// Partial unmaps would split a region and are rejected.
    pub fn take_region(&mut self, start: u64, len: u64) -> Result<MmapRegion, KernelError> {
        let len = page_align_up(len);
        let slot = self
            .regions
            .iter_mut()
            .find(|r| r.used && r.start == start)
            .ok_or(KernelError::InvalidArgument)?;
        if slot.len != len {
            return Err(KernelError::InvalidArgument);
        }
        let region = *slot;
        *slot = MmapRegion::empty();
        Ok(region)
    }

    /// Shared regions of this space, as page ranges, for the fork clone.
    pub fn shared_ranges(&self) -> heapless::Vec<(u64, u64), MAX_MMAP_REGIONS> {
        let mut ranges = heapless::Vec::new();
        for region in self.regions.iter() {
            if region.used && region.flags.contains(MapFlags::SHARED) {
                let _ = ranges.push((region.start, page_align_up(region.end())));
            }
        }
        ranges
    }

    /// Duplicate this space for a fork child: shared regions by reference,
    /// everything else copy-on-write in both roots, metadata verbatim.
    pub fn fork_clone(&mut self) -> Result<Self, KernelError> {
        let child_root = paging::new_user_root(crate::mm::kernel_root())?;
        let shared = self.shared_ranges();
        if let Err(e) = paging::clone_user_cow(self.root, child_root, &shared) {
            paging::free_user_half(child_root);
            phys::free_frame(child_root);
            return Err(e);
        }
        // The parent's writable pages just became read-only.
        crate::arch::flush_tlb_all();
        Ok(Self {
            root: child_root,
            brk_start: self.brk_start,
            brk: self.brk,
            mmap_cursor: self.mmap_cursor,
            stack_top: self.stack_top,
            regions: self.regions,
        })
    }

    pub fn translate(&self, va: u64) -> Option<(u64, PteFlags)> {
        paging::translate(self.root, va)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        paging::free_user_half(self.root);
        phys::free_frame(self.root);
    }
}
