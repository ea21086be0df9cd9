//! Physical frame allocator.
//!
//! A bitmap over the bootable RAM region, plus a per-frame reference count
//! so copy-on-write and shared mappings can hold the same frame from
//! several page tables. Frames hand out zeroed.
//!
//! Under the test harness the "physical" region is a leaked host
//! allocation and frame addresses are host addresses, which makes
//! `phys_to_virt` the identity map and lets page-table walks run in tests.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::error::KernelError;

pub const PAGE_SIZE: usize = 4096;

/// Virtual offset of the physical direct map. Zero means identity.
static PHYS_OFFSET: AtomicU64 = AtomicU64::new(0);

struct FrameAllocator {
    /// First byte of the managed region, page aligned.
    base: u64,
    /// One bit per frame; set = in use.
    bitmap: Vec<u64>,
    /// Shared-mapping reference counts, parallel to the bitmap.
    refcounts: Vec<u16>,
    frames: usize,
    free: usize,
    /// Rotating search start so freed frames do not cluster scans.
    hint: usize,
}

static FRAMES: Mutex<Option<FrameAllocator>> = Mutex::new(None);

impl FrameAllocator {
    fn new(base: u64, len: u64) -> Self {
        let frames = (len as usize) / PAGE_SIZE;
        Self {
            base,
            bitmap: vec![0u64; (frames + 63) / 64],
            refcounts: vec![0u16; frames],
            frames,
            free: frames,
            hint: 0,
        }
    }

    fn index_of(&self, pa: u64) -> Option<usize> {
        if pa < self.base {
            return None;
        }
        let idx = ((pa - self.base) as usize) / PAGE_SIZE;
        if idx < self.frames {
            Some(idx)
        } else {
            None
        }
    }

    fn set(&mut self, idx: usize, used: bool) {
        let (word, bit) = (idx / 64, idx % 64);
        if used {
            self.bitmap[word] |= 1 << bit;
        } else {
            self.bitmap[word] &= !(1 << bit);
        }
    }

    fn is_set(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn alloc(&mut self) -> Option<u64> {
        if self.free == 0 {
            return None;
        }
        for step in 0..self.frames {
            let idx = (self.hint + step) % self.frames;
            if !self.is_set(idx) {
                self.set(idx, true);
                self.refcounts[idx] = 1;
                self.free -= 1;
                self.hint = (idx + 1) % self.frames;
                return Some(self.base + (idx * PAGE_SIZE) as u64);
            }
        }
        None
    }
}

/// Hand the allocator the bootable RAM region and record the direct-map
/// offset. Called once by the boot processor after the heap is up.
pub fn init(base: u64, len: u64, phys_offset: u64) {
    PHYS_OFFSET.store(phys_offset, Ordering::Release);
    let mut guard = FRAMES.lock();
    *guard = Some(FrameAllocator::new(base, len));
    crate::info!(
        "mm: {} frames managed at {:#x} (direct map +{:#x})",
        guard.as_ref().map(|f| f.frames).unwrap_or(0),
        base,
        phys_offset
    );
}

/// Address of a physical byte through the direct map.
#[inline]
pub fn phys_to_virt(pa: u64) -> *mut u8 {
    (pa + PHYS_OFFSET.load(Ordering::Acquire)) as *mut u8
}

/// Allocate one zeroed frame with reference count 1.
pub fn alloc_frame() -> Result<u64, KernelError> {
    let pa = {
        let mut guard = FRAMES.lock();
        let alloc = guard.as_mut().ok_or(KernelError::NotInitialized)?;
        alloc.alloc().ok_or(KernelError::OutOfMemory)?
    };
    unsafe {
        core::ptr::write_bytes(phys_to_virt(pa), 0, PAGE_SIZE);
    }
    Ok(pa)
}

/// Add a reference to a frame that is being mapped a second time
/// (copy-on-write or shared region).
pub fn retain_frame(pa: u64) {
    let mut guard = FRAMES.lock();
    if let Some(alloc) = guard.as_mut() {
        if let Some(idx) = alloc.index_of(pa) {
            alloc.refcounts[idx] = alloc.refcounts[idx].saturating_add(1);
        }
    }
}

/// Drop a reference; the frame returns to the pool when the count reaches
/// zero. Frames outside the managed region (MMIO) are ignored.
pub fn free_frame(pa: u64) {
    let mut guard = FRAMES.lock();
    let Some(alloc) = guard.as_mut() else {
        return;
    };
    let Some(idx) = alloc.index_of(pa) else {
        return;
    };
    if !alloc.is_set(idx) {
        crate::error!("mm: double free of frame {:#x}", pa);
        return;
    }
    let rc = alloc.refcounts[idx].saturating_sub(1);
    alloc.refcounts[idx] = rc;
    if rc == 0 {
        alloc.set(idx, false);
        alloc.free += 1;
    }
}

/// Current reference count of a frame; 0 for unmanaged addresses.
pub fn frame_refcount(pa: u64) -> u16 {
    let guard = FRAMES.lock();
    guard
        .as_ref()
        .and_then(|a| a.index_of(pa).map(|i| a.refcounts[i]))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
pub struct FrameStats {
    pub total: usize,
    pub free: usize,
}

pub fn stats() -> FrameStats {
    let guard = FRAMES.lock();
    match guard.as_ref() {
        Some(a) => FrameStats {
            total: a.frames,
            free: a.free,
        },
        None => FrameStats { total: 0, free: 0 },
    }
}

/// Rebuild the allocator over a fresh host-backed arena.
#[cfg(test)]
pub fn test_reset(frames: usize) {
    use alloc::alloc::{alloc_zeroed, Layout};
    let bytes = frames * PAGE_SIZE;
    let layout = Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
    // Leaked on purpose: frame addresses stay valid for the test lifetime.
    let base = unsafe { alloc_zeroed(layout) } as u64;
    PHYS_OFFSET.store(0, Ordering::Release);
    *FRAMES.lock() = Some(FrameAllocator::new(base, bytes as u64));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_cycle() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let before = stats().free;
        let a = alloc_frame().unwrap();
        let b = alloc_frame().unwrap();
        assert_ne!(a, b);
        assert_eq!(stats().free, before - 2);
        free_frame(a);
        free_frame(b);
        assert_eq!(stats().free, before);
    }

    #[test]
    fn frames_hand_out_zeroed() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let pa = alloc_frame().unwrap();
        unsafe {
            core::ptr::write_bytes(phys_to_virt(pa), 0xAB, PAGE_SIZE);
        }
        free_frame(pa);
        let pa2 = alloc_frame().unwrap();
        let byte = unsafe { *phys_to_virt(pa2) };
        assert_eq!(byte, 0);
        free_frame(pa2);
    }

    #[test]
    fn refcount_holds_frame_alive() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_mm();
        let pa = alloc_frame().unwrap();
        retain_frame(pa);
        assert_eq!(frame_refcount(pa), 2);
        free_frame(pa);
        assert_eq!(frame_refcount(pa), 1);
        let free_now = stats().free;
        free_frame(pa);
        assert_eq!(stats().free, free_now + 1);
    }
}
