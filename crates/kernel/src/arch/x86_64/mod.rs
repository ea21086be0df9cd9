//! x86_64 privileged operations.

pub mod apic;
mod context;

pub use context::{
    context_switch, fork_child_trampoline_addr, kernel_task_trampoline_addr,
    user_entry_trampoline_addr,
};

use x86_64::instructions::interrupts;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::registers::model_specific::GsBase;
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

/// RFLAGS.IF
const IF_BIT: u64 = 1 << 9;

/// Opaque token capturing the interrupt-enable flag at save time.
#[derive(Debug)]
#[must_use = "dropping the token loses the saved interrupt state"]
pub struct IrqFlags(u64);

/// Capture RFLAGS and disable interrupts on this CPU.
pub fn save_and_disable_interrupts() -> IrqFlags {
    let flags = x86_64::registers::rflags::read_raw();
    interrupts::disable();
    IrqFlags(flags)
}

/// Restore the interrupt-enable flag captured by
/// [`save_and_disable_interrupts`]. Tokens must be restored in LIFO order.
pub fn restore_interrupts(token: IrqFlags) {
    if token.0 & IF_BIT != 0 {
        interrupts::enable();
    }
}

pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

/// Unconditionally enable interrupts (idle loop, first task activation).
pub fn enable_interrupts() {
    interrupts::enable();
}

#[inline]
pub fn pause() {
    core::hint::spin_loop();
}

/// Halt until the next interrupt.
#[inline]
pub fn halt() {
    x86_64::instructions::hlt();
}

/// Park this CPU permanently. Used by the fatal path and the halt IPI.
pub fn halt_forever() -> ! {
    loop {
        interrupts::disable();
        x86_64::instructions::hlt();
    }
}

/// Point the CPU-local base register at this CPU's per-CPU area. The area's
/// first field is its own address, so `gs:[0]` yields the area pointer.
///
/// # Safety
/// `base` must be the address of a live, pinned per-CPU area.
pub unsafe fn install_percpu_base(base: u64) {
    GsBase::write(VirtAddr::new(base));
}

/// One-load read of the per-CPU self-pointer. Returns 0 before
/// [`install_percpu_base`] has run on this CPU.
#[inline]
pub fn percpu_base() -> u64 {
    let base: u64;
    unsafe {
        core::arch::asm!("mov {}, gs:[0]", out(reg) base, options(nostack));
    }
    base
}

/// Single-instruction add to a 32-bit field of this CPU's area.
///
/// # Safety
/// `offset` must be the byte offset of a `u32` field inside the per-CPU
/// area, and the base register must be installed.
#[inline]
pub unsafe fn percpu_add32(offset: usize, delta: u32) {
    core::arch::asm!(
        "add dword ptr gs:[{off}], {d:e}",
        off = in(reg) offset,
        d = in(reg) delta,
        options(nostack),
    );
}

/// Single-instruction subtract from a 32-bit field of this CPU's area.
///
/// # Safety
/// Same contract as [`percpu_add32`].
#[inline]
pub unsafe fn percpu_sub32(offset: usize, delta: u32) {
    core::arch::asm!(
        "sub dword ptr gs:[{off}], {d:e}",
        off = in(reg) offset,
        d = in(reg) delta,
        options(nostack),
    );
}

/// Physical address of the active page-table root.
pub fn current_root() -> u64 {
    Cr3::read().0.start_address().as_u64()
}

/// Faulting address of the last page fault (CR2).
pub fn fault_address() -> u64 {
    x86_64::registers::control::Cr2::read().as_u64()
}

/// Load a new page-table root. Implicitly flushes non-global TLB entries.
///
/// # Safety
/// `root` must be the physical address of a valid top-level page table
/// that maps the kernel.
pub unsafe fn load_root(root: u64) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root));
    Cr3::write(frame, Cr3Flags::empty());
}

pub fn flush_tlb_page(va: u64) {
    x86_64::instructions::tlb::flush(VirtAddr::new(va));
}

pub fn flush_tlb_all() {
    x86_64::instructions::tlb::flush_all();
}

#[inline]
fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// TSC frequency from CPUID leaf 15h/16h, when the part reports one.
pub fn detect_tsc_hz() -> Option<u64> {
    let cpuid = raw_cpuid::CpuId::new();
    if let Some(info) = cpuid.get_tsc_info() {
        if let Some(hz) = info.tsc_frequency() {
            return Some(hz);
        }
    }
    cpuid
        .get_processor_frequency_info()
        .map(|f| f.processor_base_frequency() as u64 * 1_000_000)
        .filter(|&hz| hz > 0)
}

/// Busy-wait for approximately `us` microseconds. Uses the TSC when the
/// boot configuration recorded its frequency, a crude spin otherwise.
pub fn delay_us(us: u64) {
    let tsc_hz = crate::config::tsc_hz();
    if tsc_hz > 0 {
        let end = rdtsc().wrapping_add(tsc_hz / 1_000_000 * us);
        while rdtsc() < end {
            pause();
        }
    } else {
        for _ in 0..us.saturating_mul(1_000) {
            pause();
        }
    }
}
