//! Preemptive SMP process runtime for a small 64-bit kernel.
//!
//! This crate is the core the rest of the system plugs into: per-CPU
//! state, the round-robin preemptive scheduler, UNIX-style process
//! lifecycle (fork/exec/wait with copy-on-write), signal delivery, and
//! the numbered syscall surface. Boot firmware, interrupt entry stubs,
//! drivers, the VFS, and the program loader are external collaborators
//! reached through the seams in [`vfs`], [`process::exec`], and the
//! `extern "C"` handler entry points.
//!
//! Bare-metal builds are `no_std`; the unit-test harness runs hosted with
//! an arch shim and a simulated physical-memory arena.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod console;
pub mod error;
pub mod interrupts;
pub mod ipc;
pub mod log;
pub mod mm;
pub mod panic;
pub mod process;
pub mod smp;
pub mod sync;
pub mod syscall;
#[cfg(test)]
pub mod test_support;
#[cfg(test)]
mod tests;
pub mod time;
pub mod vfs;

use config::KernelConfig;

#[cfg(not(test))]
#[global_allocator]
static KERNEL_HEAP: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

/// Hand-off block from the boot firmware shim.
pub struct BootInfo {
    /// Virtual offset of the physical direct map (0 = identity).
    pub phys_offset: u64,
    /// Bootable RAM handed to the frame allocator.
    pub phys_base: u64,
    pub phys_len: u64,
    /// Early heap carve-out, already mapped.
    pub heap_base: u64,
    pub heap_len: u64,
    /// Local-APIC ids of every CPU; index 0 is the boot processor.
    pub cpu_apic_ids: &'static [u32],
    /// AP startup trampoline image (real-mode bytes).
    pub trampoline: &'static [u8],
    pub config: KernelConfig,
}

/// Boot-processor entry, called by the firmware shim with interrupts
/// disabled and a valid kernel page table loaded. Brings the runtime up
/// and becomes the bootstrap task's housekeeping loop.
pub fn kernel_main(boot: &BootInfo) -> ! {
    console::init();
    let mut cfg = boot.config;
    if cfg.tsc_hz == 0 {
        cfg.tsc_hz = arch::detect_tsc_hz().unwrap_or(0);
    }
    config::apply(&cfg);
    crate::info!("kernel core starting ({} cpu(s) listed)", boot.cpu_apic_ids.len());

    #[cfg(not(test))]
    unsafe {
        KERNEL_HEAP
            .lock()
            .init(boot.heap_base as *mut u8, boot.heap_len as usize);
    }

    mm::init(boot.phys_base, boot.phys_len, boot.phys_offset).expect("mm init failed");

    // Per-CPU areas for every listed CPU, boot CPU installed now.
    let bsp_apic = boot.cpu_apic_ids.first().copied().unwrap_or(0);
    smp::percpu::PerCpu::allocate(0, bsp_apic);
    unsafe { smp::percpu::PerCpu::install(0) };

    process::init().expect("process init failed");
    for (cpu_id, &apic_id) in boot.cpu_apic_ids.iter().enumerate().skip(1) {
        if cpu_id < config::MAX_CPUS {
            smp::percpu::PerCpu::allocate(cpu_id, apic_id);
        }
    }
    process::scheduler::create_idle_tasks().expect("idle task creation failed");

    interrupts::init();
    arch::apic::init();
    // The calibration loop watches the tick counter, so the PIT must be
    // delivering by now.
    arch::enable_interrupts();
    arch::apic::calibrate_timer(10);

    smp::start_application_processors(boot.cpu_apic_ids, boot.trampoline);
    process::scheduler::enable_smp();

    crate::info!("kernel core up; entering bootstrap housekeeping");
    process::bootstrap_housekeeping_loop()
}
