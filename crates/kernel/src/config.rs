//! Boot-time configuration and compile-time limits.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Maximum number of CPUs supported
pub const MAX_CPUS: usize = 8;

/// Maximum number of tasks alive at once
pub const MAX_TASKS: usize = 1024;

/// Per-task file-descriptor table size
pub const MAX_FDS: usize = 64;

/// Per-task memory-map region slots
pub const MAX_MMAP_REGIONS: usize = 32;

/// Kernel stack size per task (16 KiB, 16-byte aligned top)
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Pipe ring-buffer capacity in bytes
pub const PIPE_CAPACITY: usize = 4096;

/// Default timer frequency in Hz
pub const DEFAULT_TICK_HZ: u32 = 100;

/// Default time slice in ticks
pub const DEFAULT_TIME_SLICE: u32 = 5;

/// Default bootstrap-yield interval: the bootstrap task is offered the CPU
/// at least once every this many voluntary yields.
pub const DEFAULT_BOOTSTRAP_INTERVAL: u32 = 10;

static TICK_HZ: AtomicU32 = AtomicU32::new(DEFAULT_TICK_HZ);
static TIME_SLICE: AtomicU32 = AtomicU32::new(DEFAULT_TIME_SLICE);
static BOOTSTRAP_INTERVAL: AtomicU32 = AtomicU32::new(DEFAULT_BOOTSTRAP_INTERVAL);
static TSC_HZ: AtomicU64 = AtomicU64::new(0);

/// Runtime-tunable knobs captured once at boot.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    pub tick_hz: u32,
    pub time_slice_ticks: u32,
    pub bootstrap_yield_interval: u32,
    pub tsc_hz: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tick_hz: DEFAULT_TICK_HZ,
            time_slice_ticks: DEFAULT_TIME_SLICE,
            bootstrap_yield_interval: DEFAULT_BOOTSTRAP_INTERVAL,
            tsc_hz: 0,
        }
    }
}

/// Apply the boot configuration. Called once by the boot processor before
/// the timer is armed.
pub fn apply(cfg: &KernelConfig) {
    TICK_HZ.store(cfg.tick_hz.max(1), Ordering::Release);
    TIME_SLICE.store(cfg.time_slice_ticks.max(1), Ordering::Release);
    BOOTSTRAP_INTERVAL.store(cfg.bootstrap_yield_interval.max(1), Ordering::Release);
    TSC_HZ.store(cfg.tsc_hz, Ordering::Release);
}

pub fn tick_hz() -> u32 {
    TICK_HZ.load(Ordering::Acquire)
}

pub fn time_slice_ticks() -> u32 {
    TIME_SLICE.load(Ordering::Acquire)
}

pub fn bootstrap_yield_interval() -> u32 {
    BOOTSTRAP_INTERVAL.load(Ordering::Acquire)
}

pub fn tsc_hz() -> u64 {
    TSC_HZ.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_clamps_zeroes() {
        let _g = crate::test_support::kernel_lock();
        apply(&KernelConfig {
            tick_hz: 0,
            time_slice_ticks: 0,
            bootstrap_yield_interval: 0,
            tsc_hz: 0,
        });
        assert_eq!(tick_hz(), 1);
        assert_eq!(time_slice_ticks(), 1);
        assert_eq!(bootstrap_yield_interval(), 1);
        apply(&KernelConfig::default());
    }
}
