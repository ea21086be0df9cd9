//! Tick source.
//!
//! A monotonic 64-bit counter incremented exactly once per timer
//! interrupt. The per-tick work is bounded: wake expired sleepers, charge
//! the running task's time slice, sweep the signal timers. The task-switch
//! path is never entered from here; preemption happens on interrupt return
//! or at the next scheduler call.

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Monotonic tick counter. Never decreases.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

pub fn ticks_to_ms(t: u64) -> u64 {
    t.saturating_mul(1000) / crate::config::tick_hz() as u64
}

pub fn ms_to_ticks(ms: u64) -> u64 {
    (ms.saturating_mul(crate::config::tick_hz() as u64) + 999) / 1000
}

/// Timer-interrupt body, called once per interrupt on the CPU that took
/// it. Only the boot processor's source advances the global counter (and
/// with it the sleep and signal-timer sweeps); application processors
/// charge their own running task's slice against their local timer.
pub fn on_tick() {
    let cpu = crate::smp::percpu::this_cpu();
    cpu.counters.timer_ticks.fetch_add(1, Ordering::Relaxed);
    if cpu.cpu_id == 0 {
        let now = TICKS.fetch_add(1, Ordering::AcqRel) + 1;
        crate::process::scheduler::on_tick(now);
    } else {
        crate::process::scheduler::charge_slice_local();
    }
}

#[cfg(test)]
pub fn test_set_ticks(value: u64) {
    TICKS.store(value, Ordering::Release);
}
