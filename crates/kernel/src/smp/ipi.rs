//! Inter-processor interrupts.
//!
//! Three vectors are reserved at the top of the vector space: reschedule
//! (nudge a CPU into its scheduler), TLB shootdown (flush after cross-CPU
//! permission tightening), and halt-others (fatal path).

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch;
use crate::config::MAX_CPUS;
use crate::smp::percpu;

pub const RESCHEDULE_VECTOR: u8 = 0xFD;
pub const TLB_SHOOTDOWN_VECTOR: u8 = 0xFC;
pub const HALT_VECTOR: u8 = 0xFB;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiKind {
    Reschedule,
    TlbShootdown,
    Halt,
}

impl IpiKind {
    pub fn vector(self) -> u8 {
        match self {
            IpiKind::Reschedule => RESCHEDULE_VECTOR,
            IpiKind::TlbShootdown => TLB_SHOOTDOWN_VECTOR,
            IpiKind::Halt => HALT_VECTOR,
        }
    }

    fn from_vector(vector: u8) -> Option<Self> {
        match vector {
            RESCHEDULE_VECTOR => Some(IpiKind::Reschedule),
            TLB_SHOOTDOWN_VECTOR => Some(IpiKind::TlbShootdown),
            HALT_VECTOR => Some(IpiKind::Halt),
            _ => None,
        }
    }
}

/// Received-IPI counters per CPU.
pub struct IpiStats {
    pub reschedule: AtomicU64,
    pub tlb_shootdown: AtomicU64,
    pub halt: AtomicU64,
}

impl IpiStats {
    const fn new() -> Self {
        Self {
            reschedule: AtomicU64::new(0),
            tlb_shootdown: AtomicU64::new(0),
            halt: AtomicU64::new(0),
        }
    }
}

static IPI_STATS: [IpiStats; MAX_CPUS] = [const { IpiStats::new() }; MAX_CPUS];

/// Send an IPI to a specific CPU by id.
pub fn send(target_cpu: usize, kind: IpiKind) {
    let Some(area) = percpu::get(target_cpu) else {
        crate::warn!("ipi: no per-CPU area for cpu {}", target_cpu);
        return;
    };
    if !crate::smp::is_cpu_online(target_cpu) {
        crate::debug!("ipi: target cpu {} offline", target_cpu);
        return;
    }
    arch::apic::send_ipi(area.apic_id, kind.vector());
}

/// Send an IPI to every other online CPU.
pub fn send_all_but_self(kind: IpiKind) {
    let me = percpu::this_cpu_id();
    for cpu in 0..MAX_CPUS {
        if cpu != me && crate::smp::is_cpu_online(cpu) {
            send(cpu, kind);
        }
    }
}

/// Ask a CPU to enter its scheduler at the next opportunity.
pub fn send_reschedule(target_cpu: usize) {
    send(target_cpu, IpiKind::Reschedule);
}

/// Flush the local TLB and ask every other CPU to do the same.
pub fn tlb_shootdown_all() {
    arch::flush_tlb_all();
    send_all_but_self(IpiKind::TlbShootdown);
}

/// Park every other CPU (fatal path).
pub fn halt_others() {
    send_all_but_self(IpiKind::Halt);
}

/// Interrupt-handler tail for the reserved vectors. Returns false for
/// vectors that are not IPIs.
pub fn handle_ipi(vector: u8) -> bool {
    let Some(kind) = IpiKind::from_vector(vector) else {
        return false;
    };
    let cpu = percpu::this_cpu_id();
    let stats = &IPI_STATS[cpu];
    percpu::this_cpu().counters.ipis.fetch_add(1, Ordering::Relaxed);
    match kind {
        IpiKind::Reschedule => {
            stats.reschedule.fetch_add(1, Ordering::Relaxed);
            // Preemption happens on the interrupt-return path.
            percpu::this_cpu().set_need_resched(true);
        }
        IpiKind::TlbShootdown => {
            stats.tlb_shootdown.fetch_add(1, Ordering::Relaxed);
            arch::flush_tlb_all();
        }
        IpiKind::Halt => {
            stats.halt.fetch_add(1, Ordering::Relaxed);
            arch::halt_forever();
        }
    }
    arch::apic::eoi();
    true
}

/// Snapshot of one CPU's received-IPI counters.
pub fn stats(cpu_id: usize) -> Option<(u64, u64, u64)> {
    if cpu_id >= MAX_CPUS {
        return None;
    }
    let s = &IPI_STATS[cpu_id];
    Some((
        s.reschedule.load(Ordering::Relaxed),
        s.tlb_shootdown.load(Ordering::Relaxed),
        s.halt.load(Ordering::Relaxed),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reschedule_ipi_sets_need_resched() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_percpu(1);
        percpu::this_cpu().set_need_resched(false);
        assert!(handle_ipi(RESCHEDULE_VECTOR));
        assert!(percpu::this_cpu().need_resched());
        assert!(!handle_ipi(0x20));
    }

    #[test]
    fn send_targets_apic_id() {
        let _g = crate::test_support::kernel_lock();
        crate::test_support::reset_percpu(2);
        crate::smp::mark_cpu_online(1);
        arch::apic::test_take_sent();
        send_reschedule(1);
        let sent = arch::apic::test_take_sent();
        let apic_id = percpu::get(1).unwrap().apic_id;
        assert!(sent.contains(&arch::apic::IpiRecord::Fixed {
            apic_id,
            vector: RESCHEDULE_VECTOR
        }));
    }
}
