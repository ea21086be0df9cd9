//! Panic plumbing and the fatal-invariant path.
//!
//! Kernel-internal corruption (an empty pick-next, a zombie on a run
//! queue, an unresolvable kernel-mode fault) is not an error to
//! propagate: the offending CPU dumps a diagnostic line and parks, after
//! asking every other CPU to park too.

use crate::arch;

fn dump(context: &str) {
    let cpu = crate::smp::percpu::this_cpu_id();
    let pid = crate::process::scheduler::current_pid();
    let tick = crate::time::ticks();
    crate::error!(
        "FATAL on cpu {}: {} (current={:?}, tick={})",
        cpu,
        context,
        pid,
        tick
    );
}

/// Invariant violation: diagnostic dump, halt the others, park this CPU.
pub fn fatal_invariant(msg: &'static str) -> ! {
    dump(msg);
    crate::smp::ipi::halt_others();
    arch::halt_forever()
}

/// Unexpected interrupt vector.
pub fn fatal(vector: u64, rip: u64) -> ! {
    let cpu = crate::smp::percpu::this_cpu_id();
    crate::error!(
        "FATAL on cpu {}: unexpected vector {:#x} at rip {:#x}",
        cpu,
        vector,
        rip
    );
    crate::smp::ipi::halt_others();
    arch::halt_forever()
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::error!("KERNEL PANIC: {}", info);
    crate::smp::ipi::halt_others();
    arch::halt_forever()
}
