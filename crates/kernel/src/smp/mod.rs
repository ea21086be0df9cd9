//! SMP support: CPU online tracking and application-processor bring-up.
//!
//! The boot processor starts each AP with the INIT + STARTUP sequence
//! against a trampoline page copied into low memory. The trampoline image
//! itself is firmware territory (external); its contract here is a
//! parameter block in the last four quadwords of the page:
//! `[page_table_root][stack_top][cpu_id][entry]`.

pub mod ipi;
pub mod percpu;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch;
use crate::config::MAX_CPUS;

/// Physical page the AP trampoline is copied to (must be < 1 MiB and
/// page-number addressable by a STARTUP IPI).
pub const TRAMPOLINE_PHYS: u64 = 0x8000;

/// AP kernel-entry stack size.
const AP_STACK_SIZE: usize = 64 * 1024;

/// Number of CPUs online (boot CPU counts from the start).
static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

static CPU_ONLINE: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];

/// Per-AP "ready" flags set at the end of each AP's bring-up.
static AP_READY: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];

/// Process-wide flag: once set, CPU-local state is read from the per-CPU
/// area instead of the boot globals.
static SMP_ACTIVE: AtomicBool = AtomicBool::new(false);

pub fn smp_active() -> bool {
    SMP_ACTIVE.load(Ordering::Acquire)
}

pub(crate) fn set_smp_active() {
    SMP_ACTIVE.store(true, Ordering::Release);
}

#[cfg(test)]
pub fn test_clear_smp_active() {
    SMP_ACTIVE.store(false, Ordering::Release);
}

pub fn num_cpus() -> usize {
    CPU_COUNT.load(Ordering::Acquire)
}

pub fn is_cpu_online(cpu_id: usize) -> bool {
    cpu_id < MAX_CPUS && CPU_ONLINE[cpu_id].load(Ordering::Acquire)
}

pub fn mark_cpu_online(cpu_id: usize) {
    if cpu_id >= MAX_CPUS {
        crate::warn!("smp: cpu id {} exceeds MAX_CPUS", cpu_id);
        return;
    }
    if !CPU_ONLINE[cpu_id].swap(true, Ordering::AcqRel) {
        CPU_COUNT.fetch_add(1, Ordering::AcqRel);
        crate::info!("smp: cpu {} online", cpu_id);
    }
}

/// Copy the trampoline image into low memory and patch its parameter
/// block for one AP.
fn stage_trampoline(image: &[u8], root: u64, stack_top: u64, cpu_id: usize, entry: u64) {
    let page = crate::mm::phys_to_virt(TRAMPOLINE_PHYS);
    unsafe {
        core::ptr::copy_nonoverlapping(image.as_ptr(), page, image.len());
        let params = page.add(crate::mm::PAGE_SIZE - 32) as *mut u64;
        params.write_volatile(root);
        params.add(1).write_volatile(stack_top);
        params.add(2).write_volatile(cpu_id as u64);
        params.add(3).write_volatile(entry);
    }
}

/// Rust-side entry for an application processor, reached from the
/// trampoline with its own stack.
pub extern "C" fn ap_main(cpu_id: usize) -> ! {
    unsafe { percpu::PerCpu::install(cpu_id) };
    arch::apic::init();
    arch::apic::start_periodic_timer(crate::interrupts::TIMER_VECTOR);

    // This CPU's initial context is its idle task.
    if let Some(area) = percpu::get(cpu_id) {
        if let Some(idle) = area.idle_pid() {
            let _irq = crate::sync::IrqGuard::new();
            let mut guard = crate::process::table::lock();
            if let Some(task) = guard.as_mut().and_then(|t| t.get_mut(idle)) {
                task.state = crate::process::TaskState::Running;
            }
            area.set_current_pid(Some(idle));
        }
    }

    mark_cpu_online(cpu_id);
    AP_READY[cpu_id].store(true, Ordering::Release);
    crate::info!("smp: cpu {} entering idle", cpu_id);
    crate::process::scheduler::idle_loop()
}

/// Bring up every application processor listed in the boot information.
/// CPU ids are assigned in list order; index 0 is the boot processor.
pub fn start_application_processors(apic_ids: &[u32], trampoline_image: &'static [u8]) {
    if trampoline_image.is_empty() || trampoline_image.len() > crate::mm::PAGE_SIZE - 32 {
        crate::warn!("smp: no usable trampoline image, staying single-CPU");
        return;
    }
    mark_cpu_online(0);

    for (cpu_id, &apic_id) in apic_ids.iter().enumerate().skip(1) {
        if cpu_id >= MAX_CPUS {
            crate::warn!("smp: ignoring cpu {} beyond MAX_CPUS", cpu_id);
            break;
        }
        // Boot code normally pre-allocates areas (and idle tasks) for
        // every listed CPU; cover the late-registered case too.
        if percpu::get(cpu_id).is_none() {
            percpu::PerCpu::allocate(cpu_id, apic_id);
        }
        let stack = alloc::boxed::Box::leak(alloc::vec![0u8; AP_STACK_SIZE].into_boxed_slice());
        let stack_top = (stack.as_ptr() as u64 + AP_STACK_SIZE as u64) & !0xF;
        stage_trampoline(
            trampoline_image,
            crate::mm::kernel_root(),
            stack_top,
            cpu_id,
            ap_main as usize as u64,
        );

        arch::apic::send_init(apic_id);
        arch::delay_us(10_000);
        arch::apic::send_sipi(apic_id, (TRAMPOLINE_PHYS >> 12) as u8);
        arch::delay_us(200);
        if !AP_READY[cpu_id].load(Ordering::Acquire) {
            arch::apic::send_sipi(apic_id, (TRAMPOLINE_PHYS >> 12) as u8);
        }
        // Bounded wait; a CPU that never reports is left offline.
        for _ in 0..1_000 {
            if AP_READY[cpu_id].load(Ordering::Acquire) {
                break;
            }
            arch::delay_us(100);
        }
        if !AP_READY[cpu_id].load(Ordering::Acquire) {
            crate::warn!("smp: cpu {} (apic {}) did not come online", cpu_id, apic_id);
        }
    }

    // All APs are past the trampoline; drop its mapping.
    let tramp_va = crate::mm::phys_to_virt(TRAMPOLINE_PHYS) as u64;
    if crate::mm::paging::unmap_page(crate::mm::kernel_root(), tramp_va).is_some() {
        arch::flush_tlb_page(tramp_va);
    }

    crate::info!("smp: {} cpu(s) online", num_cpus());
}

#[derive(Debug, Clone, Copy)]
pub struct SmpStats {
    pub num_cpus: usize,
    pub online: [bool; MAX_CPUS],
}

pub fn stats() -> SmpStats {
    let mut online = [false; MAX_CPUS];
    for (i, flag) in online.iter_mut().enumerate() {
        *flag = is_cpu_online(i);
    }
    SmpStats {
        num_cpus: num_cpus(),
        online,
    }
}
