//! Host shim for the test harness.
//!
//! Mirrors the x86_64 surface with thread-local stand-ins: the interrupt
//! flag is a bool, the per-CPU base and page-table root are cells, and the
//! context switch records its arguments instead of changing stacks. This
//! keeps scheduler, memory and syscall logic runnable under `cargo test`.

use std::cell::Cell;

/// Value written into the previous task's saved-SP slot by the simulated
/// context switch.
pub const SIMULATED_SAVED_SP: u64 = 0x5AFE_0000_0000_0000;

std::thread_local! {
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
    static PERCPU_BASE: Cell<u64> = const { Cell::new(0) };
    static CURRENT_ROOT: Cell<u64> = const { Cell::new(0) };
    static SWITCHES: std::cell::RefCell<Vec<(u64, u64)>> = const { std::cell::RefCell::new(Vec::new()) };
    static ROOT_LOADS: std::cell::RefCell<Vec<u64>> = const { std::cell::RefCell::new(Vec::new()) };
}

#[derive(Debug)]
#[must_use = "dropping the token loses the saved interrupt state"]
pub struct IrqFlags(bool);

pub fn save_and_disable_interrupts() -> IrqFlags {
    let was = IRQ_ENABLED.with(|c| c.replace(false));
    IrqFlags(was)
}

pub fn restore_interrupts(token: IrqFlags) {
    if token.0 {
        IRQ_ENABLED.with(|c| c.set(true));
    }
}

pub fn interrupts_enabled() -> bool {
    IRQ_ENABLED.with(|c| c.get())
}

pub fn enable_interrupts() {
    IRQ_ENABLED.with(|c| c.set(true));
}

#[inline]
pub fn pause() {
    core::hint::spin_loop();
}

#[inline]
pub fn halt() {
    std::thread::yield_now();
}

pub fn halt_forever() -> ! {
    panic!("halt_forever reached in test build");
}

pub unsafe fn install_percpu_base(base: u64) {
    PERCPU_BASE.with(|c| c.set(base));
}

#[inline]
pub fn percpu_base() -> u64 {
    PERCPU_BASE.with(|c| c.get())
}

pub unsafe fn percpu_add32(offset: usize, delta: u32) {
    let base = percpu_base();
    assert_ne!(base, 0, "per-CPU base not installed");
    let field = (base as usize + offset) as *mut u32;
    *field = (*field).wrapping_add(delta);
}

pub unsafe fn percpu_sub32(offset: usize, delta: u32) {
    let base = percpu_base();
    assert_ne!(base, 0, "per-CPU base not installed");
    let field = (base as usize + offset) as *mut u32;
    *field = (*field).wrapping_sub(delta);
}

pub fn current_root() -> u64 {
    CURRENT_ROOT.with(|c| c.get())
}

std::thread_local! {
    static FAULT_ADDRESS: Cell<u64> = const { Cell::new(0) };
}

pub fn fault_address() -> u64 {
    FAULT_ADDRESS.with(|c| c.get())
}

pub fn test_set_fault_address(addr: u64) {
    FAULT_ADDRESS.with(|c| c.set(addr));
}

pub unsafe fn load_root(root: u64) {
    CURRENT_ROOT.with(|c| c.set(root));
    ROOT_LOADS.with(|v| v.borrow_mut().push(root));
}

pub fn flush_tlb_page(_va: u64) {}

pub fn flush_tlb_all() {}

/// Record the switch and fill in the saved-SP slot; execution stays on the
/// caller's stack, so callers observe an immediate "return from switch".
pub unsafe fn context_switch(prev_sp: *mut u64, next_sp: u64) {
    *prev_sp = SIMULATED_SAVED_SP;
    SWITCHES.with(|v| v.borrow_mut().push((prev_sp as u64, next_sp)));
}

extern "C" fn host_kernel_task_entry() {}
extern "C" fn host_user_entry() {}
extern "C" fn host_fork_child_entry() {}

pub fn kernel_task_trampoline_addr() -> u64 {
    host_kernel_task_entry as usize as u64
}

pub fn user_entry_trampoline_addr() -> u64 {
    host_user_entry as usize as u64
}

pub fn fork_child_trampoline_addr() -> u64 {
    host_fork_child_entry as usize as u64
}

pub fn delay_us(_us: u64) {}

pub fn detect_tsc_hz() -> Option<u64> {
    None
}

pub fn test_take_switches() -> Vec<(u64, u64)> {
    SWITCHES.with(|v| v.borrow_mut().drain(..).collect())
}

pub fn test_take_root_loads() -> Vec<u64> {
    ROOT_LOADS.with(|v| v.borrow_mut().drain(..).collect())
}

pub mod apic {
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum IpiRecord {
        Fixed { apic_id: u32, vector: u8 },
        Init { apic_id: u32 },
        Startup { apic_id: u32, page: u8 },
    }

    static SENT: Mutex<Vec<IpiRecord>> = Mutex::new(Vec::new());

    pub fn init() {}

    pub fn local_apic_id() -> u32 {
        crate::smp::percpu::this_cpu_id() as u32
    }

    pub fn eoi() {}

    pub fn send_ipi(apic_id: u32, vector: u8) {
        SENT.lock().unwrap().push(IpiRecord::Fixed { apic_id, vector });
    }

    pub fn send_init(apic_id: u32) {
        SENT.lock().unwrap().push(IpiRecord::Init { apic_id });
    }

    pub fn send_sipi(apic_id: u32, page: u8) {
        SENT.lock().unwrap().push(IpiRecord::Startup { apic_id, page });
    }

    pub fn calibrate_timer(_sample_ticks: u64) {}

    pub fn start_periodic_timer(_vector: u8) {}

    pub fn test_take_sent() -> Vec<IpiRecord> {
        SENT.lock().unwrap().drain(..).collect()
    }
}
