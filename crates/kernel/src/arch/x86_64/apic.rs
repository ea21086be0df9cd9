//! Local APIC access: IPIs, AP startup sequencing, and the per-AP timer.

use core::sync::atomic::{AtomicU32, Ordering};

/// xAPIC MMIO base (identity physical address).
const LAPIC_PHYS_BASE: u64 = 0xFEE0_0000;

const REG_ID: u64 = 0x020;
const REG_EOI: u64 = 0x0B0;
const REG_SVR: u64 = 0x0F0;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INIT: u64 = 0x380;
const REG_TIMER_CURRENT: u64 = 0x390;
const REG_TIMER_DIVIDE: u64 = 0x3E0;

const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const ICR_INIT: u32 = 0x0000_4500;
const ICR_STARTUP: u32 = 0x0000_4600;
const SVR_ENABLE: u32 = 1 << 8;
const TIMER_PERIODIC: u32 = 1 << 17;
/// Divide-by-16 encoding for the timer divide configuration register.
const DIVIDE_BY_16: u32 = 0b0011;

/// LAPIC timer ticks (divided) per kernel tick, measured on the BSP.
static TIMER_TICKS_PER_KTICK: AtomicU32 = AtomicU32::new(0);

fn reg(offset: u64) -> *mut u32 {
    crate::mm::phys_to_virt(LAPIC_PHYS_BASE + offset) as *mut u32
}

fn read(offset: u64) -> u32 {
    unsafe { core::ptr::read_volatile(reg(offset)) }
}

fn write(offset: u64, value: u32) {
    unsafe { core::ptr::write_volatile(reg(offset), value) }
}

/// Software-enable the local APIC with the spurious vector parked at 0xFF.
pub fn init() {
    write(REG_SVR, SVR_ENABLE | 0xFF);
}

pub fn local_apic_id() -> u32 {
    read(REG_ID) >> 24
}

/// Signal end-of-interrupt for the in-service vector.
pub fn eoi() {
    write(REG_EOI, 0);
}

fn icr_send(apic_id: u32, low: u32) {
    while read(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
        super::pause();
    }
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, low);
}

/// Fixed-delivery IPI to one CPU.
pub fn send_ipi(apic_id: u32, vector: u8) {
    icr_send(apic_id, vector as u32);
}

/// INIT IPI, the first half of the AP startup handshake.
pub fn send_init(apic_id: u32) {
    icr_send(apic_id, ICR_INIT);
}

/// STARTUP IPI pointing the AP at `start_page << 12`.
pub fn send_sipi(apic_id: u32, start_page: u8) {
    icr_send(apic_id, ICR_STARTUP | start_page as u32);
}

/// Measure the LAPIC timer rate against `sample_ticks` of the global tick
/// (the BSP's PIT must already be running). Stores the per-tick reload
/// value used by [`start_periodic_timer`] on the APs.
pub fn calibrate_timer(sample_ticks: u64) {
    write(REG_TIMER_DIVIDE, DIVIDE_BY_16);
    let start_tick = crate::time::ticks();
    while crate::time::ticks() == start_tick {
        super::pause();
    }
    write(REG_TIMER_INIT, u32::MAX);
    let begin = crate::time::ticks();
    while crate::time::ticks() < begin + sample_ticks {
        super::pause();
    }
    let elapsed = u32::MAX - read(REG_TIMER_CURRENT);
    write(REG_TIMER_INIT, 0);
    let per_tick = (elapsed as u64 / sample_ticks.max(1)) as u32;
    TIMER_TICKS_PER_KTICK.store(per_tick.max(1), Ordering::Release);
    crate::debug!("apic: timer calibrated, {} counts per tick", per_tick);
}

/// Arm this CPU's LAPIC timer to fire `vector` once per kernel tick.
/// Requires a prior [`calibrate_timer`] on the BSP.
pub fn start_periodic_timer(vector: u8) {
    let reload = TIMER_TICKS_PER_KTICK.load(Ordering::Acquire);
    if reload == 0 {
        crate::warn!("apic: timer not calibrated, AP tick disabled");
        return;
    }
    write(REG_TIMER_DIVIDE, DIVIDE_BY_16);
    write(REG_LVT_TIMER, TIMER_PERIODIC | vector as u32);
    write(REG_TIMER_INIT, reload);
}
