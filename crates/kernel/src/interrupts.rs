//! Interrupt plumbing for the tick source.
//!
//! The boot processor runs the legacy PIT at the configured frequency
//! through the remapped PIC; application processors mirror the tick with
//! their local APIC timers. Entry stubs (external) push a [`TrapFrame`]
//! and call the handlers here; preemption is decided at the tail, never
//! inside the tick work itself.

use crate::smp::percpu;

/// PIT tick vector after PIC remap.
pub const TIMER_VECTOR: u8 = 0x20;

/// Register block pushed by the external interrupt entry stubs, in push
/// order. The iret block sits at the end.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// Snapshot the user-visible context for per-task storage (syscall
    /// entry, fault-time signal delivery).
    pub fn user_context(&self) -> crate::arch::UserContext {
        crate::arch::UserContext {
            rip: self.rip,
            rsp: self.rsp,
            rflags: self.rflags,
            rax: self.rax,
            rbx: self.rbx,
            rbp: self.rbp,
            r12: self.r12,
            r13: self.r13,
            r14: self.r14,
            r15: self.r15,
        }
    }

    /// Write a (possibly rewritten) saved context back into the frame the
    /// stub will iret on.
    pub fn apply_user_context(&mut self, uctx: &crate::arch::UserContext) {
        self.rip = uctx.rip;
        self.rsp = uctx.rsp;
        self.rflags = uctx.rflags;
        self.rax = uctx.rax;
        self.rbx = uctx.rbx;
        self.rbp = uctx.rbp;
        self.r12 = uctx.r12;
        self.r13 = uctx.r13;
        self.r14 = uctx.r14;
        self.r15 = uctx.r15;
    }
}

#[cfg(all(target_arch = "x86_64", not(test)))]
mod pit {
    use spin::Mutex;
    use x86_64::instructions::port::Port;

    const PIT_FREQUENCY: u32 = 1_193_182;

    pub static PICS: Mutex<pic8259::ChainedPics> =
        Mutex::new(unsafe { pic8259::ChainedPics::new(0x20, 0x28) });

    /// Remap the PIC, program PIT channel 0 as a rate generator at
    /// `hz`, and unmask only the timer line.
    pub fn init(hz: u32) {
        unsafe {
            let mut pics = PICS.lock();
            pics.initialize();
            pics.write_masks(0xFE, 0xFF);
        }
        let divisor = (PIT_FREQUENCY / hz.max(19)).clamp(1, u16::MAX as u32) as u16;
        let mut command: Port<u8> = Port::new(0x43);
        let mut channel0: Port<u8> = Port::new(0x40);
        unsafe {
            command.write(0x36);
            channel0.write((divisor & 0xFF) as u8);
            channel0.write((divisor >> 8) as u8);
        }
    }

    pub fn eoi(vector: u8) {
        unsafe { PICS.lock().notify_end_of_interrupt(vector) };
    }
}

/// Arm the boot processor's tick source.
pub fn init() {
    #[cfg(all(target_arch = "x86_64", not(test)))]
    pit::init(crate::config::tick_hz());
    crate::info!("timer: tick source at {} Hz", crate::config::tick_hz());
}

fn end_of_interrupt(_vector: u8) {
    #[cfg(all(target_arch = "x86_64", not(test)))]
    {
        // PIT ticks arrive via the PIC on the BSP; AP timer ticks via the
        // local APIC.
        if crate::smp::percpu::this_cpu_id() == 0 {
            pit::eoi(_vector);
        } else {
            crate::arch::apic::eoi();
        }
    }
}

/// Timer-interrupt handler, called by the entry stub with the saved
/// register block. Runs the bounded tick work, then hands the frame to the
/// scheduler's preemption check on the way out.
pub extern "C" fn timer_interrupt(frame: &mut TrapFrame) {
    let cpu = percpu::this_cpu();
    cpu.irq_enter();
    crate::time::on_tick();
    end_of_interrupt(TIMER_VECTOR);
    cpu.irq_exit();

    // Preempt only from the outermost interrupt level with preemption
    // enabled; otherwise the flag stays set for a later safe point.
    if cpu.need_resched() && cpu.preempt_count() == 0 && cpu.irq_depth() == 0 {
        crate::process::scheduler::preempt(frame);
    }
}

/// Non-timer vectors funnel here: IPIs and the page fault are dispatched,
/// anything else is fatal.
pub extern "C" fn generic_interrupt(frame: &mut TrapFrame) {
    let vector = frame.vector as u8;
    if crate::smp::ipi::handle_ipi(vector) {
        return;
    }
    if vector == 0x0E {
        crate::process::handle_page_fault_interrupt(frame);
        return;
    }
    crate::panic::fatal(frame.vector, frame.rip);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_frame_layout_matches_stub_contract() {
        assert_eq!(core::mem::size_of::<TrapFrame>(), 22 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, vector), 15 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rip), 17 * 8);
    }
}
