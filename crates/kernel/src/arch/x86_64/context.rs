//! Context-switch and first-activation trampolines.
//!
//! The switch saves the callee-saved set and RSP into the previous task and
//! restores the next task's; everything else lives on the stacks. The
//! trampolines are the synthetic return targets pushed by the frame
//! builders in `arch`: fresh kernel tasks pop their entry point, fresh user
//! tasks and fork children iret out of kernel mode.

use core::arch::global_asm;

global_asm!(
    r#"
.section .text
.global __ferrite_context_switch
.p2align 4
// __ferrite_context_switch(prev_sp: *mut u64 in rdi, next_sp: u64 in rsi)
__ferrite_context_switch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov rsp, rsi
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

.global __ferrite_kernel_task_entry
.p2align 4
// First activation of a kernel task: stack holds [entry][arg].
__ferrite_kernel_task_entry:
    pop rax
    pop rdi
    sti
    call rax
    // the task body returned; terminate it
    call ferrite_kernel_task_exit
    ud2

.global __ferrite_user_entry
.p2align 4
// First activation of a user task: stack holds the iretq frame.
__ferrite_user_entry:
    swapgs
    iretq

.global __ferrite_fork_child_entry
.p2align 4
// First activation of a fork child: stack holds the parent's user
// callee-saved registers above the iretq frame. RAX=0 is the child's
// fork return value.
__ferrite_fork_child_entry:
    pop rbx
    pop rbp
    pop r12
    pop r13
    pop r14
    pop r15
    xor eax, eax
    swapgs
    iretq
"#
);

extern "C" {
    fn __ferrite_context_switch(prev_sp: *mut u64, next_sp: u64);
    fn __ferrite_kernel_task_entry();
    fn __ferrite_user_entry();
    fn __ferrite_fork_child_entry();
}

/// Hand the CPU to another task. Returns when this task is next scheduled.
///
/// # Safety
/// Caller must hold no spinlocks, run with interrupts disabled, and
/// `next_sp` must be a stack pointer previously produced by this function
/// or by one of the frame builders.
#[inline]
pub unsafe fn context_switch(prev_sp: *mut u64, next_sp: u64) {
    __ferrite_context_switch(prev_sp, next_sp);
}

pub fn kernel_task_trampoline_addr() -> u64 {
    __ferrite_kernel_task_entry as usize as u64
}

pub fn user_entry_trampoline_addr() -> u64 {
    __ferrite_user_entry as usize as u64
}

pub fn fork_child_trampoline_addr() -> u64 {
    __ferrite_fork_child_entry as usize as u64
}
