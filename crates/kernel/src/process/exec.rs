//! Exec: hand-off to an external program loader.
//!
//! The loader (ELF or otherwise) lives outside the runtime. It receives
//! the path and argument vectors, builds a fresh address space with the
//! entry context, and the runtime swaps that into the calling task. On
//! success the syscall never returns to the old program; on any failure
//! the caller's context is untouched and the errno comes from one fixed
//! mapping, so a failed exec in a fork child is distinguishable from a
//! voluntary exit.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

use crate::arch::{UserContext, USER_RFLAGS};
use crate::error::{Errno, Result};
use crate::mm::AddressSpace;
use crate::process::scheduler;
use crate::process::signal::{SigAction, Signal, NSIG};
use crate::process::table;
use crate::sync::IrqGuard;

/// Loader failure classes; each maps to exactly one errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    NotFound,
    BadImage,
    NoMemory,
    Denied,
}

impl From<ExecError> for Errno {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::NotFound => Errno::ENOENT,
            ExecError::BadImage => Errno::ENOEXEC,
            ExecError::NoMemory => Errno::ENOMEM,
            ExecError::Denied => Errno::EACCES,
        }
    }
}

/// What a successful load produces: a ready address space and the entry
/// context inside it (argv/envp already staged on the user stack).
pub struct ExecImage {
    pub aspace: AddressSpace,
    pub entry: u64,
    pub user_stack_top: u64,
}

pub struct ExecRequest {
    pub path: String,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

type Loader = Box<dyn Fn(&ExecRequest) -> core::result::Result<ExecImage, ExecError> + Send>;

static LOADER: Mutex<Option<Loader>> = Mutex::new(None);

/// Install the program loader. Boot code registers this once.
pub fn register_loader(loader: Loader) {
    *LOADER.lock() = Some(loader);
}

#[cfg(test)]
pub fn test_clear_loader() {
    *LOADER.lock() = None;
}

/// Replace the current task's program. On success the saved user context
/// now enters the new image and the old address space is gone; the
/// dispatcher returning to user mode lands in the new program.
pub fn do_execve(path: String, argv: Vec<String>, envp: Vec<String>) -> Result<()> {
    let request = ExecRequest { path, argv, envp };
    let image = {
        let loader = LOADER.lock();
        let load = loader.as_ref().ok_or(Errno::ENOEXEC)?;
        load(&request).map_err(Errno::from)?
    };

    let _irq = IrqGuard::new();
    let mut guard = table::lock();
    let tasks = guard.as_mut().ok_or(Errno::ESRCH)?;
    let pid = scheduler::current_pid().ok_or(Errno::ESRCH)?;
    let task = tasks.get_mut(pid).ok_or(Errno::ESRCH)?;
    if task.aspace.is_none() {
        return Err(Errno::EPERM);
    }

    let root = image.aspace.root();
    // Move the CPU off the old root before the old space (and its root
    // frame) is freed. The kernel half is aliased in the new root, so the
    // running kernel stack stays mapped across the load.
    let cpu = crate::smp::percpu::this_cpu();
    if cpu.active_root() != root {
        unsafe { crate::arch::load_root(root) };
        cpu.set_active_root(root);
    }
    task.user_stack_top = image.user_stack_top;
    task.name = request.path;
    task.aspace = Some(image.aspace);
    task.uctx = UserContext {
        rip: image.entry,
        rsp: image.user_stack_top,
        rflags: USER_RFLAGS,
        ..UserContext::default()
    };
    // Handled dispositions reset to default across exec.
    for signo in 1..=NSIG as u32 {
        if let Some(sig) = Signal::from_u32(signo) {
            let action = task.signals.action(sig);
            if !matches!(
                action.disposition,
                crate::process::signal::Disposition::Default
                    | crate::process::signal::Disposition::Ignore
            ) {
                let _ = task.signals.set_action(sig, SigAction::default());
            }
        }
    }

    Ok(())
}
