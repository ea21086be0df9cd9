//! Filesystem seam.
//!
//! The VFS proper is an external collaborator; the runtime sees open files
//! only as opaque sinks/sources behind [`FileOps`]. A root open hook is
//! registered at boot by whoever owns the filesystem stack.

use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Mutex;

use crate::error::{Errno, Result};

pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

/// Operations on a generic open file. Implementations carry their own
/// offset state; `on_dup`/`on_close` are reference notifications and may
/// be invoked with the scheduler lock held, so they must not block or
/// call back into the scheduler.
pub trait FileOps: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> Result<usize>;
    fn write(&self, data: &[u8]) -> Result<usize>;

    fn lseek(&self, _offset: i64, _whence: u32) -> Result<u64> {
        Err(Errno::ESPIPE)
    }

    /// One fd-table reference was duplicated (dup/dup2/fork).
    fn on_dup(&self) {}

    /// One fd-table reference was closed.
    fn on_close(&self) {}
}

pub type FileRef = Arc<dyn FileOps>;

type OpenHook = Box<dyn Fn(&str, u32, u32) -> Result<FileRef> + Send>;

static OPEN_HOOK: Mutex<Option<OpenHook>> = Mutex::new(None);

/// Install the root open hook. Later registrations replace earlier ones.
pub fn register_open_hook(hook: OpenHook) {
    *OPEN_HOOK.lock() = Some(hook);
}

/// Route an open through the registered filesystem. Without a filesystem
/// there is nothing to open.
pub fn open(path: &str, flags: u32, mode: u32) -> Result<FileRef> {
    let hook = OPEN_HOOK.lock();
    match hook.as_ref() {
        Some(open) => open(path, flags, mode),
        None => Err(Errno::ENOENT),
    }
}

#[cfg(test)]
pub fn test_clear_open_hook() {
    *OPEN_HOOK.lock() = None;
}
