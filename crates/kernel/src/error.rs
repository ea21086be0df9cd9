// Kernel error handling and errno definitions

/// Kernel-internal error kinds.
///
/// `Fatal` is reserved for invariant violations that indicate corruption
/// (an empty pick-next, a null saved stack pointer on a runnable task, a
/// zombie on a run queue). The top-level handler dumps diagnostics and
/// halts the offending CPU instead of propagating it further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    InvalidArgument,
    PermissionDenied,
    NotFound,
    WouldBlock,
    Interrupted,
    BadFileDescriptor,
    BadAddress,
    NotInitialized,
    Fatal(&'static str),
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,      // Operation not permitted
    ENOENT = 2,     // No such file or directory
    ESRCH = 3,      // No such process
    EINTR = 4,      // Interrupted system call
    ENOEXEC = 8,    // Exec format error
    EBADF = 9,      // Bad file descriptor
    ECHILD = 10,    // No child processes
    EAGAIN = 11,    // Try again / Would block
    ENOMEM = 12,    // Out of memory
    EACCES = 13,    // Permission denied
    EFAULT = 14,    // Bad address
    EINVAL = 22,    // Invalid argument
    EMFILE = 24,    // Too many open files
    ESPIPE = 29,    // Illegal seek
    EPIPE = 32,     // Broken pipe
    ENOSYS = 38,    // Function not implemented
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory => Errno::ENOMEM,
            KernelError::InvalidArgument => Errno::EINVAL,
            KernelError::PermissionDenied => Errno::EACCES,
            KernelError::NotFound => Errno::ENOENT,
            KernelError::WouldBlock => Errno::EAGAIN,
            KernelError::Interrupted => Errno::EINTR,
            KernelError::BadFileDescriptor => Errno::EBADF,
            KernelError::BadAddress => Errno::EFAULT,
            KernelError::NotInitialized => Errno::EINVAL,
            KernelError::Fatal(_) => Errno::EINVAL,
        }
    }
}

impl Errno {
    /// Negated value for the syscall return register.
    pub fn as_isize(self) -> isize {
        -(self as i32 as isize)
    }

    pub fn as_i64(self) -> i64 {
        -(self as i32 as i64)
    }

    /// Get a static string description of the error
    pub fn description(self) -> &'static str {
        match self {
            Errno::EPERM => "Operation not permitted",
            Errno::ENOENT => "No such file or directory",
            Errno::ESRCH => "No such process",
            Errno::EINTR => "Interrupted system call",
            Errno::ENOEXEC => "Exec format error",
            Errno::EBADF => "Bad file descriptor",
            Errno::ECHILD => "No child processes",
            Errno::EAGAIN => "Try again",
            Errno::ENOMEM => "Out of memory",
            Errno::EACCES => "Permission denied",
            Errno::EFAULT => "Bad address",
            Errno::EINVAL => "Invalid argument",
            Errno::EMFILE => "Too many open files",
            Errno::ESPIPE => "Illegal seek",
            Errno::EPIPE => "Broken pipe",
            Errno::ENOSYS => "Function not implemented",
        }
    }
}

pub type Result<T> = core::result::Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_negates_at_the_boundary() {
        assert_eq!(Errno::EBADF.as_isize(), -9);
        assert_eq!(Errno::ENOSYS.as_i64(), -38);
    }

    #[test]
    fn kernel_error_maps_to_errno() {
        assert_eq!(Errno::from(KernelError::OutOfMemory), Errno::ENOMEM);
        assert_eq!(Errno::from(KernelError::BadAddress), Errno::EFAULT);
        assert_eq!(Errno::from(KernelError::Interrupted), Errno::EINTR);
    }
}
