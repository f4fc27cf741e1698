//! Shared kernel-level error vocabulary.

/// Erros "kernel-level" do subsistema de IPC, visíveis na borda de syscall.
///
/// Every flag-driven condition is surfaced as one of these values and the
/// caller decides whether to retry, wait or abort. Counter or content
/// mismatches discovered inside the subsystem are programming errors, not
/// members of this taxonomy; those paths `assert!` and halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Bad identifier, stale identifier, destroyed object or bad argument.
    InvalidArgument,
    /// Registry slots exhausted.
    NoSpace,
    /// Key already names a live object (with CREATE | EXCLUSIVE).
    AlreadyExists,
    /// Key names no live object and CREATE is absent.
    NotFound,
    /// The call would block and NO_WAIT is set.
    WouldBlock,
    /// Receive on an empty queue with NO_WAIT set.
    NoMessage,
    /// The wait was cancelled before the condition held.
    Interrupted,
    /// The object was destroyed while the caller was blocked on it.
    Removed,
    /// Backing storage or segment budget exhausted.
    OutOfMemory,
    /// Caller's credentials do not grant the required access.
    PermissionDenied,
}

pub type IpcResult<T> = core::result::Result<T, IpcError>;

impl IpcError {
    /// Negative errno for the syscall boundary.
    pub fn errno(self) -> i64 {
        match self {
            IpcError::InvalidArgument => -22,  // EINVAL
            IpcError::NoSpace => -28,          // ENOSPC
            IpcError::AlreadyExists => -17,    // EEXIST
            IpcError::NotFound => -2,          // ENOENT
            IpcError::WouldBlock => -11,       // EAGAIN
            IpcError::NoMessage => -42,        // ENOMSG
            IpcError::Interrupted => -4,       // EINTR
            IpcError::Removed => -43,          // EIDRM
            IpcError::OutOfMemory => -12,      // ENOMEM
            IpcError::PermissionDenied => -13, // EACCES
        }
    }
}
