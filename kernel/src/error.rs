//! Kernel error codes.
//!
//! Every fallible operation reports one of these codes and nothing else;
//! there is no payload beyond the code itself. The codes fall into three
//! groups: resource exhaustion, illegal arguments, and protocol
//! violations. A corrupt kernel table is not an `Error` — it is a panic
//! during boot, because it means the allocator itself is broken.

use thiserror::Error;

/// Result type for kernel operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Kernel error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    // ========== Resource exhaustion ==========
    /// The process table has no free slot.
    #[error("process table is full")]
    ProcessLimit,

    /// The process has no free file descriptor slots.
    #[error("file descriptor table is full")]
    FileLimit,

    // ========== Illegal arguments ==========
    /// The pid does not name a live process.
    #[error("no such process")]
    NoProcess,

    /// The tid does not name a thread of the calling process.
    #[error("no such thread")]
    NoThread,

    /// The fid does not name an open file.
    #[error("bad file descriptor")]
    BadFid,

    /// The port number is outside the valid range, or the socket has no
    /// port where one is required.
    #[error("bad port number")]
    BadPort,

    /// The stream does not support the requested operation.
    #[error("operation not supported by this stream")]
    NotSupported,

    // ========== Protocol violations ==========
    /// A thread cannot join itself.
    #[error("cannot join the current thread")]
    JoinSelf,

    /// The target thread is detached and cannot be joined.
    #[error("thread is detached")]
    Detached,

    /// The target thread has already exited and cannot be detached.
    #[error("thread has already exited")]
    Exited,

    /// The caller has no child matching the wait request.
    #[error("no matching child process")]
    NoChild,

    /// The pipe's read end is closed; nothing will ever read this data.
    #[error("pipe's read end is closed")]
    BrokenPipe,

    /// The port is already bound to a live listener.
    #[error("port is already bound")]
    PortBound,

    /// The port is not bound to a listener.
    #[error("port is not bound")]
    PortUnbound,

    /// The socket is already bound as a listener.
    #[error("socket is already a listener")]
    AlreadyBound,

    /// The socket is not a listener.
    #[error("socket is not a listener")]
    NotListener,

    /// The socket is not connected to a peer.
    #[error("socket is not connected")]
    NotConnected,

    /// The socket is already connected or has a pending connection.
    #[error("socket is already connected")]
    AlreadyConnected,
}
