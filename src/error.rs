//! Error types shared across the crate.
//!
//! Only [`ChannelError`] ever leaves a handler: it means the control socket
//! is unusable and the init loop must stop. Everything else is folded into a
//! [`crate::transport::Reply`] and sent back to the controller.

use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};

/// Failure of the control channel itself.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("socket: {0}")]
    Io(#[from] nix::Error),

    #[error("channel closed by peer")]
    Closed,

    #[error("message truncated (exceeds {0} byte buffer)")]
    Truncated(usize),

    #[error("ancillary data truncated")]
    AncillaryTruncated,

    #[error("message too large: {0} bytes")]
    TooLarge(usize),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] JoinError),
}

/// Failure to create or release the supervised process.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("empty argv")]
    EmptyArgv,

    #[error("argument contains NUL byte")]
    Nul(#[from] std::ffi::NulError),

    #[error("expected program image descriptor")]
    MissingExecFd,

    #[error("fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("child setup failed at {stage}: {errno}")]
    Setup {
        stage: &'static str,
        errno: nix::errno::Errno,
    },

    #[error("exec: {0}")]
    Exec(nix::errno::Errno),

    #[error("child exited before exec")]
    ChildVanished,

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("wait4: {0}")]
    Wait(#[source] nix::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] JoinError),
}

/// Why the init loop stopped.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("loop: {0}")]
    Channel(#[from] ChannelError),

    #[error("{0}")]
    Panic(String),
}

/// Controller-side failure of one request.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The init replied with a logical error.
    #[error("{0}")]
    Remote(String),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

/// Await a task, re-raising its panic in the caller.
///
/// Panics are fatal and belong to the init loop boundary; only a cancelled
/// task comes back as an error.
pub(crate) async fn join<T>(handle: JoinHandle<T>) -> Result<T, JoinError> {
    match handle.await {
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        other => other,
    }
}
