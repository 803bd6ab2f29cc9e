//! Error codes shared by the queue, runner, and handler APIs
//!
//! Every expected failure is local and recoverable; operations report it
//! through these codes instead of panicking. Diagnostic timeouts are not
//! errors and never appear here.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by queue, runner, and handler operations
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An argument failed validation (invalid fd, empty event mask,
    /// IDLE priority on a synchronous send)
    #[error("invalid parameter")]
    InvalidParam,

    /// The target runner is unusable: its queue has been torn down, or the
    /// operation needs a running loop and the loop is not running
    #[error("no usable event runner")]
    NoRunner,

    /// The file descriptor already has a registered listener
    #[error("file descriptor already registered")]
    FdAlreadyRegistered,

    /// The active waiter cannot listen on file descriptors and upgrading to
    /// an fd-capable waiter failed
    #[error("file descriptor listening not supported")]
    FdListeningNotSupported,

    /// Registering or unregistering the file descriptor with the OS failed
    #[error("file descriptor operation failed")]
    FdOperationFailed,

    /// Run/Stop called on a runner that manages its own thread
    #[error("runner manages its own thread")]
    RunnerNoPermit,

    /// A concurrent `run()` is already driving this runner
    #[error("runner is already running")]
    RunnerAlreadyRunning,
}
