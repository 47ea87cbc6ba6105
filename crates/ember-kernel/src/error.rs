//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every public API in this crate.  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.  Transient pipe conditions (full, empty,
//! reset, deleted, timed out) are distinct variants so callers can tell
//! "try again later" apart from "this handle is gone for good".

use crate::id::{DeviceHandle, DeviceId};

/// Unified error type for the EmberOS kernel core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    // -- Argument validation ------------------------------------------------
    /// A call was malformed independent of any shared state (out-of-range
    /// count, oversized label list, zero-sized message, ...).
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    // -- Device registry ----------------------------------------------------
    /// Every registry slot is occupied; no device ID can be issued.
    #[error("device registry is full")]
    RegistryFull,

    /// The device ID refers to a slot that is inactive or has been reused
    /// since the ID was issued (reuse-counter mismatch).
    #[error("stale or unregistered device id: {id}")]
    StaleDevice { id: DeviceId },

    /// No currently registered device matched the requested label.
    #[error("no registered device matched")]
    DeviceNotFound,

    /// The device has no free session slot left.
    #[error("no available session on device {id}")]
    NoFreeSession { id: DeviceId },

    /// The handle decodes to a session that is not in the Open state.
    #[error("session is not open: {handle}")]
    SessionNotOpen { handle: DeviceHandle },

    /// A caller-sized result list cannot hold every match.
    #[error("result list too small: needs {needed}, capacity {capacity}")]
    ListTooSmall { needed: usize, capacity: usize },

    // -- Discovery ----------------------------------------------------------
    /// Every listener slot is occupied.
    #[error("listener table is full")]
    ListenerTableFull,

    /// The listener handle does not refer to a live listener.
    #[error("listener not found")]
    ListenerNotFound,

    // -- Pipe ---------------------------------------------------------------
    /// The pipe has no room for the message and the caller chose not to wait.
    #[error("pipe is full")]
    PipeFull,

    /// The pipe holds no message and the caller chose not to wait.
    #[error("pipe is empty")]
    PipeEmpty,

    /// The pipe was reset while the caller was suspended on it.
    #[error("pipe was reset")]
    PipeReset,

    /// The pipe was deleted, either while the caller was suspended on it or
    /// before the operation started.
    #[error("pipe was deleted")]
    PipeDeleted,

    /// A bounded wait elapsed before the operation could complete.
    #[error("operation timed out")]
    Timeout,

    // -- Driver -------------------------------------------------------------
    /// A driver callback reported a failure of its own.
    #[error("driver error: {reason}")]
    Driver { reason: String },
}

impl KernelError {
    /// Shorthand for [`KernelError::InvalidArgument`].
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        KernelError::InvalidArgument {
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
