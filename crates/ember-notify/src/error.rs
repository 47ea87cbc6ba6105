//! Notification error types.

use ember_kernel::{DeviceId, KernelError};

/// Unified error type for the notification subsystem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    /// The (type, mask) pair cannot match anything: a zero mask with a
    /// nonzero type, or a type with bits outside its own mask.
    #[error("invalid type filter: type {msg_type:#x} with mask {mask:#x}")]
    InvalidFilter { msg_type: u32, mask: u32 },

    /// The queue is already listening to this sender.
    #[error("queue is already listening to sender {sender}")]
    AlreadyListening { sender: DeviceId },

    /// Every listen slot of this sender is occupied.
    #[error("no listen slot left on sender {sender}")]
    NoListenSlot { sender: DeviceId },

    /// A send found nobody listening to the sender.
    #[error("sender {sender} has no active listeners")]
    NoActiveListeners { sender: DeviceId },

    /// The queue does not listen to this sender.
    #[error("listener not found on sender {sender}")]
    ListenerNotFound { sender: DeviceId },

    /// The payload exceeds the configured maximum.
    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// A received message does not decode as header + payload.
    #[error("malformed notification message: {reason}")]
    Malformed { reason: String },

    /// An underlying registry or pipe operation failed.
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Convenience alias used throughout the notification crate.
pub type Result<T> = std::result::Result<T, NotifyError>;
