//! EmberOS Event Notification.
//!
//! Typed, filterable event delivery layered on the ember-kernel device
//! registry and message pipes:
//!
//! - **[`center`]** -- The [`NotificationCenter`]: sender registration,
//!   per-sender listen tables, non-blocking fan-out delivery.
//! - **[`queue`]** -- Pipe-backed [`NotificationQueue`]s and the wire layout
//!   of header + payload messages.
//! - **[`error`]** -- Notification error types via [`thiserror`].
//!
//! A sender obtains a reuse-protected [`ember_kernel::DeviceId`] by
//! registering an inert device; listeners attach queues with (type, mask)
//! filters and receive matching messages through blocking or non-blocking
//! [`NotificationCenter::get`] calls.

pub mod center;
pub mod error;
pub mod queue;

// Re-export the most commonly used types at the crate root for convenience.
pub use center::NotificationCenter;
pub use error::{NotifyError, Result};
pub use queue::{HEADER_LEN, Notification, NotificationQueue, NotifyConfig};
