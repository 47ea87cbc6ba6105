//! EmberOS Kernel Core.
//!
//! This crate provides the device-registration and inter-task-communication
//! services every driver in EmberOS builds on:
//!
//! - **[`registry`]** -- Fixed-slot device registry with bit-packed,
//!   reuse-protected IDs, session state machines, and driver dispatch.
//! - **[`pipe`]** -- Circular-buffer message pipes (fixed or variable size,
//!   FIFO or priority suspension, broadcast, send-to-front, reset).
//! - **[`discovery`]** -- Label-filtered registration-change listeners driven
//!   by a background discovery task.
//! - **[`label`]** -- Capability labels and small fixed-capacity label sets.
//! - **[`driver`]** -- The [`DeviceDriver`] trait implemented by every
//!   registered device.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod config;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod id;
pub mod label;
pub mod pipe;
pub mod registry;
pub mod signal;

// Re-export the most commonly used types at the crate root for convenience.
pub use config::KernelConfig;
pub use discovery::{DeviceCallback, ListenerId};
pub use driver::{
    CTRL_CAPABILITY_BASE, CapabilityQuery, DeviceDriver, InertDriver, InstanceContext,
    SessionContext,
};
pub use error::{KernelError, Result};
pub use id::{DeviceHandle, DeviceId};
pub use label::{LABEL_LEN, Label, LabelSet};
pub use pipe::{MessagePolicy, Pipe, PipeInfo, SuspendOrder};
pub use registry::{ChangeReport, ChangeWatch, DeviceRegistry};
pub use signal::{EventFlags, Wait};
