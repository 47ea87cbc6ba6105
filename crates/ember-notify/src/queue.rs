//! Notification queues and the on-pipe message layout.
//!
//! A [`NotificationQueue`] is a variable-size, FIFO kernel pipe plus an
//! identity used by listen bookkeeping.  Messages travel as a fixed header
//! (sender ID, type, payload length, each a little-endian `u32`) followed by
//! the payload bytes.

use std::sync::atomic::{AtomicU64, Ordering};

use ember_kernel::{DeviceId, MessagePolicy, Pipe, SuspendOrder};
use serde::Deserialize;

use crate::error::{NotifyError, Result};

/// Bytes of header preceding every payload: sender, type, length.
pub const HEADER_LEN: usize = 12;

/// Tunables for the notification subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    /// Byte capacity of each notification queue's pipe.
    pub queue_capacity: usize,
    /// Largest payload one notification may carry.
    pub max_payload: usize,
    /// Listen slots per sender.
    pub listen_slots: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_payload: 64,
            listen_slots: 8,
        }
    }
}

impl NotifyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_payload == 0 || self.listen_slots == 0 {
            return Err(NotifyError::Kernel(ember_kernel::KernelError::InvalidArgument {
                reason: "max_payload and listen_slots must be nonzero".into(),
            }));
        }
        Ok(())
    }
}

/// A decoded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The registered sender this message came from.
    pub sender: DeviceId,
    /// The sender-defined message type that was matched against filters.
    pub msg_type: u32,
    /// The message body; may be empty.
    pub payload: Vec<u8>,
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// One caller's receive endpoint for notifications.
///
/// Cheaply cloneable; clones share the same underlying pipe and identity.
#[derive(Debug, Clone)]
pub struct NotificationQueue {
    id: u64,
    pipe: Pipe,
}

impl NotificationQueue {
    pub(crate) fn create(config: &NotifyConfig) -> Result<Self> {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let pipe = Pipe::new(
            format!("notify-{id}"),
            config.queue_capacity,
            MessagePolicy::Variable {
                max: HEADER_LEN + config.max_payload,
            },
            SuspendOrder::Fifo,
        )?;
        Ok(Self { id, pipe })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn pipe(&self) -> &Pipe {
        &self.pipe
    }
}

impl PartialEq for NotificationQueue {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NotificationQueue {}

/// Lay out header + payload for the pipe.
pub(crate) fn encode(sender: DeviceId, msg_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&sender.as_raw().to_le_bytes());
    buf.extend_from_slice(&msg_type.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Inverse of [`encode`].
pub(crate) fn decode(raw: &[u8]) -> Result<Notification> {
    if raw.len() < HEADER_LEN {
        return Err(NotifyError::Malformed {
            reason: format!("{} bytes is shorter than the header", raw.len()),
        });
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&raw[0..4]);
    let sender = DeviceId::from_raw(u32::from_le_bytes(word));
    word.copy_from_slice(&raw[4..8]);
    let msg_type = u32::from_le_bytes(word);
    word.copy_from_slice(&raw[8..12]);
    let len = u32::from_le_bytes(word) as usize;

    if raw.len() != HEADER_LEN + len {
        return Err(NotifyError::Malformed {
            reason: format!(
                "header claims {len} payload bytes, message carries {}",
                raw.len() - HEADER_LEN
            ),
        });
    }
    Ok(Notification {
        sender,
        msg_type,
        payload: raw[HEADER_LEN..].to_vec(),
    })
}
