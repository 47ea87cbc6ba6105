//! The notification center: senders, listen filters, delivery.
//!
//! A sender is a device registered purely to obtain a unique, reuse-protected
//! ID; its driver is inert.  Listeners attach a [`NotificationQueue`] to a
//! sender with a (type, mask) filter, and every matching send pushes a
//! header + payload message onto the queue's pipe without ever blocking the
//! sender.
//!
//! Listen bookkeeping mirrors the device registry: one entry per registry
//! slot, each holding a bounded array of listen triples and a live-listener
//! count.  The count reaching zero deactivates the entry.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ember_kernel::{DeviceId, DeviceRegistry, InertDriver, Label, Wait};

use crate::error::{NotifyError, Result};
use crate::queue::{Notification, NotificationQueue, NotifyConfig, decode, encode};

struct ListenSlot {
    queue: Option<NotificationQueue>,
    msg_type: u32,
    mask: u32,
}

struct SenderEntry {
    active: bool,
    listen_count: usize,
    slots: Vec<ListenSlot>,
}

impl SenderEntry {
    fn new(listen_slots: usize) -> Self {
        Self {
            active: false,
            listen_count: 0,
            slots: (0..listen_slots)
                .map(|_| ListenSlot {
                    queue: None,
                    msg_type: 0,
                    mask: 0,
                })
                .collect(),
        }
    }

    fn clear_slot(&mut self, index: usize) {
        self.slots[index].queue = None;
        self.slots[index].msg_type = 0;
        self.slots[index].mask = 0;
        self.listen_count -= 1;
        if self.listen_count == 0 {
            self.active = false;
        }
    }
}

struct CenterInner {
    registry: DeviceRegistry,
    config: NotifyConfig,
    table: Mutex<Vec<SenderEntry>>,
}

/// Typed, filterable event delivery between registered senders and
/// pipe-backed listener queues.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct NotificationCenter {
    inner: Arc<CenterInner>,
}

impl NotificationCenter {
    /// Build a center over `registry` with default tunables.
    pub fn new(registry: DeviceRegistry) -> Result<Self> {
        Self::with_config(registry, NotifyConfig::default())
    }

    /// Build a center over `registry` with explicit tunables.
    pub fn with_config(registry: DeviceRegistry, config: NotifyConfig) -> Result<Self> {
        config.validate()?;
        let table = (0..registry.config().max_devices)
            .map(|_| SenderEntry::new(config.listen_slots))
            .collect();
        Ok(Self {
            inner: Arc::new(CenterInner {
                registry,
                config,
                table: Mutex::new(table),
            }),
        })
    }

    fn table(&self) -> MutexGuard<'_, Vec<SenderEntry>> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The registry this center validates sender IDs against.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    // -- Senders ------------------------------------------------------------

    /// Register a message producer under `label`.
    ///
    /// The sender is a device in the registry with an inert driver; it
    /// exists only so the ID is unique and protected by a reuse counter.
    pub fn register_sender(&self, label: Label) -> Result<DeviceId> {
        let id = self.inner.registry.register(
            Arc::new(()),
            std::slice::from_ref(&label),
            Arc::new(InertDriver),
        )?;
        tracing::debug!(sender = %id, %label, "notification sender registered");
        Ok(id)
    }

    /// Unregister a sender, invalidating its ID.
    pub async fn unregister_sender(&self, sender: DeviceId) -> Result<()> {
        self.inner.registry.unregister(sender).await?;
        Ok(())
    }

    /// IDs of every sender whose label set contains all of `labels`.
    pub fn find_senders(&self, labels: &[Label], max: usize) -> Result<Vec<DeviceId>> {
        Ok(self.inner.registry.ids_by_labels(labels, max)?)
    }

    // -- Queues -------------------------------------------------------------

    /// Create a notification queue to listen with.
    pub fn queue_create(&self) -> Result<NotificationQueue> {
        NotificationQueue::create(&self.inner.config)
    }

    /// Delete a queue: every sender's listen entries for it are swept, then
    /// the underlying pipe is deleted, waking blocked receivers.
    pub fn queue_delete(&self, queue: &NotificationQueue) -> Result<()> {
        {
            let mut table = self.table();
            for entry in table.iter_mut() {
                if !entry.active {
                    continue;
                }
                let hit = entry
                    .slots
                    .iter()
                    .position(|slot| slot.queue.as_ref().is_some_and(|q| q.id() == queue.id()));
                if let Some(index) = hit {
                    entry.clear_slot(index);
                }
            }
        }
        queue.pipe().delete()?;
        Ok(())
    }

    // -- Listen filters -----------------------------------------------------

    /// Attach `queue` to `sender`, monitoring message types matching
    /// (`msg_type`, `mask`).
    ///
    /// A zero mask with a zero type matches everything; a zero mask with a
    /// nonzero type, or a type carrying bits outside its mask, can never
    /// match and is rejected.
    pub fn listen_start(
        &self,
        queue: &NotificationQueue,
        sender: DeviceId,
        msg_type: u32,
        mask: u32,
    ) -> Result<()> {
        self.inner.registry.validate_id(sender)?;
        if (mask == 0 && msg_type != 0) || (msg_type & mask) != msg_type {
            return Err(NotifyError::InvalidFilter { msg_type, mask });
        }

        let mut table = self.table();
        let entry = &mut table[sender.index()];

        if entry.active {
            let duplicate = entry
                .slots
                .iter()
                .any(|slot| slot.queue.as_ref().is_some_and(|q| q.id() == queue.id()));
            if duplicate {
                return Err(NotifyError::AlreadyListening { sender });
            }
            if entry.listen_count >= entry.slots.len() {
                return Err(NotifyError::NoListenSlot { sender });
            }
        }

        entry.active = true;
        if let Some(slot) = entry.slots.iter_mut().find(|slot| slot.queue.is_none()) {
            slot.queue = Some(queue.clone());
            slot.msg_type = msg_type;
            slot.mask = mask;
            entry.listen_count += 1;
        }
        tracing::debug!(sender = %sender, msg_type, mask, "listen started");
        Ok(())
    }

    /// Detach `queue` from `sender`.
    pub fn listen_stop(&self, queue: &NotificationQueue, sender: DeviceId) -> Result<()> {
        self.inner.registry.validate_id(sender)?;
        let mut table = self.table();
        let entry = &mut table[sender.index()];
        if !entry.active {
            return Err(NotifyError::ListenerNotFound { sender });
        }
        let hit = entry
            .slots
            .iter()
            .position(|slot| slot.queue.as_ref().is_some_and(|q| q.id() == queue.id()));
        match hit {
            Some(index) => {
                entry.clear_slot(index);
                tracing::debug!(sender = %sender, "listen stopped");
                Ok(())
            }
            None => Err(NotifyError::ListenerNotFound { sender }),
        }
    }

    // -- Delivery -----------------------------------------------------------

    /// Send a typed message from `sender` to every listener whose filter
    /// matches.  Delivery never blocks: a full listener queue silently drops
    /// this message for that listener.
    pub async fn send(&self, sender: DeviceId, msg_type: u32, payload: &[u8]) -> Result<()> {
        self.inner.registry.validate_id(sender)?;
        if payload.len() > self.inner.config.max_payload {
            return Err(NotifyError::PayloadTooLarge {
                len: payload.len(),
                max: self.inner.config.max_payload,
            });
        }

        let queues: Vec<NotificationQueue> = {
            let table = self.table();
            let entry = &table[sender.index()];
            if !entry.active {
                return Err(NotifyError::NoActiveListeners { sender });
            }
            entry
                .slots
                .iter()
                .filter(|slot| slot.queue.is_some())
                .filter(|slot| slot.mask == 0 || slot.msg_type == (msg_type & slot.mask))
                .filter_map(|slot| slot.queue.clone())
                .collect()
        };

        let message = encode(sender, msg_type, payload);
        for queue in queues {
            if let Err(err) = queue.pipe().send(&message, Wait::No, 0).await {
                tracing::trace!(sender = %sender, error = %err, "notification dropped");
            }
        }
        Ok(())
    }

    /// Receive the next notification from `queue`, decoding the header back
    /// into (sender, type, payload).
    pub async fn get(&self, queue: &NotificationQueue, wait: Wait) -> Result<Notification> {
        let raw = queue.pipe().receive(wait, 0).await?;
        decode(&raw)
    }
}
