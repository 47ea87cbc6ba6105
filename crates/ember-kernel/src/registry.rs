//! The device registry.
//!
//! A fixed table of device records, each holding a label set, a driver, and a
//! bank of session slots.  Registration issues bit-packed [`DeviceId`]s whose
//! embedded reuse counter invalidates them the moment the slot is freed, and
//! every subsequent operation re-validates the ID against the live slot
//! before touching it.
//!
//! # Locking
//!
//! All table mutation happens inside a short critical section (a plain
//! [`std::sync::Mutex`]).  Driver callbacks are **always** invoked with the
//! lock released; the registry re-acquires it afterward to commit the
//! resulting state transition.  A blocking driver can therefore never stall
//! unrelated registry traffic.
//!
//! # Slot allocation
//!
//! Both device slots and session slots use an eagerly maintained "next free"
//! cursor that is re-derived by a full forward cyclic scan after every
//! allocation, so allocation order is deterministic: always the lowest free
//! slot scanning forward from the previous cursor.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::KernelConfig;
use crate::discovery::Listener;
use crate::driver::{
    CTRL_CAPABILITY_BASE, CapabilityQuery, DeviceDriver, InstanceContext, SessionContext,
};
use crate::error::{KernelError, Result};
use crate::id::{DeviceHandle, DeviceId, next_reuse};
use crate::label::{Label, LabelSet};
use crate::signal::{EventFlags, Wait};

// Registry-change event bits.
pub(crate) const REGISTERED_BIT: u32 = 1 << 0;
pub(crate) const UNREGISTERED_BIT: u32 = 1 << 1;
pub(crate) const SCAN_BIT: u32 = 1 << 2;
pub(crate) const SHUTDOWN_BIT: u32 = 1 << 3;
pub(crate) const REG_CHANGE_MASK: u32 = REGISTERED_BIT | UNREGISTERED_BIT;

// ---------------------------------------------------------------------------
// Records and sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Closed,
    Locked,
    Open,
}

struct Session {
    state: SessionState,
    ctx: Option<SessionContext>,
    in_flight: usize,
    /// Signals a close waiting for this session's dispatches to drain.
    drained: Arc<Notify>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::Closed,
            ctx: None,
            in_flight: 0,
            drained: Arc::new(Notify::new()),
        }
    }
}

struct DeviceRecord {
    active: bool,
    labels: LabelSet,
    instance: Option<InstanceContext>,
    driver: Option<Arc<dyn DeviceDriver>>,
    open_count: usize,
    next_session: Option<usize>,
    reuse: u32,
    sessions: Vec<Session>,
}

impl DeviceRecord {
    fn new(max_labels: usize, max_sessions: usize) -> Self {
        Self {
            active: false,
            labels: LabelSet::new(max_labels),
            instance: None,
            driver: None,
            open_count: 0,
            next_session: Some(0),
            reuse: 0,
            sessions: (0..max_sessions).map(|_| Session::new()).collect(),
        }
    }
}

struct RegistryTable {
    records: Vec<DeviceRecord>,
    active_count: usize,
    next_free: Option<usize>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub(crate) struct RegistryInner {
    pub(crate) config: KernelConfig,
    table: Mutex<RegistryTable>,
    pub(crate) change: EventFlags,
    pub(crate) listeners: Mutex<Vec<Option<Listener>>>,
}

/// The process-wide device table.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`; clones share the same
/// table.
#[derive(Clone)]
pub struct DeviceRegistry {
    pub(crate) inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
    /// Create a registry sized by `config`.
    pub fn new(config: KernelConfig) -> Result<Self> {
        config.validate()?;
        let records = (0..config.max_devices)
            .map(|_| DeviceRecord::new(config.max_labels, config.max_sessions))
            .collect();
        let listeners = (0..config.max_listeners).map(|_| None).collect();
        Ok(Self {
            inner: Arc::new(RegistryInner {
                config,
                table: Mutex::new(RegistryTable {
                    records,
                    active_count: 0,
                    next_free: Some(0),
                }),
                change: EventFlags::new(),
                listeners: Mutex::new(listeners),
            }),
        })
    }

    fn table(&self) -> MutexGuard<'_, RegistryTable> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn listeners(&self) -> MutexGuard<'_, Vec<Option<Listener>>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The configuration this registry was built with.
    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    fn check_live(&self, table: &RegistryTable, id: DeviceId) -> Result<()> {
        let record = table
            .records
            .get(id.index())
            .ok_or_else(|| KernelError::invalid("device index out of range"))?;
        if !record.active || record.reuse != id.reuse() {
            return Err(KernelError::StaleDevice { id });
        }
        Ok(())
    }

    /// Whether `id` refers to a currently registered device generation.
    pub fn validate_id(&self, id: DeviceId) -> Result<()> {
        let table = self.table();
        self.check_live(&table, id)
    }

    /// Number of currently registered devices.
    pub fn active_count(&self) -> usize {
        self.table().active_count
    }

    // -- Registration -------------------------------------------------------

    /// Register a device under `labels`, driven by `driver`.
    ///
    /// The returned ID stays valid until the matching [`unregister`]; after
    /// that it is rejected everywhere, even if the slot is reissued.
    ///
    /// [`unregister`]: DeviceRegistry::unregister
    pub fn register(
        &self,
        instance: InstanceContext,
        labels: &[Label],
        driver: Arc<dyn DeviceDriver>,
    ) -> Result<DeviceId> {
        let label_set = LabelSet::from_slice(labels, self.inner.config.max_labels)?;

        let id = {
            let mut table = self.table();
            let index = table.next_free.ok_or(KernelError::RegistryFull)?;

            let record = &mut table.records[index];
            record.labels = label_set;
            record.instance = Some(instance);
            record.driver = Some(driver);
            record.active = true;
            let id = DeviceId::new(record.reuse, index);

            table.active_count += 1;

            // Re-derive the next-free cursor: forward cyclic scan from the
            // slot just taken.
            let slots = table.records.len();
            let mut next = index;
            let mut found = None;
            for _ in 0..slots {
                next = (next + 1) % slots;
                if !table.records[next].active {
                    found = Some(next);
                    break;
                }
            }
            table.next_free = found;
            id
        };

        self.inner.change.set(REGISTERED_BIT);
        tracing::info!(device = %id, "device registered");
        Ok(id)
    }

    /// Unregister a device, closing every still-open session through the
    /// driver first.  Returns the instance context given at registration.
    pub async fn unregister(&self, id: DeviceId) -> Result<InstanceContext> {
        {
            let table = self.table();
            self.check_live(&table, id)?;
        }

        // Drive every open session through the driver's close, one at a
        // time, re-entering the critical section between calls.
        loop {
            let closing = {
                let mut table = self.table();
                let record = &mut table.records[id.index()];
                if record.open_count == 0 {
                    break;
                }
                let open_slot = record
                    .sessions
                    .iter()
                    .position(|s| s.state == SessionState::Open);
                match open_slot {
                    Some(ses) => {
                        record.sessions[ses].state = SessionState::Locked;
                        match record.driver.clone().zip(record.sessions[ses].ctx.take()) {
                            Some((driver, ctx)) => Some((ses, driver, ctx)),
                            None => {
                                // No context to hand to the driver; reclaim
                                // the slot directly.
                                record.sessions[ses].state = SessionState::Closed;
                                record.open_count -= 1;
                                if record.next_session.is_none() {
                                    record.next_session = Some(ses);
                                }
                                continue;
                            }
                        }
                    }
                    // Remaining sessions are mid-close elsewhere; let those
                    // closes finish.
                    None => None,
                }
            };

            match closing {
                Some((ses, driver, ctx)) => {
                    if let Err(err) = driver.close(ctx).await {
                        tracing::warn!(device = %id, session = ses, error = %err,
                            "driver close failed during unregister");
                    }
                    let mut table = self.table();
                    let record = &mut table.records[id.index()];
                    record.sessions[ses].state = SessionState::Closed;
                    record.open_count -= 1;
                    if record.next_session.is_none() {
                        record.next_session = Some(ses);
                    }
                }
                None => tokio::task::yield_now().await,
            }
        }

        let instance = {
            let mut table = self.table();
            let record = &mut table.records[id.index()];
            record.active = false;
            record.reuse = next_reuse(record.reuse);
            record.labels.clear();
            record.driver = None;
            let instance = record
                .instance
                .take()
                .unwrap_or_else(|| Arc::new(()) as InstanceContext);
            table.active_count -= 1;
            if table.next_free.is_none() {
                table.next_free = Some(id.index());
            }
            instance
        };

        self.inner.change.set(UNREGISTERED_BIT);
        tracing::info!(device = %id, "device unregistered");
        Ok(instance)
    }

    // -- Lookup -------------------------------------------------------------

    /// IDs of every active device whose label set contains all of `labels`.
    ///
    /// An empty filter matches every device.  Fails with
    /// [`KernelError::ListTooSmall`] when more than `max` devices match;
    /// nothing is silently truncated.
    pub fn ids_by_labels(&self, labels: &[Label], max: usize) -> Result<Vec<DeviceId>> {
        if labels.len() > self.inner.config.max_labels {
            return Err(KernelError::invalid("label filter too long"));
        }
        if max == 0 {
            return Err(KernelError::invalid("max id count must be nonzero"));
        }

        let table = self.table();
        let mut out = Vec::new();
        let mut seen = 0usize;
        for (index, record) in table.records.iter().enumerate() {
            if seen >= table.active_count {
                break;
            }
            if !record.active {
                continue;
            }
            seen += 1;
            if record.labels.contains_all(labels) {
                if out.len() >= max {
                    return Err(KernelError::ListTooSmall {
                        needed: out.len() + 1,
                        capacity: max,
                    });
                }
                out.push(DeviceId::new(record.reuse, index));
            }
        }
        Ok(out)
    }

    /// The label list of one registered device.
    pub fn labels_of(&self, id: DeviceId, max: usize) -> Result<Vec<Label>> {
        if max == 0 {
            return Err(KernelError::invalid("max label count must be nonzero"));
        }
        let table = self.table();
        self.check_live(&table, id)?;
        let record = &table.records[id.index()];
        if record.labels.len() > max {
            return Err(KernelError::ListTooSmall {
                needed: record.labels.len(),
                capacity: max,
            });
        }
        Ok(record.labels.as_slice().to_vec())
    }

    // -- Sessions -----------------------------------------------------------

    /// Open a session on a device, passing the caller's label subset to the
    /// driver.  On driver failure the session slot is released untouched.
    pub async fn open(&self, id: DeviceId, labels: &[Label]) -> Result<DeviceHandle> {
        if labels.len() > self.inner.config.max_labels {
            return Err(KernelError::invalid("label list too long"));
        }

        let (driver, instance, ses) = {
            let mut table = self.table();
            self.check_live(&table, id)?;
            let record = &mut table.records[id.index()];
            let ses = record.next_session.ok_or(KernelError::NoFreeSession { id })?;
            record.sessions[ses].state = SessionState::Locked;

            // Re-derive the next-free session cursor, mirroring slot
            // allocation.
            let slots = record.sessions.len();
            let mut next = ses;
            let mut found = None;
            for _ in 0..slots {
                next = (next + 1) % slots;
                if record.sessions[next].state == SessionState::Closed {
                    found = Some(next);
                    break;
                }
            }
            record.next_session = found;

            let driver = record
                .driver
                .clone()
                .ok_or(KernelError::StaleDevice { id })?;
            let instance = record
                .instance
                .clone()
                .ok_or(KernelError::StaleDevice { id })?;
            (driver, instance, ses)
        };

        match driver.open(&instance, labels).await {
            Ok(ctx) => {
                let mut table = self.table();
                let record = &mut table.records[id.index()];
                record.sessions[ses].ctx = Some(ctx);
                record.sessions[ses].state = SessionState::Open;
                record.open_count += 1;
                let handle = DeviceHandle::new(id, ses);
                tracing::debug!(handle = %handle, "session opened");
                Ok(handle)
            }
            Err(err) => {
                let mut table = self.table();
                let record = &mut table.records[id.index()];
                record.sessions[ses].state = SessionState::Closed;
                record.next_session = Some(ses);
                Err(err)
            }
        }
    }

    /// Resolve `label` to device IDs and open the first one that accepts.
    pub async fn open_by_label(&self, label: Label) -> Result<DeviceHandle> {
        let ids = self.ids_by_labels(
            std::slice::from_ref(&label),
            self.inner.config.discovery_max_ids,
        )?;
        if ids.is_empty() {
            return Err(KernelError::DeviceNotFound);
        }
        let mut last = KernelError::DeviceNotFound;
        for id in ids {
            match self.open(id, std::slice::from_ref(&label)).await {
                Ok(handle) => return Ok(handle),
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    /// Close a session, waiting for its in-flight dispatches to drain before
    /// invoking the driver.
    pub async fn close(&self, handle: DeviceHandle) -> Result<()> {
        let id = handle.device_id();
        let ses = handle.session_index();
        if ses >= self.inner.config.max_sessions {
            return Err(KernelError::invalid("session index out of range"));
        }

        let (driver, ctx) = {
            let mut table = self.table();
            self.check_live(&table, id)?;
            let record = &mut table.records[id.index()];
            if record.sessions[ses].state != SessionState::Open {
                return Err(KernelError::SessionNotOpen { handle });
            }
            record.sessions[ses].state = SessionState::Locked;
            let ctx = record.sessions[ses]
                .ctx
                .clone()
                .ok_or(KernelError::SessionNotOpen { handle })?;
            let driver = record
                .driver
                .clone()
                .ok_or(KernelError::StaleDevice { id })?;
            (driver, ctx)
        };

        // Wait for in-flight read/write/control calls against this session
        // to finish.  The last one out rings the session's drain signal.
        loop {
            let drained = {
                let table = self.table();
                let session = &table.records[id.index()].sessions[ses];
                if session.in_flight == 0 {
                    break;
                }
                Arc::clone(&session.drained)
            };
            drained.notified().await;
        }

        let result = driver.close(ctx).await;

        let mut table = self.table();
        let record = &mut table.records[id.index()];
        record.sessions[ses].ctx = None;
        record.sessions[ses].state = SessionState::Closed;
        record.open_count = record.open_count.saturating_sub(1);
        if record.next_session.is_none() {
            record.next_session = Some(ses);
        }
        drop(table);

        tracing::debug!(handle = %handle, "session closed");
        result
    }

    // -- Dispatch -----------------------------------------------------------

    fn begin_dispatch(
        &self,
        handle: DeviceHandle,
    ) -> Result<(Arc<dyn DeviceDriver>, SessionContext)> {
        let id = handle.device_id();
        let ses = handle.session_index();
        if ses >= self.inner.config.max_sessions {
            return Err(KernelError::invalid("session index out of range"));
        }
        let mut table = self.table();
        self.check_live(&table, id)?;
        let record = &mut table.records[id.index()];
        if record.sessions[ses].state != SessionState::Open {
            return Err(KernelError::SessionNotOpen { handle });
        }
        let driver = record
            .driver
            .clone()
            .ok_or(KernelError::StaleDevice { id })?;
        let ctx = record.sessions[ses]
            .ctx
            .clone()
            .ok_or(KernelError::SessionNotOpen { handle })?;
        record.sessions[ses].in_flight += 1;
        Ok((driver, ctx))
    }

    fn end_dispatch(&self, handle: DeviceHandle) {
        let mut table = self.table();
        let record = &mut table.records[handle.device_id().index()];
        let session = &mut record.sessions[handle.session_index()];
        session.in_flight = session.in_flight.saturating_sub(1);
        if session.state == SessionState::Locked && session.in_flight == 0 {
            session.drained.notify_one();
        }
    }

    /// Dispatch a read to the driver; a driver without a read implementation
    /// is a no-op success.
    pub async fn read(&self, handle: DeviceHandle, buf: &mut [u8], offset: u64) -> Result<usize> {
        let (driver, ctx) = self.begin_dispatch(handle)?;
        let result = driver.read(&ctx, buf, offset).await;
        self.end_dispatch(handle);
        result
    }

    /// Dispatch a write to the driver; a driver without a write
    /// implementation is a no-op success.
    pub async fn write(&self, handle: DeviceHandle, buf: &[u8], offset: u64) -> Result<usize> {
        let (driver, ctx) = self.begin_dispatch(handle)?;
        let result = driver.write(&ctx, buf, offset).await;
        self.end_dispatch(handle);
        result
    }

    /// Dispatch a control command to the driver.
    pub async fn control(
        &self,
        handle: DeviceHandle,
        cmd: u32,
        data: &mut (dyn Any + Send),
    ) -> Result<()> {
        let (driver, ctx) = self.begin_dispatch(handle)?;
        let result = driver.control(&ctx, cmd, data).await;
        self.end_dispatch(handle);
        result
    }

    /// Run the reserved capability-negotiation control command and return
    /// the driver's command-base answer.
    pub async fn capability_base(
        &self,
        handle: DeviceHandle,
        label: Label,
        base: u32,
    ) -> Result<u32> {
        let mut query = CapabilityQuery { label, base };
        self.control(handle, CTRL_CAPABILITY_BASE, &mut query).await?;
        Ok(query.base)
    }

    // -- Change reconciliation ----------------------------------------------

    /// Diff the registry against `watch`'s known IDs.
    ///
    /// The watch's known list is replaced with the fresh match set only when
    /// something changed.
    pub fn scan_changes(&self, watch: &mut ChangeWatch) -> Result<ChangeReport> {
        let fresh = self.ids_by_labels(&watch.labels, watch.max)?;

        let added: Vec<DeviceId> = fresh
            .iter()
            .filter(|id| !watch.known.iter().any(|known| known == *id))
            .copied()
            .collect();
        let removed: Vec<DeviceId> = watch
            .known
            .iter()
            .filter(|known| !fresh.iter().any(|id| id == *known))
            .copied()
            .collect();

        if !added.is_empty() || !removed.is_empty() {
            watch.known = fresh;
        }
        Ok(ChangeReport { added, removed })
    }

    /// Like [`scan_changes`], but blocks on the registry-change signal until
    /// a change is observed or `wait` elapses.
    ///
    /// [`scan_changes`]: DeviceRegistry::scan_changes
    pub async fn wait_changes(&self, watch: &mut ChangeWatch, wait: Wait) -> Result<ChangeReport> {
        let deadline = wait.deadline();
        let mut report = self.scan_changes(watch)?;
        if matches!(wait, Wait::No) {
            return Ok(report);
        }
        while report.is_empty() {
            let remaining = match deadline {
                None => Wait::Forever,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(KernelError::Timeout);
                    }
                    Wait::For(deadline - now)
                }
            };
            self.inner.change.wait_any(REG_CHANGE_MASK, remaining).await?;
            report = self.scan_changes(watch)?;
        }
        Ok(report)
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table();
        f.debug_struct("DeviceRegistry")
            .field("max_devices", &table.records.len())
            .field("active", &table.active_count)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Change watches
// ---------------------------------------------------------------------------

/// A caller's view of "which devices matching my filter exist right now",
/// reconciled against the registry by [`DeviceRegistry::scan_changes`].
#[derive(Debug, Clone)]
pub struct ChangeWatch {
    labels: Vec<Label>,
    known: Vec<DeviceId>,
    max: usize,
}

impl ChangeWatch {
    /// Watch for devices matching `labels`, tracking at most `max` IDs.
    pub fn new(labels: &[Label], max: usize) -> Result<Self> {
        if max == 0 {
            return Err(KernelError::invalid("watch capacity must be nonzero"));
        }
        Ok(Self {
            labels: labels.to_vec(),
            known: Vec::new(),
            max,
        })
    }

    /// The currently known matching IDs (updated by each observed change).
    pub fn known(&self) -> &[DeviceId] {
        &self.known
    }
}

/// The outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeReport {
    /// Freshly matched IDs absent from the known list.
    pub added: Vec<DeviceId>,
    /// Previously known IDs that no longer match.
    pub removed: Vec<DeviceId>,
}

impl ChangeReport {
    /// Whether the pass observed no difference.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Total number of observed registry changes.
    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
