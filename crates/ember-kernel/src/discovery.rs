//! Registration-change listeners and the background discovery task.
//!
//! A listener is a label filter plus register/unregister callbacks.  The
//! discovery task blocks on the registry-change signal (device registered,
//! device unregistered, or listener table changed) and, on every wake,
//! re-reconciles each live listener's known-ID set against the registry,
//! firing its callbacks once per changed device in scan order.  Starting a
//! listener immediately requests a rescan, so devices that matched *before*
//! the listener existed are still reported.
//!
//! When the discovery task is disabled by configuration, starting a listener
//! degrades to one synchronous scan-and-dispatch.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::{KernelError, Result};
use crate::id::DeviceId;
use crate::label::Label;
use crate::registry::{
    ChangeWatch, DeviceRegistry, REG_CHANGE_MASK, SCAN_BIT, SHUTDOWN_BIT,
};
use crate::signal::Wait;

/// Callback invoked with the ID of a device that started or stopped
/// matching a listener's filter.
pub type DeviceCallback = Arc<dyn Fn(DeviceId) + Send + Sync>;

/// Identifies one live listener for [`DeviceRegistry::listen_stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(pub(crate) usize);

pub(crate) struct Listener {
    watch: ChangeWatch,
    on_register: Option<DeviceCallback>,
    on_unregister: Option<DeviceCallback>,
}

impl DeviceRegistry {
    /// Start listening for registration changes on `labels`.
    ///
    /// At least one callback must be supplied.  With the discovery task
    /// enabled, the listener is stored and a rescan is requested; without
    /// it, the registry is scanned once right here, the register callback
    /// fires for each current match, and [`KernelError::DeviceNotFound`] is
    /// reported when nothing matches.
    pub fn listen_start(
        &self,
        labels: &[Label],
        on_register: Option<DeviceCallback>,
        on_unregister: Option<DeviceCallback>,
    ) -> Result<ListenerId> {
        if on_register.is_none() && on_unregister.is_none() {
            return Err(KernelError::invalid("listener needs at least one callback"));
        }
        if labels.len() > self.inner.config.max_labels {
            return Err(KernelError::invalid("label filter too long"));
        }

        if !self.inner.config.discovery_task {
            let ids = self.ids_by_labels(labels, self.inner.config.discovery_max_ids)?;
            if ids.is_empty() {
                return Err(KernelError::DeviceNotFound);
            }
            if let Some(callback) = &on_register {
                for id in &ids {
                    callback(*id);
                }
            }
            return Ok(ListenerId(0));
        }

        let slot = {
            let mut listeners = self.listeners();
            let slot = listeners
                .iter()
                .position(Option::is_none)
                .ok_or(KernelError::ListenerTableFull)?;
            listeners[slot] = Some(Listener {
                watch: ChangeWatch::new(labels, self.inner.config.discovery_max_ids)?,
                on_register,
                on_unregister,
            });
            slot
        };

        // Ask the discovery task to report already-registered matches.
        self.inner.change.set(SCAN_BIT);
        tracing::debug!(listener = slot, "listener started");
        Ok(ListenerId(slot))
    }

    /// Stop a listener, freeing its slot.
    pub fn listen_stop(&self, listener: ListenerId) -> Result<()> {
        let mut listeners = self.listeners();
        let slot = listeners
            .get_mut(listener.0)
            .ok_or(KernelError::ListenerNotFound)?;
        if slot.take().is_none() {
            return Err(KernelError::ListenerNotFound);
        }
        tracing::debug!(listener = listener.0, "listener stopped");
        Ok(())
    }

    /// Spawn the background discovery task.
    ///
    /// Returns `None` when the task is disabled by configuration, otherwise
    /// a handle that resolves after [`stop_discovery`].
    ///
    /// [`stop_discovery`]: DeviceRegistry::stop_discovery
    pub fn start_discovery(&self) -> Option<JoinHandle<()>> {
        if !self.inner.config.discovery_task {
            return None;
        }
        let registry = self.clone();
        Some(tokio::spawn(async move {
            tracing::info!("discovery task started");
            registry.discovery_loop().await;
            tracing::info!("discovery task stopped");
        }))
    }

    /// Signal the discovery task to exit after its current sweep.
    pub fn stop_discovery(&self) {
        self.inner.change.set(SHUTDOWN_BIT);
    }

    async fn discovery_loop(&self) {
        loop {
            let bits = match self
                .inner
                .change
                .wait_any(REG_CHANGE_MASK | SCAN_BIT | SHUTDOWN_BIT, Wait::Forever)
                .await
            {
                Ok(bits) => bits,
                Err(_) => break,
            };
            if bits & SHUTDOWN_BIT != 0 {
                break;
            }
            self.run_listeners();
        }
    }

    /// Reconcile every live listener and fire callbacks for what changed.
    /// Reconciliation happens under the listener lock; callbacks run after
    /// it is released, per listener in scan order.
    fn run_listeners(&self) {
        type Pending = (
            Option<DeviceCallback>,
            Vec<DeviceId>,
            Option<DeviceCallback>,
            Vec<DeviceId>,
        );
        let mut pending: Vec<Pending> = Vec::new();
        {
            let mut listeners = self.listeners();
            for entry in listeners.iter_mut() {
                let Some(listener) = entry else { continue };
                match self.scan_changes(&mut listener.watch) {
                    Ok(report) if !report.is_empty() => {
                        pending.push((
                            listener.on_register.clone(),
                            report.added,
                            listener.on_unregister.clone(),
                            report.removed,
                        ));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "listener reconciliation failed");
                    }
                }
            }
        }

        for (on_register, added, on_unregister, removed) in pending {
            if let Some(callback) = on_register {
                for id in added {
                    callback(id);
                }
            }
            if let Some(callback) = on_unregister {
                for id in removed {
                    callback(id);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::driver::InertDriver;
    use std::sync::Mutex;
    use std::time::Duration;

    fn label(tag: &str) -> Label {
        Label::new(tag).expect("label")
    }

    fn registry(discovery: bool) -> DeviceRegistry {
        DeviceRegistry::new(KernelConfig {
            max_devices: 8,
            max_listeners: 2,
            discovery_task: discovery,
            ..Default::default()
        })
        .expect("registry")
    }

    fn recorder() -> (DeviceCallback, Arc<Mutex<Vec<DeviceId>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: DeviceCallback = Arc::new(move |id| {
            sink.lock().expect("record callback").push(id);
        });
        (callback, seen)
    }

    #[tokio::test]
    async fn listener_sees_registration_and_unregistration_once() {
        let registry = registry(true);
        let task = registry.start_discovery().expect("task enabled");

        let (on_register, registered) = recorder();
        let (on_unregister, unregistered) = recorder();
        registry
            .listen_start(&[label("Y")], Some(on_register), Some(on_unregister))
            .expect("listen");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let id = registry
            .register(Arc::new(()), &[label("Y")], Arc::new(InertDriver))
            .expect("register");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registered.lock().expect("lock").as_slice(), &[id]);
        assert!(unregistered.lock().expect("lock").is_empty());

        registry.unregister(id).await.expect("unregister");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registered.lock().expect("lock").as_slice(), &[id]);
        assert_eq!(unregistered.lock().expect("lock").as_slice(), &[id]);

        registry.stop_discovery();
        task.await.expect("task exit");
    }

    #[tokio::test]
    async fn preexisting_devices_are_reported_on_listen_start() {
        let registry = registry(true);
        let id = registry
            .register(Arc::new(()), &[label("early")], Arc::new(InertDriver))
            .expect("register");

        let task = registry.start_discovery().expect("task enabled");
        let (on_register, registered) = recorder();
        registry
            .listen_start(&[label("early")], Some(on_register), None)
            .expect("listen");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(registered.lock().expect("lock").as_slice(), &[id]);

        registry.stop_discovery();
        task.await.expect("task exit");
    }

    #[tokio::test]
    async fn listener_table_capacity_is_bounded() {
        let registry = registry(true);
        let (cb, _) = recorder();
        let a = registry
            .listen_start(&[label("a")], Some(Arc::clone(&cb)), None)
            .expect("first");
        registry
            .listen_start(&[label("b")], Some(Arc::clone(&cb)), None)
            .expect("second");
        assert_eq!(
            registry.listen_start(&[label("c")], Some(Arc::clone(&cb)), None),
            Err(KernelError::ListenerTableFull)
        );

        // Stopping one frees its slot for the next listener.
        registry.listen_stop(a).expect("stop");
        registry
            .listen_start(&[label("c")], Some(cb), None)
            .expect("third");
        assert_eq!(registry.listen_stop(a), Err(KernelError::ListenerNotFound));
    }

    #[tokio::test]
    async fn listener_requires_a_callback() {
        let registry = registry(true);
        assert!(registry.listen_start(&[label("x")], None, None).is_err());
    }

    #[tokio::test]
    async fn synchronous_fallback_dispatches_immediately() {
        let registry = registry(false);
        assert!(registry.start_discovery().is_none());

        let (on_register, registered) = recorder();
        assert_eq!(
            registry.listen_start(&[label("m")], Some(Arc::clone(&on_register)), None),
            Err(KernelError::DeviceNotFound)
        );

        let id = registry
            .register(Arc::new(()), &[label("m")], Arc::new(InertDriver))
            .expect("register");
        registry
            .listen_start(&[label("m")], Some(on_register), None)
            .expect("listen");
        assert_eq!(registered.lock().expect("lock").as_slice(), &[id]);
    }
}
