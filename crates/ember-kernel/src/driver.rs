//! The driver-facing dispatch interface.
//!
//! Every device registers a [`DeviceDriver`] implementation.  `open`, `close`
//! and `control` are mandatory; `read` and `write` have default no-op
//! implementations for devices that do not move bulk data.  The registry
//! never invokes a callback while holding its internal lock, so a driver is
//! free to block or await inside any of these methods.
//!
//! # Capability negotiation
//!
//! Control command [`CTRL_CAPABILITY_BASE`] (code 0) is reserved: the caller
//! passes a [`CapabilityQuery`] naming one of the driver's labels, and the
//! driver answers by writing the base offset of its private command namespace
//! into the query when the label matches and the open mode permits it.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::label::Label;

/// Opaque per-device state supplied at registration and returned by
/// unregistration.
pub type InstanceContext = Arc<dyn Any + Send + Sync>;

/// Opaque per-open state returned by a driver's `open` and passed back to
/// every subsequent dispatch on that session.
pub type SessionContext = Arc<dyn Any + Send + Sync>;

/// Reserved control command: capability / command-base negotiation.
pub const CTRL_CAPABILITY_BASE: u32 = 0;

/// Payload of the reserved capability-negotiation control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityQuery {
    /// The capability label the caller wants a command base for.
    pub label: Label,
    /// In: the value offsets are taken from.  Out: the driver's answer.
    pub base: u32,
}

/// Callback table implemented by every registered device driver.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Open one session.  Receives the label subset the caller opened with
    /// and returns the session context for later dispatches.
    async fn open(&self, instance: &InstanceContext, labels: &[Label]) -> Result<SessionContext>;

    /// Close one session, consuming its context.
    async fn close(&self, session: SessionContext) -> Result<()>;

    /// Read into `buf` starting at `offset`; returns bytes read.
    ///
    /// Optional; the default is a no-op success.
    async fn read(&self, session: &SessionContext, buf: &mut [u8], offset: u64) -> Result<usize> {
        let _ = (session, buf, offset);
        Ok(0)
    }

    /// Write from `buf` starting at `offset`; returns bytes written.
    ///
    /// Optional; the default is a no-op success.
    async fn write(&self, session: &SessionContext, buf: &[u8], offset: u64) -> Result<usize> {
        let _ = (session, buf, offset);
        Ok(0)
    }

    /// Device-specific control command.  `cmd` 0 is reserved for
    /// [`CapabilityQuery`] negotiation; a driver's private commands start at
    /// the base it reports there.
    async fn control(
        &self,
        session: &SessionContext,
        cmd: u32,
        data: &mut (dyn Any + Send),
    ) -> Result<()>;
}

/// A driver whose every operation succeeds without doing anything.
///
/// Used by subsystems that register a device purely to obtain a validated,
/// reuse-protected device ID (notification senders).
#[derive(Debug, Default)]
pub struct InertDriver;

#[async_trait]
impl DeviceDriver for InertDriver {
    async fn open(&self, _instance: &InstanceContext, _labels: &[Label]) -> Result<SessionContext> {
        Ok(Arc::new(()))
    }

    async fn close(&self, _session: SessionContext) -> Result<()> {
        Ok(())
    }

    async fn control(
        &self,
        _session: &SessionContext,
        _cmd: u32,
        _data: &mut (dyn Any + Send),
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inert_driver_round_trip() {
        let driver = InertDriver;
        let instance: InstanceContext = Arc::new(());
        let session = driver
            .open(&instance, &[Label::new("x").expect("label")])
            .await
            .expect("open");

        // Defaults: read and write are no-op successes.
        let mut buf = [0u8; 4];
        assert_eq!(driver.read(&session, &mut buf, 0).await.expect("read"), 0);
        assert_eq!(driver.write(&session, &buf, 0).await.expect("write"), 0);

        let mut query = CapabilityQuery {
            label: Label::new("x").expect("label"),
            base: 0,
        };
        driver
            .control(&session, CTRL_CAPABILITY_BASE, &mut query)
            .await
            .expect("control");

        driver.close(session).await.expect("close");
    }
}
