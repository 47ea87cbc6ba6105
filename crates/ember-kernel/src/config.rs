//! Externally supplied kernel configuration.
//!
//! The registry consumes these limits; it never produces or persists them.
//! Platform integration code typically deserializes the table from its build
//! configuration and hands it to [`DeviceRegistry::new`].
//!
//! [`DeviceRegistry::new`]: crate::registry::DeviceRegistry::new

use serde::Deserialize;

use crate::error::{KernelError, Result};
use crate::id;

/// Static limits for the device registry and discovery subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Maximum number of simultaneously registered devices (registry slots).
    pub max_devices: usize,

    /// Maximum labels a single device may carry.
    pub max_labels: usize,

    /// Maximum concurrently open sessions per device.
    pub max_sessions: usize,

    /// Maximum registration-change listeners.
    pub max_listeners: usize,

    /// Whether the background discovery task is available.  When `false`,
    /// starting a listener performs one synchronous registry scan instead.
    pub discovery_task: bool,

    /// Upper bound on device IDs tracked per listener / change watch.
    pub discovery_max_ids: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_devices: 32,
            max_labels: 8,
            max_sessions: 8,
            max_listeners: 16,
            discovery_task: true,
            discovery_max_ids: 16,
        }
    }
}

impl KernelConfig {
    /// Check that every limit fits the identifier bit fields.
    pub fn validate(&self) -> Result<()> {
        if self.max_devices == 0 || self.max_devices > id::MAX_DEVICE_SLOTS {
            return Err(KernelError::invalid(format!(
                "max_devices must be in 1..={}",
                id::MAX_DEVICE_SLOTS
            )));
        }
        if self.max_sessions == 0 || self.max_sessions > id::MAX_SESSION_SLOTS {
            return Err(KernelError::invalid(format!(
                "max_sessions must be in 1..={}",
                id::MAX_SESSION_SLOTS
            )));
        }
        if self.max_labels == 0 {
            return Err(KernelError::invalid("max_labels must be nonzero"));
        }
        if self.max_listeners == 0 {
            return Err(KernelError::invalid("max_listeners must be nonzero"));
        }
        if self.discovery_max_ids == 0 {
            return Err(KernelError::invalid("discovery_max_ids must be nonzero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        KernelConfig::default().validate().expect("defaults");
    }

    #[test]
    fn rejects_out_of_range_limits() {
        let cfg = KernelConfig {
            max_devices: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = KernelConfig {
            max_devices: id::MAX_DEVICE_SLOTS + 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = KernelConfig {
            max_sessions: id::MAX_SESSION_SLOTS + 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_from_toml() {
        let cfg: KernelConfig = toml::from_str(
            r#"
            max_devices = 8
            max_sessions = 2
            discovery_task = false
            "#,
        )
        .expect("parse");

        assert_eq!(cfg.max_devices, 8);
        assert_eq!(cfg.max_sessions, 2);
        assert!(!cfg.discovery_task);
        // Unspecified fields fall back to defaults.
        assert_eq!(cfg.max_labels, KernelConfig::default().max_labels);
        cfg.validate().expect("valid");
    }

    #[test]
    fn rejects_unknown_fields() {
        let result: std::result::Result<KernelConfig, _> =
            toml::from_str("max_gadgets = 4\n");
        assert!(result.is_err());
    }
}
