//! Device-side contracts consumed by the invocation engine.
//!
//! Device acquisition, recovery, and telemetry live outside this crate; the
//! engine only calls the contracts below.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::log::StreamSource;

/// The target device was lost or stopped responding.
#[derive(Debug, Clone, thiserror::Error)]
#[error("device {serial} became unavailable: {reason}")]
pub struct DeviceNotAvailableError {
    serial: String,
    reason: String,
}

impl DeviceNotAvailableError {
    pub fn new(serial: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            reason: reason.into(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }
}

/// Per-invocation device tuning applied before target preparation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceOptions {
    /// Whether to capture the device log for the duration of the invocation.
    pub enable_logcat: bool,
    /// Cap on the captured device log, in bytes.
    pub max_logcat_size_bytes: u64,
    /// How long to wait for the device to come online during setup.
    pub online_timeout: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            enable_logcat: true,
            max_logcat_size_bytes: 20 * 1024 * 1024,
            online_timeout: Duration::from_secs(60),
        }
    }
}

/// Strategy for bringing a lost device back, chosen per configuration.
#[async_trait]
pub trait DeviceRecovery: Send + Sync {
    async fn recover(&self, device: &dyn TestDevice) -> Result<(), DeviceNotAvailableError>;
}

/// A recovery strategy that does nothing (for tests or expendable devices).
pub struct NullDeviceRecovery;

#[async_trait]
impl DeviceRecovery for NullDeviceRecovery {
    async fn recover(&self, _device: &dyn TestDevice) -> Result<(), DeviceNotAvailableError> {
        Ok(())
    }
}

/// One attached target device.
#[async_trait]
pub trait TestDevice: Send + Sync {
    /// The device's serial number.
    fn serial_number(&self) -> &str;

    /// Installs the recovery strategy used when the device drops mid-run.
    fn set_recovery(&self, recovery: Arc<dyn DeviceRecovery>);

    /// Applies per-invocation device options.
    async fn set_options(&self, options: &DeviceOptions) -> Result<(), DeviceNotAvailableError>;

    /// A source over the device log captured so far, if capture is enabled.
    async fn logcat(&self) -> Option<Box<dyn StreamSource>>;

    /// Captures a bug report from the device.
    async fn bugreport(&self) -> Box<dyn StreamSource>;
}
