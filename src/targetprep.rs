//! Target preparation contracts.
//!
//! Preparers run in order before the tests, flashing builds, pushing files,
//! or otherwise shaping the device. Their failures split three ways, and the
//! engine routes each differently: a [`BuildError`] means the build itself
//! was rejected, a [`TargetSetupError`] means the environment could not be
//! set up, and device loss propagates as usual.

use async_trait::async_trait;

use crate::build::BuildInfo;
use crate::device::{DeviceNotAvailableError, TestDevice};

/// The target rejected the build under test.
///
/// The build was exercised far enough to be refused, so the engine does not
/// report it as untested.
#[derive(Debug, thiserror::Error)]
#[error("build {build_id} rejected by target: {reason}")]
pub struct BuildError {
    build_id: String,
    reason: String,
}

impl BuildError {
    pub fn new(build_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            reason: reason.into(),
        }
    }
}

/// The test environment could not be set up.
#[derive(Debug, thiserror::Error)]
#[error("target setup failed: {reason}")]
pub struct TargetSetupError {
    reason: String,
}

impl TargetSetupError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Failure modes of [`TargetPreparer::set_up`].
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    TargetSetup(#[from] TargetSetupError),

    #[error(transparent)]
    DeviceNotAvailable(#[from] DeviceNotAvailableError),
}

/// Prepares the target device for a test run.
#[async_trait]
pub trait TargetPreparer: Send + Sync {
    async fn set_up(&self, device: &dyn TestDevice, build: &BuildInfo) -> Result<(), SetupError>;
}
