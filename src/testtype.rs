//! Remote test contracts and their optional capabilities.
//!
//! A [`RemoteTest`] is the unit of work the engine runs. Capabilities are
//! opt-in: a test advertises each one it supports through a probe method
//! returning `Some(self)`, and the engine dispatches on the probes rather
//! than on concrete types. Any combination of capabilities is valid.
//!
//! Tests are shared as `Arc<dyn RemoteTest>` between the original and any
//! cloned configurations, so a resumed invocation re-runs the same test
//! objects and picks up whatever progress state they carry. Implementations
//! own their interior mutability.

use std::sync::Arc;

use async_trait::async_trait;

use crate::build::BuildInfo;
use crate::device::{DeviceNotAvailableError, TestDevice};
use crate::result::InvocationListener;

/// Failure modes of [`RemoteTest::run`].
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    #[error(transparent)]
    DeviceNotAvailable(#[from] DeviceNotAvailableError),

    /// Anything outside the test's expected failure vocabulary.
    #[error("test faulted unexpectedly: {0}")]
    Unexpected(#[from] anyhow::Error),
}

/// One runnable test, reporting its results to a listener.
#[async_trait]
pub trait RemoteTest: Send + Sync {
    /// Runs the test, streaming events to `listener`.
    async fn run(&self, listener: &dyn InvocationListener) -> Result<(), TestError>;

    /// This test accepts the build under test before running.
    fn as_build_receiver(&self) -> Option<&dyn BuildReceiver> {
        None
    }

    /// This test needs the target device before running.
    fn as_device_test(&self) -> Option<&dyn DeviceTest> {
        None
    }

    /// This test may split itself into independently schedulable shards.
    fn as_shardable(&self) -> Option<&dyn ShardableTest> {
        None
    }

    /// This test can continue a previous, interrupted run.
    fn as_resumable(&self) -> Option<&dyn ResumableTest> {
        None
    }
}

/// Accepts the build under test.
pub trait BuildReceiver: Send + Sync {
    fn set_build(&self, build: BuildInfo);
}

/// Accepts the target device.
pub trait DeviceTest: Send + Sync {
    fn set_device(&self, device: Arc<dyn TestDevice>);
}

/// May split into independently schedulable children.
pub trait ShardableTest: Send + Sync {
    /// Splits the test. `Some` with a non-empty collection means the children
    /// replace this test and run as separate shards; `None` or an empty
    /// collection leaves the test in place.
    fn split(&self) -> Option<Vec<Arc<dyn RemoteTest>>>;
}

/// May report whether an interrupted run can be continued.
pub trait ResumableTest: Send + Sync {
    fn is_resumable(&self) -> bool;
}
