//! Ordered fan-out of listener events.
//!
//! [`ResultForwarder`] delivers every event to a list of downstream
//! listeners in order, logging and skipping any listener that fails.
//! [`ResumeResultForwarder`] is the variant installed on a resumed
//! invocation: the original invocation already announced itself, so the
//! start event is dropped and the final elapsed time is the sum across both
//! attempts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::error;

use crate::build::BuildInfo;
use crate::invoker::InvocationError;
use crate::log::StreamSource;
use crate::result::{InvocationListener, LogDataType, TestId};

/// Fans every listener event out to an ordered list of downstream listeners.
pub struct ResultForwarder {
    listeners: Vec<Arc<dyn InvocationListener>>,
}

impl ResultForwarder {
    pub fn new(listeners: Vec<Arc<dyn InvocationListener>>) -> Self {
        Self { listeners }
    }

    pub fn listeners(&self) -> &[Arc<dyn InvocationListener>] {
        &self.listeners
    }
}

macro_rules! forward_to_all {
    ($self:ident, $event:ident, $($arg:expr),*) => {
        for listener in &$self.listeners {
            if let Err(e) = listener.$event($($arg),*).await {
                error!(
                    "listener failed during {}, continuing with the rest: {e:#}",
                    stringify!($event)
                );
            }
        }
    };
}

#[async_trait]
impl InvocationListener for ResultForwarder {
    async fn invocation_started(&self, build: &BuildInfo) -> Result<()> {
        forward_to_all!(self, invocation_started, build);
        Ok(())
    }

    async fn test_run_started(&self, run_name: &str, test_count: usize) -> Result<()> {
        forward_to_all!(self, test_run_started, run_name, test_count);
        Ok(())
    }

    async fn test_started(&self, test: &TestId) -> Result<()> {
        forward_to_all!(self, test_started, test);
        Ok(())
    }

    async fn test_failed(&self, test: &TestId, trace: &str) -> Result<()> {
        forward_to_all!(self, test_failed, test, trace);
        Ok(())
    }

    async fn test_ended(&self, test: &TestId, metrics: &HashMap<String, String>) -> Result<()> {
        forward_to_all!(self, test_ended, test, metrics);
        Ok(())
    }

    async fn test_run_failed(&self, error: &str) -> Result<()> {
        forward_to_all!(self, test_run_failed, error);
        Ok(())
    }

    async fn test_run_stopped(&self, elapsed: Duration) -> Result<()> {
        forward_to_all!(self, test_run_stopped, elapsed);
        Ok(())
    }

    async fn test_run_ended(
        &self,
        elapsed: Duration,
        metrics: &HashMap<String, String>,
    ) -> Result<()> {
        forward_to_all!(self, test_run_ended, elapsed, metrics);
        Ok(())
    }

    async fn test_log(
        &self,
        name: &str,
        kind: LogDataType,
        stream: &dyn StreamSource,
    ) -> Result<()> {
        forward_to_all!(self, test_log, name, kind, stream);
        Ok(())
    }

    async fn invocation_failed(&self, cause: &InvocationError) -> Result<()> {
        forward_to_all!(self, invocation_failed, cause);
        Ok(())
    }

    async fn invocation_ended(&self, elapsed: Duration) -> Result<()> {
        forward_to_all!(self, invocation_ended, elapsed);
        Ok(())
    }
}

/// Forwarder installed on a resumed invocation.
///
/// Drops `invocation_started` (the failed attempt already delivered it) and
/// reports `invocation_ended` with the elapsed time of both attempts summed.
pub struct ResumeResultForwarder {
    inner: ResultForwarder,
    previous_elapsed: Duration,
}

impl ResumeResultForwarder {
    pub fn new(listeners: Vec<Arc<dyn InvocationListener>>, previous_elapsed: Duration) -> Self {
        Self {
            inner: ResultForwarder::new(listeners),
            previous_elapsed,
        }
    }
}

#[async_trait]
impl InvocationListener for ResumeResultForwarder {
    async fn invocation_started(&self, _build: &BuildInfo) -> Result<()> {
        // Already announced by the failed attempt.
        Ok(())
    }

    async fn test_run_started(&self, run_name: &str, test_count: usize) -> Result<()> {
        self.inner.test_run_started(run_name, test_count).await
    }

    async fn test_started(&self, test: &TestId) -> Result<()> {
        self.inner.test_started(test).await
    }

    async fn test_failed(&self, test: &TestId, trace: &str) -> Result<()> {
        self.inner.test_failed(test, trace).await
    }

    async fn test_ended(&self, test: &TestId, metrics: &HashMap<String, String>) -> Result<()> {
        self.inner.test_ended(test, metrics).await
    }

    async fn test_run_failed(&self, error: &str) -> Result<()> {
        self.inner.test_run_failed(error).await
    }

    async fn test_run_stopped(&self, elapsed: Duration) -> Result<()> {
        self.inner.test_run_stopped(elapsed).await
    }

    async fn test_run_ended(
        &self,
        elapsed: Duration,
        metrics: &HashMap<String, String>,
    ) -> Result<()> {
        self.inner.test_run_ended(elapsed, metrics).await
    }

    async fn test_log(
        &self,
        name: &str,
        kind: LogDataType,
        stream: &dyn StreamSource,
    ) -> Result<()> {
        self.inner.test_log(name, kind, stream).await
    }

    async fn invocation_failed(&self, cause: &InvocationError) -> Result<()> {
        self.inner.invocation_failed(cause).await
    }

    async fn invocation_ended(&self, elapsed: Duration) -> Result<()> {
        self.inner
            .invocation_ended(self.previous_elapsed + elapsed)
            .await
    }
}
