//! Result listeners and the event vocabulary of an invocation.
//!
//! An [`InvocationListener`] receives the event stream of one logical
//! invocation. The stream is strict: exactly one `invocation_started`, any
//! number of run/test/log events, at most one `invocation_failed`, and
//! exactly one `invocation_ended` — and the engine preserves that shape
//! across sharding, resume, and every failure path.
//!
//! Listener callbacks return [`anyhow::Result`]; a failing listener is
//! logged and skipped by whoever fans events out, never allowed to take the
//! invocation down.

pub mod console;
pub mod forwarder;
pub mod mangle;
pub mod shard;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::build::BuildInfo;
use crate::invoker::InvocationError;
use crate::log::StreamSource;

pub use console::ConsoleListener;
pub use forwarder::{ResultForwarder, ResumeResultForwarder};
pub use mangle::{NameMangleListener, NameMangler};
pub use shard::{ShardAggregator, ShardListener};

/// Identifies one test case within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestId {
    class_name: String,
    test_name: String,
}

impl TestId {
    pub fn new(class_name: impl Into<String>, test_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            test_name: test_name.into(),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class_name, self.test_name)
    }
}

/// Format of a log attachment delivered through [`InvocationListener::test_log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogDataType {
    Text,
    Xml,
    Png,
    Zip,
}

impl fmt::Display for LogDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogDataType::Text => "text",
            LogDataType::Xml => "xml",
            LogDataType::Png => "png",
            LogDataType::Zip => "zip",
        };
        f.write_str(name)
    }
}

/// Sink for the event stream of one logical invocation.
///
/// All callbacks default to no-ops so implementations only override the
/// events they care about.
#[async_trait]
pub trait InvocationListener: Send + Sync {
    /// The invocation has started against the given build.
    async fn invocation_started(&self, _build: &BuildInfo) -> Result<()> {
        Ok(())
    }

    /// A test run within the invocation has started.
    async fn test_run_started(&self, _run_name: &str, _test_count: usize) -> Result<()> {
        Ok(())
    }

    async fn test_started(&self, _test: &TestId) -> Result<()> {
        Ok(())
    }

    async fn test_failed(&self, _test: &TestId, _trace: &str) -> Result<()> {
        Ok(())
    }

    async fn test_ended(&self, _test: &TestId, _metrics: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    async fn test_run_failed(&self, _error: &str) -> Result<()> {
        Ok(())
    }

    async fn test_run_stopped(&self, _elapsed: Duration) -> Result<()> {
        Ok(())
    }

    async fn test_run_ended(
        &self,
        _elapsed: Duration,
        _metrics: &HashMap<String, String>,
    ) -> Result<()> {
        Ok(())
    }

    /// A log attachment associated with the invocation.
    ///
    /// The stream stays valid for the duration of the call only; the caller
    /// cancels it once every listener has seen it.
    async fn test_log(
        &self,
        _name: &str,
        _kind: LogDataType,
        _stream: &dyn StreamSource,
    ) -> Result<()> {
        Ok(())
    }

    /// The invocation failed. Emitted at most once, before `invocation_ended`.
    async fn invocation_failed(&self, _cause: &InvocationError) -> Result<()> {
        Ok(())
    }

    /// The invocation completed. Always the final event.
    async fn invocation_ended(&self, _elapsed: Duration) -> Result<()> {
        Ok(())
    }
}
