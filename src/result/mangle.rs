//! A proxy listener that rewrites identifiers on their way downstream.
//!
//! Useful when one invocation replays results under different names, e.g.
//! prefixing run names with a configuration variant. Hooks default to the
//! identity; they must return new values and leave the originals untouched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::build::BuildInfo;
use crate::invoker::InvocationError;
use crate::log::StreamSource;
use crate::result::{InvocationListener, LogDataType, TestId};

/// Rewriting hooks applied by a [`NameMangleListener`].
pub trait NameMangler: Send + Sync {
    /// Applied to every [`TestId`] passing through.
    fn mangle_test_id(&self, test: &TestId) -> TestId {
        test.clone()
    }

    /// Applied to every run name passing through.
    fn mangle_run_name(&self, name: &str) -> String {
        name.to_owned()
    }

    /// Applied to the build announced by `invocation_started`.
    fn mangle_build_info(&self, build: &BuildInfo) -> BuildInfo {
        build.clone()
    }
}

/// Interposes a [`NameMangler`] between an event source and a downstream
/// listener; events without a mangled payload pass through unchanged.
pub struct NameMangleListener<M> {
    mangler: M,
    listener: Arc<dyn InvocationListener>,
}

impl<M: NameMangler> NameMangleListener<M> {
    pub fn new(mangler: M, listener: Arc<dyn InvocationListener>) -> Self {
        Self { mangler, listener }
    }
}

#[async_trait]
impl<M: NameMangler> InvocationListener for NameMangleListener<M> {
    async fn invocation_started(&self, build: &BuildInfo) -> Result<()> {
        let mangled = self.mangler.mangle_build_info(build);
        self.listener.invocation_started(&mangled).await
    }

    async fn test_run_started(&self, run_name: &str, test_count: usize) -> Result<()> {
        let mangled = self.mangler.mangle_run_name(run_name);
        self.listener.test_run_started(&mangled, test_count).await
    }

    async fn test_started(&self, test: &TestId) -> Result<()> {
        let mangled = self.mangler.mangle_test_id(test);
        self.listener.test_started(&mangled).await
    }

    async fn test_failed(&self, test: &TestId, trace: &str) -> Result<()> {
        let mangled = self.mangler.mangle_test_id(test);
        self.listener.test_failed(&mangled, trace).await
    }

    async fn test_ended(&self, test: &TestId, metrics: &HashMap<String, String>) -> Result<()> {
        let mangled = self.mangler.mangle_test_id(test);
        self.listener.test_ended(&mangled, metrics).await
    }

    async fn test_run_failed(&self, error: &str) -> Result<()> {
        self.listener.test_run_failed(error).await
    }

    async fn test_run_stopped(&self, elapsed: Duration) -> Result<()> {
        self.listener.test_run_stopped(elapsed).await
    }

    async fn test_run_ended(
        &self,
        elapsed: Duration,
        metrics: &HashMap<String, String>,
    ) -> Result<()> {
        self.listener.test_run_ended(elapsed, metrics).await
    }

    async fn test_log(
        &self,
        name: &str,
        kind: LogDataType,
        stream: &dyn StreamSource,
    ) -> Result<()> {
        self.listener.test_log(name, kind, stream).await
    }

    async fn invocation_failed(&self, cause: &InvocationError) -> Result<()> {
        self.listener.invocation_failed(cause).await
    }

    async fn invocation_ended(&self, elapsed: Duration) -> Result<()> {
        self.listener.invocation_ended(elapsed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{Event, RecordingListener};

    struct PrefixMangler;

    impl NameMangler for PrefixMangler {
        fn mangle_test_id(&self, test: &TestId) -> TestId {
            TestId::new(
                format!("variant.{}", test.class_name()),
                test.test_name(),
            )
        }

        fn mangle_run_name(&self, name: &str) -> String {
            format!("variant.{name}")
        }
    }

    #[tokio::test]
    async fn rewrites_test_ids_and_run_names() {
        let downstream = Arc::new(RecordingListener::new());
        let mangler = NameMangleListener::new(PrefixMangler, downstream.clone());

        let original = TestId::new("Suite", "case");
        mangler.test_run_started("run", 1).await.unwrap();
        mangler.test_started(&original).await.unwrap();

        let events = downstream.events();
        assert!(matches!(
            &events[0],
            Event::TestRunStarted { name, .. } if name == "variant.run"
        ));
        assert!(matches!(
            &events[1],
            Event::TestStarted(id) if id.to_string() == "variant.Suite#case"
        ));
        // The caller's id is untouched.
        assert_eq!(original.to_string(), "Suite#case");
    }

    #[tokio::test]
    async fn identity_mangler_passes_everything_through() {
        struct Identity;
        impl NameMangler for Identity {}

        let downstream = Arc::new(RecordingListener::new());
        let mangler = NameMangleListener::new(Identity, downstream.clone());

        let build = BuildInfo::new("17", "smoke", "rig");
        mangler.invocation_started(&build).await.unwrap();
        mangler
            .invocation_ended(Duration::from_millis(3))
            .await
            .unwrap();

        assert_eq!(downstream.started_count(), 1);
        assert_eq!(downstream.ended_count(), 1);
    }
}
