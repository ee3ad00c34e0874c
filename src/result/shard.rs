//! Aggregation of sharded sub-invocations into one logical invocation.
//!
//! When the engine shards a configuration, each shard runs under its own
//! [`ShardListener`], all pointing at one shared [`ShardAggregator`]. The
//! aggregator forwards `invocation_started` once, counts shard completions,
//! and forwards `invocation_ended` with the summed elapsed time when the
//! last shard finishes. Within a shard, event order is preserved; across
//! shards it is not, except that a completed test run is always replayed
//! downstream as one contiguous block.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::error;

use crate::build::BuildInfo;
use crate::invoker::InvocationError;
use crate::log::StreamSource;
use crate::result::{InvocationListener, LogDataType, TestId};

/// Buffered form of the run-scoped events a [`ShardListener`] replays.
#[derive(Debug, Clone)]
enum RunEvent {
    RunStarted {
        name: String,
        count: usize,
    },
    TestStarted(TestId),
    TestFailed {
        test: TestId,
        trace: String,
    },
    TestEnded {
        test: TestId,
        metrics: HashMap<String, String>,
    },
    RunFailed(String),
    RunStopped(Duration),
    RunEnded {
        elapsed: Duration,
        metrics: HashMap<String, String>,
    },
}

struct AggregateState {
    started_emitted: bool,
    shards_finished: usize,
    total_elapsed: Duration,
}

/// Joins `expected_shards` sub-invocations into one logical invocation for
/// the downstream listeners.
pub struct ShardAggregator {
    listeners: Vec<Arc<dyn InvocationListener>>,
    expected_shards: usize,
    state: Mutex<AggregateState>,
}

impl ShardAggregator {
    pub fn new(listeners: Vec<Arc<dyn InvocationListener>>, expected_shards: usize) -> Self {
        Self {
            listeners,
            expected_shards,
            state: Mutex::new(AggregateState {
                started_emitted: false,
                shards_finished: 0,
                total_elapsed: Duration::ZERO,
            }),
        }
    }

    /// Delivers one buffered event to every downstream listener.
    async fn deliver(&self, event: &RunEvent) {
        for listener in &self.listeners {
            let result = match event {
                RunEvent::RunStarted { name, count } => {
                    listener.test_run_started(name, *count).await
                }
                RunEvent::TestStarted(test) => listener.test_started(test).await,
                RunEvent::TestFailed { test, trace } => listener.test_failed(test, trace).await,
                RunEvent::TestEnded { test, metrics } => listener.test_ended(test, metrics).await,
                RunEvent::RunFailed(message) => listener.test_run_failed(message).await,
                RunEvent::RunStopped(elapsed) => listener.test_run_stopped(*elapsed).await,
                RunEvent::RunEnded { elapsed, metrics } => {
                    listener.test_run_ended(*elapsed, metrics).await
                }
            };
            if let Err(e) = result {
                error!("downstream listener failed during shard replay: {e:#}");
            }
        }
    }

    /// Replays one shard's completed run as a contiguous block.
    ///
    /// The aggregate lock is held across the whole replay so runs from
    /// different shards can never interleave downstream.
    async fn replay_run(&self, events: Vec<RunEvent>) {
        let _state = self.state.lock().await;
        for event in &events {
            self.deliver(event).await;
        }
    }
}

#[async_trait]
impl InvocationListener for ShardAggregator {
    async fn invocation_started(&self, build: &BuildInfo) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.started_emitted {
            return Ok(());
        }
        state.started_emitted = true;
        for listener in &self.listeners {
            if let Err(e) = listener.invocation_started(build).await {
                error!("downstream listener failed during invocation_started: {e:#}");
            }
        }
        Ok(())
    }

    async fn test_run_started(&self, run_name: &str, test_count: usize) -> Result<()> {
        self.replay_run(vec![RunEvent::RunStarted {
            name: run_name.to_owned(),
            count: test_count,
        }])
        .await;
        Ok(())
    }

    async fn test_started(&self, test: &TestId) -> Result<()> {
        self.replay_run(vec![RunEvent::TestStarted(test.clone())]).await;
        Ok(())
    }

    async fn test_failed(&self, test: &TestId, trace: &str) -> Result<()> {
        self.replay_run(vec![RunEvent::TestFailed {
            test: test.clone(),
            trace: trace.to_owned(),
        }])
        .await;
        Ok(())
    }

    async fn test_ended(&self, test: &TestId, metrics: &HashMap<String, String>) -> Result<()> {
        self.replay_run(vec![RunEvent::TestEnded {
            test: test.clone(),
            metrics: metrics.clone(),
        }])
        .await;
        Ok(())
    }

    async fn test_run_failed(&self, message: &str) -> Result<()> {
        self.replay_run(vec![RunEvent::RunFailed(message.to_owned())]).await;
        Ok(())
    }

    async fn test_run_stopped(&self, elapsed: Duration) -> Result<()> {
        self.replay_run(vec![RunEvent::RunStopped(elapsed)]).await;
        Ok(())
    }

    async fn test_run_ended(
        &self,
        elapsed: Duration,
        metrics: &HashMap<String, String>,
    ) -> Result<()> {
        self.replay_run(vec![RunEvent::RunEnded {
            elapsed,
            metrics: metrics.clone(),
        }])
        .await;
        Ok(())
    }

    async fn test_log(
        &self,
        name: &str,
        kind: LogDataType,
        stream: &dyn StreamSource,
    ) -> Result<()> {
        let _state = self.state.lock().await;
        for listener in &self.listeners {
            if let Err(e) = listener.test_log(name, kind, stream).await {
                error!("downstream listener failed during test_log: {e:#}");
            }
        }
        Ok(())
    }

    /// Per-shard failures are forwarded immediately; deciding the overall
    /// outcome is the downstream's call.
    async fn invocation_failed(&self, cause: &InvocationError) -> Result<()> {
        let _state = self.state.lock().await;
        for listener in &self.listeners {
            if let Err(e) = listener.invocation_failed(cause).await {
                error!("downstream listener failed during invocation_failed: {e:#}");
            }
        }
        Ok(())
    }

    async fn invocation_ended(&self, elapsed: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        state.shards_finished += 1;
        state.total_elapsed += elapsed;
        if state.shards_finished == self.expected_shards {
            let total = state.total_elapsed;
            for listener in &self.listeners {
                if let Err(e) = listener.invocation_ended(total).await {
                    error!("downstream listener failed during invocation_ended: {e:#}");
                }
            }
        }
        Ok(())
    }
}

/// The listener installed on each shard's configuration.
///
/// Buffers run-scoped events while a run is open and hands the completed run
/// to the aggregator in one block. Events outside a run, log attachments,
/// and the invocation-level events go straight through.
pub struct ShardListener {
    aggregator: Arc<ShardAggregator>,
    current_run: std::sync::Mutex<Option<Vec<RunEvent>>>,
}

impl ShardListener {
    pub fn new(aggregator: Arc<ShardAggregator>) -> Self {
        Self {
            aggregator,
            current_run: std::sync::Mutex::new(None),
        }
    }

    /// Buffers the event if a run is open, otherwise returns it for direct
    /// forwarding.
    fn buffer(&self, event: RunEvent) -> Option<RunEvent> {
        let mut current = self.current_run.lock().unwrap();
        match current.as_mut() {
            Some(buffered) => {
                buffered.push(event);
                None
            }
            None => Some(event),
        }
    }
}

#[async_trait]
impl InvocationListener for ShardListener {
    async fn invocation_started(&self, build: &BuildInfo) -> Result<()> {
        self.aggregator.invocation_started(build).await
    }

    async fn test_run_started(&self, run_name: &str, test_count: usize) -> Result<()> {
        let mut current = self.current_run.lock().unwrap();
        *current = Some(vec![RunEvent::RunStarted {
            name: run_name.to_owned(),
            count: test_count,
        }]);
        Ok(())
    }

    async fn test_started(&self, test: &TestId) -> Result<()> {
        if let Some(event) = self.buffer(RunEvent::TestStarted(test.clone())) {
            self.aggregator.replay_run(vec![event]).await;
        }
        Ok(())
    }

    async fn test_failed(&self, test: &TestId, trace: &str) -> Result<()> {
        let event = RunEvent::TestFailed {
            test: test.clone(),
            trace: trace.to_owned(),
        };
        if let Some(event) = self.buffer(event) {
            self.aggregator.replay_run(vec![event]).await;
        }
        Ok(())
    }

    async fn test_ended(&self, test: &TestId, metrics: &HashMap<String, String>) -> Result<()> {
        let event = RunEvent::TestEnded {
            test: test.clone(),
            metrics: metrics.clone(),
        };
        if let Some(event) = self.buffer(event) {
            self.aggregator.replay_run(vec![event]).await;
        }
        Ok(())
    }

    async fn test_run_failed(&self, message: &str) -> Result<()> {
        if let Some(event) = self.buffer(RunEvent::RunFailed(message.to_owned())) {
            self.aggregator.replay_run(vec![event]).await;
        }
        Ok(())
    }

    async fn test_run_stopped(&self, elapsed: Duration) -> Result<()> {
        if let Some(event) = self.buffer(RunEvent::RunStopped(elapsed)) {
            self.aggregator.replay_run(vec![event]).await;
        }
        Ok(())
    }

    async fn test_run_ended(
        &self,
        elapsed: Duration,
        metrics: &HashMap<String, String>,
    ) -> Result<()> {
        let events = {
            let mut current = self.current_run.lock().unwrap();
            let mut events = current.take().unwrap_or_default();
            events.push(RunEvent::RunEnded {
                elapsed,
                metrics: metrics.clone(),
            });
            events
        };
        self.aggregator.replay_run(events).await;
        Ok(())
    }

    async fn test_log(
        &self,
        name: &str,
        kind: LogDataType,
        stream: &dyn StreamSource,
    ) -> Result<()> {
        // Log attachments cannot be buffered; their stream is only valid for
        // the duration of this call.
        self.aggregator.test_log(name, kind, stream).await
    }

    async fn invocation_failed(&self, cause: &InvocationError) -> Result<()> {
        self.aggregator.invocation_failed(cause).await
    }

    async fn invocation_ended(&self, elapsed: Duration) -> Result<()> {
        // Flush a run the shard never closed before counting the shard done.
        let leftover = self.current_run.lock().unwrap().take();
        if let Some(events) = leftover {
            self.aggregator.replay_run(events).await;
        }
        self.aggregator.invocation_ended(elapsed).await
    }
}
