//! Timed execution helpers with retry and back-off.
//!
//! Preparer and test implementations use these to wrap flaky device and
//! network operations. An operation is a [`RunnableResult`]; success is
//! `run()` returning `true`. Each helper cancels the runnable when its
//! attempt deadline expires.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

/// Outcome of a single timed operation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Failed,
    TimedOut,
    /// The operation terminated abnormally rather than reporting failure.
    Exception,
}

/// An operation that reports success as a boolean and can be cancelled.
#[async_trait]
pub trait RunnableResult: Send {
    /// Executes the operation. `Ok(true)` is success.
    async fn run(&mut self) -> Result<bool>;

    /// Cancels the operation after a deadline expired.
    async fn cancel(&mut self);
}

/// Runs an operation once, aborting it if it takes longer than `timeout`.
pub async fn run_timed(timeout: Duration, runnable: &mut dyn RunnableResult) -> CommandStatus {
    let outcome = time::timeout(timeout, runnable.run()).await;
    match outcome {
        Ok(Ok(true)) => CommandStatus::Success,
        Ok(Ok(false)) => CommandStatus::Failed,
        Ok(Err(e)) => {
            warn!("operation terminated abnormally: {e:#}");
            CommandStatus::Exception
        }
        Err(_) => {
            runnable.cancel().await;
            CommandStatus::TimedOut
        }
    }
}

/// Retries an operation up to `attempts` times, waiting `poll_interval`
/// between attempts. Returns `true` as soon as one attempt succeeds.
pub async fn run_timed_retry(
    op_timeout: Duration,
    poll_interval: Duration,
    attempts: usize,
    runnable: &mut dyn RunnableResult,
) -> bool {
    for attempt in 0..attempts {
        if run_timed(op_timeout, runnable).await == CommandStatus::Success {
            return true;
        }
        debug!(
            "operation failed on attempt {}/{attempts}, waiting {poll_interval:?}",
            attempt + 1
        );
        time::sleep(poll_interval).await;
    }
    false
}

/// Retries an operation until `max_time` of wall clock has passed, polling at
/// a fixed interval.
pub async fn run_fixed_timed_retry(
    op_timeout: Duration,
    poll_interval: Duration,
    max_time: Duration,
    runnable: &mut dyn RunnableResult,
) -> bool {
    let deadline = Instant::now() + max_time;
    while Instant::now() < deadline {
        if run_timed(op_timeout, runnable).await == CommandStatus::Success {
            return true;
        }
        debug!("operation failed, waiting {poll_interval:?}");
        time::sleep(poll_interval).await;
    }
    false
}

/// Retries an operation until `max_time` of wall clock has passed, doubling
/// the wait between attempts up to `max_poll_interval`.
///
/// Intended for polling a service that may need time to recover.
pub async fn run_escalating_timed_retry(
    op_timeout: Duration,
    initial_poll_interval: Duration,
    max_poll_interval: Duration,
    max_time: Duration,
    runnable: &mut dyn RunnableResult,
) -> bool {
    let deadline = Instant::now() + max_time;
    let mut poll_interval = initial_poll_interval;
    while Instant::now() < deadline {
        if run_timed(op_timeout, runnable).await == CommandStatus::Success {
            return true;
        }
        debug!("operation failed, waiting {poll_interval:?}");
        time::sleep(poll_interval).await;
        poll_interval = (poll_interval * 2).min(max_poll_interval);
    }
    false
}
