//! The invocation engine.
//!
//! [`InvocationEngine::invoke`] drives one invocation end to end: fetch the
//! build, inject it into interested tests, shard if any test splits, prepare
//! the target, run the tests, report logs, and clean up. Failure routing is
//! the engine's core contract:
//!
//! - listeners see exactly one `invocation_started` / `invocation_ended`
//!   pair per logical invocation, across sharding, resume, and every
//!   failure path;
//! - the provider hears `build_not_tested` only when the build never made it
//!   to the tests (and never when a resume was scheduled for it);
//! - the invocation log is unregistered from the process-wide registry on
//!   every exit path.
//!
//! One invocation runs on a single logical task from entry to cleanup; the
//! engine introduces no internal parallelism. Parallelism between shards
//! comes from the [`Rescheduler`] placing the shard configurations on other
//! workers.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::build::{BuildInfo, BuildRetrievalError, ExistingBuildProvider, UNKNOWN_BUILD_ID};
use crate::config::Configuration;
use crate::device::{DeviceNotAvailableError, TestDevice};
use crate::log::{LogOutput, LogRegistry, LoggerHandle};
use crate::result::{
    InvocationListener, LogDataType, ResultForwarder, ResumeResultForwarder, ShardAggregator,
    ShardListener,
};
use crate::targetprep::{BuildError, SetupError, TargetSetupError};
use crate::testtype::{RemoteTest, ShardableTest, TestError};

/// Canonical name of the harness-side log attachment.
pub const HOST_LOG_NAME: &str = "host_log";
/// Canonical name of the device log attachment.
pub const DEVICE_LOG_NAME: &str = "device_logcat";
/// Canonical name of the bug report attached when a build is rejected.
pub const BUILD_ERROR_BUGREPORT_NAME: &str = "build_error_bugreport";

/// Why an invocation failed.
///
/// Each variant has a fixed disposition (see the module docs): whether the
/// failure is reported to listeners, whether the provider hears
/// `build_not_tested`, and whether [`InvocationEngine::invoke`] propagates
/// the error to its caller.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    /// The build provider failed; nothing was tested.
    #[error(transparent)]
    BuildRetrieval(#[from] BuildRetrievalError),

    /// The target rejected the build. The build *was* exercised, so the
    /// provider does not hear `build_not_tested`.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// The environment could not be set up.
    #[error(transparent)]
    TargetSetup(#[from] TargetSetupError),

    /// The device was lost mid-invocation. Propagated to the caller.
    #[error(transparent)]
    DeviceNotAvailable(#[from] DeviceNotAvailableError),

    /// A collaborator faulted outside its expected failure vocabulary.
    /// Propagated to the caller.
    #[error("unexpected invocation fault: {0}")]
    Unexpected(#[source] anyhow::Error),
}

impl From<SetupError> for InvocationError {
    fn from(e: SetupError) -> Self {
        match e {
            SetupError::Build(e) => InvocationError::Build(e),
            SetupError::TargetSetup(e) => InvocationError::TargetSetup(e),
            SetupError::DeviceNotAvailable(e) => InvocationError::DeviceNotAvailable(e),
        }
    }
}

impl From<TestError> for InvocationError {
    fn from(e: TestError) -> Self {
        match e {
            TestError::DeviceNotAvailable(e) => InvocationError::DeviceNotAvailable(e),
            TestError::Unexpected(e) => InvocationError::Unexpected(e),
        }
    }
}

/// Accepts a configuration for placement on another worker.
#[async_trait]
pub trait Rescheduler: Send + Sync {
    /// Returns `true` when the configuration was accepted. `false` means the
    /// rescheduler refuses (e.g. it is shutting down); the caller must clean
    /// up any build the configuration was carrying.
    async fn schedule_config(&self, config: Configuration) -> bool;
}

/// Drives one invocation's lifecycle.
///
/// The engine's externally observable status is available through its
/// `Display` implementation: `(not invoked)` → `fetching build` →
/// `sharding` (if applicable) → `running <tag> on build <id>` →
/// `done running tests`, or the terminal `(no build to test)`.
pub struct InvocationEngine {
    status: Mutex<String>,
    registry: Arc<LogRegistry>,
}

impl InvocationEngine {
    pub fn new() -> Self {
        Self::with_registry(LogRegistry::global())
    }

    /// Uses a specific log registry instead of the process-wide one.
    pub fn with_registry(registry: Arc<LogRegistry>) -> Self {
        Self {
            status: Mutex::new("(not invoked)".to_owned()),
            registry,
        }
    }

    fn set_status(&self, status: impl Into<String>) {
        *self.status.lock().unwrap() = status.into();
    }

    /// Runs one invocation against `device` with the given configuration.
    ///
    /// Returns `Ok(())` on every handled outcome, including reported
    /// failures; `Err` carries only device loss and unexpected faults, after
    /// they have been reported.
    pub async fn invoke(
        &self,
        device: Arc<dyn TestDevice>,
        mut config: Configuration,
        rescheduler: &dyn Rescheduler,
    ) -> Result<(), InvocationError> {
        self.set_status("fetching build");
        if let Err(e) = config.log_output().init() {
            warn!("could not initialize the invocation log: {e}");
            self.registry.dump_to_global_log(config.log_output().as_ref());
            config.log_output().close_log();
            return Ok(());
        }
        let registration = self.registry.register_logger(Arc::clone(config.log_output()));

        match config.build_provider().get_build().await {
            Ok(Some(mut build)) => {
                inject_build(&build, config.tests());
                if self.shard_config(&mut config, &build, rescheduler).await {
                    info!(
                        "invocation for {} has been sharded, rescheduling",
                        device.serial_number()
                    );
                } else {
                    config.apply_recovery(device.as_ref());
                    return self
                        .perform_invocation(&config, &device, &mut build, rescheduler, registration)
                        .await;
                }
            }
            Ok(None) => {
                self.set_status("(no build to test)");
                debug!("no build to test");
            }
            Err(e) => {
                error!("failed to retrieve a build: {e}");
                // Report an empty invocation so the error reaches listeners.
                // Not report_failure: there was no build to mark untested.
                let partial = e.build_info().clone();
                self.start_invocation(&config, device.as_ref(), &partial).await;
                let cause = InvocationError::BuildRetrieval(e);
                for listener in config.listeners() {
                    if let Err(err) = listener.invocation_failed(&cause).await {
                        error!("listener failed during invocation_failed: {err:#}");
                    }
                }
                self.report_logs(
                    Some(device.as_ref()),
                    config.listeners(),
                    config.log_output().as_ref(),
                    registration,
                )
                .await;
                report_invocation_ended(config.listeners(), Duration::ZERO).await;
                return Ok(());
            }
        }

        self.registry.dump_to_global_log(config.log_output().as_ref());
        self.registry.unregister_logger(registration);
        config.log_output().close_log();
        Ok(())
    }

    /// Attempts to split the configuration into shard sub-configurations.
    ///
    /// Returns `true` when at least one test split; the rescheduler then
    /// owns the work and the current invocation must not proceed.
    async fn shard_config(
        &self,
        config: &mut Configuration,
        build: &BuildInfo,
        rescheduler: &dyn Rescheduler,
    ) -> bool {
        self.set_status("sharding");
        let mut shards: Vec<Arc<dyn RemoteTest>> = Vec::new();
        let mut sharded = false;
        for test in config.tests() {
            match test.as_shardable().and_then(ShardableTest::split) {
                Some(children) if !children.is_empty() => {
                    shards.extend(children);
                    sharded = true;
                }
                _ => shards.push(Arc::clone(test)),
            }
        }
        if !sharded {
            return false;
        }

        let aggregator = Arc::new(ShardAggregator::new(
            config.listeners().to_vec(),
            shards.len(),
        ));
        config.set_listener(Arc::new(ShardListener::new(Arc::clone(&aggregator))));
        // Announce the logical invocation once, with the original build.
        if let Err(e) = aggregator.invocation_started(build).await {
            error!("shard aggregator failed during invocation_started: {e:#}");
        }

        for shard in shards {
            debug!("rescheduling sharded config");
            let mut shard_config = config.clone();
            shard_config.set_test(shard);
            let shard_build = build.clone();
            shard_config.set_build_provider(Arc::new(ExistingBuildProvider::new(
                shard_build.clone(),
                Arc::clone(config.build_provider()),
            )));
            shard_config.set_listener(Arc::new(ShardListener::new(Arc::clone(&aggregator))));
            if !rescheduler.schedule_config(shard_config).await {
                warn!(
                    "rescheduler refused a shard for build {}, cleaning up its build",
                    build.build_id()
                );
                config.build_provider().clean_up(&shard_build);
            }
        }
        // The shard clones each own a clone of the build; the original is done.
        config.build_provider().clean_up(build);
        true
    }

    /// Runs the prepared invocation: preparers, tests, reporting, cleanup.
    async fn perform_invocation(
        &self,
        config: &Configuration,
        device: &Arc<dyn TestDevice>,
        build: &mut BuildInfo,
        rescheduler: &dyn Rescheduler,
        registration: LoggerHandle,
    ) -> Result<(), InvocationError> {
        let start = Instant::now();
        let mut resumed = false;

        build.set_device_serial(device.serial_number());
        self.start_invocation(config, device.as_ref(), build).await;

        let run_result = self.do_run(config, device, build).await;

        let outcome = match run_result {
            Ok(()) => Ok(()),
            Err(cause @ InvocationError::Build(_)) => {
                warn!(
                    "build {} failed on device {}: {cause}",
                    build.build_id(),
                    device.serial_number()
                );
                self.take_bugreport(device.as_ref(), config.listeners()).await;
                self.report_failure(&cause, config, build).await;
                Ok(())
            }
            Err(cause @ InvocationError::TargetSetup(_)) => {
                error!("caught exception while running invocation: {cause}");
                self.report_failure(&cause, config, build).await;
                Ok(())
            }
            Err(cause @ InvocationError::DeviceNotAvailable(_)) => {
                warn!(
                    "invocation did not complete, device {} became unavailable: {cause}",
                    device.serial_number()
                );
                resumed = self.resume(config, build, rescheduler, start.elapsed()).await;
                if resumed {
                    info!("rescheduled failed invocation for resume");
                } else {
                    self.report_failure(&cause, config, build).await;
                }
                Err(cause)
            }
            Err(cause) => {
                warn!("unexpected fault while running invocation: {cause}");
                self.report_failure(&cause, config, build).await;
                Err(cause)
            }
        };

        self.set_status("done running tests");
        self.report_logs(
            Some(device.as_ref()),
            config.listeners(),
            config.log_output().as_ref(),
            registration,
        )
        .await;
        let elapsed = start.elapsed();
        if !resumed {
            report_invocation_ended(config.listeners(), elapsed).await;
        }
        config.build_provider().clean_up(build);
        outcome
    }

    /// The fallible stretch of the invocation: device options, preparers,
    /// tests. Every error converts into the [`InvocationError`] taxonomy.
    async fn do_run(
        &self,
        config: &Configuration,
        device: &Arc<dyn TestDevice>,
        build: &BuildInfo,
    ) -> Result<(), InvocationError> {
        device.set_options(config.device_options()).await?;
        for preparer in config.target_preparers() {
            preparer.set_up(device.as_ref(), build).await?;
        }
        self.run_tests(device, config).await?;
        Ok(())
    }

    /// Runs each test in order, handing the device to tests that want it.
    async fn run_tests(
        &self,
        device: &Arc<dyn TestDevice>,
        config: &Configuration,
    ) -> Result<(), TestError> {
        for test in config.tests() {
            if let Some(device_test) = test.as_device_test() {
                device_test.set_device(Arc::clone(device));
            }
            let forwarder = ResultForwarder::new(config.listeners().to_vec());
            test.run(&forwarder).await?;
        }
        Ok(())
    }

    /// Announces the invocation: one status line, then `invocation_started`
    /// to every listener. A misbehaving listener is logged and skipped.
    async fn start_invocation(
        &self,
        config: &Configuration,
        device: &dyn TestDevice,
        build: &BuildInfo,
    ) {
        let mut message = format!("Starting invocation for '{}'", build.test_tag());
        if build.build_id() != UNKNOWN_BUILD_ID {
            message.push_str(&format!(" on build '{}'", build.build_id()));
        }
        for attribute in build.attributes().values() {
            message.push(' ');
            message.push_str(attribute);
        }
        message.push_str(&format!(" on device {}", device.serial_number()));
        info!("{message}");
        config.log_output().append(&message);
        self.set_status(format!(
            "running {} on build {}",
            build.test_tag(),
            build.build_id()
        ));

        for listener in config.listeners() {
            if let Err(e) = listener.invocation_started(build).await {
                error!("listener failed during invocation_started: {e:#}");
            }
        }
    }

    /// Attempts to reschedule the failed invocation to continue where it
    /// left off. At most one resume is attempted per failed invocation: the
    /// scan stops at the first resumable test, whatever the rescheduler says.
    ///
    /// Returns `true` iff a resume was actually scheduled; only then does
    /// the caller skip `invocation_ended` and `build_not_tested`.
    async fn resume(
        &self,
        config: &Configuration,
        build: &BuildInfo,
        rescheduler: &dyn Rescheduler,
        elapsed: Duration,
    ) -> bool {
        for test in config.tests() {
            let Some(resumable) = test.as_resumable() else {
                continue;
            };
            if !resumable.is_resumable() {
                continue;
            }

            let mut resume_config = config.clone();
            let cloned_build = build.clone();
            resume_config.set_build_provider(Arc::new(ExistingBuildProvider::new(
                cloned_build.clone(),
                Arc::clone(config.build_provider()),
            )));
            // One started event per logical invocation: the continuation
            // suppresses its own and sums the elapsed times.
            resume_config.set_listener(Arc::new(ResumeResultForwarder::new(
                config.listeners().to_vec(),
                elapsed,
            )));

            let scheduled = rescheduler.schedule_config(resume_config).await;
            if !scheduled {
                info!(
                    "cannot reschedule resumed config for build {}, cleaning up build",
                    build.build_id()
                );
                config.build_provider().clean_up(&cloned_build);
            }
            return scheduled;
        }
        false
    }

    /// Reports the failure to every listener and, unless the build itself
    /// was rejected, tells the provider the build went untested.
    async fn report_failure(
        &self,
        cause: &InvocationError,
        config: &Configuration,
        build: &BuildInfo,
    ) {
        for listener in config.listeners() {
            if let Err(e) = listener.invocation_failed(cause).await {
                error!("listener failed during invocation_failed: {e:#}");
            }
        }
        if !matches!(cause, InvocationError::Build(_)) {
            config.build_provider().build_not_tested(build);
        }
    }

    /// Captures a bug report and delivers it to every listener.
    async fn take_bugreport(
        &self,
        device: &dyn TestDevice,
        listeners: &[Arc<dyn InvocationListener>],
    ) {
        let bugreport = device.bugreport().await;
        for listener in listeners {
            if let Err(e) = listener
                .test_log(BUILD_ERROR_BUGREPORT_NAME, LogDataType::Text, bugreport.as_ref())
                .await
            {
                error!("listener failed during test_log: {e:#}");
            }
        }
        bugreport.cancel();
    }

    /// Delivers the device and host logs to every listener, then releases
    /// the sources, unregisters the invocation logger, and closes it.
    ///
    /// After this the invocation may not log anything further; late log
    /// calls land in the process-wide log instead.
    async fn report_logs(
        &self,
        device: Option<&dyn TestDevice>,
        listeners: &[Arc<dyn InvocationListener>],
        logger: &dyn LogOutput,
        registration: LoggerHandle,
    ) {
        let logcat = match device {
            Some(device) => device.logcat().await,
            None => None,
        };
        let host_log = match logger.get_log() {
            Ok(source) => Some(source),
            Err(e) => {
                warn!("could not fetch the host log: {e}");
                None
            }
        };

        for listener in listeners {
            if let Some(source) = &logcat {
                if let Err(e) = listener
                    .test_log(DEVICE_LOG_NAME, LogDataType::Text, source.as_ref())
                    .await
                {
                    error!("listener failed during test_log: {e:#}");
                }
            }
            if let Some(source) = &host_log {
                if let Err(e) = listener
                    .test_log(HOST_LOG_NAME, LogDataType::Text, source.as_ref())
                    .await
                {
                    error!("listener failed during test_log: {e:#}");
                }
            }
        }

        if let Some(source) = logcat {
            source.cancel();
        }
        if let Some(source) = host_log {
            source.cancel();
        }

        self.registry.unregister_logger(registration);
        logger.close_log();
    }
}

impl Default for InvocationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.status.lock().unwrap())
    }
}

/// Hands the build to every test that wants one.
fn inject_build(build: &BuildInfo, tests: &[Arc<dyn RemoteTest>]) {
    for test in tests {
        if let Some(receiver) = test.as_build_receiver() {
            receiver.set_build(build.clone());
        }
    }
}

/// Delivers `invocation_ended` to every listener, skipping failures.
async fn report_invocation_ended(listeners: &[Arc<dyn InvocationListener>], elapsed: Duration) {
    for listener in listeners {
        if let Err(e) = listener.invocation_ended(elapsed).await {
            error!("listener failed during invocation_ended: {e:#}");
        }
    }
}
