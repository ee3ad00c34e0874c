//! Shared fakes for exercising the engine and the listener contracts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::build::{BuildInfo, BuildProvider, BuildRetrievalError};
use crate::command::CommandSink;
use crate::config::Configuration;
use crate::device::{DeviceNotAvailableError, DeviceOptions, DeviceRecovery, TestDevice};
use crate::invoker::{InvocationError, Rescheduler};
use crate::log::{ByteStreamSource, StreamSource};
use crate::result::{InvocationListener, LogDataType, TestId};
use crate::testtype::{
    BuildReceiver, DeviceTest, RemoteTest, ResumableTest, ShardableTest, TestError,
};

/// A recorded listener event, with payloads flattened for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    InvocationStarted {
        build_id: String,
        device_serial: Option<String>,
    },
    TestRunStarted {
        name: String,
        count: usize,
    },
    TestStarted(TestId),
    TestFailed {
        test: TestId,
        trace: String,
    },
    TestEnded(TestId),
    TestRunFailed(String),
    TestRunStopped(Duration),
    TestRunEnded(Duration),
    TestLog {
        name: String,
        kind: LogDataType,
    },
    InvocationFailed(String),
    InvocationEnded(Duration),
}

/// Records every event it receives.
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn started_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, Event::InvocationStarted { .. }))
            .count()
    }

    pub fn ended_count(&self) -> usize {
        self.ended_elapsed().len()
    }

    pub fn ended_elapsed(&self) -> Vec<Duration> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::InvocationEnded(elapsed) => Some(elapsed),
                _ => None,
            })
            .collect()
    }

    pub fn failed_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, Event::InvocationFailed(_)))
            .count()
    }

    pub fn log_names(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::TestLog { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl InvocationListener for RecordingListener {
    async fn invocation_started(&self, build: &BuildInfo) -> Result<()> {
        self.record(Event::InvocationStarted {
            build_id: build.build_id().to_owned(),
            device_serial: build.device_serial().map(str::to_owned),
        });
        Ok(())
    }

    async fn test_run_started(&self, run_name: &str, test_count: usize) -> Result<()> {
        self.record(Event::TestRunStarted {
            name: run_name.to_owned(),
            count: test_count,
        });
        Ok(())
    }

    async fn test_started(&self, test: &TestId) -> Result<()> {
        self.record(Event::TestStarted(test.clone()));
        Ok(())
    }

    async fn test_failed(&self, test: &TestId, trace: &str) -> Result<()> {
        self.record(Event::TestFailed {
            test: test.clone(),
            trace: trace.to_owned(),
        });
        Ok(())
    }

    async fn test_ended(&self, test: &TestId, _metrics: &HashMap<String, String>) -> Result<()> {
        self.record(Event::TestEnded(test.clone()));
        Ok(())
    }

    async fn test_run_failed(&self, error: &str) -> Result<()> {
        self.record(Event::TestRunFailed(error.to_owned()));
        Ok(())
    }

    async fn test_run_stopped(&self, elapsed: Duration) -> Result<()> {
        self.record(Event::TestRunStopped(elapsed));
        Ok(())
    }

    async fn test_run_ended(
        &self,
        elapsed: Duration,
        _metrics: &HashMap<String, String>,
    ) -> Result<()> {
        self.record(Event::TestRunEnded(elapsed));
        Ok(())
    }

    async fn test_log(
        &self,
        name: &str,
        kind: LogDataType,
        _stream: &dyn StreamSource,
    ) -> Result<()> {
        self.record(Event::TestLog {
            name: name.to_owned(),
            kind,
        });
        Ok(())
    }

    async fn invocation_failed(&self, cause: &InvocationError) -> Result<()> {
        self.record(Event::InvocationFailed(cause.to_string()));
        Ok(())
    }

    async fn invocation_ended(&self, elapsed: Duration) -> Result<()> {
        self.record(Event::InvocationEnded(elapsed));
        Ok(())
    }
}

/// Fails every callback.
pub struct FailingListener;

#[async_trait]
impl InvocationListener for FailingListener {
    async fn invocation_started(&self, _build: &BuildInfo) -> Result<()> {
        Err(anyhow!("listener is broken"))
    }

    async fn invocation_ended(&self, _elapsed: Duration) -> Result<()> {
        Err(anyhow!("listener is broken"))
    }
}

/// Serves one scripted `get_build` outcome, then `None`; records lifecycle
/// calls by build id.
pub struct ScriptedBuildProvider {
    outcome: Mutex<Option<Result<Option<BuildInfo>, BuildRetrievalError>>>,
    cleaned: Mutex<Vec<String>>,
    not_tested: Mutex<Vec<String>>,
}

impl ScriptedBuildProvider {
    pub fn with_build(build: BuildInfo) -> Self {
        Self::scripted(Ok(Some(build)))
    }

    pub fn with_no_build() -> Self {
        Self::scripted(Ok(None))
    }

    pub fn with_error(error: BuildRetrievalError) -> Self {
        Self::scripted(Err(error))
    }

    fn scripted(outcome: Result<Option<BuildInfo>, BuildRetrievalError>) -> Self {
        Self {
            outcome: Mutex::new(Some(outcome)),
            cleaned: Mutex::new(Vec::new()),
            not_tested: Mutex::new(Vec::new()),
        }
    }

    pub fn cleaned_ids(&self) -> Vec<String> {
        self.cleaned.lock().unwrap().clone()
    }

    pub fn not_tested_ids(&self) -> Vec<String> {
        self.not_tested.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildProvider for ScriptedBuildProvider {
    async fn get_build(&self) -> Result<Option<BuildInfo>, BuildRetrievalError> {
        self.outcome.lock().unwrap().take().unwrap_or(Ok(None))
    }

    fn build_not_tested(&self, build: &BuildInfo) {
        self.not_tested
            .lock()
            .unwrap()
            .push(build.build_id().to_owned());
    }

    fn clean_up(&self, build: &BuildInfo) {
        self.cleaned
            .lock()
            .unwrap()
            .push(build.build_id().to_owned());
    }
}

/// A device whose telemetry is canned data.
pub struct FakeDevice {
    serial: String,
    recovery_installed: Mutex<bool>,
    set_options_error: Mutex<Option<DeviceNotAvailableError>>,
}

impl FakeDevice {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            recovery_installed: Mutex::new(false),
            set_options_error: Mutex::new(None),
        }
    }

    pub fn failing_set_options(self, error: DeviceNotAvailableError) -> Self {
        *self.set_options_error.lock().unwrap() = Some(error);
        self
    }

    pub fn recovery_installed(&self) -> bool {
        *self.recovery_installed.lock().unwrap()
    }
}

#[async_trait]
impl TestDevice for FakeDevice {
    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn set_recovery(&self, _recovery: Arc<dyn DeviceRecovery>) {
        *self.recovery_installed.lock().unwrap() = true;
    }

    async fn set_options(&self, _options: &DeviceOptions) -> Result<(), DeviceNotAvailableError> {
        match self.set_options_error.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn logcat(&self) -> Option<Box<dyn StreamSource>> {
        Some(Box::new(ByteStreamSource::new(b"logcat line".to_vec())))
    }

    async fn bugreport(&self) -> Box<dyn StreamSource> {
        Box::new(ByteStreamSource::new(b"bugreport".to_vec()))
    }
}

/// A test with configurable capabilities and a scriptable first-run failure.
pub struct FakeTest {
    run_name: String,
    receives_build: bool,
    takes_device: bool,
    shards: Option<Vec<Arc<dyn RemoteTest>>>,
    resumable: Option<bool>,
    fail_once: Mutex<Option<TestError>>,
    pub build: Mutex<Option<BuildInfo>>,
    pub device: Mutex<Option<Arc<dyn TestDevice>>>,
}

impl FakeTest {
    pub fn new(run_name: impl Into<String>) -> Self {
        Self {
            run_name: run_name.into(),
            receives_build: false,
            takes_device: false,
            shards: None,
            resumable: None,
            fail_once: Mutex::new(None),
            build: Mutex::new(None),
            device: Mutex::new(None),
        }
    }

    pub fn receiving_build(mut self) -> Self {
        self.receives_build = true;
        self
    }

    pub fn taking_device(mut self) -> Self {
        self.takes_device = true;
        self
    }

    pub fn sharding_into(mut self, children: Vec<Arc<dyn RemoteTest>>) -> Self {
        self.shards = Some(children);
        self
    }

    pub fn resumable(mut self, is_resumable: bool) -> Self {
        self.resumable = Some(is_resumable);
        self
    }

    /// The next `run` call fails with `error`; later calls succeed.
    pub fn failing_once_with(self, error: TestError) -> Self {
        *self.fail_once.lock().unwrap() = Some(error);
        self
    }
}

#[async_trait]
impl RemoteTest for FakeTest {
    async fn run(&self, listener: &dyn InvocationListener) -> Result<(), TestError> {
        if let Some(error) = self.fail_once.lock().unwrap().take() {
            return Err(error);
        }
        let metrics = HashMap::new();
        let test = TestId::new("FakeTest", &self.run_name);
        listener.test_run_started(&self.run_name, 1).await.ok();
        listener.test_started(&test).await.ok();
        listener.test_ended(&test, &metrics).await.ok();
        listener
            .test_run_ended(Duration::from_millis(5), &metrics)
            .await
            .ok();
        Ok(())
    }

    fn as_build_receiver(&self) -> Option<&dyn BuildReceiver> {
        self.receives_build.then_some(self as &dyn BuildReceiver)
    }

    fn as_device_test(&self) -> Option<&dyn DeviceTest> {
        self.takes_device.then_some(self as &dyn DeviceTest)
    }

    fn as_shardable(&self) -> Option<&dyn ShardableTest> {
        self.shards.as_ref().map(|_| self as &dyn ShardableTest)
    }

    fn as_resumable(&self) -> Option<&dyn ResumableTest> {
        self.resumable.map(|_| self as &dyn ResumableTest)
    }
}

impl BuildReceiver for FakeTest {
    fn set_build(&self, build: BuildInfo) {
        *self.build.lock().unwrap() = Some(build);
    }
}

impl DeviceTest for FakeTest {
    fn set_device(&self, device: Arc<dyn TestDevice>) {
        *self.device.lock().unwrap() = Some(device);
    }
}

impl ShardableTest for FakeTest {
    fn split(&self) -> Option<Vec<Arc<dyn RemoteTest>>> {
        self.shards.clone()
    }
}

impl ResumableTest for FakeTest {
    fn is_resumable(&self) -> bool {
        self.resumable.unwrap_or(false)
    }
}

/// Records every configuration handed to it; accepts or refuses them all.
pub struct RecordingRescheduler {
    accept: bool,
    scheduled: Mutex<Vec<Configuration>>,
}

impl RecordingRescheduler {
    pub fn accepting() -> Self {
        Self {
            accept: true,
            scheduled: Mutex::new(Vec::new()),
        }
    }

    pub fn refusing() -> Self {
        Self {
            accept: false,
            scheduled: Mutex::new(Vec::new()),
        }
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.lock().unwrap().len()
    }

    /// Takes the recorded configurations out, leaving the list empty.
    pub fn take_scheduled(&self) -> Vec<Configuration> {
        std::mem::take(&mut *self.scheduled.lock().unwrap())
    }
}

#[async_trait]
impl Rescheduler for RecordingRescheduler {
    async fn schedule_config(&self, config: Configuration) -> bool {
        self.scheduled.lock().unwrap().push(config);
        self.accept
    }
}

/// Collects every command line emitted by the parser.
#[derive(Default)]
pub struct CollectingSink {
    pub commands: Vec<Vec<String>>,
}

impl CommandSink for CollectingSink {
    fn add_command(&mut self, argv: Vec<String>) {
        self.commands.push(argv);
    }
}
