//! The configuration aggregate one invocation runs against.
//!
//! A [`Configuration`] bundles the collaborators the engine composes: a
//! build provider, ordered target preparers, ordered tests, listeners, a log
//! output, a device recovery strategy, and the two option bags. Sharding and
//! resume clone configurations; the clone semantics are load-bearing and
//! documented on [`Configuration::clone`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::build::BuildProvider;
use crate::device::{DeviceOptions, DeviceRecovery, NullDeviceRecovery, TestDevice};
use crate::log::{BufferLogOutput, LogOutput};
use crate::result::InvocationListener;
use crate::targetprep::TargetPreparer;
use crate::testtype::RemoteTest;

/// Harness-level options attached to one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOptions {
    /// Re-queue the command after each invocation completes.
    pub loop_mode: bool,
    /// Minimum time between iterations when looping.
    pub min_loop_interval: Duration,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            loop_mode: false,
            min_loop_interval: Duration::from_secs(10),
        }
    }
}

/// Everything one invocation needs, assembled by the surrounding scheduler.
pub struct Configuration {
    build_provider: Arc<dyn BuildProvider>,
    target_preparers: Vec<Arc<dyn TargetPreparer>>,
    tests: Vec<Arc<dyn RemoteTest>>,
    listeners: Vec<Arc<dyn InvocationListener>>,
    log_output: Arc<dyn LogOutput>,
    device_recovery: Arc<dyn DeviceRecovery>,
    device_options: DeviceOptions,
    command_options: CommandOptions,
}

impl Configuration {
    /// Creates a configuration with the given provider, no preparers, tests,
    /// or listeners, an in-memory log output, and default options.
    pub fn new(build_provider: Arc<dyn BuildProvider>) -> Self {
        Self {
            build_provider,
            target_preparers: Vec::new(),
            tests: Vec::new(),
            listeners: Vec::new(),
            log_output: Arc::new(BufferLogOutput::new()),
            device_recovery: Arc::new(NullDeviceRecovery),
            device_options: DeviceOptions::default(),
            command_options: CommandOptions::default(),
        }
    }

    pub fn with_test(mut self, test: Arc<dyn RemoteTest>) -> Self {
        self.tests.push(test);
        self
    }

    pub fn with_target_preparer(mut self, preparer: Arc<dyn TargetPreparer>) -> Self {
        self.target_preparers.push(preparer);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn InvocationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_log_output(mut self, log_output: Arc<dyn LogOutput>) -> Self {
        self.log_output = log_output;
        self
    }

    pub fn with_device_recovery(mut self, recovery: Arc<dyn DeviceRecovery>) -> Self {
        self.device_recovery = recovery;
        self
    }

    pub fn with_device_options(mut self, options: DeviceOptions) -> Self {
        self.device_options = options;
        self
    }

    pub fn with_command_options(mut self, options: CommandOptions) -> Self {
        self.command_options = options;
        self
    }

    pub fn build_provider(&self) -> &Arc<dyn BuildProvider> {
        &self.build_provider
    }

    pub fn target_preparers(&self) -> &[Arc<dyn TargetPreparer>] {
        &self.target_preparers
    }

    pub fn tests(&self) -> &[Arc<dyn RemoteTest>] {
        &self.tests
    }

    pub fn listeners(&self) -> &[Arc<dyn InvocationListener>] {
        &self.listeners
    }

    pub fn log_output(&self) -> &Arc<dyn LogOutput> {
        &self.log_output
    }

    pub fn device_recovery(&self) -> Arc<dyn DeviceRecovery> {
        Arc::clone(&self.device_recovery)
    }

    pub fn device_options(&self) -> &DeviceOptions {
        &self.device_options
    }

    pub fn command_options(&self) -> &CommandOptions {
        &self.command_options
    }

    /// Replaces the test list with a single test. Used when a shard child
    /// becomes the sole test of a cloned configuration.
    pub fn set_test(&mut self, test: Arc<dyn RemoteTest>) {
        self.tests = vec![test];
    }

    pub fn set_build_provider(&mut self, provider: Arc<dyn BuildProvider>) {
        self.build_provider = provider;
    }

    /// Replaces the listener list with a single listener, typically one of
    /// the forwarding family wrapping the previous list.
    pub fn set_listener(&mut self, listener: Arc<dyn InvocationListener>) {
        self.listeners = vec![listener];
    }

    pub fn set_log_output(&mut self, log_output: Arc<dyn LogOutput>) {
        self.log_output = log_output;
    }

    pub fn set_command_options(&mut self, options: CommandOptions) {
        self.command_options = options;
    }

    /// Applies this configuration's recovery strategy to a device.
    pub fn apply_recovery(&self, device: &dyn TestDevice) {
        device.set_recovery(Arc::clone(&self.device_recovery));
    }
}

impl Clone for Configuration {
    /// Clones for rescheduling.
    ///
    /// Provider, preparers, tests, recovery, and the individual listeners
    /// are shared by reference: the listener *list* itself is copied so the
    /// clone can be re-pointed without touching the original. The log output
    /// is a fresh value copy (an independent resource, released by whichever
    /// invocation owns it), as are both option bags.
    fn clone(&self) -> Self {
        Self {
            build_provider: Arc::clone(&self.build_provider),
            target_preparers: self.target_preparers.clone(),
            tests: self.tests.clone(),
            listeners: self.listeners.clone(),
            log_output: self.log_output.clone_output(),
            device_recovery: Arc::clone(&self.device_recovery),
            device_options: self.device_options.clone(),
            command_options: self.command_options.clone(),
        }
    }
}
