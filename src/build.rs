//! Build identity and build provider contracts.
//!
//! A [`BuildInfo`] names the artifact under test; a [`BuildProvider`] fetches
//! it and owns its lifecycle (`clean_up`, `build_not_tested`). The engine
//! treats both as opaque: it stamps the device serial, hands the build to
//! interested tests, and reports lifecycle events back to the provider.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Sentinel build id for a build that was fetched without a known id.
pub const UNKNOWN_BUILD_ID: &str = "-1";

/// Identity and metadata of one build under test.
///
/// `Clone` produces an independent value copy that is safe to own in a
/// different invocation; sharded and resumed invocations each receive their
/// own clone so provider cleanup stays separable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    build_id: String,
    test_tag: String,
    build_target: String,
    device_serial: Option<String>,
    attributes: BTreeMap<String, String>,
}

impl BuildInfo {
    /// Creates a build with the given id, test tag, and build target name.
    pub fn new(
        build_id: impl Into<String>,
        test_tag: impl Into<String>,
        build_target: impl Into<String>,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            test_tag: test_tag.into(),
            build_target: build_target.into(),
            device_serial: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Creates a build whose id is [`UNKNOWN_BUILD_ID`].
    pub fn unknown(test_tag: impl Into<String>) -> Self {
        Self::new(UNKNOWN_BUILD_ID, test_tag, "")
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn test_tag(&self) -> &str {
        &self.test_tag
    }

    pub fn build_target(&self) -> &str {
        &self.build_target
    }

    /// Serial of the device this build is being tested on, once stamped by
    /// the engine. Read-only to listeners.
    pub fn device_serial(&self) -> Option<&str> {
        self.device_serial.as_deref()
    }

    pub(crate) fn set_device_serial(&mut self, serial: impl Into<String>) {
        self.device_serial = Some(serial.into());
    }

    /// Free-form key/value attributes attached by the provider.
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn add_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::unknown("stub")
    }
}

/// The build provider could not produce a build.
///
/// Carries the partial [`BuildInfo`] describing what the provider was asked
/// for, so the failure can still be reported against a build identity.
#[derive(Debug, thiserror::Error)]
#[error("failed to retrieve build: {message}")]
pub struct BuildRetrievalError {
    message: String,
    build: BuildInfo,
}

impl BuildRetrievalError {
    pub fn new(message: impl Into<String>, build: BuildInfo) -> Self {
        Self {
            message: message.into(),
            build,
        }
    }

    /// The partial build identity the retrieval was attempted for.
    pub fn build_info(&self) -> &BuildInfo {
        &self.build
    }
}

/// Fetches builds to test and owns their lifecycle.
#[async_trait]
pub trait BuildProvider: Send + Sync {
    /// Fetches the next build to test.
    ///
    /// Returns `Ok(None)` when there is currently nothing to test; that is a
    /// normal outcome, not an error.
    async fn get_build(&self) -> Result<Option<BuildInfo>, BuildRetrievalError>;

    /// Signals that the invocation ended without the build being meaningfully
    /// exercised, so the provider may recycle it.
    fn build_not_tested(&self, build: &BuildInfo);

    /// Releases any resources held for the given build.
    fn clean_up(&self, build: &BuildInfo);
}

/// A pass-through provider serving a preconstructed build.
///
/// Sharded and resumed invocations receive one of these wrapping a clone of
/// the original build; `build_not_tested` and `clean_up` delegate to the
/// wrapped provider so lifecycle accounting stays with the real owner.
pub struct ExistingBuildProvider {
    build: Mutex<Option<BuildInfo>>,
    delegate: Arc<dyn BuildProvider>,
}

impl ExistingBuildProvider {
    pub fn new(build: BuildInfo, delegate: Arc<dyn BuildProvider>) -> Self {
        Self {
            build: Mutex::new(Some(build)),
            delegate,
        }
    }
}

#[async_trait]
impl BuildProvider for ExistingBuildProvider {
    async fn get_build(&self) -> Result<Option<BuildInfo>, BuildRetrievalError> {
        Ok(self.build.lock().unwrap().take())
    }

    fn build_not_tested(&self, build: &BuildInfo) {
        self.delegate.build_not_tested(build);
    }

    fn clean_up(&self, build: &BuildInfo) {
        self.delegate.clean_up(build);
    }
}
