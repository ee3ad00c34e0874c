//! # testrig
//!
//! The invocation engine of a device-based test harness. An *invocation* is
//! one logical test run against a target device: fetch a build, prepare the
//! target, run the tests, report the results, clean up. The engine composes
//! pluggable collaborators into that lifecycle and keeps the listener
//! contract intact across sharding, resume, and every failure path.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       InvocationEngine                           │
//! │  (drives one invocation's lifecycle)                             │
//! │                                                                  │
//! │  BuildProvider ──► BuildInfo ──► TargetPreparers ──► RemoteTests │
//! │                                                        │         │
//! │                 ResultForwarder ◄──────────────────────┘         │
//! │                       │                                          │
//! │                       ▼                                          │
//! │              InvocationListeners                                 │
//! │                                                                  │
//! │  Shardable tests  ──► ShardAggregator + Rescheduler              │
//! │  Resumable tests  ──► ResumeResultForwarder + Rescheduler        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Subsystems
//!
//! - [`invoker`] — the engine itself: the lifecycle state machine, the error
//!   taxonomy, and the [`Rescheduler`](invoker::Rescheduler) contract used to
//!   hand sharded or resumed work back to the surrounding scheduler.
//! - [`config`] — the [`Configuration`](config::Configuration) aggregate an
//!   invocation runs against, with the clone semantics sharding and resume
//!   rely on.
//! - [`result`] — the [`InvocationListener`](result::InvocationListener)
//!   event contract and the listener family built on it: fan-out, resume and
//!   shard forwarding, name mangling, console output.
//! - [`build`], [`device`], [`targetprep`], [`testtype`] — the collaborator
//!   contracts the engine composes; concrete implementations are pluggable.
//! - [`command`] — the command file parser that turns macro-capable command
//!   files into argument vectors for a scheduler.
//! - [`log`] — invocation log plumbing: stream sources, log outputs, and the
//!   process-wide log registry.
//! - [`util`] — timed execution helpers with retry and back-off, for
//!   preparer and test implementations.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use testrig::config::Configuration;
//! use testrig::invoker::{InvocationEngine, Rescheduler};
//! use testrig::result::ConsoleListener;
//!
//! # async fn example(
//! #     provider: Arc<dyn testrig::build::BuildProvider>,
//! #     test: Arc<dyn testrig::testtype::RemoteTest>,
//! #     device: Arc<dyn testrig::device::TestDevice>,
//! #     rescheduler: &dyn Rescheduler,
//! # ) -> Result<(), testrig::invoker::InvocationError> {
//! let config = Configuration::new(provider)
//!     .with_test(test)
//!     .with_listener(Arc::new(ConsoleListener::new(true)));
//!
//! let engine = InvocationEngine::new();
//! engine.invoke(device, config, rescheduler).await
//! # }
//! ```

pub mod build;
pub mod command;
pub mod config;
pub mod device;
pub mod invoker;
pub mod log;
pub mod result;
pub mod targetprep;
pub mod testtype;
pub mod util;

#[cfg(test)]
pub(crate) mod fakes;

// Re-export the types most integrations need.

pub use build::{BuildInfo, BuildProvider, UNKNOWN_BUILD_ID};
pub use command::{CommandFileParser, CommandSink, ConfigError};
pub use config::{CommandOptions, Configuration};
pub use invoker::{InvocationEngine, InvocationError, Rescheduler};
pub use result::{InvocationListener, ResultForwarder};
pub use testtype::RemoteTest;
