//! Console output listener.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::build::BuildInfo;
use crate::invoker::InvocationError;
use crate::log::StreamSource;
use crate::result::{InvocationListener, LogDataType, TestId};

/// The stock "output" listener: prints invocation progress to the terminal.
pub struct ConsoleListener {
    verbose: bool,
}

impl ConsoleListener {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

#[async_trait]
impl InvocationListener for ConsoleListener {
    async fn invocation_started(&self, build: &BuildInfo) -> Result<()> {
        println!(
            "Invocation started for '{}' on build {}",
            build.test_tag(),
            build.build_id()
        );
        Ok(())
    }

    async fn test_run_started(&self, run_name: &str, test_count: usize) -> Result<()> {
        println!("Running {run_name} ({test_count} tests)");
        Ok(())
    }

    async fn test_started(&self, test: &TestId) -> Result<()> {
        if self.verbose {
            println!("  {test}");
        }
        Ok(())
    }

    async fn test_failed(&self, test: &TestId, trace: &str) -> Result<()> {
        println!("{} {test}", console::style("FAIL").red());
        if let Some(first_line) = trace.lines().next() {
            println!("     {}", console::style(first_line).dim());
        }
        Ok(())
    }

    async fn test_ended(&self, test: &TestId, _metrics: &HashMap<String, String>) -> Result<()> {
        if self.verbose {
            println!("{} {test}", console::style("DONE").green());
        }
        Ok(())
    }

    async fn test_run_failed(&self, error: &str) -> Result<()> {
        println!("{} {error}", console::style("RUN FAILED").red().bold());
        Ok(())
    }

    async fn test_run_ended(
        &self,
        elapsed: Duration,
        _metrics: &HashMap<String, String>,
    ) -> Result<()> {
        println!("Run complete in {elapsed:?}");
        Ok(())
    }

    async fn test_log(
        &self,
        name: &str,
        kind: LogDataType,
        _stream: &dyn StreamSource,
    ) -> Result<()> {
        if self.verbose {
            println!("{}", console::style(format!("log: {name} ({kind})")).dim());
        }
        Ok(())
    }

    async fn invocation_failed(&self, cause: &InvocationError) -> Result<()> {
        println!(
            "{} {cause}",
            console::style("Invocation failed:").red().bold()
        );
        Ok(())
    }

    async fn invocation_ended(&self, elapsed: Duration) -> Result<()> {
        println!("Invocation complete in {elapsed:?}");
        Ok(())
    }
}
