//! Remote executor trait

use async_trait::async_trait;
use std::time::Duration;

use crate::error::ExecError;

/// Runs shell commands somewhere and classifies the outcome
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `cmd`, returning captured stdout
    async fn run(&self, cmd: &str) -> Result<String, ExecError>;

    /// Run `cmd` after applying `KEY=VALUE` environment entries
    async fn run_with_env(&self, cmd: &str, env: &[String]) -> Result<String, ExecError>;

    /// Run `cmd`, giving up after `timeout`
    async fn run_with_timeout(&self, cmd: &str, timeout: Duration) -> Result<String, ExecError>;

    /// Whether the underlying connection is live
    fn is_connected(&self) -> bool;

    /// Short executor name for logs
    fn executor_type(&self) -> &'static str;
}
