//! Per-command request/response protocol over a [`TransportHandle`]

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::env::{EnvBinding, parse_bindings};
use crate::error::ExecError;
use crate::handle::TransportHandle;
use crate::pty::PtyRequest;
use crate::result::CommandResult;
use crate::traits::RemoteExecutor;
use crate::transport::{Capture, Channel};

/// What to do when a command exits cleanly but writes to stderr
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrPolicy {
    /// Treat any stderr output as failure
    #[default]
    Strict,
    /// Only the exit status decides
    Lenient,
}

impl StderrPolicy {
    /// Whether `result` counts as a failure under this policy
    #[must_use]
    pub fn rejects(self, result: &CommandResult) -> bool {
        self == StderrPolicy::Strict && result.has_stderr()
    }
}

/// How long a single command may block
#[derive(Clone, Copy)]
enum Limit<'a> {
    Unbounded,
    Deadline(Duration),
    Token(&'a CancellationToken),
}

/// Command executor
///
/// Every call acquires its own channel from the handle, negotiates a
/// terminal, applies environment bindings, runs the command and releases
/// the channel before returning.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    handle: Arc<TransportHandle>,
    pty: Option<PtyRequest>,
    stderr_policy: StderrPolicy,
    command_timeout: Option<Duration>,
}

impl CommandExecutor {
    /// Executor with the default terminal and strict stderr handling
    pub fn new(handle: Arc<TransportHandle>) -> Self {
        Self {
            handle,
            pty: Some(PtyRequest::default()),
            stderr_policy: StderrPolicy::default(),
            command_timeout: None,
        }
    }

    /// Request a custom terminal
    #[must_use]
    pub fn with_pty(mut self, pty: PtyRequest) -> Self {
        self.pty = Some(pty);
        self
    }

    /// Skip terminal negotiation entirely
    #[must_use]
    pub fn without_pty(mut self) -> Self {
        self.pty = None;
        self
    }

    /// Set stderr classification
    #[must_use]
    pub fn with_stderr_policy(mut self, policy: StderrPolicy) -> Self {
        self.stderr_policy = policy;
        self
    }

    /// Bound `run` and `run_with_env` by a deadline
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Policy applied to stderr output by the `run` family
    #[must_use]
    pub fn stderr_policy(&self) -> StderrPolicy {
        self.stderr_policy
    }

    /// Get the underlying handle
    pub fn handle(&self) -> &Arc<TransportHandle> {
        &self.handle
    }

    /// Run `cmd` and return both output streams without stderr
    /// classification
    ///
    /// # Errors
    /// Any stage failure up to and including command execution
    pub async fn execute<S: AsRef<str>>(
        &self,
        cmd: &str,
        env: &[S],
    ) -> Result<CommandResult, ExecError> {
        self.execute_limited(cmd, &parse_bindings(env), self.default_limit())
            .await
    }

    /// `run_with_env` bounded by `timeout`
    ///
    /// # Errors
    /// `ExecError::Timeout` when the deadline passes, otherwise as `run`
    #[instrument(skip(self, env), fields(host = %self.handle.target().host))]
    pub async fn run_with_env_timeout(
        &self,
        cmd: &str,
        env: &[String],
        timeout: Duration,
    ) -> Result<String, ExecError> {
        let result = self
            .execute_limited(cmd, &parse_bindings(env), Limit::Deadline(timeout))
            .await?;
        self.classify(result)
    }

    /// `run_with_env` aborted when `token` is cancelled
    ///
    /// # Errors
    /// `ExecError::Cancelled` when the token fires, otherwise as `run`
    #[instrument(skip(self, env, token), fields(host = %self.handle.target().host))]
    pub async fn run_cancellable(
        &self,
        cmd: &str,
        env: &[String],
        token: &CancellationToken,
    ) -> Result<String, ExecError> {
        let result = self
            .execute_limited(cmd, &parse_bindings(env), Limit::Token(token))
            .await?;
        self.classify(result)
    }

    fn default_limit(&self) -> Limit<'static> {
        match self.command_timeout {
            Some(timeout) => Limit::Deadline(timeout),
            None => Limit::Unbounded,
        }
    }

    async fn execute_limited(
        &self,
        cmd: &str,
        env: &[EnvBinding],
        limit: Limit<'_>,
    ) -> Result<CommandResult, ExecError> {
        if cmd.trim().is_empty() {
            return Err(ExecError::Config("empty command".to_string()));
        }

        let mut channel = self.handle.open_channel().await.map_err(|e| match e {
            ExecError::ChannelCreation(source) => ExecError::SessionCreation(source),
            other => other,
        })?;

        let start = Instant::now();

        let outcome = match limit {
            Limit::Unbounded => self.drive(channel.as_mut(), cmd, env).await,
            Limit::Deadline(timeout_duration) => {
                timeout(timeout_duration, self.drive(channel.as_mut(), cmd, env))
                    .await
                    .unwrap_or_else(|_| {
                        error!(
                            command = %cmd,
                            timeout = ?timeout_duration,
                            elapsed = ?start.elapsed(),
                            "command timed out"
                        );
                        Err(ExecError::Timeout {
                            command: cmd.to_string(),
                            timeout: timeout_duration,
                        })
                    })
            }
            Limit::Token(token) => {
                tokio::select! {
                    outcome = self.drive(channel.as_mut(), cmd, env) => outcome,
                    () = token.cancelled() => {
                        debug!(command = %cmd, "command cancelled");
                        Err(ExecError::Cancelled { command: cmd.to_string() })
                    }
                }
            }
        };

        // released on every path, before the outcome is inspected
        if let Err(e) = channel.close().await {
            warn!(command = %cmd, error = %e, "failed to release SSH channel");
        }

        let (stdout, stderr) = outcome?.into_strings();
        let duration = start.elapsed();

        debug!(
            command = %cmd,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            duration = ?duration,
            "remote command completed"
        );

        Ok(CommandResult {
            stdout,
            stderr,
            duration,
        })
    }

    /// Terminal, then environment, then the command itself
    async fn drive(
        &self,
        channel: &mut dyn Channel,
        cmd: &str,
        env: &[EnvBinding],
    ) -> Result<Capture, ExecError> {
        if let Some(pty) = &self.pty {
            channel
                .request_pty(pty)
                .await
                .map_err(ExecError::PtyRequest)?;
        }

        for binding in env {
            debug!(key = %binding.key, "setting remote env");
            channel
                .set_env(&binding.key, &binding.value)
                .await
                .map_err(|source| ExecError::EnvSet {
                    key: binding.key.clone(),
                    source,
                })?;
        }

        let mut capture = Capture::default();

        debug!(command = %cmd, "executing remote command");

        channel
            .run(cmd, &mut capture)
            .await
            .map_err(|source| ExecError::CommandExecution {
                command: cmd.to_string(),
                source,
            })?;

        Ok(capture)
    }

    fn classify(&self, result: CommandResult) -> Result<String, ExecError> {
        if self.stderr_policy.rejects(&result) {
            return Err(ExecError::RemoteStderr {
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }

        if result.has_stderr() {
            debug!(stderr = %result.stderr, "ignoring remote stderr");
        }
        Ok(result.stdout)
    }
}

#[async_trait]
impl RemoteExecutor for CommandExecutor {
    #[instrument(skip(self), fields(host = %self.handle.target().host))]
    async fn run(&self, cmd: &str) -> Result<String, ExecError> {
        let result = self
            .execute_limited(cmd, &[], self.default_limit())
            .await?;
        self.classify(result)
    }

    #[instrument(skip(self, env), fields(host = %self.handle.target().host))]
    async fn run_with_env(&self, cmd: &str, env: &[String]) -> Result<String, ExecError> {
        let result = self
            .execute_limited(cmd, &parse_bindings(env), self.default_limit())
            .await?;
        self.classify(result)
    }

    #[instrument(skip(self), fields(host = %self.handle.target().host))]
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout_duration: Duration,
    ) -> Result<String, ExecError> {
        let result = self
            .execute_limited(cmd, &[], Limit::Deadline(timeout_duration))
            .await?;
        self.classify(result)
    }

    fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    fn executor_type(&self) -> &'static str {
        "ssh"
    }
}
