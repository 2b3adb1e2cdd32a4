//! Error types for courier-exec

use std::time::Duration;

use thiserror::Error;

/// Failures reported by the transport collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Protocol or I/O failure inside the SSH layer
    #[error("{0}")]
    Protocol(String),

    /// Remote answered a channel request with a failure
    #[error("{0} request rejected by remote")]
    Rejected(&'static str),

    /// Operation did not finish in time
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// Remote process exited with a non-zero status
    #[error("process exited with status {0}")]
    ExitStatus(u32),

    /// Remote process was terminated by a signal
    #[error("process killed by signal {signal}: {message}")]
    ExitSignal {
        /// Signal name as reported by the server
        signal: String,
        /// Error message attached to the signal, may be empty
        message: String,
    },

    /// Channel closed before the remote reported an exit status
    #[error("channel closed without exit status")]
    ChannelClosed,
}

/// Errors that can occur during remote execution
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// No live connection on the handle
    #[error("no live SSH connection")]
    NoConnection,

    /// Failed to reach the remote host
    #[error("error dialing host: {host} on port: {port}: {source}")]
    Dial {
        host: String,
        port: u16,
        #[source]
        source: TransportError,
    },

    /// Credential rejected by the remote host
    #[error("authentication failed for {user}@{host}:{port}: {reason}")]
    Authentication {
        user: String,
        host: String,
        port: u16,
        reason: String,
    },

    /// Local key material could not be used
    #[error("credential error: {0}")]
    Credential(String),

    /// Transport refused to open a channel
    #[error("error creating new SSH channel: {0}")]
    ChannelCreation(#[source] TransportError),

    /// Channel for a command could not be acquired
    #[error("error creating new SSH session: {0}")]
    SessionCreation(#[source] TransportError),

    /// Pseudo-terminal negotiation rejected
    #[error("request for pseudo terminal failed: {0}")]
    PtyRequest(#[source] TransportError),

    /// Remote refused an environment assignment
    #[error("error setting env {key} for cmd: {source}")]
    EnvSet {
        key: String,
        #[source]
        source: TransportError,
    },

    /// Remote command failed to run or exited abnormally
    #[error("error running: {command}: {source}")]
    CommandExecution {
        command: String,
        #[source]
        source: TransportError,
    },

    /// Command exited cleanly but wrote to its error stream.
    ///
    /// Displays the captured stderr verbatim.
    #[error("{stderr}")]
    RemoteStderr {
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
    },

    /// Command exceeded its deadline
    #[error("command timed out after {timeout:?}: {command}")]
    Timeout {
        command: String,
        timeout: Duration,
    },

    /// Command was cancelled by the caller
    #[error("command cancelled: {command}")]
    Cancelled { command: String },

    /// Disconnecting from the remote host failed
    #[error("error closing SSH connection: {0}")]
    Disconnect(#[source] TransportError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Coarse classification of an [`ExecError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoConnection,
    Dial,
    Authentication,
    Credential,
    ChannelAcquisition,
    Configuration,
    CommandExecution,
    RemoteStderr,
    Timeout,
    Cancelled,
    Disconnect,
    InvalidConfig,
}

impl ExecError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::Dial { .. } | ExecError::Timeout { .. })
    }

    /// Classify the stage that produced this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::NoConnection => ErrorKind::NoConnection,
            ExecError::Dial { .. } => ErrorKind::Dial,
            ExecError::Authentication { .. } => ErrorKind::Authentication,
            ExecError::Credential(_) => ErrorKind::Credential,
            ExecError::ChannelCreation(_) | ExecError::SessionCreation(_) => {
                ErrorKind::ChannelAcquisition
            }
            ExecError::PtyRequest(_) | ExecError::EnvSet { .. } => ErrorKind::Configuration,
            ExecError::CommandExecution { .. } => ErrorKind::CommandExecution,
            ExecError::RemoteStderr { .. } => ErrorKind::RemoteStderr,
            ExecError::Timeout { .. } => ErrorKind::Timeout,
            ExecError::Cancelled { .. } => ErrorKind::Cancelled,
            ExecError::Disconnect(_) => ErrorKind::Disconnect,
            ExecError::Config(_) => ErrorKind::InvalidConfig,
        }
    }

    /// Stdout that survived the failure, if any
    #[must_use]
    pub fn captured_stdout(&self) -> Option<&str> {
        match self {
            ExecError::RemoteStderr { stdout, .. } => Some(stdout),
            _ => None,
        }
    }
}
