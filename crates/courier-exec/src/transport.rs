//! Capability interface for the secure transport layer
//!
//! The handle and executor only talk to these traits. [`crate::ssh`]
//! implements them on top of russh; tests substitute an in-process double.

use async_trait::async_trait;

use crate::credential::Credential;
use crate::error::{ExecError, TransportError};
use crate::pty::PtyRequest;
use crate::result::ConnectTarget;

/// Dials and authenticates connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open an authenticated connection to `target`.
    ///
    /// # Errors
    /// `ExecError::Dial` when the host cannot be reached in time,
    /// `ExecError::Authentication` when the credential is rejected,
    /// `ExecError::Credential` when local key material is unusable
    async fn dial(
        &self,
        target: &ConnectTarget,
        credential: &Credential,
    ) -> Result<Box<dyn Connection>, ExecError>;
}

/// One authenticated connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a fresh session channel over this connection
    async fn new_channel(&self) -> Result<Box<dyn Channel>, TransportError>;

    /// Tear the connection down
    async fn close(&self) -> Result<(), TransportError>;
}

/// A single-use session channel
#[async_trait]
pub trait Channel: Send {
    /// Ask the remote to allocate a pseudo-terminal
    async fn request_pty(&mut self, pty: &PtyRequest) -> Result<(), TransportError>;

    /// Ask the remote to set one environment variable
    async fn set_env(&mut self, key: &str, value: &str) -> Result<(), TransportError>;

    /// Run `command`, writing its output streams into `capture`.
    ///
    /// Returns once the remote reports termination. A non-zero exit, a
    /// signal, or a channel closed without exit status is an error.
    async fn run(&mut self, command: &str, capture: &mut Capture) -> Result<(), TransportError>;

    /// Release the channel
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Independent sinks for a command's output streams
#[derive(Debug, Default)]
pub struct Capture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Capture {
    /// Lossy UTF-8 view of both streams
    #[must_use]
    pub fn into_strings(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}
