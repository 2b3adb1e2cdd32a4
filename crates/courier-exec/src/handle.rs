//! Owner of one authenticated connection

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::credential::Credential;
use crate::error::ExecError;
use crate::result::ConnectTarget;
use crate::transport::{Channel, Connection, Transport};

/// Transport handle
///
/// Either live (holds a connection) or closed. Channels for individual
/// commands are created on demand; only [`TransportHandle::close`] releases
/// the connection.
pub struct TransportHandle {
    target: ConnectTarget,
    connection: Mutex<Option<Arc<dyn Connection>>>,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("target", &self.target)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl TransportHandle {
    /// Dial and authenticate
    ///
    /// # Errors
    /// Returns `ExecError::Config` for port 0, otherwise whatever the
    /// transport reports (`Dial`, `Authentication`, `Credential`)
    #[instrument(skip(transport, credential), fields(host = %target.host, port = target.port))]
    pub async fn connect(
        transport: &dyn Transport,
        target: ConnectTarget,
        credential: &Credential,
    ) -> Result<Self, ExecError> {
        if target.port == 0 {
            return Err(ExecError::Config(format!(
                "invalid port 0 for host {}",
                target.host
            )));
        }

        info!(
            host = %target.host,
            port = target.port,
            user = %target.user,
            method = credential.method(),
            "connecting to SSH"
        );

        let connection = transport.dial(&target, credential).await?;

        info!(host = %target.host, "SSH connected and authenticated");

        Ok(Self {
            target,
            connection: Mutex::new(Some(Arc::from(connection))),
        })
    }

    /// A handle that was never connected
    #[must_use]
    pub fn disconnected(target: ConnectTarget) -> Self {
        Self {
            target,
            connection: Mutex::new(None),
        }
    }

    /// Get connection target
    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    /// Whether the handle currently holds a connection
    pub fn is_connected(&self) -> bool {
        self.connection
            .try_lock()
            .map(|c| c.is_some())
            .unwrap_or(false)
    }

    /// Open a fresh execution channel
    ///
    /// # Errors
    /// `ExecError::NoConnection` if the handle is closed,
    /// `ExecError::ChannelCreation` if the transport refuses
    pub async fn open_channel(&self) -> Result<Box<dyn Channel>, ExecError> {
        // clone out so the lock is not held across transport I/O
        let connection = self
            .connection
            .lock()
            .await
            .clone()
            .ok_or(ExecError::NoConnection)?;

        connection
            .new_channel()
            .await
            .map_err(ExecError::ChannelCreation)
    }

    /// Release the connection. Closing a closed handle is a no-op.
    ///
    /// # Errors
    /// Returns `ExecError::Disconnect` if the transport fails while
    /// disconnecting; the handle is closed either way
    pub async fn close(&self) -> Result<(), ExecError> {
        let Some(connection) = self.connection.lock().await.take() else {
            return Ok(());
        };

        match connection.close().await {
            Ok(()) => {
                info!(host = %self.target.host, "SSH disconnected");
                Ok(())
            }
            Err(e) => {
                warn!(host = %self.target.host, error = %e, "SSH disconnect failed");
                Err(ExecError::Disconnect(e))
            }
        }
    }
}
