//! courier-exec: Remote command execution over SSH
//!
//! A [`TransportHandle`] owns one authenticated connection; a
//! [`CommandExecutor`] runs one command per channel on top of it. The SSH
//! layer sits behind the [`Transport`] traits, with [`SshTransport`] as the
//! russh implementation.

pub mod credential;
pub mod env;
pub mod error;
pub mod executor;
pub mod handle;
pub mod pty;
pub mod result;
pub mod ssh;
pub mod traits;
pub mod transport;

pub use credential::{Credential, KeyError};
pub use env::{EnvBinding, parse_bindings};
pub use error::{ErrorKind, ExecError, TransportError};
pub use executor::{CommandExecutor, StderrPolicy};
pub use handle::TransportHandle;
pub use pty::{PtyRequest, TerminalMode};
pub use result::{CommandResult, ConnectTarget};
pub use ssh::SshTransport;
pub use traits::RemoteExecutor;
pub use transport::{Capture, Channel, Connection, Transport};

pub use tokio_util::sync::CancellationToken;
