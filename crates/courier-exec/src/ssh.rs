//! SSH transport using russh crate

use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use russh::keys::{PrivateKeyWithHashAlg, ssh_key};
use russh::{ChannelMsg, Disconnect, Pty};
use secrecy::{ExposeSecret, SecretString};
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::credential::Credential;
use crate::error::{ExecError, TransportError};
use crate::pty::{PtyRequest, TerminalMode};
use crate::result::ConnectTarget;
use crate::transport::{Capture, Channel, Connection, Transport};

/// Upper bound on keyboard-interactive challenge rounds
const MAX_INTERACTIVE_ROUNDS: usize = 8;

impl From<russh::Error> for TransportError {
    fn from(e: russh::Error) -> Self {
        TransportError::Protocol(e.to_string())
    }
}

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (like StrictHostKeyChecking=no)
        Ok(true)
    }
}

/// Transport that dials real SSH servers
#[derive(Clone)]
pub struct SshTransport {
    config: Arc<client::Config>,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport").finish_non_exhaustive()
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new(client::Config::default())
    }
}

impl SshTransport {
    /// Transport with a custom russh client configuration
    #[must_use]
    pub fn new(config: client::Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    #[instrument(skip(self, credential), fields(host = %target.host, port = target.port))]
    async fn dial(
        &self,
        target: &ConnectTarget,
        credential: &Credential,
    ) -> Result<Box<dyn Connection>, ExecError> {
        let dial_error = |source: TransportError| ExecError::Dial {
            host: target.host.clone(),
            port: target.port,
            source,
        };

        let connect = client::connect(
            Arc::clone(&self.config),
            (target.host.as_str(), target.port),
            SshClientHandler,
        );

        let mut session = timeout(target.timeout, connect)
            .await
            .map_err(|_| dial_error(TransportError::TimedOut(target.timeout)))?
            .map_err(|e| dial_error(e.into()))?;

        let auth_error = |reason: String| ExecError::Authentication {
            user: target.user.clone(),
            host: target.host.clone(),
            port: target.port,
            reason,
        };

        let accepted = authenticate(&mut session, &target.user, credential)
            .await
            .map_err(|e| match e {
                AuthFailure::Key(reason) => ExecError::Credential(reason),
                AuthFailure::Transport(reason) => auth_error(reason),
            })?;

        if !accepted {
            return Err(auth_error(format!(
                "{} authentication rejected",
                credential.method()
            )));
        }

        Ok(Box::new(SshConnection { handle: session }))
    }
}

enum AuthFailure {
    /// Local key material problem
    Key(String),
    /// Protocol failure during authentication
    Transport(String),
}

impl From<russh::Error> for AuthFailure {
    fn from(e: russh::Error) -> Self {
        AuthFailure::Transport(e.to_string())
    }
}

async fn authenticate(
    session: &mut client::Handle<SshClientHandler>,
    user: &str,
    credential: &Credential,
) -> Result<bool, AuthFailure> {
    match credential {
        Credential::Password(password) => {
            let result = session
                .authenticate_password(user, password.expose_secret().as_str())
                .await?;
            Ok(result.success())
        }
        Credential::KeyFile { .. } | Credential::KeyEnv { .. } => {
            let key = credential
                .private_key()
                .map_err(|e| AuthFailure::Key(e.to_string()))?
                .ok_or_else(|| AuthFailure::Key("no private key available".to_string()))?;

            let hash_alg = session.best_supported_rsa_hash().await?.flatten();
            let result = session
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await?;
            Ok(result.success())
        }
        Credential::Agent => authenticate_with_agent(session, user).await,
        Credential::KeyboardInteractive { responses } => {
            let mut remaining = responses.iter();
            let mut reply = session
                .authenticate_keyboard_interactive_start(user, None::<String>)
                .await?;

            for _ in 0..MAX_INTERACTIVE_ROUNDS {
                match reply {
                    KeyboardInteractiveAuthResponse::Success => return Ok(true),
                    KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                    KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                        debug!(prompts = prompts.len(), "answering keyboard-interactive prompts");
                        let Some(answers) = next_answers(&mut remaining, prompts.len()) else {
                            debug!("out of keyboard-interactive responses");
                            return Ok(false);
                        };
                        reply = session
                            .authenticate_keyboard_interactive_respond(answers)
                            .await?;
                    }
                }
            }
            Ok(false)
        }
    }
}

/// Take the answers for one challenge round.
///
/// Responses are consumed across rounds, so a password round followed by an
/// OTP round gets the first and then the second response. `None` when fewer
/// responses remain than the server asked for.
fn next_answers<'a, I>(remaining: &mut I, prompts: usize) -> Option<Vec<String>>
where
    I: Iterator<Item = &'a SecretString>,
{
    let answers: Vec<String> = remaining
        .by_ref()
        .take(prompts)
        .map(|r| r.expose_secret().clone())
        .collect();
    (answers.len() == prompts).then_some(answers)
}

#[cfg(unix)]
async fn authenticate_with_agent(
    session: &mut client::Handle<SshClientHandler>,
    user: &str,
) -> Result<bool, AuthFailure> {
    use russh::keys::agent::client::AgentClient;

    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| AuthFailure::Key(format!("SSH agent not available: {e}")))?;

    let keys = agent
        .request_identities()
        .await
        .map_err(|e| AuthFailure::Key(format!("failed to list agent keys: {e}")))?;

    if keys.is_empty() {
        return Err(AuthFailure::Key("no keys in SSH agent".to_string()));
    }

    let hash_alg = session.best_supported_rsa_hash().await?.flatten();

    for key in &keys {
        match session
            .authenticate_publickey_with(user, key.clone(), hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            _ => continue,
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(
    _session: &mut client::Handle<SshClientHandler>,
    _user: &str,
) -> Result<bool, AuthFailure> {
    Err(AuthFailure::Key(
        "SSH agent authentication is only supported on unix".to_string(),
    ))
}

/// Live russh session
struct SshConnection {
    handle: client::Handle<SshClientHandler>,
}

#[async_trait]
impl Connection for SshConnection {
    async fn new_channel(&self) -> Result<Box<dyn Channel>, TransportError> {
        let channel = self.handle.channel_open_session().await?;
        Ok(Box::new(SshChannel { channel }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }
}

/// One russh session channel
struct SshChannel {
    channel: russh::Channel<client::Msg>,
}

impl SshChannel {
    /// Wait for the answer to a `want_reply` request
    async fn await_reply(&mut self, request: &'static str) -> Result<(), TransportError> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => return Err(TransportError::Rejected(request)),
                Some(ChannelMsg::Close) | None => return Err(TransportError::ChannelClosed),
                Some(_) => {}
            }
        }
    }
}

/// Folds the messages of an `exec` channel into its outcome
#[derive(Debug, Default)]
struct ExitTracker {
    exit_status: Option<u32>,
    signal: Option<(String, String)>,
    got_eof: bool,
    rejected: bool,
}

impl ExitTracker {
    /// Record one message. `None` means the channel is gone.
    fn observe(&mut self, msg: Option<ChannelMsg>, capture: &mut Capture) -> ControlFlow<()> {
        match msg {
            Some(ChannelMsg::Data { data }) => {
                capture.stdout.extend_from_slice(&data);
            }
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                if ext == 1 {
                    // stderr
                    capture.stderr.extend_from_slice(&data);
                }
            }
            Some(ChannelMsg::Failure) => {
                self.rejected = true;
                return ControlFlow::Break(());
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                self.exit_status = Some(exit_status);
                if self.got_eof {
                    return ControlFlow::Break(());
                }
            }
            Some(ChannelMsg::ExitSignal {
                signal_name,
                error_message,
                ..
            }) => {
                self.signal = Some((format!("{signal_name:?}"), error_message));
            }
            Some(ChannelMsg::Eof) => {
                self.got_eof = true;
                if self.exit_status.is_some() {
                    return ControlFlow::Break(());
                }
            }
            Some(ChannelMsg::Close) | None => return ControlFlow::Break(()),
            Some(_) => {}
        }
        ControlFlow::Continue(())
    }

    fn finish(self) -> Result<(), TransportError> {
        if self.rejected {
            return Err(TransportError::Rejected("exec"));
        }

        if let Some((signal, message)) = self.signal {
            return Err(TransportError::ExitSignal { signal, message });
        }

        match self.exit_status {
            Some(0) => Ok(()),
            Some(status) => Err(TransportError::ExitStatus(status)),
            None => Err(TransportError::ChannelClosed),
        }
    }
}

fn pty_mode(mode: TerminalMode) -> Pty {
    match mode {
        TerminalMode::Echo => Pty::ECHO,
        TerminalMode::InputSpeed => Pty::TTY_OP_ISPEED,
        TerminalMode::OutputSpeed => Pty::TTY_OP_OSPEED,
    }
}

#[async_trait]
impl Channel for SshChannel {
    async fn request_pty(&mut self, pty: &PtyRequest) -> Result<(), TransportError> {
        let modes: Vec<(Pty, u32)> = pty
            .modes
            .iter()
            .map(|&(mode, value)| (pty_mode(mode), value))
            .collect();

        self.channel
            .request_pty(true, &pty.term, pty.cols, pty.rows, 0, 0, &modes)
            .await?;
        self.await_reply("pty-req").await
    }

    async fn set_env(&mut self, key: &str, value: &str) -> Result<(), TransportError> {
        self.channel.set_env(true, key, value).await?;
        self.await_reply("env").await
    }

    async fn run(&mut self, command: &str, capture: &mut Capture) -> Result<(), TransportError> {
        self.channel.exec(true, command).await?;

        let mut tracker = ExitTracker::default();
        loop {
            let msg = self.channel.wait().await;
            if tracker.observe(msg, capture).is_break() {
                break;
            }
        }
        tracker.finish()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.channel.close().await?;
        Ok(())
    }
}
