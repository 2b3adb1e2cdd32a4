use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use courier_exec::{
    CancellationToken, Capture, Channel, CommandExecutor, Connection, ConnectTarget, Credential,
    ErrorKind, ExecError, PtyRequest, RemoteExecutor, StderrPolicy, Transport, TransportError,
    TransportHandle,
};

// Fake transport recording every collaborator call

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Dial(String),
    NewChannel(usize),
    Pty {
        channel: usize,
        term: String,
        cols: u32,
        rows: u32,
    },
    Env {
        channel: usize,
        key: String,
        value: String,
    },
    Run {
        channel: usize,
        command: String,
    },
    CloseChannel(usize),
    CloseConnection,
}

#[derive(Default)]
struct Script {
    dial: Option<ExecError>,
    new_channel: Option<TransportError>,
    pty: Option<TransportError>,
    reject_env: Option<String>,
    close_connection: Option<TransportError>,
    close_channel: Option<TransportError>,
}

#[derive(Default)]
struct Shared {
    script: Script,
    events: Mutex<Vec<Event>>,
    next_channel: AtomicUsize,
}

impl Shared {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

struct FakeTransport {
    shared: Arc<Shared>,
}

impl FakeTransport {
    fn new(script: Script) -> Self {
        Self {
            shared: Arc::new(Shared {
                script,
                ..Shared::default()
            }),
        }
    }

    fn events(&self) -> Vec<Event> {
        self.shared.events.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn dial(
        &self,
        target: &ConnectTarget,
        _credential: &Credential,
    ) -> Result<Box<dyn Connection>, ExecError> {
        self.shared.record(Event::Dial(target.address()));
        if let Some(err) = &self.shared.script.dial {
            return Err(err.clone());
        }
        Ok(Box::new(FakeConnection {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct FakeConnection {
    shared: Arc<Shared>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn new_channel(&self) -> Result<Box<dyn Channel>, TransportError> {
        if let Some(err) = &self.shared.script.new_channel {
            return Err(err.clone());
        }
        let id = self.shared.next_channel.fetch_add(1, Ordering::SeqCst);
        self.shared.record(Event::NewChannel(id));
        Ok(Box::new(FakeChannel {
            id,
            shared: Arc::clone(&self.shared),
            env: HashMap::new(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.record(Event::CloseConnection);
        match &self.shared.script.close_connection {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

struct FakeChannel {
    id: usize,
    shared: Arc<Shared>,
    env: HashMap<String, String>,
}

#[async_trait]
impl Channel for FakeChannel {
    async fn request_pty(&mut self, pty: &PtyRequest) -> Result<(), TransportError> {
        self.shared.record(Event::Pty {
            channel: self.id,
            term: pty.term.clone(),
            cols: pty.cols,
            rows: pty.rows,
        });
        match &self.shared.script.pty {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn set_env(&mut self, key: &str, value: &str) -> Result<(), TransportError> {
        self.shared.record(Event::Env {
            channel: self.id,
            key: key.to_string(),
            value: value.to_string(),
        });
        if self.shared.script.reject_env.as_deref() == Some(key) {
            return Err(TransportError::Rejected("env"));
        }
        self.env.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn run(&mut self, command: &str, capture: &mut Capture) -> Result<(), TransportError> {
        self.shared.record(Event::Run {
            channel: self.id,
            command: command.to_string(),
        });

        match command {
            "echo hello" => {
                capture.stdout.extend_from_slice(b"hello\n");
                Ok(())
            }
            "warn" => {
                capture.stdout.extend_from_slice(b"partial\n");
                capture.stderr.extend_from_slice(b"warning: low disk\n");
                Ok(())
            }
            "sleep forever" => {
                std::future::pending::<()>().await;
                Ok(())
            }
            _ if command.starts_with("echo $") => {
                let var = &command["echo $".len()..];
                let value = self.env.get(var).cloned().unwrap_or_default();
                capture.stdout.extend_from_slice(format!("{value}\n").as_bytes());
                Ok(())
            }
            _ => {
                capture
                    .stderr
                    .extend_from_slice(format!("sh: {command}: command not found\n").as_bytes());
                Err(TransportError::ExitStatus(127))
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.shared.record(Event::CloseChannel(self.id));
        match &self.shared.script.close_channel {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn target() -> ConnectTarget {
    ConnectTarget::new("test-host", "tester").with_port(2222)
}

async fn connected(transport: &FakeTransport) -> Arc<TransportHandle> {
    let handle = TransportHandle::connect(transport, target(), &Credential::password("secret"))
        .await
        .expect("fake dial should succeed");
    Arc::new(handle)
}

fn env(entries: &[&str]) -> Vec<String> {
    entries.iter().map(ToString::to_string).collect()
}

fn assert_released_once(transport: &FakeTransport) {
    let opened = transport.count(|e| matches!(e, Event::NewChannel(_)));
    let closed = transport.count(|e| matches!(e, Event::CloseChannel(_)));
    assert_eq!(opened, closed, "every channel must be released: {:?}", transport.events());
    for id in 0..opened {
        assert_eq!(
            transport.count(|e| *e == Event::CloseChannel(id)),
            1,
            "channel {id} released more than once"
        );
    }
}

// Connection lifecycle

#[tokio::test]
async fn test_never_connected_handle_has_no_connection() {
    let handle = Arc::new(TransportHandle::disconnected(target()));
    let executor = CommandExecutor::new(Arc::clone(&handle));

    assert!(!executor.is_connected());
    assert!(matches!(handle.open_channel().await, Err(ExecError::NoConnection)));
    assert!(matches!(
        executor.run("echo hello").await,
        Err(ExecError::NoConnection)
    ));
    assert!(handle.close().await.is_ok());
}

#[tokio::test]
async fn test_run_after_close_fails_without_transport_io() {
    let transport = FakeTransport::new(Script::default());
    let handle = connected(&transport).await;
    let executor = CommandExecutor::new(Arc::clone(&handle));

    handle.close().await.unwrap();

    let err = executor
        .run_with_env("echo $FOO", &env(&["FOO=bar"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::NoConnection));
    assert_eq!(
        transport.events(),
        vec![Event::Dial("test-host:2222".to_string()), Event::CloseConnection]
    );
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let transport = FakeTransport::new(Script::default());
    let handle = connected(&transport).await;

    assert!(handle.is_connected());
    handle.close().await.unwrap();
    handle.close().await.unwrap();

    assert!(!handle.is_connected());
    assert_eq!(transport.count(|e| *e == Event::CloseConnection), 1);
}

#[tokio::test]
async fn test_failed_disconnect_still_closes_handle() {
    let transport = FakeTransport::new(Script {
        close_connection: Some(TransportError::Protocol("broken pipe".to_string())),
        ..Script::default()
    });
    let handle = connected(&transport).await;
    let executor = CommandExecutor::new(Arc::clone(&handle));

    let err = handle.close().await.unwrap_err();

    assert!(matches!(
        err,
        ExecError::Disconnect(TransportError::Protocol(ref reason)) if reason == "broken pipe"
    ));
    assert!(!handle.is_connected());
    assert!(handle.close().await.is_ok());
    assert_eq!(transport.count(|e| *e == Event::CloseConnection), 1);
    assert!(matches!(
        executor.run("echo hello").await,
        Err(ExecError::NoConnection)
    ));
}

#[tokio::test]
async fn test_dial_failure_is_surfaced() {
    let transport = FakeTransport::new(Script {
        dial: Some(ExecError::Authentication {
            user: "tester".to_string(),
            host: "test-host".to_string(),
            port: 2222,
            reason: "password authentication rejected".to_string(),
        }),
        ..Script::default()
    });

    let err = TransportHandle::connect(&transport, target(), &Credential::password("wrong"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert!(err.to_string().contains("tester@test-host:2222"));
}

#[tokio::test]
async fn test_port_zero_rejected_before_dial() {
    let transport = FakeTransport::new(Script::default());

    let err = TransportHandle::connect(
        &transport,
        target().with_port(0),
        &Credential::password("secret"),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ExecError::Config(_)));
    assert!(transport.events().is_empty());
}

// Command protocol

#[tokio::test]
async fn test_echo_hello() {
    let transport = FakeTransport::new(Script::default());
    let executor = CommandExecutor::new(connected(&transport).await);

    let stdout = executor.run("echo hello").await.unwrap();

    assert_eq!(stdout, "hello\n");
    assert_eq!(
        transport.events(),
        vec![
            Event::Dial("test-host:2222".to_string()),
            Event::NewChannel(0),
            Event::Pty {
                channel: 0,
                term: "xterm".to_string(),
                cols: 80,
                rows: 40,
            },
            Event::Run {
                channel: 0,
                command: "echo hello".to_string(),
            },
            Event::CloseChannel(0),
        ]
    );
}

#[tokio::test]
async fn test_run_with_env_applies_binding() {
    let transport = FakeTransport::new(Script::default());
    let executor = CommandExecutor::new(connected(&transport).await);

    let stdout = executor
        .run_with_env("echo $FOO", &env(&["FOO=bar"]))
        .await
        .unwrap();

    assert_eq!(stdout, "bar\n");
    assert_released_once(&transport);
}

#[tokio::test]
async fn test_malformed_env_entries_are_skipped() {
    let transport = FakeTransport::new(Script::default());
    let executor = CommandExecutor::new(connected(&transport).await);

    let stdout = executor
        .run_with_env(
            "echo $FOO",
            &env(&["NOEQUALS", "=VALUE", "KEY=", "A=B=C", "FOO=bar"]),
        )
        .await
        .unwrap();

    assert_eq!(stdout, "bar\n");
    let applied: Vec<_> = transport
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Env { key, value, .. } => Some((key, value)),
            _ => None,
        })
        .collect();
    assert_eq!(applied, vec![("FOO".to_string(), "bar".to_string())]);
}

#[tokio::test]
async fn test_pty_precedes_env_precedes_run() {
    let transport = FakeTransport::new(Script::default());
    let executor = CommandExecutor::new(connected(&transport).await);

    executor
        .run_with_env("echo $A", &env(&["A=1", "B=2"]))
        .await
        .unwrap();

    let events = transport.events();
    let position = |pred: &dyn Fn(&Event) -> bool| events.iter().position(|e| pred(e)).unwrap();
    let pty = position(&|e| matches!(e, Event::Pty { .. }));
    let env_a = position(&|e| matches!(e, Event::Env { key, .. } if key == "A"));
    let env_b = position(&|e| matches!(e, Event::Env { key, .. } if key == "B"));
    let run = position(&|e| matches!(e, Event::Run { .. }));

    assert!(pty < env_a);
    assert!(env_a < env_b);
    assert!(env_b < run);
}

#[tokio::test]
async fn test_stderr_output_fails_but_keeps_stdout() {
    let transport = FakeTransport::new(Script::default());
    let executor = CommandExecutor::new(connected(&transport).await);

    let err = executor.run("warn").await.unwrap_err();

    assert_eq!(err.to_string(), "warning: low disk\n");
    assert_eq!(err.captured_stdout(), Some("partial\n"));
    assert_eq!(err.kind(), ErrorKind::RemoteStderr);
    assert_released_once(&transport);
}

#[tokio::test]
async fn test_lenient_policy_ignores_stderr() {
    let transport = FakeTransport::new(Script::default());
    let executor = CommandExecutor::new(connected(&transport).await)
        .with_stderr_policy(StderrPolicy::Lenient);

    let stdout = executor.run("warn").await.unwrap();

    assert_eq!(stdout, "partial\n");
}

#[tokio::test]
async fn test_execute_returns_both_streams() {
    let transport = FakeTransport::new(Script::default());
    let executor = CommandExecutor::new(connected(&transport).await);

    let result = executor.execute::<&str>("warn", &[]).await.unwrap();

    assert_eq!(result.stdout, "partial\n");
    assert_eq!(result.stderr, "warning: low disk\n");
}

#[tokio::test]
async fn test_command_not_found_discards_output() {
    let transport = FakeTransport::new(Script::default());
    let executor = CommandExecutor::new(connected(&transport).await);

    let err = executor.run("nonexistent-binary-xyz").await.unwrap_err();

    match err {
        ExecError::CommandExecution { command, source } => {
            assert_eq!(command, "nonexistent-binary-xyz");
            assert_eq!(source, TransportError::ExitStatus(127));
        }
        other => panic!("expected CommandExecution, got {other:?}"),
    }
    assert_released_once(&transport);
}

#[tokio::test]
async fn test_empty_command_rejected_before_channel() {
    let transport = FakeTransport::new(Script::default());
    let executor = CommandExecutor::new(connected(&transport).await);

    let err = executor.run("   ").await.unwrap_err();

    assert!(matches!(err, ExecError::Config(_)));
    assert_eq!(transport.count(|e| matches!(e, Event::NewChannel(_))), 0);
}

// Stage failures

#[tokio::test]
async fn test_channel_refusal_is_session_creation_error() {
    let transport = FakeTransport::new(Script {
        new_channel: Some(TransportError::Protocol("channel limit reached".to_string())),
        ..Script::default()
    });
    let handle = connected(&transport).await;
    let executor = CommandExecutor::new(Arc::clone(&handle));

    assert!(matches!(
        handle.open_channel().await,
        Err(ExecError::ChannelCreation(_))
    ));

    let err = executor.run("echo hello").await.unwrap_err();
    assert!(matches!(err, ExecError::SessionCreation(_)));
    assert_eq!(err.kind(), ErrorKind::ChannelAcquisition);
    assert!(err.to_string().contains("channel limit reached"));
}

#[tokio::test]
async fn test_pty_failure_stops_before_env_and_run() {
    let transport = FakeTransport::new(Script {
        pty: Some(TransportError::Rejected("pty-req")),
        ..Script::default()
    });
    let executor = CommandExecutor::new(connected(&transport).await);

    let err = executor
        .run_with_env("echo $FOO", &env(&["FOO=bar"]))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::PtyRequest(_)));
    assert_eq!(transport.count(|e| matches!(e, Event::Env { .. })), 0);
    assert_eq!(transport.count(|e| matches!(e, Event::Run { .. })), 0);
    assert_released_once(&transport);
}

#[tokio::test]
async fn test_env_rejection_abandons_remaining_entries() {
    let transport = FakeTransport::new(Script {
        reject_env: Some("SECOND".to_string()),
        ..Script::default()
    });
    let executor = CommandExecutor::new(connected(&transport).await);

    let err = executor
        .run_with_env("echo $FIRST", &env(&["FIRST=1", "SECOND=2", "THIRD=3"]))
        .await
        .unwrap_err();

    match &err {
        ExecError::EnvSet { key, source } => {
            assert_eq!(key, "SECOND");
            assert_eq!(*source, TransportError::Rejected("env"));
        }
        other => panic!("expected EnvSet, got {other:?}"),
    }
    assert_eq!(transport.count(|e| matches!(e, Event::Env { .. })), 2);
    assert_eq!(transport.count(|e| matches!(e, Event::Run { .. })), 0);
    assert_released_once(&transport);
}

#[tokio::test]
async fn test_without_pty_skips_negotiation() {
    let transport = FakeTransport::new(Script {
        pty: Some(TransportError::Rejected("pty-req")),
        ..Script::default()
    });
    let executor = CommandExecutor::new(connected(&transport).await).without_pty();

    let stdout = executor.run("echo hello").await.unwrap();

    assert_eq!(stdout, "hello\n");
    assert_eq!(transport.count(|e| matches!(e, Event::Pty { .. })), 0);
}

#[tokio::test]
async fn test_custom_pty_is_requested() {
    let transport = FakeTransport::new(Script::default());
    let executor = CommandExecutor::new(connected(&transport).await)
        .with_pty(PtyRequest::default().with_term("vt100").with_size(132, 24));

    executor.run("echo hello").await.unwrap();

    assert!(transport.events().contains(&Event::Pty {
        channel: 0,
        term: "vt100".to_string(),
        cols: 132,
        rows: 24,
    }));
}

// Resource discipline

#[tokio::test]
async fn test_every_branch_releases_its_channel() {
    let transport = FakeTransport::new(Script {
        reject_env: Some("BAD".to_string()),
        ..Script::default()
    });
    let executor = CommandExecutor::new(connected(&transport).await);

    assert!(executor.run("echo hello").await.is_ok());
    assert!(executor.run("warn").await.is_err());
    assert!(executor.run("nonexistent-binary-xyz").await.is_err());
    assert!(
        executor
            .run_with_env("echo $BAD", &env(&["BAD=1"]))
            .await
            .is_err()
    );
    assert!(
        executor
            .run_with_timeout("sleep forever", Duration::from_millis(20))
            .await
            .is_err()
    );

    assert_eq!(transport.count(|e| matches!(e, Event::NewChannel(_))), 5);
    assert_released_once(&transport);
}

#[tokio::test]
async fn test_failed_release_does_not_mask_outcome() {
    let transport = FakeTransport::new(Script {
        close_channel: Some(TransportError::ChannelClosed),
        ..Script::default()
    });
    let executor = CommandExecutor::new(connected(&transport).await);

    assert_eq!(executor.run("echo hello").await.unwrap(), "hello\n");

    let err = executor.run("nonexistent-binary-xyz").await.unwrap_err();
    assert!(matches!(
        err,
        ExecError::CommandExecution {
            source: TransportError::ExitStatus(127),
            ..
        }
    ));
    assert_released_once(&transport);
}

#[tokio::test]
async fn test_timeout_releases_channel() {
    let transport = FakeTransport::new(Script::default());
    let executor = CommandExecutor::new(connected(&transport).await);

    let err = executor
        .run_with_timeout("sleep forever", Duration::from_millis(50))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ExecError::Timeout { ref command, timeout }
            if command == "sleep forever" && timeout == Duration::from_millis(50)
    ));
    assert!(err.is_retryable());
    assert_released_once(&transport);
}

#[tokio::test]
async fn test_default_command_timeout_applies_to_run() {
    let transport = FakeTransport::new(Script::default());
    let executor = CommandExecutor::new(connected(&transport).await)
        .with_command_timeout(Duration::from_millis(20));

    let err = executor.run("sleep forever").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_released_once(&transport);
}

#[tokio::test]
async fn test_cancellation_releases_channel() {
    let transport = FakeTransport::new(Script::default());
    let executor = CommandExecutor::new(connected(&transport).await);
    let token = CancellationToken::new();

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        })
    };

    let err = executor
        .run_cancellable("sleep forever", &[], &token)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, ExecError::Cancelled { .. }));
    assert_eq!(transport.count(|e| matches!(e, Event::Run { .. })), 1);
    assert_released_once(&transport);
}

#[tokio::test]
async fn test_uncancelled_token_lets_command_finish() {
    let transport = FakeTransport::new(Script::default());
    let executor = CommandExecutor::new(connected(&transport).await);
    let token = CancellationToken::new();

    let stdout = executor
        .run_cancellable("echo $FOO", &env(&["FOO=bar"]), &token)
        .await
        .unwrap();

    assert_eq!(stdout, "bar\n");
}
