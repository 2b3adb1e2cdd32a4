//! courier CLI
//!
//! Runs shell commands on remote hosts over SSH and prints their output

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use courier_exec::{
    CommandExecutor, CommandResult, ConnectTarget, Credential, ExecError, RemoteExecutor,
    SshTransport, StderrPolicy, TransportHandle,
};
use eyre::{WrapErr, eyre};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::{AuthConfig, Config};

#[derive(Parser)]
#[command(name = "courier", version)]
#[command(about = "Run shell commands on remote hosts over SSH", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on a remote host
    Run(RunArgs),
    /// List configured hosts
    Hosts,
}

#[derive(Args)]
struct RunArgs {
    /// Configured host name
    #[arg(short, long, conflicts_with = "host")]
    target: Option<String>,

    /// Remote address
    #[arg(long)]
    host: Option<String>,

    /// SSH port
    #[arg(short, long)]
    port: Option<u16>,

    /// SSH user
    #[arg(short, long)]
    user: Option<String>,

    #[command(flatten)]
    auth: AuthArgs,

    /// Environment variable holding the key passphrase
    #[arg(long, value_name = "VAR")]
    passphrase_env: Option<String>,

    /// Remote environment binding, may be repeated
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Command deadline in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Dial timeout in seconds
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u64>,

    /// Do not treat stderr output as failure
    #[arg(long)]
    lenient_stderr: bool,

    /// Skip pseudo-terminal allocation
    #[arg(long)]
    no_pty: bool,

    /// Print both streams as JSON instead of stdout. The stderr policy
    /// still sets the exit code.
    #[arg(long)]
    json: bool,

    /// Command line passed to the remote shell
    #[arg(required = true, trailing_var_arg = true, num_args = 1..)]
    command: Vec<String>,
}

#[derive(Args)]
#[group(multiple = false)]
struct AuthArgs {
    /// Environment variable holding the password
    #[arg(long, value_name = "VAR")]
    password_env: Option<String>,

    /// Private key file
    #[arg(long, value_name = "PATH")]
    key: Option<String>,

    /// Environment variable holding a base64-encoded private key
    #[arg(long, value_name = "VAR")]
    key_env: Option<String>,

    /// Authenticate with ssh-agent
    #[arg(long)]
    agent: bool,

    /// Environment variable holding newline-separated keyboard-interactive responses
    #[arg(long, value_name = "VAR")]
    interactive_env: Option<String>,
}

impl AuthArgs {
    /// Auth selected on the command line, if any
    fn auth_config(&self, passphrase_env: Option<&str>) -> Option<AuthConfig> {
        let passphrase_env = passphrase_env.map(ToString::to_string);
        if let Some(password_env) = &self.password_env {
            Some(AuthConfig::Password {
                password_env: password_env.clone(),
            })
        } else if let Some(path) = &self.key {
            Some(AuthConfig::Key {
                path: path.clone(),
                passphrase_env,
            })
        } else if let Some(var) = &self.key_env {
            Some(AuthConfig::KeyEnv {
                var: var.clone(),
                passphrase_env,
            })
        } else if self.agent {
            Some(AuthConfig::Agent)
        } else {
            self.interactive_env
                .as_ref()
                .map(|responses_env| AuthConfig::Interactive {
                    responses_env: responses_env.clone(),
                })
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.defaults.log_level);
    init_logging(log_level)?;

    match cli.command {
        Commands::Hosts => {
            for host in &config.host {
                println!(
                    "{:<16} {}@{}:{} ({})",
                    host.name,
                    host.user,
                    host.addr,
                    host.port,
                    host.auth.method()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(args) => run(&args, &config).await,
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}

/// Resolve where to connect and how to authenticate
fn resolve_target(args: &RunArgs, config: &Config) -> Result<(ConnectTarget, Credential)> {
    let (mut target, host_auth) = match (&args.target, &args.host) {
        (Some(name), _) => {
            let host = config
                .find_host(name)
                .ok_or_else(|| eyre!("unknown host `{name}`"))?;
            let target = ConnectTarget::new(&host.addr, &host.user).with_port(host.port);
            (target, Some(&host.auth))
        }
        (None, Some(addr)) => {
            let user = args
                .user
                .clone()
                .or_else(|| std::env::var("USER").ok())
                .ok_or_else(|| eyre!("--user is required"))?;
            (ConnectTarget::new(addr, user), None)
        }
        (None, None) => return Err(eyre!("either --target or --host is required")),
    };

    if let Some(port) = args.port {
        target.port = port;
    }
    if let Some(user) = &args.user {
        target.user.clone_from(user);
    }
    target.timeout = Duration::from_secs(
        args.connect_timeout
            .unwrap_or(config.defaults.connect_timeout_secs),
    );

    let credential = match args.auth.auth_config(args.passphrase_env.as_deref()) {
        Some(auth) => auth.credential()?,
        None => host_auth.map_or(Ok(Credential::Agent), AuthConfig::credential)?,
    };

    Ok((target, credential))
}

async fn run(args: &RunArgs, config: &Config) -> Result<ExitCode> {
    let (target, credential) = resolve_target(args, config)?;
    let address = target.address();

    let handle = TransportHandle::connect(&SshTransport::default(), target, &credential)
        .await
        .wrap_err_with(|| format!("failed to connect to {address}"))?;
    let handle = Arc::new(handle);

    let mut executor = CommandExecutor::new(Arc::clone(&handle));
    if args.no_pty || !config.defaults.pty {
        executor = executor.without_pty();
    }
    if args.lenient_stderr {
        executor = executor.with_stderr_policy(StderrPolicy::Lenient);
    } else {
        executor = executor.with_stderr_policy(config.defaults.stderr);
    }
    if let Some(secs) = args.timeout.or(config.defaults.command_timeout_secs) {
        executor = executor.with_command_timeout(Duration::from_secs(secs));
    }

    let command = args.command.join(" ");

    if args.json {
        let outcome = executor.execute(&command, &args.env).await;
        close_quietly(&handle).await;

        let result = outcome.wrap_err_with(|| format!("command failed on {address}"))?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(json_exit_code(executor.stderr_policy(), &result));
    }

    let outcome = executor.run_with_env(&command, &args.env).await;
    close_quietly(&handle).await;

    match outcome {
        Ok(stdout) => {
            print!("{stdout}");
            Ok(ExitCode::SUCCESS)
        }
        Err(ExecError::RemoteStderr { stdout, stderr }) => {
            print!("{stdout}");
            eprint!("{stderr}");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).wrap_err_with(|| format!("command failed on {address}")),
    }
}

async fn close_quietly(handle: &TransportHandle) {
    if let Err(e) = handle.close().await {
        tracing::warn!(error = %e, "failed to close connection");
    }
}

/// JSON mode prints both streams, the policy still decides the exit code
fn json_exit_code(policy: StderrPolicy, result: &CommandResult) -> ExitCode {
    if policy.rejects(result) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
