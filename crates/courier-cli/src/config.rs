//! Configuration loading and types

use std::path::{Path, PathBuf};

use courier_exec::{Credential, StderrPolicy};
use eyre::{WrapErr, eyre};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Top-level configuration for the courier CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Settings applied to every host
    #[serde(default)]
    pub defaults: Defaults,
    /// Known hosts, addressable with `--target`
    #[serde(default)]
    pub host: Vec<HostConfig>,
}

/// Settings applied to every host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Dial timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Per-command deadline in seconds, unbounded when absent
    pub command_timeout_secs: Option<u64>,
    /// Whether stderr output fails a command
    #[serde(default)]
    pub stderr: StderrPolicy,
    /// Allocate a pseudo-terminal for each command
    #[serde(default = "default_pty")]
    pub pty: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: None,
            stderr: StderrPolicy::default(),
            pty: default_pty(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_pty() -> bool {
    true
}

/// A single remote host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Name used with `--target`
    pub name: String,
    /// IP address or hostname
    pub addr: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// SSH user (defaults to root)
    #[serde(default = "default_user")]
    pub user: String,
    /// How to authenticate
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

/// Authentication settings. Secrets are read from environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum AuthConfig {
    Password {
        password_env: String,
    },
    Key {
        path: String,
        passphrase_env: Option<String>,
    },
    KeyEnv {
        var: String,
        passphrase_env: Option<String>,
    },
    #[default]
    Agent,
    /// Newline-separated responses, one per prompt
    Interactive {
        responses_env: String,
    },
}

impl AuthConfig {
    /// Method name as written in the config file
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            AuthConfig::Password { .. } => "password",
            AuthConfig::Key { .. } => "key",
            AuthConfig::KeyEnv { .. } => "key-env",
            AuthConfig::Agent => "agent",
            AuthConfig::Interactive { .. } => "interactive",
        }
    }

    /// Build the credential, reading referenced environment variables
    ///
    /// # Errors
    /// Returns error if a referenced variable is not set
    pub fn credential(&self) -> eyre::Result<Credential> {
        let credential = match self {
            AuthConfig::Password { password_env } => {
                Credential::Password(secret_from_env(password_env)?)
            }
            AuthConfig::Key {
                path,
                passphrase_env,
            } => Credential::KeyFile {
                path: expand_home(path),
                passphrase: passphrase_env.as_deref().map(secret_from_env).transpose()?,
            },
            AuthConfig::KeyEnv {
                var,
                passphrase_env,
            } => Credential::KeyEnv {
                var: var.clone(),
                passphrase: passphrase_env.as_deref().map(secret_from_env).transpose()?,
            },
            AuthConfig::Agent => Credential::Agent,
            AuthConfig::Interactive { responses_env } => {
                let raw = std::env::var(responses_env)
                    .map_err(|_| eyre!("environment variable {responses_env} not set"))?;
                Credential::KeyboardInteractive {
                    responses: raw
                        .lines()
                        .map(|line| SecretString::new(line.to_string()))
                        .collect(),
                }
            }
        };
        Ok(credential)
    }
}

fn secret_from_env(var: &str) -> eyre::Result<SecretString> {
    std::env::var(var)
        .map(SecretString::new)
        .map_err(|_| eyre!("environment variable {var} not set"))
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load from default paths or use defaults
    pub fn load_default() -> eyre::Result<Self> {
        // Check environment variable
        if let Ok(path) = std::env::var("COURIER_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let mut paths = vec![
            PathBuf::from("courier.toml"),
            PathBuf::from("/etc/courier/courier.toml"),
        ];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("courier/courier.toml"));
        }

        for path in paths {
            if path.exists() {
                return Self::load(&path);
            }
        }

        Ok(Config::default())
    }

    /// Look up a host by name
    #[must_use]
    pub fn find_host(&self, name: &str) -> Option<&HostConfig> {
        self.host.iter().find(|h| h.name == name)
    }
}
