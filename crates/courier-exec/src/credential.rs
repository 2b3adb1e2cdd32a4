//! Credentials and SSH key resolution

use std::env;
use std::path::{Path, PathBuf};

use russh::keys::{decode_secret_key, load_secret_key, ssh_key};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

/// How to authenticate against the remote host
#[derive(Debug, Clone)]
pub enum Credential {
    /// Plain password authentication
    Password(SecretString),
    /// Private key file on disk
    KeyFile {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
    /// Base64-encoded private key held in an environment variable
    KeyEnv {
        var: String,
        passphrase: Option<SecretString>,
    },
    /// Identities offered by the running ssh-agent
    Agent,
    /// Keyboard-interactive challenge; responses answer prompts in order
    KeyboardInteractive { responses: Vec<SecretString> },
}

impl Credential {
    /// Password credential
    pub fn password(password: impl Into<String>) -> Self {
        Credential::Password(SecretString::new(password.into()))
    }

    /// Unencrypted key file credential
    pub fn key_file(path: impl Into<PathBuf>) -> Self {
        Credential::KeyFile {
            path: path.into(),
            passphrase: None,
        }
    }

    /// Short name for logs
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::KeyFile { .. } => "key",
            Credential::KeyEnv { .. } => "key-env",
            Credential::Agent => "agent",
            Credential::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }

    /// Load the private key for key-based variants.
    ///
    /// Returns `Ok(None)` for credentials that carry no key material.
    ///
    /// # Errors
    /// Returns `KeyError` if the key cannot be located, read, or decoded
    pub fn private_key(&self) -> Result<Option<ssh_key::PrivateKey>, KeyError> {
        match self {
            Credential::KeyFile { path, passphrase } => {
                validate_key_permissions(path)?;
                let key = load_secret_key(path, expose(passphrase.as_ref()))
                    .map_err(|e| KeyError::Decode(e.to_string()))?;
                debug!(path = %path.display(), "loaded private key from file");
                Ok(Some(key))
            }
            Credential::KeyEnv { var, passphrase } => {
                let encoded = env::var(var).map_err(|_| KeyError::EnvNotSet(var.clone()))?;
                let key_data = base64_decode(&encoded).map_err(|_| KeyError::InvalidBase64)?;
                let pem = String::from_utf8(key_data)
                    .map_err(|_| KeyError::Decode("key is not valid UTF-8".to_string()))?;
                let key = decode_secret_key(&pem, expose(passphrase.as_ref()))
                    .map_err(|e| KeyError::Decode(e.to_string()))?;
                debug!(var = %var, "decoded private key from environment");
                Ok(Some(key))
            }
            Credential::Password(_) | Credential::Agent | Credential::KeyboardInteractive { .. } => {
                Ok(None)
            }
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("failed to decode private key: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn expose(passphrase: Option<&SecretString>) -> Option<&str> {
    passphrase.map(|p| p.expose_secret().as_str())
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

#[cfg(unix)]
fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => KeyError::NotFound(path.display().to_string()),
        _ => KeyError::Io(e),
    })?;

    // group and other bits must be clear
    if metadata.permissions().mode() & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    if !path.exists() {
        return Err(KeyError::NotFound(path.display().to_string()));
    }
    Ok(())
}
