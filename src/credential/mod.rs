//! Retrieval of the local agent's authentication material.
//!
//! Two sources exist: the agent's session file (`~/.claude.json`) and the
//! macOS keychain entry the agent writes on login. Each source also names
//! where the material belongs on the remote instance.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::debug;

use crate::ssh::{CommandRunner, RunOptions, RunnerError};
use crate::util::expand_tilde;

/// Remote path for material read from the session file.
pub const SESSION_FILE_INSTALL_PATH: &str = "/root/.claude.json";
/// Remote path for material read from the keychain.
pub const KEYCHAIN_INSTALL_PATH: &str = "/root/.claude/.credentials.json";
/// Keychain service name the agent stores its credentials under.
pub const KEYCHAIN_SERVICE: &str = "Claude Code-credentials";
const KEYCHAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Future returned by credential sources.
pub type CredentialFuture<'a> =
    Pin<Box<dyn Future<Output = Result<SecretBlob, CredentialError>> + Send + 'a>>;

/// Opaque secret bytes that never render their contents.
#[derive(Clone, Eq, PartialEq)]
pub struct SecretBlob(Vec<u8>);

impl SecretBlob {
    /// Wraps raw secret bytes.
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Exposes the bytes for transfer.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Returns the secret as text when it is valid UTF-8, for scrubbing it
    /// out of diagnostics.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Returns the number of bytes held.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when no bytes are held.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretBlob {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "SecretBlob([REDACTED; {} bytes])", self.0.len())
    }
}

impl fmt::Display for SecretBlob {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("[REDACTED]")
    }
}

/// Errors raised while retrieving credentials.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CredentialError {
    /// No local credential exists; the operator has not logged in.
    #[error("no local agent credential found: {0}")]
    NotAuthenticated(String),
    /// A credential exists but is unusable.
    #[error("local agent credential is invalid: {0}")]
    Invalid(String),
    /// Reading the credential failed.
    #[error("failed to read local agent credential: {0}")]
    Io(String),
}

/// Source of the agent credential injected into new instances.
pub trait CredentialSource: Send + Sync {
    /// Retrieves the credential.
    fn get(&self) -> CredentialFuture<'_>;

    /// Remote path the credential is installed at.
    fn install_path(&self) -> &str;
}

/// Which credential source to use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CredentialKind {
    /// The agent's JSON session file.
    SessionFile,
    /// The macOS keychain.
    Keychain,
}

impl FromStr for CredentialKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "session-file" | "session_file" | "file" => Ok(Self::SessionFile),
            "keychain" => Ok(Self::Keychain),
            other => Err(format!(
                "unknown credential source '{other}': expected session-file or keychain"
            )),
        }
    }
}

/// Reads the agent's JSON session file.
#[derive(Clone, Debug)]
pub struct SessionFileSource {
    path: Utf8PathBuf,
}

impl SessionFileSource {
    /// Creates a source reading `path` (with `~/` expansion).
    #[must_use]
    pub fn new(path: &str) -> Self {
        Self {
            path: Utf8PathBuf::from(expand_tilde(path)),
        }
    }

    /// Path being read.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn read(&self) -> Result<SecretBlob, CredentialError> {
        let parent = self
            .path
            .parent()
            .filter(|dir| !dir.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        let name = self
            .path
            .file_name()
            .ok_or_else(|| CredentialError::Io(format!("{} has no file name", self.path)))?;
        let missing = || CredentialError::NotAuthenticated(format!("{} does not exist", self.path));

        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
            Err(err) => return Err(CredentialError::Io(format!("{parent}: {err}"))),
        };
        let contents = match dir.read_to_string(name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
            Err(err) => return Err(CredentialError::Io(format!("{}: {err}", self.path))),
        };
        if contents.trim().is_empty() {
            return Err(CredentialError::NotAuthenticated(format!(
                "{} is empty",
                self.path
            )));
        }
        serde_json::from_str::<serde_json::Value>(&contents).map_err(|err| {
            CredentialError::Invalid(format!("{} is not valid JSON (line {})", self.path, err.line()))
        })?;
        debug!(path = %self.path, "read session file");
        Ok(SecretBlob::new(contents.into_bytes()))
    }
}

impl CredentialSource for SessionFileSource {
    fn get(&self) -> CredentialFuture<'_> {
        Box::pin(async move { self.read() })
    }

    fn install_path(&self) -> &str {
        SESSION_FILE_INSTALL_PATH
    }
}

/// Reads the agent credential from the macOS keychain via `security`.
#[derive(Clone, Debug)]
pub struct KeychainSource<R: CommandRunner> {
    runner: R,
    program: String,
}

impl<R: CommandRunner> KeychainSource<R> {
    /// Creates a source that shells out to `security` through `runner`.
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            program: String::from("security"),
        }
    }

    async fn read(&self) -> Result<SecretBlob, CredentialError> {
        let args = [
            "find-generic-password",
            "-s",
            KEYCHAIN_SERVICE,
            "-w",
        ]
        .map(std::ffi::OsString::from);
        let output = self
            .runner
            .run(
                &self.program,
                &args,
                RunOptions {
                    timeout: Some(KEYCHAIN_TIMEOUT),
                    ..RunOptions::default()
                },
            )
            .await
            .map_err(|err| match err {
                RunnerError::Spawn { .. } => CredentialError::NotAuthenticated(String::from(
                    "the macOS keychain is not available on this machine",
                )),
                RunnerError::TimedOut { .. } => CredentialError::Io(String::from(
                    "keychain access timed out; access may have been denied",
                )),
                RunnerError::Io { message, .. } => CredentialError::Io(message),
            })?;

        let secret = output.stdout.trim();
        if !output.is_success() || secret.is_empty() {
            return Err(CredentialError::NotAuthenticated(format!(
                "no '{KEYCHAIN_SERVICE}' entry in the keychain"
            )));
        }
        debug!("read keychain credential");
        Ok(SecretBlob::new(secret.as_bytes().to_vec()))
    }
}

impl<R: CommandRunner> CredentialSource for KeychainSource<R> {
    fn get(&self) -> CredentialFuture<'_> {
        Box::pin(self.read())
    }

    fn install_path(&self) -> &str {
        KEYCHAIN_INSTALL_PATH
    }
}

/// Credential source selected from configuration.
#[derive(Clone, Debug)]
pub enum ConfiguredCredentialSource<R: CommandRunner> {
    /// Session file source.
    SessionFile(SessionFileSource),
    /// Keychain source.
    Keychain(KeychainSource<R>),
}

impl<R: CommandRunner> ConfiguredCredentialSource<R> {
    /// Builds the source named by `kind`.
    #[must_use]
    pub fn from_kind(kind: CredentialKind, session_file: &str, runner: R) -> Self {
        match kind {
            CredentialKind::SessionFile => Self::SessionFile(SessionFileSource::new(session_file)),
            CredentialKind::Keychain => Self::Keychain(KeychainSource::new(runner)),
        }
    }
}

impl<R: CommandRunner> CredentialSource for ConfiguredCredentialSource<R> {
    fn get(&self) -> CredentialFuture<'_> {
        match self {
            Self::SessionFile(source) => source.get(),
            Self::Keychain(source) => source.get(),
        }
    }

    fn install_path(&self) -> &str {
        match self {
            Self::SessionFile(source) => source.install_path(),
            Self::Keychain(source) => source.install_path(),
        }
    }
}
