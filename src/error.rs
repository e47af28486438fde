//! Error types for parssh
//!
//! This module defines all error types used throughout the application,
//! providing detailed error information for per-host failure reports.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for parssh operations
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Missing or invalid configuration before fan-out
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed host pattern
    #[error("Bad host pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    /// I/O error on the local filesystem
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Vault envelope is malformed or the passphrase is wrong
    #[error("Vault error: {0}")]
    Vault(String),

    /// No authentication method was accepted by the server
    #[error("SSH authentication failed for '{user}@{host}': {message}")]
    Auth {
        user: String,
        host: String,
        message: String,
    },

    /// TCP/DNS level connection failure
    #[error("Host unreachable '{host}': {message}")]
    Unreachable { host: String, message: String },

    /// SSH protocol handshake failure
    #[error("SSH handshake failed with '{host}': {message}")]
    Handshake { host: String, message: String },

    /// Connect, operation, or whole-task deadline exceeded
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// Remote command exited non-zero
    #[error("Remote command failed with exit status {status}: {output}")]
    RemoteExec { status: i32, output: String },

    /// SFTP transfer failure
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Remote target path already exists and overwrite is disabled
    #[error("Target already exists: {0}")]
    TargetExists(PathBuf),

    /// Anything that escaped classification, including worker panics
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Semantic failure class, independent of the carrying variant.
///
/// Per-host failure lines report this label so operators can grep results
/// by cause across tens of thousands of hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)] // labels below are the documentation
pub enum ErrorKind {
    Config,
    Pattern,
    Io,
    Vault,
    Auth,
    Unreachable,
    Handshake,
    Timeout,
    RemoteExec,
    Transfer,
    TargetExists,
    Unknown,
}

impl ErrorKind {
    /// Stable label used in rendered failure lines
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Config => "ConfigError",
            ErrorKind::Pattern => "PatternError",
            ErrorKind::Io => "IOError",
            ErrorKind::Vault => "VaultError",
            ErrorKind::Auth => "AuthFailed",
            ErrorKind::Unreachable => "Unreachable",
            ErrorKind::Handshake => "HandshakeFailed",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::RemoteExec => "RemoteExecError",
            ErrorKind::Transfer => "TransferError",
            ErrorKind::TargetExists => "TargetExists",
            ErrorKind::Unknown => "Unknown",
        }
    }
}

impl RunnerError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a pattern error
    pub fn pattern(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Pattern {
            pattern: pattern.into(),
            message: message.into(),
        }
    }

    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an authentication error
    pub fn auth(
        user: impl Into<String>,
        host: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Auth {
            user: user.into(),
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create an unreachable-host error
    pub fn unreachable(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unreachable {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a handshake error
    pub fn handshake(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handshake {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Semantic class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Pattern { .. } => ErrorKind::Pattern,
            Self::Io { .. } => ErrorKind::Io,
            Self::Vault(_) => ErrorKind::Vault,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Unreachable { .. } => ErrorKind::Unreachable,
            Self::Handshake { .. } => ErrorKind::Handshake,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::RemoteExec { .. } => ErrorKind::RemoteExec,
            Self::Transfer(_) => ErrorKind::Transfer,
            Self::TargetExists(_) => ErrorKind::TargetExists,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// True when the error happened before any connection was attempted
    /// and should abort the whole task rather than a single host.
    pub fn is_config_stage(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Config | ErrorKind::Pattern | ErrorKind::Vault
        )
    }
}

/// Result type alias for parssh operations
pub type Result<T> = std::result::Result<T, RunnerError>;

impl From<std::io::Error> for RunnerError {
    fn from(err: std::io::Error) -> Self {
        RunnerError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| RunnerError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        let err = RunnerError::unreachable("db01", "connection refused");
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert_eq!(err.kind().label(), "Unreachable");

        let err = RunnerError::Timeout(30);
        assert_eq!(err.kind().label(), "Timeout");
    }

    #[test]
    fn test_config_stage_classification() {
        assert!(RunnerError::config("no command").is_config_stage());
        assert!(RunnerError::pattern("web[", "unbalanced bracket").is_config_stage());
        assert!(!RunnerError::Timeout(5).is_config_stage());
        assert!(!RunnerError::unreachable("h", "refused").is_config_stage());
    }

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = RunnerError::io("/test/path", io_err);
        assert!(err.to_string().contains("/test/path"));
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
