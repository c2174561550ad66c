use std::path::{Path, PathBuf};

use thiserror::Error;

/// Substrings that mark a task failure as operational noise rather than a
/// real problem: dead egress, slow upstream, broken TLS, garbled responses.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "sock",
    "Sock",
    "connect ECONN",
    "Proxy connection timed out",
    "ETIMEDOUT",
    "ECONNRESET",
    "ESOCKETTIMEDOUT",
    "EPROTO",
    "EADDRINUSE",
    "connection reset",
    "connection refused",
    "certificate",
    "Parse Error",
    "wrong version ",
    "timeout",
    "timed out",
];

/// Status codes a proxy layer answers with when it, not the target, failed.
const PROXY_STATUS_CODES: &[u16] = &[407, 502, 503, 504];

/// Marker carried by a licensing failure.
pub const LICENSE_SIGNAL: &str = "WrongLicense";

/// Application-wide error types for Sieve.
#[derive(Error, Debug)]
pub enum AppError {
    /// Reading or writing a file failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration is missing a value or holds an invalid one.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The native helper process could not be run or misbehaved.
    #[error("Helper error: {0}")]
    Helper(String),

    /// A pool operation was attempted in the wrong lifecycle state.
    #[error("Pool error: {0}")]
    Pool(String),

    /// A proxy or upstream answered with a failure status.
    #[error("Upstream answered HTTP {0}")]
    Status(u16),

    /// A task executor failed.
    #[error("{0}")]
    Task(String),

    /// The licensing check failed. Terminates the process.
    #[error("{LICENSE_SIGNAL}: {0}")]
    License(String),
}

impl AppError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        AppError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Returns true if this failure is expected noise (bad egress, timeouts)
    /// that should be counted but not reported as a hard failure.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Status(code) => PROXY_STATUS_CODES.contains(code),
            AppError::Task(msg) => is_transient_message(msg),
            AppError::Io { source, .. } => is_transient_message(&source.to_string()),
            _ => false,
        }
    }

    /// Returns true if this failure must terminate the whole process.
    pub fn is_fatal(&self) -> bool {
        match self {
            AppError::License(_) => true,
            AppError::Task(msg) => msg.contains(LICENSE_SIGNAL),
            _ => false,
        }
    }
}

/// Returns true if an error message matches a known transient signature.
pub fn is_transient_message(message: &str) -> bool {
    TRANSIENT_SIGNATURES.iter().any(|sig| message.contains(sig))
}
