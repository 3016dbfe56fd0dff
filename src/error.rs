//! Error types shared across the daemon.

use thiserror::Error;

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Configuration failed validation at startup.
    #[error("invalid config: {0}")]
    Config(String),

    /// The browser executable is missing or the process did not come up.
    ///
    /// Fatal: fails the snapshot that triggered the launch and every snapshot
    /// queued behind it.
    #[error("browser launch failed: {0}")]
    BrowserLaunch(String),

    /// Root navigation failed for a snapshot.
    #[error("navigation failed for {url}: {reason}")]
    Navigation { url: String, reason: String },

    /// Asset discovery failed for a snapshot as a whole.
    #[error("discovery failed for snapshot '{name}': {reason}")]
    SnapshotDiscovery { name: String, reason: String },

    /// The remote API rejected a call, or kept failing after retries.
    #[error("API error: {message}")]
    Api { status: Option<u16>, message: String },

    /// An operation was attempted outside the Running state.
    #[error("percyd is not running")]
    NotRunning,

    /// The snapshot was cancelled before it ran (queue stopped without drain).
    #[error("snapshot cancelled")]
    Cancelled,

    /// A non-fatal debugging-protocol failure (orphaned request, closed
    /// target, body fetch miss). Never escapes the discoverer as-is.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid snapshot: {0}")]
    Snapshot(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn launch(msg: impl Into<String>) -> Self {
        Self::BrowserLaunch(msg.into())
    }

    pub fn navigation(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Navigation {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn discovery(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SnapshotDiscovery {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn api(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::Snapshot(msg.into())
    }

    /// Whether a retry could plausibly succeed (5xx or transport-level).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => match status {
                Some(code) => *code >= 500,
                None => true,
            },
            _ => false,
        }
    }
}
