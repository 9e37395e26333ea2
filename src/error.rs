//! Error types shared by every layer of the client.
//!
//! Errors on the synchronous request path are returned directly from the
//! call that failed. Errors raised by a background listener are delivered
//! through the owning [`Subscription`](crate::listener::Subscription)
//! instead, so a caller only sees them by reading.

use std::time::Duration;

use thiserror::Error;

/// Error code returned when an explicit kvstore revision does not match.
pub const REVISION_ERROR_CODE: i32 = 2760;

/// Error code returned when deleting a kvstore entry that does not exist.
pub const DELETE_NONEXISTENT_ERROR_CODE: i32 = 2762;

/// Result alias used throughout the crate.
pub type Result<T, E = BotError> = std::result::Result<T, E>;

/// Client error taxonomy.
#[derive(Debug, Error)]
pub enum BotError {
    /// The pipe pool was torn down or never started.
    #[error("chat API disconnected")]
    Disconnected,

    /// The external binary could not be launched.
    #[error("failed to launch {command}: {source}")]
    Spawn {
        /// Human readable command line
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Read or write failure on a pipe.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// A request could not be serialized.
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    /// A response or event line was not valid JSON for the expected shape.
    #[error("failed to decode API response: {0}")]
    Decode(String),

    /// The peer answered with a non-null `error` object.
    #[error("API error {code}: {message}")]
    Api {
        /// Peer-defined error code
        code: i32,
        /// Peer-supplied message
        message: String,
    },

    /// Identity resolution did not finish in time.
    #[error("unable to resolve Keybase identity within {0:?}")]
    AuthTimeout(Duration),

    /// Identity resolution failed and no fallback credential applied.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A request did not complete before the configured deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The subscription was shut down.
    #[error("subscription shutdown")]
    SubscriptionShutdown,

    /// The listener exhausted its authentication attempts.
    #[error("listener failed to authenticate after {0} attempts, giving up")]
    ListenerGaveUp(u32),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BotError {
    /// Build a spawn error for the given program and arguments.
    pub fn spawn(program: &str, args: &[String], source: std::io::Error) -> Self {
        let mut command = program.to_string();
        for arg in args {
            command.push(' ');
            command.push_str(arg);
        }
        BotError::Spawn { command, source }
    }

    /// Peer error code, if this is a protocol-level error.
    pub fn code(&self) -> Option<i32> {
        match self {
            BotError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True when a kvstore write or delete used a stale revision.
    pub fn is_revision_conflict(&self) -> bool {
        self.code() == Some(REVISION_ERROR_CODE)
    }

    /// True when a kvstore delete targeted a nonexistent entry.
    pub fn is_not_found(&self) -> bool {
        self.code() == Some(DELETE_NONEXISTENT_ERROR_CODE)
    }
}

impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof => {
                BotError::Disconnected
            }
            _ => BotError::Io(err),
        }
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::Decode(err.to_string())
    }
}
