//! Error types for navsentinel operations.

use std::fmt;
use thiserror::Error;

/// Result type alias for navsentinel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while guarding navigation.
#[derive(Error, Debug)]
pub enum Error {
    /// The underlying navigation primitive failed when invoked.
    #[error("navigation primitive {primitive} failed: {reason}")]
    Primitive {
        /// Primitive that was invoked.
        primitive: String,
        /// Failure reported by the platform.
        reason: String,
    },

    /// An interception adapter could not be installed for a primitive.
    #[error("failed to intercept {primitive}: {reason}")]
    Install {
        /// Primitive that stayed unpatched.
        primitive: String,
        /// Failure reason.
        reason: String,
    },

    /// The peer context is gone (page unloaded, background reloaded).
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// A ledger entry was not found or has already expired.
    #[error("blocked action {0} is unknown or expired")]
    ActionExpired(String),

    /// A cross-context message could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Background state was requested for a tab it does not track.
    #[error("unknown tab {0}")]
    UnknownTab(u32),

    /// A collaborator (settings, allowlist, prompt, rules) failed.
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

impl Error {
    /// Returns true if the failure should be swallowed at the call site and
    /// navigation left to proceed untracked.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ChannelClosed(_) | Error::Primitive { .. } | Error::Collaborator(_)
        )
    }

    /// Create a primitive failure.
    pub fn primitive(primitive: impl fmt::Display, reason: impl Into<String>) -> Self {
        Error::Primitive {
            primitive: primitive.to_string(),
            reason: reason.into(),
        }
    }
}

/// Detailed error context for debugging.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// The operation that failed.
    pub operation: String,
    /// Tab involved, if any.
    pub tab: Option<u32>,
    /// URL being navigated to, if any.
    pub url: Option<String>,
    /// Additional context.
    pub details: Option<String>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation: {}", self.operation)?;
        if let Some(tab) = self.tab {
            write!(f, ", tab: {}", tab)?;
        }
        if let Some(ref u) = self.url {
            write!(f, ", url: {}", u)?;
        }
        if let Some(ref d) = self.details {
            write!(f, ", details: {}", d)?;
        }
        Ok(())
    }
}
