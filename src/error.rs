//! Error Types
//!
//! Session-scoped error taxonomy shared by both daemons. Startup problems
//! (bad config, unreadable key material) use [`crate::configs::ConfigError`]
//! and abort the process; everything here stays confined to one connection.

use thiserror::Error;

/// Why a phone failed application-level authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// The presented device name has no row in the store.
    UnknownDevice(String),
    /// Password, signature or certificate credentials did not check out.
    BadCredentials(String),
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthFailure::UnknownDevice(name) => write!(f, "unknown device {}", name),
            AuthFailure::BadCredentials(reason) => write!(f, "{}", reason),
        }
    }
}

/// Everything that can terminate a session.
///
/// The worker root maps each variant to its teardown behavior: protocol and
/// auth errors get a best-effort END_SESSION frame, store and crypto errors
/// are logged, I/O errors close the socket silently.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed or out-of-order wire traffic: unknown tag, bad framing,
    /// session-id mismatch, version mismatch, missing required element,
    /// unexpected command.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Application-level authentication failed.
    #[error("authentication failed: {0}")]
    Auth(AuthFailure),

    /// The SQLite store rejected a query or update.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Socket closed, read timeout, or any other transport failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An OpenSSL primitive failed (parse, sign, verify).
    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

impl SessionError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        SessionError::Protocol(msg.into())
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
