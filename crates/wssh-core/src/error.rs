//! Error types for wssh-core.

use thiserror::Error;

/// Main error type for wssh operations.
///
/// Every error handed back to the embedding host belongs to one of these
/// classes. Low-level cause strings from the transport or TLS layers are not
/// carried in public messages; use [`public_err`] to log the cause and
/// surface a stable message instead.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or ill-typed configuration, bad path, bad URL, value out of range.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Authentication failed: empty keyring, key parse, passphrase, server reject.
    #[error("authentication error: {message}")]
    Auth { message: String },

    /// Host key rejected, verification timed out, or no callback configured.
    #[error("host key error: {message}")]
    HostKey { message: String },

    /// WebSocket dial failure, frame too large, receive overflow, peer closed.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// SSH handshake or tunnel protocol violation.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Error surfaced by the remote SFTP server.
    #[error("remote error: {message}")]
    Remote { message: String },

    /// Transfer exceeds the buffered-transfer ceiling.
    #[error("size limit exceeded: {message}")]
    SizeLimit { message: String },

    /// Host-initiated abort or component teardown.
    #[error("transfer cancelled")]
    Cancelled,

    /// A bounded wait elapsed.
    #[error("operation timed out: {message}")]
    Timeout { message: String },

    /// An invariant was violated. Defensive; should be unreachable.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Error from the SSH protocol library.
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
}

impl Error {
    /// True when the operation failed because something was torn down or
    /// aborted rather than because of a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Log the low-level cause at warn level and return a stable public error.
///
/// Dial, TLS, and DNS failures carry strings that can leak infrastructure
/// details; the host only ever sees `public_msg`.
pub fn public_err(public_msg: &str, cause: impl std::fmt::Display) -> Error {
    tracing::warn!(cause = %cause, "{public_msg}");
    Error::Transport {
        message: public_msg.to_string(),
    }
}

/// Convenience result type for wssh operations.
pub type Result<T> = std::result::Result<T, Error>;
