//! # Core Error Types
//!
//! This module defines the error type shared across the client core. Every
//! subsystem (wire codec, transport, registration, DCC engine) reports
//! failures through [`CoreError`], keeping error classification uniform for
//! the embedding application.
//!
//! ## Error Categories
//!
//! - **Protocol**: `MalformedMessage` for unparseable inbound lines
//! - **Connection**: `Transport`, `AuthenticationFailed`, `RegistrationFailed`
//! - **Configuration**: `Config` for rejected connection parameters
//! - **Channels**: `ChannelJoin` for join-phase numerics (403/471/473/...)
//! - **DCC**: offer validation, security containment, timeouts, checksums

use thiserror::Error;

/// Convenience alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Unified error type for the client core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An inbound line could not be parsed as an IRC message.
    ///
    /// Raised only when the command token is absent; parse failures are
    /// surfaced to the status context and never terminate the connection.
    #[error("malformed IRC message: {0}")]
    MalformedMessage(String),

    /// Socket-level failure on the server connection or a DCC socket.
    #[error("transport error: {0}")]
    Transport(String),

    /// SASL authentication was rejected by the server.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Registration could not complete (bad nick, banned, ...).
    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    /// Connection parameters failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// A channel join was refused by the server.
    #[error("cannot join {channel}: {reason}")]
    ChannelJoin { channel: String, reason: String },

    /// An inbound DCC CTCP request was syntactically valid but unusable
    /// (unknown token, no matching transfer, size out of bounds, ...).
    #[error("invalid DCC offer: {0}")]
    DccOfferInvalid(String),

    /// A DCC offer tried to escape the download directory or carried a
    /// forbidden filename. Never retried.
    #[error("DCC security violation: {0}")]
    DccSecurityViolation(String),

    /// A DCC transfer exceeded the negotiation or inactivity timeout.
    #[error("DCC timeout: {0}")]
    DccTimeout(String),

    /// The received file's digest did not match the sender's digest.
    /// The file is kept; the transfer still counts as completed.
    #[error("DCC checksum mismatch for '{filename}': expected {expected}, calculated {calculated}")]
    DccChecksumMismatch {
        filename: String,
        expected: String,
        calculated: String,
    },

    /// Internal DCC engine failure (file I/O, port exhaustion, ...).
    #[error("DCC engine error: {0}")]
    DccInternal(String),

    /// Invariant violation inside the core (re-entrant dispatch, ...).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Transport(err.to_string())
    }
}
