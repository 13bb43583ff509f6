//! # Configuration Structures
//!
//! This module defines the configuration contract between the core and its
//! configuration provider. The core never parses configuration files; the
//! embedding application constructs (or deserializes) these structures and
//! hands them to [`crate::client::ClientCore`].
//!
//! ## Configuration Categories
//!
//! - **Server**: address, TLS, identity, SASL credentials, auto-join list
//! - **Reconnect**: backoff parameters for unexpected disconnects
//! - **DCC**: download directory, port range, timeouts, checksum policy
//! - **Ignore list**: hostmask globs suppressing inbound messages

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Checksum algorithms supported for DCC transfer verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// Verification disabled.
    None,
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    /// Wire name used inside `DCC CHECKSUM` CTCPs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::None => "none",
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    /// Parse a wire name (case-insensitive). Unknown names map to `None`.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "md5" => ChecksumAlgorithm::Md5,
            "sha1" => ChecksumAlgorithm::Sha1,
            "sha256" => ChecksumAlgorithm::Sha256,
            _ => ChecksumAlgorithm::None,
        }
    }
}

/// Connection definition for one IRC server.
///
/// Validated by the state store when converted into a live
/// [`crate::state::ConnectionInfo`]; invalid definitions produce a
/// `CONFIG_ERROR` connection state instead of a connection attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname or address.
    pub host: String,

    /// Server port. Conventionally 6667 plain / 6697 TLS.
    pub port: u16,

    /// Connect over TLS.
    pub tls: bool,

    /// Verify the server certificate when `tls` is set.
    pub tls_verify: bool,

    /// Nickname to register with.
    pub nick: String,

    /// Username (ident) for the `USER` command.
    pub username: String,

    /// Realname (GECOS) for the `USER` command.
    pub realname: String,

    /// Optional server password, sent as `PASS` before registration.
    pub server_password: Option<String>,

    /// Optional NickServ password, sent after registration when SASL did
    /// not authenticate us.
    pub nickserv_password: Option<String>,

    /// SASL authcid. Required when `desired_caps` contains `sasl`.
    pub sasl_username: Option<String>,

    /// SASL password for the PLAIN mechanism.
    pub sasl_password: Option<String>,

    /// Abort the connection on fatal SASL failure instead of continuing
    /// unauthenticated.
    pub sasl_abort_on_fail: bool,

    /// IRCv3 capabilities to request when the server advertises them.
    /// Listing `sasl` requires SASL credentials; the connection info is
    /// rejected otherwise.
    pub desired_caps: Vec<String>,

    /// Channels to join automatically after registration.
    pub initial_channels: Vec<String>,

    /// First reconnect delay after an unexpected disconnect, in seconds.
    pub reconnect_initial_delay_secs: u64,

    /// Upper bound for the doubling reconnect backoff, in seconds.
    pub max_reconnect_delay_secs: u64,

    /// Maximum scrollback lines kept per context.
    pub max_history: usize,

    /// Hostmask globs (`nick!user@host`) whose messages are dropped.
    pub ignore_patterns: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 6697,
            tls: true,
            tls_verify: true,
            nick: String::new(),
            username: String::new(),
            realname: String::new(),
            server_password: None,
            nickserv_password: None,
            sasl_username: None,
            sasl_password: None,
            sasl_abort_on_fail: false,
            // `sasl` is not requested by default: it is only valid
            // together with credentials.
            desired_caps: vec![
                "server-time".to_string(),
                "message-tags".to_string(),
                "account-tag".to_string(),
                "echo-message".to_string(),
            ],
            initial_channels: Vec::new(),
            reconnect_initial_delay_secs: crate::defaults::RECONNECT_INITIAL_DELAY_SECS,
            max_reconnect_delay_secs: crate::defaults::MAX_RECONNECT_DELAY_SECS,
            max_history: crate::defaults::MAX_HISTORY,
            ignore_patterns: Vec::new(),
        }
    }
}

/// Tuning parameters for the DCC transfer engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DccConfig {
    /// Master switch; when false all inbound DCC CTCPs are treated as text.
    pub enabled: bool,

    /// Directory incoming files are saved under. Offers resolving outside
    /// this directory (after symlink resolution) are refused.
    pub download_dir: PathBuf,

    /// Automatically accept inbound active SEND offers.
    pub auto_accept: bool,

    /// Largest advertised filesize accepted, in bytes.
    pub max_file_size: u64,

    /// First port tried when opening a listening socket.
    pub port_range_start: u16,

    /// Last port tried when opening a listening socket.
    pub port_range_end: u16,

    /// Negotiation and inactivity timeout for transfers, in seconds.
    pub timeout_secs: u64,

    /// Lifetime of an unaccepted passive offer token, in seconds.
    pub passive_token_timeout_secs: u64,

    /// File extensions refused at offer time (leading dot, lowercase).
    pub blocked_extensions: Vec<String>,

    /// Compute and exchange checksums after successful transfers.
    pub checksum_verify: bool,

    /// Digest algorithm used when `checksum_verify` is set.
    pub checksum_algorithm: ChecksumAlgorithm,

    /// Allow resuming partial transfers.
    pub resume_enabled: bool,

    /// Run the periodic cleanup task.
    pub cleanup_enabled: bool,

    /// Interval between cleanup sweeps, in seconds.
    pub cleanup_interval_secs: u64,

    /// Age after which terminal transfers are dropped from the table.
    pub transfer_max_age_secs: u64,

    /// IP address advertised in outgoing offers. When unset the engine
    /// auto-detects a local address.
    pub advertised_ip: Option<String>,

    /// Delete partial files when a transfer is cancelled. Default keeps
    /// them so the peer can resume.
    pub delete_partial_on_cancel: bool,
}

impl Default for DccConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            download_dir: PathBuf::from("downloads"),
            auto_accept: false,
            max_file_size: crate::defaults::DCC_MAX_FILE_SIZE,
            port_range_start: crate::defaults::DCC_PORT_RANGE_START,
            port_range_end: crate::defaults::DCC_PORT_RANGE_END,
            timeout_secs: crate::defaults::DCC_TIMEOUT_SECS,
            passive_token_timeout_secs: crate::defaults::DCC_PASSIVE_TOKEN_TIMEOUT_SECS,
            blocked_extensions: [".exe", ".bat", ".com", ".scr", ".vbs", ".pif"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            checksum_verify: true,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            resume_enabled: true,
            cleanup_enabled: true,
            cleanup_interval_secs: crate::defaults::DCC_CLEANUP_INTERVAL_SECS,
            transfer_max_age_secs: crate::defaults::DCC_TRANSFER_MAX_AGE_SECS,
            advertised_ip: None,
            delete_partial_on_cancel: false,
        }
    }
}

impl DccConfig {
    /// Negotiation/inactivity timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_algorithm_round_trip() {
        for alg in [
            ChecksumAlgorithm::Md5,
            ChecksumAlgorithm::Sha1,
            ChecksumAlgorithm::Sha256,
        ] {
            assert_eq!(ChecksumAlgorithm::parse(alg.as_str()), alg);
        }
        assert_eq!(ChecksumAlgorithm::parse("SHA256"), ChecksumAlgorithm::Sha256);
        assert_eq!(ChecksumAlgorithm::parse("crc32"), ChecksumAlgorithm::None);
    }

    #[test]
    fn test_dcc_config_defaults() {
        let config = DccConfig::default();
        assert!(config.enabled);
        assert_eq!(config.port_range_start, 1024);
        assert_eq!(config.port_range_end, 65535);
        assert!(config.blocked_extensions.contains(&".exe".to_string()));
        assert!(!config.delete_partial_on_cancel);
    }
}
