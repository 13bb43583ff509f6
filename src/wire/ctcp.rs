//! # CTCP and DCC Grammar
//!
//! CTCP payloads are PRIVMSG/NOTICE bodies bracketed by `\x01`. Exactly one
//! CTCP segment per message body is accepted; bodies with stray or extra
//! `\x01` bytes are treated as plain text.
//!
//! The DCC sub-grammar recognized here:
//!
//! ```text
//! SEND <filename> <ip_u32> <port> <size> [token]
//! ACCEPT <filename> <port> <position> [token]            (resume reply)
//! ACCEPT <filename> <ip_u32> <port> 0 <token>            (passive acceptance)
//! RESUME <filename> <port> <position> [token]
//! CHECKSUM <filename> <algorithm> <hex_digest> <transfer_id>
//! ```
//!
//! The two ACCEPT forms are distinguished by field count alone: a resume
//! reply carries two or three fields, a passive acceptance always four.
//!
//! IPs travel as the decimal rendering of the address in network byte
//! order (`ntohl`). Filenames containing spaces are double-quoted. A SEND
//! with port `0` and a token is a passive (reverse) offer.

use crate::error::{CoreError, CoreResult};
use std::net::Ipv4Addr;

/// Extract the single CTCP payload from a message body, if the body is
/// exactly one `\x01`-delimited segment.
pub fn extract_ctcp(body: &str) -> Option<&str> {
    let inner = body.strip_prefix('\u{1}')?.strip_suffix('\u{1}')?;
    if inner.contains('\u{1}') {
        // Multiple segments: not a well-formed CTCP, treat as text.
        return None;
    }
    Some(inner)
}

/// True when a CTCP payload is a DCC request (case-insensitive).
pub fn is_dcc(payload: &str) -> bool {
    let mut words = payload.split_ascii_whitespace();
    matches!(words.next(), Some(w) if w.eq_ignore_ascii_case("DCC"))
}

/// A parsed DCC CTCP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DccMessage {
    /// File offer. `port == 0` with a token means passive.
    Send {
        filename: String,
        ip: Option<Ipv4Addr>,
        port: u16,
        filesize: u64,
        token: Option<String>,
    },
    /// Acceptance of a resume request or of a passive offer.
    Accept {
        filename: String,
        ip: Option<Ipv4Addr>,
        port: u16,
        position: u64,
        token: Option<String>,
    },
    /// Request to resume a transfer from `position`.
    Resume {
        filename: String,
        port: u16,
        position: u64,
        token: Option<String>,
    },
    /// Post-transfer digest announcement.
    Checksum {
        filename: String,
        algorithm: String,
        digest: String,
        transfer_id: String,
    },
}

/// Split a DCC argument string into a filename (honoring double quotes)
/// and the remaining whitespace-separated fields.
fn split_filename(args: &str) -> CoreResult<(String, Vec<&str>)> {
    let args = args.trim_start();
    if let Some(stripped) = args.strip_prefix('"') {
        let end = stripped.find('"').ok_or_else(|| {
            CoreError::DccOfferInvalid("unterminated quoted filename".to_string())
        })?;
        let filename = stripped[..end].to_string();
        if filename.is_empty() {
            return Err(CoreError::DccOfferInvalid("empty filename".to_string()));
        }
        let rest = stripped[end + 1..].split_ascii_whitespace().collect();
        Ok((filename, rest))
    } else {
        let mut words = args.split_ascii_whitespace();
        let filename = words
            .next()
            .ok_or_else(|| CoreError::DccOfferInvalid("missing filename".to_string()))?
            .to_string();
        Ok((filename, words.collect()))
    }
}

fn parse_u64(field: &str, what: &str) -> CoreResult<u64> {
    field
        .parse()
        .map_err(|_| CoreError::DccOfferInvalid(format!("bad {what}: {field:?}")))
}

fn parse_port(field: &str) -> CoreResult<u16> {
    field
        .parse()
        .map_err(|_| CoreError::DccOfferInvalid(format!("bad port: {field:?}")))
}

fn parse_ip(field: &str) -> CoreResult<Option<Ipv4Addr>> {
    let raw: u32 = field
        .parse()
        .map_err(|_| CoreError::DccOfferInvalid(format!("bad ip: {field:?}")))?;
    if raw == 0 {
        Ok(None)
    } else {
        Ok(Some(Ipv4Addr::from(raw)))
    }
}

/// Parse a `DCC ...` CTCP payload.
pub fn parse_dcc(payload: &str) -> CoreResult<DccMessage> {
    let rest = payload
        .trim()
        .strip_prefix("DCC ")
        .or_else(|| payload.trim().strip_prefix("dcc "))
        .ok_or_else(|| CoreError::DccOfferInvalid("not a DCC payload".to_string()))?;

    let (verb, args) = rest
        .split_once(' ')
        .ok_or_else(|| CoreError::DccOfferInvalid("missing DCC arguments".to_string()))?;

    match verb.to_ascii_uppercase().as_str() {
        "SEND" => {
            let (filename, fields) = split_filename(args)?;
            if fields.len() < 3 {
                return Err(CoreError::DccOfferInvalid(format!(
                    "SEND needs ip/port/size, got {} fields",
                    fields.len()
                )));
            }
            Ok(DccMessage::Send {
                filename,
                ip: parse_ip(fields[0])?,
                port: parse_port(fields[1])?,
                filesize: parse_u64(fields[2], "size")?,
                token: fields.get(3).map(|t| t.to_string()),
            })
        }
        "ACCEPT" => {
            let (filename, fields) = split_filename(args)?;
            // Arity alone disambiguates the two forms: a resume reply is
            // `port position [token]` (2-3 fields, the token may be
            // numeric), a passive acceptance is always
            // `ip port position token` (4 fields).
            match fields.len() {
                2 | 3 => Ok(DccMessage::Accept {
                    filename,
                    ip: None,
                    port: parse_port(fields[0])?,
                    position: parse_u64(fields[1], "position")?,
                    token: fields.get(2).map(|t| t.to_string()),
                }),
                4 => Ok(DccMessage::Accept {
                    filename,
                    ip: parse_ip(fields[0])?,
                    port: parse_port(fields[1])?,
                    position: parse_u64(fields[2], "position")?,
                    token: fields.get(3).map(|t| t.to_string()),
                }),
                n => Err(CoreError::DccOfferInvalid(format!(
                    "ACCEPT needs 2-4 fields, got {n}"
                ))),
            }
        }
        "RESUME" => {
            let (filename, fields) = split_filename(args)?;
            if fields.len() < 2 {
                return Err(CoreError::DccOfferInvalid(
                    "RESUME needs port and position".to_string(),
                ));
            }
            Ok(DccMessage::Resume {
                filename,
                port: parse_port(fields[0])?,
                position: parse_u64(fields[1], "position")?,
                token: fields.get(2).map(|t| t.to_string()),
            })
        }
        "CHECKSUM" => {
            let (filename, fields) = split_filename(args)?;
            if fields.len() < 3 {
                return Err(CoreError::DccOfferInvalid(
                    "CHECKSUM needs algorithm, digest and transfer id".to_string(),
                ));
            }
            Ok(DccMessage::Checksum {
                filename,
                algorithm: fields[0].to_ascii_lowercase(),
                digest: fields[1].to_ascii_lowercase(),
                transfer_id: fields[2].to_string(),
            })
        }
        other => Err(CoreError::DccOfferInvalid(format!(
            "unknown DCC verb {other:?}"
        ))),
    }
}

fn quote_filename(filename: &str) -> String {
    if filename.contains(' ') {
        format!("\"{filename}\"")
    } else {
        filename.to_string()
    }
}

fn ip_u32(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

/// Format an active or passive SEND offer payload.
pub fn format_dcc_send(
    filename: &str,
    ip: Ipv4Addr,
    port: u16,
    filesize: u64,
    token: Option<&str>,
) -> String {
    let mut out = format!(
        "DCC SEND {} {} {} {}",
        quote_filename(filename),
        ip_u32(ip),
        port,
        filesize
    );
    if let Some(token) = token {
        out.push(' ');
        out.push_str(token);
    }
    out
}

/// Format the ACCEPT reply to an inbound RESUME request.
pub fn format_dcc_accept_resume(
    filename: &str,
    port: u16,
    position: u64,
    token: Option<&str>,
) -> String {
    let mut out = format!("DCC ACCEPT {} {} {}", quote_filename(filename), port, position);
    if let Some(token) = token {
        out.push(' ');
        out.push_str(token);
    }
    out
}

/// Format the ACCEPT that answers a passive offer: we are listening at
/// `ip:port`, position is always 0.
pub fn format_dcc_accept_passive(filename: &str, ip: Ipv4Addr, port: u16, token: &str) -> String {
    format!(
        "DCC ACCEPT {} {} {} 0 {}",
        quote_filename(filename),
        ip_u32(ip),
        port,
        token
    )
}

/// Format a RESUME request for a partially present file.
pub fn format_dcc_resume(filename: &str, port: u16, position: u64, token: Option<&str>) -> String {
    let mut out = format!("DCC RESUME {} {} {}", quote_filename(filename), port, position);
    if let Some(token) = token {
        out.push(' ');
        out.push_str(token);
    }
    out
}

/// Format a CHECKSUM announcement.
pub fn format_dcc_checksum(
    filename: &str,
    algorithm: &str,
    digest: &str,
    transfer_id: &str,
) -> String {
    format!(
        "DCC CHECKSUM {} {} {} {}",
        quote_filename(filename),
        algorithm,
        digest,
        transfer_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_single_ctcp_only() {
        assert_eq!(extract_ctcp("\u{1}VERSION\u{1}"), Some("VERSION"));
        assert_eq!(extract_ctcp("plain text"), None);
        assert_eq!(extract_ctcp("\u{1}A\u{1}\u{1}B\u{1}"), None);
        assert_eq!(extract_ctcp("\u{1}unterminated"), None);
    }

    #[test]
    fn test_dcc_send_round_trip() {
        let ip: Ipv4Addr = "192.168.1.1".parse().unwrap();
        let payload = format_dcc_send("report.txt", ip, 49200, 1024, None);
        assert_eq!(payload, "DCC SEND report.txt 3232235777 49200 1024");
        let parsed = parse_dcc(&payload).unwrap();
        assert_eq!(
            parsed,
            DccMessage::Send {
                filename: "report.txt".to_string(),
                ip: Some(ip),
                port: 49200,
                filesize: 1024,
                token: None,
            }
        );
    }

    #[test]
    fn test_dcc_send_quoted_filename() {
        let ip: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let payload = format_dcc_send("my file.bin", ip, 5000, 42, Some("tok1"));
        let parsed = parse_dcc(&payload).unwrap();
        match parsed {
            DccMessage::Send {
                filename, token, ..
            } => {
                assert_eq!(filename, "my file.bin");
                assert_eq!(token.as_deref(), Some("tok1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_dcc_passive_offer() {
        let parsed = parse_dcc("DCC SEND gift.bin 0 0 2048 tok42").unwrap();
        assert_eq!(
            parsed,
            DccMessage::Send {
                filename: "gift.bin".to_string(),
                ip: None,
                port: 0,
                filesize: 2048,
                token: Some("tok42".to_string()),
            }
        );
    }

    #[test]
    fn test_dcc_accept_resume_form() {
        let parsed = parse_dcc("DCC ACCEPT movie.mkv 49201 500000").unwrap();
        assert_eq!(
            parsed,
            DccMessage::Accept {
                filename: "movie.mkv".to_string(),
                ip: None,
                port: 49201,
                position: 500000,
                token: None,
            }
        );
    }

    #[test]
    fn test_dcc_accept_resume_form_with_numeric_token() {
        // A numeric token must not flip a 3-field resume reply into the
        // passive form; arity decides.
        let payload = format_dcc_accept_resume("movie.mkv", 49201, 500000, Some("8675309"));
        assert_eq!(payload, "DCC ACCEPT movie.mkv 49201 500000 8675309");
        let parsed = parse_dcc(&payload).unwrap();
        assert_eq!(
            parsed,
            DccMessage::Accept {
                filename: "movie.mkv".to_string(),
                ip: None,
                port: 49201,
                position: 500000,
                token: Some("8675309".to_string()),
            }
        );
    }

    #[test]
    fn test_dcc_accept_passive_form() {
        let ip: Ipv4Addr = "192.168.1.1".parse().unwrap();
        let payload = format_dcc_accept_passive("gift.bin", ip, 51000, "tok42");
        assert_eq!(payload, "DCC ACCEPT gift.bin 3232235777 51000 0 tok42");
        let parsed = parse_dcc(&payload).unwrap();
        assert_eq!(
            parsed,
            DccMessage::Accept {
                filename: "gift.bin".to_string(),
                ip: Some(ip),
                port: 51000,
                position: 0,
                token: Some("tok42".to_string()),
            }
        );
    }

    #[test]
    fn test_dcc_resume_and_checksum() {
        let parsed = parse_dcc("DCC RESUME movie.mkv 49201 500000").unwrap();
        assert_eq!(
            parsed,
            DccMessage::Resume {
                filename: "movie.mkv".to_string(),
                port: 49201,
                position: 500000,
                token: None,
            }
        );

        let parsed = parse_dcc("DCC CHECKSUM report.txt sha256 ABCD1234 id-1").unwrap();
        assert_eq!(
            parsed,
            DccMessage::Checksum {
                filename: "report.txt".to_string(),
                algorithm: "sha256".to_string(),
                digest: "abcd1234".to_string(),
                transfer_id: "id-1".to_string(),
            }
        );
    }

    #[test]
    fn test_dcc_rejects_garbage() {
        assert!(parse_dcc("DCC SEND onlyname").is_err());
        assert!(parse_dcc("DCC SEND f xx 1 2").is_err());
        assert!(parse_dcc("DCC FROB a b c").is_err());
        assert!(parse_dcc("VERSION").is_err());
    }

    #[test]
    fn test_is_dcc() {
        assert!(is_dcc("DCC SEND a 1 2 3"));
        assert!(is_dcc("dcc send a 1 2 3"));
        assert!(!is_dcc("VERSION"));
    }
}
