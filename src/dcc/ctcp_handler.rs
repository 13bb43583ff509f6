//! # Inbound DCC CTCP Routing
//!
//! Interprets `DCC ...` CTCP payloads peeled out of PRIVMSGs and drives
//! the [`DccEngine`](super::DccEngine): offers are recorded or accepted,
//! ACCEPT replies are correlated against our pending offers, RESUME
//! requests seek our outgoing transfers, and CHECKSUM announcements feed
//! verification.

use super::DccEngine;
use crate::error::{CoreError, CoreResult};
use crate::wire::ctcp::{self, DccMessage};
use std::sync::Arc;
use tracing::{debug, warn};

/// Route one inbound DCC CTCP payload from `peer_nick`.
///
/// Returns a human-readable summary for the DCC context on success.
pub async fn handle_dcc_ctcp(
    engine: &Arc<DccEngine>,
    peer_nick: &str,
    payload: &str,
) -> CoreResult<String> {
    let message = ctcp::parse_dcc(payload)?;
    debug!("DCC CTCP from {}: {:?}", peer_nick, message);

    match message {
        DccMessage::Send {
            filename,
            ip,
            port,
            filesize,
            token,
        } => {
            if port == 0 {
                let Some(token) = token else {
                    return Err(CoreError::DccOfferInvalid(
                        "passive offer without a token".to_string(),
                    ));
                };
                engine.on_passive_send_offer(peer_nick, &filename, ip, filesize, &token)?;
                Ok(format!(
                    "Passive DCC offer from {peer_nick}: '{filename}' ({filesize} bytes, token {token}). \
                     Accept to start the transfer."
                ))
            } else {
                let Some(ip) = ip else {
                    return Err(CoreError::DccOfferInvalid(
                        "active offer without an address".to_string(),
                    ));
                };
                engine
                    .on_send_offer(peer_nick, &filename, ip, port, filesize)
                    .await?;
                Ok(format!(
                    "DCC offer from {peer_nick}: '{filename}' ({filesize} bytes) at {ip}:{port}"
                ))
            }
        }
        DccMessage::Accept {
            filename,
            ip,
            port,
            position,
            token,
        } => {
            engine
                .handle_accept(peer_nick, &filename, ip, port, position, token.as_deref())
                .await?;
            Ok(format!(
                "{peer_nick} accepted '{filename}' (position {position})"
            ))
        }
        DccMessage::Resume {
            filename,
            port,
            position,
            token,
        } => {
            engine.handle_resume_request(
                peer_nick,
                &filename,
                port,
                position,
                token.as_deref(),
            )?;
            Ok(format!(
                "{peer_nick} resumes '{filename}' from byte {position}"
            ))
        }
        DccMessage::Checksum {
            filename,
            algorithm,
            digest,
            transfer_id,
        } => {
            if let Err(e) = engine.handle_checksum(&algorithm, &digest, &transfer_id) {
                warn!("checksum for unknown transfer: {e}");
                return Err(e);
            }
            Ok(format!(
                "Checksum received for '{filename}' ({algorithm})"
            ))
        }
    }
}
