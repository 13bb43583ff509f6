//! # DCC Transfer Engine
//!
//! Owns every DCC file transfer: the transfer table, the passive-offer
//! table, and the per-peer send queues, all guarded by a single mutex that
//! is never held across I/O. Each running transfer gets its own worker
//! task (see [`transfer`]); the engine handles negotiation, correlation of
//! CTCP replies, queuing, resume, checksum exchange and periodic cleanup.
//!
//! ## Transfer paths
//!
//! - **Active receive**: inbound `SEND` with a real port; we connect out.
//! - **Passive receive**: inbound `SEND` with port 0 and a token; on
//!   acceptance we listen and answer with `ACCEPT`, the sender connects.
//! - **Active send**: we listen on a port from the configured range and
//!   offer `SEND`; the peer connects (optionally after `RESUME`).
//! - **Passive send**: we offer `SEND` with port 0 and a token; the peer
//!   answers `ACCEPT` with its address and we connect.

pub mod ctcp_handler;
pub mod sanitize;
pub mod transfer;

use crate::config::{ChecksumAlgorithm, DccConfig};
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::transport::Transport;
use crate::utils::irc_fold;
use crate::wire::{self, ctcp};
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use transfer::{
    set_status, DccDirection, DccTransfer, DccTransferStatus, TransferHandle, WorkerCtx,
};
use uuid::Uuid;

/// A stored inbound passive (reverse) offer, waiting for the user.
#[derive(Debug, Clone)]
pub struct PassiveOffer {
    pub token: String,
    pub peer_nick: String,
    pub filename: String,
    pub filesize: u64,
    pub peer_ip: Option<Ipv4Addr>,
    pub received_at: Instant,
}

/// Our own passive offer, waiting for the peer's ACCEPT.
struct PendingPassiveSend {
    transfer_id: String,
    created_at: Instant,
}

/// A receiver-side RESUME we issued, waiting for the sender's ACCEPT.
struct PendingResume {
    transfer_id: String,
    addr: SocketAddr,
    position: u64,
}

#[derive(Default)]
struct Tables {
    transfers: HashMap<String, Arc<TransferHandle>>,
    passive_offers: HashMap<String, PassiveOffer>,
    pending_passive_sends: HashMap<String, PendingPassiveSend>,
    /// Keyed by the sender's advertised port from the original offer.
    pending_resumes: HashMap<u16, PendingResume>,
    /// Our listening port → transfer id, for RESUME correlation.
    listen_ports: HashMap<u16, String>,
    /// Folded peer nick → queued outgoing transfer ids.
    send_queues: HashMap<String, VecDeque<String>>,
    /// Peers with an in-flight outgoing send.
    sending_to: HashSet<String>,
}

/// The transfer engine. Shared as `Arc`; every method takes `&self`.
pub struct DccEngine {
    config: DccConfig,
    events: Arc<EventBus>,
    transport: Transport,
    tables: Mutex<Tables>,
}

impl DccEngine {
    pub fn new(config: DccConfig, events: Arc<EventBus>, transport: Transport) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            transport,
            tables: Mutex::new(Tables::default()),
        })
    }

    pub fn config(&self) -> &DccConfig {
        &self.config
    }

    fn ensure_enabled(&self) -> CoreResult<()> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(CoreError::DccInternal("DCC is disabled".to_string()))
        }
    }

    fn new_transfer_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn new_token() -> String {
        rand::thread_rng().gen_range(1000u32..99_999_999).to_string()
    }

    fn send_ctcp(&self, peer_nick: &str, payload: &str) -> CoreResult<()> {
        self.transport
            .send_line(&wire::ctcp_privmsg(peer_nick, payload))
    }

    /// Local IPv4 address advertised in outgoing offers: the configured
    /// address when valid, else the source address of a UDP connect to a
    /// public host, else the resolved hostname, else loopback.
    pub fn local_ip_for_ctcp(&self) -> Ipv4Addr {
        if let Some(ref configured) = self.config.advertised_ip {
            match configured.parse::<Ipv4Addr>() {
                Ok(ip) => return ip,
                Err(_) => warn!("configured advertised_ip {configured:?} is invalid"),
            }
        }
        if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
            if socket.connect("8.8.8.8:80").is_ok() {
                if let Ok(SocketAddr::V4(addr)) = socket.local_addr() {
                    return *addr.ip();
                }
            }
        }
        if let Ok(hostname) = std::env::var("HOSTNAME") {
            if let Ok(mut addrs) = std::net::ToSocketAddrs::to_socket_addrs(&(hostname, 0u16)) {
                if let Some(SocketAddr::V4(addr)) = addrs.next() {
                    return *addr.ip();
                }
            }
        }
        Ipv4Addr::LOCALHOST
    }

    /// Bind a listener on the first free port in the configured range.
    async fn bind_in_range(&self) -> CoreResult<(TcpListener, u16)> {
        let (mut start, mut end) = (self.config.port_range_start, self.config.port_range_end);
        if start > end {
            warn!("invalid DCC port range {start}-{end}; using 1024-65535");
            start = 1024;
            end = 65535;
        }
        for port in start..=end {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    // Port 0 asks the OS for an ephemeral port; report the
                    // one actually bound.
                    let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                    debug!("DCC listening socket bound to port {bound}");
                    return Ok((listener, bound));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
                Err(e) => {
                    warn!("could not bind DCC port {port}: {e}");
                    continue;
                }
            }
        }
        Err(CoreError::DccInternal(format!(
            "no available DCC port in range {start}-{end}"
        )))
    }

    // ------------------------------------------------------------------
    // Inbound offers
    // ------------------------------------------------------------------

    /// An active `SEND` offer arrived. Auto-accepts when configured,
    /// otherwise records nothing and lets the user decide.
    pub async fn on_send_offer(
        self: &Arc<Self>,
        peer_nick: &str,
        filename: &str,
        ip: Ipv4Addr,
        port: u16,
        filesize: u64,
    ) -> CoreResult<()> {
        self.ensure_enabled()?;
        self.events.emit(
            "DCC_OFFER_RECEIVED",
            json!({
                "nick": peer_nick,
                "filename": filename,
                "ip": ip.to_string(),
                "port": port,
                "size": filesize,
            }),
        );
        if self.config.auto_accept {
            info!("auto-accepting DCC SEND from {peer_nick}: {filename}");
            self.accept_offer(peer_nick, filename, ip, port, filesize)
                .await?;
        }
        Ok(())
    }

    /// A passive `SEND` offer arrived: store it under its token.
    pub fn on_passive_send_offer(
        &self,
        peer_nick: &str,
        filename: &str,
        ip: Option<Ipv4Addr>,
        filesize: u64,
        token: &str,
    ) -> CoreResult<()> {
        self.ensure_enabled()?;
        let offer = PassiveOffer {
            token: token.to_string(),
            peer_nick: peer_nick.to_string(),
            filename: filename.to_string(),
            filesize,
            peer_ip: ip,
            received_at: Instant::now(),
        };
        {
            let mut tables = self.tables.lock();
            if tables.passive_offers.contains_key(token) {
                return Err(CoreError::DccOfferInvalid(format!(
                    "duplicate passive offer token {token}"
                )));
            }
            tables.passive_offers.insert(token.to_string(), offer);
        }
        self.events.emit(
            "DCC_PASSIVE_OFFER_RECEIVED",
            json!({
                "nick": peer_nick,
                "filename": filename,
                "size": filesize,
                "token": token,
            }),
        );
        Ok(())
    }

    /// Accept an active inbound offer: validate the path, create a
    /// RECEIVE transfer and connect out to the sender.
    ///
    /// When a partial file already exists and resume is enabled, a
    /// `RESUME` request is sent instead and the connection waits for the
    /// sender's `ACCEPT`.
    pub async fn accept_offer(
        self: &Arc<Self>,
        peer_nick: &str,
        filename: &str,
        ip: Ipv4Addr,
        port: u16,
        filesize: u64,
    ) -> CoreResult<String> {
        self.ensure_enabled()?;
        let (local_path, sanitized) =
            match sanitize::validate_download_path(filename, filesize, &self.config) {
                Ok(ok) => ok,
                Err(e) => {
                    self.events.emit(
                        "DCC_TRANSFER_ERROR",
                        json!({
                            "nick": peer_nick,
                            "filename": filename,
                            "error": e.to_string(),
                        }),
                    );
                    return Err(e);
                }
            };

        let id = Self::new_transfer_id();
        let mut entity = DccTransfer::new(
            id.clone(),
            peer_nick,
            DccDirection::Receive,
            filename,
            local_path.clone(),
            filesize,
            &self.config,
        );
        entity.peer_ip = Some(IpAddr::V4(ip));
        entity.peer_port = port;
        let handle = TransferHandle::new(entity);
        self.tables.lock().transfers.insert(id.clone(), handle.clone());
        set_status(&handle, &self.events, DccTransferStatus::Queued, None);

        let addr = SocketAddr::new(IpAddr::V4(ip), port);

        // Partial file present: ask the sender to resume rather than
        // restarting from zero.
        let existing = tokio::fs::metadata(&local_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if self.config.resume_enabled && existing > 0 && existing < filesize {
            info!(
                "partial file for '{}' at {} bytes; requesting resume",
                sanitized, existing
            );
            self.tables.lock().pending_resumes.insert(
                port,
                PendingResume {
                    transfer_id: id.clone(),
                    addr,
                    position: existing,
                },
            );
            set_status(&handle, &self.events, DccTransferStatus::Negotiating, None);
            self.send_ctcp(
                peer_nick,
                &ctcp::format_dcc_resume(filename, port, existing, None),
            )?;
            return Ok(id);
        }

        self.spawn_receive(handle, addr, 0);
        Ok(id)
    }

    /// Accept a stored passive offer by its token: open a listening
    /// socket, tell the sender where we are, and wait for its connection.
    pub async fn accept_passive_offer(self: &Arc<Self>, token: &str) -> CoreResult<String> {
        self.ensure_enabled()?;
        let offer = self
            .tables
            .lock()
            .passive_offers
            .remove(token)
            .ok_or_else(|| {
                CoreError::DccOfferInvalid(format!("no passive offer with token {token}"))
            })?;

        let (local_path, _sanitized) = match sanitize::validate_download_path(
            &offer.filename,
            offer.filesize,
            &self.config,
        ) {
            Ok(ok) => ok,
            Err(e) => {
                self.events.emit(
                    "DCC_TRANSFER_ERROR",
                    json!({
                        "nick": offer.peer_nick,
                        "filename": offer.filename,
                        "error": e.to_string(),
                    }),
                );
                return Err(e);
            }
        };

        let (listener, port) = self.bind_in_range().await?;
        let id = Self::new_transfer_id();
        let mut entity = DccTransfer::new(
            id.clone(),
            &offer.peer_nick,
            DccDirection::Receive,
            &offer.filename,
            local_path,
            offer.filesize,
            &self.config,
        );
        entity.is_passive = true;
        entity.passive_token = Some(token.to_string());
        entity.peer_ip = offer.peer_ip.map(IpAddr::V4);
        let handle = TransferHandle::new(entity);
        self.tables.lock().transfers.insert(id.clone(), handle.clone());
        set_status(&handle, &self.events, DccTransferStatus::Queued, None);

        self.send_ctcp(
            &offer.peer_nick,
            &ctcp::format_dcc_accept_passive(
                &offer.filename,
                self.local_ip_for_ctcp(),
                port,
                token,
            ),
        )?;

        let ctx = self.worker_ctx(handle);
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = transfer::run_receive_listening(ctx, listener, 0).await {
                debug!("passive receive ended: {e}");
            }
            engine.refresh_dcc_view();
        });
        Ok(id)
    }

    /// Stored passive offers, for display and tests.
    pub fn passive_offers(&self) -> Vec<PassiveOffer> {
        self.tables.lock().passive_offers.values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Outgoing sends
    // ------------------------------------------------------------------

    /// Offer a local file to `peer_nick`. Transfers to a peer run one at
    /// a time in offer order; concurrent sends to different peers are
    /// independent.
    pub async fn initiate_send(
        self: &Arc<Self>,
        peer_nick: &str,
        path: PathBuf,
        passive: bool,
    ) -> CoreResult<String> {
        self.ensure_enabled()?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| CoreError::DccInternal(format!("cannot stat {path:?}: {e}")))?;
        if !metadata.is_file() {
            return Err(CoreError::DccInternal(format!("{path:?} is not a file")));
        }
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| CoreError::DccInternal("path has no filename".to_string()))?;

        let id = Self::new_transfer_id();
        let mut entity = DccTransfer::new(
            id.clone(),
            peer_nick,
            DccDirection::Send,
            &filename,
            path,
            metadata.len(),
            &self.config,
        );
        entity.is_passive = passive;
        let handle = TransferHandle::new(entity);

        let start_now = {
            let mut tables = self.tables.lock();
            tables.transfers.insert(id.clone(), handle.clone());
            let peer_key = irc_fold(peer_nick);
            if tables.sending_to.contains(&peer_key) {
                tables
                    .send_queues
                    .entry(peer_key)
                    .or_default()
                    .push_back(id.clone());
                false
            } else {
                tables.sending_to.insert(peer_key);
                true
            }
        };
        set_status(&handle, &self.events, DccTransferStatus::Queued, None);

        if start_now {
            self.start_send(&id).await?;
        } else {
            debug!("send to {peer_nick} queued behind an in-flight transfer");
        }
        Ok(id)
    }

    /// Begin the offer for an already-registered outgoing transfer.
    async fn start_send(self: &Arc<Self>, transfer_id: &str) -> CoreResult<()> {
        let handle = self
            .lookup(transfer_id)
            .ok_or_else(|| CoreError::DccInternal(format!("unknown transfer {transfer_id}")))?;
        let (peer_nick, filename, filesize, passive) = {
            let state = handle.state.lock();
            (
                state.peer_nick.clone(),
                state.original_filename.clone(),
                state.filesize,
                state.is_passive,
            )
        };
        let local_ip = self.local_ip_for_ctcp();

        if passive {
            let token = Self::new_token();
            {
                let mut tables = self.tables.lock();
                tables.pending_passive_sends.insert(
                    token.clone(),
                    PendingPassiveSend {
                        transfer_id: transfer_id.to_string(),
                        created_at: Instant::now(),
                    },
                );
            }
            handle.state.lock().passive_token = Some(token.clone());
            set_status(&handle, &self.events, DccTransferStatus::Negotiating, None);
            self.send_ctcp(
                &peer_nick,
                &ctcp::format_dcc_send(&filename, local_ip, 0, filesize, Some(&token)),
            )?;
            return Ok(());
        }

        let (listener, port) = match self.bind_in_range().await {
            Ok(ok) => ok,
            Err(e) => {
                set_status(
                    &handle,
                    &self.events,
                    DccTransferStatus::Failed,
                    Some(e.to_string()),
                );
                self.on_send_finished(&peer_nick);
                return Err(e);
            }
        };
        self.tables
            .lock()
            .listen_ports
            .insert(port, transfer_id.to_string());
        handle.state.lock().peer_port = port;

        if let Err(e) = self.send_ctcp(
            &peer_nick,
            &ctcp::format_dcc_send(&filename, local_ip, port, filesize, None),
        ) {
            set_status(
                &handle,
                &self.events,
                DccTransferStatus::Failed,
                Some(e.to_string()),
            );
            self.tables.lock().listen_ports.remove(&port);
            self.on_send_finished(&peer_nick);
            return Err(e);
        }

        let ctx = self.worker_ctx(handle);
        let engine = self.clone();
        let id = transfer_id.to_string();
        tokio::spawn(async move {
            let result = transfer::run_send_listening(ctx, listener).await;
            engine.complete_send_worker(&id, result).await;
        });
        Ok(())
    }

    /// Post-worker bookkeeping for an outgoing send: checksum CTCP on
    /// success, port release, queue advance.
    async fn complete_send_worker(
        self: &Arc<Self>,
        transfer_id: &str,
        result: CoreResult<Option<String>>,
    ) {
        let Some(handle) = self.lookup(transfer_id) else {
            return;
        };
        let (peer_nick, filename, port) = {
            let state = handle.state.lock();
            (
                state.peer_nick.clone(),
                state.original_filename.clone(),
                state.peer_port,
            )
        };
        {
            let mut tables = self.tables.lock();
            // Passive sends store the peer's port here; only release a
            // listener entry that actually belongs to this transfer.
            if tables.listen_ports.get(&port).map(|id| id.as_str()) == Some(transfer_id) {
                tables.listen_ports.remove(&port);
            }
        }

        match result {
            Ok(Some(digest)) => {
                let algorithm = handle.state.lock().checksum_algorithm;
                if algorithm != ChecksumAlgorithm::None {
                    let payload = ctcp::format_dcc_checksum(
                        &filename,
                        algorithm.as_str(),
                        &digest,
                        transfer_id,
                    );
                    if let Err(e) = self.send_ctcp(&peer_nick, &payload) {
                        warn!("could not send DCC CHECKSUM: {e}");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => debug!("send worker for {transfer_id} ended: {e}"),
        }

        self.on_send_finished(&peer_nick);
        self.refresh_dcc_view();
    }

    /// Advance the peer's send queue after a terminal outgoing transfer.
    fn on_send_finished(self: &Arc<Self>, peer_nick: &str) {
        let next = {
            let mut tables = self.tables.lock();
            let peer_key = irc_fold(peer_nick);
            let next = tables
                .send_queues
                .get_mut(&peer_key)
                .and_then(|q| q.pop_front());
            if next.is_none() {
                tables.sending_to.remove(&peer_key);
            }
            next
        };
        if let Some(next_id) = next {
            debug!("starting queued send {next_id} to {peer_nick}");
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.start_send(&next_id).await {
                    error!("queued send {next_id} failed to start: {e}");
                    // The failed start already advanced the queue.
                }
            });
        }
    }

    // ------------------------------------------------------------------
    // CTCP reply correlation
    // ------------------------------------------------------------------

    /// The peer accepted one of our offers or resume requests. Strict
    /// correlation: an ACCEPT matching neither a pending passive token
    /// nor a pending resume is rejected.
    pub async fn handle_accept(
        self: &Arc<Self>,
        peer_nick: &str,
        filename: &str,
        ip: Option<Ipv4Addr>,
        port: u16,
        position: u64,
        token: Option<&str>,
    ) -> CoreResult<()> {
        self.ensure_enabled()?;

        // Passive send: token correlates.
        if let Some(token) = token {
            let pending = self.tables.lock().pending_passive_sends.remove(token);
            if let Some(pending) = pending {
                let Some(ip) = ip else {
                    return Err(CoreError::DccOfferInvalid(
                        "passive ACCEPT without an address".to_string(),
                    ));
                };
                let Some(handle) = self.lookup(&pending.transfer_id) else {
                    return Err(CoreError::DccInternal(
                        "accepted transfer disappeared".to_string(),
                    ));
                };
                {
                    let mut state = handle.state.lock();
                    state.peer_ip = Some(IpAddr::V4(ip));
                    state.peer_port = port;
                }
                let addr = SocketAddr::new(IpAddr::V4(ip), port);
                info!("passive offer {token} accepted by {peer_nick}; connecting to {addr}");
                let ctx = self.worker_ctx(handle);
                let engine = self.clone();
                let id = pending.transfer_id.clone();
                tokio::spawn(async move {
                    let result = transfer::run_send_connecting(ctx, addr).await;
                    engine.complete_send_worker(&id, result).await;
                });
                return Ok(());
            }
        }

        // Receiver-side resume: the sender granted our RESUME.
        let pending = self.tables.lock().pending_resumes.remove(&port);
        if let Some(pending) = pending {
            if position != pending.position {
                warn!(
                    "ACCEPT position {} does not match requested {}; restarting from it anyway",
                    position, pending.position
                );
            }
            let Some(handle) = self.lookup(&pending.transfer_id) else {
                return Err(CoreError::DccInternal(
                    "resumed transfer disappeared".to_string(),
                ));
            };
            info!(
                "resume granted for '{}' at {} bytes",
                filename, position
            );
            self.spawn_receive(handle, pending.addr, position);
            return Ok(());
        }

        Err(CoreError::DccOfferInvalid(format!(
            "unmatched DCC ACCEPT from {peer_nick} for {filename:?}"
        )))
    }

    /// The peer asked to resume one of our outgoing offers.
    pub fn handle_resume_request(
        &self,
        peer_nick: &str,
        filename: &str,
        port: u16,
        position: u64,
        token: Option<&str>,
    ) -> CoreResult<()> {
        self.ensure_enabled()?;
        let transfer_id = self
            .tables
            .lock()
            .listen_ports
            .get(&port)
            .cloned()
            .ok_or_else(|| {
                CoreError::DccOfferInvalid(format!("no offer listening on port {port}"))
            })?;
        let handle = self
            .lookup(&transfer_id)
            .ok_or_else(|| CoreError::DccInternal("offer transfer disappeared".to_string()))?;

        let filesize = handle.state.lock().filesize;
        if position > filesize {
            return Err(CoreError::DccOfferInvalid(format!(
                "resume position {position} beyond file size {filesize}"
            )));
        }
        handle.resume_position.store(position, Ordering::SeqCst);
        info!(
            "{} resumes '{}' from {} bytes",
            peer_nick, filename, position
        );
        self.send_ctcp(
            peer_nick,
            &ctcp::format_dcc_accept_resume(filename, port, position, token),
        )
    }

    /// The sender announced the digest for a completed transfer.
    pub fn handle_checksum(
        &self,
        algorithm: &str,
        digest: &str,
        transfer_id: &str,
    ) -> CoreResult<()> {
        self.ensure_enabled()?;
        let handle = self.lookup(transfer_id).ok_or_else(|| {
            CoreError::DccOfferInvalid(format!("CHECKSUM for unknown transfer {transfer_id}"))
        })?;
        transfer::record_expected_checksum(&handle, &self.events, algorithm, digest);
        Ok(())
    }

    // ------------------------------------------------------------------
    // User operations
    // ------------------------------------------------------------------

    /// Cancel a transfer by id prefix. The worker observes the flag at
    /// its next buffer boundary.
    pub fn cancel_transfer(&self, id_prefix: &str) -> CoreResult<String> {
        let handle = self.find_by_prefix(id_prefix)?;
        handle.cancel.store(true, Ordering::SeqCst);
        // Pre-worker states have no task to observe the flag.
        if matches!(
            handle.status(),
            DccTransferStatus::Queued | DccTransferStatus::Negotiating
        ) {
            set_status(&handle, &self.events, DccTransferStatus::Cancelled, None);
        }
        info!("cancel requested for transfer {}", handle.id);
        Ok(handle.id.clone())
    }

    /// Drop an unaccepted passive offer by token prefix.
    pub fn cancel_passive_offer(&self, token_prefix: &str) -> CoreResult<String> {
        let mut tables = self.tables.lock();
        let matches: Vec<String> = tables
            .passive_offers
            .keys()
            .filter(|t| t.starts_with(token_prefix))
            .cloned()
            .collect();
        match matches.len() {
            0 => Err(CoreError::DccOfferInvalid(format!(
                "no passive offer matching {token_prefix}"
            ))),
            1 => {
                tables.passive_offers.remove(&matches[0]);
                Ok(matches[0].clone())
            }
            _ => Err(CoreError::DccOfferInvalid(format!(
                "ambiguous token prefix {token_prefix}"
            ))),
        }
    }

    /// Re-offer a previously failed outgoing transfer so the peer can
    /// resume it. `identifier` is a transfer-id prefix or a filename;
    /// ambiguous identifiers are rejected.
    pub async fn attempt_user_resume(self: &Arc<Self>, identifier: &str) -> CoreResult<String> {
        self.ensure_enabled()?;
        if !self.config.resume_enabled {
            return Err(CoreError::DccInternal(
                "DCC resume is disabled in configuration".to_string(),
            ));
        }

        let candidate = self.find_resumable_send(identifier)?;
        let snapshot = candidate.snapshot();
        if !snapshot.status.is_terminal() || snapshot.status == DccTransferStatus::Completed {
            return Err(CoreError::DccInternal(format!(
                "transfer '{}' is not in a resumable state ({})",
                snapshot.original_filename,
                snapshot.status.as_str()
            )));
        }
        if snapshot.bytes_transferred == 0 || snapshot.bytes_transferred >= snapshot.filesize {
            return Err(CoreError::DccInternal(format!(
                "transfer '{}' has no partial progress to resume from",
                snapshot.original_filename
            )));
        }

        info!(
            "re-offering '{}' to {} (peer may resume from {})",
            snapshot.original_filename, snapshot.peer_nick, snapshot.bytes_transferred
        );
        self.initiate_send(&snapshot.peer_nick, snapshot.local_path.clone(), false)
            .await
    }

    fn find_resumable_send(&self, identifier: &str) -> CoreResult<Arc<TransferHandle>> {
        let tables = self.tables.lock();
        let by_id: Vec<&Arc<TransferHandle>> = tables
            .transfers
            .values()
            .filter(|h| {
                h.id.starts_with(identifier)
                    && h.state.lock().direction == DccDirection::Send
            })
            .collect();
        match by_id.len() {
            1 => return Ok(by_id[0].clone()),
            n if n > 1 => {
                return Err(CoreError::DccInternal(format!(
                    "ambiguous transfer id prefix '{identifier}'"
                )))
            }
            _ => {}
        }
        let by_name: Vec<&Arc<TransferHandle>> = tables
            .transfers
            .values()
            .filter(|h| {
                let state = h.state.lock();
                state.direction == DccDirection::Send
                    && state.original_filename.eq_ignore_ascii_case(identifier)
            })
            .collect();
        match by_name.len() {
            0 => Err(CoreError::DccInternal(format!(
                "no SEND transfer matching '{identifier}'"
            ))),
            1 => Ok(by_name[0].clone()),
            _ => Err(CoreError::DccInternal(format!(
                "ambiguous filename '{identifier}'; use a transfer id prefix"
            ))),
        }
    }

    /// Status lines for the DCC transfers context.
    pub fn transfer_statuses(&self) -> Vec<String> {
        let mut snapshots: Vec<DccTransfer> = self
            .tables
            .lock()
            .transfers
            .values()
            .map(|h| h.snapshot())
            .collect();
        snapshots.sort_by_key(|t| t.start_time.unwrap_or_else(Utc::now));
        snapshots.iter().map(|t| t.describe()).collect()
    }

    pub fn lookup(&self, transfer_id: &str) -> Option<Arc<TransferHandle>> {
        self.tables.lock().transfers.get(transfer_id).cloned()
    }

    fn find_by_prefix(&self, id_prefix: &str) -> CoreResult<Arc<TransferHandle>> {
        let tables = self.tables.lock();
        let matches: Vec<&Arc<TransferHandle>> = tables
            .transfers
            .values()
            .filter(|h| h.id.starts_with(id_prefix))
            .collect();
        match matches.len() {
            0 => Err(CoreError::DccOfferInvalid(format!(
                "no transfer matching {id_prefix}"
            ))),
            1 => Ok(matches[0].clone()),
            _ => Err(CoreError::DccOfferInvalid(format!(
                "ambiguous transfer id prefix {id_prefix}"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    fn worker_ctx(&self, handle: Arc<TransferHandle>) -> WorkerCtx {
        WorkerCtx {
            handle,
            config: self.config.clone(),
            events: self.events.clone(),
        }
    }

    fn spawn_receive(self: &Arc<Self>, handle: Arc<TransferHandle>, addr: SocketAddr, from: u64) {
        let ctx = self.worker_ctx(handle);
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = transfer::run_receive_connecting(ctx, addr, from).await {
                debug!("receive worker ended: {e}");
            }
            engine.refresh_dcc_view();
        });
    }

    /// Nudge observers that the DCC view changed.
    fn refresh_dcc_view(&self) {
        self.events.emit("DCC_VIEW_CHANGED", json!({}));
    }

    /// Start the periodic cleanup task. No-op when cleanup is disabled.
    pub fn spawn_cleanup_task(self: &Arc<Self>) {
        if !self.config.cleanup_enabled || self.config.cleanup_interval_secs == 0 {
            info!("DCC cleanup disabled");
            return;
        }
        let engine = self.clone();
        let interval = std::time::Duration::from_secs(self.config.cleanup_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.cleanup_now();
            }
        });
    }

    /// Remove terminal transfers older than the configured age, expired
    /// passive offers, and expired pending passive sends.
    pub fn cleanup_now(self: &Arc<Self>) {
        let max_age = chrono::Duration::seconds(self.config.transfer_max_age_secs as i64);
        let token_timeout =
            std::time::Duration::from_secs(self.config.passive_token_timeout_secs);
        let now = Utc::now();

        let mut expired_sends: Vec<String> = Vec::new();
        {
            let mut tables = self.tables.lock();
            let before = tables.transfers.len();
            tables.transfers.retain(|_, handle| {
                let state = handle.state.lock();
                if !state.status.is_terminal() {
                    return true;
                }
                match state.end_time {
                    Some(end) => now.signed_duration_since(end) < max_age,
                    None => true,
                }
            });
            let removed = before - tables.transfers.len();
            if removed > 0 {
                info!("cleaned up {removed} finished DCC transfers");
            }

            tables
                .passive_offers
                .retain(|_, offer| offer.received_at.elapsed() < token_timeout);

            tables.pending_passive_sends.retain(|_, pending| {
                if pending.created_at.elapsed() < token_timeout {
                    true
                } else {
                    expired_sends.push(pending.transfer_id.clone());
                    false
                }
            });
        }

        for transfer_id in expired_sends {
            if let Some(handle) = self.lookup(&transfer_id) {
                set_status(
                    &handle,
                    &self.events,
                    DccTransferStatus::TimedOut,
                    Some("passive offer never accepted".to_string()),
                );
                let peer = handle.state.lock().peer_nick.clone();
                warn!("passive offer to {peer} expired");
                self.on_send_finished(&peer);
            }
        }
    }
}
