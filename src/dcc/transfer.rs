//! # DCC Transfer Entities and Workers
//!
//! A [`DccTransfer`] records everything about one file transfer; a
//! [`TransferHandle`] wraps it with the cancellation flag and resume
//! offset shared between the engine and the transfer's worker task.
//!
//! Each active transfer owns exactly one worker task and one socket.
//! Workers publish progress roughly every 500 ms or 64 KiB, honor the
//! cancellation flag at every buffer boundary, and treat the configured
//! timeout both as the negotiation deadline and as an inactivity watchdog.

use crate::config::{ChecksumAlgorithm, DccConfig};
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::utils::hex_digest;
use chrono::{DateTime, Utc};
use md5::Md5;
use parking_lot::Mutex;
use serde_json::json;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Streaming buffer size.
const CHUNK_SIZE: usize = 65536;

/// Emit a progress event at least this often while bytes are flowing.
const PROGRESS_INTERVAL_MS: u128 = 500;

/// ... or after this many bytes since the last event.
const PROGRESS_BYTES: u64 = 64 * 1024;

/// Transfer direction from our point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DccDirection {
    Send,
    Receive,
}

impl DccDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            DccDirection::Send => "SEND",
            DccDirection::Receive => "RECEIVE",
        }
    }
}

/// Lifecycle of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DccTransferStatus {
    Queued,
    Negotiating,
    Connecting,
    Transferring,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl DccTransferStatus {
    /// Terminal states are eligible for cleanup once old enough.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DccTransferStatus::Completed
                | DccTransferStatus::Failed
                | DccTransferStatus::Cancelled
                | DccTransferStatus::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DccTransferStatus::Queued => "QUEUED",
            DccTransferStatus::Negotiating => "NEGOTIATING",
            DccTransferStatus::Connecting => "CONNECTING",
            DccTransferStatus::Transferring => "TRANSFERRING",
            DccTransferStatus::Completed => "COMPLETED",
            DccTransferStatus::Failed => "FAILED",
            DccTransferStatus::Cancelled => "CANCELLED",
            DccTransferStatus::TimedOut => "TIMED_OUT",
        }
    }
}

/// Outcome of checksum verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStatus {
    /// Verification enabled, digest not yet available.
    Pending,
    /// Verification disabled or impossible.
    NotChecked,
    Match,
    Mismatch,
    /// Digest computation failed.
    Error,
}

impl ChecksumStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumStatus::Pending => "Pending",
            ChecksumStatus::NotChecked => "NotChecked",
            ChecksumStatus::Match => "Match",
            ChecksumStatus::Mismatch => "Mismatch",
            ChecksumStatus::Error => "Error",
        }
    }
}

/// Everything known about one transfer.
#[derive(Debug, Clone)]
pub struct DccTransfer {
    pub id: String,
    pub peer_nick: String,
    pub peer_ip: Option<IpAddr>,
    pub peer_port: u16,
    pub direction: DccDirection,
    pub original_filename: String,
    /// Validated location inside the download directory (receives) or the
    /// source file (sends).
    pub local_path: PathBuf,
    pub filesize: u64,
    pub bytes_transferred: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: DccTransferStatus,
    pub error_message: Option<String>,
    pub current_rate_bps: f64,
    pub estimated_eta_seconds: Option<u64>,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub expected_checksum: Option<String>,
    pub calculated_checksum: Option<String>,
    pub checksum_status: ChecksumStatus,
    pub is_passive: bool,
    pub passive_token: Option<String>,
}

impl DccTransfer {
    pub fn new(
        id: String,
        peer_nick: &str,
        direction: DccDirection,
        original_filename: &str,
        local_path: PathBuf,
        filesize: u64,
        config: &DccConfig,
    ) -> Self {
        let checksum_status = if config.checksum_verify
            && config.checksum_algorithm != ChecksumAlgorithm::None
        {
            ChecksumStatus::Pending
        } else {
            ChecksumStatus::NotChecked
        };
        Self {
            id,
            peer_nick: peer_nick.to_string(),
            peer_ip: None,
            peer_port: 0,
            direction,
            original_filename: original_filename.to_string(),
            local_path,
            filesize,
            bytes_transferred: 0,
            start_time: None,
            end_time: None,
            status: DccTransferStatus::Queued,
            error_message: None,
            current_rate_bps: 0.0,
            estimated_eta_seconds: None,
            checksum_algorithm: config.checksum_algorithm,
            expected_checksum: None,
            calculated_checksum: None,
            checksum_status,
            is_passive: false,
            passive_token: None,
        }
    }

    /// One status line for the DCC context.
    pub fn describe(&self) -> String {
        let pct = if self.filesize > 0 {
            (self.bytes_transferred as f64 / self.filesize as f64) * 100.0
        } else {
            0.0
        };
        format!(
            "[{}] {} {} '{}' {}/{} ({:.1}%) {} checksum={}",
            &self.id[..self.id.len().min(8)],
            self.direction.as_str(),
            self.peer_nick,
            self.original_filename,
            self.bytes_transferred,
            self.filesize,
            pct,
            self.status.as_str(),
            self.checksum_status.as_str(),
        )
    }
}

/// Shared cell for one transfer: the engine's table and the worker task
/// both hold an `Arc` of this.
pub struct TransferHandle {
    pub id: String,
    pub state: Mutex<DccTransfer>,
    /// Set by `cancel_transfer`; workers observe it at every buffer
    /// read/write boundary.
    pub cancel: AtomicBool,
    /// Resume offset granted to the peer, applied before streaming.
    pub resume_position: AtomicU64,
}

impl TransferHandle {
    pub fn new(transfer: DccTransfer) -> Arc<Self> {
        Arc::new(Self {
            id: transfer.id.clone(),
            state: Mutex::new(transfer),
            cancel: AtomicBool::new(false),
            resume_position: AtomicU64::new(0),
        })
    }

    pub fn snapshot(&self) -> DccTransfer {
        self.state.lock().clone()
    }

    pub fn status(&self) -> DccTransferStatus {
        self.state.lock().status
    }
}

/// Transition a transfer's status and emit the matching lifecycle event.
pub(crate) fn set_status(
    handle: &TransferHandle,
    events: &EventBus,
    status: DccTransferStatus,
    error_message: Option<String>,
) {
    let payload = {
        let mut state = handle.state.lock();
        if state.status.is_terminal() {
            // Terminal states stick (a cancel must not be overwritten by a
            // late worker failure).
            return;
        }
        state.status = status;
        if status == DccTransferStatus::Transferring && state.start_time.is_none() {
            state.start_time = Some(Utc::now());
        }
        if status.is_terminal() {
            state.end_time = Some(Utc::now());
        }
        if let Some(ref msg) = error_message {
            state.error_message = Some(msg.clone());
        }
        json!({
            "transfer_id": state.id,
            "type": state.direction.as_str(),
            "nick": state.peer_nick,
            "filename": state.original_filename,
            "size": state.filesize,
            "bytes_transferred": state.bytes_transferred,
            "error": state.error_message,
        })
    };

    let event_name = match status {
        DccTransferStatus::Queued => Some("DCC_TRANSFER_QUEUED"),
        DccTransferStatus::Transferring => Some("DCC_TRANSFER_START"),
        DccTransferStatus::Completed => Some("DCC_TRANSFER_COMPLETE"),
        DccTransferStatus::Failed | DccTransferStatus::TimedOut => Some("DCC_TRANSFER_ERROR"),
        DccTransferStatus::Cancelled => Some("DCC_TRANSFER_CANCELLED"),
        _ => None,
    };
    if let Some(name) = event_name {
        events.emit(name, payload);
    }
}

/// Store the peer's advertised digest and validate when ours is ready.
pub(crate) fn record_expected_checksum(
    handle: &TransferHandle,
    events: &EventBus,
    algorithm: &str,
    digest: &str,
) {
    {
        let mut state = handle.state.lock();
        state.checksum_algorithm = ChecksumAlgorithm::parse(algorithm);
        state.expected_checksum = Some(digest.to_ascii_lowercase());
    }
    try_validate_checksum(handle, events);
}

/// Compare expected and calculated digests once both are present.
pub(crate) fn try_validate_checksum(handle: &TransferHandle, events: &EventBus) {
    let payload = {
        let mut state = handle.state.lock();
        let (expected, calculated) = match (&state.expected_checksum, &state.calculated_checksum)
        {
            (Some(e), Some(c)) => (e.clone(), c.clone()),
            _ => return,
        };
        state.checksum_status = if expected == calculated {
            ChecksumStatus::Match
        } else {
            ChecksumStatus::Mismatch
        };
        json!({
            "transfer_id": state.id,
            "filename": state.original_filename,
            "algorithm": state.checksum_algorithm.as_str(),
            "expected": expected,
            "calculated": calculated,
            "status": state.checksum_status.as_str(),
        })
    };
    events.emit("DCC_TRANSFER_CHECKSUM_VALIDATED", payload);
}

/// Incremental digest over the streamed bytes.
enum Hasher {
    Disabled,
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm, enabled: bool) -> Self {
        if !enabled {
            return Hasher::Disabled;
        }
        match algorithm {
            ChecksumAlgorithm::None => Hasher::Disabled,
            ChecksumAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            ChecksumAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Disabled => {}
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize(self) -> Option<String> {
        match self {
            Hasher::Disabled => None,
            Hasher::Md5(h) => Some(hex_digest(&h.finalize())),
            Hasher::Sha1(h) => Some(hex_digest(&h.finalize())),
            Hasher::Sha256(h) => Some(hex_digest(&h.finalize())),
        }
    }
}

/// Everything a worker needs besides its socket.
pub(crate) struct WorkerCtx {
    pub handle: Arc<TransferHandle>,
    pub config: DccConfig,
    pub events: Arc<EventBus>,
}

impl WorkerCtx {
    fn hasher(&self) -> Hasher {
        let algorithm = self.handle.state.lock().checksum_algorithm;
        Hasher::new(algorithm, self.config.checksum_verify)
    }

    fn cancelled(&self) -> bool {
        self.handle.cancel.load(Ordering::SeqCst)
    }
}

/// Tracks rolling rate/ETA and emits progress events.
struct ProgressTracker {
    last_emit: Instant,
    bytes_at_emit: u64,
}

impl ProgressTracker {
    fn new(start_bytes: u64) -> Self {
        Self {
            last_emit: Instant::now(),
            bytes_at_emit: start_bytes,
        }
    }

    fn tick(&mut self, ctx: &WorkerCtx, bytes: u64) {
        let elapsed = self.last_emit.elapsed();
        if elapsed.as_millis() < PROGRESS_INTERVAL_MS && bytes - self.bytes_at_emit < PROGRESS_BYTES
        {
            return;
        }
        let rate = if elapsed.as_secs_f64() > 0.0 {
            (bytes - self.bytes_at_emit) as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let payload = {
            let mut state = ctx.handle.state.lock();
            state.bytes_transferred = bytes;
            state.current_rate_bps = rate;
            state.estimated_eta_seconds = if rate > 0.0 && state.filesize >= bytes {
                Some(((state.filesize - bytes) as f64 / rate) as u64)
            } else {
                None
            };
            json!({
                "transfer_id": state.id,
                "filename": state.original_filename,
                "bytes_transferred": bytes,
                "size": state.filesize,
                "rate_bps": rate,
                "eta_seconds": state.estimated_eta_seconds,
            })
        };
        ctx.events.emit("DCC_TRANSFER_PROGRESS", payload);
        self.last_emit = Instant::now();
        self.bytes_at_emit = bytes;
    }
}

/// Feed the first `limit` bytes of an existing file into the hasher so a
/// resumed transfer still produces a whole-file digest.
async fn seed_hasher(path: &PathBuf, limit: u64, hasher: &mut Hasher) -> CoreResult<()> {
    if limit == 0 || matches!(hasher, Hasher::Disabled) {
        return Ok(());
    }
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| CoreError::DccInternal(format!("cannot reopen partial file: {e}")))?;
    let mut remaining = limit;
    let mut buf = vec![0u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let n = file
            .read(&mut buf[..want])
            .await
            .map_err(|e| CoreError::DccInternal(format!("partial file read: {e}")))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(())
}

/// Receive a file over an established connection, starting at
/// `resume_from` bytes.
async fn receive_stream<S>(mut stream: S, ctx: &WorkerCtx, resume_from: u64) -> CoreResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (path, filesize) = {
        let state = ctx.handle.state.lock();
        (state.local_path.clone(), state.filesize)
    };

    let mut hasher = ctx.hasher();
    seed_hasher(&path, resume_from, &mut hasher).await?;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .await
        .map_err(|e| CoreError::DccInternal(format!("cannot open {path:?}: {e}")))?;
    file.set_len(resume_from)
        .await
        .map_err(|e| CoreError::DccInternal(format!("cannot truncate {path:?}: {e}")))?;
    file.seek(std::io::SeekFrom::Start(resume_from))
        .await
        .map_err(|e| CoreError::DccInternal(format!("cannot seek {path:?}: {e}")))?;

    {
        let mut state = ctx.handle.state.lock();
        state.bytes_transferred = resume_from;
    }
    set_status(&ctx.handle, &ctx.events, DccTransferStatus::Transferring, None);

    let mut bytes = resume_from;
    let mut progress = ProgressTracker::new(bytes);
    let mut buf = vec![0u8; CHUNK_SIZE];

    while bytes < filesize {
        if ctx.cancelled() {
            return finish_cancel(ctx, &path).await;
        }
        // Never read past the advertised size; bytes_transferred must
        // stay within [0, filesize].
        let want = (filesize - bytes).min(CHUNK_SIZE as u64) as usize;
        let n = match timeout(ctx.config.timeout(), stream.read(&mut buf[..want])).await {
            Err(_) => {
                set_status(
                    &ctx.handle,
                    &ctx.events,
                    DccTransferStatus::TimedOut,
                    Some("no data within the transfer timeout".to_string()),
                );
                return Err(CoreError::DccTimeout("receive stalled".to_string()));
            }
            Ok(Err(e)) => return fail(ctx, format!("socket read failed: {e}")),
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
        };
        file.write_all(&buf[..n])
            .await
            .map_err(|e| CoreError::DccInternal(format!("file write failed: {e}")))?;
        hasher.update(&buf[..n]);
        bytes += n as u64;

        // Classic DCC acknowledgment: cumulative byte count, big-endian.
        let ack = ((bytes & 0xFFFF_FFFF) as u32).to_be_bytes();
        if let Err(e) = stream.write_all(&ack).await {
            debug!("ack write failed (peer gone?): {}", e);
        }
        progress.tick(ctx, bytes);
    }

    file.flush()
        .await
        .map_err(|e| CoreError::DccInternal(format!("file flush failed: {e}")))?;

    if bytes < filesize {
        return fail(ctx, format!("connection closed at {bytes}/{filesize} bytes"));
    }

    {
        let mut state = ctx.handle.state.lock();
        state.bytes_transferred = bytes;
        state.calculated_checksum = hasher.finalize();
        if state.calculated_checksum.is_none()
            && state.checksum_status == ChecksumStatus::Pending
        {
            state.checksum_status = ChecksumStatus::NotChecked;
        }
    }
    set_status(&ctx.handle, &ctx.events, DccTransferStatus::Completed, None);
    try_validate_checksum(&ctx.handle, &ctx.events);
    info!("receive complete: {} bytes into {:?}", bytes, path);
    Ok(())
}

/// Send a file over an established connection, starting at the granted
/// resume position. Returns the whole-file digest when checksums are on.
async fn send_stream<S>(stream: S, ctx: &WorkerCtx) -> CoreResult<Option<String>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (path, filesize) = {
        let state = ctx.handle.state.lock();
        (state.local_path.clone(), state.filesize)
    };
    let offset = ctx.handle.resume_position.load(Ordering::SeqCst);

    let mut hasher = ctx.hasher();
    seed_hasher(&path, offset, &mut hasher).await?;

    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| CoreError::DccInternal(format!("cannot open {path:?}: {e}")))?;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(|e| CoreError::DccInternal(format!("cannot seek {path:?}: {e}")))?;

    let (mut read_half, mut write_half) = tokio::io::split(stream);
    // The receiver streams cumulative acks back; drain and discard them so
    // its write side never blocks.
    let drain = tokio::spawn(async move {
        let mut sink = [0u8; 256];
        while let Ok(n) = read_half.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    });

    {
        let mut state = ctx.handle.state.lock();
        state.bytes_transferred = offset;
    }
    set_status(&ctx.handle, &ctx.events, DccTransferStatus::Transferring, None);

    let mut bytes = offset;
    let mut progress = ProgressTracker::new(bytes);
    let mut buf = vec![0u8; CHUNK_SIZE];

    while bytes < filesize {
        if ctx.cancelled() {
            drain.abort();
            set_status(&ctx.handle, &ctx.events, DccTransferStatus::Cancelled, None);
            return Err(CoreError::DccInternal("transfer cancelled".to_string()));
        }
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| CoreError::DccInternal(format!("file read failed: {e}")))?;
        if n == 0 {
            break;
        }
        match timeout(ctx.config.timeout(), write_half.write_all(&buf[..n])).await {
            Err(_) => {
                drain.abort();
                set_status(
                    &ctx.handle,
                    &ctx.events,
                    DccTransferStatus::TimedOut,
                    Some("peer stopped reading".to_string()),
                );
                return Err(CoreError::DccTimeout("send stalled".to_string()));
            }
            Ok(Err(e)) => {
                drain.abort();
                return fail_with(ctx, format!("socket write failed: {e}"));
            }
            Ok(Ok(())) => {}
        }
        hasher.update(&buf[..n]);
        bytes += n as u64;
        progress.tick(ctx, bytes);
    }

    let _ = write_half.flush().await;
    drain.abort();

    if bytes < filesize {
        return fail_with(ctx, format!("source file ended at {bytes}/{filesize} bytes"));
    }

    let digest = hasher.finalize();
    {
        let mut state = ctx.handle.state.lock();
        state.bytes_transferred = bytes;
        state.calculated_checksum = digest.clone();
        if digest.is_some() {
            // The sender's own digest is authoritative on this side.
            state.checksum_status = ChecksumStatus::NotChecked;
        }
    }
    set_status(&ctx.handle, &ctx.events, DccTransferStatus::Completed, None);
    info!("send complete: {} bytes from {:?}", bytes, path);
    Ok(digest)
}

async fn finish_cancel(ctx: &WorkerCtx, path: &PathBuf) -> CoreResult<()> {
    set_status(&ctx.handle, &ctx.events, DccTransferStatus::Cancelled, None);
    if ctx.config.delete_partial_on_cancel {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("could not delete partial file {:?}: {}", path, e);
        }
    }
    Err(CoreError::DccInternal("transfer cancelled".to_string()))
}

fn fail(ctx: &WorkerCtx, reason: String) -> CoreResult<()> {
    set_status(
        &ctx.handle,
        &ctx.events,
        DccTransferStatus::Failed,
        Some(reason.clone()),
    );
    Err(CoreError::DccInternal(reason))
}

fn fail_with(ctx: &WorkerCtx, reason: String) -> CoreResult<Option<String>> {
    set_status(
        &ctx.handle,
        &ctx.events,
        DccTransferStatus::Failed,
        Some(reason.clone()),
    );
    Err(CoreError::DccInternal(reason))
}

/// Active receive: connect out to the sender and stream the file in.
pub(crate) async fn run_receive_connecting(
    ctx: WorkerCtx,
    addr: SocketAddr,
    resume_from: u64,
) -> CoreResult<()> {
    set_status(&ctx.handle, &ctx.events, DccTransferStatus::Connecting, None);
    let stream = match timeout(ctx.config.timeout(), TcpStream::connect(addr)).await {
        Err(_) => {
            set_status(
                &ctx.handle,
                &ctx.events,
                DccTransferStatus::TimedOut,
                Some(format!("connect to {addr} timed out")),
            );
            return Err(CoreError::DccTimeout(format!("connect to {addr}")));
        }
        Ok(Err(e)) => return fail(&ctx, format!("connect to {addr} failed: {e}")),
        Ok(Ok(s)) => s,
    };
    let _ = stream.set_nodelay(true);
    receive_stream(stream, &ctx, resume_from).await
}

/// Passive receive: we listen, the sender connects to us.
pub(crate) async fn run_receive_listening(
    ctx: WorkerCtx,
    listener: TcpListener,
    resume_from: u64,
) -> CoreResult<()> {
    set_status(&ctx.handle, &ctx.events, DccTransferStatus::Negotiating, None);
    let (stream, peer) = match timeout(ctx.config.timeout(), listener.accept()).await {
        Err(_) => {
            set_status(
                &ctx.handle,
                &ctx.events,
                DccTransferStatus::TimedOut,
                Some("peer never connected".to_string()),
            );
            return Err(CoreError::DccTimeout("no inbound connection".to_string()));
        }
        Ok(Err(e)) => return fail(&ctx, format!("accept failed: {e}")),
        Ok(Ok(pair)) => pair,
    };
    debug!("passive receive: peer connected from {}", peer);
    {
        let mut state = ctx.handle.state.lock();
        state.peer_ip = Some(peer.ip());
        state.peer_port = peer.port();
    }
    let _ = stream.set_nodelay(true);
    receive_stream(stream, &ctx, resume_from).await
}

/// Active send: we listen, the receiver connects.
pub(crate) async fn run_send_listening(
    ctx: WorkerCtx,
    listener: TcpListener,
) -> CoreResult<Option<String>> {
    set_status(&ctx.handle, &ctx.events, DccTransferStatus::Negotiating, None);
    let (stream, peer) = match timeout(ctx.config.timeout(), listener.accept()).await {
        Err(_) => {
            set_status(
                &ctx.handle,
                &ctx.events,
                DccTransferStatus::TimedOut,
                Some("peer never connected".to_string()),
            );
            return Err(CoreError::DccTimeout("no inbound connection".to_string()));
        }
        Ok(Err(e)) => return fail_with(&ctx, format!("accept failed: {e}")),
        Ok(Ok(pair)) => pair,
    };
    debug!("send: peer connected from {}", peer);
    {
        let mut state = ctx.handle.state.lock();
        state.peer_ip = Some(peer.ip());
        state.peer_port = peer.port();
    }
    let _ = stream.set_nodelay(true);
    send_stream(stream, &ctx).await
}

/// Passive send: the peer told us where it is listening; we connect.
pub(crate) async fn run_send_connecting(
    ctx: WorkerCtx,
    addr: SocketAddr,
) -> CoreResult<Option<String>> {
    set_status(&ctx.handle, &ctx.events, DccTransferStatus::Connecting, None);
    let stream = match timeout(ctx.config.timeout(), TcpStream::connect(addr)).await {
        Err(_) => {
            set_status(
                &ctx.handle,
                &ctx.events,
                DccTransferStatus::TimedOut,
                Some(format!("connect to {addr} timed out")),
            );
            return Err(CoreError::DccTimeout(format!("connect to {addr}")));
        }
        Ok(Err(e)) => return fail_with(&ctx, format!("connect to {addr} failed: {e}")),
        Ok(Ok(s)) => s,
    };
    let _ = stream.set_nodelay(true);
    send_stream(stream, &ctx).await
}
