//! # Network Transport
//!
//! One TCP (optionally TLS) connection per client instance. The transport
//! runs a connection task that owns the socket: a buffered read loop
//! yields full lines on `\r\n` or `\n`, and a writer task drains a bounded
//! outbound queue. The embedding client observes the connection through
//! [`TransportEvent`]s and never touches the socket.
//!
//! ## Reconnection
//!
//! On an unexpected disconnect the task waits `reconnect_initial_delay`
//! and retries; each failure doubles the delay up to `max_reconnect_delay`
//! (default 300 s). The client resets the delay once registration
//! succeeds. A graceful disconnect (user QUIT) suppresses reconnection
//! until the next explicit connect.

use crate::error::{CoreError, CoreResult};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Outbound queue depth; senders get backpressure errors beyond this.
const OUTBOUND_QUEUE: usize = 512;

/// TCP connect / TLS handshake deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Socket buffer size applied via socket2.
const SOCKET_BUFFER_SIZE: usize = 65536;

/// Target of a connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub tls_verify: bool,
}

/// Notifications from the connection task to the client hub.
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection attempt is starting.
    Connecting { host: String, port: u16 },
    /// TCP (and TLS, when enabled) handshake completed.
    Connected,
    /// One full inbound line, CRLF stripped.
    Line(String),
    /// The connection ended; `reason` is human-readable.
    Disconnected { reason: String },
}

#[derive(Debug)]
enum TransportCmd {
    Connect(ConnectParams),
    UpdateParams(ConnectParams),
    Disconnect { quit_line: Option<String> },
    ResetBackoff,
    Shutdown,
}

/// Handle to the connection task.
#[derive(Clone)]
pub struct Transport {
    cmd_tx: mpsc::UnboundedSender<TransportCmd>,
    out_tx: mpsc::Sender<String>,
}

impl Transport {
    /// Spawn the connection task. Events surface on `event_tx`.
    pub fn spawn(
        event_tx: mpsc::Sender<TransportEvent>,
        reconnect_initial_delay: Duration,
        max_reconnect_delay: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        tokio::spawn(transport_task(
            cmd_rx,
            out_rx,
            event_tx,
            reconnect_initial_delay,
            max_reconnect_delay,
        ));
        Self { cmd_tx, out_tx }
    }

    /// Begin connecting to `params`, reconnecting on failure.
    pub fn connect(&self, params: ConnectParams) {
        let _ = self.cmd_tx.send(TransportCmd::Connect(params));
    }

    /// Change the target used for the next (re)connect.
    pub fn update_connection_params(&self, params: ConnectParams) {
        let _ = self.cmd_tx.send(TransportCmd::UpdateParams(params));
    }

    /// Queue one line for sending. The trailing CRLF is added by the
    /// writer; the queue is bounded and a full queue is a transport error.
    pub fn send_line(&self, line: &str) -> CoreResult<()> {
        self.out_tx
            .try_send(line.to_string())
            .map_err(|_| CoreError::Transport("outbound queue full or closed".to_string()))
    }

    /// Send QUIT and close without reconnecting.
    pub fn disconnect_gracefully(&self, quit_message: &str) {
        let quit_line = Some(crate::wire::quit(Some(quit_message)));
        let _ = self.cmd_tx.send(TransportCmd::Disconnect { quit_line });
    }

    /// Reset the reconnect backoff to its initial delay (called on
    /// successful registration).
    pub fn reset_backoff(&self) {
        let _ = self.cmd_tx.send(TransportCmd::ResetBackoff);
    }

    /// Terminate the connection task entirely.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(TransportCmd::Shutdown);
    }
}

/// Why a live session ended.
enum SessionEnd {
    /// User QUIT; do not reconnect.
    Quit,
    /// Socket error or EOF; reconnect with backoff.
    Lost(String),
    /// Explicit reconnect request with fresh parameters.
    Reconnect,
    /// Task shutdown.
    Shutdown,
}

async fn transport_task(
    mut cmd_rx: mpsc::UnboundedReceiver<TransportCmd>,
    mut out_rx: mpsc::Receiver<String>,
    event_tx: mpsc::Sender<TransportEvent>,
    initial_delay: Duration,
    max_delay: Duration,
) {
    let mut params: Option<ConnectParams> = None;
    let mut want_connected = false;
    let mut delay = initial_delay;

    loop {
        if !want_connected || params.is_none() {
            match cmd_rx.recv().await {
                None | Some(TransportCmd::Shutdown) => return,
                Some(TransportCmd::Connect(p)) => {
                    params = Some(p);
                    want_connected = true;
                    delay = initial_delay;
                }
                Some(TransportCmd::UpdateParams(p)) => params = Some(p),
                Some(TransportCmd::Disconnect { .. }) => want_connected = false,
                Some(TransportCmd::ResetBackoff) => delay = initial_delay,
            }
            continue;
        }

        let p = params.clone().expect("params present when connecting");
        if event_tx
            .send(TransportEvent::Connecting {
                host: p.host.clone(),
                port: p.port,
            })
            .await
            .is_err()
        {
            return;
        }

        let end = match establish_tcp(&p).await {
            Err(e) => {
                warn!("connect to {}:{} failed: {}", p.host, p.port, e);
                SessionEnd::Lost(format!("connect failed: {e}"))
            }
            Ok(tcp) => {
                if p.tls {
                    match tls_handshake(tcp, &p).await {
                        Err(e) => {
                            warn!("TLS handshake with {} failed: {}", p.host, e);
                            SessionEnd::Lost(format!("TLS handshake failed: {e}"))
                        }
                        Ok(stream) => {
                            info!("TLS connection established to {}:{}", p.host, p.port);
                            run_session(stream, &mut cmd_rx, &mut out_rx, &event_tx, &mut params)
                                .await
                        }
                    }
                } else {
                    info!("connected to {}:{}", p.host, p.port);
                    run_session(tcp, &mut cmd_rx, &mut out_rx, &event_tx, &mut params).await
                }
            }
        };

        match end {
            SessionEnd::Shutdown => return,
            SessionEnd::Reconnect => {
                delay = initial_delay;
                continue;
            }
            SessionEnd::Quit => {
                want_connected = false;
                if event_tx
                    .send(TransportEvent::Disconnected {
                        reason: "quit".to_string(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            SessionEnd::Lost(reason) => {
                if event_tx
                    .send(TransportEvent::Disconnected { reason })
                    .await
                    .is_err()
                {
                    return;
                }
                debug!("reconnecting in {:?}", delay);
                match wait_backoff(&mut cmd_rx, &mut params, delay).await {
                    BackoffOutcome::Retry => {
                        delay = (delay * 2).min(max_delay);
                    }
                    BackoffOutcome::ConnectNow => {
                        delay = initial_delay;
                    }
                    BackoffOutcome::Cancel => want_connected = false,
                    BackoffOutcome::Shutdown => return,
                }
            }
        }
    }
}

enum BackoffOutcome {
    Retry,
    ConnectNow,
    Cancel,
    Shutdown,
}

/// Sleep out the backoff delay while still honoring commands.
async fn wait_backoff(
    cmd_rx: &mut mpsc::UnboundedReceiver<TransportCmd>,
    params: &mut Option<ConnectParams>,
    delay: Duration,
) -> BackoffOutcome {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return BackoffOutcome::Retry,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(TransportCmd::Shutdown) => return BackoffOutcome::Shutdown,
                Some(TransportCmd::Connect(p)) => {
                    *params = Some(p);
                    return BackoffOutcome::ConnectNow;
                }
                Some(TransportCmd::UpdateParams(p)) => *params = Some(p),
                Some(TransportCmd::Disconnect { .. }) => return BackoffOutcome::Cancel,
                Some(TransportCmd::ResetBackoff) => {}
            },
        }
    }
}

async fn establish_tcp(params: &ConnectParams) -> CoreResult<TcpStream> {
    let addr = format!("{}:{}", params.host, params.port);
    debug!("connecting to {}", addr);
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| CoreError::Transport(format!("connect to {addr} timed out")))??;

    // Configure socket options for interactive latency.
    let std_stream = stream.into_std()?;
    let socket = socket2::Socket::from(std_stream.try_clone()?);
    socket.set_nodelay(true)?;
    socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
    socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;

    Ok(TcpStream::from_std(std_stream)?)
}

async fn tls_handshake(
    tcp: TcpStream,
    params: &ConnectParams,
) -> CoreResult<tokio_native_tls::TlsStream<TcpStream>> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(!params.tls_verify)
        .danger_accept_invalid_hostnames(!params.tls_verify)
        .build()
        .map_err(|e| CoreError::Transport(format!("TLS setup failed: {e}")))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    timeout(CONNECT_TIMEOUT, connector.connect(&params.host, tcp))
        .await
        .map_err(|_| CoreError::Transport("TLS handshake timed out".to_string()))?
        .map_err(|e| CoreError::Transport(format!("TLS handshake failed: {e}")))
}

/// Drive one live connection until it ends.
///
/// The read half is consumed here; a writer task owns the write half and
/// drains a per-session channel fed from the persistent outbound queue.
async fn run_session<S>(
    stream: S,
    cmd_rx: &mut mpsc::UnboundedReceiver<TransportCmd>,
    out_rx: &mut mpsc::Receiver<String>,
    event_tx: &mpsc::Sender<TransportEvent>,
    params: &mut Option<ConnectParams>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    if event_tx.send(TransportEvent::Connected).await.is_err() {
        return SessionEnd::Shutdown;
    }

    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let (session_tx, mut session_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let writer = tokio::spawn(async move {
        while let Some(line) = session_rx.recv().await {
            debug!("> {}", line);
            let framed = format!("{line}\r\n");
            if let Err(e) = write_half.write_all(framed.as_bytes()).await {
                error!("write error: {}", e);
                return;
            }
            if let Err(e) = write_half.flush().await {
                error!("flush error: {}", e);
                return;
            }
        }
        // Channel closed: session over, QUIT (if any) already flushed.
    });

    // The buffer persists across loop iterations: read_until is not
    // cancellation safe, and a cancelled read leaves a partial line here
    // that the next call completes. Cleared only after a full line.
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let end = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(TransportCmd::Shutdown) => break SessionEnd::Shutdown,
                Some(TransportCmd::Connect(p)) => {
                    *params = Some(p);
                    break SessionEnd::Reconnect;
                }
                Some(TransportCmd::UpdateParams(p)) => *params = Some(p),
                Some(TransportCmd::ResetBackoff) => {}
                Some(TransportCmd::Disconnect { quit_line }) => {
                    if let Some(line) = quit_line {
                        let _ = session_tx.send(line).await;
                    }
                    break SessionEnd::Quit;
                }
            },
            line = out_rx.recv() => match line {
                None => break SessionEnd::Shutdown,
                Some(line) => {
                    if session_tx.send(line).await.is_err() {
                        break SessionEnd::Lost("write task ended".to_string());
                    }
                }
            },
            read = reader.read_until(b'\n', &mut buf) => match read {
                Err(e) => break SessionEnd::Lost(format!("read error: {e}")),
                Ok(0) => break SessionEnd::Lost("connection closed by server".to_string()),
                Ok(_) => {
                    // Non-UTF-8 bytes are tolerated, never fatal.
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(&['\r', '\n'][..])
                        .to_string();
                    buf.clear();
                    if !line.is_empty() {
                        debug!("< {}", line);
                        if event_tx
                            .send(TransportEvent::Line(line))
                            .await
                            .is_err()
                        {
                            break SessionEnd::Shutdown;
                        }
                    }
                }
            },
        }
    };

    // Give the writer a moment to flush a pending QUIT before the halves
    // are dropped.
    drop(session_tx);
    let _ = timeout(Duration::from_millis(250), writer).await;
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn spawn_transport() -> (Transport, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let transport = Transport::spawn(
            event_tx,
            Duration::from_millis(50),
            Duration::from_millis(200),
        );
        (transport, event_rx)
    }

    async fn expect_connected(rx: &mut mpsc::Receiver<TransportEvent>) {
        loop {
            match rx.recv().await.expect("event stream ended") {
                TransportEvent::Connected => return,
                TransportEvent::Connecting { .. } => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_connect_send_and_receive_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b":irc.test NOTICE * :hello\r\n").await.unwrap();
            let mut buf = vec![0u8; 256];
            let n = sock.read(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let (transport, mut events) = spawn_transport().await;
        transport.connect(ConnectParams {
            host: addr.ip().to_string(),
            port: addr.port(),
            tls: false,
            tls_verify: false,
        });

        expect_connected(&mut events).await;
        transport.send_line("PING :x").unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::Line(line) => assert_eq!(line, ":irc.test NOTICE * :hello"),
            other => panic!("unexpected event: {other:?}"),
        }

        let written = server.await.unwrap();
        assert_eq!(written, "PING :x\r\n");
        transport.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_sends_quit_and_suppresses_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            sock.read_to_end(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });

        let (transport, mut events) = spawn_transport().await;
        transport.connect(ConnectParams {
            host: addr.ip().to_string(),
            port: addr.port(),
            tls: false,
            tls_verify: false,
        });
        expect_connected(&mut events).await;

        transport.disconnect_gracefully("bye");
        match events.recv().await.unwrap() {
            TransportEvent::Disconnected { reason } => assert_eq!(reason, "quit"),
            other => panic!("unexpected event: {other:?}"),
        }

        let written = server.await.unwrap();
        assert_eq!(written, "QUIT :bye\r\n");

        // No reconnect attempt should follow a graceful disconnect.
        let followup =
            tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
        assert!(followup.is_err(), "unexpected event after graceful quit");
        transport.shutdown();
    }

    #[tokio::test]
    async fn test_reconnect_after_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            // First connection: close immediately. Second: stay open.
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
            let (_sock2, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (transport, mut events) = spawn_transport().await;
        transport.connect(ConnectParams {
            host: addr.ip().to_string(),
            port: addr.port(),
            tls: false,
            tls_verify: false,
        });

        expect_connected(&mut events).await;
        match events.recv().await.unwrap() {
            TransportEvent::Disconnected { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        // Backoff elapses and the transport reconnects on its own.
        expect_connected(&mut events).await;
        transport.shutdown();
    }
}
