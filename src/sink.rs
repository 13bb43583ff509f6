//! # Collaborator Seams
//!
//! Traits through which the core talks to its external collaborators: the
//! UI sink that renders messages, and the channel/DCC logger that persists
//! already-formatted lines. The core owns no rendering or log-file logic;
//! it only pushes text through these seams.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Semantic color keys attached to every message handed to the UI sink.
///
/// The sink maps these to actual attributes; the core never deals in
/// terminal colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorKey {
    System,
    Error,
    Warning,
    JoinPart,
    NickChange,
    Message,
    Notice,
    Highlight,
    Topic,
    Dcc,
}

impl ColorKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColorKey::System => "system",
            ColorKey::Error => "error",
            ColorKey::Warning => "warning",
            ColorKey::JoinPart => "join_part",
            ColorKey::NickChange => "nick_change",
            ColorKey::Message => "message",
            ColorKey::Notice => "notice",
            ColorKey::Highlight => "highlight",
            ColorKey::Topic => "topic",
            ColorKey::Dcc => "dcc",
        }
    }
}

/// Text sink the UI implements.
///
/// Both methods are called from the client's async tasks and must return
/// quickly; a real UI forwards into its own event queue.
pub trait UiSink: Send + Sync {
    /// A line was appended to the named context's scrollback.
    fn message_added(&self, context: &str, text: &str, color: ColorKey);

    /// Visible state changed in a way that requires a redraw (topic, user
    /// list, active context, connection state).
    fn needs_refresh(&self);
}

/// Sink that discards everything. Useful for headless operation and tests
/// that only assert on core state.
#[derive(Debug, Default)]
pub struct NullSink;

impl UiSink for NullSink {
    fn message_added(&self, _context: &str, _text: &str, _color: ColorKey) {}
    fn needs_refresh(&self) {}
}

/// One rendered message as observed by [`ChannelSink`].
#[derive(Debug, Clone)]
pub struct SinkMessage {
    pub context: String,
    pub text: String,
    pub color: ColorKey,
}

/// Sink that forwards messages over an unbounded channel, used by the
/// integration tests to observe UI-visible output.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl UiSink for ChannelSink {
    fn message_added(&self, context: &str, text: &str, color: ColorKey) {
        let _ = self.tx.send(SinkMessage {
            context: context.to_string(),
            text: text.to_string(),
            color,
        });
    }

    fn needs_refresh(&self) {}
}

/// Receiver of already-formatted channel and DCC log lines.
///
/// Implementations typically append to per-channel log files; the write is
/// async so slow disks never stall message handling.
#[async_trait]
pub trait MessageLogger: Send + Sync {
    async fn log_line(&self, context: &str, formatted: &str);
}
