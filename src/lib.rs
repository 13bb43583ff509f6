//! # IRC Client Core
//!
//! The engine of a text-mode IRC client, implemented in Rust. This
//! library provides the connection lifecycle (capability negotiation,
//! SASL, registration), the client-side state model (contexts, user
//! lists, scrollback, connection state), and a concurrent DCC file
//! transfer engine — everything except rendering, input handling and
//! configuration file I/O, which belong to the embedding application.
//!
//! ## Architecture Overview
//!
//! - **Wire codec** ([`wire`]): IRC line and CTCP/DCC grammar
//! - **Transport** ([`transport`]): TCP/TLS connection with line framing
//!   and reconnect backoff
//! - **State store** ([`state`]): validated connection state with change
//!   notification
//! - **Context manager** ([`context`]): channels, queries, scrollback,
//!   join state machine
//! - **Registration** ([`registration`]): CAP → SASL → NICK/USER driver
//! - **Router** ([`router`]): inbound message dispatch
//! - **Event bus** ([`events`]): named publish/subscribe
//! - **DCC engine** ([`dcc`]): concurrent SEND/RECEIVE transfers with
//!   resume, checksums and cleanup
//! - **Trigger interface** ([`trigger`]): pattern → action descriptors
//! - **Client hub** ([`client`]): owns and wires all of the above
//!
//! ## Concurrency Model
//!
//! Built on Tokio: one read and one write task per server connection, one
//! worker task per DCC transfer, and a periodic cleanup task. Shared
//! state is confined to the state store and the DCC engine's tables;
//! no lock is held across I/O.

pub mod client;
pub mod config;
pub mod context;
pub mod dcc;
pub mod error;
pub mod events;
pub mod registration;
pub(crate) mod router;
pub mod sink;
pub mod state;
pub mod transport;
pub mod trigger;
pub mod utils;
pub mod wire;

pub use client::ClientCore;
pub use config::{ChecksumAlgorithm, DccConfig, ServerConfig};
pub use context::{ChannelJoinStatus, ContextManager, ContextType};
pub use dcc::transfer::{ChecksumStatus, DccDirection, DccTransfer, DccTransferStatus};
pub use dcc::DccEngine;
pub use error::{CoreError, CoreResult};
pub use events::{Event, EventBus};
pub use sink::{ChannelSink, ColorKey, MessageLogger, NullSink, UiSink};
pub use state::{ConnectionInfo, ConnectionStatus, StateStore};
pub use transport::{ConnectParams, Transport, TransportEvent};
pub use trigger::{TriggerAction, TriggerEngine, TriggerOutcome};

/// The current version of the client core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// First reconnect delay after an unexpected disconnect, in seconds.
    pub const RECONNECT_INITIAL_DELAY_SECS: u64 = 5;

    /// Ceiling for the doubling reconnect backoff, in seconds.
    pub const MAX_RECONNECT_DELAY_SECS: u64 = 300;

    /// Scrollback lines kept per context.
    pub const MAX_HISTORY: usize = 500;

    /// Largest DCC offer accepted by default (100 MiB).
    pub const DCC_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

    /// First port tried for DCC listening sockets.
    pub const DCC_PORT_RANGE_START: u16 = 1024;

    /// Last port tried for DCC listening sockets.
    pub const DCC_PORT_RANGE_END: u16 = 65535;

    /// DCC negotiation and inactivity timeout, in seconds.
    pub const DCC_TIMEOUT_SECS: u64 = 120;

    /// Lifetime of an unaccepted passive offer token, in seconds.
    pub const DCC_PASSIVE_TOKEN_TIMEOUT_SECS: u64 = 120;

    /// Interval between DCC cleanup sweeps, in seconds.
    pub const DCC_CLEANUP_INTERVAL_SECS: u64 = 3600;

    /// Age after which finished transfers are dropped, in seconds.
    pub const DCC_TRANSFER_MAX_AGE_SECS: u64 = 86400;
}
