//! # Client Hub
//!
//! The explicit hub object at the center of the core: it owns the state
//! store, context manager, event bus, transport handle, DCC engine,
//! trigger engine and registration machine, and wires them together.
//! Components never hold references to siblings; everything flows through
//! this hub, which receives all its collaborators (UI sink, logger) in
//! its constructor.
//!
//! Inbound flow: the transport task reads lines → the hub's event pump
//! ([`ClientCore::run`]) parses them → the router mutates state and emits
//! events → the UI sink and event subscribers observe. Outbound flow:
//! public operations format lines and queue them on the transport.

use crate::config::{DccConfig, ServerConfig};
use crate::context::{ChannelJoinStatus, ContextManager, ContextType, DCC_CONTEXT, STATUS_CONTEXT};
use crate::dcc::DccEngine;
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::registration::{RegAction, RegistrationMachine};
use crate::router;
use crate::sink::{ColorKey, MessageLogger, UiSink};
use crate::state::{ConnectionInfo, ConnectionStatus, StateStore};
use crate::transport::{ConnectParams, Transport, TransportEvent};
use crate::trigger::{TriggerEngine, TriggerOutcome};
use crate::utils::{irc_eq, wildcard_match};
use crate::wire;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of the transport → hub event channel.
const EVENT_QUEUE: usize = 256;

/// The client core. Construct with [`ClientCore::new`] inside a Tokio
/// runtime, then call [`ClientCore::connect`] and drive
/// [`ClientCore::run`].
pub struct ClientCore {
    config: ServerConfig,
    pub state: Arc<StateStore>,
    pub contexts: Arc<ContextManager>,
    pub events: Arc<EventBus>,
    pub transport: Transport,
    pub dcc: Arc<DccEngine>,
    pub triggers: Arc<TriggerEngine>,
    pub(crate) registration: Mutex<Option<RegistrationMachine>>,
    ui: Arc<dyn UiSink>,
    logger: Option<Arc<dyn MessageLogger>>,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    outcome_rx: Mutex<Option<mpsc::UnboundedReceiver<TriggerOutcome>>>,
    /// Guards against cascading automatic nick changes after 433.
    pub(crate) is_handling_nick_collision: AtomicBool,
    /// Depth counter breaking re-entrant synthesized-command dispatch.
    dispatch_depth: AtomicU32,
    /// Context receiving the LIST reply stream, when one is active.
    pub(crate) active_list_context: RwLock<Option<String>>,
    ready_emitted: AtomicBool,
}

impl ClientCore {
    /// Build a client core from configuration and collaborator handles.
    ///
    /// Invalid connection parameters do not fail construction: they drive
    /// a `CONFIG_ERROR` state transition and surface in the status
    /// context, matching how a UI-facing client reports bad config.
    pub fn new(
        config: ServerConfig,
        dcc_config: DccConfig,
        ui: Arc<dyn UiSink>,
        logger: Option<Arc<dyn MessageLogger>>,
    ) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        let state = Arc::new(StateStore::new());
        let contexts = Arc::new(ContextManager::new(config.max_history, dcc_config.enabled));

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let transport = Transport::spawn(
            event_tx,
            Duration::from_secs(config.reconnect_initial_delay_secs),
            Duration::from_secs(config.max_reconnect_delay_secs),
        );

        let dcc = DccEngine::new(dcc_config, events.clone(), transport.clone());
        dcc.spawn_cleanup_task();

        let triggers = Arc::new(TriggerEngine::new());
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        {
            let triggers = triggers.clone();
            events.subscribe("*", move |event| {
                if let Some(outcome) = triggers.process(event) {
                    let _ = outcome_tx.send(outcome);
                }
            });
        }

        let core = Arc::new(Self {
            state,
            contexts,
            events,
            transport,
            dcc,
            triggers,
            registration: Mutex::new(None),
            ui,
            logger,
            event_rx: Mutex::new(Some(event_rx)),
            outcome_rx: Mutex::new(Some(outcome_rx)),
            is_handling_nick_collision: AtomicBool::new(false),
            dispatch_depth: AtomicU32::new(0),
            active_list_context: RwLock::new(None),
            ready_emitted: AtomicBool::new(false),
            config,
        });

        let info = ConnectionInfo::from_config(&core.config);
        if !core.state.set_info(info) {
            let errors = core.state.take_config_errors();
            let mut metadata = HashMap::new();
            metadata.insert("errors".to_string(), errors.join("; "));
            core.state
                .set_status(ConnectionStatus::ConfigError, metadata);
            for error in errors {
                core.add_status(&format!("Configuration error: {error}"), ColorKey::Error);
            }
        }

        core
    }

    // ------------------------------------------------------------------
    // Event pump
    // ------------------------------------------------------------------

    /// Consume transport events until the transport shuts down. Call once.
    pub async fn run(self: &Arc<Self>) {
        let mut event_rx = match self.event_rx.lock().take() {
            Some(rx) => rx,
            None => {
                warn!("run() called twice; ignoring");
                return;
            }
        };
        while let Some(event) = event_rx.recv().await {
            self.handle_transport_event(event).await;
        }
        debug!("transport event stream ended");
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connecting { host, port } => {
                let mut metadata = HashMap::new();
                metadata.insert("host".to_string(), host.clone());
                metadata.insert("port".to_string(), port.to_string());
                self.state
                    .set_status(ConnectionStatus::Connecting, metadata);
                self.add_status(&format!("Connecting to {host}:{port}..."), ColorKey::System);
            }
            TransportEvent::Connected => {
                self.state
                    .set_status(ConnectionStatus::Connected, HashMap::new());
                self.events.emit("CLIENT_CONNECTED", json!({}));
                self.add_status("Connection established", ColorKey::System);
                if let Some(info) = self.state.connection_info() {
                    let mut machine = RegistrationMachine::new(&info);
                    let actions = machine.on_connected(&info);
                    *self.registration.lock() = Some(machine);
                    self.apply_reg_actions(actions).await;
                }
            }
            TransportEvent::Line(line) => match wire::parse(&line) {
                Ok(msg) => router::dispatch(self, msg, &line).await,
                Err(e) => {
                    warn!("unparseable line: {e}");
                    self.add_status(&format!("[UNPARSED] {line}"), ColorKey::Warning);
                }
            },
            TransportEvent::Disconnected { reason } => self.on_disconnected(reason),
        }
    }

    fn on_disconnected(&self, reason: String) {
        let mut metadata = HashMap::new();
        metadata.insert("reason".to_string(), reason.clone());
        self.state
            .set_status(ConnectionStatus::Disconnected, metadata);
        *self.registration.lock() = None;
        self.is_handling_nick_collision.store(false, Ordering::SeqCst);
        self.ready_emitted.store(false, Ordering::SeqCst);

        // Joined channels fall back to PARTED; they re-join on reconnect.
        for name in self.contexts.get_all_context_names() {
            if matches!(
                self.contexts.join_status(&name),
                Some(ChannelJoinStatus::FullyJoined)
                    | Some(ChannelJoinStatus::SelfJoinReceived)
                    | Some(ChannelJoinStatus::JoinCommandSent)
            ) {
                self.contexts
                    .set_join_status(&name, ChannelJoinStatus::Parted);
            }
        }
        if let Some(mut info) = self.state.connection_info() {
            info.currently_joined_channels.clear();
            self.state.set_info(info);
        }

        self.add_status(&format!("Disconnected: {reason}"), ColorKey::Warning);
        self.events
            .emit("CLIENT_DISCONNECTED", json!({ "reason": reason }));
    }

    /// Execute actions produced by the registration machine.
    pub(crate) async fn apply_reg_actions(self: &Arc<Self>, actions: Vec<RegAction>) {
        for action in actions {
            match action {
                RegAction::Send(line) => {
                    if let Err(e) = self.transport.send_line(&line) {
                        warn!("could not send registration line: {e}");
                    }
                }
                RegAction::SaslCompleted(true) => {
                    self.add_status("SASL authentication successful", ColorKey::System);
                }
                RegAction::SaslCompleted(false) => {
                    self.add_status("SASL authentication failed", ColorKey::Error);
                }
                RegAction::NickRetry(nick) => {
                    self.is_handling_nick_collision
                        .store(true, Ordering::SeqCst);
                    self.add_status(&format!("Trying {nick} instead"), ColorKey::System);
                    if let Some(mut info) = self.state.connection_info() {
                        info.nick = nick;
                        self.state.set_info(info);
                    }
                }
                RegAction::Registered { nick } => self.on_registered(nick),
                RegAction::Abort(reason) => {
                    self.add_status(
                        &format!("Registration aborted: {reason}"),
                        ColorKey::Error,
                    );
                    self.transport.disconnect_gracefully(&reason);
                }
            }
        }
    }

    fn on_registered(&self, nick: String) {
        info!("registered as {nick}");
        if let Some(mut info) = self.state.connection_info() {
            info.nick = nick.clone();
            self.state.set_info(info);
        }
        self.state
            .set_status(ConnectionStatus::Registered, HashMap::new());
        self.transport.reset_backoff();
        self.is_handling_nick_collision.store(false, Ordering::SeqCst);

        let info = self.state.connection_info();
        let sasl_done = self
            .registration
            .lock()
            .as_ref()
            .map(|m| m.sasl_completed())
            .unwrap_or(false);
        if let Some(info) = info {
            // NickServ fallback when SASL did not authenticate us.
            if let Some(ref password) = info.nickserv_password {
                if !sasl_done {
                    let _ = self
                        .transport
                        .send_line(&wire::privmsg("NickServ", &format!("IDENTIFY {password}")));
                }
            }
            for channel in &info.initial_channels {
                self.contexts.create_context(
                    channel,
                    ContextType::Channel,
                    Some(ChannelJoinStatus::PendingInitialJoin),
                );
                if self.transport.send_line(&wire::join(channel)).is_ok() {
                    self.contexts
                        .set_join_status(channel, ChannelJoinStatus::JoinCommandSent);
                }
            }
            if info.initial_channels.is_empty() {
                self.check_ready();
            }
        }
    }

    /// Emit `CLIENT_READY` once every auto-join channel has settled
    /// (fully joined or failed).
    pub(crate) fn check_ready(&self) {
        if self.ready_emitted.load(Ordering::SeqCst) {
            return;
        }
        if self.state.connection_state() != ConnectionStatus::Registered {
            return;
        }
        let Some(info) = self.state.connection_info() else {
            return;
        };
        let settled = info.initial_channels.iter().all(|channel| {
            matches!(
                self.contexts.join_status(channel),
                Some(ChannelJoinStatus::FullyJoined) | Some(ChannelJoinStatus::JoinFailed)
            )
        });
        if settled && !self.ready_emitted.swap(true, Ordering::SeqCst) {
            self.events.emit("CLIENT_READY", json!({}));
        }
    }

    // ------------------------------------------------------------------
    // Messages and contexts
    // ------------------------------------------------------------------

    /// Append a message to a context (falling back to `Status` when the
    /// context is unknown), notify the UI sink, the logger, and emit
    /// `MESSAGE_ADDED_TO_CONTEXT`.
    pub fn add_chat_message(
        &self,
        context: &str,
        source: Option<&str>,
        text: &str,
        color: ColorKey,
        is_privmsg_or_notice: bool,
    ) {
        let target = if self.contexts.context_exists(context) {
            context.to_string()
        } else {
            STATUS_CONTEXT.to_string()
        };
        self.contexts
            .add_message_to_context(&target, text, color, 1);
        self.ui.message_added(&target, text, color);
        self.events.emit(
            "MESSAGE_ADDED_TO_CONTEXT",
            json!({
                "context": target,
                "text": text,
                "color_key": color.as_str(),
                "source": source,
                "is_privmsg_or_notice": is_privmsg_or_notice,
            }),
        );
        if let Some(ref logger) = self.logger {
            let logger = logger.clone();
            let context = target;
            let line = text.to_string();
            tokio::spawn(async move {
                logger.log_line(&context, &line).await;
            });
        }
    }

    pub fn add_message(&self, context: &str, text: &str, color: ColorKey) {
        self.add_chat_message(context, None, text, color, false);
    }

    pub fn add_status(&self, text: &str, color: ColorKey) {
        self.add_chat_message(STATUS_CONTEXT, None, text, color, false);
    }

    pub fn add_dcc_message(&self, text: &str, color: ColorKey) {
        if self.contexts.context_exists(DCC_CONTEXT) {
            self.add_chat_message(DCC_CONTEXT, None, text, color, false);
        } else {
            self.add_status(text, color);
        }
    }

    /// Switch the active context (`next`, `prev`, name, index, substring).
    pub fn switch_context(&self, target: &str) -> Result<String, String> {
        let result = self.contexts.set_active_context(target);
        if result.is_ok() {
            self.ui.needs_refresh();
        }
        result
    }

    /// Switch among channel contexts (plus `Status`) only.
    pub fn switch_channel(&self, target: &str) -> Result<String, String> {
        let result = self.contexts.set_active_channel(target);
        if result.is_ok() {
            self.ui.needs_refresh();
        }
        result
    }

    // ------------------------------------------------------------------
    // Connection operations
    // ------------------------------------------------------------------

    /// Connect using the stored connection parameters.
    pub fn connect(&self) -> CoreResult<()> {
        let info = self
            .state
            .connection_info()
            .ok_or_else(|| CoreError::Config("no valid connection parameters".to_string()))?;
        self.transport.connect(ConnectParams {
            host: info.host.clone(),
            port: info.port,
            tls: info.tls,
            tls_verify: info.tls_verify,
        });
        Ok(())
    }

    /// Switch servers: update parameters and reconnect.
    pub fn connect_to(&self, host: &str, port: u16, tls: bool) -> CoreResult<()> {
        let mut info = self
            .state
            .connection_info()
            .unwrap_or_else(|| ConnectionInfo::from_config(&self.config));
        let previous = info.host.clone();
        info.host = host.to_string();
        info.port = port;
        info.tls = tls;
        info.currently_joined_channels.clear();
        if !self.state.set_info(info) {
            let errors = self.state.take_config_errors().join("; ");
            let mut metadata = HashMap::new();
            metadata.insert("errors".to_string(), errors.clone());
            metadata.insert("previous_server".to_string(), previous);
            self.state
                .set_status(ConnectionStatus::ConfigError, metadata);
            return Err(CoreError::Config(errors));
        }
        self.connect()
    }

    /// Send QUIT and stop reconnecting.
    pub fn disconnect(&self, quit_message: &str) {
        self.transport.disconnect_gracefully(quit_message);
    }

    /// Tear down the transport task; `run` returns afterwards.
    pub fn shutdown(&self) {
        self.transport.shutdown();
    }

    pub fn send_raw(&self, line: &str) -> CoreResult<()> {
        self.transport.send_line(line)
    }

    /// Send a PRIVMSG, echoing locally unless the server echoes for us.
    pub fn send_privmsg(&self, target: &str, text: &str) -> CoreResult<()> {
        self.transport.send_line(&wire::privmsg(target, text))?;
        let echo_enabled = self
            .registration
            .lock()
            .as_ref()
            .map(|m| m.enabled_caps().contains("echo-message"))
            .unwrap_or(false);
        if !echo_enabled {
            let nick = self.our_nick();
            if self.contexts.context_exists(target) {
                self.add_chat_message(
                    target,
                    Some(&nick),
                    &format!("<{nick}> {text}"),
                    ColorKey::Message,
                    true,
                );
            }
        }
        Ok(())
    }

    pub fn send_notice(&self, target: &str, text: &str) -> CoreResult<()> {
        self.transport.send_line(&wire::notice(target, text))
    }

    pub fn join_channel(&self, channel: &str) -> CoreResult<()> {
        self.contexts
            .create_context(channel, ContextType::Channel, None);
        self.transport.send_line(&wire::join(channel))?;
        self.contexts
            .set_join_status(channel, ChannelJoinStatus::JoinCommandSent);
        Ok(())
    }

    pub fn part_channel(&self, channel: &str, reason: Option<&str>) -> CoreResult<()> {
        self.transport.send_line(&wire::part(channel, reason))
    }

    /// User-initiated nick change; remembered so a 433 for it is not
    /// auto-retried.
    pub fn change_nick(&self, new_nick: &str) -> CoreResult<()> {
        if let Some(mut info) = self.state.connection_info() {
            info.last_attempted_nick_change = Some(new_nick.to_string());
            self.state.set_info(info);
        }
        self.transport.send_line(&wire::nick(new_nick))
    }

    /// Request the channel list, directing the reply stream at a
    /// dedicated context.
    pub fn request_channel_list(&self) -> CoreResult<()> {
        let name = "ListResults";
        self.contexts
            .create_context(name, ContextType::ListResults, None);
        *self.active_list_context.write() = Some(name.to_string());
        self.transport.send_line("LIST")
    }

    // ------------------------------------------------------------------
    // DCC operations (delegation)
    // ------------------------------------------------------------------

    pub async fn dcc_send(
        self: &Arc<Self>,
        peer_nick: &str,
        path: PathBuf,
        passive: bool,
    ) -> CoreResult<String> {
        self.dcc.initiate_send(peer_nick, path, passive).await
    }

    /// Accept an active inbound offer previously shown to the user.
    pub async fn dcc_accept(
        self: &Arc<Self>,
        peer_nick: &str,
        filename: &str,
        ip: &str,
        port: u16,
        filesize: u64,
    ) -> CoreResult<String> {
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| CoreError::DccOfferInvalid(format!("bad address {ip:?}")))?;
        self.dcc
            .accept_offer(peer_nick, filename, ip, port, filesize)
            .await
    }

    pub async fn dcc_accept_passive(self: &Arc<Self>, token: &str) -> CoreResult<String> {
        self.dcc.accept_passive_offer(token).await
    }

    pub fn dcc_cancel(&self, id_prefix: &str) -> CoreResult<String> {
        self.dcc.cancel_transfer(id_prefix)
    }

    pub async fn dcc_resume(self: &Arc<Self>, identifier: &str) -> CoreResult<String> {
        self.dcc.attempt_user_resume(identifier).await
    }

    /// Write the current transfer table into the DCC context.
    pub fn dcc_show_transfers(&self) {
        let lines = self.dcc.transfer_statuses();
        if lines.is_empty() {
            self.add_dcc_message("No DCC transfers", ColorKey::Dcc);
            return;
        }
        for line in lines {
            self.add_dcc_message(&line, ColorKey::Dcc);
        }
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// Receiver of trigger outcomes for the embedding host. Call once.
    pub fn take_trigger_outcomes(&self) -> Option<mpsc::UnboundedReceiver<TriggerOutcome>> {
        self.outcome_rx.lock().take()
    }

    /// Send a trigger-synthesized raw line. A nested dispatch (a
    /// synthesized command producing another synthesized command in the
    /// same call stack) is an error.
    pub fn dispatch_synthesized_raw(&self, line: &str) -> CoreResult<()> {
        let depth = self.dispatch_depth.fetch_add(1, Ordering::SeqCst);
        let result = if depth > 0 {
            warn!("re-entrant synthesized dispatch of {line:?} refused");
            Err(CoreError::Internal(
                "re-entrant command dispatch".to_string(),
            ))
        } else {
            self.transport.send_line(line)
        };
        self.dispatch_depth.fetch_sub(1, Ordering::SeqCst);
        result
    }

    // ------------------------------------------------------------------
    // Introspection helpers
    // ------------------------------------------------------------------

    pub fn our_nick(&self) -> String {
        self.state
            .connection_info()
            .map(|i| i.nick)
            .unwrap_or_else(|| self.config.nick.clone())
    }

    /// True when the sender's full ident matches any ignore pattern.
    pub fn is_ignored(&self, full_ident: &str) -> bool {
        self.config
            .ignore_patterns
            .iter()
            .any(|pattern| wildcard_match(pattern, full_ident))
    }

    /// Capabilities acknowledged by the server for this connection.
    pub fn enabled_caps(&self) -> Vec<String> {
        self.registration
            .lock()
            .as_ref()
            .map(|m| m.enabled_caps().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_registered(&self) -> bool {
        self.state.connection_state() == ConnectionStatus::Registered
    }

    /// The server echoed a NICK for us: commit it everywhere.
    pub(crate) fn confirm_own_nick(&self, new_nick: &str) {
        if let Some(mut info) = self.state.connection_info() {
            info.nick = new_nick.to_string();
            if info
                .last_attempted_nick_change
                .as_deref()
                .map(|n| irc_eq(n, new_nick))
                .unwrap_or(false)
            {
                info.last_attempted_nick_change = None;
            }
            self.state.set_info(info);
        }
        if let Some(machine) = self.registration.lock().as_mut() {
            machine.on_own_nick_confirmed(new_nick);
        }
        self.is_handling_nick_collision.store(false, Ordering::SeqCst);
    }

    /// A 433 for a user-chosen nick consumes the pending attempt instead
    /// of triggering the automatic retry.
    pub(crate) fn clear_user_nick_attempt(&self, msg: &crate::wire::Message) {
        let failed = match msg.display_params().first() {
            Some(nick) => nick.to_string(),
            None => return,
        };
        if let Some(mut info) = self.state.connection_info() {
            if info
                .last_attempted_nick_change
                .as_deref()
                .map(|n| n.eq_ignore_ascii_case(&failed))
                .unwrap_or(false)
            {
                info.last_attempted_nick_change = None;
                self.state.set_info(info);
            }
        }
    }
}
