//! # Connection State Store
//!
//! A thread-safe typed store for the two pieces of connection-scoped
//! state: [`ConnectionInfo`] (who we are and where we connect) and
//! [`ConnectionStatus`] (where the connection lifecycle currently is).
//!
//! ## Semantics
//!
//! - `set` runs a per-key validation predicate; on failure nothing is
//!   mutated, `false` is returned and a description is appended to the
//!   `config_errors` list.
//! - On success a [`StateChange`] is delivered synchronously to every
//!   registered handler in registration order.
//! - At most one transition per key is in flight at a time; transitions
//!   are serialized through a per-key re-entrant lock so handlers can
//!   read state freely.
//! - A handler calling `set` on the key it is handling is a bug; the
//!   nested call is aborted, logged, and returns `false`.

use crate::config::ServerConfig;
use crate::utils::irc_fold;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Live connection parameters, derived from [`ServerConfig`] and mutated
/// exclusively through the [`StateStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub tls_verify: bool,
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub server_password: Option<String>,
    pub nickserv_password: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub sasl_abort_on_fail: bool,
    /// Capabilities we want, intersected with what the server offers.
    pub desired_caps: HashSet<String>,
    /// Channels joined automatically after registration.
    pub initial_channels: Vec<String>,
    /// Channels currently fully joined (folded names).
    pub currently_joined_channels: HashSet<String>,
    /// Nick from an in-flight user-initiated `/nick`, used to distinguish
    /// user changes from automatic collision handling.
    pub last_attempted_nick_change: Option<String>,
}

impl ConnectionInfo {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            tls: config.tls,
            tls_verify: config.tls_verify,
            nick: config.nick.clone(),
            username: if config.username.is_empty() {
                config.nick.clone()
            } else {
                config.username.clone()
            },
            realname: if config.realname.is_empty() {
                config.nick.clone()
            } else {
                config.realname.clone()
            },
            server_password: config.server_password.clone(),
            nickserv_password: config.nickserv_password.clone(),
            sasl_username: config.sasl_username.clone(),
            sasl_password: config.sasl_password.clone(),
            sasl_abort_on_fail: config.sasl_abort_on_fail,
            desired_caps: config.desired_caps.iter().cloned().collect(),
            initial_channels: config.initial_channels.clone(),
            currently_joined_channels: HashSet::new(),
            last_attempted_nick_change: None,
        }
    }

    /// True when SASL credentials usable for PLAIN are present.
    pub fn has_sasl_credentials(&self) -> bool {
        self.sasl_username.is_some() && self.sasl_password.is_some()
    }

    fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("server host must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("server port must be non-zero".to_string());
        }
        if self.nick.trim().is_empty() {
            return Err("nick must not be empty".to_string());
        }
        if self.desired_caps.contains("sasl") && !self.has_sasl_credentials() {
            return Err("sasl requested without credentials".to_string());
        }
        Ok(())
    }
}

/// Discrete connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Registered,
    Error,
    ConfigError,
}

/// Keys addressable in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKey {
    ConnectionInfo,
    ConnectionState,
}

/// A value held by the store.
#[derive(Debug, Clone)]
pub enum StateValue {
    Info(Box<ConnectionInfo>),
    Status(ConnectionStatus),
}

/// Change notification delivered to registered handlers.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub key: StateKey,
    pub old: Option<StateValue>,
    pub new: StateValue,
    /// Free-form transition metadata (error reason, previous server, ...).
    pub metadata: HashMap<String, String>,
}

type ChangeHandler = Box<dyn Fn(&StateChange) + Send + Sync>;

struct Slot {
    value: Option<StateValue>,
    /// Depth of in-flight `set` calls on this key from the current
    /// transition; anything above zero means a handler re-entered.
    depth: u32,
}

/// Thread-safe store of connection state with change notification.
pub struct StateStore {
    info: ReentrantMutex<RefCell<Slot>>,
    status: ReentrantMutex<RefCell<Slot>>,
    handlers: Mutex<HashMap<StateKey, Vec<ChangeHandler>>>,
    config_errors: Mutex<Vec<String>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            info: ReentrantMutex::new(RefCell::new(Slot {
                value: None,
                depth: 0,
            })),
            status: ReentrantMutex::new(RefCell::new(Slot {
                value: Some(StateValue::Status(ConnectionStatus::Disconnected)),
                depth: 0,
            })),
            handlers: Mutex::new(HashMap::new()),
            config_errors: Mutex::new(Vec::new()),
        }
    }

    fn slot(&self, key: StateKey) -> &ReentrantMutex<RefCell<Slot>> {
        match key {
            StateKey::ConnectionInfo => &self.info,
            StateKey::ConnectionState => &self.status,
        }
    }

    /// Current value for `key`, if set.
    pub fn get(&self, key: StateKey) -> Option<StateValue> {
        self.slot(key).lock().borrow().value.clone()
    }

    /// Typed accessor for the connection parameters.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        match self.get(StateKey::ConnectionInfo) {
            Some(StateValue::Info(info)) => Some(*info),
            _ => None,
        }
    }

    /// Typed accessor for the lifecycle state.
    pub fn connection_state(&self) -> ConnectionStatus {
        match self.get(StateKey::ConnectionState) {
            Some(StateValue::Status(status)) => status,
            _ => ConnectionStatus::Disconnected,
        }
    }

    /// Register a change handler for `key`. Handlers run synchronously on
    /// the mutating task, in registration order, and must be brief.
    pub fn register_change_handler<F>(&self, key: StateKey, handler: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .entry(key)
            .or_default()
            .push(Box::new(handler));
    }

    /// Validate and store a new value, notifying handlers on success.
    ///
    /// Returns `false` (and mutates nothing) when validation fails or when
    /// called re-entrantly from a change handler on the same key.
    pub fn set(&self, value: StateValue, metadata: HashMap<String, String>) -> bool {
        let key = match value {
            StateValue::Info(_) => StateKey::ConnectionInfo,
            StateValue::Status(_) => StateKey::ConnectionState,
        };
        let slot = self.slot(key);
        let guard = slot.lock();

        {
            let mut inner = guard.borrow_mut();
            if inner.depth > 0 {
                warn!(
                    "re-entrant state set on {:?} from a change handler; aborting nested call",
                    key
                );
                return false;
            }
            inner.depth += 1;
        }

        // Per-key validation. Only the info key has a predicate today.
        if let StateValue::Info(ref info) = value {
            if let Err(reason) = info.validate() {
                warn!("connection info rejected: {}", reason);
                self.config_errors.lock().push(reason);
                guard.borrow_mut().depth -= 1;
                return false;
            }
        }

        let old = {
            let mut inner = guard.borrow_mut();
            std::mem::replace(&mut inner.value, Some(value.clone()))
        };
        debug!("state {:?} updated", key);

        let change = StateChange {
            key,
            old,
            new: value,
            metadata,
        };
        // Handlers run under the re-entrant lock: reads are fine, nested
        // sets on the same key trip the depth check above.
        let handlers = self.handlers.lock();
        if let Some(list) = handlers.get(&key) {
            for handler in list {
                handler(&change);
            }
        }
        drop(handlers);

        guard.borrow_mut().depth -= 1;
        true
    }

    /// Convenience wrapper for lifecycle transitions.
    pub fn set_status(&self, status: ConnectionStatus, metadata: HashMap<String, String>) -> bool {
        self.set(StateValue::Status(status), metadata)
    }

    /// Convenience wrapper for connection parameter updates.
    pub fn set_info(&self, info: ConnectionInfo) -> bool {
        self.set(StateValue::Info(Box::new(info)), HashMap::new())
    }

    /// Drain accumulated validation failures.
    pub fn take_config_errors(&self) -> Vec<String> {
        std::mem::take(&mut self.config_errors.lock())
    }

    /// Record a channel as fully joined in the connection info.
    pub fn mark_channel_joined(&self, channel: &str) {
        if let Some(mut info) = self.connection_info() {
            info.currently_joined_channels.insert(irc_fold(channel));
            self.set_info(info);
        }
    }

    /// Remove a channel from the joined set (PART, KICK, join failure).
    pub fn mark_channel_left(&self, channel: &str) {
        if let Some(mut info) = self.connection_info() {
            info.currently_joined_channels.remove(&irc_fold(channel));
            self.set_info(info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn valid_info() -> ConnectionInfo {
        let config = ServerConfig {
            host: "irc.example.net".to_string(),
            nick: "alice".to_string(),
            ..Default::default()
        };
        ConnectionInfo::from_config(&config)
    }

    #[test]
    fn test_set_and_get_round_trip() {
        let store = StateStore::new();
        assert!(store.connection_info().is_none());
        assert!(store.set_info(valid_info()));
        assert_eq!(store.connection_info().unwrap().nick, "alice");
        assert_eq!(store.connection_state(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_validation_failure_keeps_prior_value() {
        let store = StateStore::new();
        assert!(store.set_info(valid_info()));

        let mut bad = valid_info();
        bad.nick = String::new();
        assert!(!store.set_info(bad));

        // Prior value intact, error recorded.
        assert_eq!(store.connection_info().unwrap().nick, "alice");
        let errors = store.take_config_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("nick"));
    }

    #[test]
    fn test_sasl_desired_without_credentials_rejected() {
        let store = StateStore::new();

        // No credentials at all.
        let mut info = valid_info();
        info.desired_caps.insert("sasl".to_string());
        info.sasl_username = None;
        info.sasl_password = None;
        assert!(!store.set_info(info));
        let errors = store.take_config_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("sasl"));

        // Half credentials are just as unusable.
        let mut info = valid_info();
        info.desired_caps.insert("sasl".to_string());
        info.sasl_username = Some("alice".to_string());
        info.sasl_password = None;
        assert!(!store.set_info(info));
        assert_eq!(store.take_config_errors().len(), 1);

        // Complete credentials pass.
        let mut info = valid_info();
        info.desired_caps.insert("sasl".to_string());
        info.sasl_username = Some("alice".to_string());
        info.sasl_password = Some("secret".to_string());
        assert!(store.set_info(info));
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let store = StateStore::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            store.register_change_handler(StateKey::ConnectionState, move |_| {
                order.lock().push(i)
            });
        }
        store.set_status(ConnectionStatus::Connecting, HashMap::new());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_change_carries_old_and_metadata() {
        let store = StateStore::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        store.register_change_handler(StateKey::ConnectionState, move |change| {
            *seen_clone.lock() = Some(change.clone());
        });

        let mut metadata = HashMap::new();
        metadata.insert("reason".to_string(), "read EOF".to_string());
        store.set_status(ConnectionStatus::Disconnected, metadata);

        let change = seen.lock().clone().unwrap();
        assert!(matches!(
            change.old,
            Some(StateValue::Status(ConnectionStatus::Disconnected))
        ));
        assert_eq!(change.metadata.get("reason").unwrap(), "read EOF");
    }

    #[test]
    fn test_reentrant_set_is_aborted() {
        let store = Arc::new(StateStore::new());
        let nested_result = Arc::new(AtomicUsize::new(99));

        let store_clone = store.clone();
        let nested_clone = nested_result.clone();
        store.register_change_handler(StateKey::ConnectionState, move |_| {
            let ok = store_clone.set_status(ConnectionStatus::Error, HashMap::new());
            nested_clone.store(ok as usize, Ordering::SeqCst);
        });

        assert!(store.set_status(ConnectionStatus::Connecting, HashMap::new()));
        // The nested call was refused and the outer value stands.
        assert_eq!(nested_result.load(Ordering::SeqCst), 0);
        assert_eq!(store.connection_state(), ConnectionStatus::Connecting);
    }

    #[test]
    fn test_joined_channel_tracking_folds_names() {
        let store = StateStore::new();
        store.set_info(valid_info());
        store.mark_channel_joined("#Chat");
        assert!(store
            .connection_info()
            .unwrap()
            .currently_joined_channels
            .contains("#chat"));
        store.mark_channel_left("#CHAT");
        assert!(store
            .connection_info()
            .unwrap()
            .currently_joined_channels
            .is_empty());
    }
}
