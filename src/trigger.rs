//! # Trigger Engine Interface
//!
//! Matches named events against stored patterns and produces an action
//! descriptor for the embedding application: either a synthesized command
//! string (with `%field%` placeholders filled from the event payload) or
//! a sandboxed script-action descriptor the external script host
//! executes. The core never evaluates user code.

use crate::events::Event;
use crate::utils::wildcard_match;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

/// Action stored with a trigger.
#[derive(Debug, Clone)]
pub enum TriggerAction {
    /// Synthesize a command line for the dispatcher.
    Command(String),
    /// Ask the external script host to run a named action.
    ScriptAction { name: String, payload: Value },
}

/// What a matched trigger asks the host to do.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Command(String),
    ScriptAction { name: String, payload: Value },
}

/// One stored trigger.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub id: u32,
    /// Event name this trigger listens to (`"*"` for all).
    pub event_name: String,
    /// Payload field the pattern applies to; `None` matches against the
    /// whole payload rendered as JSON.
    pub field: Option<String>,
    /// Wildcard pattern (`*`/`?`).
    pub pattern: String,
    pub action: TriggerAction,
    pub enabled: bool,
}

/// Pattern store and matcher.
pub struct TriggerEngine {
    triggers: RwLock<Vec<Trigger>>,
    next_id: AtomicU32,
}

impl Default for TriggerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self {
            triggers: RwLock::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Store a trigger; returns its id.
    pub fn add_trigger(
        &self,
        event_name: &str,
        field: Option<&str>,
        pattern: &str,
        action: TriggerAction,
    ) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.triggers.write().push(Trigger {
            id,
            event_name: event_name.to_string(),
            field: field.map(|f| f.to_string()),
            pattern: pattern.to_string(),
            action,
            enabled: true,
        });
        id
    }

    pub fn remove_trigger(&self, id: u32) -> bool {
        let mut triggers = self.triggers.write();
        let before = triggers.len();
        triggers.retain(|t| t.id != id);
        triggers.len() != before
    }

    pub fn set_enabled(&self, id: u32, enabled: bool) -> bool {
        let mut triggers = self.triggers.write();
        for trigger in triggers.iter_mut() {
            if trigger.id == id {
                trigger.enabled = enabled;
                return true;
            }
        }
        false
    }

    pub fn list(&self) -> Vec<Trigger> {
        self.triggers.read().clone()
    }

    /// Match `event` against stored triggers in insertion order; the
    /// first match wins.
    pub fn process(&self, event: &Event) -> Option<TriggerOutcome> {
        let triggers = self.triggers.read();
        for trigger in triggers.iter() {
            if !trigger.enabled {
                continue;
            }
            if trigger.event_name != "*" && trigger.event_name != event.name {
                continue;
            }
            let haystack = match trigger.field {
                Some(ref field) => match event.payload.get(field) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => continue,
                },
                None => event.payload.to_string(),
            };
            if !wildcard_match(&trigger.pattern, &haystack) {
                continue;
            }
            info!(
                "trigger {} matched event '{}' (pattern {:?})",
                trigger.id, event.name, trigger.pattern
            );
            return Some(match trigger.action {
                TriggerAction::Command(ref template) => {
                    TriggerOutcome::Command(substitute(template, &event.payload))
                }
                TriggerAction::ScriptAction {
                    ref name,
                    ref payload,
                } => TriggerOutcome::ScriptAction {
                    name: name.clone(),
                    payload: json!({
                        "action": payload,
                        "event": event.payload,
                    }),
                },
            });
        }
        debug!("no trigger matched event '{}'", event.name);
        None
    }
}

/// Replace `%field%` placeholders with payload values.
fn substitute(template: &str, payload: &Value) -> String {
    let mut out = template.to_string();
    if let Some(map) = payload.as_object() {
        for (key, value) in map {
            let placeholder = format!("%{key}%");
            if !out.contains(&placeholder) {
                continue;
            }
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&placeholder, &rendered);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(name: &str, payload: Value) -> Event {
        Event {
            name: name.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_command_trigger_with_substitution() {
        let engine = TriggerEngine::new();
        engine.add_trigger(
            "PRIVMSG_RECEIVED",
            Some("text"),
            "*hello bot*",
            TriggerAction::Command("msg %nick% hi there".to_string()),
        );

        let outcome = engine
            .process(&event(
                "PRIVMSG_RECEIVED",
                json!({"nick": "alice", "text": "well hello bot, you there?"}),
            ))
            .unwrap();
        assert_eq!(outcome, TriggerOutcome::Command("msg alice hi there".to_string()));
    }

    #[test]
    fn test_no_match_on_other_event_or_field() {
        let engine = TriggerEngine::new();
        engine.add_trigger(
            "PRIVMSG_RECEIVED",
            Some("text"),
            "*ping*",
            TriggerAction::Command("x".to_string()),
        );
        assert!(engine
            .process(&event("NOTICE_RECEIVED", json!({"text": "ping"})))
            .is_none());
        assert!(engine
            .process(&event("PRIVMSG_RECEIVED", json!({"text": "pong"})))
            .is_none());
        assert!(engine
            .process(&event("PRIVMSG_RECEIVED", json!({"other": "ping"})))
            .is_none());
    }

    #[test]
    fn test_script_action_carries_event_payload() {
        let engine = TriggerEngine::new();
        engine.add_trigger(
            "CHANNEL_FULLY_JOINED",
            Some("channel"),
            "#chat",
            TriggerAction::ScriptAction {
                name: "greet".to_string(),
                payload: json!({"greeting": "hey"}),
            },
        );
        let outcome = engine
            .process(&event("CHANNEL_FULLY_JOINED", json!({"channel": "#chat"})))
            .unwrap();
        match outcome {
            TriggerOutcome::ScriptAction { name, payload } => {
                assert_eq!(name, "greet");
                assert_eq!(payload["action"]["greeting"], "hey");
                assert_eq!(payload["event"]["channel"], "#chat");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_disable_and_remove() {
        let engine = TriggerEngine::new();
        let id = engine.add_trigger("*", None, "*", TriggerAction::Command("x".to_string()));
        assert!(engine.set_enabled(id, false));
        assert!(engine.process(&event("ANY", json!({}))).is_none());
        assert!(engine.remove_trigger(id));
        assert!(!engine.remove_trigger(id));
    }
}
