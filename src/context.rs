//! # Context Manager
//!
//! Ordered mapping of context name → context entity. A context is a named
//! message destination: the status window, a channel, a private query, the
//! DCC transfers view, or LIST results. The manager owns per-context
//! scrollback, the per-channel join state machine, and user lists.
//!
//! Channel and nick names are case-folded per RFC 1459 (`{}|^` are the
//! lowercase of `[]\~`), so `#Foo` and `#foo` address the same context.
//! `Status` always sorts first and `DCC` always sorts last; everything
//! else is ordered case-insensitively between them.

use crate::sink::ColorKey;
use crate::utils::{irc_eq, irc_fold};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::debug;

/// Well-known context names.
pub const STATUS_CONTEXT: &str = "Status";
pub const DCC_CONTEXT: &str = "DCC";

/// Kind of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextType {
    Status,
    Channel,
    Query,
    DccTransfers,
    ListResults,
    Generic,
}

/// Per-channel join handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelJoinStatus {
    /// Not a joined channel (or never attempted).
    NotJoined,
    /// Created from the auto-join list; JOIN not yet sent.
    PendingInitialJoin,
    /// Outbound JOIN sent, waiting for the server.
    JoinCommandSent,
    /// First RPL_NAMREPLY (353) naming the channel arrived.
    SelfJoinReceived,
    /// RPL_ENDOFNAMES (366) arrived; membership confirmed.
    FullyJoined,
    /// Join refused (403/471/473/474/475). Terminal.
    JoinFailed,
    /// We left the channel.
    Parted,
}

/// One rendered scrollback line.
#[derive(Debug, Clone)]
pub struct ScrollbackLine {
    pub text: String,
    pub color: ColorKey,
    pub timestamp: DateTime<Utc>,
    /// Display lines this entry occupies after wrapping; wrapping is done
    /// by the UI, which reports the count back through `add_message`.
    pub line_count: u16,
}

/// A named message destination.
#[derive(Debug)]
pub struct Context {
    /// Display name with original casing.
    pub name: String,
    pub context_type: ContextType,
    pub scrollback: VecDeque<ScrollbackLine>,
    /// How far the user has scrolled up, in display lines. Zero means
    /// pinned to the bottom.
    pub scrollback_offset: usize,
    pub topic: Option<String>,
    /// nick → prefix modes (`@`, `+`, `%`, `&`, `~`).
    pub users: HashMap<String, BTreeSet<char>>,
    pub join_status: ChannelJoinStatus,
    pub created_at: DateTime<Utc>,
}

impl Context {
    fn new(name: &str, context_type: ContextType, join_status: ChannelJoinStatus) -> Self {
        Self {
            name: name.to_string(),
            context_type,
            scrollback: VecDeque::new(),
            scrollback_offset: 0,
            topic: None,
            users: HashMap::new(),
            join_status,
            created_at: Utc::now(),
        }
    }
}

struct Inner {
    /// Folded name → context.
    contexts: HashMap<String, Context>,
    active: String,
}

/// Thread-safe manager of all contexts.
pub struct ContextManager {
    inner: RwLock<Inner>,
    max_history: usize,
}

impl ContextManager {
    /// Create a manager holding the always-present `Status` context, and
    /// the `DCC` context when DCC is enabled.
    pub fn new(max_history: usize, dcc_enabled: bool) -> Self {
        let mut contexts = HashMap::new();
        contexts.insert(
            irc_fold(STATUS_CONTEXT),
            Context::new(STATUS_CONTEXT, ContextType::Status, ChannelJoinStatus::NotJoined),
        );
        if dcc_enabled {
            contexts.insert(
                irc_fold(DCC_CONTEXT),
                Context::new(
                    DCC_CONTEXT,
                    ContextType::DccTransfers,
                    ChannelJoinStatus::NotJoined,
                ),
            );
        }
        Self {
            inner: RwLock::new(Inner {
                contexts,
                active: irc_fold(STATUS_CONTEXT),
            }),
            max_history,
        }
    }

    /// Create a context if absent. Returns true when a new context was
    /// created.
    pub fn create_context(
        &self,
        name: &str,
        context_type: ContextType,
        initial_join_status: Option<ChannelJoinStatus>,
    ) -> bool {
        let key = irc_fold(name);
        let mut inner = self.inner.write();
        if inner.contexts.contains_key(&key) {
            return false;
        }
        let join_status = initial_join_status.unwrap_or(ChannelJoinStatus::NotJoined);
        debug!("creating context {} ({:?})", name, context_type);
        inner
            .contexts
            .insert(key, Context::new(name, context_type, join_status));
        true
    }

    /// Remove a context. The `Status` and `DCC` contexts cannot be removed.
    pub fn remove_context(&self, name: &str) -> bool {
        if irc_eq(name, STATUS_CONTEXT) || irc_eq(name, DCC_CONTEXT) {
            return false;
        }
        let key = irc_fold(name);
        let mut inner = self.inner.write();
        let removed = inner.contexts.remove(&key).is_some();
        if removed && inner.active == key {
            inner.active = irc_fold(STATUS_CONTEXT);
        }
        removed
    }

    pub fn context_exists(&self, name: &str) -> bool {
        self.inner.read().contexts.contains_key(&irc_fold(name))
    }

    /// Run `f` against the named context, if present.
    pub fn with_context<R>(&self, name: &str, f: impl FnOnce(&Context) -> R) -> Option<R> {
        let inner = self.inner.read();
        inner.contexts.get(&irc_fold(name)).map(f)
    }

    /// All context display names in presentation order: `Status` first,
    /// `DCC` last, the rest sorted case-insensitively.
    pub fn get_all_context_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut middle: Vec<&Context> = Vec::new();
        let mut first = None;
        let mut last = None;
        for ctx in inner.contexts.values() {
            if irc_eq(&ctx.name, STATUS_CONTEXT) {
                first = Some(ctx.name.clone());
            } else if irc_eq(&ctx.name, DCC_CONTEXT) {
                last = Some(ctx.name.clone());
            } else {
                middle.push(ctx);
            }
        }
        middle.sort_by_key(|c| c.name.to_lowercase());
        let mut out = Vec::with_capacity(inner.contexts.len());
        out.extend(first);
        out.extend(middle.into_iter().map(|c| c.name.clone()));
        out.extend(last);
        out
    }

    /// Display name of the active context.
    pub fn active_context_name(&self) -> String {
        let inner = self.inner.read();
        inner
            .contexts
            .get(&inner.active)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| STATUS_CONTEXT.to_string())
    }

    /// Switch the active context.
    ///
    /// `target` may be `"next"`, `"prev"`, an exact name, a 1-based index
    /// into the presentation order, or a unique substring. A
    /// case-insensitive exact match always wins; an ambiguous substring is
    /// an error naming the candidates.
    pub fn set_active_context(&self, target: &str) -> Result<String, String> {
        let names = self.get_all_context_names();
        self.switch_within(target, &names)
    }

    /// Like [`Self::set_active_context`] but cycling only channel contexts
    /// plus `Status`.
    pub fn set_active_channel(&self, target: &str) -> Result<String, String> {
        let all = self.get_all_context_names();
        let names: Vec<String> = {
            let inner = self.inner.read();
            all.into_iter()
                .filter(|n| {
                    let ctx = inner.contexts.get(&irc_fold(n));
                    matches!(
                        ctx.map(|c| c.context_type),
                        Some(ContextType::Channel) | Some(ContextType::Status)
                    )
                })
                .collect()
        };
        self.switch_within(target, &names)
    }

    fn switch_within(&self, target: &str, names: &[String]) -> Result<String, String> {
        if names.is_empty() {
            return Err("no contexts".to_string());
        }
        let current = self.active_context_name();
        let current_idx = names.iter().position(|n| irc_eq(n, &current)).unwrap_or(0);

        let chosen: String = match target {
            "next" => names[(current_idx + 1) % names.len()].clone(),
            "prev" => names[(current_idx + names.len() - 1) % names.len()].clone(),
            _ => {
                if let Ok(index) = target.parse::<usize>() {
                    if index == 0 || index > names.len() {
                        return Err(format!("no context at index {index}"));
                    }
                    names[index - 1].clone()
                } else if let Some(exact) = names.iter().find(|n| irc_eq(n, target)) {
                    exact.clone()
                } else {
                    let needle = target.to_lowercase();
                    let matches: Vec<&String> = names
                        .iter()
                        .filter(|n| n.to_lowercase().contains(&needle))
                        .collect();
                    match matches.len() {
                        0 => return Err(format!("no context matching '{target}'")),
                        1 => matches[0].clone(),
                        _ => {
                            let list: Vec<&str> =
                                matches.iter().map(|n| n.as_str()).collect();
                            return Err(format!(
                                "ambiguous context '{}': {}",
                                target,
                                list.join(", ")
                            ));
                        }
                    }
                }
            }
        };

        let mut inner = self.inner.write();
        inner.active = irc_fold(&chosen);
        Ok(chosen)
    }

    /// Append a line to a context's scrollback.
    ///
    /// `line_count` is the number of display lines after UI wrapping.
    /// While the active context is scrolled up, its offset grows by the
    /// new lines so the visible region stays pinned. Overflow beyond the
    /// configured history evicts the oldest entries.
    pub fn add_message_to_context(
        &self,
        name: &str,
        text: &str,
        color: ColorKey,
        line_count: u16,
    ) -> bool {
        let key = irc_fold(name);
        let mut inner = self.inner.write();
        let is_active = inner.active == key;
        let max_history = self.max_history;
        let Some(ctx) = inner.contexts.get_mut(&key) else {
            return false;
        };
        ctx.scrollback.push_back(ScrollbackLine {
            text: text.to_string(),
            color,
            timestamp: Utc::now(),
            line_count,
        });
        while ctx.scrollback.len() > max_history {
            ctx.scrollback.pop_front();
        }
        if is_active && ctx.scrollback_offset > 0 {
            ctx.scrollback_offset += line_count as usize;
        }
        true
    }

    /// Adjust the active context's scrollback offset (positive scrolls up).
    pub fn scroll_active(&self, delta: isize) {
        let mut inner = self.inner.write();
        let active = inner.active.clone();
        if let Some(ctx) = inner.contexts.get_mut(&active) {
            let total: usize = ctx.scrollback.iter().map(|l| l.line_count as usize).sum();
            let next = ctx.scrollback_offset as isize + delta;
            ctx.scrollback_offset = next.clamp(0, total as isize) as usize;
        }
    }

    pub fn messages(&self, name: &str) -> Vec<ScrollbackLine> {
        self.with_context(name, |c| c.scrollback.iter().cloned().collect())
            .unwrap_or_default()
    }

    // User-list maintenance. Nicks are folded for keying but stored with
    // their display casing in the prefix map's companion name.

    pub fn add_user(&self, channel: &str, nick: &str, prefixes: &[char]) -> bool {
        let mut inner = self.inner.write();
        let Some(ctx) = inner.contexts.get_mut(&irc_fold(channel)) else {
            return false;
        };
        let entry = ctx.users.entry(irc_fold(nick)).or_default();
        entry.extend(prefixes.iter().copied());
        true
    }

    pub fn remove_user(&self, channel: &str, nick: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(ctx) = inner.contexts.get_mut(&irc_fold(channel)) else {
            return false;
        };
        ctx.users.remove(&irc_fold(nick)).is_some()
    }

    /// Remove a nick from every channel; returns the affected channel
    /// names (used for QUIT fan-out).
    pub fn remove_user_from_all(&self, nick: &str) -> Vec<String> {
        let folded = irc_fold(nick);
        let mut affected = Vec::new();
        let mut inner = self.inner.write();
        for ctx in inner.contexts.values_mut() {
            if ctx.context_type == ContextType::Channel && ctx.users.remove(&folded).is_some() {
                affected.push(ctx.name.clone());
            }
        }
        affected
    }

    /// Rename a nick across every channel; returns the affected channels.
    pub fn rename_user(&self, old_nick: &str, new_nick: &str) -> Vec<String> {
        let old_key = irc_fold(old_nick);
        let new_key = irc_fold(new_nick);
        let mut affected = Vec::new();
        let mut inner = self.inner.write();
        for ctx in inner.contexts.values_mut() {
            if let Some(prefixes) = ctx.users.remove(&old_key) {
                ctx.users.insert(new_key.clone(), prefixes);
                affected.push(ctx.name.clone());
            }
        }
        affected
    }

    /// Grant or revoke a prefix mode for a user in a channel.
    pub fn update_user_prefix(&self, channel: &str, nick: &str, prefix: char, grant: bool) {
        let mut inner = self.inner.write();
        if let Some(ctx) = inner.contexts.get_mut(&irc_fold(channel)) {
            if let Some(prefixes) = ctx.users.get_mut(&irc_fold(nick)) {
                if grant {
                    prefixes.insert(prefix);
                } else {
                    prefixes.remove(&prefix);
                }
            }
        }
    }

    pub fn users(&self, channel: &str) -> Vec<String> {
        self.with_context(channel, |c| c.users.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn user_prefixes(&self, channel: &str, nick: &str) -> Option<BTreeSet<char>> {
        self.with_context(channel, |c| c.users.get(&irc_fold(nick)).cloned())
            .flatten()
    }

    pub fn update_topic(&self, channel: &str, topic: Option<String>) {
        let mut inner = self.inner.write();
        if let Some(ctx) = inner.contexts.get_mut(&irc_fold(channel)) {
            ctx.topic = topic;
        }
    }

    pub fn topic(&self, channel: &str) -> Option<String> {
        self.with_context(channel, |c| c.topic.clone()).flatten()
    }

    pub fn join_status(&self, channel: &str) -> Option<ChannelJoinStatus> {
        self.with_context(channel, |c| c.join_status)
    }

    pub fn set_join_status(&self, channel: &str, status: ChannelJoinStatus) -> bool {
        let mut inner = self.inner.write();
        let Some(ctx) = inner.contexts.get_mut(&irc_fold(channel)) else {
            return false;
        };
        debug!("{}: join status {:?} -> {:?}", ctx.name, ctx.join_status, status);
        ctx.join_status = status;
        // Leaving a channel empties its user list.
        if matches!(status, ChannelJoinStatus::Parted | ChannelJoinStatus::JoinFailed) {
            ctx.users.clear();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_channels(channels: &[&str]) -> ContextManager {
        let manager = ContextManager::new(100, true);
        for chan in channels {
            manager.create_context(chan, ContextType::Channel, None);
        }
        manager
    }

    #[test]
    fn test_status_and_dcc_always_exist() {
        let manager = ContextManager::new(100, true);
        assert!(manager.context_exists("Status"));
        assert!(manager.context_exists("DCC"));
        assert!(!manager.remove_context("Status"));
        assert!(!manager.remove_context("DCC"));
    }

    #[test]
    fn test_case_folded_uniqueness() {
        let manager = ContextManager::new(100, false);
        assert!(manager.create_context("#Foo", ContextType::Channel, None));
        assert!(!manager.create_context("#foo", ContextType::Channel, None));
        assert!(manager.context_exists("#FOO"));
        // RFC 1459: []\~ fold to {}|^
        assert!(manager.create_context("#a[b]", ContextType::Channel, None));
        assert!(manager.context_exists("#a{b}"));
    }

    #[test]
    fn test_presentation_order() {
        let manager = manager_with_channels(&["#zeta", "#Alpha", "#mid"]);
        manager.create_context("buddy", ContextType::Query, None);
        let names = manager.get_all_context_names();
        assert_eq!(
            names,
            vec!["Status", "#Alpha", "#mid", "#zeta", "buddy", "DCC"]
        );
    }

    #[test]
    fn test_switching_by_index_and_substring() {
        let manager = manager_with_channels(&["#chat", "#dev"]);
        // Order: Status, #chat, #dev, DCC
        assert_eq!(manager.set_active_context("3").unwrap(), "#dev");
        assert_eq!(manager.set_active_context("next").unwrap(), "DCC");
        assert_eq!(manager.set_active_context("prev").unwrap(), "#dev");
        assert_eq!(manager.set_active_context("cha").unwrap(), "#chat");
        assert!(manager.set_active_context("0").is_err());
        assert!(manager.set_active_context("nosuch").is_err());
    }

    #[test]
    fn test_ambiguous_substring_is_error_but_exact_wins() {
        let manager = manager_with_channels(&["#dev", "#devops"]);
        let err = manager.set_active_context("dev").err();
        // "#dev" is a case-insensitive exact... it is not: exact match
        // compares whole names, and "dev" != "#dev", so this is ambiguous.
        assert!(err.is_some());
        assert!(err.unwrap().contains("ambiguous"));
        // Full name wins even though it is also a substring of #devops.
        assert_eq!(manager.set_active_context("#DEV").unwrap(), "#dev");
    }

    #[test]
    fn test_channel_only_cycle() {
        let manager = manager_with_channels(&["#chat"]);
        manager.create_context("buddy", ContextType::Query, None);
        manager.set_active_context("Status").unwrap();
        assert_eq!(manager.set_active_channel("next").unwrap(), "#chat");
        assert_eq!(manager.set_active_channel("next").unwrap(), "Status");
    }

    #[test]
    fn test_scrollback_eviction_and_pinning() {
        let manager = ContextManager::new(3, false);
        manager.create_context("#c", ContextType::Channel, None);
        manager.set_active_context("#c").unwrap();
        for i in 0..5 {
            manager.add_message_to_context("#c", &format!("line {i}"), ColorKey::Message, 1);
        }
        let messages = manager.messages("#c");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text, "line 2");

        // Scrolled up: new lines grow the offset so the view stays pinned.
        manager.scroll_active(2);
        manager.add_message_to_context("#c", "more", ColorKey::Message, 2);
        assert_eq!(
            manager.with_context("#c", |c| c.scrollback_offset).unwrap(),
            4
        );
    }

    #[test]
    fn test_user_list_maintenance() {
        let manager = manager_with_channels(&["#a", "#b"]);
        manager.add_user("#a", "Alice", &[]);
        manager.add_user("#b", "alice", &['@']);
        manager.add_user("#b", "bob", &[]);

        assert_eq!(manager.rename_user("ALICE", "alicia").len(), 2);
        assert!(manager.users("#a").contains(&"alicia".to_string()));

        let affected = manager.remove_user_from_all("alicia");
        assert_eq!(affected.len(), 2);
        assert!(manager.users("#a").is_empty());
        assert_eq!(manager.users("#b"), vec!["bob".to_string()]);
    }

    #[test]
    fn test_prefix_updates() {
        let manager = manager_with_channels(&["#a"]);
        manager.add_user("#a", "bob", &[]);
        manager.update_user_prefix("#a", "bob", '@', true);
        assert!(manager.user_prefixes("#a", "bob").unwrap().contains(&'@'));
        manager.update_user_prefix("#a", "bob", '@', false);
        assert!(manager.user_prefixes("#a", "bob").unwrap().is_empty());
    }

    #[test]
    fn test_join_status_transitions() {
        let manager = manager_with_channels(&[]);
        manager.create_context(
            "#chat",
            ContextType::Channel,
            Some(ChannelJoinStatus::PendingInitialJoin),
        );
        assert_eq!(
            manager.join_status("#chat").unwrap(),
            ChannelJoinStatus::PendingInitialJoin
        );
        manager.set_join_status("#chat", ChannelJoinStatus::FullyJoined);
        manager.add_user("#chat", "x", &[]);
        manager.set_join_status("#chat", ChannelJoinStatus::Parted);
        assert!(manager.users("#chat").is_empty());
    }
}
