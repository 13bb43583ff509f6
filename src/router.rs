//! # Message Router
//!
//! Dispatches parsed inbound messages to handlers that mutate the state
//! store and context manager and emit events. Registration-phase traffic
//! (CAP/AUTHENTICATE/SASL numerics) is fed to the registration machine
//! first; DCC CTCPs are peeled out of PRIVMSGs before normal text
//! handling.

use crate::client::ClientCore;
use crate::context::{ChannelJoinStatus, ContextType};
use crate::dcc::ctcp_handler;
use crate::sink::ColorKey;
use crate::utils::irc_eq;
use crate::wire::{self, ctcp, Message};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// True for the channel name sigils of RFC 2812.
fn is_channel_name(name: &str) -> bool {
    name.starts_with(&['#', '&', '+', '!'][..])
}

/// Channel user-mode letter → prefix sigil.
fn prefix_for_mode(mode: char) -> Option<char> {
    match mode {
        'o' => Some('@'),
        'v' => Some('+'),
        'h' => Some('%'),
        'a' => Some('&'),
        'q' => Some('~'),
        _ => None,
    }
}

/// Dispatch one parsed inbound message.
pub(crate) async fn dispatch(core: &Arc<ClientCore>, msg: Message, raw: &str) {
    // Registration traffic goes to the state machine first; its actions
    // (lines to send, transitions) are applied by the hub.
    if let Some(info) = core.state.connection_info() {
        let actions = {
            let mut registration = core.registration.lock();
            registration
                .as_mut()
                .map(|machine| machine.on_message(&msg, &info))
                .unwrap_or_default()
        };
        if !actions.is_empty() {
            core.apply_reg_actions(actions).await;
        }
    }

    match msg.command.as_str() {
        "PING" => {
            let payload = msg
                .trailing
                .as_deref()
                .or_else(|| msg.params.first().map(|s| s.as_str()))
                .unwrap_or("");
            let _ = core.transport.send_line(&wire::pong(payload));
        }
        "PRIVMSG" | "NOTICE" => handle_privmsg(core, &msg).await,
        "JOIN" => handle_join(core, &msg),
        "PART" => handle_part(core, &msg),
        "KICK" => handle_kick(core, &msg),
        "QUIT" => handle_quit(core, &msg),
        "NICK" => handle_nick(core, &msg),
        "MODE" => handle_mode(core, &msg),
        "TOPIC" => handle_topic(core, &msg),
        "CAP" | "AUTHENTICATE" => {
            // Consumed by the registration machine above.
        }
        "ERROR" => {
            let reason = msg.trailing.clone().unwrap_or_default();
            core.add_status(&format!("Server error: {reason}"), ColorKey::Error);
        }
        _ => match msg.numeric() {
            Some(numeric) => handle_numeric(core, numeric, &msg, raw).await,
            None => debug!("unhandled command {}: {}", msg.command, raw),
        },
    }
}

async fn handle_privmsg(core: &Arc<ClientCore>, msg: &Message) {
    let Some(prefix) = msg.prefix.clone() else {
        return;
    };
    let sender = prefix.nick.clone();

    // Ignore list: matching messages vanish entirely, events included.
    if core.is_ignored(&prefix.full_ident()) {
        debug!("ignoring message from {}", prefix.full_ident());
        return;
    }

    let target = msg.params.first().cloned().unwrap_or_default();
    let body = msg.trailing.clone().unwrap_or_default();
    let is_notice = msg.command == "NOTICE";

    // One CTCP segment per message body; anything else is plain text.
    if let Some(payload) = ctcp::extract_ctcp(&body) {
        if ctcp::is_dcc(payload) {
            if core.dcc.config().enabled {
                match ctcp_handler::handle_dcc_ctcp(&core.dcc, &sender, payload).await {
                    Ok(summary) => core.add_dcc_message(&summary, ColorKey::Dcc),
                    Err(e) => core.add_dcc_message(&format!("DCC error: {e}"), ColorKey::Error),
                }
                return;
            }
            // DCC disabled: fall through and display as text.
        } else if let Some(action) = payload.strip_prefix("ACTION ") {
            let context = message_context(core, &sender, &target);
            core.add_chat_message(
                &context,
                Some(&sender),
                &format!("* {sender} {action}"),
                ColorKey::Message,
                !is_notice,
            );
            return;
        }
        let context = message_context(core, &sender, &target);
        core.add_chat_message(
            &context,
            Some(&sender),
            &format!("[CTCP {sender}] {payload}"),
            ColorKey::Notice,
            !is_notice,
        );
        return;
    }

    let context = if is_notice && !is_channel_name(&target) {
        // Server and service notices land in Status.
        crate::context::STATUS_CONTEXT.to_string()
    } else {
        message_context(core, &sender, &target)
    };

    let (text, color) = if is_notice {
        (format!("-{sender}- {body}"), ColorKey::Notice)
    } else {
        (format!("<{sender}> {body}"), ColorKey::Message)
    };
    core.add_chat_message(&context, Some(&sender), &text, color, true);

    let event_name = if is_notice {
        "NOTICE_RECEIVED"
    } else {
        "PRIVMSG_RECEIVED"
    };
    let tags: HashMap<&str, Option<&str>> = msg
        .tags
        .iter()
        .map(|t| (t.key.as_str(), t.value.as_deref()))
        .collect();
    core.events.emit(
        event_name,
        json!({
            "nick": sender,
            "ident": prefix.full_ident(),
            "target": target,
            "text": body,
            "tags": tags,
        }),
    );
}

/// Where a PRIVMSG belongs: the channel context for channel targets, a
/// query context named after the peer otherwise.
fn message_context(core: &Arc<ClientCore>, sender: &str, target: &str) -> String {
    if is_channel_name(target) {
        core.contexts
            .create_context(target, ContextType::Channel, None);
        target.to_string()
    } else {
        // Direct message: the context is the remote side. For echoed own
        // messages the remote side is the target, not us.
        let peer = if irc_eq(sender, &core.our_nick()) {
            target
        } else {
            sender
        };
        core.contexts.create_context(peer, ContextType::Query, None);
        peer.to_string()
    }
}

fn join_target(msg: &Message) -> String {
    msg.params
        .first()
        .cloned()
        .or_else(|| msg.trailing.clone())
        .unwrap_or_default()
}

fn handle_join(core: &Arc<ClientCore>, msg: &Message) {
    let Some(nick) = msg.source_nick().map(|s| s.to_string()) else {
        return;
    };
    let channel = join_target(msg);
    if channel.is_empty() {
        return;
    }

    if irc_eq(&nick, &core.our_nick()) {
        core.contexts
            .create_context(&channel, ContextType::Channel, None);
        core.add_message(
            &channel,
            &format!("You have joined {channel}"),
            ColorKey::JoinPart,
        );
    } else {
        core.contexts.add_user(&channel, &nick, &[]);
        core.add_message(
            &channel,
            &format!("{nick} has joined {channel}"),
            ColorKey::JoinPart,
        );
        core.events.emit(
            "USER_JOIN",
            json!({"nick": nick, "channel": channel}),
        );
    }
}

fn handle_part(core: &Arc<ClientCore>, msg: &Message) {
    let Some(nick) = msg.source_nick().map(|s| s.to_string()) else {
        return;
    };
    let channel = join_target(msg);
    let reason = msg.trailing.clone().unwrap_or_default();

    if irc_eq(&nick, &core.our_nick()) {
        core.contexts
            .set_join_status(&channel, ChannelJoinStatus::Parted);
        core.state.mark_channel_left(&channel);
        core.add_message(&channel, &format!("You have left {channel}"), ColorKey::JoinPart);
    } else {
        core.contexts.remove_user(&channel, &nick);
        let text = if reason.is_empty() {
            format!("{nick} has left {channel}")
        } else {
            format!("{nick} has left {channel} ({reason})")
        };
        core.add_message(&channel, &text, ColorKey::JoinPart);
        core.events.emit(
            "USER_PART",
            json!({"nick": nick, "channel": channel, "reason": reason}),
        );
    }
}

fn handle_kick(core: &Arc<ClientCore>, msg: &Message) {
    let channel = msg.params.first().cloned().unwrap_or_default();
    let victim = msg.params.get(1).cloned().unwrap_or_default();
    let reason = msg.trailing.clone().unwrap_or_default();
    let kicker = msg.source_nick().unwrap_or("server").to_string();

    if irc_eq(&victim, &core.our_nick()) {
        core.contexts
            .set_join_status(&channel, ChannelJoinStatus::Parted);
        core.state.mark_channel_left(&channel);
        core.add_message(
            &channel,
            &format!("You were kicked from {channel} by {kicker} ({reason})"),
            ColorKey::Error,
        );
    } else {
        core.contexts.remove_user(&channel, &victim);
        core.add_message(
            &channel,
            &format!("{victim} was kicked by {kicker} ({reason})"),
            ColorKey::JoinPart,
        );
    }
}

fn handle_quit(core: &Arc<ClientCore>, msg: &Message) {
    let Some(nick) = msg.source_nick().map(|s| s.to_string()) else {
        return;
    };
    let reason = msg.trailing.clone().unwrap_or_default();
    let affected = core.contexts.remove_user_from_all(&nick);
    for channel in &affected {
        let text = if reason.is_empty() {
            format!("{nick} has quit")
        } else {
            format!("{nick} has quit ({reason})")
        };
        core.add_message(channel, &text, ColorKey::JoinPart);
    }
    core.events.emit(
        "USER_QUIT",
        json!({"nick": nick, "reason": reason, "channels": affected}),
    );
}

fn handle_nick(core: &Arc<ClientCore>, msg: &Message) {
    let Some(old_nick) = msg.source_nick().map(|s| s.to_string()) else {
        return;
    };
    let new_nick = msg
        .params
        .first()
        .cloned()
        .or_else(|| msg.trailing.clone())
        .unwrap_or_default();
    if new_nick.is_empty() {
        return;
    }

    let affected = core.contexts.rename_user(&old_nick, &new_nick);
    for channel in &affected {
        core.add_message(
            channel,
            &format!("{old_nick} is now known as {new_nick}"),
            ColorKey::NickChange,
        );
    }

    if irc_eq(&old_nick, &core.our_nick()) {
        core.confirm_own_nick(&new_nick);
        core.add_status(
            &format!("You are now known as {new_nick}"),
            ColorKey::NickChange,
        );
    }
    core.events.emit(
        "USER_NICK_CHANGED",
        json!({"old_nick": old_nick, "new_nick": new_nick, "channels": affected}),
    );
}

fn handle_mode(core: &Arc<ClientCore>, msg: &Message) {
    let target = msg.params.first().cloned().unwrap_or_default();
    if !is_channel_name(&target) {
        return;
    }
    let Some(modes) = msg.params.get(1) else {
        return;
    };
    let mut args = msg.params.iter().skip(2);
    let mut grant = true;
    for mode in modes.chars() {
        match mode {
            '+' => grant = true,
            '-' => grant = false,
            _ => {
                if let Some(prefix) = prefix_for_mode(mode) {
                    if let Some(nick) = args.next() {
                        core.contexts
                            .update_user_prefix(&target, nick, prefix, grant);
                    }
                }
            }
        }
    }
    let setter = msg.source_nick().unwrap_or("server");
    core.add_message(
        &target,
        &format!("{} sets mode {}", setter, msg.params[1..].join(" ")),
        ColorKey::System,
    );
}

fn handle_topic(core: &Arc<ClientCore>, msg: &Message) {
    let channel = msg.params.first().cloned().unwrap_or_default();
    let topic = msg.trailing.clone().unwrap_or_default();
    let setter = msg.source_nick().unwrap_or("server").to_string();
    core.contexts.update_topic(&channel, Some(topic.clone()));
    core.add_message(
        &channel,
        &format!("{setter} changed the topic to: {topic}"),
        ColorKey::Topic,
    );
    core.events.emit(
        "CHANNEL_TOPIC_CHANGED",
        json!({"channel": channel, "topic": topic, "setter": setter}),
    );
}

async fn handle_numeric(core: &Arc<ClientCore>, numeric: u16, msg: &Message, raw: &str) {
    let tags: HashMap<&str, Option<&str>> = msg
        .tags
        .iter()
        .map(|t| (t.key.as_str(), t.value.as_deref()))
        .collect();
    core.events.emit(
        "RAW_IRC_NUMERIC",
        json!({
            "numeric": numeric,
            "params": msg.params,
            "display_params": msg.display_params(),
            "trailing": msg.trailing,
            "tags": tags,
        }),
    );

    let display = msg.display_params().join(" ");
    match numeric {
        1 => {
            // The REGISTERED transition and auto-join already ran off the
            // machine's Registered action; emit the event and surface the
            // welcome text.
            core.events.emit(
                "CLIENT_REGISTERED",
                json!({
                    "nick": msg.params.first(),
                    "server_message": msg.trailing,
                    "raw_line": raw,
                }),
            );
            core.add_status(
                msg.trailing.as_deref().unwrap_or("Welcome"),
                ColorKey::System,
            );
        }
        // Topic replies.
        331 => {
            let channel = msg.display_params().first().map(|s| s.to_string());
            if let Some(channel) = channel {
                core.contexts.update_topic(&channel, None);
                core.add_message(&channel, "No topic is set", ColorKey::Topic);
            }
        }
        332 => {
            let channel = msg.display_params().first().map(|s| s.to_string());
            let topic = msg.trailing.clone().unwrap_or_default();
            if let Some(channel) = channel {
                core.contexts.update_topic(&channel, Some(topic.clone()));
                core.add_message(&channel, &format!("Topic: {topic}"), ColorKey::Topic);
            }
        }
        // Name replies drive the join state machine.
        353 => handle_namreply(core, msg),
        366 => handle_endofnames(core, msg),
        // WHO / WHOIS / WHOWAS streams are informational.
        352 | 315 | 311 | 318 | 314 | 369 => {
            core.add_status(&display, ColorKey::System);
        }
        // LIST stream goes to the list-results context when one is set.
        321 | 322 | 323 => {
            let target = core
                .active_list_context
                .read()
                .clone()
                .unwrap_or_else(|| crate::context::STATUS_CONTEXT.to_string());
            let text = match numeric {
                321 => "Channel list:".to_string(),
                323 => {
                    let done = "End of channel list".to_string();
                    core.active_list_context.write().take();
                    done
                }
                _ => {
                    let trailing = msg.trailing.as_deref().unwrap_or("");
                    format!("{display} {trailing}")
                }
            };
            core.add_message(&target, &text, ColorKey::System);
        }
        // Join failures are terminal for the channel's state machine.
        403 | 471 | 473 | 474 | 475 => {
            let channel = msg.display_params().first().map(|s| s.to_string());
            let reason = msg.trailing.clone().unwrap_or_else(|| "join failed".to_string());
            if let Some(channel) = channel {
                if core.contexts.join_status(&channel).is_some() {
                    core.contexts
                        .set_join_status(&channel, ChannelJoinStatus::JoinFailed);
                    core.state.mark_channel_left(&channel);
                }
                core.add_status(
                    &format!("Cannot join {channel}: {reason}"),
                    ColorKey::Error,
                );
                core.check_ready();
            } else {
                core.add_status(&format!("Error: {reason}"), ColorKey::Error);
            }
        }
        401 => {
            core.add_status(&format!("No such nick: {display}"), ColorKey::Error);
        }
        433 => {
            let failed = msg.display_params().first().map(|s| s.to_string());
            if let Some(failed) = failed {
                core.add_status(
                    &format!("Nickname {failed} is already in use"),
                    ColorKey::Error,
                );
            }
            core.clear_user_nick_attempt(msg);
        }
        432 | 436 => {
            core.add_status(
                &format!("Nickname error: {}", msg.trailing.as_deref().unwrap_or(&display)),
                ColorKey::Error,
            );
        }
        // SASL family: outcomes come from the machine; surface the text.
        900 | 902..=908 => {
            let text = msg.trailing.clone().unwrap_or(display);
            let color = if matches!(numeric, 903 | 900 | 907) {
                ColorKey::System
            } else {
                ColorKey::Warning
            };
            core.add_status(&text, color);
        }
        // Informational block: LUSERS, MOTD and friends.
        251..=266 | 372 | 375 | 376 => {
            let text = msg.trailing.clone().unwrap_or(display);
            core.add_status(&text, ColorKey::System);
        }
        other => {
            debug!("numeric {} -> Status: {}", other, raw);
            let text = msg.trailing.as_deref().unwrap_or(&display);
            core.add_status(&format!("[{other}] {text}"), ColorKey::System);
        }
    }
}

/// RPL_NAMREPLY: `<me> <symbol> <channel> :[prefix]nick ...`
fn handle_namreply(core: &Arc<ClientCore>, msg: &Message) {
    let channel = msg
        .params
        .iter()
        .rev()
        .find(|p| is_channel_name(p))
        .cloned()
        .unwrap_or_default();
    if channel.is_empty() {
        return;
    }
    core.contexts
        .create_context(&channel, ContextType::Channel, None);

    if matches!(
        core.contexts.join_status(&channel),
        Some(ChannelJoinStatus::PendingInitialJoin)
            | Some(ChannelJoinStatus::JoinCommandSent)
            | Some(ChannelJoinStatus::NotJoined)
    ) {
        core.contexts
            .set_join_status(&channel, ChannelJoinStatus::SelfJoinReceived);
    }

    for entry in msg
        .trailing
        .as_deref()
        .unwrap_or("")
        .split_ascii_whitespace()
    {
        let prefixes: Vec<char> = entry
            .chars()
            .take_while(|c| matches!(c, '@' | '+' | '%' | '&' | '~'))
            .collect();
        let nick = &entry[prefixes.len()..];
        if !nick.is_empty() {
            core.contexts.add_user(&channel, nick, &prefixes);
        }
    }
}

/// RPL_ENDOFNAMES completes the join handshake.
fn handle_endofnames(core: &Arc<ClientCore>, msg: &Message) {
    let channel = msg
        .display_params()
        .first()
        .map(|s| s.to_string())
        .unwrap_or_default();
    if channel.is_empty() {
        return;
    }
    let was_joining = !matches!(
        core.contexts.join_status(&channel),
        Some(ChannelJoinStatus::FullyJoined)
    );
    core.contexts
        .set_join_status(&channel, ChannelJoinStatus::FullyJoined);
    core.state.mark_channel_joined(&channel);
    if was_joining {
        let users = core.contexts.users(&channel).len();
        core.add_message(
            &channel,
            &format!("Joined {channel} ({users} users)"),
            ColorKey::JoinPart,
        );
        core.events
            .emit("CHANNEL_FULLY_JOINED", json!({"channel": channel}));
    }
    core.check_ready();
}

