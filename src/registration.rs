//! # Capability, SASL and Registration State Machine
//!
//! Drives the connection from TCP establishment to RPL_WELCOME:
//!
//! ```text
//! IDLE → CAP_LS_SENT → CAP_REQ_SENT → (SASL_AUTHENTICATING →)?
//!      → CAP_END_SENT → NICK_SENT → USER_SENT → WAITING_WELCOME → REGISTERED
//! ```
//!
//! The machine is pure: inputs are inbound messages, outputs are
//! [`RegAction`] values the client hub executes (lines to send, state
//! transitions, abort requests). This keeps the whole negotiation
//! unit-testable without sockets.
//!
//! Negotiation policy: `CAP LS 302`, request the intersection of server
//! and desired capabilities, run SASL PLAIN (or EXTERNAL under a TLS
//! client certificate) when requested and credentialed, then `CAP END`
//! and `NICK`/`USER`.

use crate::state::ConnectionInfo;
use crate::wire::{self, Message};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Maximum nick length sent during automatic collision recovery.
const MAX_NICK_LEN: usize = 9;

/// SASL AUTHENTICATE payload chunk size per the IRCv3 spec.
const SASL_CHUNK: usize = 400;

/// Registration phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegPhase {
    Idle,
    CapLsSent,
    CapReqSent,
    SaslAuthenticating,
    CapEndSent,
    NickSent,
    UserSent,
    WaitingWelcome,
    Registered,
}

/// SASL mechanisms the machine can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    External,
}

/// Output of the machine, executed by the client hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegAction {
    /// Send this raw line to the server.
    Send(String),
    /// SASL finished; `true` on 903/907.
    SaslCompleted(bool),
    /// 001 arrived; the connection is registered under `nick`.
    Registered { nick: String },
    /// Fatal failure; the hub should disconnect with this reason.
    Abort(String),
    /// The automatic nick-collision retry chose a new nick.
    NickRetry(String),
}

/// Compute the next automatic nick candidate after a 433 collision.
///
/// Policy: first collision with the initial nick appends `_`; a trailing
/// `_` becomes `1`; a trailing digit increments; anything else appends
/// `_`. The result is clamped to nine characters.
pub fn next_nick_candidate(current: &str, initial: &str) -> String {
    let last_digit = current
        .chars()
        .last()
        .filter(|c| c.is_ascii_digit())
        .and_then(|c| c.to_digit(10));
    let mut candidate = if current.eq_ignore_ascii_case(initial) {
        format!("{initial}_")
    } else if let Some(stripped) = current.strip_suffix('_') {
        format!("{stripped}1")
    } else if let Some(digit) = last_digit {
        let base = &current[..current.len() - 1];
        format!("{}{}", base, digit + 1)
    } else {
        format!("{current}_")
    };
    candidate.truncate(MAX_NICK_LEN);
    candidate
}

/// Encode the SASL PLAIN initial response for `user`/`pass`.
fn sasl_plain_payload(user: &str, pass: &str) -> String {
    base64::encode(format!("\u{0}{user}\u{0}{user}\u{0}{pass}"))
}

/// Split a base64 payload into AUTHENTICATE lines. An empty payload, or
/// a final chunk of exactly 400 bytes, is terminated with a lone `+`.
fn chunk_authenticate(payload: &str) -> Vec<String> {
    if payload.is_empty() {
        return vec![wire::authenticate("+")];
    }
    let bytes = payload.as_bytes();
    let mut lines = Vec::new();
    for chunk in bytes.chunks(SASL_CHUNK) {
        // base64 is ASCII, so the chunk boundary is always a char boundary
        lines.push(wire::authenticate(std::str::from_utf8(chunk).unwrap_or("")));
    }
    if bytes.len() % SASL_CHUNK == 0 {
        lines.push(wire::authenticate("+"));
    }
    lines
}

/// The registration driver for one connection attempt.
pub struct RegistrationMachine {
    phase: RegPhase,
    /// Nick configured before any collision handling.
    initial_nick: String,
    current_nick: String,
    /// Capabilities the server advertised in CAP LS.
    server_caps: HashSet<String>,
    /// Capabilities acknowledged by the server.
    enabled_caps: HashSet<String>,
    /// Accumulates multiline CAP LS output until the final line.
    ls_accumulator: Vec<String>,
    sasl_mechanism: SaslMechanism,
    sasl_completed: bool,
}

impl RegistrationMachine {
    pub fn new(info: &ConnectionInfo) -> Self {
        // EXTERNAL relies on a TLS client certificate: selected when a SASL
        // identity is configured without a password over TLS.
        let mechanism = if info.tls && info.sasl_username.is_some() && info.sasl_password.is_none()
        {
            SaslMechanism::External
        } else {
            SaslMechanism::Plain
        };
        Self {
            phase: RegPhase::Idle,
            initial_nick: info.nick.clone(),
            current_nick: info.nick.clone(),
            server_caps: HashSet::new(),
            enabled_caps: HashSet::new(),
            ls_accumulator: Vec::new(),
            sasl_mechanism: mechanism,
            sasl_completed: false,
        }
    }

    pub fn phase(&self) -> RegPhase {
        self.phase
    }

    pub fn is_registered(&self) -> bool {
        self.phase == RegPhase::Registered
    }

    pub fn sasl_completed(&self) -> bool {
        self.sasl_completed
    }

    pub fn enabled_caps(&self) -> &HashSet<String> {
        &self.enabled_caps
    }

    pub fn current_nick(&self) -> &str {
        &self.current_nick
    }

    /// The transport connected; begin negotiation.
    pub fn on_connected(&mut self, info: &ConnectionInfo) -> Vec<RegAction> {
        let mut actions = Vec::new();
        if let Some(ref pass) = info.server_password {
            actions.push(RegAction::Send(wire::pass(pass)));
        }
        actions.push(RegAction::Send(wire::cap_ls()));
        self.phase = RegPhase::CapLsSent;
        actions
    }

    /// Feed one inbound message; returns the actions it provokes.
    pub fn on_message(&mut self, msg: &Message, info: &ConnectionInfo) -> Vec<RegAction> {
        match msg.command.as_str() {
            "CAP" => self.on_cap(msg, info),
            "AUTHENTICATE" => self.on_authenticate_challenge(msg, info),
            _ => match msg.numeric() {
                Some(1) => self.on_welcome(msg),
                Some(903) | Some(907) => self.on_sasl_result(true, info, msg),
                Some(902) | Some(904) | Some(905) | Some(906) | Some(908) => {
                    self.on_sasl_result(false, info, msg)
                }
                Some(900) => {
                    debug!("SASL logged in: {:?}", msg.trailing);
                    Vec::new()
                }
                Some(433) => self.on_nick_in_use(msg, info),
                Some(432) | Some(436) => self.on_bad_nick(msg),
                _ => Vec::new(),
            },
        }
    }

    fn on_cap(&mut self, msg: &Message, info: &ConnectionInfo) -> Vec<RegAction> {
        // CAP <target> <subcommand> [*] :<caps>
        let sub = msg.params.get(1).map(|s| s.as_str()).unwrap_or("");
        let caps_line = msg.trailing.clone().unwrap_or_default();
        match sub {
            "LS" => {
                let more = msg.params.get(2).map(|p| p == "*").unwrap_or(false);
                self.ls_accumulator.push(caps_line);
                if more {
                    return Vec::new();
                }
                for line in std::mem::take(&mut self.ls_accumulator) {
                    for cap in line.split_ascii_whitespace() {
                        // Values like sasl=PLAIN,EXTERNAL carry a suffix.
                        let name = cap.split('=').next().unwrap_or(cap);
                        self.server_caps.insert(name.to_string());
                    }
                }
                let mut wanted: Vec<String> = info
                    .desired_caps
                    .iter()
                    .filter(|c| self.server_caps.contains(*c))
                    .cloned()
                    .collect();
                wanted.sort();
                if wanted.is_empty() {
                    info!("no desired capabilities offered; registering");
                    return self.cap_end_and_register(info);
                }
                self.phase = RegPhase::CapReqSent;
                vec![RegAction::Send(wire::cap_req(&wanted))]
            }
            "ACK" => {
                for cap in caps_line.split_ascii_whitespace() {
                    self.enabled_caps.insert(cap.to_string());
                }
                let can_auth = info.has_sasl_credentials()
                    || self.sasl_mechanism == SaslMechanism::External;
                if self.enabled_caps.contains("sasl") && can_auth {
                    self.phase = RegPhase::SaslAuthenticating;
                    let mech = match self.sasl_mechanism {
                        SaslMechanism::Plain => "PLAIN",
                        SaslMechanism::External => "EXTERNAL",
                    };
                    vec![RegAction::Send(wire::authenticate(mech))]
                } else {
                    self.cap_end_and_register(info)
                }
            }
            "NAK" => {
                warn!("server refused capabilities: {}", caps_line);
                self.cap_end_and_register(info)
            }
            "NEW" => {
                // Post-registration: request newly advertised desired caps.
                let mut wanted = Vec::new();
                for cap in caps_line.split_ascii_whitespace() {
                    let name = cap.split('=').next().unwrap_or(cap).to_string();
                    self.server_caps.insert(name.clone());
                    if info.desired_caps.contains(&name) && !self.enabled_caps.contains(&name) {
                        wanted.push(name);
                    }
                }
                if wanted.is_empty() {
                    Vec::new()
                } else {
                    wanted.sort();
                    vec![RegAction::Send(wire::cap_req(&wanted))]
                }
            }
            "DEL" => {
                for cap in caps_line.split_ascii_whitespace() {
                    self.server_caps.remove(cap);
                    self.enabled_caps.remove(cap);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_authenticate_challenge(
        &mut self,
        msg: &Message,
        info: &ConnectionInfo,
    ) -> Vec<RegAction> {
        if self.phase != RegPhase::SaslAuthenticating {
            return Vec::new();
        }
        let challenge = msg
            .params
            .first()
            .map(|s| s.as_str())
            .or(msg.trailing.as_deref())
            .unwrap_or("");
        if challenge != "+" {
            debug!("unexpected AUTHENTICATE challenge: {challenge:?}");
        }
        match self.sasl_mechanism {
            SaslMechanism::Plain => {
                let user = info.sasl_username.clone().unwrap_or_default();
                let pass = info.sasl_password.clone().unwrap_or_default();
                chunk_authenticate(&sasl_plain_payload(&user, &pass))
                    .into_iter()
                    .map(RegAction::Send)
                    .collect()
            }
            // EXTERNAL: identity comes from the TLS client certificate.
            SaslMechanism::External => vec![RegAction::Send(wire::authenticate("+"))],
        }
    }

    fn on_sasl_result(
        &mut self,
        success: bool,
        info: &ConnectionInfo,
        msg: &Message,
    ) -> Vec<RegAction> {
        if self.phase != RegPhase::SaslAuthenticating {
            return Vec::new();
        }
        self.sasl_completed = success;
        let mut actions = vec![RegAction::SaslCompleted(success)];
        if success {
            info!("SASL authentication succeeded");
            actions.extend(self.cap_end_and_register(info));
        } else {
            let reason = msg
                .trailing
                .clone()
                .unwrap_or_else(|| "SASL authentication failed".to_string());
            warn!("SASL failed: {}", reason);
            if info.sasl_abort_on_fail {
                actions.push(RegAction::Abort(reason));
            } else {
                actions.extend(self.cap_end_and_register(info));
            }
        }
        actions
    }

    fn cap_end_and_register(&mut self, info: &ConnectionInfo) -> Vec<RegAction> {
        self.phase = RegPhase::WaitingWelcome;
        vec![
            RegAction::Send(wire::cap_end()),
            RegAction::Send(wire::nick(&self.current_nick)),
            RegAction::Send(wire::user(&info.username, &info.realname)),
        ]
    }

    fn on_welcome(&mut self, msg: &Message) -> Vec<RegAction> {
        // The target of 001 is the nick the server registered us under.
        if let Some(confirmed) = msg.params.first() {
            self.current_nick = confirmed.clone();
        }
        self.phase = RegPhase::Registered;
        vec![RegAction::Registered {
            nick: self.current_nick.clone(),
        }]
    }

    fn on_nick_in_use(&mut self, msg: &Message, info: &ConnectionInfo) -> Vec<RegAction> {
        let failed = msg
            .params
            .get(1)
            .cloned()
            .unwrap_or_else(|| self.current_nick.clone());

        // A user-initiated change in flight is not ours to retry.
        if let Some(ref attempted) = info.last_attempted_nick_change {
            if attempted.eq_ignore_ascii_case(&failed) {
                return Vec::new();
            }
        }
        // Only the nick we are currently trying provokes a retry; stale
        // duplicates for an earlier candidate are ignored, which is what
        // stops a cascade of automatic changes.
        if !failed.eq_ignore_ascii_case(&self.current_nick) {
            return Vec::new();
        }

        let candidate = next_nick_candidate(&self.current_nick, &self.initial_nick);
        info!("nick {} in use, trying {}", failed, candidate);
        self.current_nick = candidate.clone();
        vec![
            RegAction::NickRetry(candidate.clone()),
            RegAction::Send(wire::nick(&candidate)),
        ]
    }

    fn on_bad_nick(&mut self, msg: &Message) -> Vec<RegAction> {
        let reason = msg
            .trailing
            .clone()
            .unwrap_or_else(|| "erroneous nickname".to_string());
        if self.phase == RegPhase::Registered {
            return Vec::new();
        }
        vec![RegAction::Abort(format!("registration failed: {reason}"))]
    }

    /// A NICK echo for ourselves confirms the change.
    pub fn on_own_nick_confirmed(&mut self, new_nick: &str) {
        self.current_nick = new_nick.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::wire::parse;

    fn info_with(nick: &str, sasl: bool) -> ConnectionInfo {
        let config = ServerConfig {
            host: "irc.example.net".to_string(),
            nick: nick.to_string(),
            sasl_username: sasl.then(|| "alice".to_string()),
            sasl_password: sasl.then(|| "secret".to_string()),
            desired_caps: vec!["sasl".to_string(), "server-time".to_string()],
            ..Default::default()
        };
        ConnectionInfo::from_config(&config)
    }

    fn sends(actions: &[RegAction]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                RegAction::Send(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_nick_candidates() {
        assert_eq!(next_nick_candidate("bob", "bob"), "bob_");
        assert_eq!(next_nick_candidate("bob_", "bob"), "bob1");
        assert_eq!(next_nick_candidate("bob1", "bob"), "bob2");
        assert_eq!(next_nick_candidate("carol", "bob"), "carol_");
        // Truncated to nine characters.
        assert_eq!(next_nick_candidate("verylongnick", "verylongnick").len(), 9);
    }

    #[test]
    fn test_sasl_plain_payload_matches_rfc_example() {
        assert_eq!(
            sasl_plain_payload("alice", "secret"),
            "AGFsaWNlAGFsaWNlAHNlY3JldA=="
        );
    }

    #[test]
    fn test_chunking_terminator() {
        let exactly = "A".repeat(400);
        let lines = chunk_authenticate(&exactly);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "AUTHENTICATE +");

        let short = "A".repeat(399);
        assert_eq!(chunk_authenticate(&short).len(), 1);

        assert_eq!(chunk_authenticate(""), vec!["AUTHENTICATE +"]);
    }

    #[test]
    fn test_full_sasl_negotiation() {
        let info = info_with("alice", true);
        let mut machine = RegistrationMachine::new(&info);

        let actions = machine.on_connected(&info);
        assert_eq!(sends(&actions), vec!["CAP LS 302"]);

        let ls = parse(":irc.net CAP * LS :sasl server-time echo-message").unwrap();
        let actions = machine.on_message(&ls, &info);
        assert_eq!(sends(&actions), vec!["CAP REQ :sasl server-time"]);

        let ack = parse(":irc.net CAP alice ACK :sasl server-time").unwrap();
        let actions = machine.on_message(&ack, &info);
        assert_eq!(sends(&actions), vec!["AUTHENTICATE PLAIN"]);
        assert_eq!(machine.phase(), RegPhase::SaslAuthenticating);

        let challenge = parse("AUTHENTICATE +").unwrap();
        let actions = machine.on_message(&challenge, &info);
        assert_eq!(
            sends(&actions),
            vec!["AUTHENTICATE AGFsaWNlAGFsaWNlAHNlY3JldA=="]
        );

        let ok = parse(":irc.net 903 alice :SASL authentication successful").unwrap();
        let actions = machine.on_message(&ok, &info);
        assert!(actions.contains(&RegAction::SaslCompleted(true)));
        assert_eq!(
            sends(&actions),
            vec!["CAP END", "NICK alice", "USER alice 0 * :alice"]
        );

        let welcome = parse(":irc.net 001 alice :Welcome to the network").unwrap();
        let actions = machine.on_message(&welcome, &info);
        assert_eq!(
            actions,
            vec![RegAction::Registered {
                nick: "alice".to_string()
            }]
        );
        assert!(machine.is_registered());
        assert!(machine.sasl_completed());
    }

    #[test]
    fn test_multiline_cap_ls() {
        let info = info_with("alice", false);
        let mut machine = RegistrationMachine::new(&info);
        machine.on_connected(&info);

        let first = parse(":irc.net CAP * LS * :account-tag batch").unwrap();
        assert!(machine.on_message(&first, &info).is_empty());
        let last = parse(":irc.net CAP * LS :server-time").unwrap();
        let actions = machine.on_message(&last, &info);
        assert_eq!(sends(&actions), vec!["CAP REQ :server-time"]);
    }

    #[test]
    fn test_no_overlap_goes_straight_to_register() {
        let info = info_with("alice", false);
        let mut machine = RegistrationMachine::new(&info);
        machine.on_connected(&info);

        let ls = parse(":irc.net CAP * LS :batch chghost").unwrap();
        let actions = machine.on_message(&ls, &info);
        assert_eq!(
            sends(&actions),
            vec!["CAP END", "NICK alice", "USER alice 0 * :alice"]
        );
    }

    #[test]
    fn test_sasl_failure_continues_without_auth() {
        let info = info_with("alice", true);
        let mut machine = RegistrationMachine::new(&info);
        machine.on_connected(&info);
        machine.on_message(&parse(":irc.net CAP * LS :sasl").unwrap(), &info);
        machine.on_message(&parse(":irc.net CAP alice ACK :sasl").unwrap(), &info);

        let fail = parse(":irc.net 904 alice :SASL authentication failed").unwrap();
        let actions = machine.on_message(&fail, &info);
        assert!(actions.contains(&RegAction::SaslCompleted(false)));
        assert!(sends(&actions).contains(&"CAP END".to_string()));
        assert!(!actions.iter().any(|a| matches!(a, RegAction::Abort(_))));
    }

    #[test]
    fn test_sasl_failure_aborts_when_configured() {
        let mut info = info_with("alice", true);
        info.sasl_abort_on_fail = true;
        let mut machine = RegistrationMachine::new(&info);
        machine.on_connected(&info);
        machine.on_message(&parse(":irc.net CAP * LS :sasl").unwrap(), &info);
        machine.on_message(&parse(":irc.net CAP alice ACK :sasl").unwrap(), &info);

        let fail = parse(":irc.net 904 alice :SASL authentication failed").unwrap();
        let actions = machine.on_message(&fail, &info);
        assert!(actions.iter().any(|a| matches!(a, RegAction::Abort(_))));
    }

    #[test]
    fn test_nick_collision_sequence() {
        let info = info_with("bob", false);
        let mut machine = RegistrationMachine::new(&info);
        machine.on_connected(&info);
        machine.on_message(&parse(":irc.net CAP * LS :batch").unwrap(), &info);

        let in_use = parse(":irc.net 433 * bob :Nickname is already in use").unwrap();
        let actions = machine.on_message(&in_use, &info);
        assert_eq!(sends(&actions), vec!["NICK bob_"]);

        // A duplicate 433 for the superseded candidate is ignored.
        assert!(machine.on_message(&in_use, &info).is_empty());

        // The next collision walks the candidate sequence: bob_ -> bob1.
        let again = parse(":irc.net 433 * bob_ :Nickname is already in use").unwrap();
        let actions = machine.on_message(&again, &info);
        assert_eq!(sends(&actions), vec!["NICK bob1"]);
    }

    #[test]
    fn test_user_initiated_change_not_retried() {
        let mut info = info_with("bob", false);
        info.last_attempted_nick_change = Some("taken".to_string());
        let mut machine = RegistrationMachine::new(&info);
        let in_use = parse(":irc.net 433 bob taken :Nickname is already in use").unwrap();
        assert!(machine.on_message(&in_use, &info).is_empty());
    }

    #[test]
    fn test_cap_new_requests_desired() {
        let info = info_with("alice", false);
        let mut machine = RegistrationMachine::new(&info);
        machine.on_connected(&info);
        machine.on_message(&parse(":irc.net CAP * LS :batch").unwrap(), &info);
        machine.on_message(&parse(":irc.net 001 alice :hi").unwrap(), &info);

        let new = parse(":irc.net CAP alice NEW :server-time").unwrap();
        let actions = machine.on_message(&new, &info);
        assert_eq!(sends(&actions), vec!["CAP REQ :server-time"]);
    }
}
