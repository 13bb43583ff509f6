//! # IRC Wire Codec
//!
//! Parsing and formatting of IRC protocol lines per RFC 1459/2812 with
//! IRCv3 message tags:
//!
//! ```text
//! [@tags] [:prefix] COMMAND [params...] [:trailing]
//! ```
//!
//! The codec is symmetric: for every parseable line `L`,
//! `format(parse(L))` is semantically equivalent to `L` (tags, prefix,
//! command and params are preserved; whitespace may normalize). Parsing
//! fails only when the command token is absent — anything else degrades
//! gracefully so a single odd line never takes the connection down.
//!
//! CTCP payload handling (including the DCC grammar) lives in
//! [`ctcp`].

pub mod ctcp;

use crate::error::{CoreError, CoreResult};

/// A single IRCv3 message tag (`key` or `key=value`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: Option<String>,
}

/// Message prefix: `servername` or `nick[!user][@host]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    /// Nick, or the server name when no `!`/`@` separators are present.
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl Prefix {
    fn parse(raw: &str) -> Self {
        let (nick_user, host) = match raw.find('@') {
            Some(at) => (&raw[..at], Some(raw[at + 1..].to_string())),
            None => (raw, None),
        };
        let (nick, user) = match nick_user.find('!') {
            Some(bang) => (
                nick_user[..bang].to_string(),
                Some(nick_user[bang + 1..].to_string()),
            ),
            None => (nick_user.to_string(), None),
        };
        Self { nick, user, host }
    }

    /// Full `nick!user@host` form used for ignore-list matching.
    pub fn full_ident(&self) -> String {
        format!(
            "{}!{}@{}",
            self.nick,
            self.user.as_deref().unwrap_or("*"),
            self.host.as_deref().unwrap_or("*")
        )
    }

    fn format(&self) -> String {
        let mut out = self.nick.clone();
        if let Some(ref user) = self.user {
            out.push('!');
            out.push_str(user);
        }
        if let Some(ref host) = self.host {
            out.push('@');
            out.push_str(host);
        }
        out
    }
}

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tags: Vec<Tag>,
    pub prefix: Option<Prefix>,
    /// Command or three-digit numeric, normalized to uppercase.
    pub command: String,
    /// Middle parameters, excluding the trailing parameter.
    pub params: Vec<String>,
    /// Trailing parameter (after ` :`), when present.
    pub trailing: Option<String>,
}

impl Message {
    /// All parameters in order, trailing last.
    pub fn all_params(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.params.iter().map(|s| s.as_str()).collect();
        if let Some(ref t) = self.trailing {
            out.push(t);
        }
        out
    }

    /// Nick of the message source, when a prefix is present.
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix.as_ref().map(|p| p.nick.as_str())
    }

    /// Value of the named message tag, when present with a value.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .and_then(|t| t.value.as_deref())
    }

    /// Numeric command value for three-digit replies.
    pub fn numeric(&self) -> Option<u16> {
        if self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit()) {
            self.command.parse().ok()
        } else {
            None
        }
    }

    /// Parameters with the leading client-nick target stripped, which is
    /// how numeric replies are displayed.
    pub fn display_params(&self) -> Vec<&str> {
        let all = self.all_params();
        if self.numeric().is_some() && !all.is_empty() {
            all[1..].to_vec()
        } else {
            all
        }
    }
}

/// Decode an IRCv3 tag value escape sequence.
fn unescape_tag_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            // Unknown escape: drop the backslash, keep the character.
            Some(other) => out.push(other),
            // Lone trailing backslash is dropped.
            None => {}
        }
    }
    out
}

fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(';')
        .filter(|t| !t.is_empty())
        .map(|t| match t.find('=') {
            Some(eq) => Tag {
                key: t[..eq].to_string(),
                value: Some(unescape_tag_value(&t[eq + 1..])),
            },
            None => Tag {
                key: t.to_string(),
                value: None,
            },
        })
        .collect()
}

/// Parse one IRC line (without its CRLF terminator).
///
/// Fails with [`CoreError::MalformedMessage`] only when no command token
/// is present.
pub fn parse(line: &str) -> CoreResult<Message> {
    let mut rest = line.trim_end_matches(&['\r', '\n'][..]);

    let mut tags = Vec::new();
    if let Some(stripped) = rest.strip_prefix('@') {
        match stripped.split_once(' ') {
            Some((tag_part, remainder)) => {
                tags = parse_tags(tag_part);
                rest = remainder;
            }
            None => {
                return Err(CoreError::MalformedMessage(format!(
                    "tags without command: {line:?}"
                )))
            }
        }
    }

    rest = rest.trim_start_matches(' ');

    let mut prefix = None;
    if let Some(stripped) = rest.strip_prefix(':') {
        match stripped.split_once(' ') {
            Some((prefix_part, remainder)) => {
                prefix = Some(Prefix::parse(prefix_part));
                rest = remainder.trim_start_matches(' ');
            }
            None => {
                return Err(CoreError::MalformedMessage(format!(
                    "prefix without command: {line:?}"
                )))
            }
        }
    }

    // Trailing is everything after the first " :".
    let (middle, trailing) = match rest.find(" :") {
        Some(idx) => (&rest[..idx], Some(rest[idx + 2..].to_string())),
        None => (rest, None),
    };

    let mut words = middle.split(' ').filter(|w| !w.is_empty());
    let command = match words.next() {
        Some(cmd) => cmd.to_ascii_uppercase(),
        None => {
            return Err(CoreError::MalformedMessage(format!(
                "missing command: {line:?}"
            )))
        }
    };
    let params: Vec<String> = words.map(|w| w.to_string()).collect();

    Ok(Message {
        tags,
        prefix,
        command,
        params,
        trailing,
    })
}

/// Format a message back into a wire line (without CRLF).
///
/// Embedded CR/LF anywhere in the message is illegal and rejected. A
/// middle parameter containing a space or a leading `:` is only legal as
/// the final parameter, where it is emitted as trailing.
pub fn format(msg: &Message) -> CoreResult<String> {
    let mut out = String::new();

    let check = |s: &str| -> CoreResult<()> {
        if s.contains('\r') || s.contains('\n') {
            Err(CoreError::MalformedMessage(
                "embedded CR/LF is illegal".to_string(),
            ))
        } else {
            Ok(())
        }
    };

    if !msg.tags.is_empty() {
        out.push('@');
        for (i, tag) in msg.tags.iter().enumerate() {
            if i > 0 {
                out.push(';');
            }
            out.push_str(&tag.key);
            if let Some(ref value) = tag.value {
                out.push('=');
                out.push_str(&escape_tag_value(value));
            }
        }
        out.push(' ');
    }

    if let Some(ref prefix) = msg.prefix {
        check(&prefix.nick)?;
        out.push(':');
        out.push_str(&prefix.format());
        out.push(' ');
    }

    check(&msg.command)?;
    if msg.command.is_empty() {
        return Err(CoreError::MalformedMessage("empty command".to_string()));
    }
    out.push_str(&msg.command);

    let last = msg.params.len().saturating_sub(1);
    for (i, param) in msg.params.iter().enumerate() {
        check(param)?;
        let needs_trailing = param.is_empty() || param.contains(' ') || param.starts_with(':');
        if needs_trailing {
            if i != last || msg.trailing.is_some() {
                return Err(CoreError::MalformedMessage(format!(
                    "param {param:?} must be trailing"
                )));
            }
            out.push_str(" :");
            out.push_str(param);
        } else {
            out.push(' ');
            out.push_str(param);
        }
    }

    if let Some(ref trailing) = msg.trailing {
        check(trailing)?;
        out.push_str(" :");
        out.push_str(trailing);
    }

    Ok(out)
}

// Line builders for the commands the core sends. Each returns a complete
// line without CRLF; the transport adds framing.

pub fn pass(password: &str) -> String {
    format!("PASS :{password}")
}

pub fn nick(nick: &str) -> String {
    format!("NICK {nick}")
}

pub fn user(username: &str, realname: &str) -> String {
    format!("USER {username} 0 * :{realname}")
}

pub fn privmsg(target: &str, text: &str) -> String {
    format!("PRIVMSG {target} :{text}")
}

pub fn notice(target: &str, text: &str) -> String {
    format!("NOTICE {target} :{text}")
}

/// CTCP request carried inside a PRIVMSG.
pub fn ctcp_privmsg(target: &str, payload: &str) -> String {
    format!("PRIVMSG {target} :\u{1}{payload}\u{1}")
}

pub fn join(channel: &str) -> String {
    format!("JOIN {channel}")
}

pub fn part(channel: &str, reason: Option<&str>) -> String {
    match reason {
        Some(r) => format!("PART {channel} :{r}"),
        None => format!("PART {channel}"),
    }
}

pub fn quit(reason: Option<&str>) -> String {
    match reason {
        Some(r) => format!("QUIT :{r}"),
        None => "QUIT".to_string(),
    }
}

pub fn pong(payload: &str) -> String {
    format!("PONG :{payload}")
}

pub fn cap_ls() -> String {
    "CAP LS 302".to_string()
}

pub fn cap_req(caps: &[String]) -> String {
    format!("CAP REQ :{}", caps.join(" "))
}

pub fn cap_end() -> String {
    "CAP END".to_string()
}

pub fn authenticate(payload: &str) -> String {
    format!("AUTHENTICATE {payload}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_line() {
        let msg = parse(
            "@time=2024-01-01T00:00:00Z;account=alice :alice!a@host.net PRIVMSG #chat :hello world",
        )
        .unwrap();
        assert_eq!(msg.tag("time"), Some("2024-01-01T00:00:00Z"));
        assert_eq!(msg.tag("account"), Some("alice"));
        let prefix = msg.prefix.as_ref().unwrap();
        assert_eq!(prefix.nick, "alice");
        assert_eq!(prefix.user.as_deref(), Some("a"));
        assert_eq!(prefix.host.as_deref(), Some("host.net"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chat"]);
        assert_eq!(msg.trailing.as_deref(), Some("hello world"));
    }

    #[test]
    fn test_parse_numeric_display_params() {
        let msg = parse(":irc.net 433 bob bob_ :Nickname is already in use").unwrap();
        assert_eq!(msg.numeric(), Some(433));
        assert_eq!(msg.params, vec!["bob", "bob_"]);
        assert_eq!(msg.display_params(), vec!["bob_", "Nickname is already in use"]);
    }

    #[test]
    fn test_parse_missing_command_fails() {
        assert!(parse("").is_err());
        assert!(parse(":prefix.only").is_err());
        assert!(parse("@tag=1").is_err());
    }

    #[test]
    fn test_tag_value_escapes() {
        let msg = parse("@k=a\\:b\\sc\\\\d\\r\\n PING :x").unwrap();
        assert_eq!(msg.tag("k"), Some("a;b c\\d\r\n"));
        // Escaping round-trips through format.
        let formatted = format(&msg).unwrap();
        let reparsed = parse(&formatted).unwrap();
        assert_eq!(reparsed.tag("k"), msg.tag("k"));
    }

    #[test]
    fn test_format_round_trip() {
        let lines = [
            "PING :irc.example.net",
            ":nick!user@host JOIN #chan",
            ":irc.net 001 alice :Welcome to the network",
            "@a;b=2 :n!u@h PRIVMSG #c :trailing text here",
            "MODE #chan +ov alice bob",
        ];
        for line in lines {
            let msg = parse(line).unwrap();
            let out = format(&msg).unwrap();
            assert_eq!(parse(&out).unwrap(), msg, "round trip failed for {line}");
        }
    }

    #[test]
    fn test_format_rejects_crlf() {
        let msg = Message {
            tags: Vec::new(),
            prefix: None,
            command: "PRIVMSG".to_string(),
            params: vec!["#c".to_string()],
            trailing: Some("evil\r\nQUIT".to_string()),
        };
        assert!(format(&msg).is_err());
    }

    #[test]
    fn test_format_rejects_space_in_middle_param() {
        let msg = Message {
            tags: Vec::new(),
            prefix: None,
            command: "PRIVMSG".to_string(),
            params: vec!["bad target".to_string(), "x".to_string()],
            trailing: None,
        };
        assert!(format(&msg).is_err());
    }

    #[test]
    fn test_builders() {
        assert_eq!(privmsg("#c", "hi"), "PRIVMSG #c :hi");
        assert_eq!(user("alice", "alice"), "USER alice 0 * :alice");
        assert_eq!(cap_req(&["sasl".into(), "server-time".into()]), "CAP REQ :sasl server-time");
        assert_eq!(
            ctcp_privmsg("bob", "DCC SEND f 1 2 3"),
            "PRIVMSG bob :\u{1}DCC SEND f 1 2 3\u{1}"
        );
    }
}
