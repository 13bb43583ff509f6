//! End-to-end registration tests against a scripted IRC server on a
//! loopback listener: CAP/SASL negotiation with auto-join, and automatic
//! nick-collision recovery.

use anyhow::Result;
use rusty_irc_core::{ClientCore, DccConfig, NullSink, ServerConfig};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct FakeServer {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl FakeServer {
    async fn accept(listener: TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> String {
        let mut line = String::new();
        let n = timeout(TEST_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("server read timed out")
            .unwrap();
        assert!(n > 0, "client closed the connection unexpectedly");
        line.trim_end().to_string()
    }

    /// Read lines until one starts with `prefix`, returning it.
    async fn expect(&mut self, prefix: &str) -> String {
        loop {
            let line = self.recv().await;
            if line.starts_with(prefix) {
                return line;
            }
        }
    }
}

fn config_for(listener: &TcpListener, nick: &str) -> ServerConfig {
    let addr = listener.local_addr().unwrap();
    ServerConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        tls: false,
        nick: nick.to_string(),
        username: nick.to_string(),
        realname: nick.to_string(),
        ..Default::default()
    }
}

fn spawn_core(
    config: ServerConfig,
) -> (Arc<ClientCore>, mpsc::UnboundedReceiver<(String, Value)>) {
    let dcc_config = DccConfig {
        enabled: false,
        ..Default::default()
    };
    let core = ClientCore::new(config, dcc_config, Arc::new(NullSink), None);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    core.events.subscribe("*", move |event| {
        let _ = event_tx.send((event.name.clone(), event.payload.clone()));
    });

    let runner = core.clone();
    tokio::spawn(async move { runner.run().await });
    core.connect().unwrap();
    (core, event_rx)
}

async fn wait_for_event(
    rx: &mut mpsc::UnboundedReceiver<(String, Value)>,
    name: &str,
) -> Value {
    loop {
        let (event_name, payload) = timeout(TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if event_name == name {
            return payload;
        }
    }
}

#[tokio::test]
async fn cap_sasl_auto_join_flow() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;

    let mut config = config_for(&listener, "alice");
    config.sasl_username = Some("alice".to_string());
    config.sasl_password = Some("secret".to_string());
    config.desired_caps = vec!["sasl".to_string(), "server-time".to_string()];
    config.initial_channels = vec!["#chat".to_string()];

    let server_task = tokio::spawn(async move {
        let mut server = FakeServer::accept(listener).await;

        let cap_ls = server.expect("CAP LS").await;
        assert_eq!(cap_ls, "CAP LS 302");
        server.send(":irc.test CAP * LS :sasl server-time account-tag").await;

        let cap_req = server.expect("CAP REQ").await;
        assert_eq!(cap_req, "CAP REQ :sasl server-time");
        server.send(":irc.test CAP alice ACK :sasl server-time").await;

        let auth = server.expect("AUTHENTICATE").await;
        assert_eq!(auth, "AUTHENTICATE PLAIN");
        server.send("AUTHENTICATE +").await;

        let response = server.expect("AUTHENTICATE").await;
        assert_eq!(response, "AUTHENTICATE AGFsaWNlAGFsaWNlAHNlY3JldA==");
        server
            .send(":irc.test 903 alice :SASL authentication successful")
            .await;

        server.expect("CAP END").await;
        let nick = server.expect("NICK").await;
        assert_eq!(nick, "NICK alice");
        let user = server.expect("USER").await;
        assert_eq!(user, "USER alice 0 * :alice");
        server.send(":irc.test 001 alice :Welcome to the test network").await;

        let join = server.expect("JOIN").await;
        assert_eq!(join, "JOIN #chat");
        server
            .send(":irc.test 353 alice = #chat :alice @oper +voiced")
            .await;
        server.send(":irc.test 366 alice #chat :End of /NAMES list").await;
    });

    let (core, mut events) = spawn_core(config);

    let registered = wait_for_event(&mut events, "CLIENT_REGISTERED").await;
    assert_eq!(registered["nick"], "alice");

    let joined = wait_for_event(&mut events, "CHANNEL_FULLY_JOINED").await;
    assert_eq!(joined["channel"], "#chat");

    wait_for_event(&mut events, "CLIENT_READY").await;

    let info = core.state.connection_info().unwrap();
    assert!(info.currently_joined_channels.contains("#chat"));
    assert_eq!(
        core.contexts.join_status("#chat").unwrap(),
        rusty_irc_core::ChannelJoinStatus::FullyJoined
    );

    // 353 populated the user list, prefixes stripped.
    let users = core.contexts.users("#chat");
    assert_eq!(users.len(), 3);
    assert!(core.contexts.user_prefixes("#chat", "oper").unwrap().contains(&'@'));

    server_task.await?;
    core.shutdown();
    Ok(())
}

#[tokio::test]
async fn nick_collision_walks_candidates() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let mut config = config_for(&listener, "bob");
    config.desired_caps = Vec::new();

    let server_task = tokio::spawn(async move {
        let mut server = FakeServer::accept(listener).await;

        server.expect("CAP LS").await;
        server.send(":irc.test CAP * LS :multi-prefix").await;

        server.expect("CAP END").await;
        assert_eq!(server.expect("NICK").await, "NICK bob");
        server.expect("USER").await;

        server.send(":irc.test 433 * bob :Nickname is already in use").await;
        assert_eq!(server.expect("NICK").await, "NICK bob_");

        server.send(":irc.test 433 * bob_ :Nickname is already in use").await;
        assert_eq!(server.expect("NICK").await, "NICK bob1");

        server.send(":irc.test 001 bob1 :Welcome").await;
    });

    let (core, mut events) = spawn_core(config);

    let registered = wait_for_event(&mut events, "CLIENT_REGISTERED").await;
    assert_eq!(registered["nick"], "bob1");
    assert_eq!(core.our_nick(), "bob1");
    assert!(core.is_registered());

    server_task.await?;
    core.shutdown();
    Ok(())
}

#[tokio::test]
async fn unparsed_lines_surface_without_killing_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = config_for(&listener, "carol");

    let server_task = tokio::spawn(async move {
        let mut server = FakeServer::accept(listener).await;
        server.expect("CAP LS").await;
        // A line with no command token at all.
        server.send(":only.a.prefix").await;
        server.send(":irc.test CAP * LS :multi-prefix").await;
        server.expect("CAP END").await;
        server.expect("NICK").await;
        server.expect("USER").await;
        server.send(":irc.test 001 carol :Welcome").await;
    });

    let (core, mut events) = spawn_core(config);
    wait_for_event(&mut events, "CLIENT_REGISTERED").await;

    let messages = core.contexts.messages("Status");
    assert!(
        messages.iter().any(|m| m.text.contains("[UNPARSED]")),
        "unparsed marker missing from Status"
    );

    server_task.await.unwrap();
    core.shutdown();
}

#[tokio::test]
async fn ignore_list_suppresses_messages_and_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = config_for(&listener, "dave");
    config.ignore_patterns = vec!["*!*@*.spam.example".to_string()];
    config.initial_channels = vec!["#room".to_string()];

    let server_task = tokio::spawn(async move {
        let mut server = FakeServer::accept(listener).await;
        server.expect("CAP LS").await;
        server.send(":irc.test CAP * LS :multi-prefix").await;
        server.expect("CAP END").await;
        server.expect("NICK").await;
        server.expect("USER").await;
        server.send(":irc.test 001 dave :Welcome").await;
        server.expect("JOIN").await;
        server.send(":irc.test 353 dave = #room :dave").await;
        server.send(":irc.test 366 dave #room :End of /NAMES list").await;
        server
            .send(":troll!x@host.spam.example PRIVMSG #room :buy stuff")
            .await;
        server
            .send(":friend!y@good.example PRIVMSG #room :hello dave")
            .await;
    });

    let (core, mut events) = spawn_core(config);
    wait_for_event(&mut events, "CHANNEL_FULLY_JOINED").await;

    // The friend's message arrives and fires PRIVMSG_RECEIVED; the
    // ignored sender's does not.
    let payload = wait_for_event(&mut events, "PRIVMSG_RECEIVED").await;
    assert_eq!(payload["nick"], "friend");

    let messages = core.contexts.messages("#room");
    assert!(messages.iter().any(|m| m.text.contains("hello dave")));
    assert!(!messages.iter().any(|m| m.text.contains("buy stuff")));

    server_task.await.unwrap();
    core.shutdown();
}

#[tokio::test]
async fn trigger_produces_command_outcome() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = config_for(&listener, "erin");

    let server_task = tokio::spawn(async move {
        let mut server = FakeServer::accept(listener).await;
        server.expect("CAP LS").await;
        server.send(":irc.test CAP * LS :multi-prefix").await;
        server.expect("CAP END").await;
        server.expect("NICK").await;
        server.expect("USER").await;
        server.send(":irc.test 001 erin :Welcome").await;
        server
            .send(":pal!p@h PRIVMSG erin :!ping please")
            .await;
    });

    let dcc_config = DccConfig {
        enabled: false,
        ..Default::default()
    };
    let core = ClientCore::new(config, dcc_config, Arc::new(NullSink), None);
    core.triggers.add_trigger(
        "PRIVMSG_RECEIVED",
        Some("text"),
        "!ping*",
        rusty_irc_core::TriggerAction::Command("PRIVMSG %nick% :pong".to_string()),
    );
    let mut outcomes = core.take_trigger_outcomes().unwrap();

    let runner = core.clone();
    tokio::spawn(async move { runner.run().await });
    core.connect().unwrap();

    let outcome = timeout(TEST_TIMEOUT, outcomes.recv())
        .await
        .expect("timed out waiting for trigger outcome")
        .unwrap();
    match outcome {
        rusty_irc_core::TriggerOutcome::Command(cmd) => {
            assert_eq!(cmd, "PRIVMSG pal :pong");
            core.dispatch_synthesized_raw(&cmd).unwrap();
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    server_task.await.unwrap();
    core.shutdown();
}
