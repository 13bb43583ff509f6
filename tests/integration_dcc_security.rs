//! DCC security and lifecycle properties: download-directory containment,
//! blocked extensions, strict ACCEPT correlation, and table cleanup.

use parking_lot::Mutex;
use rusty_irc_core::{
    CoreError, DccConfig, DccEngine, DccTransferStatus, EventBus, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn engine_with(
    config: DccConfig,
) -> (Arc<DccEngine>, Arc<EventBus>, Arc<Mutex<Vec<String>>>) {
    let events = Arc::new(EventBus::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    events.subscribe("*", move |event| {
        seen_clone.lock().push(event.name.clone());
    });

    // The transport is never connected in these tests; outgoing CTCP
    // lines just sit in its queue.
    let (event_tx, _event_rx) = mpsc::channel(16);
    let transport = Transport::spawn(
        event_tx,
        Duration::from_secs(1),
        Duration::from_secs(1),
    );
    let engine = DccEngine::new(config, events.clone(), transport);
    (engine, events, seen)
}

fn test_config(dir: &std::path::Path) -> DccConfig {
    DccConfig {
        download_dir: dir.to_path_buf(),
        advertised_ip: Some("127.0.0.1".to_string()),
        port_range_start: 0,
        port_range_end: 0,
        timeout_secs: 2,
        ..Default::default()
    }
}

#[cfg(unix)]
#[tokio::test]
async fn offer_resolving_outside_download_dir_is_refused() {
    let download_dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();

    // A symlink planted inside the download directory pointing out of it.
    let target = outside.path().join("passwd");
    std::fs::write(&target, b"root:x:0:0").unwrap();
    std::os::unix::fs::symlink(&target, download_dir.path().join("passwd")).unwrap();

    let (engine, _events, seen) = engine_with(test_config(download_dir.path()));

    // "../../etc/passwd" sanitizes to "passwd", which resolves outside.
    let result = engine
        .accept_offer(
            "attacker",
            "../../etc/passwd",
            "127.0.0.1".parse().unwrap(),
            1,
            10,
        )
        .await;

    assert!(matches!(result, Err(CoreError::DccSecurityViolation(_))));
    assert!(seen.lock().contains(&"DCC_TRANSFER_ERROR".to_string()));
    // No transfer entity was created, so no socket was opened.
    assert!(engine.transfer_statuses().is_empty());
}

#[tokio::test]
async fn traversal_is_stripped_and_lands_inside_dir() {
    let download_dir = tempfile::tempdir().unwrap();
    let (engine, _events, _seen) = engine_with(test_config(download_dir.path()));

    // Port 1 is closed; the worker fails after validation, which is all
    // this test cares about.
    let id = engine
        .accept_offer(
            "peer",
            "../../etc/notes.txt",
            "127.0.0.1".parse().unwrap(),
            1,
            10,
        )
        .await
        .unwrap();

    let snapshot = engine.lookup(&id).unwrap().snapshot();
    let canonical = std::fs::canonicalize(download_dir.path()).unwrap();
    assert!(snapshot.local_path.starts_with(&canonical));
    assert_eq!(snapshot.local_path.file_name().unwrap(), "notes.txt");
}

#[tokio::test]
async fn blocked_extension_is_refused() {
    let download_dir = tempfile::tempdir().unwrap();
    let (engine, _events, _seen) = engine_with(test_config(download_dir.path()));

    let result = engine
        .accept_offer(
            "peer",
            "totally-safe.exe",
            "127.0.0.1".parse().unwrap(),
            1,
            10,
        )
        .await;
    assert!(matches!(result, Err(CoreError::DccSecurityViolation(_))));
}

#[tokio::test]
async fn oversized_offer_is_refused() {
    let download_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(download_dir.path());
    config.max_file_size = 1000;
    let (engine, _events, _seen) = engine_with(config);

    let result = engine
        .accept_offer("peer", "big.bin", "127.0.0.1".parse().unwrap(), 1, 2000)
        .await;
    assert!(matches!(result, Err(CoreError::DccOfferInvalid(_))));
}

#[tokio::test]
async fn unmatched_accept_is_rejected() {
    let download_dir = tempfile::tempdir().unwrap();
    let (engine, _events, _seen) = engine_with(test_config(download_dir.path()));

    let result = engine
        .handle_accept(
            "stranger",
            "anything.bin",
            Some("127.0.0.1".parse().unwrap()),
            5000,
            0,
            Some("bogus-token"),
        )
        .await;
    assert!(matches!(result, Err(CoreError::DccOfferInvalid(_))));
}

#[tokio::test]
async fn passive_offer_tokens_expire() {
    let download_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(download_dir.path());
    config.passive_token_timeout_secs = 0;
    let (engine, _events, _seen) = engine_with(config);

    engine
        .on_passive_send_offer("peer", "gift.bin", None, 100, "tok9")
        .unwrap();
    assert_eq!(engine.passive_offers().len(), 1);

    engine.cleanup_now();
    assert!(engine.passive_offers().is_empty());

    // The token is no longer usable.
    let result = engine.accept_passive_offer("tok9").await;
    assert!(matches!(result, Err(CoreError::DccOfferInvalid(_))));
}

#[tokio::test]
async fn duplicate_passive_token_is_rejected() {
    let download_dir = tempfile::tempdir().unwrap();
    let (engine, _events, _seen) = engine_with(test_config(download_dir.path()));

    engine
        .on_passive_send_offer("peer", "a.bin", None, 100, "tok1")
        .unwrap();
    let result = engine.on_passive_send_offer("peer", "b.bin", None, 100, "tok1");
    assert!(matches!(result, Err(CoreError::DccOfferInvalid(_))));
}

#[tokio::test]
async fn cleanup_drops_aged_terminal_transfers() {
    let download_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(download_dir.path());
    config.transfer_max_age_secs = 0;
    let (engine, _events, _seen) = engine_with(config);

    // Connecting to a closed port fails the transfer promptly.
    let id = engine
        .accept_offer("peer", "gone.bin", "127.0.0.1".parse().unwrap(), 1, 10)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = engine.lookup(&id).unwrap().status();
        if status.is_terminal() {
            assert_eq!(status, DccTransferStatus::Failed);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "never failed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    engine.cleanup_now();
    assert!(engine.lookup(&id).is_none());
}

#[tokio::test]
async fn resume_identifier_must_be_unambiguous() {
    let download_dir = tempfile::tempdir().unwrap();
    let (engine, _events, _seen) = engine_with(test_config(download_dir.path()));

    let result = engine.attempt_user_resume("nothing-matches").await;
    assert!(matches!(result, Err(CoreError::DccInternal(_))));
}
