//! Connection Manager Integration Tests
//!
//! Drives the manager over a scripted transport on a paused clock: dialing,
//! probes, event delivery, reconnect with paced replay, retry exhaustion and
//! close.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use market_ingest::{
    ConnectionError, ConnectionManager, ConnectionStatus, Frame, LivenessConfig, MarketEvent,
    StreamId, TransportError,
};

use common::{
    Dial, ScriptedDialer, collecting_handler, control, eventually, next_remote, test_config,
};

fn stream(raw: &str) -> StreamId {
    StreamId::new(raw).unwrap()
}

const TRADE: &str = r#"{"e":"trade","E":1672515782136,"s":"BNBBTC","t":12345,"p":"0.001","q":"100","T":1672515782136,"m":true,"M":true}"#;
const BOOK_TICKER: &str = r#"{"u":400900217,"s":"BNBUSDT","b":"25.35","B":"31.21","a":"25.36","A":"40.66"}"#;

// =============================================================================
// Connect / Subscribe
// =============================================================================

#[tokio::test(start_paused = true)]
async fn connect_then_subscribe_writes_subscribe_frame() {
    let (dialer, mut remotes) = ScriptedDialer::new(&[Dial::Accept]);
    let (handler, _events) = collecting_handler();
    let manager = ConnectionManager::new(test_config(3), dialer.clone(), handler);

    manager.connect().await.unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    let mut remote = next_remote(&mut remotes).await;

    manager.subscribe_trade("BTCUSDT").await.unwrap();
    let (_, text) = remote.next_text().await;
    let frame = control(&text);
    assert_eq!(frame["method"], "SUBSCRIBE");
    assert_eq!(frame["params"][0], "btcusdt@trade");
    assert!(frame["id"].is_i64());

    assert_eq!(manager.subscriptions(), vec![stream("btcusdt@trade")]);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn connect_is_noop_while_connected() {
    let (dialer, _remotes) = ScriptedDialer::new(&[Dial::Accept, Dial::Accept]);
    let (handler, _events) = collecting_handler();
    let manager = ConnectionManager::new(test_config(3), dialer.clone(), handler);

    manager.connect().await.unwrap();
    manager.connect().await.unwrap();
    assert_eq!(dialer.dials(), 1);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn refused_connect_returns_error_and_stays_disconnected() {
    let (dialer, _remotes) = ScriptedDialer::new(&[Dial::Refuse]);
    let (handler, _events) = collecting_handler();
    let manager = ConnectionManager::new(test_config(3), dialer.clone(), handler);

    let err = manager.connect().await.unwrap_err();
    assert!(matches!(
        err,
        ConnectionError::Transport(TransportError::Dial(_))
    ));
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);

    // No automatic retry after a failed initial connect
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn subscribe_connects_implicitly() {
    let (dialer, mut remotes) = ScriptedDialer::new(&[Dial::Accept]);
    let (handler, _events) = collecting_handler();
    let manager = ConnectionManager::new(test_config(3), dialer.clone(), handler);

    manager.subscribe(stream("ethusdt@bookTicker")).await.unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Connected);

    let mut remote = next_remote(&mut remotes).await;
    let (_, text) = remote.next_text().await;
    assert_eq!(control(&text)["params"][0], "ethusdt@bookTicker");
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn send_without_link_is_not_connected() {
    let (dialer, _remotes) = ScriptedDialer::new(&[]);
    let (handler, _events) = collecting_handler();
    let manager = ConnectionManager::new(test_config(3), dialer, handler);

    let err = manager
        .send(&serde_json::json!({"method": "LIST_SUBSCRIPTIONS", "id": 1}))
        .await
        .unwrap_err();
    assert_eq!(err, ConnectionError::Transport(TransportError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_sends_frame_and_drops_from_replay() {
    let (dialer, mut remotes) = ScriptedDialer::new(&[Dial::Accept, Dial::Accept]);
    let (handler, _events) = collecting_handler();
    let manager = ConnectionManager::new(test_config(3), dialer.clone(), handler);

    manager.connect().await.unwrap();
    let mut first = next_remote(&mut remotes).await;
    manager.subscribe(stream("a@trade")).await.unwrap();
    manager.subscribe(stream("b@trade")).await.unwrap();
    first.next_text().await;
    first.next_text().await;

    assert!(manager.unsubscribe(&stream("a@trade")).await.unwrap());
    assert!(!manager.unsubscribe(&stream("a@trade")).await.unwrap());
    let (_, text) = first.next_text().await;
    assert_eq!(control(&text)["method"], "UNSUBSCRIBE");
    assert_eq!(manager.subscriptions(), vec![stream("b@trade")]);

    drop(first);
    let mut second = next_remote(&mut remotes).await;
    let (_, text) = second.next_text().await;
    assert_eq!(control(&text)["params"][0], "b@trade");
    manager.close().await;
}

// =============================================================================
// Inbound Frames
// =============================================================================

#[tokio::test(start_paused = true)]
async fn decoded_events_reach_handler_and_malformed_frames_are_dropped() {
    let (dialer, mut remotes) = ScriptedDialer::new(&[Dial::Accept]);
    let (handler, mut events) = collecting_handler();
    let manager = ConnectionManager::new(test_config(3), dialer.clone(), handler);

    manager.connect().await.unwrap();
    let remote = next_remote(&mut remotes).await;

    remote.push_text(TRADE);
    remote.push_text("{not json");
    remote.push(Frame::Binary(vec![1, 2, 3]));
    remote.push_text(r#"{"result":null,"id":1}"#);
    remote.push_text(BOOK_TICKER);

    let first = events.recv().await.unwrap();
    assert!(matches!(first, MarketEvent::Trade(ref t) if t.symbol == "BNBBTC"));
    let second = events.recv().await.unwrap();
    assert!(matches!(second, MarketEvent::BookTicker(ref b) if b.symbol == "BNBUSDT"));

    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert_eq!(dialer.dials(), 1);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn probes_are_answered() {
    let (dialer, mut remotes) = ScriptedDialer::new(&[Dial::Accept]);
    let (handler, _events) = collecting_handler();
    let manager = ConnectionManager::new(test_config(3), dialer, handler);

    manager.connect().await.unwrap();
    let mut remote = next_remote(&mut remotes).await;

    remote.push(Frame::Ping(vec![7, 7]));
    assert_eq!(remote.next_written().await.1, Frame::Pong(vec![7, 7]));

    remote.push_text("ping");
    assert_eq!(remote.next_written().await.1, Frame::Text("pong".into()));
    manager.close().await;
}

// =============================================================================
// Liveness
// =============================================================================

#[tokio::test(start_paused = true)]
async fn silent_link_is_redialed() {
    let (dialer, mut remotes) = ScriptedDialer::new(&[Dial::Accept, Dial::Accept]);
    let (handler, _events) = collecting_handler();
    let mut config = test_config(3);
    config.liveness = LivenessConfig::new(Duration::from_secs(2), Duration::from_millis(500));
    let manager = ConnectionManager::new(config, dialer.clone(), handler);

    manager.connect().await.unwrap();
    let _silent = next_remote(&mut remotes).await;

    let _second = next_remote(&mut remotes).await;
    assert_eq!(dialer.dials(), 2);
    eventually(|| manager.status() == ConnectionStatus::Connected).await;
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn any_inbound_frame_keeps_link_alive() {
    let (dialer, mut remotes) = ScriptedDialer::new(&[Dial::Accept, Dial::Accept]);
    let (handler, _events) = collecting_handler();
    let mut config = test_config(3);
    config.liveness = LivenessConfig::new(Duration::from_secs(2), Duration::from_millis(500));
    let manager = ConnectionManager::new(config, dialer.clone(), handler);

    manager.connect().await.unwrap();
    let remote = next_remote(&mut remotes).await;

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        remote.push_text(TRADE);
    }

    assert_eq!(dialer.dials(), 1);
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    manager.close().await;
}

// =============================================================================
// Reconnect and Replay
// =============================================================================

#[tokio::test(start_paused = true)]
async fn reconnect_replays_subscriptions_in_order_and_paced() {
    let (dialer, mut remotes) = ScriptedDialer::new(&[Dial::Accept, Dial::Refuse, Dial::Accept]);
    let (handler, _events) = collecting_handler();
    let manager = ConnectionManager::new(test_config(5), dialer.clone(), handler);

    manager.connect().await.unwrap();
    let mut first = next_remote(&mut remotes).await;
    for raw in ["a@trade", "b@bookTicker", "c@trade"] {
        manager.subscribe(stream(raw)).await.unwrap();
        first.next_text().await;
    }

    drop(first);
    let mut second = next_remote(&mut remotes).await;
    assert_eq!(dialer.dials(), 3);

    let mut replayed = Vec::new();
    for _ in 0..3 {
        let (at, text) = second.next_text().await;
        let frame = control(&text);
        assert_eq!(frame["method"], "SUBSCRIBE");
        replayed.push((at, frame["params"][0].as_str().unwrap().to_string()));
    }

    let order: Vec<&str> = replayed.iter().map(|(_, s)| s.as_str()).collect();
    assert_eq!(order, vec!["a@trade", "b@bookTicker", "c@trade"]);
    for pair in replayed.windows(2) {
        let gap = pair[1].0 - pair[0].0;
        assert!(gap >= Duration::from_millis(300), "gap {gap:?}");
        assert!(gap < Duration::from_millis(400), "gap {gap:?}");
    }

    // Each subscription is resent exactly once.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(second.is_quiet());

    assert_eq!(manager.status(), ConnectionStatus::Connected);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn subscribe_while_reconnecting_is_replayed() {
    let (dialer, mut remotes) = ScriptedDialer::new(&[Dial::Accept, Dial::Refuse, Dial::Accept]);
    let (handler, _events) = collecting_handler();
    let manager = ConnectionManager::new(test_config(5), dialer.clone(), handler);

    manager.connect().await.unwrap();
    let first = next_remote(&mut remotes).await;
    drop(first);

    eventually(|| manager.status() == ConnectionStatus::Reconnecting).await;
    manager.subscribe(stream("late@trade")).await.unwrap();

    let mut second = next_remote(&mut remotes).await;
    let (_, text) = second.next_text().await;
    assert_eq!(control(&text)["params"][0], "late@trade");
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn write_failure_triggers_reconnect() {
    let (dialer, mut remotes) = ScriptedDialer::new(&[Dial::Accept, Dial::Accept]);
    let (handler, _events) = collecting_handler();
    let manager = ConnectionManager::new(test_config(3), dialer.clone(), handler);

    manager.connect().await.unwrap();
    let common::RemoteEnd { written, inbound } = next_remote(&mut remotes).await;
    drop(written);

    let err = manager
        .send(&serde_json::json!({"method": "LIST_SUBSCRIPTIONS", "id": 1}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConnectionError::Transport(TransportError::Write(_))
    ));

    let _second = next_remote(&mut remotes).await;
    assert_eq!(dialer.dials(), 2);
    drop(inbound);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_manager_disconnected_with_terminal_error() {
    let (dialer, mut remotes) = ScriptedDialer::new(&[Dial::Accept]);
    let (handler, _events) = collecting_handler();
    let manager = ConnectionManager::new(test_config(3), dialer.clone(), handler);

    manager.connect().await.unwrap();
    manager.subscribe(stream("a@trade")).await.unwrap();
    drop(next_remote(&mut remotes).await);

    eventually(|| manager.terminal_error().is_some()).await;
    assert_eq!(dialer.dials(), 1 + 3);
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert!(matches!(
        manager.terminal_error(),
        Some(ConnectionError::RetriesExhausted { attempts: 3, .. })
    ));

    // No further attempts and no implicit reconnect
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(dialer.dials(), 4);
    assert!(matches!(
        manager.subscribe(stream("b@trade")).await,
        Err(ConnectionError::RetriesExhausted { .. })
    ));

    // An explicit connect starts over and replays what was active
    dialer.push(Dial::Accept);
    manager.connect().await.unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert!(manager.terminal_error().is_none());

    let mut remote = next_remote(&mut remotes).await;
    let (_, text) = remote.next_text().await;
    assert_eq!(control(&text)["params"][0], "a@trade");
    manager.close().await;
}

// =============================================================================
// Close
// =============================================================================

#[tokio::test(start_paused = true)]
async fn close_is_idempotent_and_terminal() {
    let (dialer, mut remotes) = ScriptedDialer::new(&[Dial::Accept, Dial::Accept]);
    let (handler, _events) = collecting_handler();
    let manager = ConnectionManager::new(test_config(3), dialer.clone(), handler);

    manager.connect().await.unwrap();
    let mut remote = next_remote(&mut remotes).await;

    manager.close().await;
    manager.close().await;

    assert_eq!(remote.next_written().await.1, Frame::Close);
    assert!(manager.is_closed());
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert_eq!(manager.connect().await, Err(ConnectionError::Closed));
    assert_eq!(
        manager.subscribe(stream("a@trade")).await,
        Err(ConnectionError::Closed)
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn close_during_reconnect_stops_redialing() {
    let (dialer, mut remotes) = ScriptedDialer::new(&[Dial::Accept]);
    let (handler, _events) = collecting_handler();
    let mut config = test_config(10);
    config.reconnect.base_delay = Duration::from_secs(5);
    let manager = ConnectionManager::new(config, dialer.clone(), handler);

    manager.connect().await.unwrap();
    drop(next_remote(&mut remotes).await);
    eventually(|| manager.status() == ConnectionStatus::Reconnecting).await;

    manager.close().await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(dialer.dials(), 1);
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
}
