//! Protocol engine driven by scripted broker bytes, without any I/O


use blynk_edge::engine::{ConnectionState, DisconnectCause, ProtocolStateMachine};
use blynk_edge::events::{Event, EventKey};
use blynk_edge::protocol::{decode, status, Command, Frame};
use bytes::Bytes;
use proptest::prelude::*;
use std::time::Duration;
use test_helpers::{events, recorder, TEST_TOKEN};
use tokio::time::Instant;

const H: Duration = Duration::from_secs(10);

fn wire(frames: &[Frame]) -> Vec<u8> {
    frames
        .iter()
        .flat_map(|f| f.encode().unwrap().to_vec())
        .collect()
}

fn sent(chunks: Vec<Bytes>) -> Vec<Frame> {
    chunks
        .iter()
        .map(|bytes| decode(bytes).unwrap().unwrap().0)
        .collect()
}

fn logged_in(now: Instant) -> ProtocolStateMachine {
    let mut engine = ProtocolStateMachine::new(TEST_TOKEN, H);
    engine.connect(now);
    engine.process(&wire(&[Frame::response(1, status::SUCCESS)]), now);
    engine.drain_outbox();
    engine
}

#[test]
fn test_full_session_script() {
    let now = Instant::now();
    let mut engine = ProtocolStateMachine::new(TEST_TOKEN, H);
    let (lifecycle, on_connected) = recorder();
    let (pin5, on_pin5) = recorder();
    let (rtc, on_rtc) = recorder();
    engine.on(EventKey::Connected, on_connected);
    engine.on(EventKey::pin(5), on_pin5);
    engine.on(EventKey::internal("rtc"), on_rtc);

    engine.connect(now);
    let login = sent(engine.drain_outbox());
    assert_eq!(login.len(), 1);
    assert_eq!(login[0].command, Command::HardwareLogin);
    assert_eq!(login[0].message_id, 1);
    assert_eq!(login[0].fields(), [TEST_TOKEN]);

    let script = wire(&[
        Frame::response(1, status::SUCCESS),
        Frame::new(Command::Hardware, 40, ["vw", "5", "128"]),
        Frame::new(Command::Internal, 41, ["rtc", "1700000000"]),
        Frame::new(Command::Ping, 77, Vec::<String>::new()),
    ]);
    engine.process(&script, now);

    assert_eq!(engine.state(), ConnectionState::Connected);
    assert_eq!(events(&lifecycle), vec![Event::Connected]);
    assert_eq!(events(&pin5)[0].values(), ["128"]);
    assert_eq!(events(&rtc)[0].values(), ["1700000000"]);

    let replies = sent(engine.drain_outbox());
    assert_eq!(replies, vec![Frame::response(77, status::SUCCESS)]);

    // Replies do not consume ids; the next outbound frame gets 2
    assert_eq!(engine.virtual_write(6, ["on"], now).unwrap(), Some(2));
}

#[test]
fn test_wildcard_sees_every_pin() {
    let now = Instant::now();
    let mut engine = logged_in(now);
    let (any, on_any) = recorder();
    engine.on(EventKey::AnyVirtualPin, on_any);

    engine.process(
        &wire(&[
            Frame::new(Command::Hardware, 2, ["vw", "1", "a"]),
            Frame::new(Command::Hardware, 3, ["vw", "2", "b", "c"]),
            Frame::new(Command::Hardware, 4, ["dw", "13", "1"]),
        ]),
        now,
    );

    assert_eq!(
        events(&any),
        vec![
            Event::VirtualWriteAny {
                pin: "1".to_string(),
                values: vec!["a".to_string()],
            },
            Event::VirtualWriteAny {
                pin: "2".to_string(),
                values: vec!["b".to_string(), "c".to_string()],
            },
        ]
    );
}

#[test]
fn test_failing_handlers_do_not_stop_routing() {
    let now = Instant::now();
    let mut engine = logged_in(now);
    engine.on(EventKey::pin(1), |_| panic!("sensor driver crashed"));
    engine.on(EventKey::AnyVirtualPin, |_| Err("rejected".into()));
    let (pin2, on_pin2) = recorder();
    engine.on(EventKey::pin(2), on_pin2);

    engine.process(
        &wire(&[
            Frame::new(Command::Hardware, 2, ["vw", "1", "x"]),
            Frame::new(Command::Hardware, 3, ["vw", "2", "y"]),
        ]),
        now,
    );

    assert!(engine.is_connected());
    assert_eq!(events(&pin2).len(), 1);
}

#[test]
fn test_heartbeat_timeout_then_fresh_login() {
    let t0 = Instant::now();
    let mut engine = logged_in(t0);
    let (lost, on_lost) = recorder();
    engine.on(EventKey::Disconnected, on_lost);

    engine.process(&[], t0 + Duration::from_secs(16));
    assert_eq!(engine.state(), ConnectionState::Disconnected);
    assert_eq!(
        engine.last_disconnect(),
        Some(DisconnectCause::HeartbeatTimeout)
    );
    assert_eq!(events(&lost), vec![Event::Disconnected]);

    // Further input is ignored until the next login
    engine.process(&wire(&[Frame::new(Command::Ping, 9, Vec::<String>::new())]), t0);
    assert!(!engine.has_pending_output());

    engine.connect(t0 + Duration::from_secs(17));
    let login = sent(engine.drain_outbox());
    assert_eq!(login[0].message_id, 1);
}

#[test]
fn test_redirect_is_recorded_once() {
    let now = Instant::now();
    let mut engine = logged_in(now);
    let (moved, on_moved) = recorder();
    engine.on(EventKey::Redirect, on_moved);

    engine.process(
        &wire(&[Frame::new(Command::Redirect, 2, ["fra1.blynk.cloud", "443"])]),
        now,
    );

    assert_eq!(
        events(&moved),
        vec![Event::Redirect {
            host: "fra1.blynk.cloud".to_string(),
            port: 443,
        }]
    );
    let target = engine.take_redirect().unwrap();
    assert_eq!((target.host.as_str(), target.port), ("fra1.blynk.cloud", 443));
    assert!(engine.take_redirect().is_none());
}

#[test]
fn test_event_keys_use_classic_names() {
    let cases = [
        (EventKey::Connected, "connected"),
        (EventKey::Disconnected, "disconnected"),
        (EventKey::InvalidAuth, "invalid_auth"),
        (EventKey::Redirect, "redirect"),
        (EventKey::pin(5), "V5"),
        (EventKey::AnyVirtualPin, "V*"),
        (EventKey::internal("rtc"), "internal:rtc"),
    ];

    for (key, name) in cases {
        assert_eq!(key.to_string(), name);
        assert_eq!(name.parse::<EventKey>().unwrap(), key);
    }
    assert!("bogus".parse::<EventKey>().is_err());
}

proptest! {
    #[test]
    fn split_delivery_yields_same_events(chunk in 1usize..24) {
        let now = Instant::now();
        let script = wire(&[
            Frame::response(1, status::SUCCESS),
            Frame::new(Command::Hardware, 2, ["vw", "3", "on"]),
            Frame::new(Command::Internal, 3, ["utc", "0"]),
            Frame::new(Command::Hardware, 4, ["vw", "3", "off"]),
        ]);

        let mut engine = ProtocolStateMachine::new(TEST_TOKEN, H);
        let (pin3, on_pin3) = recorder();
        let (utc, on_utc) = recorder();
        engine.on(EventKey::pin(3), on_pin3);
        engine.on(EventKey::internal("utc"), on_utc);
        engine.connect(now);

        for piece in script.chunks(chunk) {
            engine.process(piece, now);
        }

        prop_assert!(engine.is_connected());
        let values: Vec<Vec<String>> =
            events(&pin3).iter().map(|e| e.values().to_vec()).collect();
        prop_assert_eq!(values, vec![vec!["on".to_string()], vec!["off".to_string()]]);
        prop_assert_eq!(events(&utc).len(), 1);
    }
}
