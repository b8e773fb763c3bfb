//! Integration tests for the protocol engine over real loopback sockets.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use conbus_client::{ConbusConnection, ConnectionState, Pacing, ProtocolConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn engine_config(port: u16, timeout_ms: u64) -> ProtocolConfig {
    ProtocolConfig {
        host: "127.0.0.1".to_owned(),
        port,
        timeout: Duration::from_millis(timeout_ms),
        pacing: Pacing::fixed(Duration::from_millis(1)),
        dedup_window: None,
    }
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn connect_emits_connection_made_then_times_out() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        // Hold the socket open, say nothing.
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let engine = ConbusConnection::new(engine_config(port, 150));
    let connected = Rc::new(Cell::new(false));
    let timeouts = Rc::new(Cell::new(0u32));

    let seen = Rc::clone(&connected);
    engine.connection_made.connect(move |_: &()| seen.set(true));
    let fired = Rc::clone(&timeouts);
    engine.timed_out.connect(move |_: &()| fired.set(fired.get() + 1));

    engine.run().await.unwrap();

    assert!(connected.get());
    assert_eq!(timeouts.get(), 1, "rolling timeout fires exactly once per scope");
    assert_eq!(engine.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn refused_connection_emits_failure_signals() {
    let (listener, port) = listener().await;
    drop(listener);

    let engine = ConbusConnection::new(engine_config(port, 200));
    let failures = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&failures);
    engine.connection_failed.connect(move |reason: &String| log.borrow_mut().push(reason.clone()));
    let log = Rc::clone(&failures);
    engine.failed.connect(move |message: &String| log.borrow_mut().push(message.clone()));

    assert!(engine.run().await.is_err());
    assert_eq!(failures.borrow().len(), 2);
    assert_eq!(engine.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn inbound_frames_are_parsed_and_reset_the_timeout() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        // Three chunks, 100 ms apart, against a 250 ms rolling timeout:
        // only the rolling reset keeps the scope alive for all of them.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            socket.write_all(b"<R0020030837F01DFM>").await.unwrap();
        }
        // Keep the socket open while the client's timeout runs down.
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let engine = ConbusConnection::new(engine_config(port, 250));
    let received = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&received);
    engine.telegram_received.connect(move |t: &conbus_proto::Telegram| {
        log.borrow_mut().push((t.frame_display(), t.checksum_valid()));
    });

    engine.run().await.unwrap();

    assert_eq!(received.borrow().len(), 3);
    assert!(received.borrow().iter().all(|(frame, ok)| frame == "<R0020030837F01DFM>" && *ok));
}

#[tokio::test]
async fn bad_checksum_frames_are_surfaced_not_dropped() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"<R0020030837F01DZZ>").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let engine = ConbusConnection::new(engine_config(port, 150));
    let seen = Rc::new(Cell::new(false));
    let flag = Rc::clone(&seen);
    engine.telegram_received.connect(move |t: &conbus_proto::Telegram| {
        assert!(!t.checksum_valid());
        flag.set(true);
    });

    engine.run().await.unwrap();
    assert!(seen.get());
}

#[tokio::test]
async fn queued_frames_drain_in_fifo_order() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut bytes = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match tokio::time::timeout(Duration::from_millis(500), socket.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => bytes.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        bytes
    });

    let engine = ConbusConnection::new(engine_config(port, 200));
    let sent = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&sent);
    engine.telegram_sent.connect(move |frame: &String| log.borrow_mut().push(frame.clone()));

    engine.send_raw_telegram("S0000000000F01D00");
    engine.send_raw_telegram("S0020044966F02D12");
    engine.send_raw_telegram("S0020044964F05D00");

    engine.run().await.unwrap();

    let wire = server.await.unwrap();
    let text = String::from_utf8(wire).unwrap();
    let first = text.find("F01D00").unwrap();
    let second = text.find("F02D12").unwrap();
    let third = text.find("F05D00").unwrap();
    assert!(first < second && second < third, "queue must drain strictly in order: {text}");
    assert_eq!(sent.borrow().len(), 3);
}

#[tokio::test]
async fn identical_frames_within_window_reach_the_wire_once() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut bytes = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match tokio::time::timeout(Duration::from_millis(500), socket.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => bytes.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        bytes
    });

    let mut config = engine_config(port, 200);
    config.pacing = Pacing::fixed(Duration::from_millis(2));
    config.dedup_window = Some(Duration::from_millis(50));
    let engine = ConbusConnection::new(config);

    let sent = Rc::new(Cell::new(0u32));
    let count = Rc::clone(&sent);
    engine.telegram_sent.connect(move |_: &String| count.set(count.get() + 1));

    // Four identical action frames enqueued back to back.
    for _ in 0..4 {
        engine.send_raw_telegram("S0020044964F05D00");
    }
    // One distinct frame in the same window must still pass.
    engine.send_raw_telegram("S0020044966F02D12");

    engine.run().await.unwrap();

    let text = String::from_utf8(server.await.unwrap()).unwrap();
    assert_eq!(text.matches("F05D00").count(), 1, "duplicates suppressed: {text}");
    assert_eq!(text.matches("F02D12").count(), 1, "distinct frame passes: {text}");
    assert_eq!(sent.get(), 2, "suppressed sends emit no telegram_sent");
}

#[tokio::test]
async fn high_level_senders_build_checksummed_frames() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut bytes = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match tokio::time::timeout(Duration::from_millis(500), socket.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => bytes.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        bytes
    });

    let engine = ConbusConnection::new(engine_config(port, 200));
    engine.send_telegram(
        "0020044966".parse().unwrap(),
        conbus_proto::SystemFunction::ReadDatapoint,
        Some(conbus_proto::DatapointId::OutputState),
        b"",
    );
    engine.send_event_telegram(14, 0, 2, conbus_proto::EventKind::Make);

    engine.run().await.unwrap();

    let text = String::from_utf8(server.await.unwrap()).unwrap();
    assert!(text.contains("<S0020044966F02D12FL>"), "checksummed system frame: {text}");
    assert!(text.contains("<E14L00I02MAK>"), "checksummed event frame: {text}");
}

#[tokio::test]
async fn stop_from_a_handler_ends_the_scope() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"<R0020044964F18DFA>").await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let engine = ConbusConnection::new(engine_config(port, 5_000));
    let handle = Rc::clone(&engine);
    engine.telegram_received.connect(move |_: &conbus_proto::Telegram| handle.stop());

    let started = std::time::Instant::now();
    engine.run().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2), "stop must beat the 5 s timeout");
}

#[tokio::test]
async fn peer_close_is_a_lost_connection() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
    });

    let engine = ConbusConnection::new(engine_config(port, 500));
    let lost = Rc::new(Cell::new(false));
    let flag = Rc::clone(&lost);
    engine.connection_lost.connect(move |_: &String| flag.set(true));

    assert!(engine.run().await.is_err());
    assert!(lost.get());
}
