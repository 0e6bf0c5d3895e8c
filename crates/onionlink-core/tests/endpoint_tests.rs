//! End-to-end tests for the peer endpoint over loopback TCP.
//!
//! The connector role is driven either through a real `PeerEndpoint`
//! attached directly to the listener's port (the SOCKS hop carries no
//! protocol semantics) or through a hand-rolled wire harness where a
//! scenario needs to misbehave on purpose.

use onionlink_core::crypto::{CryptoSession, TAG_SIZE};
use onionlink_core::protocol::{FrameKind, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
use onionlink_core::{EndpointConfig, Error, HiddenAddress, PeerEndpoint, PeerEvent, Phase};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

fn config() -> EndpointConfig {
    EndpointConfig {
        event_capacity: 256,
        ..EndpointConfig::default()
    }
}

/// Receive the next event, tolerating lag, with a test deadline.
async fn next_event(rx: &mut broadcast::Receiver<PeerEvent>) -> PeerEvent {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(event)) => return event,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(e)) => panic!("event channel closed: {:?}", e),
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}

/// Skip events until one matches.
async fn wait_for(
    rx: &mut broadcast::Receiver<PeerEvent>,
    pred: impl Fn(&PeerEvent) -> bool,
) -> PeerEvent {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn write_raw_frame(stream: &mut TcpStream, kind: u8, payload: &[u8]) {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.push(kind);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await.expect("raw frame write");
    stream.flush().await.expect("raw frame flush");
}

async fn read_raw_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    stream.read_exact(&mut header).await.expect("raw header read");
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[1..5]);
    let length = u32::from_le_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; length];
    if length > 0 {
        stream.read_exact(&mut payload).await.expect("raw payload read");
    }
    (header[0], payload)
}

/// Run the connector half of the handshake over raw frames.
///
/// Exercises the normative wire sequence byte for byte: receive the
/// listener's key, derive, send our key, receive ack, send ack.
async fn raw_connector_handshake(stream: &mut TcpStream) -> CryptoSession {
    let mut crypto = CryptoSession::new();

    let (kind, peer_key) = read_raw_frame(stream).await;
    assert_eq!(kind, FrameKind::KeyExchange.to_byte());
    crypto.derive(&peer_key).expect("derive");

    let blob = crypto.public_key_blob().to_vec();
    write_raw_frame(stream, FrameKind::KeyExchange.to_byte(), &blob).await;

    let (kind, payload) = read_raw_frame(stream).await;
    assert_eq!(kind, FrameKind::ConnectionAck.to_byte());
    assert!(payload.is_empty());

    write_raw_frame(stream, FrameKind::ConnectionAck.to_byte(), &[]).await;
    crypto
}

async fn start_listener(config: EndpointConfig) -> (PeerEndpoint, broadcast::Receiver<PeerEvent>, SocketAddr) {
    let listener = PeerEndpoint::listener(config);
    let events = listener.subscribe();
    let addr = listener.listen(0).await.expect("listen");
    (listener, events, addr)
}

/// Happy path: handshake, message delivery, automatic read receipt.
#[tokio::test]
async fn test_happy_path_message_and_read_receipt() {
    let (listener, mut l_events, addr) = start_listener(config()).await;

    let connector = PeerEndpoint::connector(config());
    let mut c_events = connector.subscribe();
    let stream = TcpStream::connect(addr).await.expect("tcp connect");
    connector.connect_stream(stream).await.expect("connect");

    assert!(matches!(next_event(&mut l_events).await, PeerEvent::Connecting));
    assert!(matches!(next_event(&mut l_events).await, PeerEvent::Connected));
    assert_eq!(listener.phase(), Phase::Live);
    assert_eq!(connector.phase(), Phase::Live);

    connector.send_message("hello").await.expect("send");

    match next_event(&mut l_events).await {
        PeerEvent::MessageReceived { text } => assert_eq!(text, "hello"),
        other => panic!("expected message, got {:?}", other),
    }

    // The listener acknowledges delivery on its own.
    let event = wait_for(&mut c_events, |e| {
        matches!(e, PeerEvent::ReadReceiptReceived)
    })
    .await;
    assert!(matches!(event, PeerEvent::ReadReceiptReceived));

    listener.stop().await;
    connector.stop().await;
}

/// The listener reports the session live only once the connector's
/// final ack has arrived, never on its own ack.
#[tokio::test]
async fn test_listener_connected_only_after_final_ack() {
    let (listener, mut l_events, addr) = start_listener(config()).await;

    let mut stream = TcpStream::connect(addr).await.expect("tcp connect");
    let mut crypto = CryptoSession::new();

    let (kind, peer_key) = read_raw_frame(&mut stream).await;
    assert_eq!(kind, FrameKind::KeyExchange.to_byte());
    crypto.derive(&peer_key).expect("derive");
    let blob = crypto.public_key_blob().to_vec();
    write_raw_frame(&mut stream, FrameKind::KeyExchange.to_byte(), &blob).await;

    let (kind, _) = read_raw_frame(&mut stream).await;
    assert_eq!(kind, FrameKind::ConnectionAck.to_byte());

    // Hold back our ack; the listener must not report the session live.
    assert!(matches!(next_event(&mut l_events).await, PeerEvent::Connecting));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(
        l_events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    write_raw_frame(&mut stream, FrameKind::ConnectionAck.to_byte(), &[]).await;
    assert!(matches!(next_event(&mut l_events).await, PeerEvent::Connected));

    listener.stop().await;
}

/// Typing indicators surface as events on the peer.
#[tokio::test]
async fn test_typing_indicator_round_trip() {
    let (listener, mut l_events, addr) = start_listener(config()).await;

    let connector = PeerEndpoint::connector(config());
    let stream = TcpStream::connect(addr).await.expect("tcp connect");
    connector.connect_stream(stream).await.expect("connect");

    wait_for(&mut l_events, |e| matches!(e, PeerEvent::Connected)).await;

    connector.send_typing().await.expect("typing");
    let event = next_event(&mut l_events).await;
    assert!(matches!(event, PeerEvent::TypingReceived));

    listener.stop().await;
    connector.stop().await;
}

/// Messages flow in both directions on one session.
#[tokio::test]
async fn test_bidirectional_messages() {
    let (listener, mut l_events, addr) = start_listener(config()).await;

    let connector = PeerEndpoint::connector(config());
    let mut c_events = connector.subscribe();
    let stream = TcpStream::connect(addr).await.expect("tcp connect");
    connector.connect_stream(stream).await.expect("connect");

    wait_for(&mut l_events, |e| matches!(e, PeerEvent::Connected)).await;

    connector.send_message("from connector").await.expect("send");
    match wait_for(&mut l_events, |e| matches!(e, PeerEvent::MessageReceived { .. })).await {
        PeerEvent::MessageReceived { text } => assert_eq!(text, "from connector"),
        _ => unreachable!(),
    }

    listener.send_message("from listener").await.expect("send");
    match wait_for(&mut c_events, |e| matches!(e, PeerEvent::MessageReceived { .. })).await {
        PeerEvent::MessageReceived { text } => assert_eq!(text, "from listener"),
        _ => unreachable!(),
    }

    listener.stop().await;
    connector.stop().await;
}

/// A tampered ciphertext ends the session; no message callback fires.
#[tokio::test]
async fn test_tampered_ciphertext_tears_session_down() {
    let (listener, mut l_events, addr) = start_listener(config()).await;

    let mut stream = TcpStream::connect(addr).await.expect("tcp connect");
    let crypto = raw_connector_handshake(&mut stream).await;
    wait_for(&mut l_events, |e| matches!(e, PeerEvent::Connected)).await;

    // Flip one bit in the ciphertext region, past IV, before the tag.
    let mut payload = crypto.encrypt("secret").expect("encrypt");
    let target = payload.len() - TAG_SIZE - 1;
    payload[target] ^= 0x01;
    write_raw_frame(&mut stream, FrameKind::EncryptedMessage.to_byte(), &payload).await;

    let event = wait_for(&mut l_events, |e| {
        matches!(
            e,
            PeerEvent::Disconnected | PeerEvent::MessageReceived { .. }
        )
    })
    .await;
    assert!(
        matches!(event, PeerEvent::Disconnected),
        "tampered frame must disconnect, not deliver: {:?}",
        event
    );

    listener.stop().await;
}

/// A frame declaring more than the 10 MiB cap is rejected outright.
#[tokio::test]
async fn test_oversize_frame_rejected() {
    let (listener, mut l_events, addr) = start_listener(config()).await;

    let mut stream = TcpStream::connect(addr).await.expect("tcp connect");
    let _crypto = raw_connector_handshake(&mut stream).await;
    wait_for(&mut l_events, |e| matches!(e, PeerEvent::Connected)).await;

    // Header only: kind 0x02 declaring cap + 1 bytes. The receiver must
    // fail on the declared length without waiting for a payload.
    let mut header = vec![FrameKind::EncryptedMessage.to_byte()];
    header.extend_from_slice(&((MAX_FRAME_PAYLOAD as u32) + 1).to_le_bytes());
    stream.write_all(&header).await.expect("oversize header");
    stream.flush().await.expect("flush");

    let event = wait_for(&mut l_events, |e| {
        matches!(
            e,
            PeerEvent::Disconnected | PeerEvent::MessageReceived { .. }
        )
    })
    .await;
    assert!(matches!(event, PeerEvent::Disconnected));

    listener.stop().await;
}

/// A silent inbound connection times out; the accept loop survives and
/// a later well-behaved connector still gets through.
#[tokio::test]
async fn test_handshake_timeout_then_recovery() {
    let mut cfg = config();
    cfg.handshake_timeout = Duration::from_millis(300);
    let (listener, mut l_events, addr) = start_listener(cfg).await;

    // Connect and say nothing.
    let silent = TcpStream::connect(addr).await.expect("tcp connect");
    assert!(matches!(next_event(&mut l_events).await, PeerEvent::Connecting));

    // Give the deadline time to fire; no Connected may appear.
    tokio::time::sleep(Duration::from_millis(600)).await;
    drop(silent);

    let connector = PeerEndpoint::connector(config());
    let stream = TcpStream::connect(addr).await.expect("tcp connect");
    connector.connect_stream(stream).await.expect("connect after timeout");

    let event = wait_for(&mut l_events, |e| {
        matches!(e, PeerEvent::Connected | PeerEvent::Disconnected)
    })
    .await;
    assert!(matches!(event, PeerEvent::Connected));

    connector.send_message("still alive").await.expect("send");
    match wait_for(&mut l_events, |e| matches!(e, PeerEvent::MessageReceived { .. })).await {
        PeerEvent::MessageReceived { text } => assert_eq!(text, "still alive"),
        _ => unreachable!(),
    }

    listener.stop().await;
    connector.stop().await;
}

/// A second connector replaces the first session without the listener
/// misreporting a disconnect.
#[tokio::test]
async fn test_session_replacement() {
    let (listener, mut l_events, addr) = start_listener(config()).await;

    let connector_a = PeerEndpoint::connector(config());
    let stream = TcpStream::connect(addr).await.expect("tcp connect");
    connector_a.connect_stream(stream).await.expect("connect a");

    assert!(matches!(next_event(&mut l_events).await, PeerEvent::Connecting));
    assert!(matches!(next_event(&mut l_events).await, PeerEvent::Connected));

    connector_a.send_message("from a").await.expect("send a");
    match next_event(&mut l_events).await {
        PeerEvent::MessageReceived { text } => assert_eq!(text, "from a"),
        other => panic!("expected message from a, got {:?}", other),
    }

    let connector_b = PeerEndpoint::connector(config());
    let stream = TcpStream::connect(addr).await.expect("tcp connect");
    connector_b.connect_stream(stream).await.expect("connect b");

    // Replacement must surface as Connecting then Connected, with no
    // Disconnected in between: A's dispatch task no longer owns the
    // current stream when it unwinds.
    assert!(matches!(next_event(&mut l_events).await, PeerEvent::Connecting));
    assert!(matches!(next_event(&mut l_events).await, PeerEvent::Connected));

    connector_b.send_message("from b").await.expect("send b");
    match wait_for(&mut l_events, |e| matches!(e, PeerEvent::MessageReceived { .. })).await {
        PeerEvent::MessageReceived { text } => assert_eq!(text, "from b"),
        _ => unreachable!(),
    }

    let mut b_events = connector_b.subscribe();
    listener.send_message("to b").await.expect("send to b");
    match wait_for(&mut b_events, |e| matches!(e, PeerEvent::MessageReceived { .. })).await {
        PeerEvent::MessageReceived { text } => assert_eq!(text, "to b"),
        _ => unreachable!(),
    }

    listener.stop().await;
    connector_b.stop().await;
}

/// A proxy that refuses the no-auth method surfaces cleanly; no session
/// state is left behind.
#[tokio::test]
async fn test_socks_failure_surfaces_cleanly() {
    let proxy = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let proxy_addr = proxy.local_addr().expect("proxy addr");

    tokio::spawn(async move {
        let (mut stream, _) = proxy.accept().await.expect("proxy accept");
        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.expect("greeting");
        stream.write_all(&[0x05, 0xFF]).await.expect("refusal");
    });

    let cfg = EndpointConfig {
        socks_addr: proxy_addr,
        socks_io_timeout: Duration::from_secs(2),
        ..config()
    };
    let connector = PeerEndpoint::connector(cfg);
    let target = HiddenAddress::parse(
        "vww6ybal4bd7szmgncyruucpgfkqahzddi37ktceo3ah7ngmcopnpyyd.onion",
    )
    .expect("addr");

    let result = connector.connect(&target).await;
    assert!(matches!(result, Err(Error::SocksNegotiation)));
    assert_eq!(connector.phase(), Phase::Idle);
    assert!(matches!(
        connector.send_message("nobody home").await,
        Err(Error::NotConnected)
    ));
}

/// Stopping the endpoint aborts an in-flight dial promptly instead of
/// waiting out the SOCKS I/O timeouts.
#[tokio::test]
async fn test_stop_cancels_inflight_dial() {
    let proxy = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let proxy_addr = proxy.local_addr().expect("proxy addr");

    // Accept the connection but never answer the SOCKS greeting.
    tokio::spawn(async move {
        let (_stream, _) = proxy.accept().await.expect("proxy accept");
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let cfg = EndpointConfig {
        socks_addr: proxy_addr,
        ..config()
    };
    let connector = std::sync::Arc::new(PeerEndpoint::connector(cfg));
    let target = HiddenAddress::parse(
        "vww6ybal4bd7szmgncyruucpgfkqahzddi37ktceo3ah7ngmcopnpyyd.onion",
    )
    .expect("addr");

    let dial = {
        let connector = std::sync::Arc::clone(&connector);
        tokio::spawn(async move { connector.connect(&target).await })
    };

    // Let the dial reach the silent proxy, then pull the plug.
    tokio::time::sleep(Duration::from_millis(200)).await;
    connector.stop().await;

    let result = tokio::time::timeout(Duration::from_secs(2), dial)
        .await
        .expect("cancellation must not wait for the SOCKS timeout")
        .expect("dial task");
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(connector.phase(), Phase::Closed);
}

/// Concurrent senders never tear frames: every message arrives intact.
#[tokio::test]
async fn test_concurrent_sends_serialize() {
    let (listener, mut l_events, addr) = start_listener(config()).await;

    let connector = std::sync::Arc::new(PeerEndpoint::connector(config()));
    let stream = TcpStream::connect(addr).await.expect("tcp connect");
    connector.connect_stream(stream).await.expect("connect");
    wait_for(&mut l_events, |e| matches!(e, PeerEvent::Connected)).await;

    let mut tasks = Vec::new();
    for task in 0..8 {
        let connector = std::sync::Arc::clone(&connector);
        tasks.push(tokio::spawn(async move {
            for i in 0..5 {
                let msg = format!("task {} message {}", task, i);
                connector.send_message(&msg).await.expect("concurrent send");
            }
        }));
    }
    for task in tasks {
        task.await.expect("sender task");
    }

    let mut received = Vec::new();
    while received.len() < 40 {
        if let PeerEvent::MessageReceived { text } =
            wait_for(&mut l_events, |e| matches!(e, PeerEvent::MessageReceived { .. })).await
        {
            received.push(text);
        }
    }

    received.sort();
    let mut expected: Vec<String> = (0..8)
        .flat_map(|t| (0..5).map(move |i| format!("task {} message {}", t, i)))
        .collect();
    expected.sort();
    assert_eq!(received, expected);

    listener.stop().await;
    connector.stop().await;
}

/// Local stop is a clean shutdown: the peer side sees a disconnect, the
/// stopping side does not emit one.
#[tokio::test]
async fn test_local_stop_is_silent() {
    let (listener, mut l_events, addr) = start_listener(config()).await;

    let connector = PeerEndpoint::connector(config());
    let mut c_events = connector.subscribe();
    let stream = TcpStream::connect(addr).await.expect("tcp connect");
    connector.connect_stream(stream).await.expect("connect");
    wait_for(&mut l_events, |e| matches!(e, PeerEvent::Connected)).await;

    connector.stop().await;
    assert_eq!(connector.phase(), Phase::Closed);

    // The listener experiences a remote close.
    let event = wait_for(&mut l_events, |e| matches!(e, PeerEvent::Disconnected)).await;
    assert!(matches!(event, PeerEvent::Disconnected));

    // The stopping side stays silent: a cooperative local shutdown is
    // not a peer disconnect.
    tokio::time::sleep(Duration::from_millis(200)).await;
    loop {
        match c_events.try_recv() {
            Ok(PeerEvent::Disconnected) => panic!("local stop must not emit Disconnected"),
            Ok(_) => continue,
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    listener.stop().await;
}
