//! End-to-end tests of the TCP stream engine: handshake, compatibility
//! check, priority scheduling, liveness and encrypted exchange, all over
//! real loopback sockets.

use pproto::commands::{self, command, CloseConnection};
use pproto::host_point::HostPoint;
use pproto::message::{Message, MessagePtr, MessageType, Priority, SerializeFormat};
use pproto::transport::{tcp, EventReceiver, SocketEvent};
use pproto::{registry, SocketDescriptorSet};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

const TEST_DATA: Uuid = Uuid::from_u128(0x11d3cbbe_9a4f_43a2_8e5f_0d1a2b3c4d5e);
const TEST_BULK: Uuid = Uuid::from_u128(0x22e4dccf_ab50_44b3_9f60_1e2b3c4d5e6f);

fn register_test_commands() {
    registry::register(TEST_DATA, "TestData", false);
    registry::register(TEST_BULK, "TestBulk", false);
}

fn loopback(port: u16) -> HostPoint {
    HostPoint::new("127.0.0.1".parse().unwrap(), port)
}

async fn next_event(events: &mut EventReceiver, within: Duration) -> Option<SocketEvent> {
    timeout(within, events.recv()).await.ok().flatten()
}

async fn wait_message(events: &mut EventReceiver, within: Duration) -> Option<MessagePtr> {
    let deadline = Instant::now() + within;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match next_event(events, left).await? {
            SocketEvent::Message(message) => return Some(message),
            _ => continue,
        }
    }
}

async fn wait_connected(events: &mut EventReceiver, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match next_event(events, left).await {
            Some(SocketEvent::Connected(_)) => return true,
            Some(_) => continue,
            None => return false,
        }
    }
}

async fn start_pair() -> (tcp::Listener, Arc<tcp::Socket>, EventReceiver, EventReceiver) {
    register_test_commands();
    let listener = tcp::Listener::new();
    listener.listen(loopback(0)).await.unwrap();
    let server_events = listener.events().unwrap();

    let client = Arc::new(tcp::Socket::new());
    let mut client_events = client.events().unwrap();
    client.init(listener.local_point());
    client.connect();
    assert!(wait_connected(&mut client_events, Duration::from_secs(5)).await);
    (listener, client, client_events, server_events)
}

#[tokio::test]
async fn command_travels_and_answer_returns() {
    let (listener, client, mut client_events, mut server_events) = start_pair().await;

    let mut m = Message::create(TEST_DATA, SerializeFormat::QBinary);
    m.set_content(b"request payload".to_vec(), SerializeFormat::QBinary);
    m.set_tags(vec![41, 42]);
    let m = Arc::new(m);
    assert!(client.send(&m));

    let received = wait_message(&mut server_events, Duration::from_secs(3))
        .await
        .expect("server receives the command");
    assert_eq!(received.id(), m.id());
    assert_eq!(received.command(), TEST_DATA);
    assert_eq!(received.message_type(), MessageType::Command);
    assert_eq!(received.tags(), &[41, 42]);
    assert_eq!(received.content().unwrap(), b"request payload");
    // Transient metadata points back at the connection
    assert_ne!(received.socket_descriptor(), pproto::NO_SOCKET);

    // Answer routed back through the listener by the stored descriptor
    let mut answer = received.clone_for_answer();
    answer.set_content(b"answer payload".to_vec(), SerializeFormat::QBinary);
    listener.send(&Arc::new(answer), &SocketDescriptorSet::new());

    let answer = wait_message(&mut client_events, Duration::from_secs(3))
        .await
        .expect("client receives the answer");
    assert_eq!(answer.id(), m.id());
    assert_eq!(answer.message_type(), MessageType::Answer);
    assert_eq!(answer.content().unwrap(), b"answer payload");

    client.disconnect(Duration::from_secs(3)).await;
    listener.close().await;
}

#[tokio::test]
async fn foreign_signature_answered_with_zero_uuid_and_close() {
    let listener = tcp::Listener::new();
    listener.listen(loopback(0)).await.unwrap();

    let mut raw = TcpStream::connect(listener.local_point().to_socket_addr()).await.unwrap();
    raw.write_all(Uuid::nil().as_bytes()).await.unwrap();

    let mut reply = [0u8; 16];
    timeout(Duration::from_secs(2), raw.read_exact(&mut reply))
        .await
        .expect("reply within the deadline")
        .unwrap();
    assert_eq!(reply, [0u8; 16]);

    // The listener drops the connection right after the short grace
    let start = Instant::now();
    let mut probe = [0u8; 1];
    let read = timeout(Duration::from_secs(2), raw.read(&mut probe))
        .await
        .expect("close within the deadline")
        .unwrap();
    assert_eq!(read, 0);
    assert!(start.elapsed() < Duration::from_millis(1500));

    listener.close().await;
}

#[tokio::test]
async fn incompatible_versions_close_both_sides() {
    register_test_commands();
    let listener = tcp::Listener::new();
    listener.set_protocol_versions(1, 2);
    listener.listen(loopback(0)).await.unwrap();
    let mut server_events = listener.events().unwrap();

    let client = tcp::Socket::new();
    client.set_protocol_versions(100, 100);
    let mut client_events = client.events().unwrap();
    client.init(listener.local_point());
    client.connect();

    let mut client_connected = false;
    let mut client_close_commands = 0;
    let mut client_disconnected = false;
    let deadline = Instant::now() + Duration::from_secs(3);
    while let Some(event) =
        next_event(&mut client_events, deadline.saturating_duration_since(Instant::now())).await
    {
        match event {
            SocketEvent::Connected(_) => client_connected = true,
            SocketEvent::Disconnected(_) => {
                client_disconnected = true;
                break;
            }
            SocketEvent::Message(m)
                if m.command() == command::CLOSE_CONNECTION
                    && m.message_type() == MessageType::Command =>
            {
                let close: CloseConnection = commands::read_from_message_ptr(&m).unwrap();
                assert_eq!(close.code, commands::error::PROTOCOL_INCOMPATIBLE.code);
                client_close_commands += 1;
            }
            SocketEvent::Message(_) => {}
        }
    }
    assert!(!client_connected);
    assert!(client_disconnected);
    assert_eq!(client_close_commands, 1);

    let mut server_close_commands = 0;
    let deadline = Instant::now() + Duration::from_secs(1);
    while let Some(event) =
        next_event(&mut server_events, deadline.saturating_duration_since(Instant::now())).await
    {
        if let SocketEvent::Message(m) = event {
            if m.command() == command::CLOSE_CONNECTION
                && m.message_type() == MessageType::Command
            {
                server_close_commands += 1;
            }
        }
    }
    assert_eq!(server_close_commands, 1);

    listener.close().await;
}

#[tokio::test]
async fn priority_scheduling_on_the_wire() {
    register_test_commands();
    let listener = tcp::Listener::new();
    listener.listen(loopback(0)).await.unwrap();
    let mut server_events = listener.events().unwrap();

    let client = tcp::Socket::new();
    client.init(listener.local_point());
    client.connect();

    // All 21 messages are queued while the handshake is still in flight, so
    // the engine drains them in one burst by queue discipline
    let mut expected = Vec::new();
    let mut normals = Vec::new();
    let mut lows = Vec::new();
    let mut high = Message::create(TEST_DATA, SerializeFormat::QBinary);
    high.set_priority(Priority::High);
    let high = Arc::new(high);
    for _ in 0..10 {
        let mut m = Message::create(TEST_DATA, SerializeFormat::QBinary);
        m.set_priority(Priority::Normal);
        normals.push(Arc::new(m));
    }
    for _ in 0..10 {
        let mut m = Message::create(TEST_DATA, SerializeFormat::QBinary);
        m.set_priority(Priority::Low);
        lows.push(Arc::new(m));
    }
    for m in normals.iter().chain(lows.iter()) {
        assert!(client.send(m));
    }
    assert!(client.send(&high));

    // High first, then five Normals per Low until the Normals run out
    expected.push(high.id());
    expected.extend(normals[0..5].iter().map(|m| m.id()));
    expected.push(lows[0].id());
    expected.extend(normals[5..10].iter().map(|m| m.id()));
    expected.extend(lows[1..10].iter().map(|m| m.id()));

    let mut received = Vec::new();
    while received.len() < 21 {
        match wait_message(&mut server_events, Duration::from_secs(5)).await {
            Some(m) => received.push(m.id()),
            None => break,
        }
    }
    assert_eq!(received, expected);

    client.disconnect(Duration::from_secs(3)).await;
    listener.close().await;
}

#[tokio::test]
async fn echo_loss_synthesizes_event_and_closes() {
    register_test_commands();
    // A silent peer: completes the signature exchange, then ignores
    // everything
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = silent.accept().await.unwrap();
        let mut sig = [0u8; 16];
        stream.read_exact(&mut sig).await.unwrap();
        stream.write_all(&sig).await.unwrap();
        let mut sink = vec![0u8; 4096];
        loop {
            match stream.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let client = tcp::Socket::new();
    client.set_echo_timeout(1);
    let mut client_events = client.events().unwrap();
    client.init(silent_addr.into());
    client.connect();

    let start = Instant::now();
    let mut echo_event = false;
    let mut disconnected = false;
    let deadline = Instant::now() + Duration::from_secs(4);
    while let Some(event) =
        next_event(&mut client_events, deadline.saturating_duration_since(Instant::now())).await
    {
        match event {
            SocketEvent::Message(m) if m.command() == command::ECHO_CONNECTION => {
                echo_event = true;
            }
            SocketEvent::Disconnected(_) => {
                disconnected = true;
                break;
            }
            _ => {}
        }
    }
    assert!(echo_event, "the liveness loss must surface as an echo event");
    assert!(disconnected);
    // Client-side deadline is the echo timeout plus the loop cadence
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn unregistered_command_is_answered_with_unknown() {
    let (listener, client, _client_events, mut server_events) = start_pair().await;

    // Registered on neither side; the listener reports it back and the
    // client then refuses to send it again
    let foreign = Uuid::from_u128(0x33f5edd0_bc61_45c4_a071_2f3c4d5e6f70);
    let m = Arc::new(Message::create(foreign, SerializeFormat::QBinary));
    assert!(client.send(&m));

    // The message never reaches the application
    assert!(wait_message(&mut server_events, Duration::from_millis(700)).await.is_none());

    // After the Unknown notification lands, sends of that command fail
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut suppressed = false;
    while Instant::now() < deadline {
        if !client.send(&Arc::new(Message::create(foreign, SerializeFormat::QBinary))) {
            suppressed = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(suppressed);

    client.disconnect(Duration::from_secs(3)).await;
    listener.close().await;
}

#[tokio::test]
async fn close_connection_request_is_acknowledged() {
    let (listener, client, mut client_events, mut server_events) = start_pair().await;

    let close = CloseConnection::from(
        commands::error::PROTOCOL_INCOMPATIBLE.with_description("shutting down"),
    );
    let m = Arc::new(commands::create_message(&close, SerializeFormat::QBinary).unwrap());
    assert!(client.send(&m));

    // The peer observes the request...
    let received = wait_message(&mut server_events, Duration::from_secs(3))
        .await
        .expect("listener receives the close request");
    assert_eq!(received.command(), command::CLOSE_CONNECTION);

    // ...and its empty answer lets the client drop the connection
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut disconnected = false;
    while let Some(event) =
        next_event(&mut client_events, deadline.saturating_duration_since(Instant::now())).await
    {
        if matches!(event, SocketEvent::Disconnected(_)) {
            disconnected = true;
            break;
        }
    }
    assert!(disconnected);

    listener.close().await;
}

#[tokio::test]
async fn encrypted_exchange_preserves_order_per_priority() {
    register_test_commands();
    let listener = tcp::Listener::new();
    listener.listen(loopback(0)).await.unwrap();
    let mut server_events = listener.events().unwrap();

    let client = tcp::Socket::new();
    client.set_encryption(true);
    let mut client_events = client.events().unwrap();
    client.init(listener.local_point());
    client.connect();
    assert!(wait_connected(&mut client_events, Duration::from_secs(5)).await);
    assert!(client.encryption());

    let mut rng = rand::thread_rng();
    let mut normal_ids = Vec::new();
    let mut low_ids = Vec::new();
    let total = 200;
    for i in 0..total {
        let size = rng.gen_range(1..=4096);
        let payload: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
        let mut m = Message::create(TEST_BULK, SerializeFormat::QBinary);
        m.set_content(payload, SerializeFormat::QBinary);
        if i % 2 == 0 {
            m.set_priority(Priority::Normal);
        } else {
            m.set_priority(Priority::Low);
        }
        let m = Arc::new(m);
        match m.priority() {
            Priority::Low => low_ids.push(m.id()),
            _ => normal_ids.push(m.id()),
        }
        assert!(client.send(&m));
    }

    let mut received_normal = Vec::new();
    let mut received_low = Vec::new();
    while received_normal.len() + received_low.len() < total {
        let m = wait_message(&mut server_events, Duration::from_secs(10))
            .await
            .expect("all encrypted messages arrive");
        match m.priority() {
            Priority::Low => received_low.push(m.id()),
            _ => received_normal.push(m.id()),
        }
    }
    // Exactly once, in order within each priority
    assert_eq!(received_normal, normal_ids);
    assert_eq!(received_low, low_ids);

    client.disconnect(Duration::from_secs(3)).await;
    listener.close().await;
}

#[tokio::test]
async fn large_payload_survives_the_stream() {
    let (listener, client, mut client_events, mut server_events) = start_pair().await;

    // Well above the compression threshold; over loopback the stream stays
    // uncompressed but the payload must arrive intact either way
    let payload = b"abcdefgh".repeat(16 * 1024);
    let mut m = Message::create(TEST_BULK, SerializeFormat::QBinary);
    m.set_content(payload.clone(), SerializeFormat::QBinary);
    let m = Arc::new(m);
    assert!(client.send(&m));

    let received = wait_message(&mut server_events, Duration::from_secs(5))
        .await
        .expect("bulk message arrives");
    assert_eq!(received.content().unwrap(), payload);
    assert_eq!(received.compression(), pproto::Compression::None);

    let answer = Arc::new(received.clone_for_answer());
    listener.send(&answer, &SocketDescriptorSet::new());
    let answer = wait_message(&mut client_events, Duration::from_secs(3)).await.unwrap();
    assert!(answer.content_is_empty());

    client.disconnect(Duration::from_secs(3)).await;
    listener.close().await;
}
