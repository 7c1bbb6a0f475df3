//! End-to-end tests of the UNIX-domain transport, including the JSON-framed
//! connection flavor.

use pproto::commands::{self, MessageError};
use pproto::message::{Message, MessagePtr, MessageType, SerializeFormat};
use pproto::transport::{unix, EventReceiver, SocketEvent};
use pproto::{registry, SocketDescriptorSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use uuid::Uuid;

const TEST_LOCAL: Uuid = Uuid::from_u128(0x44a6b001_cd72_46d5_b182_3a4b5c6d7e8f);

fn socket_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("pproto-{tag}-{}.sock", std::process::id()))
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

#[tokio::test]
async fn qbinary_exchange_over_unix_socket() {
    registry::register(TEST_LOCAL, "TestLocal", false);
    let path = socket_path("qbinary");

    let listener = unix::Listener::new();
    listener.listen(&path).await.unwrap();
    let mut server_events = listener.events().unwrap();

    let client = unix::Socket::new();
    let mut client_events = client.events().unwrap();
    client.init(&path);
    client.connect();
    assert!(wait_connected(&mut client_events, Duration::from_secs(5)).await);
    assert!(client.is_local());

    let mut m = Message::create(TEST_LOCAL, SerializeFormat::QBinary);
    m.set_content(b"local payload".to_vec(), SerializeFormat::QBinary);
    let m = Arc::new(m);
    assert!(client.send(&m));

    let received = wait_message(&mut server_events, Duration::from_secs(3))
        .await
        .expect("server receives over the unix socket");
    assert_eq!(received.id(), m.id());
    assert_eq!(received.socket_type(), pproto::SocketType::Local);
    assert!(!received.socket_name().is_empty());
    assert_eq!(received.content().unwrap(), b"local payload");

    client.disconnect(Duration::from_secs(3)).await;
    listener.close().await;
}

#[tokio::test]
async fn json_framed_connection_roundtrip() {
    registry::register(TEST_LOCAL, "TestLocal", false);
    let path = socket_path("json");

    let listener = unix::Listener::new();
    listener.set_message_web_flags(true);
    listener.listen(&path).await.unwrap();
    let mut server_events = listener.events().unwrap();

    let client = unix::Socket::new();
    client.set_message_format(SerializeFormat::Json);
    let mut client_events = client.events().unwrap();
    client.init(&path);
    client.connect();
    assert!(wait_connected(&mut client_events, Duration::from_secs(5)).await);

    // The listener side adopts the client's format
    let server_socket = listener.sockets().into_iter().next().expect("one active socket");
    assert_eq!(server_socket.message_format(), SerializeFormat::Json);
    assert_eq!(listener.sockets_by_format(SerializeFormat::Json).len(), 1);
    assert!(listener.sockets_by_format(SerializeFormat::QBinary).is_empty());

    // Json-framed connections carry json content
    let record = MessageError::new(3, Uuid::new_v4(), "описание ошибки");
    let mut m = Message::create(TEST_LOCAL, SerializeFormat::Json);
    commands::write_to_message(&record, &mut m).unwrap();
    let m = Arc::new(m);
    assert!(client.send(&m));

    let received = wait_message(&mut server_events, Duration::from_secs(3))
        .await
        .expect("server receives the json message");
    assert_eq!(received.id(), m.id());
    assert_eq!(received.content_format(), SerializeFormat::Json);
    let restored: MessageError = commands::read_from_message_ptr(&received).unwrap();
    assert_eq!(restored, record);

    // And the answer flows back the same way
    let mut answer = received.clone_for_answer();
    commands::write_failed(
        &mut answer,
        &commands::MessageFailed::new(1, Uuid::new_v4(), "denied"),
    )
    .unwrap();
    listener.send(&Arc::new(answer), &SocketDescriptorSet::new());

    let answer = wait_message(&mut client_events, Duration::from_secs(3)).await.unwrap();
    assert_eq!(answer.message_type(), MessageType::Answer);
    assert_eq!(answer.exec_status(), pproto::ExecStatus::Failed);

    client.disconnect(Duration::from_secs(3)).await;
    listener.close().await;
}

#[tokio::test]
async fn json_connection_refuses_binary_content() {
    registry::register(TEST_LOCAL, "TestLocal", false);
    let path = socket_path("json-guard");

    let listener = unix::Listener::new();
    listener.listen(&path).await.unwrap();
    let mut server_events = listener.events().unwrap();

    let client = unix::Socket::new();
    client.set_message_format(SerializeFormat::Json);
    let mut client_events = client.events().unwrap();
    client.init(&path);
    client.connect();
    assert!(wait_connected(&mut client_events, Duration::from_secs(5)).await);

    // Content in the wrong format is dropped at the sender, not delivered
    let mut m = Message::create(TEST_LOCAL, SerializeFormat::Json);
    m.set_content(vec![0x00, 0x01, 0x02], SerializeFormat::QBinary);
    assert!(client.send(&Arc::new(m)));
    assert!(wait_message(&mut server_events, Duration::from_millis(700)).await.is_none());

    client.disconnect(Duration::from_secs(3)).await;
    listener.close().await;
}
