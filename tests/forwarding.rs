//! End-to-end test of the two-point forwarder relaying commands and answers
//! between clients of one listener.

use pproto::host_point::HostPoint;
use pproto::message::{Message, MessagePtr, MessageType, SerializeFormat};
use pproto::routing::{RouteCommands, RoutePoint};
use pproto::transport::{tcp, EventReceiver, SocketEvent};
use pproto::registry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use uuid::Uuid;

const TEST_RELAY: Uuid = Uuid::from_u128(0x66c8d223_ef94_48f7_93ba_5c6d7e8f9a01);

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
async fn command_and_answer_cross_the_relay() {
    registry::register(TEST_RELAY, "TestRelay", false);

    let listener = tcp::Listener::new();
    listener.listen(HostPoint::new("127.0.0.1".parse().unwrap(), 0)).await.unwrap();
    let mut server_events = listener.events().unwrap();

    let first = tcp::Socket::new();
    let mut first_events = first.events().unwrap();
    first.init(listener.local_point());
    first.connect();
    assert!(wait_connected(&mut first_events, Duration::from_secs(5)).await);

    let second = tcp::Socket::new();
    let mut second_events = second.events().unwrap();
    second.init(listener.local_point());
    second.connect();
    assert!(wait_connected(&mut second_events, Duration::from_secs(5)).await);

    // The first client announces itself so the relay can tell the two
    // server-side sockets apart
    let hello = Arc::new(Message::create(TEST_RELAY, SerializeFormat::QBinary));
    assert!(first.send(&hello));
    let hello_seen = wait_message(&mut server_events, Duration::from_secs(3)).await.unwrap();
    let first_descriptor = hello_seen.socket_descriptor();

    let sockets = listener.sockets();
    assert_eq!(sockets.len(), 2);
    let first_side = listener.socket_by_descriptor(first_descriptor).unwrap();
    let second_side = sockets
        .into_iter()
        .find(|s| s.socket_descriptor() != first_descriptor)
        .unwrap();

    let mut route = RouteCommands::default();
    route.commands.insert(TEST_RELAY);
    route.point1 = RoutePoint::new("first", Some(first_side));
    route.point2 = RoutePoint::new("second", Some(second_side));

    // Forward the announced command across to the second client
    assert!(route.forward(&hello_seen));
    let relayed = wait_message(&mut second_events, Duration::from_secs(3))
        .await
        .expect("second client receives the relayed command");
    assert_eq!(relayed.id(), hello_seen.id());
    assert_eq!(relayed.message_type(), MessageType::Command);

    // The second client answers; the relay matches the pending id and sends
    // it back to the first client
    let answer = Arc::new(relayed.clone_for_answer());
    assert!(second.send(&answer));
    let answer_seen = wait_message(&mut server_events, Duration::from_secs(3)).await.unwrap();
    assert_eq!(answer_seen.message_type(), MessageType::Answer);
    assert!(route.forward(&answer_seen));

    let delivered = wait_message(&mut first_events, Duration::from_secs(3))
        .await
        .expect("first client receives the relayed answer");
    assert_eq!(delivered.id(), hello_seen.id());
    assert_eq!(delivered.message_type(), MessageType::Answer);

    // A second copy of the answer misses the pending record and is refused
    assert!(!route.forward(&answer_seen));

    first.disconnect(Duration::from_secs(3)).await;
    second.disconnect(Duration::from_secs(3)).await;
    listener.close().await;
}
