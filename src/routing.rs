//! Command Forwarding
//!
//! A minimal two-point relay: commands from an allow-set arriving on one
//! socket are forwarded to the other, answers travel back while their
//! command is still pending, events pass through unconditionally. Every
//! forwarded command is remembered with an expiry so stale answers are
//! rejected instead of relayed.

use crate::commands::{self, ErrorData};
use crate::message::{MessagePtr, MessageType};
use crate::registry::command_label;
use crate::transport::tcp;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;
use uuid::Uuid;

/// Answers are awaited this long when the command carries no life time.
const DEFAULT_ANSWER_WINDOW_SECS: u64 = 10;

/// One relay endpoint.
#[derive(Default)]
pub struct RoutePoint {
    pub name: String,
    pub socket: Option<Arc<tcp::Socket>>,
    /// Forwarded command ids with the unix time their answer is awaited
    /// until.
    transferred: Vec<(Uuid, u64)>,
}

impl RoutePoint {
    pub fn new(name: impl Into<String>, socket: Option<Arc<tcp::Socket>>) -> Self {
        Self { name: name.into(), socket, transferred: Vec::new() }
    }
}

/// Two-point command relay.
#[derive(Default)]
pub struct RouteCommands {
    /// Commands allowed to cross the relay.
    pub commands: HashSet<Uuid>,
    pub point1: RoutePoint,
    pub point2: RoutePoint,
}

impl RouteCommands {
    /// Relays a message between the two points. Returns true when the
    /// message was forwarded.
    pub fn forward(&mut self, message: &MessagePtr) -> bool {
        if !self.commands.contains(&message.command()) {
            return false;
        }

        let now = unix_now();
        self.point1.transferred.retain(|(_, expiry)| *expiry >= now);
        self.point2.transferred.retain(|(_, expiry)| *expiry >= now);

        match relay(&mut self.point1, &mut self.point2, message, now) {
            Some(forwarded) => return forwarded,
            None => {}
        }
        match relay(&mut self.point2, &mut self.point1, message, now) {
            Some(forwarded) => return forwarded,
            None => {}
        }

        error!("Failed forwarding message {}", command_label(&message.command()));
        false
    }
}

/// Tries to relay a message that arrived on `source` over to `destination`.
/// Returns None when the message did not arrive on `source`.
fn relay(
    source: &mut RoutePoint,
    destination: &mut RoutePoint,
    message: &MessagePtr,
    now: u64,
) -> Option<bool> {
    let source_socket = source.socket.as_ref()?;
    if source_socket.socket_descriptor() != message.socket_descriptor() {
        return None;
    }

    let destination_socket = match destination.socket.as_ref() {
        Some(socket) => socket,
        None => {
            error!(
                "Unable forwarding command {} from socket '{}' to socket '{}'; \
                 Socket '{}' is not available",
                command_label(&message.command()),
                source.name,
                destination.name,
                destination.name
            );
            reply_error(
                source_socket,
                message,
                format!(
                    "Unable forwarding message to socket '{}'. Socket is not available",
                    destination.name
                ),
            );
            return Some(false);
        }
    };

    match message.message_type() {
        MessageType::Command => {
            let expiry = match message.max_time_life() {
                crate::message::TIME_LIFE_UNLIMITED => now + DEFAULT_ANSWER_WINDOW_SECS,
                // An explicit zero stamps the message as already stale, so
                // its answer window is already closed
                0 => now.saturating_sub(1),
                life => life,
            };
            source.transferred.push((message.id(), expiry));
            destination_socket.send(message);
            Some(true)
        }
        MessageType::Answer => {
            let position = destination
                .transferred
                .iter()
                .position(|(id, _)| *id == message.id());
            match position {
                Some(position) => {
                    destination.transferred.remove(position);
                    destination_socket.send(message);
                    Some(true)
                }
                None => {
                    error!(
                        "Unable forwarding command {} from socket '{}' to socket '{}'. \
                         Timeout has expired. Message id: {}",
                        command_label(&message.command()),
                        source.name,
                        destination.name,
                        message.id()
                    );
                    reply_error(
                        source_socket,
                        message,
                        format!(
                            "Unable forwarding message to socket '{}'. \
                             Timeout for this message has expired",
                            destination.name
                        ),
                    );
                    Some(false)
                }
            }
        }
        _ => {
            destination_socket.send(message);
            Some(true)
        }
    }
}

fn reply_error(socket: &Arc<tcp::Socket>, message: &MessagePtr, description: String) {
    let err = ErrorData {
        command_id: message.command(),
        message_id: message.id(),
        description,
        ..Default::default()
    };
    match commands::create_message(&err, message.content_format()) {
        Ok(m) => {
            socket.send(&Arc::new(m));
        }
        Err(e) => error!("Failed serialize forwarding error. Detail: {e}"),
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
