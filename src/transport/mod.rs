//! Transport Layer
//!
//! Socket engines for the protocol: the framed stream engine shared by TCP
//! and UNIX-domain sockets, the connection listeners, and the single-datagram
//! UDP engine. A connection negotiates its message format and encryption
//! through a 16-byte protocol signature before any message travels.

use crate::message::{MessagePtr, SerializeFormat};
use crate::{SocketDescriptor, SocketDescriptorSet};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

pub mod tcp;
pub mod udp;
pub mod unix;

pub(crate) mod crypto;
pub(crate) mod frame;
pub(crate) mod stream;

pub use stream::{ProtocolCompatibility, StreamSocket};

/// Properties copied from a listener to every socket it admits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Properties {
    /// Stream compression level: -1 is the zip default level, 0 disables
    /// compression, 1..=9 match the zip levels.
    pub compression_level: i32,
    /// Serialized size in bytes above which a stream frame is compressed.
    pub compression_size: usize,
    /// Whether to verify the protocol version windows after connecting.
    pub check_protocol_compatibility: bool,
    /// Listener-side requirement to accept encrypted connections only.
    pub only_encrypted: bool,
    /// Mirror the binary message flags as a human-readable `webFlags` object
    /// in JSON serialization.
    pub message_web_flags: bool,
    /// Whether to answer unregistered inbound commands with `Unknown` and to
    /// suppress sends of commands the peer reported unknown.
    pub check_unknown_commands: bool,
    /// Socket or listener name used as a logging prefix.
    pub name: String,
    /// Protocol version window advertised by this endpoint.
    pub protocol_version_low: u16,
    pub protocol_version_high: u16,
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            compression_level: -1,
            compression_size: 1024,
            check_protocol_compatibility: true,
            only_encrypted: false,
            message_web_flags: false,
            check_unknown_commands: true,
            name: String::new(),
            protocol_version_low: crate::PROTOCOL_VERSION_LOW,
            protocol_version_high: crate::PROTOCOL_VERSION_HIGH,
        }
    }
}

/// Notifications a socket delivers to the application.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The connection is established and the protocol versions are
    /// compatible.
    Connected(SocketDescriptor),
    /// The connection is gone.
    Disconnected(SocketDescriptor),
    /// An inbound message passed the engine filters.
    Message(MessagePtr),
}

pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<SocketEvent>;
pub(crate) type EventSender = tokio::sync::mpsc::UnboundedSender<SocketEvent>;

/// One row of the process-wide protocol signature table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProtocolSign {
    pub message_format: SerializeFormat,
    pub encryption: bool,
    pub signature: Uuid,
}

/// Signature registry: the 16 bytes a connection opens with select the
/// message format and the encryption mode for its whole lifetime.
pub(crate) const PROTOCOL_SIGNATURES: [ProtocolSign; 4] = [
    ProtocolSign {
        message_format: SerializeFormat::QBinary,
        encryption: false,
        signature: Uuid::from_u128(0x82c40273_4037_4f1b_a823_38123435b22f),
    },
    ProtocolSign {
        message_format: SerializeFormat::Json,
        encryption: false,
        signature: Uuid::from_u128(0xfea6b958_dafb_4f5c_b620_fe0aafbd47e2),
    },
    ProtocolSign {
        message_format: SerializeFormat::QBinary,
        encryption: true,
        signature: Uuid::from_u128(0x6ae8b2c0_4fac_4ac5_ac87_138e0bc33a39),
    },
    ProtocolSign {
        message_format: SerializeFormat::Json,
        encryption: true,
        signature: Uuid::from_u128(0x5980f24b_d518_4d38_b8dc_84e9f7aadaf3),
    },
];

pub(crate) fn signature_for(format: SerializeFormat, encryption: bool) -> Uuid {
    PROTOCOL_SIGNATURES
        .iter()
        .find(|sign| sign.message_format == format && sign.encryption == encryption)
        .map(|sign| sign.signature)
        .expect("the signature table covers every format/encryption pair")
}

pub(crate) fn lookup_signature(signature: &Uuid) -> Option<&'static ProtocolSign> {
    PROTOCOL_SIGNATURES.iter().find(|sign| sign.signature == *signature)
}

/// Sends a message to a set of stream sockets.
///
/// Event messages are broadcast to every socket not in `exclude`. Command and
/// Answer messages are routed to the sockets named by the message's
/// destination descriptors, falling back to the descriptor the message was
/// received on; a message that resolves to no socket is dropped with an
/// error.
pub fn send_to_sockets<'a, I>(sockets: I, message: &MessagePtr, exclude: &SocketDescriptorSet)
where
    I: IntoIterator<Item = &'a StreamSocket>,
{
    use crate::message::MessageType;
    use crate::registry::command_label;

    match message.message_type() {
        MessageType::Unknown => {
            error!(
                "Impossible send message: {}. Message type is 'Unknown'",
                command_label(&message.command())
            );
        }
        MessageType::Event => {
            for socket in sockets {
                if !exclude.contains(&socket.socket_descriptor()) {
                    socket.send(message);
                }
            }
        }
        MessageType::Command | MessageType::Answer => {
            if !message.destination_sockets().is_empty() {
                let mut sent = false;
                for socket in sockets {
                    if message.destination_sockets().contains(&socket.socket_descriptor()) {
                        socket.send(message);
                        sent = true;
                    }
                }
                if !sent {
                    let descriptors: Vec<String> = message
                        .destination_sockets()
                        .iter()
                        .map(|d| d.to_string())
                        .collect();
                    error!(
                        "Impossible send message: {}. Not found sockets with descriptors: {}. \
                         Message discarded",
                        command_label(&message.command()),
                        descriptors.join(" ")
                    );
                }
            } else if message.socket_descriptor() != crate::NO_SOCKET {
                let mut sent = false;
                for socket in sockets {
                    if socket.socket_descriptor() == message.socket_descriptor()
                        && socket.socket_type() == message.socket_type()
                    {
                        socket.send(message);
                        sent = true;
                        break;
                    }
                }
                if !sent {
                    error!(
                        "Impossible send message: {}. Not found socket with descriptor: {}. \
                         Message discarded",
                        command_label(&message.command()),
                        message.socket_descriptor()
                    );
                }
            } else {
                error!(
                    "Impossible send message: {}. Destination socket descriptors is undefined. \
                     Message discarded",
                    command_label(&message.command())
                );
            }
        }
    }
}
