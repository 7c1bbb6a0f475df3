//! PProto Messaging Protocol
//!
//! Asynchronous request/response/event messaging for process-to-process
//! communication over stream sockets (TCP and UNIX domain) and, for small
//! notifications, over UDP datagrams. Endpoints exchange typed messages
//! identified by stable UUID command codes; this crate provides the wire
//! format, the per-connection state machine and the connection listeners.
//!
//! The building blocks:
//! - [`message::Message`] is the envelope: identity, bit-packed flags and an
//!   opaque, separately serialized content payload.
//! - [`codec`] holds the two serialization envelopes: the versioned binary
//!   `qbinary` format and the JSON format.
//! - [`transport`] holds the socket engines: the framed stream loop shared by
//!   TCP and UNIX sockets, the connection listeners and the datagram socket.
//! - [`registry`] is the process-wide command registry, [`dispatch`] the
//!   command-to-handler lookup.

pub mod codec;
pub mod commands;
pub mod dispatch;
pub mod error;
pub mod host_point;
pub mod message;
pub mod registry;
pub mod routing;
pub mod transport;

pub(crate) mod compress;
pub(crate) mod queue;

pub use error::{Error, Result};
pub use host_point::HostPoint;
pub use message::{Compression, ExecStatus, Message, MessagePtr, MessageType, Priority, SerializeFormat};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lower bound of the binary protocol version window this build understands.
pub const PROTOCOL_VERSION_LOW: u16 = 1;

/// Upper bound of the binary protocol version window this build understands.
pub const PROTOCOL_VERSION_HIGH: u16 = 2;

/// Socket kind a message was received from, carried as transient metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum SocketType {
    Unknown = 0,
    /// UNIX domain socket.
    Local = 1,
    Tcp = 2,
    Udp = 3,
}

impl Default for SocketType {
    fn default() -> Self {
        SocketType::Unknown
    }
}

impl SocketType {
    pub fn from_u32(val: u32) -> Self {
        match val {
            1 => SocketType::Local,
            2 => SocketType::Tcp,
            3 => SocketType::Udp,
            _ => SocketType::Unknown,
        }
    }
}

/// Opaque socket handle with OS file descriptor semantics; `-1` = no socket.
pub type SocketDescriptor = i64;

/// Sentinel descriptor value meaning "no socket".
pub const NO_SOCKET: SocketDescriptor = -1;

pub type SocketDescriptorSet = HashSet<SocketDescriptor>;

/// Checks whether a peer's protocol version window overlaps ours.
///
/// The windows are compatible when `peer_high >= my_low` and
/// `peer_low <= my_high`.
pub fn protocol_compatible(peer_low: u16, peer_high: u16, my_low: u16, my_high: u16) -> bool {
    peer_high >= my_low && peer_low <= my_high
}

static PROXY_ID: AtomicU64 = AtomicU64::new(0);

/// Returns the process-wide proxy id stamped onto newly created messages
/// (0 = unset).
pub fn proxy_id() -> u64 {
    PROXY_ID.load(Ordering::Relaxed)
}

/// Sets the process-wide proxy id for this network node.
pub fn set_proxy_id(val: u64) {
    PROXY_ID.store(val, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_window_overlap() {
        assert!(protocol_compatible(1, 2, 1, 2));
        assert!(protocol_compatible(2, 5, 1, 2));
        assert!(protocol_compatible(1, 1, 1, 2));
        assert!(!protocol_compatible(100, 100, 1, 2));
        assert!(!protocol_compatible(1, 1, 3, 4));
    }

    #[test]
    fn test_socket_type_from_u32() {
        assert_eq!(SocketType::from_u32(1), SocketType::Local);
        assert_eq!(SocketType::from_u32(2), SocketType::Tcp);
        assert_eq!(SocketType::from_u32(3), SocketType::Udp);
        assert_eq!(SocketType::from_u32(7), SocketType::Unknown);
    }
}
