//! UDP Transport
//!
//! Single-datagram messaging: one datagram carries one qbinary-serialized
//! message prefixed by the process-wide datagram signature. No framing, no
//! compression, no encryption; messages that will not fit an unfragmented
//! datagram are sent anyway with a warning. The engine is one bind-loop task
//! draining the same 3-priority queue the stream sockets use.

use crate::codec::qbinary::{BReader, BWriter};
use crate::commands::{self, command, Unknown};
use crate::host_point::HostPoint;
use crate::message::{Message, MessagePtr, SerializeFormat};
use crate::queue::SendQueue;
use crate::registry::{self, command_label};
use crate::transport::{EventReceiver, EventSender, SocketEvent};
use crate::{SocketDescriptor, SocketType, NO_SOCKET};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket as TokioUdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Datagram signature opening every message.
#[cfg(not(feature = "udp-longsig"))]
pub const SIGNATURE: u32 = u32::from_be_bytes(*b"PPRT");
#[cfg(feature = "udp-longsig")]
pub const SIGNATURE: u64 = u64::from_be_bytes(*b"PPROTOv1");

#[cfg(not(feature = "udp-longsig"))]
pub const SIGNATURE_LEN: usize = 4;
#[cfg(feature = "udp-longsig")]
pub const SIGNATURE_LEN: usize = 8;

/// Payloads above this leave the safe single-datagram territory.
const DATAGRAM_WARN_SIZE: usize = 500;

struct UdpShared {
    queue: Mutex<SendQueue>,
    internal: Mutex<VecDeque<MessagePtr>>,
    notify: Notify,
    unknown_commands: Mutex<HashSet<Uuid>>,
    check_unknown_commands: AtomicBool,
    discard_addresses: Mutex<Vec<IpAddr>>,
    events_tx: Mutex<EventSender>,
    events_rx: Mutex<Option<EventReceiver>>,
    bind_point: Mutex<HostPoint>,
    descriptor: AtomicI64,
    bound: AtomicBool,
    running: AtomicBool,
    stop: AtomicBool,
    stop_notify: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Datagram socket.
pub struct Socket {
    shared: Arc<UdpShared>,
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(UdpShared {
                queue: Mutex::new(SendQueue::new()),
                internal: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                unknown_commands: Mutex::new(HashSet::new()),
                check_unknown_commands: AtomicBool::new(true),
                discard_addresses: Mutex::new(Vec::new()),
                events_tx: Mutex::new(events_tx),
                events_rx: Mutex::new(Some(events_rx)),
                bind_point: Mutex::new(HostPoint::null()),
                descriptor: AtomicI64::new(NO_SOCKET),
                bound: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                stop_notify: Notify::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Sets the bind point; rejected while the worker runs.
    pub fn init(&self, bind_point: HostPoint) -> bool {
        if self.is_running() {
            error!("Impossible execute a initialization because Socket worker is running");
            return false;
        }
        *self.shared.bind_point.lock() = bind_point;
        true
    }

    /// Starts the bind-loop worker.
    pub fn start(&self) {
        if self.is_running() {
            return;
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        let task = tokio::spawn(run(shared));
        *self.shared.task.lock() = Some(task);
    }

    /// Signals the worker to exit and waits up to `timeout` for it.
    pub async fn stop(&self, timeout_duration: Duration) {
        self.shared.stop.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a worker between two waits still
        // observes the stop
        self.shared.stop_notify.notify_one();
        self.shared.notify.notify_one();
        let task = self.shared.task.lock().take();
        if let Some(task) = task {
            if timeout(timeout_duration, task).await.is_err() {
                debug!("UDP socket worker did not finish within {timeout_duration:?}");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_bound(&self) -> bool {
        self.shared.bound.load(Ordering::SeqCst)
    }

    /// Waits up to `seconds` for the socket to be bound.
    pub async fn wait_binding(&self, seconds: u64) {
        if seconds == 0 || self.is_bound() {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(seconds);
        while Instant::now() < deadline {
            if self.shared.stop.load(Ordering::SeqCst) || self.is_bound() {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn bind_point(&self) -> HostPoint {
        *self.shared.bind_point.lock()
    }

    pub fn socket_descriptor(&self) -> SocketDescriptor {
        self.shared.descriptor.load(Ordering::SeqCst)
    }

    /// Inbound datagrams from these addresses, paired with the local bind
    /// port, are dropped. Shields a broadcast listener from its own
    /// datagrams.
    pub fn discard_addresses(&self) -> Vec<IpAddr> {
        self.shared.discard_addresses.lock().clone()
    }

    pub fn set_discard_addresses(&self, addresses: Vec<IpAddr>) {
        *self.shared.discard_addresses.lock() = addresses;
    }

    pub fn check_unknown_commands(&self) -> bool {
        self.shared.check_unknown_commands.load(Ordering::SeqCst)
    }

    pub fn set_check_unknown_commands(&self, val: bool) {
        self.shared.check_unknown_commands.store(val, Ordering::SeqCst);
    }

    /// Queues a message for sending.
    pub fn send(&self, message: &MessagePtr) -> bool {
        if !self.is_running() {
            error!(
                "Socket is not active. Command {} discarded",
                command_label(&message.command())
            );
            return false;
        }
        if self.check_unknown_commands()
            && self.shared.unknown_commands.lock().contains(&message.command())
        {
            error!(
                "Command {} is unknown for remote side. Command discarded",
                command_label(&message.command())
            );
            return false;
        }
        trace!(
            "Message added to queue to sending. Id: {}. Command: {}",
            message.id(),
            command_label(&message.command())
        );
        self.shared.queue.lock().push(message.clone());
        self.shared.notify.notify_one();
        true
    }

    pub fn remove(&self, command: &Uuid) {
        self.shared.queue.lock().remove(command);
    }

    pub fn messages_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Takes the event channel.
    pub fn events(&self) -> Option<EventReceiver> {
        self.shared.events_rx.lock().take()
    }
}

async fn run(shared: Arc<UdpShared>) {
    let bind_point = *shared.bind_point.lock();
    let socket = match TokioUdpSocket::bind(bind_point.to_socket_addr()).await {
        Ok(socket) => socket,
        Err(e) => {
            error!("Failed bind UDP socket. Detail: {e}");
            return;
        }
    };
    if let Ok(local) = socket.local_addr() {
        *shared.bind_point.lock() = local.into();
    }
    shared.descriptor.store(socket.as_raw_fd() as SocketDescriptor, Ordering::SeqCst);
    shared.bound.store(true, Ordering::SeqCst);
    shared.running.store(true, Ordering::SeqCst);
    debug!("UDP socket is successfully bound to point {}", shared.bind_point.lock());

    let mut recv_buf = vec![0u8; 64 * 1024];
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }
        while let Some(message) = next_message(&shared) {
            send_datagram(&socket, &message, &shared).await;
            if shared.stop.load(Ordering::SeqCst) {
                break;
            }
        }
        tokio::select! {
            _ = shared.notify.notified() => {}
            _ = shared.stop_notify.notified() => break,
            received = socket.recv_from(&mut recv_buf) => match received {
                Ok((size, addr)) => process_datagram(&recv_buf[..size], addr.into(), &socket, &shared),
                Err(e) => {
                    error!("Failed read datagram. Detail: {e}");
                }
            }
        }
    }

    shared.bound.store(false, Ordering::SeqCst);
    shared.running.store(false, Ordering::SeqCst);
    shared.descriptor.store(NO_SOCKET, Ordering::SeqCst);
}

fn next_message(shared: &Arc<UdpShared>) -> Option<MessagePtr> {
    if let Some(message) = shared.internal.lock().pop_front() {
        return Some(message);
    }
    shared.queue.lock().next()
}

async fn send_datagram(socket: &TokioUdpSocket, message: &MessagePtr, shared: &Arc<UdpShared>) {
    trace!(
        "Message before sending to the UDP socket. Id: {}. Command: {}",
        message.id(),
        command_label(&message.command())
    );
    if message.wire_size() > DATAGRAM_WARN_SIZE {
        warn!(
            "Too large message to send it through a UDP socket. The message may be lost. \
             Command: {}",
            command_label(&message.command())
        );
    }

    let mut w = BWriter::with_capacity(message.wire_size() + SIGNATURE_LEN);
    write_signature(&mut w);
    message.write_qbinary(&mut w);
    let datagram = w.into_inner();

    if !message.destination_points().is_empty() {
        for point in message.destination_points() {
            if let Err(e) = socket.send_to(&datagram, point.to_socket_addr()).await {
                error!("Failed send datagram to {point}. Detail: {e}");
            }
        }
        trace!(
            "Message was sent to {} addresses. Id: {}. Command: {}",
            message.destination_points().len(),
            message.id(),
            command_label(&message.command())
        );
    } else if !message.source_point().is_null() {
        let point = message.source_point();
        if let Err(e) = socket.send_to(&datagram, point.to_socket_addr()).await {
            error!("Failed send datagram to {point}. Detail: {e}");
        } else {
            trace!(
                "Message was sent to the address: {point}. Id: {}. Command: {}",
                message.id(),
                command_label(&message.command())
            );
        }
    } else {
        error!(
            "Impossible send message: {}. Id: {}. Destination host point is undefined. \
             Message discarded",
            command_label(&message.command()),
            message.id()
        );
    }
}

fn process_datagram(
    datagram: &[u8],
    source: HostPoint,
    socket: &TokioUdpSocket,
    shared: &Arc<UdpShared>,
) {
    if datagram.len() < SIGNATURE_LEN {
        error!("Datagram size less than the signature length. Source: {source}");
        return;
    }

    let discard = {
        let discard = shared.discard_addresses.lock();
        discard.contains(&source.address()) && source.port() == shared.bind_point.lock().port()
    };
    if discard {
        trace!("Raw message discarded. Source: {source}");
        return;
    }

    let mut r = BReader::new(datagram);
    if !signature_matches(&mut r) {
        trace!("Raw message incompatible signature, discarded. Source: {source}");
        return;
    }
    let mut message = match Message::read_qbinary(&mut r) {
        Ok(message) => message,
        Err(e) => {
            error!("Failed deserialize datagram message. Source: {source}. Detail: {e}");
            return;
        }
    };
    message.set_socket_type(SocketType::Udp);
    message.set_socket_descriptor(NO_SOCKET);
    message.set_source_point(source);
    let message: MessagePtr = Arc::new(message);

    trace!(
        "Message received. Id: {}. Command: {}. Source: {source}",
        message.id(),
        command_label(&message.command())
    );

    if shared.check_unknown_commands.load(Ordering::SeqCst) {
        if message.command() == command::UNKNOWN {
            match commands::read_from_message_ptr::<Unknown>(&message) {
                Ok(unknown) => {
                    error!(
                        "Command {} is unknown for the remote side. Remote host: {}:{}. \
                         Socket descriptor: {}",
                        command_label(&unknown.command_id),
                        unknown.address,
                        unknown.port,
                        unknown.socket_descriptor
                    );
                    shared.unknown_commands.lock().insert(unknown.command_id);
                }
                Err(_) => {
                    error!(
                        "Incorrect data structure for command {}",
                        command_label(&message.command())
                    );
                }
            }
            return;
        }
        if registry::command_exists(&message.command()) == 0 {
            let local = *shared.bind_point.lock();
            let unknown = Unknown {
                command_id: message.command(),
                socket_type: SocketType::Udp,
                socket_descriptor: socket.as_raw_fd() as u64,
                socket_name: String::new(),
                address: local.address(),
                port: local.port(),
            };
            error!(
                "Unknown command: {}. Host: {}:{}",
                unknown.command_id,
                unknown.address,
                unknown.port
            );
            if let Ok(mut reply) = commands::create_message(&unknown, SerializeFormat::QBinary) {
                reply.set_priority(crate::message::Priority::High);
                reply.set_source_point(source);
                shared.internal.lock().push_back(Arc::new(reply));
                shared.notify.notify_one();
            }
            return;
        }
    }

    let _ = shared.events_tx.lock().send(SocketEvent::Message(message));
}

fn write_signature(w: &mut BWriter) {
    #[cfg(not(feature = "udp-longsig"))]
    w.write_u32(SIGNATURE);
    #[cfg(feature = "udp-longsig")]
    w.write_u64(SIGNATURE);
}

fn signature_matches(r: &mut BReader<'_>) -> bool {
    #[cfg(not(feature = "udp-longsig"))]
    {
        r.read_u32().map(|sig| sig == SIGNATURE).unwrap_or(false)
    }
    #[cfg(feature = "udp-longsig")]
    {
        r.read_u64().map(|sig| sig == SIGNATURE).unwrap_or(false)
    }
}
