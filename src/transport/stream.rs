//! Stream Socket Engine
//!
//! The per-connection state machine shared by the TCP and UNIX transports.
//! A connection walks through signature exchange, optional key exchange and
//! the protocol compatibility check, then settles into the framed
//! read/write loop: the writer drains the priority queues, the reader
//! deframes, filters the service commands (compatibility, close, echo,
//! unknown) and delivers everything else to the application event channel.
//!
//! The engine runs as two tokio tasks sharing one [`Shared`] state: a writer
//! parked on the queue notifier and a reader parked on the socket. All
//! deadlines of the protocol live here: 3/6 second signature reads, the
//! 200 ms grace before dropping a rejected connection and the echo liveness
//! timer with its listener-side slack.

use crate::commands::{self, command, CloseConnection, Unknown};
use crate::error::{Error, Result};
use crate::host_point::HostPoint;
use crate::message::{Compression, Message, MessagePtr, MessageType, SerializeFormat};
use crate::queue::SendQueue;
use crate::registry::{self, command_label};
use crate::transport::crypto::{self, SessionCrypto, PUBLIC_KEY_LEN};
use crate::transport::frame;
use crate::transport::{
    lookup_signature, signature_for, EventReceiver, EventSender, Properties, SocketEvent,
};
use crate::{SocketDescriptor, SocketType, NO_SOCKET};
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, trace};
use uuid::Uuid;

/// Base cadence of the engine loops.
pub(crate) const DELAY: Duration = Duration::from_millis(50);

/// Client-side connect deadline.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

const SIGNATURE_TIMEOUT_LISTENER: Duration = Duration::from_secs(3);
const SIGNATURE_TIMEOUT_CLIENT: Duration = Duration::from_secs(6);

/// Pause before dropping a connection rejected at signature exchange, long
/// enough for the zero signature to reach the peer.
const REJECT_GRACE: Duration = Duration::from_millis(200);

/// Extra slack a listener grants before declaring the echo dead, covering
/// the round trip to the client.
const ECHO_LISTENER_GRACE: Duration = Duration::from_secs(5);

/// Result of the protocol version window check on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolCompatibility {
    Unknown,
    Yes,
    No,
}

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub(crate) type BoxedStream = Box<dyn AsyncStream>;

/// Connection endpoint metadata fixed at accept/connect time.
#[derive(Debug, Clone, Default)]
pub(crate) struct PeerInfo {
    pub socket_type: SocketType,
    pub descriptor: SocketDescriptor,
    pub point: HostPoint,
    pub socket_name: String,
    pub is_local: bool,
}

#[derive(Debug)]
pub(crate) struct EngineState {
    pub descriptor: SocketDescriptor,
    pub socket_connected: bool,
    pub compatibility: ProtocolCompatibility,
    pub message_format: SerializeFormat,
    pub encryption: bool,
    pub echo_timeout_ms: i64,
    pub listener_side: bool,
    pub is_local: bool,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            descriptor: NO_SOCKET,
            socket_connected: false,
            compatibility: ProtocolCompatibility::Unknown,
            message_format: SerializeFormat::QBinary,
            encryption: false,
            echo_timeout_ms: 0,
            listener_side: false,
            is_local: false,
        }
    }
}

#[derive(Debug, Default)]
struct EchoState {
    deadline: Option<Instant>,
    pending: Option<Uuid>,
}

pub(crate) struct Shared {
    pub socket_type: SocketType,
    pub props: Mutex<Properties>,
    pub state: Mutex<EngineState>,
    queue: Mutex<SendQueue>,
    internal: Mutex<VecDeque<MessagePtr>>,
    notify: Notify,
    unknown_commands: Mutex<HashSet<Uuid>>,
    events_tx: Mutex<EventSender>,
    events_rx: Mutex<Option<EventReceiver>>,
    stop: AtomicBool,
    stop_notify: Notify,
    running: AtomicBool,
    close_ack: Mutex<Option<Uuid>>,
    echo: Mutex<EchoState>,
    pub(crate) task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn new(socket_type: SocketType) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            socket_type,
            props: Mutex::new(Properties::default()),
            state: Mutex::new(EngineState::default()),
            queue: Mutex::new(SendQueue::new()),
            internal: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            unknown_commands: Mutex::new(HashSet::new()),
            events_tx: Mutex::new(events_tx),
            events_rx: Mutex::new(Some(events_rx)),
            stop: AtomicBool::new(false),
            stop_notify: Notify::new(),
            running: AtomicBool::new(false),
            close_ack: Mutex::new(None),
            echo: Mutex::new(EchoState::default()),
            task: Mutex::new(None),
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// The running flag goes up when the worker is started, before the
    /// connection exists, so messages can be queued while it establishes.
    pub(crate) fn set_running(&self, val: bool) {
        self.running.store(val, Ordering::SeqCst);
        if !val {
            self.stop.store(false, Ordering::SeqCst);
        }
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        self.notify.notify_one();
    }

    fn push_internal(&self, message: Message) {
        self.internal.lock().push_back(Arc::new(message));
        self.notify.notify_one();
    }

    fn emit(&self, event: SocketEvent) {
        let _ = self.events_tx.lock().send(event);
    }

    fn emit_message(&self, message: MessagePtr) {
        trace!(
            "Message emit. Id: {}. Command: {}",
            message.id(),
            command_label(&message.command())
        );
        self.emit(SocketEvent::Message(message));
    }
}

/// Common surface of a stream socket, shared by the TCP and UNIX flavors.
pub struct StreamSocket {
    pub(crate) shared: Arc<Shared>,
}

impl StreamSocket {
    pub(crate) fn new(socket_type: SocketType) -> Self {
        Self { shared: Arc::new(Shared::new(socket_type)) }
    }

    /// Queues a message for sending. Returns false when the socket is not
    /// running or the message command is known to be unknown to the peer.
    pub fn send(&self, message: &MessagePtr) -> bool {
        if !self.is_running() {
            error!(
                "Socket is not active. Command {} discarded",
                command_label(&message.command())
            );
            return false;
        }
        if self.shared.props.lock().check_unknown_commands
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

    /// Removes queued messages with this command id.
    pub fn remove(&self, command: &Uuid) {
        self.shared.queue.lock().remove(command);
    }

    /// Number of messages waiting in the send queues.
    pub fn messages_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// True once the connection is established and the protocol versions
    /// proved compatible.
    pub fn is_connected(&self) -> bool {
        let state = self.shared.state.lock();
        state.socket_connected && state.compatibility == ProtocolCompatibility::Yes
    }

    /// True while the underlying socket connection exists, regardless of the
    /// compatibility check.
    pub fn socket_is_connected(&self) -> bool {
        self.shared.state.lock().socket_connected
    }

    /// True for UNIX sockets and TCP sockets talking to localhost.
    pub fn is_local(&self) -> bool {
        if self.shared.socket_type == SocketType::Local {
            return true;
        }
        let state = self.shared.state.lock();
        state.socket_connected && state.is_local
    }

    pub fn protocol_compatible(&self) -> ProtocolCompatibility {
        self.shared.state.lock().compatibility
    }

    pub fn socket_type(&self) -> SocketType {
        self.shared.socket_type
    }

    pub fn socket_descriptor(&self) -> SocketDescriptor {
        self.shared.state.lock().descriptor
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Message serialization format of the connection. Settable only on a
    /// client socket before connecting; the listener side adopts the format
    /// of the connecting client.
    pub fn message_format(&self) -> SerializeFormat {
        self.shared.state.lock().message_format
    }

    pub fn set_message_format(&self, format: SerializeFormat) {
        let mut state = self.shared.state.lock();
        if state.socket_connected || state.listener_side {
            return;
        }
        state.message_format = format;
    }

    /// Whether frames are encrypted. Settable only on a client socket before
    /// connecting; the listener side adopts the client's mode.
    pub fn encryption(&self) -> bool {
        self.shared.state.lock().encryption
    }

    pub fn set_encryption(&self, encryption: bool) {
        let mut state = self.shared.state.lock();
        if state.socket_connected || state.listener_side {
            return;
        }
        state.encryption = encryption;
    }

    /// Echo timeout in seconds; zero or negative disables the liveness
    /// probe. Settable only on a client socket before connecting.
    pub fn echo_timeout(&self) -> i64 {
        self.shared.state.lock().echo_timeout_ms / 1000
    }

    pub fn set_echo_timeout(&self, seconds: i64) {
        let mut state = self.shared.state.lock();
        if state.socket_connected || state.listener_side {
            return;
        }
        state.echo_timeout_ms = seconds * 1000;
    }

    pub fn compression_level(&self) -> i32 {
        self.shared.props.lock().compression_level
    }

    pub fn set_compression_level(&self, level: i32) {
        self.shared.props.lock().compression_level = level.clamp(-1, 9);
    }

    pub fn compression_size(&self) -> usize {
        self.shared.props.lock().compression_size
    }

    pub fn set_compression_size(&self, size: usize) {
        self.shared.props.lock().compression_size = size;
    }

    pub fn check_protocol_compatibility(&self) -> bool {
        self.shared.props.lock().check_protocol_compatibility
    }

    pub fn set_check_protocol_compatibility(&self, val: bool) {
        self.shared.props.lock().check_protocol_compatibility = val;
    }

    pub fn check_unknown_commands(&self) -> bool {
        self.shared.props.lock().check_unknown_commands
    }

    pub fn set_check_unknown_commands(&self, val: bool) {
        self.shared.props.lock().check_unknown_commands = val;
    }

    pub fn message_web_flags(&self) -> bool {
        self.shared.props.lock().message_web_flags
    }

    pub fn set_message_web_flags(&self, val: bool) {
        self.shared.props.lock().message_web_flags = val;
    }

    pub fn name(&self) -> String {
        self.shared.props.lock().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.shared.props.lock().name = name.into();
    }

    /// Protocol version window advertised on this socket's handshake.
    pub fn set_protocol_versions(&self, low: u16, high: u16) {
        let mut props = self.shared.props.lock();
        props.protocol_version_low = low;
        props.protocol_version_high = high;
    }

    /// Takes the event channel; a socket delivers its events to exactly one
    /// receiver.
    pub fn events(&self) -> Option<EventReceiver> {
        self.shared.events_rx.lock().take()
    }

    pub(crate) fn set_event_sink(&self, sink: EventSender) {
        *self.shared.events_tx.lock() = sink;
        *self.shared.events_rx.lock() = None;
    }

    pub(crate) fn reset_event_sink(&self) {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.events_tx.lock() = tx;
        *self.shared.events_rx.lock() = Some(rx);
    }

    /// Waits up to `seconds` for the connection to become established and
    /// compatible.
    pub async fn wait_connected(&self, seconds: u64) {
        if seconds == 0 || self.is_connected() {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(seconds);
        while Instant::now() < deadline {
            if self.shared.stop_requested() || self.is_connected() {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Signals the engine to exit and waits up to `timeout` for it.
    pub async fn disconnect(&self, timeout_duration: Duration) {
        self.shared.request_stop();
        let task = self.shared.task.lock().take();
        if let Some(task) = task {
            if timeout(timeout_duration, task).await.is_err() {
                debug!("Socket worker did not finish within {timeout_duration:?}");
            }
        }
    }
}

// --------------------------------- Engine -----------------------------------

/// Runs the whole connection lifecycle on an established stream: handshake,
/// key exchange, compatibility check and the framed message loop. Emits
/// `Disconnected` when the connection ends.
pub(crate) async fn run_connection(stream: BoxedStream, peer: PeerInfo, shared: Arc<Shared>) {
    shared.set_running(true);
    {
        let mut state = shared.state.lock();
        state.descriptor = peer.descriptor;
        state.socket_connected = true;
        state.compatibility = ProtocolCompatibility::Unknown;
        state.is_local = peer.is_local;
    }

    let result = drive_connection(stream, &peer, &shared).await;
    if let Err(e) = result {
        if !shared.stop_requested() {
            error!("Socket error. Detail: {e}");
        }
    }

    let descriptor = {
        let mut state = shared.state.lock();
        let descriptor = state.descriptor;
        state.descriptor = NO_SOCKET;
        state.socket_connected = false;
        descriptor
    };
    let name = shared.props.lock().name.clone();
    if name.is_empty() {
        debug!("Connection closed. Socket descriptor: {descriptor}");
    } else {
        debug!("[{name}] Connection closed. Socket descriptor: {descriptor}");
    }
    shared.set_running(false);
    shared.emit(SocketEvent::Disconnected(descriptor));
}

async fn drive_connection(mut stream: BoxedStream, peer: &PeerInfo, shared: &Arc<Shared>) -> Result<()> {
    let session = handshake(&mut stream, shared).await?;
    let session = Arc::new(session);

    // The compatibility exchange opens every connection; nothing else may be
    // sent until the message format is settled, which the handshake just did.
    let (format, echo_timeout_ms, listener_side) = {
        let state = shared.state.lock();
        (state.message_format, state.echo_timeout_ms, state.listener_side)
    };
    {
        let props = shared.props.lock();
        let mut m = Message::create(command::PROTOCOL_COMPATIBLE, format);
        m.set_protocol_versions(props.protocol_version_low, props.protocol_version_high);
        drop(props);
        shared.push_internal(m);
    }
    if echo_timeout_ms > 0 && !listener_side {
        let mut m = Message::create(command::ECHO_CONNECTION, format);
        m.set_tag(echo_timeout_ms as u64, 0);
        let mut echo = shared.echo.lock();
        echo.pending = Some(m.id());
        echo.deadline = Some(echo_deadline(echo_timeout_ms, listener_side));
        drop(echo);
        shared.push_internal(m);
    }

    let (reader, writer) = tokio::io::split(stream);

    // Either loop finishing takes the whole connection down; the writer gets
    // to flush its pending service replies before the sockets drop.
    let read_task = async {
        let result = read_loop(reader, peer.clone(), shared.clone(), session.clone()).await;
        shared.request_stop();
        result
    };
    let write_task = async {
        let result = write_loop(writer, peer.clone(), shared.clone(), session.clone()).await;
        shared.request_stop();
        result
    };
    let (read_result, write_result) = tokio::join!(read_task, write_task);
    read_result.and(write_result)
}

fn echo_deadline(timeout_ms: i64, listener_side: bool) -> Instant {
    let mut deadline = Duration::from_millis(timeout_ms.max(0) as u64);
    if listener_side {
        deadline += ECHO_LISTENER_GRACE;
    }
    Instant::now() + deadline
}

// -------------------------------- Handshake ---------------------------------

async fn handshake(stream: &mut BoxedStream, shared: &Arc<Shared>) -> Result<Option<SessionCrypto>> {
    let (listener_side, format, encryption, only_encrypted) = {
        let state = shared.state.lock();
        let props = shared.props.lock();
        (state.listener_side, state.message_format, state.encryption, props.only_encrypted)
    };

    if listener_side {
        handshake_listener(stream, shared, only_encrypted).await
    } else {
        handshake_client(stream, format, encryption).await
    }
}

async fn handshake_client(
    stream: &mut BoxedStream,
    format: SerializeFormat,
    encryption: bool,
) -> Result<Option<SessionCrypto>> {
    let signature = signature_for(format, encryption);
    stream.write_all(signature.as_bytes()).await?;

    let secret = if encryption {
        let (secret, public) = crypto::generate_keypair();
        write_public_key(stream, public.as_bytes()).await?;
        Some(secret)
    } else {
        None
    };
    stream.flush().await?;
    debug!(
        "Message serialize format: {}. Encryption: {}",
        format.as_str(),
        if encryption { "yes" } else { "no" }
    );

    let incoming = read_signature(stream, SIGNATURE_TIMEOUT_CLIENT).await?;
    if incoming != signature {
        error!("Incompatible serialize signatures");
        return Err(Error::format("Incompatible serialize signatures"));
    }

    match secret {
        Some(secret) => {
            let peer_public = read_public_key(stream, SIGNATURE_TIMEOUT_CLIENT).await?;
            Ok(Some(SessionCrypto::new(&peer_public, &secret)))
        }
        None => Ok(None),
    }
}

async fn handshake_listener(
    stream: &mut BoxedStream,
    shared: &Arc<Shared>,
    only_encrypted: bool,
) -> Result<Option<SessionCrypto>> {
    let incoming = read_signature(stream, SIGNATURE_TIMEOUT_LISTENER).await?;

    let sign = lookup_signature(&incoming);
    let rejected = match sign {
        None => Some("Incompatible serialize signatures"),
        Some(sign) if only_encrypted && !sign.encryption => {
            Some("Only encrypted connections allowed. Connection will be closed")
        }
        Some(_) => None,
    };
    if let Some(reason) = rejected {
        error!("{reason}");
        // A zero signature tells the peer the rejection was deliberate; the
        // grace keeps the socket open long enough for it to arrive.
        stream.write_all(Uuid::nil().as_bytes()).await?;
        stream.flush().await?;
        sleep(REJECT_GRACE).await;
        return Err(Error::format(reason));
    }
    let sign = sign.expect("rejection handled above");

    {
        let mut state = shared.state.lock();
        state.message_format = sign.message_format;
        state.encryption = sign.encryption;
    }
    debug!(
        "Message serialize format: {}. Encryption: {}",
        sign.message_format.as_str(),
        if sign.encryption { "yes" } else { "no" }
    );

    if sign.encryption {
        let peer_public = read_public_key(stream, SIGNATURE_TIMEOUT_LISTENER).await?;
        let (secret, public) = crypto::generate_keypair();
        let session = SessionCrypto::new(&peer_public, &secret);
        stream.write_all(incoming.as_bytes()).await?;
        write_public_key(stream, public.as_bytes()).await?;
        stream.flush().await?;
        Ok(Some(session))
    } else {
        stream.write_all(incoming.as_bytes()).await?;
        stream.flush().await?;
        Ok(None)
    }
}

async fn read_signature(stream: &mut BoxedStream, deadline: Duration) -> Result<Uuid> {
    let mut buf = [0u8; 16];
    timeout(deadline, stream.read_exact(&mut buf)).await.map_err(|_| {
        error!(
            "Signature of serialize format for protocol is not received within {} ms",
            deadline.as_millis()
        );
        Error::timeout("signature read", deadline)
    })??;
    Ok(Uuid::from_bytes(buf))
}

async fn write_public_key(stream: &mut BoxedStream, public: &[u8; PUBLIC_KEY_LEN]) -> Result<()> {
    let mut header = [0u8; 4];
    header[..2].copy_from_slice(&(PUBLIC_KEY_LEN as u16).to_be_bytes());
    // The two bytes after the key length are reserved and travel as zero
    stream.write_all(&header).await?;
    stream.write_all(public).await?;
    Ok(())
}

async fn read_public_key(
    stream: &mut BoxedStream,
    deadline: Duration,
) -> Result<[u8; PUBLIC_KEY_LEN]> {
    let mut header = [0u8; 4];
    timeout(deadline, stream.read_exact(&mut header)).await.map_err(|_| {
        error!("Encryption public key is not received within {} ms", deadline.as_millis());
        Error::timeout("public key read", deadline)
    })??;
    let key_len = u16::from_be_bytes([header[0], header[1]]) as usize;
    if key_len != PUBLIC_KEY_LEN {
        error!("Length mismatch for encryption public key: {key_len}/{PUBLIC_KEY_LEN}");
        return Err(Error::security(format!(
            "Length mismatch for encryption public key: {key_len}/{PUBLIC_KEY_LEN}"
        )));
    }
    let mut public = [0u8; PUBLIC_KEY_LEN];
    timeout(deadline, stream.read_exact(&mut public)).await.map_err(|_| {
        error!("Encryption public key is not received within {} ms", deadline.as_millis());
        Error::timeout("public key read", deadline)
    })??;
    Ok(public)
}

// -------------------------------- Read loop ---------------------------------

async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    peer: PeerInfo,
    shared: Arc<Shared>,
    session: Arc<Option<SessionCrypto>>,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    loop {
        if shared.stop_requested() {
            return Ok(());
        }
        while let Some((length, body)) = take_frame(&mut buf)? {
            handle_frame(length, &body, &peer, &shared, &session)?;
            if shared.stop_requested() {
                return Ok(());
            }
        }
        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!("Remote side closed the connection");
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Socket error: failed read data from socket. Detail: {e}");
                        return Err(e.into());
                    }
                }
            }
            _ = shared.stop_notify.notified() => return Ok(()),
            // Periodic wake so a stop raised between two select registrations
            // is noticed within one loop cadence
            _ = sleep(DELAY) => {}
        }
    }
}

/// Splits one complete `[i32 length][body]` frame off the read buffer.
fn take_frame(buf: &mut BytesMut) -> Result<Option<(i32, BytesMut)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let size = length.unsigned_abs() as usize;
    if length == i32::MIN || size > frame::MAX_FRAME_SIZE {
        return Err(Error::format(format!("Bad frame length: {length}")));
    }
    if buf.len() < 4 + size {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some((length, buf.split_to(size))))
}

fn handle_frame(
    length: i32,
    body: &[u8],
    peer: &PeerInfo,
    shared: &Arc<Shared>,
    session: &Arc<Option<SessionCrypto>>,
) -> Result<()> {
    let data = frame::unpack_body(length, body, session.as_ref().as_ref())?;
    if data.is_empty() {
        trace!("Empty frame received, dropped");
        return Ok(());
    }

    let format = shared.state.lock().message_format;
    let mut message = match format {
        SerializeFormat::QBinary => Message::from_qbinary(&data).map_err(|e| {
            error!("Failed deserialize qbinary message. Detail: {e}");
            e
        })?,
        SerializeFormat::Json => {
            trace!("Message json received: {}", String::from_utf8_lossy(&data));
            Message::from_json(&data).map_err(|e| {
                error!("Failed deserialize json message. Detail: {e}");
                e
            })?
        }
    };
    message.set_socket_type(peer.socket_type);
    message.set_socket_descriptor(peer.descriptor);
    message.set_source_point(peer.point);
    message.set_socket_name(peer.socket_name.clone());
    let message: MessagePtr = Arc::new(message);

    trace!(
        "Message received. Id: {}. Command: {}. Type: {}. ExecStatus: {}",
        message.id(),
        command_label(&message.command()),
        message.message_type().as_str(),
        message.exec_status().as_str()
    );

    let compatibility = shared.state.lock().compatibility;
    if compatibility == ProtocolCompatibility::Unknown
        && message.command() == command::PROTOCOL_COMPATIBLE
    {
        process_protocol_compatible(&message, shared);
        return Ok(());
    }
    if message.command() == command::CLOSE_CONNECTION {
        process_close_connection(&message, shared);
        if message.message_type() == MessageType::Command {
            shared.emit_message(message);
        }
        return Ok(());
    }
    if message.command() == command::ECHO_CONNECTION {
        process_echo_connection(&message, shared);
        return Ok(());
    }

    if compatibility != ProtocolCompatibility::Yes {
        error!(
            "Check of compatibility for {} protocol not performed. Command {} discarded",
            format.as_str(),
            command_label(&message.command())
        );
        return Ok(());
    }

    if shared.props.lock().check_unknown_commands {
        if message.command() == command::UNKNOWN {
            match commands::read_from_message_ptr::<Unknown>(&message) {
                Ok(unknown) => {
                    error!(
                        "Command {} is unknown for remote side. Socket descriptor: {}",
                        command_label(&unknown.command_id),
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
            return Ok(());
        }
        if registry::command_exists(&message.command()) == 0 {
            let unknown = Unknown {
                command_id: message.command(),
                socket_type: peer.socket_type,
                socket_descriptor: peer.descriptor as u64,
                socket_name: peer.socket_name.clone(),
                address: peer.point.address(),
                port: peer.point.port(),
            };
            error!(
                "Unknown command: {}. Socket descriptor: {}",
                unknown.command_id, unknown.socket_descriptor
            );
            let format = shared.state.lock().message_format;
            if let Ok(reply) = commands::create_message(&unknown, format) {
                shared.push_internal(reply);
            }
            return Ok(());
        }
    }

    shared.emit_message(message);
    Ok(())
}

fn process_protocol_compatible(message: &MessagePtr, shared: &Arc<Shared>) {
    if message.message_type() != MessageType::Command {
        return;
    }
    let peer_low = message.protocol_version_low();
    let peer_high = message.protocol_version_high();
    let (my_low, my_high, check) = {
        let props = shared.props.lock();
        (
            props.protocol_version_low,
            props.protocol_version_high,
            props.check_protocol_compatibility,
        )
    };

    let mut compatibility = ProtocolCompatibility::Yes;
    if check {
        debug!(
            "Checking protocol compatibility. This protocol version: {my_low}-{my_high}. \
             Remote protocol version: {peer_low}-{peer_high}"
        );
        if !crate::protocol_compatible(peer_low, peer_high, my_low, my_high) {
            compatibility = ProtocolCompatibility::No;
        }
    }
    shared.state.lock().compatibility = compatibility;

    if compatibility == ProtocolCompatibility::Yes {
        let descriptor = shared.state.lock().descriptor;
        shared.emit(SocketEvent::Connected(descriptor));
    } else {
        // The version pairs are swapped so the text reads correctly on the
        // receiving side.
        let close = CloseConnection::from(commands::error::PROTOCOL_INCOMPATIBLE.with_description(
            format!(
                "Protocol versions incompatible. This protocol version: {peer_low}-{peer_high}. \
                 Remote protocol version: {my_low}-{my_high}"
            ),
        ));
        debug!("Send request to close connection. Detail: {}", close.description);
        let format = shared.state.lock().message_format;
        if let Ok(m) = commands::create_message(&close, format) {
            shared.push_internal(m);
        }
    }
}

fn process_close_connection(message: &MessagePtr, shared: &Arc<Shared>) {
    match message.message_type() {
        MessageType::Command => {
            match commands::read_from_message_ptr::<CloseConnection>(message) {
                Ok(close) => {
                    debug!(
                        "Connection will be closed at request remote side. \
                         Reason code: {}. Remote detail: {}",
                        close.code, close.description
                    );
                }
                Err(_) => {
                    error!(
                        "Incorrect data structure for command {}",
                        command_label(&message.command())
                    );
                }
            }
            let answer = message.clone_for_answer();
            shared.push_internal(answer);
        }
        MessageType::Answer => {
            let expected = *shared.close_ack.lock();
            if expected == Some(message.id()) {
                shared.request_stop();
            }
        }
        _ => {}
    }
}

fn process_echo_connection(message: &MessagePtr, shared: &Arc<Shared>) {
    match message.message_type() {
        MessageType::Command => {
            let listener_side = {
                let mut state = shared.state.lock();
                if message.tag(0) > 0 {
                    state.echo_timeout_ms = message.tag(0) as i64;
                }
                state.listener_side
            };
            let answer = message.clone_for_answer();
            shared.push_internal(answer);
            let timeout_ms = shared.state.lock().echo_timeout_ms;
            if timeout_ms > 0 {
                shared.echo.lock().deadline = Some(echo_deadline(timeout_ms, listener_side));
            }
        }
        MessageType::Answer => {
            let mut echo = shared.echo.lock();
            if echo.pending == Some(message.id()) {
                echo.pending = None;
            }
        }
        _ => {}
    }
}

// -------------------------------- Write loop --------------------------------

async fn write_loop(
    mut writer: WriteHalf<BoxedStream>,
    peer: PeerInfo,
    shared: Arc<Shared>,
    session: Arc<Option<SessionCrypto>>,
) -> Result<()> {
    loop {
        if shared.stop_requested() {
            drain_internal(&mut writer, &peer, &shared, &session).await;
            return Ok(());
        }
        check_echo(&shared);
        if shared.stop_requested() {
            drain_internal(&mut writer, &peer, &shared, &session).await;
            return Ok(());
        }

        match pick_next(&shared) {
            Some(message) => {
                send_message(&mut writer, &message, &peer, &shared, &session).await?;
            }
            None => {
                let wait = next_wait(&shared);
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = sleep(wait) => {}
                    _ = shared.stop_notify.notified() => {}
                }
            }
        }
    }
}

/// Best-effort flush of the queued service replies when the engine is going
/// down, bounded by a few loop cadences.
async fn drain_internal(
    writer: &mut WriteHalf<BoxedStream>,
    peer: &PeerInfo,
    shared: &Arc<Shared>,
    session: &Arc<Option<SessionCrypto>>,
) {
    let deadline = Instant::now() + 3 * DELAY;
    while Instant::now() < deadline {
        let message = shared.internal.lock().pop_front();
        match message {
            Some(message) => {
                if send_message(writer, &message, peer, shared, session).await.is_err() {
                    break;
                }
            }
            None => break,
        }
    }
    let _ = writer.flush().await;
}

fn pick_next(shared: &Arc<Shared>) -> Option<MessagePtr> {
    if let Some(message) = shared.internal.lock().pop_front() {
        return Some(message);
    }
    if shared.state.lock().compatibility == ProtocolCompatibility::Yes {
        return shared.queue.lock().next();
    }
    None
}

/// How long the writer may park: the base cadence, shortened when the echo
/// deadline comes first.
fn next_wait(shared: &Arc<Shared>) -> Duration {
    let deadline = shared.echo.lock().deadline;
    match deadline {
        Some(deadline) => {
            let until = deadline.saturating_duration_since(Instant::now());
            until.min(DELAY).max(Duration::from_millis(1))
        }
        None => DELAY,
    }
}

fn check_echo(shared: &Arc<Shared>) {
    let (timeout_ms, listener_side, format) = {
        let state = shared.state.lock();
        (state.echo_timeout_ms, state.listener_side, state.message_format)
    };
    if timeout_ms <= 0 {
        return;
    }
    let expired = {
        let echo = shared.echo.lock();
        matches!(echo.deadline, Some(deadline) if Instant::now() >= deadline)
    };
    if !expired {
        return;
    }

    let pending = shared.echo.lock().pending;
    if !listener_side && pending.is_none() {
        let m = Message::create(command::ECHO_CONNECTION, format);
        let mut echo = shared.echo.lock();
        echo.pending = Some(m.id());
        echo.deadline = Some(echo_deadline(timeout_ms, listener_side));
        drop(echo);
        shared.push_internal(m);
    } else {
        let total = timeout_ms + if listener_side { 5000 } else { 0 };
        error!(
            "Command EchoConnection is not received within {total} ms. Connection will be closed"
        );
        // Synthesize a local echo event so the application observes the loss
        let m = Message::create(command::ECHO_CONNECTION, format);
        shared.emit_message(Arc::new(m));
        shared.request_stop();
    }
}

async fn send_message(
    writer: &mut WriteHalf<BoxedStream>,
    message: &MessagePtr,
    peer: &PeerInfo,
    shared: &Arc<Shared>,
    session: &Arc<Option<SessionCrypto>>,
) -> Result<()> {
    let (format, web_flags, compression_level, compression_size) = {
        let state = shared.state.lock();
        let props = shared.props.lock();
        (state.message_format, props.message_web_flags, props.compression_level, props.compression_size)
    };

    if format == SerializeFormat::Json && !message.content_is_empty() {
        if message.content_format() != SerializeFormat::Json {
            error!(
                "For json-packaging a message format and message content format must match. \
                 Message discarded. Command: {}",
                command_label(&message.command())
            );
            return Ok(());
        }
        if message.compression() != Compression::None
            && message.compression() != Compression::Disable
        {
            error!(
                "For json-packaging a message content compression is not allowed. \
                 Message discarded. Command: {}",
                command_label(&message.command())
            );
            return Ok(());
        }
    }

    if message.command() == command::CLOSE_CONNECTION
        && message.message_type() == MessageType::Command
    {
        *shared.close_ack.lock() = Some(message.id());
    }

    trace!(
        "Message before sending to socket. Id: {}. Command: {}",
        message.id(),
        command_label(&message.command())
    );

    let mut payload = match format {
        SerializeFormat::QBinary => message.to_qbinary(),
        SerializeFormat::Json => {
            let json = message.to_json(web_flags);
            trace!("Message json before sending: {}", String::from_utf8_lossy(&json));
            json
        }
    };

    let mut compressed = false;
    if !peer.is_local
        && message.compression() == Compression::None
        && payload.len() > compression_size
        && compression_level != 0
    {
        let before = payload.len();
        payload = frame::compress_payload(&payload, compression_level)?;
        compressed = true;
        trace!(
            "Message compressed. Prev size: {before}. New size: {}. Command: {}",
            payload.len(),
            command_label(&message.command())
        );
    }

    let frame = frame::pack_frame(payload, compressed, session.as_ref().as_ref())?;
    writer.write_all(&frame).await.map_err(|e| {
        error!("Socket error: failed write data to socket. Detail: {e}");
        Error::from(e)
    })?;
    writer.flush().await?;

    trace!(
        "Message was sent to socket. Id: {}. Command: {}. Type: {}. ExecStatus: {}",
        message.id(),
        command_label(&message.command()),
        message.message_type().as_str(),
        message.exec_status().as_str()
    );
    Ok(())
}

// ------------------------------- Construction -------------------------------

/// Builds the listener-side socket for an accepted connection, copying the
/// listener's properties onto it.
pub(crate) fn accepted_socket(
    socket_type: SocketType,
    props: &Properties,
    sink: EventSender,
) -> StreamSocket {
    let socket = StreamSocket::new(socket_type);
    *socket.shared.props.lock() = props.clone();
    socket.shared.state.lock().listener_side = true;
    socket.set_event_sink(sink);
    socket
}

/// Spawns the engine for an already-established stream.
pub(crate) fn spawn_engine(socket: &StreamSocket, stream: BoxedStream, peer: PeerInfo) {
    let shared = socket.shared.clone();
    shared.set_running(true);
    let task = tokio::spawn(run_connection(stream, peer, shared));
    *socket.shared.task.lock() = Some(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Priority;

    fn boxed(stream: tokio::io::DuplexStream) -> BoxedStream {
        Box::new(stream)
    }

    fn client_socket(socket_type: SocketType) -> StreamSocket {
        StreamSocket::new(socket_type)
    }

    #[tokio::test]
    async fn test_client_handshake_signature_bytes() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let socket = client_socket(SocketType::Tcp);

        let shared = socket.shared.clone();
        let task = tokio::spawn(async move {
            let mut stream = boxed(local);
            handshake(&mut stream, &shared).await
        });

        // The initiator opens with the 16-byte signature of its format pair
        let mut sig = [0u8; 16];
        remote.read_exact(&mut sig).await.unwrap();
        assert_eq!(
            Uuid::from_bytes(sig),
            signature_for(SerializeFormat::QBinary, false)
        );

        // Echo it back: the handshake completes without crypto
        remote.write_all(&sig).await.unwrap();
        let session = task.await.unwrap().unwrap();
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn test_client_rejects_foreign_signature() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let socket = client_socket(SocketType::Tcp);

        let shared = socket.shared.clone();
        let task = tokio::spawn(async move {
            let mut stream = boxed(local);
            handshake(&mut stream, &shared).await
        });

        let mut sig = [0u8; 16];
        remote.read_exact(&mut sig).await.unwrap();
        remote.write_all(Uuid::nil().as_bytes()).await.unwrap();

        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_listener_rejects_unknown_signature_with_zero_uuid() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let socket = client_socket(SocketType::Tcp);
        socket.shared.state.lock().listener_side = true;

        let shared = socket.shared.clone();
        let task = tokio::spawn(async move {
            let mut stream = boxed(local);
            handshake(&mut stream, &shared).await
        });

        remote.write_all(Uuid::nil().as_bytes()).await.unwrap();

        let mut reply = [0u8; 16];
        remote.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0u8; 16]);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_listener_adopts_client_format() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let socket = client_socket(SocketType::Tcp);
        socket.shared.state.lock().listener_side = true;

        let shared = socket.shared.clone();
        let task = tokio::spawn(async move {
            let mut stream = boxed(local);
            handshake(&mut stream, &shared).await
        });

        let sig = signature_for(SerializeFormat::Json, false);
        remote.write_all(sig.as_bytes()).await.unwrap();
        let mut reply = [0u8; 16];
        remote.read_exact(&mut reply).await.unwrap();
        assert_eq!(Uuid::from_bytes(reply), sig);

        task.await.unwrap().unwrap();
        assert_eq!(socket.message_format(), SerializeFormat::Json);
        assert!(!socket.encryption());
    }

    #[tokio::test]
    async fn test_encrypted_handshake_key_exchange() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let socket = client_socket(SocketType::Tcp);
        socket.set_encryption(true);

        let shared = socket.shared.clone();
        let task = tokio::spawn(async move {
            let mut stream = boxed(local);
            handshake(&mut stream, &shared).await
        });

        let mut sig = [0u8; 16];
        remote.read_exact(&mut sig).await.unwrap();
        assert_eq!(
            Uuid::from_bytes(sig),
            signature_for(SerializeFormat::QBinary, true)
        );

        // Key header: [u16 len=32][u16 reserved=0][key]
        let mut header = [0u8; 4];
        remote.read_exact(&mut header).await.unwrap();
        assert_eq!(u16::from_be_bytes([header[0], header[1]]), 32);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 0);
        let mut client_public = [0u8; 32];
        remote.read_exact(&mut client_public).await.unwrap();

        // Answer with our signature echo and our own key
        let (server_secret, server_public) = crypto::generate_keypair();
        remote.write_all(&sig).await.unwrap();
        remote.write_all(&(32u16).to_be_bytes()).await.unwrap();
        remote.write_all(&0u16.to_be_bytes()).await.unwrap();
        remote.write_all(server_public.as_bytes()).await.unwrap();

        let session = task.await.unwrap().unwrap().expect("session crypto");

        // Both sides derive the same shared secret
        let server_session = SessionCrypto::new(&client_public, &server_secret);
        let sealed = session.seal(b"ping").unwrap();
        assert_eq!(server_session.open(&sealed).unwrap(), b"ping");
    }

    #[test]
    fn test_take_frame_partial_and_complete() {
        let mut buf = BytesMut::new();
        assert!(take_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&5i32.to_be_bytes());
        buf.extend_from_slice(b"ab");
        assert!(take_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"cde");
        let (length, body) = take_frame(&mut buf).unwrap().unwrap();
        assert_eq!(length, 5);
        assert_eq!(&body[..], b"abcde");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_frame_rejects_oversized() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(frame::MAX_FRAME_SIZE as i32 + 1).to_be_bytes());
        assert!(take_frame(&mut buf).is_err());
    }

    #[test]
    fn test_send_requires_running_socket() {
        let socket = client_socket(SocketType::Tcp);
        let m = Arc::new(Message::create(Uuid::new_v4(), SerializeFormat::QBinary));
        assert!(!socket.send(&m));
    }

    #[test]
    fn test_send_suppresses_peer_unknown_commands() {
        let socket = client_socket(SocketType::Tcp);
        socket.shared.running.store(true, Ordering::SeqCst);

        let command = Uuid::new_v4();
        socket.shared.unknown_commands.lock().insert(command);
        let m = Arc::new(Message::create(command, SerializeFormat::QBinary));
        assert!(!socket.send(&m));

        let other = Arc::new(Message::create(Uuid::new_v4(), SerializeFormat::QBinary));
        assert!(socket.send(&other));
        assert_eq!(socket.messages_count(), 1);

        socket.remove(&other.command());
        assert_eq!(socket.messages_count(), 0);
    }

    #[test]
    fn test_config_locked_after_connect() {
        let socket = client_socket(SocketType::Tcp);
        socket.set_message_format(SerializeFormat::Json);
        socket.set_encryption(true);
        socket.set_echo_timeout(5);
        assert_eq!(socket.message_format(), SerializeFormat::Json);
        assert!(socket.encryption());
        assert_eq!(socket.echo_timeout(), 5);

        socket.shared.state.lock().socket_connected = true;
        socket.set_message_format(SerializeFormat::QBinary);
        socket.set_encryption(false);
        socket.set_echo_timeout(9);
        assert_eq!(socket.message_format(), SerializeFormat::Json);
        assert!(socket.encryption());
        assert_eq!(socket.echo_timeout(), 5);
    }

    #[tokio::test]
    async fn test_pick_next_prefers_internal_and_gates_queue() {
        let socket = client_socket(SocketType::Tcp);
        socket.shared.running.store(true, Ordering::SeqCst);

        let queued = Arc::new(Message::create(Uuid::new_v4(), SerializeFormat::QBinary));
        socket.send(&queued);

        // Application messages wait for the compatibility check
        assert!(pick_next(&socket.shared).is_none());

        let internal = Message::create(command::PROTOCOL_COMPATIBLE, SerializeFormat::QBinary);
        let internal_id = internal.id();
        socket.shared.push_internal(internal);
        assert_eq!(pick_next(&socket.shared).unwrap().id(), internal_id);

        socket.shared.state.lock().compatibility = ProtocolCompatibility::Yes;
        assert_eq!(pick_next(&socket.shared).unwrap().id(), queued.id());
        assert!(pick_next(&socket.shared).is_none());
    }

    #[test]
    fn test_priority_order_through_queue() {
        let socket = client_socket(SocketType::Tcp);
        socket.shared.running.store(true, Ordering::SeqCst);
        socket.shared.state.lock().compatibility = ProtocolCompatibility::Yes;

        let mut low = Message::create(Uuid::new_v4(), SerializeFormat::QBinary);
        low.set_priority(Priority::Low);
        let mut high = Message::create(Uuid::new_v4(), SerializeFormat::QBinary);
        high.set_priority(Priority::High);
        let high_id = high.id();

        socket.send(&Arc::new(low));
        socket.send(&Arc::new(high));
        assert_eq!(pick_next(&socket.shared).unwrap().id(), high_id);
    }
}
