//! TCP Transport
//!
//! TCP flavor of the stream engine: the client socket dialing a remote
//! point and the listener accepting connections, owning the set of active
//! sockets and broadcasting messages to them.

use crate::host_point::HostPoint;
use crate::message::{MessagePtr, SerializeFormat};
use crate::transport::stream::{
    self, run_connection, PeerInfo, StreamSocket, CONNECT_TIMEOUT,
};
use crate::transport::{send_to_sockets, EventReceiver, Properties, SocketEvent};
use crate::{Result, SocketDescriptor, SocketDescriptorSet, SocketType, NO_SOCKET};
use parking_lot::Mutex;
use std::ops::Deref;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, warn};

/// Interval of the listener housekeeping sweep dropping dead sockets.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// TCP client or accepted socket.
pub struct Socket {
    core: StreamSocket,
    peer_point: Mutex<HostPoint>,
}

impl Deref for Socket {
    type Target = StreamSocket;

    fn deref(&self) -> &StreamSocket {
        &self.core
    }
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket {
    pub fn new() -> Self {
        Self {
            core: StreamSocket::new(SocketType::Tcp),
            peer_point: Mutex::new(HostPoint::null()),
        }
    }

    pub(crate) fn accepted(core: StreamSocket, peer_point: HostPoint) -> Self {
        Self { core, peer_point: Mutex::new(peer_point) }
    }

    /// Remote point this socket connects to.
    pub fn peer_point(&self) -> HostPoint {
        *self.peer_point.lock()
    }

    /// Sets the remote point; rejected while the worker runs.
    pub fn init(&self, peer: HostPoint) -> bool {
        if self.is_running() {
            error!("Impossible execute a initialization because Socket worker is running");
            return false;
        }
        *self.peer_point.lock() = peer;
        true
    }

    /// Starts the connection worker: dials the remote point with the
    /// 3-second deadline and runs the engine on success.
    pub fn connect(&self) {
        if self.is_running() {
            return;
        }
        let shared = self.core.shared.clone();
        shared.set_running(true);
        let point = self.peer_point();
        let task = tokio::spawn(async move {
            let addr = point.to_socket_addr();
            let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    error!("Failed connect to host {point}. Detail: {e}");
                    shared.set_running(false);
                    return;
                }
                Err(_) => {
                    error!(
                        "Failed connect to host {point} within {} ms",
                        CONNECT_TIMEOUT.as_millis()
                    );
                    shared.set_running(false);
                    return;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {e}");
            }
            let peer = PeerInfo {
                socket_type: SocketType::Tcp,
                descriptor: stream.as_raw_fd() as SocketDescriptor,
                point,
                socket_name: String::new(),
                is_local: point.address().is_loopback(),
            };
            run_connection(Box::new(stream), peer, shared).await;
        });
        *self.core.shared.task.lock() = Some(task);
    }
}

struct ListenerInner {
    props: Mutex<Properties>,
    sockets: Mutex<Vec<Arc<Socket>>>,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    events_rx: Mutex<Option<EventReceiver>>,
    local_point: Mutex<HostPoint>,
    stopped: AtomicBool,
    accept_stop: Notify,
    sweep_stop: Notify,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

/// TCP connection listener.
///
/// Owns the accepted sockets: listener properties are copied to each socket
/// at admission, socket events funnel into the listener's aggregate event
/// channel, and a housekeeping timer drops sockets whose worker has ended.
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ListenerInner {
                props: Mutex::new(Properties::default()),
                sockets: Mutex::new(Vec::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                local_point: Mutex::new(HostPoint::null()),
                stopped: AtomicBool::new(false),
                accept_stop: Notify::new(),
                sweep_stop: Notify::new(),
                accept_task: Mutex::new(None),
                sweep_task: Mutex::new(None),
            }),
        }
    }

    /// Binds and starts accepting connections.
    pub async fn listen(&self, bind: HostPoint) -> Result<()> {
        let listener = TokioTcpListener::bind(bind.to_socket_addr()).await?;
        let local: HostPoint = listener.local_addr()?.into();
        *self.inner.local_point.lock() = local;
        debug!("Start listener of connections to point {local}");

        let inner = self.inner.clone();
        let accept = tokio::spawn(async move {
            loop {
                if inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = inner.accept_stop.notified() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => admit(&inner, stream, peer_addr.into()),
                        Err(e) => {
                            error!("Failed accept connection. Detail: {e}");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        });
        *self.inner.accept_task.lock() = Some(accept);

        let inner = self.inner.clone();
        let sweep = tokio::spawn(async move {
            let mut tick = interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                if inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = inner.sweep_stop.notified() => break,
                    _ = tick.tick() => {
                        inner.sockets.lock().retain(|socket| socket.is_running());
                    }
                }
            }
        });
        *self.inner.sweep_task.lock() = Some(sweep);
        Ok(())
    }

    /// Stops accepting and closes every active socket.
    pub async fn close(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a task between two waits still stops
        self.inner.accept_stop.notify_one();
        self.inner.sweep_stop.notify_one();
        let accept = self.inner.accept_task.lock().take();
        if let Some(task) = accept {
            let _ = task.await;
        }
        let sweep = self.inner.sweep_task.lock().take();
        if let Some(task) = sweep {
            let _ = task.await;
        }
        let sockets: Vec<Arc<Socket>> = self.inner.sockets.lock().drain(..).collect();
        for socket in sockets {
            socket.disconnect(Duration::from_secs(3)).await;
        }
    }

    /// Point the listener is bound to.
    pub fn local_point(&self) -> HostPoint {
        *self.inner.local_point.lock()
    }

    /// Active sockets.
    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.inner.sockets.lock().iter().filter(|s| s.is_running()).cloned().collect()
    }

    /// Active sockets talking the given message format.
    pub fn sockets_by_format(&self, format: SerializeFormat) -> Vec<Arc<Socket>> {
        self.inner
            .sockets
            .lock()
            .iter()
            .filter(|s| s.is_running() && s.message_format() == format)
            .cloned()
            .collect()
    }

    pub fn sockets_count(&self) -> usize {
        self.inner.sockets.lock().iter().filter(|s| s.is_running()).count()
    }

    pub fn socket_by_descriptor(&self, descriptor: SocketDescriptor) -> Option<Arc<Socket>> {
        self.inner
            .sockets
            .lock()
            .iter()
            .find(|s| s.socket_descriptor() == descriptor)
            .cloned()
    }

    /// Adopts an externally created socket: its events are rewired into the
    /// listener's aggregate channel.
    pub fn add_socket(&self, socket: Arc<Socket>) {
        if socket.socket_descriptor() == NO_SOCKET {
            return;
        }
        let mut sockets = self.inner.sockets.lock();
        let exists = sockets.iter().any(|s| s.socket_descriptor() == socket.socket_descriptor());
        if !exists {
            socket.set_event_sink(self.inner.events_tx.clone());
            sockets.push(socket);
        }
    }

    /// Removes a socket from the listener, handing it a private event
    /// channel again.
    pub fn release_socket(&self, descriptor: SocketDescriptor) -> Option<Arc<Socket>> {
        let mut sockets = self.inner.sockets.lock();
        let index = sockets.iter().position(|s| s.socket_descriptor() == descriptor)?;
        let socket = sockets.remove(index);
        socket.reset_event_sink();
        Some(socket)
    }

    /// Sends a message through the active sockets: Events broadcast to all
    /// sockets not excluded, Commands and Answers follow the message's
    /// destination descriptors.
    pub fn send(&self, message: &MessagePtr, exclude: &SocketDescriptorSet) {
        let sockets = self.sockets();
        send_to_sockets(sockets.iter().map(|s| &s.core), message, exclude);
    }

    pub fn send_excluding(&self, message: &MessagePtr, exclude: SocketDescriptor) {
        let mut set = SocketDescriptorSet::new();
        set.insert(exclude);
        self.send(message, &set);
    }

    /// Takes the aggregate event channel of all listener sockets.
    pub fn events(&self) -> Option<EventReceiver> {
        self.inner.events_rx.lock().take()
    }

    // Listener-level defaults copied to admitted sockets.

    pub fn set_compression_level(&self, level: i32) {
        self.inner.props.lock().compression_level = level.clamp(-1, 9);
    }

    pub fn set_compression_size(&self, size: usize) {
        self.inner.props.lock().compression_size = size;
    }

    pub fn set_check_protocol_compatibility(&self, val: bool) {
        self.inner.props.lock().check_protocol_compatibility = val;
    }

    /// Requires clients to connect encrypted; plaintext signatures are
    /// rejected at handshake.
    pub fn set_only_encrypted(&self, val: bool) {
        self.inner.props.lock().only_encrypted = val;
    }

    pub fn set_message_web_flags(&self, val: bool) {
        self.inner.props.lock().message_web_flags = val;
    }

    pub fn set_check_unknown_commands(&self, val: bool) {
        self.inner.props.lock().check_unknown_commands = val;
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.inner.props.lock().name = name.into();
    }

    pub fn set_protocol_versions(&self, low: u16, high: u16) {
        let mut props = self.inner.props.lock();
        props.protocol_version_low = low;
        props.protocol_version_high = high;
    }
}

fn admit(inner: &Arc<ListenerInner>, tcp_stream: TcpStream, peer_point: HostPoint) {
    if inner.stopped.load(Ordering::SeqCst) {
        return;
    }
    if let Err(e) = tcp_stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {e}");
    }
    let props = inner.props.lock().clone();
    let core = stream::accepted_socket(SocketType::Tcp, &props, inner.events_tx.clone());
    let socket = Arc::new(Socket::accepted(core, peer_point));

    let peer = PeerInfo {
        socket_type: SocketType::Tcp,
        descriptor: tcp_stream.as_raw_fd() as SocketDescriptor,
        point: peer_point,
        socket_name: String::new(),
        is_local: peer_point.address().is_loopback(),
    };
    debug!("Connection accepted from {peer_point}");

    // The socket joins the set before its worker starts, so `connected`
    // can never outrun the admission.
    inner.sockets.lock().push(socket.clone());
    stream::spawn_engine(&socket.core, Box::new(tcp_stream), peer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_init_guard() {
        let socket = Socket::new();
        let point = HostPoint::new("127.0.0.1".parse().unwrap(), 12345);
        assert!(socket.init(point));
        assert_eq!(socket.peer_point(), point);
    }

    #[tokio::test]
    async fn test_listener_binds_ephemeral_port() {
        let listener = Listener::new();
        listener
            .listen(HostPoint::new("127.0.0.1".parse().unwrap(), 0))
            .await
            .unwrap();
        let local = listener.local_point();
        assert_ne!(local.port(), 0);
        assert_eq!(listener.sockets_count(), 0);
        listener.close().await;
    }
}
