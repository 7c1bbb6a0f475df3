//! UNIX Domain Socket Transport
//!
//! Local IPC flavor of the stream engine. Identical to the TCP transport
//! except for addressing: peers are named by a socket path, connections are
//! always local, and the listener owns the socket file.

use crate::message::{MessagePtr, SerializeFormat};
use crate::transport::stream::{
    self, run_connection, PeerInfo, StreamSocket, CONNECT_TIMEOUT,
};
use crate::transport::{send_to_sockets, EventReceiver, Properties, SocketEvent};
use crate::{Error, Result, SocketDescriptor, SocketDescriptorSet, SocketType, NO_SOCKET};
use parking_lot::Mutex;
use std::ops::Deref;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener as TokioUnixListener, UnixStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error};

const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// UNIX-domain client or accepted socket.
pub struct Socket {
    core: StreamSocket,
    path: Mutex<PathBuf>,
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
            core: StreamSocket::new(SocketType::Local),
            path: Mutex::new(PathBuf::new()),
        }
    }

    pub(crate) fn accepted(core: StreamSocket, path: PathBuf) -> Self {
        Self { core, path: Mutex::new(path) }
    }

    /// Socket path this socket connects to.
    pub fn socket_path(&self) -> PathBuf {
        self.path.lock().clone()
    }

    /// Sets the socket path; rejected while the worker runs.
    pub fn init(&self, path: impl AsRef<Path>) -> bool {
        if self.is_running() {
            error!("Impossible execute a initialization because Socket worker is running");
            return false;
        }
        *self.path.lock() = path.as_ref().to_path_buf();
        true
    }

    /// Starts the connection worker.
    pub fn connect(&self) {
        if self.is_running() {
            return;
        }
        let shared = self.core.shared.clone();
        shared.set_running(true);
        let path = self.socket_path();
        let task = tokio::spawn(async move {
            let stream = match timeout(CONNECT_TIMEOUT, UnixStream::connect(&path)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    error!("Failed connect to socket {}. Detail: {e}", path.display());
                    shared.set_running(false);
                    return;
                }
                Err(_) => {
                    error!(
                        "Failed connect to socket {} within {} ms",
                        path.display(),
                        CONNECT_TIMEOUT.as_millis()
                    );
                    shared.set_running(false);
                    return;
                }
            };
            let peer = PeerInfo {
                socket_type: SocketType::Local,
                descriptor: stream.as_raw_fd() as SocketDescriptor,
                point: Default::default(),
                socket_name: path.display().to_string(),
                is_local: true,
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
    path: Mutex<PathBuf>,
    stopped: AtomicBool,
    accept_stop: Notify,
    sweep_stop: Notify,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

/// UNIX-domain connection listener.
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
                path: Mutex::new(PathBuf::new()),
                stopped: AtomicBool::new(false),
                accept_stop: Notify::new(),
                sweep_stop: Notify::new(),
                accept_task: Mutex::new(None),
                sweep_task: Mutex::new(None),
            }),
        }
    }

    /// Binds the socket file and starts accepting connections. A stale file
    /// left from a previous run is removed first.
    pub async fn listen(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| Error::configuration(format!("Failed to remove existing socket: {e}")))?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::configuration(format!("Failed to create socket directory: {e}"))
                })?;
            }
        }
        let listener = TokioUnixListener::bind(&path)?;
        *self.inner.path.lock() = path.clone();
        debug!("Start listener of connections to socket {}", path.display());

        let inner = self.inner.clone();
        let listen_path = path.clone();
        let accept = tokio::spawn(async move {
            loop {
                if inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = inner.accept_stop.notified() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => admit(&inner, stream, listen_path.clone()),
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

    /// Stops accepting, closes every socket and removes the socket file.
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
        let path = self.inner.path.lock().clone();
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
    }

    /// Path the listener is bound to.
    pub fn socket_path(&self) -> PathBuf {
        self.inner.path.lock().clone()
    }

    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.inner.sockets.lock().iter().filter(|s| s.is_running()).cloned().collect()
    }

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

    pub fn release_socket(&self, descriptor: SocketDescriptor) -> Option<Arc<Socket>> {
        let mut sockets = self.inner.sockets.lock();
        let index = sockets.iter().position(|s| s.socket_descriptor() == descriptor)?;
        let socket = sockets.remove(index);
        socket.reset_event_sink();
        Some(socket)
    }

    pub fn send(&self, message: &MessagePtr, exclude: &SocketDescriptorSet) {
        let sockets = self.sockets();
        send_to_sockets(sockets.iter().map(|s| &s.core), message, exclude);
    }

    pub fn send_excluding(&self, message: &MessagePtr, exclude: SocketDescriptor) {
        let mut set = SocketDescriptorSet::new();
        set.insert(exclude);
        self.send(message, &set);
    }

    pub fn events(&self) -> Option<EventReceiver> {
        self.inner.events_rx.lock().take()
    }

    pub fn set_compression_level(&self, level: i32) {
        self.inner.props.lock().compression_level = level.clamp(-1, 9);
    }

    pub fn set_compression_size(&self, size: usize) {
        self.inner.props.lock().compression_size = size;
    }

    pub fn set_check_protocol_compatibility(&self, val: bool) {
        self.inner.props.lock().check_protocol_compatibility = val;
    }

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

fn admit(inner: &Arc<ListenerInner>, unix_stream: UnixStream, path: PathBuf) {
    if inner.stopped.load(Ordering::SeqCst) {
        return;
    }
    let props = inner.props.lock().clone();
    let core = stream::accepted_socket(SocketType::Local, &props, inner.events_tx.clone());
    let socket = Arc::new(Socket::accepted(core, path.clone()));

    let peer = PeerInfo {
        socket_type: SocketType::Local,
        descriptor: unix_stream.as_raw_fd() as SocketDescriptor,
        point: Default::default(),
        socket_name: path.display().to_string(),
        is_local: true,
    };
    debug!("Connection accepted on socket {}", path.display());

    inner.sockets.lock().push(socket.clone());
    stream::spawn_engine(&socket.core, Box::new(unix_stream), peer);
}
