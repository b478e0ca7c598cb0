use crate::{
    call::Call,
    completion_queue::{CompletionQueue, Event, Tag},
    connection::{Connection, ConnectionConfig, NewStreamHandler},
    socket::{ServerCredentials, Socket},
    types::*,
};
use log::{debug, error, trace, warn};
use socket2::{Domain, Protocol, Type};
use std::{
    collections::VecDeque,
    io,
    net::{TcpListener, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

const ACCEPT_POLL: Duration = Duration::from_millis(5);
const LISTEN_BACKLOG: i32 = 128;

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Size of the accept/dispatch worker pool.
    pub worker_threads: usize,
    pub connection: ConnectionConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            connection: ConnectionConfig::default(),
        }
    }
}

struct Listener {
    socket: TcpListener,
    credentials: Option<ServerCredentials>,
}

/// A `request_call` registration waiting for an incoming call.
struct RequestSlot {
    cq: CompletionQueue,
    tag: Tag,
    out: Arc<Mutex<Option<Call>>>,
}

#[derive(Default)]
struct PendingCalls {
    /// Registrations with no call yet.
    waiting: VecDeque<RequestSlot>,
    /// Calls that arrived before anyone asked for them.
    backlog: VecDeque<(Arc<Connection>, NonZeroStreamId)>,
}

#[derive(Default)]
struct ServerState {
    listeners: Vec<Listener>,
    cqs: Vec<CompletionQueue>,
    workers: Vec<thread::JoinHandle<()>>,
    connections: Vec<Arc<Connection>>,
}

struct ServerInner {
    options: ServerOptions,
    state: Mutex<ServerState>,
    pending: Mutex<PendingCalls>,
    started: AtomicBool,
    shutdown: AtomicBool,
}

/// Redeemed against a new-call event: once the event with the registered
/// tag arrives, `take` yields the server call.
pub struct RequestedCall {
    out: Arc<Mutex<Option<Call>>>,
}

impl RequestedCall {
    #[must_use]
    pub fn take(&self) -> Option<Call> {
        self.out.lock().expect("requested call lock").take()
    }
}

/// Accepts connections on its bound ports with a worker pool; every
/// client-initiated stream becomes a server `Call` handed out through
/// `request_call`.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerOptions::default())
    }
}

impl Server {
    #[must_use]
    pub fn new(options: ServerOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                options,
                state: Mutex::new(ServerState::default()),
                pending: Mutex::new(PendingCalls::default()),
                started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Bind a plaintext listening port. `host:0` asks the OS for a port;
    /// the bound port is returned, 0 on failure.
    pub fn add_insecure_http2_port(&self, addr: &str) -> u16 {
        self.add_port(addr, None)
    }

    /// Bind a TLS listening port.
    pub fn add_secure_http2_port(&self, addr: &str, credentials: ServerCredentials) -> u16 {
        self.add_port(addr, Some(credentials))
    }

    fn add_port(&self, addr: &str, credentials: Option<ServerCredentials>) -> u16 {
        if self.inner.started.load(Ordering::SeqCst) {
            warn!("add_port after start is forbidden");
            return 0;
        }
        match bind_listener(addr) {
            Ok(socket) => {
                let port = socket
                    .local_addr()
                    .map(|bound| bound.port())
                    .unwrap_or_default();
                debug!("listening on {} (port {})", addr, port);
                self.inner
                    .state
                    .lock()
                    .expect("server lock")
                    .listeners
                    .push(Listener {
                        socket,
                        credentials,
                    });
                port
            }
            Err(err) => {
                error!("failed to bind {}: {}", addr, err);
                0
            }
        }
    }

    /// Associate a completion queue with this server before `start`.
    pub fn register_completion_queue(&self, cq: &CompletionQueue) {
        if self.inner.started.load(Ordering::SeqCst) {
            warn!("register_completion_queue after start is forbidden");
            return;
        }
        self.inner
            .state
            .lock()
            .expect("server lock")
            .cqs
            .push(cq.clone());
    }

    /// Spawn the worker pool. Each worker accepts, handshakes, and then
    /// drives the frame-dispatch loop for its connection.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("server already started");
            return;
        }
        let mut state = self.inner.state.lock().expect("server lock");
        let listeners = Arc::new(std::mem::take(&mut state.listeners));
        for worker in 0..self.inner.options.worker_threads {
            let inner = self.inner.clone();
            let listeners = listeners.clone();
            let handle = thread::Builder::new()
                .name(format!("grpc2-worker-{}", worker))
                .spawn(move || worker_loop(&inner, &listeners))
                .expect("spawn worker thread");
            state.workers.push(handle);
        }
        trace!(
            "server started with {} workers",
            self.inner.options.worker_threads
        );
    }

    /// Register interest in the next incoming call. When one arrives (or is
    /// already backlogged), an event `{tag, success = true}` lands on `cq`
    /// and the returned slot yields the call.
    pub fn request_call(&self, cq: &CompletionQueue, tag: Tag) -> RequestedCall {
        cq.register_tag(tag);
        let out = Arc::new(Mutex::new(None));
        {
            let state = self.inner.state.lock().expect("server lock");
            if !state.cqs.iter().any(|registered| registered.same_queue(cq)) {
                warn!("request_call on a completion queue that was never registered");
                cq.push(Event::op_complete(tag, false));
                return RequestedCall { out };
            }
        }
        if self.inner.shutdown.load(Ordering::SeqCst) {
            cq.push(Event::op_complete(tag, false));
            return RequestedCall { out };
        }
        let slot = RequestSlot {
            cq: cq.clone(),
            tag,
            out: out.clone(),
        };
        let backlogged = {
            let mut pending = self.inner.pending.lock().expect("pending lock");
            match pending.backlog.pop_front() {
                Some(entry) => Some((entry, slot)),
                None => {
                    pending.waiting.push_back(slot);
                    None
                }
            }
        };
        if let Some(((conn, stream_id), slot)) = backlogged {
            fulfil(&slot, &conn, stream_id);
        }
        RequestedCall { out }
    }

    /// Drain: close listeners and connections, wait for the workers, then
    /// notify `{tag, success = true}` on `cq`. Pending `request_call`
    /// registrations complete with `success = false`.
    pub fn shutdown_and_notify(&self, cq: &CompletionQueue, tag: Tag) {
        cq.register_tag(tag);
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            cq.push(Event::op_complete(tag, true));
            return;
        }
        debug!("server shutting down");
        let (workers, connections) = {
            let mut state = self.inner.state.lock().expect("server lock");
            state.listeners.clear();
            (
                std::mem::take(&mut state.workers),
                std::mem::take(&mut state.connections),
            )
        };
        for conn in &connections {
            conn.close();
        }
        for slot in std::mem::take(
            &mut self.inner.pending.lock().expect("pending lock").waiting,
        ) {
            slot.cq.push(Event::op_complete(slot.tag, false));
        }

        let cq = cq.clone();
        thread::Builder::new()
            .name("grpc2-shutdown".to_owned())
            .spawn(move || {
                for worker in workers {
                    worker.join().ok();
                }
                debug!("server drained");
                cq.push(Event::op_complete(tag, true));
            })
            .expect("spawn shutdown thread");
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.inner.started.load(Ordering::SeqCst)
            && !self.inner.shutdown.load(Ordering::SeqCst)
        {
            warn!("server dropped without shutdown; forcing teardown");
            self.inner.shutdown.store(true, Ordering::SeqCst);
            let connections = std::mem::take(
                &mut self.inner.state.lock().expect("server lock").connections,
            );
            for conn in connections {
                conn.close();
            }
        }
    }
}

/// Turn an accepted stream into a call and redeem a registration with it.
fn fulfil(slot: &RequestSlot, conn: &Arc<Connection>, stream_id: NonZeroStreamId) {
    let Some(stream) = conn.streams.get(stream_id) else {
        // The stream died between arrival and redemption.
        slot.cq.push(Event::op_complete(slot.tag, false));
        return;
    };
    let call = Call::server(conn.clone(), stream_id, stream, &slot.cq);
    trace!("new call {:?} on stream {}", call.method(), stream_id);
    *slot.out.lock().expect("requested call lock") = Some(call);
    slot.cq.push(Event::op_complete(slot.tag, true));
}

fn bind_listener(addr: &str) -> io::Result<TcpListener> {
    let addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))?;
    let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn worker_loop(inner: &Arc<ServerInner>, listeners: &Arc<Vec<Listener>>) {
    while !inner.shutdown.load(Ordering::SeqCst) {
        let mut accepted = None;
        for listener in listeners.iter() {
            match listener.socket.accept() {
                Ok((sock, peer)) => {
                    trace!("accepted connection from {}", peer);
                    accepted = Some((sock, listener.credentials.clone()));
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    if !inner.shutdown.load(Ordering::SeqCst) {
                        warn!("accept failed: {}", err);
                    }
                }
            }
        }
        match accepted {
            Some((sock, credentials)) => {
                if let Err(err) = serve_connection(inner, sock, credentials.as_ref()) {
                    warn!("connection failed: {:#}", err);
                }
            }
            None => thread::sleep(ACCEPT_POLL),
        }
    }
}

/// Handshake and run one connection to completion on this worker thread.
fn serve_connection(
    inner: &Arc<ServerInner>,
    sock: std::net::TcpStream,
    credentials: Option<&ServerCredentials>,
) -> anyhow::Result<()> {
    let socket = match credentials {
        None => Socket::plain(sock)?,
        Some(credentials) => Socket::server_tls(sock, credentials)?,
    };
    let conn = Connection::accept(socket, inner.options.connection)?;
    inner
        .state
        .lock()
        .expect("server lock")
        .connections
        .push(conn.clone());

    let dispatch: NewStreamHandler = {
        let inner = inner.clone();
        Arc::new(
            move |conn: &Arc<Connection>, stream_id: NonZeroStreamId| {
                let slot = {
                    let mut pending = inner.pending.lock().expect("pending lock");
                    match pending.waiting.pop_front() {
                        Some(slot) => Some(slot),
                        None => {
                            pending.backlog.push_back((conn.clone(), stream_id));
                            None
                        }
                    }
                };
                if let Some(slot) = slot {
                    fulfil(&slot, conn, stream_id);
                }
            },
        )
    };
    conn.run(Some(dispatch));

    let mut state = inner.state.lock().expect("server lock");
    state.connections.retain(|live| !Arc::ptr_eq(live, &conn));
    Ok(())
}
