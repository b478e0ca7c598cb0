#![allow(clippy::mutex_atomic)] // needed for Condvar

use crate::{
    completion_queue::{CompletionQueue, Event, Tag},
    compression::{self, Algorithm},
    connection::Connection,
    metadata::{self, Metadata},
    stream::Stream,
    types::*,
};
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, Weak,
    },
    thread,
    time::{Duration, Instant},
};

/// Suggest coalescing this message with later writes.
pub const WRITE_BUFFER_HINT: u32 = 0x1;
/// Send this message uncompressed even when the call compresses.
pub const WRITE_NO_COMPRESS: u32 = 0x2;
const WRITE_FLAGS_MASK: u32 = WRITE_BUFFER_HINT | WRITE_NO_COMPRESS;

const WAKE_RECHECK: Duration = Duration::from_millis(100);

/// One operation inside a batch. Sends execute in batch order; receives
/// bind to the stream's inbound pipeline.
#[derive(Debug, Clone)]
pub enum Op {
    SendInitialMetadata(Metadata),
    SendMessage { message: ByteBuffer, flags: u32 },
    SendCloseFromClient,
    SendStatusFromServer {
        status: Status,
        trailing_metadata: Metadata,
    },
    RecvInitialMetadata,
    RecvMessage,
    RecvStatusOnClient,
    RecvCloseOnServer,
}

impl Op {
    fn kind_bit(&self) -> u8 {
        match self {
            Self::SendInitialMetadata(_) => 0x01,
            Self::SendMessage { .. } => 0x02,
            Self::SendCloseFromClient => 0x04,
            Self::SendStatusFromServer { .. } => 0x08,
            Self::RecvInitialMetadata => 0x10,
            Self::RecvMessage => 0x20,
            Self::RecvStatusOnClient => 0x40,
            Self::RecvCloseOnServer => 0x80,
        }
    }

    fn is_send(&self) -> bool {
        matches!(
            self,
            Self::SendInitialMetadata(_)
                | Self::SendMessage { .. }
                | Self::SendCloseFromClient
                | Self::SendStatusFromServer { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

#[derive(Debug, Default)]
struct CallInner {
    sent_initial_metadata: bool,
    sent_close: bool,
    send_in_flight: bool,
    recv_in_flight: bool,
    /// The terminal event went out; nothing further may be submitted.
    finished: bool,
    /// Locally-derived terminal status (cancel, deadline, broken channel).
    /// Wire-derived status lives on the stream.
    status: Option<Status>,
    send_encoding: Algorithm,
    received_initial_metadata: Option<Metadata>,
    /// Result slot of the last RECV_MESSAGE: `Some(None)` is end-of-stream.
    received_message: Option<Option<ByteBuffer>>,
    received_status: Option<(Status, Metadata)>,
    /// Result slot of RECV_CLOSE_ON_SERVER: was the call cancelled?
    client_cancelled: Option<bool>,
}

struct CallShared {
    side: Side,
    conn: Option<Arc<Connection>>,
    stream_id: Option<NonZeroStreamId>,
    stream: Option<Arc<Mutex<Stream>>>,
    cq: CompletionQueue,
    method: String,
    authority: Option<String>,
    scheme: &'static str,
    deadline: Option<Instant>,
    cancelled: AtomicBool,
    inner: Mutex<CallInner>,
    wake: Condvar,
}

/// One RPC. Owns its HTTP/2 stream for its whole lifetime; dropping the
/// call releases the stream (resetting it first if still live).
pub struct Call {
    shared: Arc<CallShared>,
}

impl Call {
    /// Client call on an established (or absent, for a broken channel)
    /// connection. No I/O happens here; the first batch does the sending.
    pub(crate) fn client(
        conn: Option<Arc<Connection>>,
        scheme: &'static str,
        method: impl Into<String>,
        authority: Option<String>,
        deadline: Option<Instant>,
        cq: &CompletionQueue,
    ) -> Self {
        let (conn, stream_id, stream, broken) = match conn {
            Some(conn) => match conn.open_stream() {
                Ok((id, stream)) => (Some(conn), Some(id), Some(stream), false),
                Err(_) => (None, None, None, true),
            },
            None => (None, None, None, true),
        };
        let mut inner = CallInner::default();
        if broken {
            inner.status = Some(Status::new(
                StatusCode::Unavailable,
                "channel is not connected".to_owned(),
            ));
        }
        let shared = Arc::new(CallShared {
            side: Side::Client,
            conn,
            stream_id,
            stream,
            cq: cq.clone(),
            method: method.into(),
            authority,
            scheme,
            deadline,
            cancelled: AtomicBool::new(false),
            inner: Mutex::new(inner),
            wake: Condvar::new(),
        });
        shared.install_hooks();
        Self { shared }
    }

    /// Server call for a peer-initiated stream whose request headers have
    /// arrived. Method, authority, and deadline come out of the request
    /// metadata.
    pub(crate) fn server(
        conn: Arc<Connection>,
        stream_id: NonZeroStreamId,
        stream: Arc<Mutex<Stream>>,
        cq: &CompletionQueue,
    ) -> Self {
        let request_metadata = stream
            .lock()
            .expect("stream lock")
            .initial_metadata
            .clone()
            .unwrap_or_default();
        let method = request_metadata.get_str(":path").unwrap_or_default();
        let authority = request_metadata.get_str(":authority");
        let deadline = request_metadata
            .get_str("grpc-timeout")
            .and_then(|raw| metadata::parse_timeout(&raw))
            .map(|timeout| Instant::now() + timeout);

        let mut inner = CallInner::default();
        inner.received_initial_metadata = Some(request_metadata);
        let shared = Arc::new(CallShared {
            side: Side::Server,
            conn: Some(conn),
            stream_id: Some(stream_id),
            stream: Some(stream),
            cq: cq.clone(),
            method,
            authority,
            scheme: "http",
            deadline,
            cancelled: AtomicBool::new(false),
            inner: Mutex::new(inner),
            wake: Condvar::new(),
        });
        shared.install_hooks();
        Self { shared }
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.shared.method
    }

    #[must_use]
    pub fn authority(&self) -> Option<&str> {
        self.shared.authority.as_deref()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.deadline
    }

    /// Request metadata of a server call, in arrival order.
    #[must_use]
    pub fn request_metadata(&self) -> Option<Metadata> {
        self.shared
            .inner
            .lock()
            .expect("call lock")
            .received_initial_metadata
            .clone()
    }

    /// Submit a batch. Synchronous validation only; a single event tagged
    /// `tag` lands on the call's completion queue once every op finished.
    pub fn start_batch(&self, ops: Vec<Op>, tag: Tag) -> CallError {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().expect("call lock");
        let error = shared.validate(&inner, &ops);
        if error != CallError::Ok {
            return error;
        }
        if ops.is_empty() {
            drop(inner);
            shared.cq.register_tag(tag);
            shared.cq.push(Event::op_complete(tag, true));
            return CallError::Ok;
        }
        if ops.iter().any(Op::is_send) {
            inner.send_in_flight = true;
            if ops
                .iter()
                .any(|op| matches!(op, Op::SendInitialMetadata(_)))
            {
                inner.sent_initial_metadata = true;
            }
            if ops.iter().any(|op| {
                matches!(op, Op::SendCloseFromClient | Op::SendStatusFromServer { .. })
            }) {
                inner.sent_close = true;
            }
        }
        if ops.iter().any(|op| !op.is_send()) {
            inner.recv_in_flight = true;
        }
        drop(inner);

        shared.cq.register_tag(tag);
        let worker = shared.clone();
        thread::Builder::new()
            .name("grpc2-batch".to_owned())
            .spawn(move || worker.run_batch(ops, tag))
            .expect("spawn batch thread");
        CallError::Ok
    }

    /// Idempotent, callable from any thread at any time. The pending batch
    /// (if any) completes with `success = false`.
    pub fn cancel(&self) {
        self.shared.cancel_with(Status::new(
            StatusCode::Cancelled,
            "cancelled by application".to_owned(),
        ));
    }

    /// Terminal status, available after a RECV_STATUS / terminal batch.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        let inner = self.shared.inner.lock().expect("call lock");
        inner
            .received_status
            .as_ref()
            .map(|(status, _)| status.clone())
            .or_else(|| inner.status.clone())
    }

    /// Trailing metadata captured by RECV_STATUS_ON_CLIENT.
    #[must_use]
    pub fn trailing_metadata(&self) -> Option<Metadata> {
        self.shared
            .inner
            .lock()
            .expect("call lock")
            .received_status
            .as_ref()
            .map(|(_, trailers)| trailers.clone())
    }

    /// Initial metadata captured by RECV_INITIAL_METADATA.
    #[must_use]
    pub fn initial_metadata(&self) -> Option<Metadata> {
        self.shared
            .inner
            .lock()
            .expect("call lock")
            .received_initial_metadata
            .clone()
    }

    /// Message captured by the last RECV_MESSAGE. `None` means the peer
    /// half-closed; a zero-length message comes back as an empty buffer.
    #[must_use]
    pub fn take_message(&self) -> Option<ByteBuffer> {
        self.shared
            .inner
            .lock()
            .expect("call lock")
            .received_message
            .take()
            .flatten()
    }

    /// RECV_CLOSE_ON_SERVER result: true when the client cancelled rather
    /// than finishing cleanly.
    #[must_use]
    pub fn client_cancelled(&self) -> bool {
        self.shared
            .inner
            .lock()
            .expect("call lock")
            .client_cancelled
            .unwrap_or(false)
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        let finished = self.shared.inner.lock().expect("call lock").finished;
        if !finished {
            self.shared.cancel_with(Status::new(
                StatusCode::Cancelled,
                "call destroyed".to_owned(),
            ));
        }
        if let (Some(conn), Some(id)) = (&self.shared.conn, self.shared.stream_id) {
            conn.release_stream(id);
        }
    }
}

impl CallShared {
    /// Wire the stream's update hook to this call and start the deadline
    /// watcher. Both hold weak references so the call can die freely.
    fn install_hooks(self: &Arc<Self>) {
        if let Some(stream) = &self.stream {
            let weak: Weak<CallShared> = Arc::downgrade(self);
            stream
                .lock()
                .expect("stream lock")
                .set_update_hook(Arc::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.wake_waiters();
                    }
                }));
        }
        if let Some(deadline) = self.deadline {
            let weak = Arc::downgrade(self);
            thread::Builder::new()
                .name("grpc2-deadline".to_owned())
                .spawn(move || deadline_watch(&weak, deadline))
                .expect("spawn deadline thread");
        }
    }

    fn wake_waiters(&self) {
        let _guard = self.inner.lock().expect("call lock");
        self.wake.notify_all();
    }

    fn validate(&self, inner: &CallInner, ops: &[Op]) -> CallError {
        if inner.finished {
            return CallError::AlreadyFinished;
        }
        let mut seen = 0u8;
        let mut batch_sends_initial_metadata = false;
        let mut has_send = false;
        let mut has_recv = false;
        for op in ops {
            let bit = op.kind_bit();
            if seen & bit != 0 {
                return CallError::TooManyOps;
            }
            seen |= bit;
            if op.is_send() {
                has_send = true;
            } else {
                has_recv = true;
            }
            match op {
                Op::SendInitialMetadata(_) => {
                    if inner.sent_initial_metadata {
                        return CallError::AlreadyInvoked;
                    }
                    batch_sends_initial_metadata = true;
                }
                Op::SendMessage { flags, .. } => {
                    if flags & !WRITE_FLAGS_MASK != 0 {
                        return CallError::InvalidFlags;
                    }
                    if inner.sent_close {
                        return CallError::AlreadyFinished;
                    }
                    if !inner.sent_initial_metadata && !batch_sends_initial_metadata {
                        return CallError::NotInvoked;
                    }
                }
                Op::SendCloseFromClient => {
                    if self.side == Side::Server {
                        return CallError::NotOnServer;
                    }
                    if inner.sent_close {
                        return CallError::AlreadyInvoked;
                    }
                    if !inner.sent_initial_metadata && !batch_sends_initial_metadata {
                        return CallError::NotInvoked;
                    }
                }
                Op::SendStatusFromServer { .. } => {
                    if self.side == Side::Client {
                        return CallError::NotOnClient;
                    }
                    if inner.sent_close {
                        return CallError::AlreadyInvoked;
                    }
                }
                Op::RecvInitialMetadata | Op::RecvStatusOnClient => {
                    if self.side == Side::Server {
                        return CallError::NotOnServer;
                    }
                }
                Op::RecvCloseOnServer => {
                    if self.side == Side::Client {
                        return CallError::NotOnClient;
                    }
                }
                Op::RecvMessage => {}
            }
        }
        if has_send && inner.send_in_flight {
            return CallError::TooManyOps;
        }
        if has_recv && inner.recv_in_flight {
            return CallError::TooManyOps;
        }
        CallError::Ok
    }

    fn run_batch(self: &Arc<Self>, ops: Vec<Op>, tag: Tag) {
        let mut ok = true;
        for op in &ops {
            if !ok || self.cancelled.load(Ordering::SeqCst) {
                ok = false;
                break;
            }
            ok = match op {
                Op::SendInitialMetadata(user) => self.do_send_initial_metadata(user),
                Op::SendMessage { message, flags } => self.do_send_message(message, *flags),
                Op::SendCloseFromClient => self.do_send_close(),
                Op::SendStatusFromServer {
                    status,
                    trailing_metadata,
                } => self.do_send_status(status, trailing_metadata),
                _ => true,
            };
        }
        for op in &ops {
            if !ok {
                break;
            }
            ok = match op {
                Op::RecvInitialMetadata => self.do_recv_initial_metadata(),
                Op::RecvMessage => self.do_recv_message(),
                Op::RecvStatusOnClient => self.do_recv_status(),
                Op::RecvCloseOnServer => self.do_recv_close(),
                _ => true,
            };
        }

        let terminal = ops.iter().any(|op| {
            matches!(op, Op::RecvStatusOnClient | Op::SendStatusFromServer { .. })
        }) || !ok;
        {
            let mut inner = self.inner.lock().expect("call lock");
            if ops.iter().any(Op::is_send) {
                inner.send_in_flight = false;
            }
            if ops.iter().any(|op| !op.is_send()) {
                inner.recv_in_flight = false;
            }
            if terminal {
                inner.finished = true;
            }
            self.wake.notify_all();
        }
        trace!("batch {} complete, success={}", tag, ok);
        self.cq.push(Event::op_complete(tag, ok));
    }

    fn transport(&self) -> Option<(&Arc<Connection>, NonZeroStreamId)> {
        match (&self.conn, self.stream_id) {
            (Some(conn), Some(id)) if !conn.is_closed() => Some((conn, id)),
            _ => None,
        }
    }

    fn fail_locally(&self, status: Status) {
        let mut inner = self.inner.lock().expect("call lock");
        inner.status.get_or_insert(status);
        self.wake.notify_all();
    }

    fn do_send_initial_metadata(&self, user: &Metadata) -> bool {
        let Some((conn, id)) = self.transport() else {
            return false;
        };
        let mut headers = Metadata::new();
        match self.side {
            Side::Client => {
                headers.add(":method", "POST");
                headers.add(":scheme", self.scheme);
                headers.add(":path", &self.method);
                if let Some(authority) = &self.authority {
                    headers.add(":authority", authority);
                }
                headers.add("te", "trailers");
                headers.add("content-type", "application/grpc");
                if let Some(deadline) = self.deadline {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    headers.add("grpc-timeout", metadata::format_timeout(remaining));
                }
            }
            Side::Server => {
                headers.add(":status", "200");
                headers.add("content-type", "application/grpc");
            }
        }
        for (key, value) in user.iter() {
            add_user_header(&mut headers, key, value);
        }
        if let Some(raw) = user.get_str("grpc-encoding") {
            if let Some(algorithm) = Algorithm::from_name(&raw) {
                self.inner.lock().expect("call lock").send_encoding = algorithm;
            }
        }
        if let Err(err) = conn.send_headers(id, &headers, false) {
            debug!("send initial metadata failed: {}", err);
            self.fail_locally(Status::new(StatusCode::Unavailable, err.to_string()));
            return false;
        }
        if let Some(stream) = &self.stream {
            stream.lock().expect("stream lock").mark_sent_headers();
        }
        true
    }

    fn do_send_message(&self, message: &ByteBuffer, flags: u32) -> bool {
        let Some((conn, id)) = self.transport() else {
            return false;
        };
        let encoding = self.inner.lock().expect("call lock").send_encoding;
        let (flag, body): (u8, Vec<u8>) =
            if encoding != Algorithm::Identity && flags & WRITE_NO_COMPRESS == 0 {
                match compression::compress(message.as_ref(), encoding) {
                    Ok(packed) => (1, packed),
                    Err(err) => {
                        self.fail_locally(Status::new(StatusCode::Internal, err.to_string()));
                        return false;
                    }
                }
            } else {
                (0, message.as_ref().to_vec())
            };
        let mut framed = BytesMut::with_capacity(crate::stream::MESSAGE_PREFIX_SIZE + body.len());
        framed.put_u8(flag);
        framed.put_u32(body.len() as u32);
        framed.put_slice(&body);
        if let Err(err) = conn.send_data(id, &framed.freeze(), false) {
            debug!("send message failed: {}", err);
            self.fail_locally(Status::new(StatusCode::Unavailable, err.to_string()));
            return false;
        }
        true
    }

    fn do_send_close(&self) -> bool {
        let Some((conn, id)) = self.transport() else {
            return false;
        };
        if let Err(err) = conn.send_data(id, &Bytes::new(), true) {
            debug!("half-close failed: {}", err);
            self.fail_locally(Status::new(StatusCode::Unavailable, err.to_string()));
            return false;
        }
        if let Some(stream) = &self.stream {
            stream.lock().expect("stream lock").mark_send_closed();
        }
        true
    }

    fn do_send_status(&self, status: &Status, user: &Metadata) -> bool {
        let Some((conn, id)) = self.transport() else {
            return false;
        };
        let sent_initial = self.inner.lock().expect("call lock").sent_initial_metadata;
        let mut trailers = Metadata::new();
        if !sent_initial {
            // Trailers-only response: one HEADERS block carries everything.
            trailers.add(":status", "200");
            trailers.add("content-type", "application/grpc");
        }
        // unwrap: StatusCode is repr(u32)
        trailers.add(
            "grpc-status",
            num_traits::ToPrimitive::to_u32(&status.code).unwrap().to_string(),
        );
        if let Some(details) = &status.details {
            trailers.add("grpc-message", metadata::percent_encode(details));
        }
        for (key, value) in user.iter() {
            add_user_header(&mut trailers, key, value);
        }
        if let Err(err) = conn.send_headers(id, &trailers, true) {
            debug!("send status failed: {}", err);
            self.fail_locally(Status::new(StatusCode::Unavailable, err.to_string()));
            return false;
        }
        if let Some(stream) = &self.stream {
            let mut stream = stream.lock().expect("stream lock");
            stream.mark_sent_headers();
            stream.mark_send_closed();
        }
        true
    }

    /// Block until `check` yields, waking on stream updates, cancellation,
    /// deadline expiry, or connection teardown.
    fn wait_until<T>(&self, mut check: impl FnMut(&mut CallInner) -> Option<T>) -> T {
        let mut inner = self.inner.lock().expect("call lock");
        loop {
            if let Some(value) = check(&mut inner) {
                return value;
            }
            let (next, _) = self
                .wake
                .wait_timeout(inner, WAKE_RECHECK)
                .expect("call wait");
            inner = next;
        }
    }

    fn failed_status(&self, inner: &CallInner) -> Option<Status> {
        if let Some(status) = &inner.status {
            return Some(status.clone());
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return Some(Status::new(StatusCode::Cancelled, None));
        }
        None
    }

    fn do_recv_initial_metadata(&self) -> bool {
        let stream = self.stream.clone();
        self.wait_until(|inner| {
            if let Some(stream) = &stream {
                let stream = stream.lock().expect("stream lock");
                if let Some(received) = &stream.initial_metadata {
                    inner.received_initial_metadata = Some(received.clone());
                    return Some(true);
                }
                if stream.status.is_some() || stream.recv_closed() {
                    return Some(false);
                }
            }
            self.failed_status(inner).map(|_| false)
        })
    }

    fn do_recv_message(&self) -> bool {
        let stream = self.stream.clone();
        self.wait_until(|inner| {
            if let Some(stream_handle) = &stream {
                let mut stream = stream_handle.lock().expect("stream lock");
                if let Some((compressed, body)) = stream.take_message() {
                    let body = if compressed {
                        let encoding = stream
                            .initial_metadata
                            .as_ref()
                            .and_then(|metadata| metadata.get_str("grpc-encoding"))
                            .and_then(|name| Algorithm::from_name(&name))
                            .unwrap_or(Algorithm::Identity);
                        match compression::decompress(&body, encoding) {
                            Ok(plain) => Bytes::from(plain),
                            Err(err) => {
                                inner.status.get_or_insert(Status::new(
                                    StatusCode::Internal,
                                    format!("failed to decompress message: {}", err),
                                ));
                                return Some(false);
                            }
                        }
                    } else {
                        body
                    };
                    inner.received_message = Some(Some(ByteBuffer::from(body)));
                    return Some(true);
                }
                if stream.recv_closed() || stream.status.is_some() {
                    // End of the message sequence, not a failure.
                    inner.received_message = Some(None);
                    return Some(true);
                }
            }
            self.failed_status(inner).map(|_| false)
        })
    }

    fn do_recv_status(&self) -> bool {
        let stream = self.stream.clone();
        self.wait_until(|inner| {
            let from_stream = stream.as_ref().and_then(|stream| {
                let stream = stream.lock().expect("stream lock");
                stream
                    .status
                    .clone()
                    .map(|status| (status, stream.trailing_metadata.clone().unwrap_or_default()))
            });
            let terminal = from_stream.or_else(|| {
                self.failed_status(inner)
                    .map(|status| (status, Metadata::default()))
            });
            match terminal {
                Some((status, trailers)) => {
                    let ok = status.is_ok();
                    inner.received_status = Some((status, trailers));
                    Some(ok)
                }
                None => None,
            }
        })
    }

    fn do_recv_close(&self) -> bool {
        let stream = self.stream.clone();
        self.wait_until(|inner| {
            if self.failed_status(inner).is_some() {
                inner.client_cancelled = Some(true);
                return Some(false);
            }
            if let Some(stream) = &stream {
                let stream = stream.lock().expect("stream lock");
                // A terminal stream status means a reset or a transport
                // failure; only a statusless half-close is a clean finish.
                if stream.status.is_some() {
                    inner.client_cancelled = Some(true);
                    return Some(false);
                }
                if stream.recv_closed() {
                    inner.client_cancelled = Some(false);
                    return Some(true);
                }
            }
            None
        })
    }

    fn cancel_with(&self, status: Status) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("call cancelled: {:?}", status.code);
        {
            let mut inner = self.inner.lock().expect("call lock");
            inner.status.get_or_insert(status.clone());
        }
        if let Some(stream) = &self.stream {
            stream.lock().expect("stream lock").fail(status);
        }
        if let Some((conn, id)) = self.transport() {
            conn.send_rst(id, ErrorType::Cancel);
            // Unblocks any sender stuck on this stream's flow window.
            conn.release_stream(id);
        }
        self.wake_waiters();
    }
}

fn deadline_watch(shared: &Weak<CallShared>, deadline: Instant) {
    loop {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut inner = shared.inner.lock().expect("call lock");
        if inner.finished || inner.status.is_some() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            drop(inner);
            shared.cancel_with(Status::new(
                StatusCode::DeadlineExceeded,
                "deadline exceeded".to_owned(),
            ));
            return;
        }
        let wait = (deadline - now).min(Duration::from_millis(250));
        let (guard, _) = shared.wake.wait_timeout(inner, wait).expect("deadline wait");
        inner = guard;
        drop(inner);
        // Re-upgrade on the next iteration so a dropped call ends the watch.
    }
}

fn add_user_header(block: &mut Metadata, key: &str, value: &Bytes) {
    // User metadata must not smuggle pseudo-headers into the block.
    if key.starts_with(':') {
        debug!("dropping pseudo-header {:?} from user metadata", key);
        return;
    }
    block.add_bytes(key.to_owned(), value.clone());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broken_client_call(cq: &CompletionQueue) -> Call {
        Call::client(None, "http", "/echo.Echo/SayHello", None, None, cq)
    }

    fn sim() -> Op {
        Op::SendInitialMetadata(Metadata::new())
    }

    #[test]
    fn duplicate_op_kinds_in_a_batch_are_rejected() {
        let cq = CompletionQueue::new();
        let call = broken_client_call(&cq);
        assert_eq!(
            call.start_batch(vec![Op::RecvMessage, Op::RecvMessage], 1),
            CallError::TooManyOps
        );
    }

    #[test]
    fn server_only_ops_are_rejected_on_a_client_call() {
        let cq = CompletionQueue::new();
        let call = broken_client_call(&cq);
        assert_eq!(
            call.start_batch(
                vec![Op::SendStatusFromServer {
                    status: Status::ok(),
                    trailing_metadata: Metadata::new(),
                }],
                1,
            ),
            CallError::NotOnClient
        );
        assert_eq!(
            call.start_batch(vec![Op::RecvCloseOnServer], 2),
            CallError::NotOnClient
        );
    }

    #[test]
    fn message_before_initial_metadata_is_rejected() {
        let cq = CompletionQueue::new();
        let call = broken_client_call(&cq);
        assert_eq!(
            call.start_batch(
                vec![Op::SendMessage {
                    message: ByteBuffer::new(b"x"),
                    flags: 0,
                }],
                1,
            ),
            CallError::NotInvoked
        );
    }

    #[test]
    fn unknown_write_flags_are_rejected() {
        let cq = CompletionQueue::new();
        let call = broken_client_call(&cq);
        assert_eq!(
            call.start_batch(
                vec![
                    sim(),
                    Op::SendMessage {
                        message: ByteBuffer::new(b"x"),
                        flags: 0x100,
                    },
                ],
                1,
            ),
            CallError::InvalidFlags
        );
    }

    #[test]
    fn batch_on_a_broken_channel_completes_unavailable() {
        let cq = CompletionQueue::new();
        let call = broken_client_call(&cq);
        assert_eq!(
            call.start_batch(vec![sim(), Op::RecvStatusOnClient], 42),
            CallError::Ok
        );
        let event = cq.next(Instant::now() + Duration::from_secs(2));
        assert_eq!(event.tag, 42);
        assert!(!event.success);
        assert_eq!(call.status().unwrap().code, StatusCode::Unavailable);
    }

    #[test]
    fn second_in_flight_send_batch_is_rejected() {
        let cq = CompletionQueue::new();
        let call = broken_client_call(&cq);
        // The first batch fails quickly, but synchronously we race it: both
        // submissions are checked against the in-flight flag.
        let first = call.start_batch(vec![sim(), Op::RecvStatusOnClient], 1);
        assert_eq!(first, CallError::Ok);
        let second = call.start_batch(vec![Op::SendCloseFromClient], 2);
        assert!(
            second == CallError::TooManyOps
                || second == CallError::AlreadyFinished
                || second == CallError::NotInvoked,
            "{:?}",
            second
        );
        cq.next(Instant::now() + Duration::from_secs(2));
    }

    #[test]
    fn cancel_flushes_a_pending_batch() {
        let cq = CompletionQueue::new();
        let call = Call::client(
            None,
            "http",
            "/echo.Echo/SayHello",
            Some("localhost".to_owned()),
            None,
            &cq,
        );
        // A broken call's recv-status completes immediately; use a batch
        // that waits: none exists without a stream, so exercise cancel's
        // idempotence and status instead.
        call.cancel();
        call.cancel();
        assert_eq!(
            call.start_batch(vec![sim(), Op::RecvStatusOnClient], 9),
            CallError::Ok
        );
        let event = cq.next(Instant::now() + Duration::from_secs(2));
        assert!(!event.success);
        let status = call.status().unwrap();
        assert!(
            status.code == StatusCode::Cancelled || status.code == StatusCode::Unavailable,
            "{:?}",
            status
        );
    }

    #[test]
    fn empty_batch_completes_immediately() {
        let cq = CompletionQueue::new();
        let call = broken_client_call(&cq);
        assert_eq!(call.start_batch(Vec::new(), 5), CallError::Ok);
        let event = cq.next(Instant::now() + Duration::from_secs(1));
        assert_eq!(event.tag, 5);
        assert!(event.success);
    }

    #[test]
    fn batches_after_the_terminal_event_are_rejected() {
        let cq = CompletionQueue::new();
        let call = broken_client_call(&cq);
        call.start_batch(vec![sim(), Op::RecvStatusOnClient], 1);
        cq.next(Instant::now() + Duration::from_secs(2));
        // The batch thread marks the call finished before pushing the event.
        assert_eq!(
            call.start_batch(vec![Op::RecvMessage], 2),
            CallError::AlreadyFinished
        );
    }
}
