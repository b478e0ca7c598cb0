#![allow(clippy::mutex_atomic)] // needed for Condvar

use crate::{
    flags::*,
    flow::FlowControl,
    frame::{Frame, Parsed},
    hpack,
    metadata::Metadata,
    socket::Socket,
    stream::UpdateHook,
    stream_coordinator::StreamCoordinator,
    types::*,
};
use bytes::{Buf, Bytes, BytesMut};
use enum_map::{enum_map, EnumMap};
use log::{debug, error, trace, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, RwLock,
    },
    thread,
    time::{Duration, Instant},
};

const IDLE_POLL: Duration = Duration::from_millis(1);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Locally-chosen HTTP/2 parameters, announced to the peer in our first
/// SETTINGS frame.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_concurrent_streams: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
        }
    }
}

/// Invoked by a server connection when a peer-initiated stream has its
/// request headers; the server turns the stream into a call.
pub type NewStreamHandler = Arc<dyn Fn(&Arc<Connection>, NonZeroStreamId) + Send + Sync>;

/// One HTTP/2 connection: socket, flow windows, stream registry, and the
/// reader loop that dispatches inbound frames. Writes go through the write
/// lock one frame at a time; the reader polls the socket with short
/// non-blocking reads so it never starves writers.
pub struct Connection {
    pub role: Role,
    socket: Mutex<Socket>,
    pub flow: FlowControl,
    pub streams: StreamCoordinator,
    local: ConnectionConfig,
    peer_settings: RwLock<EnumMap<SettingsParameter, u32>>,
    /// Bytes read past the preface during the server handshake.
    read_buffer: Mutex<BytesMut>,
    ready: (Mutex<bool>, Condvar),
    stop: AtomicBool,
    closed: AtomicBool,
    goaway_last_stream: Mutex<Option<StreamId>>,
}

impl Connection {
    fn new(role: Role, socket: Socket, config: ConnectionConfig, leftover: BytesMut) -> Self {
        Self {
            role,
            socket: Mutex::new(socket),
            flow: FlowControl::with_initial_local(config.initial_window_size),
            streams: match role {
                Role::Client => StreamCoordinator::for_client(),
                Role::Server => StreamCoordinator::for_server(),
            },
            local: config,
            peer_settings: RwLock::new(enum_map! {
                SettingsParameter::HeaderTableSize => 4096,
                SettingsParameter::EnablePush => 1,
                SettingsParameter::MaxConcurrentStreams => u32::MAX,
                SettingsParameter::InitialWindowSize => DEFAULT_WINDOW_SIZE,
                SettingsParameter::MaxFrameSize => DEFAULT_MAX_FRAME_SIZE,
                SettingsParameter::MaxHeaderListSize => u32::MAX,
            }),
            read_buffer: Mutex::new(leftover),
            ready: (Mutex::new(false), Condvar::new()),
            stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            goaway_last_stream: Mutex::new(None),
        }
    }

    fn local_settings(&self) -> Vec<(SettingsParameter, u32)> {
        vec![
            (SettingsParameter::EnablePush, 0),
            (
                SettingsParameter::MaxConcurrentStreams,
                self.local.max_concurrent_streams,
            ),
            (
                SettingsParameter::InitialWindowSize,
                self.local.initial_window_size,
            ),
            (SettingsParameter::MaxFrameSize, self.local.max_frame_size),
        ]
    }

    /// Client side: write the connection preface and our SETTINGS, spawn the
    /// reader thread, then wait for the peer's SETTINGS so that window
    /// accounting is agreed on before the first call goes out.
    pub fn connect(socket: Socket, config: ConnectionConfig) -> Result<Arc<Self>, TransportError> {
        let conn = Arc::new(Self::new(Role::Client, socket, config, BytesMut::new()));
        {
            let mut socket = conn.socket.lock().expect("socket lock");
            socket.write_all(PREFACE)?;
        }
        conn.write_frame(&Frame::settings(&conn.local_settings()))?;

        let reader = conn.clone();
        thread::Builder::new()
            .name("grpc2-conn".to_owned())
            .spawn(move || reader.run(None))?;

        if !conn.wait_ready(HANDSHAKE_TIMEOUT) {
            conn.close();
            return Err(TransportError::ConnectionClosed);
        }
        Ok(conn)
    }

    /// Server side: verify the client preface and send our SETTINGS. The
    /// accepting worker then drives `run` itself.
    pub fn accept(
        mut socket: Socket,
        config: ConnectionConfig,
    ) -> Result<Arc<Self>, TransportError> {
        let mut buf = BytesMut::with_capacity(PREFACE.len());
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        while buf.len() < PREFACE.len() {
            match socket.read_available(&mut buf)? {
                Some(0) => return Err(TransportError::ShortRead),
                Some(_) => {}
                None => {
                    if Instant::now() > deadline {
                        return Err(TransportError::ShortRead);
                    }
                    thread::sleep(IDLE_POLL);
                }
            }
        }
        if &buf[..PREFACE.len()] != PREFACE {
            return Err(TransportError::Protocol(ErrorType::ProtocolError));
        }
        buf.advance(PREFACE.len());

        let conn = Arc::new(Self::new(Role::Server, socket, config, buf));
        conn.write_frame(&Frame::settings(&conn.local_settings()))?;
        Ok(conn)
    }

    /// Reader loop. Dispatches until EOF, a fatal error, or a stop request,
    /// then tears the connection down.
    pub fn run(self: &Arc<Self>, handler: Option<NewStreamHandler>) {
        if let Err(err) = self.read_loop(handler.as_ref()) {
            if !self.closed.load(Ordering::SeqCst) {
                warn!("connection failed: {}", err);
            }
        }
        self.teardown();
    }

    fn read_loop(self: &Arc<Self>, handler: Option<&NewStreamHandler>) -> Result<(), TransportError> {
        let mut buf = std::mem::take(&mut *self.read_buffer.lock().expect("read buffer lock"));
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            loop {
                match Frame::parse(&buf, self.local.max_frame_size)? {
                    Parsed::Incomplete => break,
                    Parsed::Unknown { typ, consumed } => {
                        debug!("skipping unknown frame type {:#x}", typ);
                        buf.advance(consumed);
                    }
                    Parsed::Frame(frame, consumed) => {
                        buf.advance(consumed);
                        self.dispatch(frame, handler)?;
                    }
                }
            }
            let read = {
                let mut socket = self.socket.lock().expect("socket lock");
                socket.read_available(&mut buf)?
            };
            match read {
                Some(0) => return Err(TransportError::ConnectionClosed),
                Some(_) => {}
                None => thread::sleep(IDLE_POLL),
            }
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        frame: Frame,
        handler: Option<&NewStreamHandler>,
    ) -> Result<(), TransportError> {
        trace!(
            "recv {:?} stream {} ({} bytes)",
            frame.typ,
            frame.stream_id,
            frame.payload.len()
        );
        match frame.typ {
            FrameType::Settings => self.on_settings(&frame),
            FrameType::Ping => {
                if frame.has_flag(PingFlags::ACK.bits()) {
                    return Ok(());
                }
                if frame.payload.len() != 8 {
                    return Err(TransportError::Protocol(ErrorType::FrameSizeError));
                }
                self.write_frame(&Frame::ping_ack(frame.payload.clone()))
            }
            FrameType::WindowUpdate => {
                let increment = frame.window_update_increment()?;
                self.flow
                    .receive_window_update(frame.stream_id, increment.get())
            }
            FrameType::Headers => self.on_headers(&frame, handler),
            FrameType::Continuation => self.on_continuation(&frame, handler),
            FrameType::Data => self.on_data(&frame),
            FrameType::ResetStream => self.on_rst_stream(&frame),
            FrameType::GoAway => self.on_goaway(&frame),
            FrameType::Priority => Ok(()),
            FrameType::PushPromise => {
                // Push is disabled in our SETTINGS; a PUSH_PROMISE is a
                // protocol error.
                Err(TransportError::Protocol(ErrorType::ProtocolError))
            }
        }
    }

    fn on_settings(&self, frame: &Frame) -> Result<(), TransportError> {
        if frame.has_flag(SettingsFlags::ACK.bits()) {
            if !frame.payload.is_empty() {
                return Err(TransportError::Protocol(ErrorType::FrameSizeError));
            }
            return Ok(());
        }
        for (param, value) in frame.settings_entries() {
            match param {
                SettingsParameter::InitialWindowSize => {
                    self.flow.apply_initial_window(value)?;
                }
                SettingsParameter::MaxFrameSize => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=(1 << 24) - 1).contains(&value) {
                        return Err(TransportError::Protocol(ErrorType::ProtocolError));
                    }
                }
                _ => {}
            }
            self.peer_settings.write().expect("peer settings write")[param] = value;
        }
        self.write_frame(&Frame::settings_ack())?;

        let (lock, cond) = &self.ready;
        let mut is_ready = lock.lock().expect("ready lock");
        if !*is_ready {
            trace!("settings exchanged, connection ready");
            *is_ready = true;
            cond.notify_all();
        }
        Ok(())
    }

    fn on_headers(
        self: &Arc<Self>,
        frame: &Frame,
        handler: Option<&NewStreamHandler>,
    ) -> Result<(), TransportError> {
        let Some(id) = NonZeroStreamId::new(frame.stream_id) else {
            return Err(TransportError::Protocol(ErrorType::ProtocolError));
        };
        let stream = match self.role {
            Role::Server => {
                if id.get() % 2 == 0 {
                    return Err(TransportError::Protocol(ErrorType::ProtocolError));
                }
                if self.streams.get(id).is_none() {
                    if self.streams.len() >= self.local.max_concurrent_streams as usize {
                        self.write_frame(&Frame::rst_stream(id.get(), ErrorType::RefusedStream))?;
                        return Ok(());
                    }
                    self.flow.register_stream(id.get());
                }
                self.streams.insert_remote(id)
            }
            Role::Client => match self.streams.get(id) {
                Some(stream) => stream,
                None => {
                    debug!("HEADERS for unknown stream {}", id);
                    return Ok(());
                }
            },
        };

        let fragment = frame.headers_fragment()?;
        let end_headers = frame.has_flag(HeadersFlags::END_HEADERS.bits());
        let end_stream = frame.has_flag(HeadersFlags::END_STREAM.bits());
        let (delivery, hook) = {
            let mut stream = stream.lock().expect("stream lock");
            let delivery = stream.on_headers(fragment, end_headers, end_stream)?;
            (delivery, stream.update_hook())
        };
        if delivery.initial_metadata && self.role == Role::Server {
            if let Some(handler) = handler {
                handler(self, id);
            }
        }
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    fn on_continuation(
        self: &Arc<Self>,
        frame: &Frame,
        handler: Option<&NewStreamHandler>,
    ) -> Result<(), TransportError> {
        let Some(id) = NonZeroStreamId::new(frame.stream_id) else {
            return Err(TransportError::Protocol(ErrorType::ProtocolError));
        };
        let Some(stream) = self.streams.get(id) else {
            debug!("CONTINUATION for unknown stream {}", id);
            return Ok(());
        };
        let end_headers = frame.has_flag(ContinuationFlags::END_HEADERS.bits());
        let (delivery, hook) = {
            let mut stream = stream.lock().expect("stream lock");
            let delivery = stream.on_continuation(frame.payload.clone(), end_headers)?;
            (delivery, stream.update_hook())
        };
        if delivery.initial_metadata && self.role == Role::Server {
            if let Some(handler) = handler {
                handler(self, id);
            }
        }
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    fn on_data(&self, frame: &Frame) -> Result<(), TransportError> {
        let Some(id) = NonZeroStreamId::new(frame.stream_id) else {
            return Err(TransportError::Protocol(ErrorType::ProtocolError));
        };
        // Flow control covers the whole payload, padding included.
        let updates = self.flow.consume_recv(id.get(), frame.payload.len())?;
        for (scope, increment) in updates {
            self.write_frame(&Frame::window_update(scope, increment))?;
        }

        let Some(stream) = self.streams.get(id) else {
            debug!("DATA for unknown stream {}", id);
            return Ok(());
        };
        let payload = frame.data_payload()?;
        let end_stream = frame.has_flag(DataFlags::END_STREAM.bits());
        let hook = {
            let mut stream = stream.lock().expect("stream lock");
            stream.on_data(payload, end_stream)?;
            stream.update_hook()
        };
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    fn on_rst_stream(&self, frame: &Frame) -> Result<(), TransportError> {
        let Some(id) = NonZeroStreamId::new(frame.stream_id) else {
            return Err(TransportError::Protocol(ErrorType::ProtocolError));
        };
        let error = frame.rst_stream_error()?;
        debug!("stream {} reset by peer: {:?}", id, error);
        let Some(stream) = self.streams.remove(id) else {
            return Ok(());
        };
        self.flow.deregister_stream(id.get());
        let hook = {
            let mut stream = stream.lock().expect("stream lock");
            stream.on_rst(error);
            stream.update_hook()
        };
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    fn on_goaway(&self, frame: &Frame) -> Result<(), TransportError> {
        let (last_stream_id, error, debug_data) = frame.goaway_fields()?;
        if error == ErrorType::NoError {
            debug!("peer is draining, last stream {}", last_stream_id);
        } else {
            error!("peer sent GOAWAY: {:?}", error);
            if !debug_data.is_empty() {
                debug!("GOAWAY debug: {}", String::from_utf8_lossy(&debug_data));
            }
        }
        *self.goaway_last_stream.lock().expect("goaway lock") = Some(last_stream_id);

        // Streams the peer never processed fail as UNAVAILABLE; lower ids
        // continue to completion.
        let mut hooks: Vec<UpdateHook> = Vec::new();
        for stream in self.streams.beyond(last_stream_id) {
            let mut stream = stream.lock().expect("stream lock");
            stream.fail(Status::new(
                StatusCode::Unavailable,
                "connection is draining".to_owned(),
            ));
            if let Some(hook) = stream.update_hook() {
                hooks.push(hook);
            }
        }
        for hook in hooks {
            hook();
        }
        Ok(())
    }

    /// Serialize one frame under the write lock.
    pub fn write_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        self.write_frames(std::slice::from_ref(frame))
    }

    /// Serialize a frame sequence under one write-lock acquisition. Needed
    /// for HEADERS + CONTINUATION, which must not interleave with other
    /// streams' frames.
    pub fn write_frames(&self, frames: &[Frame]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        let mut socket = self.socket.lock().expect("socket lock");
        for frame in frames {
            trace!(
                "send {:?} stream {} ({} bytes)",
                frame.typ,
                frame.stream_id,
                frame.payload.len()
            );
            socket.write_all(&frame.encode())?;
        }
        Ok(())
    }

    /// HPACK-encode and send a header block, split into HEADERS plus
    /// CONTINUATION frames when it exceeds the peer's frame limit.
    pub fn send_headers(
        &self,
        id: NonZeroStreamId,
        metadata: &Metadata,
        end_stream: bool,
    ) -> Result<(), TransportError> {
        let mut block = BytesMut::new();
        hpack::encode_metadata(metadata, &mut block);
        let block = block.freeze();
        let max = self.peer_max_frame_size();

        let stream_flags = if end_stream {
            HeadersFlags::END_STREAM
        } else {
            HeadersFlags::empty()
        };
        if block.len() <= max {
            self.write_frame(&Frame::headers(
                id.get(),
                stream_flags | HeadersFlags::END_HEADERS,
                block,
            ))
        } else {
            let mut frames = vec![Frame::headers(id.get(), stream_flags, block.slice(..max))];
            let mut offset = max;
            while offset < block.len() {
                let end = (offset + max).min(block.len());
                let flags = if end == block.len() {
                    ContinuationFlags::END_HEADERS
                } else {
                    ContinuationFlags::empty()
                };
                frames.push(Frame::new(
                    FrameType::Continuation,
                    Flags::Continuation(flags),
                    id.get(),
                    block.slice(offset..end),
                ));
                offset = end;
            }
            self.write_frames(&frames)
        }
    }

    /// Send a DATA payload, chunked by the flow controller. Blocks while
    /// both windows are exhausted; a received WINDOW_UPDATE resumes it.
    pub fn send_data(
        &self,
        id: NonZeroStreamId,
        payload: &Bytes,
        end_stream: bool,
    ) -> Result<(), TransportError> {
        if payload.is_empty() {
            if end_stream {
                self.write_frame(&Frame::data(id.get(), DataFlags::END_STREAM, Bytes::new()))?;
            }
            return Ok(());
        }
        let mut offset = 0;
        while offset < payload.len() {
            let granted =
                self.flow
                    .reserve(id.get(), payload.len() - offset, self.peer_max_frame_size())?;
            let last = offset + granted == payload.len();
            let flags = if end_stream && last {
                DataFlags::END_STREAM
            } else {
                DataFlags::empty()
            };
            self.write_frame(&Frame::data(
                id.get(),
                flags,
                payload.slice(offset..offset + granted),
            ))?;
            offset += granted;
        }
        Ok(())
    }

    pub fn send_rst(&self, id: NonZeroStreamId, error: ErrorType) {
        self.write_frame(&Frame::rst_stream(id.get(), error)).ok();
    }

    /// Open a locally-initiated stream: registry entry plus flow windows.
    pub fn open_stream(
        &self,
    ) -> Result<(NonZeroStreamId, Arc<Mutex<crate::stream::Stream>>), TransportError> {
        if self.is_closed() || self.is_draining() {
            return Err(TransportError::ConnectionClosed);
        }
        let (id, stream) = self.streams.allocate();
        self.flow.register_stream(id.get());
        Ok((id, stream))
    }

    /// Forget a stream once its call is done with it.
    pub fn release_stream(&self, id: NonZeroStreamId) {
        self.streams.remove(id);
        self.flow.deregister_stream(id.get());
    }

    #[must_use]
    pub fn peer_max_frame_size(&self) -> usize {
        self.peer_settings.read().expect("peer settings read")[SettingsParameter::MaxFrameSize]
            as usize
    }

    fn wait_ready(&self, timeout: Duration) -> bool {
        let (lock, cond) = &self.ready;
        let deadline = Instant::now() + timeout;
        let mut is_ready = lock.lock().expect("ready lock");
        while !*is_ready && !self.closed.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = cond
                .wait_timeout(is_ready, deadline - now)
                .expect("ready wait");
            is_ready = next;
        }
        *is_ready && !self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.goaway_last_stream.lock().expect("goaway lock").is_some()
    }

    /// Graceful local close: best-effort GOAWAY, then teardown.
    pub fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.write_frame(&Frame::goaway(0, ErrorType::NoError, b"")).ok();
        self.teardown();
    }

    /// Fail every stream, wake every waiter, shut the socket. Idempotent.
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        self.flow.fail();

        let mut hooks: Vec<UpdateHook> = Vec::new();
        for stream in self.streams.all() {
            let mut stream = stream.lock().expect("stream lock");
            stream.fail(Status::new(
                StatusCode::Unavailable,
                "connection closed".to_owned(),
            ));
            if let Some(hook) = stream.update_hook() {
                hooks.push(hook);
            }
        }
        {
            let mut socket = self.socket.lock().expect("socket lock");
            socket.shutdown();
        }
        let (_, cond) = &self.ready;
        cond.notify_all();
        for hook in hooks {
            hook();
        }
        trace!("connection torn down");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            let mut socket = self.socket.lock().expect("socket lock");
            socket.shutdown();
        }
    }
}
