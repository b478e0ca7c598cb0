use crate::{hpack, metadata::Metadata, types::*};
use bytes::{Buf, Bytes, BytesMut};
use derivative::Derivative;
use log::trace;
use num_traits::FromPrimitive;
use std::{collections::VecDeque, sync::Arc};

/// Non-owning hook back to whatever owns the stream (a call); invoked after
/// the reader thread delivers a frame, never while the stream is locked.
pub type UpdateHook = Arc<dyn Fn() + Send + Sync>;

/// https://httpwg.org/specs/rfc7540.html#StreamStates
/// Reserved states never occur: push is disabled on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// gRPC message prefix: 1-byte compressed flag + 4-byte big-endian length.
pub const MESSAGE_PREFIX_SIZE: usize = 5;

/// What one inbound frame made newly available to the owning call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Initial metadata became available.
    pub initial_metadata: bool,
    /// Trailing metadata and a terminal status became available.
    pub trailers: bool,
    /// Number of messages completed by this frame.
    pub messages: usize,
    /// The peer half-closed; no more data or trailers will arrive.
    pub end_of_stream: bool,
}

/// One HTTP/2 stream: reassembles header blocks across CONTINUATION frames
/// and gRPC messages across DATA frames, and tracks the half-close state of
/// both directions.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Stream {
    pub id: NonZeroStreamId,
    state: StreamState,
    /// Header block under reassembly, with the END_STREAM flag of the
    /// HEADERS frame that opened it.
    continuation: Option<(BytesMut, bool)>,
    header_blocks_seen: u8,
    pub initial_metadata: Option<Metadata>,
    pub trailing_metadata: Option<Metadata>,
    pub status: Option<Status>,
    message_buffer: BytesMut,
    messages: VecDeque<(bool, Bytes)>,
    #[derivative(Debug = "ignore")]
    on_update: Option<UpdateHook>,
}

impl Stream {
    #[must_use]
    pub fn new(id: NonZeroStreamId) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            continuation: None,
            header_blocks_seen: 0,
            initial_metadata: None,
            trailing_metadata: None,
            status: None,
            message_buffer: BytesMut::new(),
            messages: VecDeque::new(),
            on_update: None,
        }
    }

    pub fn set_update_hook(&mut self, hook: UpdateHook) {
        self.on_update = Some(hook);
    }

    /// Cloned hook, to be invoked after the stream lock is released.
    #[must_use]
    pub fn update_hook(&self) -> Option<UpdateHook> {
        self.on_update.clone()
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    #[must_use]
    pub fn recv_closed(&self) -> bool {
        matches!(self.state, StreamState::HalfClosedRemote | StreamState::Closed)
    }

    fn transition(&mut self, state: StreamState) {
        if self.state != state {
            trace!("stream {} {:?} -> {:?}", self.id, self.state, state);
            self.state = state;
        }
    }

    /// Local side sent HEADERS.
    pub fn mark_sent_headers(&mut self) {
        if self.state == StreamState::Idle {
            self.transition(StreamState::Open);
        }
    }

    /// Local side sent END_STREAM.
    pub fn mark_send_closed(&mut self) {
        match self.state {
            StreamState::Idle | StreamState::Open => self.transition(StreamState::HalfClosedLocal),
            StreamState::HalfClosedRemote => self.transition(StreamState::Closed),
            _ => {}
        }
    }

    fn mark_recv_closed(&mut self) {
        match self.state {
            StreamState::Idle | StreamState::Open => self.transition(StreamState::HalfClosedRemote),
            StreamState::HalfClosedLocal => self.transition(StreamState::Closed),
            _ => {}
        }
    }

    /// A HEADERS frame arrived. Returns what became available; with
    /// END_HEADERS clear, the block continues in CONTINUATION frames.
    pub fn on_headers(
        &mut self,
        fragment: Bytes,
        end_headers: bool,
        end_stream: bool,
    ) -> Result<Delivery, TransportError> {
        if self.state == StreamState::Idle {
            self.transition(StreamState::Open);
        }
        if end_headers {
            self.complete_header_block(&fragment, end_stream)
        } else {
            let mut buffer = BytesMut::new();
            buffer.extend_from_slice(&fragment);
            self.continuation = Some((buffer, end_stream));
            Ok(Delivery::default())
        }
    }

    /// A CONTINUATION frame arrived for the block opened by the last HEADERS.
    pub fn on_continuation(
        &mut self,
        fragment: Bytes,
        end_headers: bool,
    ) -> Result<Delivery, TransportError> {
        let Some((mut buffer, end_stream)) = self.continuation.take() else {
            return Err(TransportError::Protocol(ErrorType::ProtocolError));
        };
        buffer.extend_from_slice(&fragment);
        if end_headers {
            let block = buffer.freeze();
            self.complete_header_block(&block, end_stream)
        } else {
            self.continuation = Some((buffer, end_stream));
            Ok(Delivery::default())
        }
    }

    fn complete_header_block(
        &mut self,
        block: &[u8],
        end_stream: bool,
    ) -> Result<Delivery, TransportError> {
        let metadata = hpack::decode_metadata(block)?;
        let mut delivery = Delivery::default();
        if self.header_blocks_seen == 0 {
            // A first block with END_STREAM is a trailers-only response:
            // the status rides along with the initial metadata.
            if end_stream {
                self.status = Some(derive_status(&metadata));
                self.trailing_metadata = Some(metadata.clone());
                delivery.trailers = true;
            }
            self.initial_metadata = Some(metadata);
            delivery.initial_metadata = true;
        } else {
            self.status = Some(derive_status(&metadata));
            self.trailing_metadata = Some(metadata);
            delivery.trailers = true;
        }
        self.header_blocks_seen = self.header_blocks_seen.saturating_add(1);
        if end_stream {
            self.mark_recv_closed();
            delivery.end_of_stream = true;
        }
        Ok(delivery)
    }

    /// A DATA frame arrived: reassemble length-prefixed messages. A message
    /// boundary may fall anywhere, including across frames; zero-length
    /// messages are legal.
    pub fn on_data(&mut self, payload: Bytes, end_stream: bool) -> Result<Delivery, TransportError> {
        if self.recv_closed() {
            return Err(TransportError::Protocol(ErrorType::StreamClosed));
        }
        self.message_buffer.extend_from_slice(&payload);

        let mut delivery = Delivery::default();
        while self.message_buffer.len() >= MESSAGE_PREFIX_SIZE {
            let compressed = match self.message_buffer[0] {
                0 => false,
                1 => true,
                _ => return Err(TransportError::Protocol(ErrorType::ProtocolError)),
            };
            let length = u32::from_be_bytes(
                // unwrap: the length of the slice is always 4
                self.message_buffer[1..MESSAGE_PREFIX_SIZE].try_into().unwrap(),
            ) as usize;
            if self.message_buffer.len() < MESSAGE_PREFIX_SIZE + length {
                break;
            }
            self.message_buffer.advance(MESSAGE_PREFIX_SIZE);
            let message = self.message_buffer.split_to(length).freeze();
            self.messages.push_back((compressed, message));
            delivery.messages += 1;
        }

        if end_stream {
            if !self.message_buffer.is_empty() {
                // Truncated message at end of stream.
                return Err(TransportError::Protocol(ErrorType::ProtocolError));
            }
            self.mark_recv_closed();
            delivery.end_of_stream = true;
        }
        Ok(delivery)
    }

    /// RST_STREAM: both halves close, and the status maps from the HTTP/2
    /// error code unless trailers already set one.
    pub fn on_rst(&mut self, error: ErrorType) {
        if self.status.is_none() {
            self.status = Some(Status::new(StatusCode::from_http2_error(error), None));
        }
        self.transition(StreamState::Closed);
    }

    /// Force a terminal status during teardown (GOAWAY, transport failure).
    pub fn fail(&mut self, status: Status) {
        if self.status.is_none() {
            self.status = Some(status);
        }
        self.transition(StreamState::Closed);
    }

    /// Next completed message, in wire order, with its compressed flag.
    pub fn take_message(&mut self) -> Option<(bool, Bytes)> {
        self.messages.pop_front()
    }
}

/// Status as derived from a trailer block: `grpc-status` is an ASCII
/// decimal, `grpc-message` percent-encoded UTF-8. A completed stream with
/// no usable status is `Unknown`.
#[must_use]
pub fn derive_status(trailers: &Metadata) -> Status {
    let code = trailers
        .get_str("grpc-status")
        .and_then(|raw| raw.parse::<u32>().ok())
        .and_then(StatusCode::from_u32)
        .unwrap_or(StatusCode::Unknown);
    let details = trailers
        .get_str("grpc-message")
        .map(|raw| crate::metadata::percent_decode(&raw));
    Status::new(code, details)
}
