use bytes::Bytes;
use num_derive::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;

// Safety: value is a const, that can't be zero
pub const U31_MAX: NonZeroU32 = unsafe { NonZeroU32::new_unchecked(u32::MAX >> 1) };

pub type StreamId = u32;
pub type NonZeroStreamId = std::num::NonZeroU32;

/// The mandatory first 24 octets sent by an HTTP/2 client.
pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// https://httpwg.org/specs/rfc7540.html#InitialWindowSize
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;
/// https://httpwg.org/specs/rfc7540.html#rfc.section.4.2
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    /// Tolerated on the wire, never acted upon.
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    /// Push is disabled via SETTINGS; tolerated on the wire only.
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorType {
    /// Graceful shutdown, e.g. in a GOAWAY.
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    /// The peer violated the flow-control protocol.
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    /// A frame arrived after a stream was half-closed.
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    /// The stream was refused prior to any application processing.
    RefusedStream = 0x7,
    /// The stream is no longer needed.
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    enum_map::Enum,
)]
#[repr(u16)]
#[non_exhaustive]
pub enum SettingsParameter {
    /// Maximum size of the header compression table. Advisory here: the
    /// dynamic table is never used.
    HeaderTableSize = 0x1,
    /// 0 disables server push; we always send 0.
    EnablePush = 0x2,
    /// Maximum number of concurrent streams the sender will allow.
    MaxConcurrentStreams = 0x3,
    /// Initial window size for stream-level flow control. A change adjusts
    /// the windows of all open streams by the delta.
    InitialWindowSize = 0x4,
    /// Largest frame payload the sender is willing to receive.
    MaxFrameSize = 0x5,
    /// Advisory maximum header list size.
    MaxHeaderListSize = 0x6,
}

/// Terminal outcome of a call.
///
/// https://grpc.github.io/grpc/core/md_doc_statuscodes.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Map an HTTP/2 RST_STREAM error code onto the status the application
    /// observes for that stream.
    #[must_use]
    pub fn from_http2_error(error: ErrorType) -> Self {
        match error {
            ErrorType::NoError | ErrorType::Cancel => Self::Cancelled,
            ErrorType::RefusedStream => Self::Unavailable,
            ErrorType::EnhanceYourCalm => Self::ResourceExhausted,
            ErrorType::InadequateSecurity => Self::PermissionDenied,
            _ => Self::Internal,
        }
    }
}

/// Status code plus optional UTF-8 details, as carried in trailers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub details: Option<String>,
}

impl Status {
    #[must_use]
    pub fn new(code: StatusCode, details: impl Into<Option<String>>) -> Self {
        Self {
            code,
            details: details.into(),
        }
    }

    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            details: None,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

/// Synchronous result of batch submission and other call operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum CallError {
    Ok = 0,
    /// Catch-all for invalid arguments.
    Error = 1,
    /// The op is client-only.
    NotOnServer = 2,
    /// The op is server-only.
    NotOnClient = 3,
    /// The op was already performed on this call.
    AlreadyInvoked = 4,
    /// The op requires an earlier op that has not happened yet.
    NotInvoked = 5,
    /// The call already reached a terminal status.
    AlreadyFinished = 6,
    /// A batch of the same direction is already in flight.
    TooManyOps = 7,
    /// Reserved bits were set in an op's flags.
    InvalidFlags = 8,
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("connection closed mid-frame")]
    ShortRead,
    #[error("frame of {length} bytes exceeds the {max} byte limit")]
    FrameTooLarge { length: u32, max: u32 },
    #[error("header block: {0}")]
    Hpack(#[from] crate::hpack::HpackError),
    #[error("protocol error: {0:?}")]
    Protocol(ErrorType),
    #[error("flow-control window violation")]
    FlowWindow,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("peer sent GOAWAY ({0:?})")]
    GoAway(ErrorType),
}

/// Owned contiguous bytes, copied in at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteBuffer {
    data: Bytes,
}

impl ByteBuffer {
    #[must_use]
    pub fn new(data: impl AsRef<[u8]>) -> Self {
        Self {
            data: Bytes::copy_from_slice(data.as_ref()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl AsRef<[u8]> for ByteBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Bytes> for ByteBuffer {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl From<ByteBuffer> for Bytes {
    fn from(buffer: ByteBuffer) -> Self {
        buffer.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn status_codes_cover_the_standard_range() {
        for value in 0..=16 {
            assert!(StatusCode::from_u32(value).is_some(), "code {}", value);
        }
        assert!(StatusCode::from_u32(17).is_none());
    }

    #[test]
    fn rst_error_mapping() {
        assert_eq!(
            StatusCode::from_http2_error(ErrorType::Cancel),
            StatusCode::Cancelled
        );
        assert_eq!(
            StatusCode::from_http2_error(ErrorType::RefusedStream),
            StatusCode::Unavailable
        );
        assert_eq!(
            StatusCode::from_http2_error(ErrorType::ProtocolError),
            StatusCode::Internal
        );
    }

    #[test]
    fn byte_buffer_copies_in() {
        let mut source = vec![1u8, 2, 3];
        let buffer = ByteBuffer::new(&source);
        source[0] = 9;
        assert_eq!(buffer.as_ref(), &[1, 2, 3]);
        assert_eq!(buffer.len(), 3);
    }
}
