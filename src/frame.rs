use crate::{flags::*, types::*};
use bytes::{BufMut, Bytes, BytesMut};
use num_traits::{FromPrimitive, ToPrimitive};

/// https://httpwg.org/specs/rfc7540.html#FrameHeader
pub const FRAME_HEADER_SIZE: usize = 9;

#[derive(Debug, Clone)]
pub struct Frame {
    pub typ: FrameType,
    pub flags: u8,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

/// Outcome of one parse attempt against a reassembly buffer.
#[derive(Debug)]
pub enum Parsed {
    /// Not enough buffered bytes for a whole frame yet.
    Incomplete,
    /// A frame, and the number of buffer bytes it consumed.
    Frame(Frame, usize),
    /// A frame of an unknown type, skipped whole.
    Unknown { typ: u8, consumed: usize },
}

impl Frame {
    #[must_use]
    pub fn new(typ: FrameType, flags: Flags, stream_id: StreamId, payload: impl Into<Bytes>) -> Self {
        Self {
            typ,
            flags: flags.bits(),
            stream_id,
            payload: payload.into(),
        }
    }

    /// Try to parse one frame out of `buf`. The reserved bit of the stream
    /// id is cleared, never errored. Unknown frame types are consumed and
    /// reported so the caller can skip them.
    pub fn parse(buf: &[u8], max_frame_size: u32) -> Result<Parsed, TransportError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(Parsed::Incomplete);
        }
        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        if length > max_frame_size {
            return Err(TransportError::FrameTooLarge {
                length,
                max: max_frame_size,
            });
        }
        let total = FRAME_HEADER_SIZE + length as usize;
        if buf.len() < total {
            return Ok(Parsed::Incomplete);
        }
        let raw_typ = buf[3];
        let flags = buf[4];
        // unwrap: the length of the slice is always 4
        let stream_id = u32::from_be_bytes(buf[5..9].try_into().unwrap()) & (u32::MAX >> 1);
        let Some(typ) = FrameType::from_u8(raw_typ) else {
            return Ok(Parsed::Unknown {
                typ: raw_typ,
                consumed: total,
            });
        };
        Ok(Parsed::Frame(
            Self {
                typ,
                flags,
                stream_id,
                payload: Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..total]),
            },
            total,
        ))
    }

    /// Serialize header and payload. The caller writes the result under the
    /// connection write lock so the frame stays atomic on the wire.
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        out.put_slice(&(self.payload.len() as u32).to_be_bytes()[1..]);
        // unwrap: FrameType is repr(u8)
        out.put_u8(self.typ.to_u8().unwrap());
        out.put_u8(self.flags);
        out.put_u32(self.stream_id & (u32::MAX >> 1));
        out.put_slice(&self.payload);
        out
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    // Constructors for the control frames the engine emits.

    #[must_use]
    pub fn settings(params: &[(SettingsParameter, u32)]) -> Self {
        let mut payload = BytesMut::with_capacity((2 + 4) * params.len());
        for (key, value) in params {
            // unwrap: SettingsParameter is repr(u16)
            payload.put_u16(key.to_u16().unwrap());
            payload.put_u32(*value);
        }
        Self::new(FrameType::Settings, Flags::None, 0, payload.freeze())
    }

    #[must_use]
    pub fn settings_ack() -> Self {
        Self::new(
            FrameType::Settings,
            Flags::Settings(SettingsFlags::ACK),
            0,
            Bytes::new(),
        )
    }

    #[must_use]
    pub fn ping_ack(payload: Bytes) -> Self {
        Self::new(FrameType::Ping, Flags::Ping(PingFlags::ACK), 0, payload)
    }

    #[must_use]
    pub fn window_update(stream_id: StreamId, increment: u32) -> Self {
        Self::new(
            FrameType::WindowUpdate,
            Flags::None,
            stream_id,
            Bytes::copy_from_slice(&(increment & (u32::MAX >> 1)).to_be_bytes()),
        )
    }

    #[must_use]
    pub fn rst_stream(stream_id: StreamId, error: ErrorType) -> Self {
        Self::new(
            FrameType::ResetStream,
            Flags::None,
            stream_id,
            // unwrap: ErrorType is repr(u32)
            Bytes::copy_from_slice(&error.to_u32().unwrap().to_be_bytes()),
        )
    }

    #[must_use]
    pub fn goaway(last_stream_id: StreamId, error: ErrorType, debug: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(8 + debug.len());
        payload.put_u32(last_stream_id & (u32::MAX >> 1));
        // unwrap: ErrorType is repr(u32)
        payload.put_u32(error.to_u32().unwrap());
        payload.put_slice(debug);
        Self::new(FrameType::GoAway, Flags::None, 0, payload.freeze())
    }

    #[must_use]
    pub fn headers(stream_id: StreamId, flags: HeadersFlags, fragment: Bytes) -> Self {
        Self::new(FrameType::Headers, Flags::Headers(flags), stream_id, fragment)
    }

    #[must_use]
    pub fn data(stream_id: StreamId, flags: DataFlags, payload: Bytes) -> Self {
        Self::new(FrameType::Data, Flags::Data(flags), stream_id, payload)
    }

    // Typed payload accessors used by the engine's dispatch loop.

    /// SETTINGS entries; unknown identifiers are ignored per RFC 7540 §6.5.2.
    #[must_use]
    pub fn settings_entries(&self) -> Vec<(SettingsParameter, u32)> {
        self.payload
            .chunks_exact(2 + 4)
            .filter_map(|chunk| {
                // unwrap: chunks_exact guarantees the lengths
                let key = u16::from_be_bytes(chunk[0..2].try_into().unwrap());
                let value = u32::from_be_bytes(chunk[2..6].try_into().unwrap());
                SettingsParameter::from_u16(key).map(|param| (param, value))
            })
            .collect()
    }

    pub fn window_update_increment(&self) -> Result<NonZeroStreamId, TransportError> {
        if self.payload.len() != 4 {
            return Err(TransportError::Protocol(ErrorType::FrameSizeError));
        }
        // unwrap: the length of the slice is always 4
        let raw = u32::from_be_bytes(self.payload[0..4].try_into().unwrap()) & (u32::MAX >> 1);
        NonZeroStreamId::new(raw).ok_or(TransportError::Protocol(ErrorType::ProtocolError))
    }

    /// RST_STREAM error code; codes this implementation does not know are
    /// treated as internal errors per RFC 7540 §7.
    pub fn rst_stream_error(&self) -> Result<ErrorType, TransportError> {
        if self.payload.len() != 4 {
            return Err(TransportError::Protocol(ErrorType::FrameSizeError));
        }
        // unwrap: the length of the slice is always 4
        let raw = u32::from_be_bytes(self.payload[0..4].try_into().unwrap());
        Ok(ErrorType::from_u32(raw).unwrap_or(ErrorType::InternalError))
    }

    pub fn goaway_fields(&self) -> Result<(StreamId, ErrorType, Bytes), TransportError> {
        if self.payload.len() < 8 {
            return Err(TransportError::Protocol(ErrorType::FrameSizeError));
        }
        // unwrap: the length of the slices is always 4
        let last = u32::from_be_bytes(self.payload[0..4].try_into().unwrap()) & (u32::MAX >> 1);
        let raw = u32::from_be_bytes(self.payload[4..8].try_into().unwrap());
        Ok((
            last,
            ErrorType::from_u32(raw).unwrap_or(ErrorType::InternalError),
            self.payload.slice(8..),
        ))
    }

    /// DATA payload with any padding stripped.
    pub fn data_payload(&self) -> Result<Bytes, TransportError> {
        if self.has_flag(DataFlags::PADDED.bits()) {
            let pad = *self
                .payload
                .first()
                .ok_or(TransportError::Protocol(ErrorType::FrameSizeError))?
                as usize;
            if 1 + pad > self.payload.len() {
                return Err(TransportError::Protocol(ErrorType::ProtocolError));
            }
            Ok(self.payload.slice(1..self.payload.len() - pad))
        } else {
            Ok(self.payload.clone())
        }
    }

    /// HEADERS fragment with padding and the priority fields stripped.
    pub fn headers_fragment(&self) -> Result<Bytes, TransportError> {
        let mut start = 0;
        let mut end = self.payload.len();
        if self.has_flag(HeadersFlags::PADDED.bits()) {
            let pad = *self
                .payload
                .first()
                .ok_or(TransportError::Protocol(ErrorType::FrameSizeError))?
                as usize;
            start += 1;
            end = end
                .checked_sub(pad)
                .ok_or(TransportError::Protocol(ErrorType::ProtocolError))?;
        }
        if self.has_flag(HeadersFlags::PRIORITY.bits()) {
            start += 5;
        }
        if start > end {
            return Err(TransportError::Protocol(ErrorType::FrameSizeError));
        }
        Ok(self.payload.slice(start..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_encode_and_parse() {
        let frame = Frame::data(
            3,
            DataFlags::END_STREAM,
            Bytes::from_static(b"hello world"),
        );
        let encoded = frame.encode();
        match Frame::parse(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap() {
            Parsed::Frame(parsed, consumed) => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(parsed.typ, FrameType::Data);
                assert_eq!(parsed.stream_id, 3);
                assert!(parsed.has_flag(DataFlags::END_STREAM.bits()));
                assert_eq!(parsed.payload.as_ref(), b"hello world");
            }
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn short_buffer_is_incomplete() {
        let frame = Frame::settings(&[(SettingsParameter::EnablePush, 0)]);
        let encoded = frame.encode();
        for cut in 0..encoded.len() {
            assert!(matches!(
                Frame::parse(&encoded[..cut], DEFAULT_MAX_FRAME_SIZE).unwrap(),
                Parsed::Incomplete
            ));
        }
    }

    #[test]
    fn reserved_stream_id_bit_is_cleared() {
        let mut encoded = Frame::window_update(5, 100).encode();
        encoded[5] |= 0x80;
        match Frame::parse(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap() {
            Parsed::Frame(parsed, _) => assert_eq!(parsed.stream_id, 5),
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let frame = Frame::data(1, DataFlags::empty(), Bytes::from(vec![0u8; 32]));
        let encoded = frame.encode();
        assert!(matches!(
            Frame::parse(&encoded, 16),
            Err(TransportError::FrameTooLarge { length: 32, max: 16 })
        ));
    }

    #[test]
    fn unknown_frame_type_is_skipped() {
        let mut encoded = Frame::ping_ack(Bytes::from_static(&[0u8; 8])).encode();
        encoded[3] = 0x42;
        match Frame::parse(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap() {
            Parsed::Unknown { typ, consumed } => {
                assert_eq!(typ, 0x42);
                assert_eq!(consumed, encoded.len());
            }
            other => panic!("expected unknown, got {:?}", other),
        }
    }

    #[test]
    fn settings_entries_ignore_unknown_identifiers() {
        let mut payload = BytesMut::new();
        payload.put_u16(0x4); // InitialWindowSize
        payload.put_u32(10);
        payload.put_u16(0xff); // unknown, must be ignored
        payload.put_u32(1);
        let frame = Frame::new(FrameType::Settings, Flags::None, 0, payload.freeze());
        assert_eq!(
            frame.settings_entries(),
            vec![(SettingsParameter::InitialWindowSize, 10)]
        );
    }

    #[test]
    fn zero_window_increment_is_a_protocol_error() {
        let frame = Frame::new(
            FrameType::WindowUpdate,
            Flags::None,
            1,
            Bytes::copy_from_slice(&0u32.to_be_bytes()),
        );
        assert!(matches!(
            frame.window_update_increment(),
            Err(TransportError::Protocol(ErrorType::ProtocolError))
        ));
    }

    #[test]
    fn padded_data_payload_is_stripped() {
        let mut payload = BytesMut::new();
        payload.put_u8(3); // pad length
        payload.put_slice(b"abc");
        payload.put_slice(&[0u8; 3]);
        let frame = Frame::new(
            FrameType::Data,
            Flags::Data(DataFlags::PADDED),
            1,
            payload.freeze(),
        );
        assert_eq!(frame.data_payload().unwrap().as_ref(), b"abc");
    }
}
