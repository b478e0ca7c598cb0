use bitflags::bitflags;

bitflags! {
    /// https://httpwg.org/specs/rfc7540.html#DATA
    #[repr(transparent)]
    pub struct DataFlags: u8 {
        /// Last frame the endpoint will send for the identified stream.
        const END_STREAM = 0x1;
        /// The Pad Length field and the padding it describes are present.
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#HEADERS
    #[repr(transparent)]
    pub struct HeadersFlags: u8 {
        /// The header block is the last thing the endpoint will send for the
        /// identified stream (CONTINUATION frames may still follow).
        const END_STREAM = 0x1;
        /// The frame contains an entire header block, no CONTINUATION follows.
        const END_HEADERS = 0x4;
        /// The Pad Length field and the padding it describes are present.
        const PADDED = 0x8;
        /// The Exclusive Flag, Stream Dependency, and Weight fields are present.
        const PRIORITY = 0x20;
    }

    /// https://httpwg.org/specs/rfc7540.html#SETTINGS
    #[repr(transparent)]
    pub struct SettingsFlags: u8 {
        /// Acknowledges receipt and application of the peer's SETTINGS frame;
        /// the payload must be empty.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#PING
    #[repr(transparent)]
    pub struct PingFlags: u8 {
        /// This PING frame is a response; an endpoint must not respond to it.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#CONTINUATION
    #[repr(transparent)]
    pub struct ContinuationFlags: u8 {
        /// This frame ends a header block.
        const END_HEADERS = 0x4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::From, derive_more::TryInto)]
pub enum Flags {
    Data(DataFlags),
    Headers(HeadersFlags),
    Settings(SettingsFlags),
    Ping(PingFlags),
    Continuation(ContinuationFlags),
    None,
}

impl Flags {
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::Data(flags) => flags.bits(),
            Self::Headers(flags) => flags.bits(),
            Self::Settings(flags) => flags.bits(),
            Self::Ping(flags) => flags.bits(),
            Self::Continuation(flags) => flags.bits(),
            Self::None => 0,
        }
    }
}
