//! RFC 7541 header coding, restricted to what the runtime speaks: integer
//! representations with a configurable prefix, literal header fields, and
//! static-table lookups. The dynamic table is deliberately unused; every
//! header this side emits is a literal without indexing. Huffman strings are
//! rejected on both paths.

use crate::metadata::Metadata;
use bytes::{BufMut, Bytes, BytesMut};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpackError {
    #[error("truncated header block")]
    Truncated,
    #[error("integer representation overflows")]
    Overflow,
    #[error("header field index {0} has no static table entry")]
    InvalidIndex(u32),
    #[error("Huffman-coded string (unsupported)")]
    HuffmanUnsupported,
}

/// Representation octet for a literal header field without indexing with a
/// literal name, https://httpwg.org/specs/rfc7541.html#literal.header.without.indexing
const LITERAL_WITHOUT_INDEXING: u8 = 0x00;

#[derive(Debug, Clone)]
struct TableEntry {
    name: Bytes,
    value: Bytes,
}

macro_rules! static_table {
    ( $( $name:expr => $value:expr ),+ ) => {
        [
            $(
                TableEntry {
                    name: Bytes::from_static($name),
                    value: Bytes::from_static($value),
                }
            ),+
        ]
    };
}

/// https://httpwg.org/specs/rfc7541.html#static.table.definition
static STATIC_TABLE: [TableEntry; 61] = static_table![
    b":authority" => b"",
    b":method" => b"GET",
    b":method" => b"POST",
    b":path" => b"/",
    b":path" => b"/index.html",
    b":scheme" => b"http",
    b":scheme" => b"https",
    b":status" => b"200",
    b":status" => b"204",
    b":status" => b"206",
    b":status" => b"304",
    b":status" => b"400",
    b":status" => b"404",
    b":status" => b"500",
    b"accept-charset" => b"",
    b"accept-encoding" => b"gzip, deflate",
    b"accept-language" => b"",
    b"accept-ranges" => b"",
    b"accept" => b"",
    b"access-control-allow-origin" => b"",
    b"age" => b"",
    b"allow" => b"",
    b"authorization" => b"",
    b"cache-control" => b"",
    b"content-disposition" => b"",
    b"content-encoding" => b"",
    b"content-language" => b"",
    b"content-length" => b"",
    b"content-location" => b"",
    b"content-range" => b"",
    b"content-type" => b"",
    b"cookie" => b"",
    b"date" => b"",
    b"etag" => b"",
    b"expect" => b"",
    b"expires" => b"",
    b"from" => b"",
    b"host" => b"",
    b"if-match" => b"",
    b"if-modified-since" => b"",
    b"if-none-match" => b"",
    b"if-range" => b"",
    b"if-unmodified-since" => b"",
    b"last-modified" => b"",
    b"link" => b"",
    b"location" => b"",
    b"max-forwards" => b"",
    b"proxy-authenticate" => b"",
    b"proxy-authorization" => b"",
    b"range" => b"",
    b"referer" => b"",
    b"refresh" => b"",
    b"retry-after" => b"",
    b"server" => b"",
    b"set-cookie" => b"",
    b"strict-transport-security" => b"",
    b"transfer-encoding" => b"",
    b"user-agent" => b"",
    b"vary" => b"",
    b"via" => b"",
    b"www-authenticate" => b""
];

fn static_entry(index: u32) -> Result<&'static TableEntry, HpackError> {
    if index == 0 {
        return Err(HpackError::InvalidIndex(0));
    }
    STATIC_TABLE
        .get(index as usize - 1)
        .ok_or(HpackError::InvalidIndex(index))
}

/// Encode `value` with an N-bit prefix (https://httpwg.org/specs/rfc7541.html#integer.representation).
/// `flags` carries the representation bits of the first octet. Returns the
/// number of bytes written. Values below the prefix maximum take the short
/// form; everything else is the prefix marker followed by base-128
/// continuation bytes.
pub fn encode_integer(value: u32, prefix_bits: u8, flags: u8, out: &mut BytesMut) -> usize {
    debug_assert!((1..=7).contains(&prefix_bits));
    let max_prefix = (1u32 << prefix_bits) - 1;
    if value < max_prefix {
        out.put_u8(flags | value as u8);
        return 1;
    }
    out.put_u8(flags | max_prefix as u8);
    let mut remainder = value - max_prefix;
    let mut written = 1;
    while remainder >= 128 {
        out.put_u8((remainder % 128) as u8 | 0x80);
        remainder /= 128;
        written += 1;
    }
    out.put_u8(remainder as u8);
    written + 1
}

/// Decode an N-bit-prefix integer, returning the value and the bytes read.
/// Truncated continuations are `Truncated`; a continuation shifted past
/// `m = 28` or a value past `u32` is `Overflow`.
pub fn decode_integer(buf: &[u8], prefix_bits: u8) -> Result<(u32, usize), HpackError> {
    debug_assert!((1..=7).contains(&prefix_bits));
    let max_prefix = (1u32 << prefix_bits) - 1;
    let first = *buf.first().ok_or(HpackError::Truncated)?;
    let prefix = u32::from(first) & max_prefix;
    if prefix < max_prefix {
        return Ok((prefix, 1));
    }
    let mut value = u64::from(max_prefix);
    let mut shift = 0u32;
    for (i, byte) in buf[1..].iter().enumerate() {
        if shift > 28 {
            return Err(HpackError::Overflow);
        }
        value += u64::from(byte & 0x7f) << shift;
        if value > u64::from(u32::MAX) {
            return Err(HpackError::Overflow);
        }
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok((value as u32, i + 2));
        }
    }
    Err(HpackError::Truncated)
}

fn encode_string(data: &[u8], out: &mut BytesMut) {
    // H bit clear: this side never Huffman-codes.
    encode_integer(data.len() as u32, 7, 0x00, out);
    out.put_slice(data);
}

fn decode_string(buf: &[u8]) -> Result<(Bytes, usize), HpackError> {
    let first = *buf.first().ok_or(HpackError::Truncated)?;
    if first & 0x80 != 0 {
        return Err(HpackError::HuffmanUnsupported);
    }
    let (length, consumed) = decode_integer(buf, 7)?;
    let end = consumed + length as usize;
    if buf.len() < end {
        return Err(HpackError::Truncated);
    }
    Ok((Bytes::copy_from_slice(&buf[consumed..end]), end))
}

/// Emit one header as a literal without indexing with a literal name.
pub fn encode_literal_header(name: &[u8], value: &[u8], out: &mut BytesMut) {
    out.put_u8(LITERAL_WITHOUT_INDEXING);
    encode_string(name, out);
    encode_string(value, out);
}

/// Encode a whole metadata array. Order is preserved; values pass through as
/// raw octets, so binary values survive.
pub fn encode_metadata(metadata: &Metadata, out: &mut BytesMut) {
    for (key, value) in metadata.iter() {
        encode_literal_header(key.as_bytes(), value, out);
    }
}

/// Decode one header field starting at `buf[0]`. Returns the pair and the
/// bytes consumed. Indexed fields resolve against the static table only;
/// literal forms that would touch the dynamic table are decoded as plain
/// literals and the table side effect is skipped.
fn decode_header(buf: &[u8]) -> Result<((Bytes, Bytes), usize), HpackError> {
    let first = *buf.first().ok_or(HpackError::Truncated)?;
    if first & 0x80 != 0 {
        // Indexed header field.
        let (index, consumed) = decode_integer(buf, 7)?;
        let entry = static_entry(index)?;
        return Ok(((entry.name.clone(), entry.value.clone()), consumed));
    }

    let (name_prefix, is_size_update) = if first & 0x40 != 0 {
        (6, false) // literal with incremental indexing; insertion skipped
    } else if first & 0x20 != 0 {
        (5, true) // dynamic table size update; nothing to resize
    } else {
        (4, false) // without indexing (0x00) or never indexed (0x10)
    };

    if is_size_update {
        let (_, consumed) = decode_integer(buf, name_prefix)?;
        return Ok(((Bytes::new(), Bytes::new()), consumed));
    }

    let (name_index, mut consumed) = decode_integer(buf, name_prefix)?;
    let name = if name_index == 0 {
        let (name, read) = decode_string(&buf[consumed..])?;
        consumed += read;
        name
    } else {
        static_entry(name_index)?.name.clone()
    };
    let (value, read) = decode_string(&buf[consumed..])?;
    consumed += read;
    Ok(((name, value), consumed))
}

/// Decode a complete header block into a metadata array, in wire order.
pub fn decode_metadata(buf: &[u8]) -> Result<Metadata, HpackError> {
    let mut metadata = Metadata::new();
    let mut offset = 0;
    while offset < buf.len() {
        let ((name, value), consumed) = decode_header(&buf[offset..])?;
        offset += consumed;
        if name.is_empty() {
            continue; // table size update, carries no header
        }
        metadata.add_bytes(String::from_utf8_lossy(&name).into_owned(), value);
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::hpack as their_hpack;

    fn roundtrip_integer(value: u32, prefix_bits: u8) {
        let mut out = BytesMut::new();
        let written = encode_integer(value, prefix_bits, 0, &mut out);
        assert_eq!(written, out.len());
        assert_eq!(
            decode_integer(&out, prefix_bits).unwrap(),
            (value, written),
            "value {} prefix {}",
            value,
            prefix_bits
        );
    }

    #[test]
    fn integer_rfc_examples() {
        // https://httpwg.org/specs/rfc7541.html#integer.representation.examples
        let mut out = BytesMut::new();
        encode_integer(10, 5, 0, &mut out);
        assert_eq!(out.as_ref(), &[0b0000_1010]);

        let mut out = BytesMut::new();
        encode_integer(1337, 5, 0, &mut out);
        assert_eq!(out.as_ref(), &[0b0001_1111, 0b1001_1010, 0b0000_1010]);

        let mut out = BytesMut::new();
        encode_integer(42, 7, 0, &mut out);
        assert_eq!(out.as_ref(), &[0b0010_1010]);
    }

    #[test]
    fn integer_roundtrips_across_prefixes() {
        for prefix_bits in 1..=7 {
            for value in [0, 1, 2, 126, 127, 128, 255, 256, 16_383, u32::MAX - 1] {
                roundtrip_integer(value, prefix_bits);
            }
        }
    }

    #[test]
    fn integer_boundary_sizes() {
        for prefix_bits in 1..=7u8 {
            let max_prefix = (1u32 << prefix_bits) - 1;

            let mut out = BytesMut::new();
            assert_eq!(encode_integer(max_prefix - 1, prefix_bits, 0, &mut out), 1);

            let mut out = BytesMut::new();
            assert_eq!(encode_integer(max_prefix, prefix_bits, 0, &mut out), 2);
        }
    }

    #[test]
    fn truncated_continuation_is_rejected() {
        let mut out = BytesMut::new();
        encode_integer(1337, 5, 0, &mut out);
        for cut in 0..out.len() {
            assert_eq!(decode_integer(&out[..cut], 5), Err(HpackError::Truncated));
        }
    }

    #[test]
    fn oversized_integer_is_rejected() {
        // Prefix max plus five continuation bytes shifted past m = 28.
        let buf = [0x1f, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert_eq!(decode_integer(&buf, 5), Err(HpackError::Overflow));
    }

    #[test]
    fn literal_header_roundtrip() {
        let mut out = BytesMut::new();
        encode_literal_header(b"grpc-status", b"0", &mut out);
        assert_eq!(out[0], 0x00);
        let ((name, value), consumed) = decode_header(&out).unwrap();
        assert_eq!(consumed, out.len());
        assert_eq!(name.as_ref(), b"grpc-status");
        assert_eq!(value.as_ref(), b"0");
    }

    #[test]
    fn literal_with_oversized_declared_length_is_rejected() {
        let mut out = BytesMut::new();
        out.put_u8(0x00);
        out.put_u8(0x7e); // name length 126, but nothing follows
        assert_eq!(decode_header(&out), Err(HpackError::Truncated));
    }

    #[test]
    fn huffman_coded_literal_is_rejected() {
        let mut out = BytesMut::new();
        out.put_u8(0x00);
        out.put_u8(0x81); // H bit set
        out.put_u8(0x8c);
        assert_eq!(decode_header(&out), Err(HpackError::HuffmanUnsupported));
    }

    #[test]
    fn indexed_field_resolves_against_the_static_table() {
        // Index 3 is (:method, POST).
        let buf = [0x83u8];
        let ((name, value), _) = decode_header(&buf).unwrap();
        assert_eq!(name.as_ref(), b":method");
        assert_eq!(value.as_ref(), b"POST");
    }

    #[test]
    fn dynamic_index_is_rejected() {
        let mut buf = BytesMut::new();
        encode_integer(62, 7, 0x80, &mut buf);
        assert_eq!(decode_header(&buf), Err(HpackError::InvalidIndex(62)));
    }

    #[test]
    fn metadata_roundtrip_preserves_order_and_binary_values() {
        let mut metadata = Metadata::new();
        metadata.add("content-type", "application/grpc");
        metadata.add("user-agent", "x/1");
        metadata.add_bytes(
            "checksum-bin".to_owned(),
            Bytes::from_static(&[0x00, 0xff, 0x80, 0x01]),
        );
        metadata.add("grpc-status", "0");

        let mut out = BytesMut::new();
        encode_metadata(&metadata, &mut out);
        let decoded = decode_metadata(&out).unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn their_decoder_reads_our_encoding() {
        let mut metadata = Metadata::new();
        metadata.add(":method", "POST");
        metadata.add(":path", "/echo.Echo/SayHello");
        metadata.add("content-type", "application/grpc");

        let mut out = BytesMut::new();
        encode_metadata(&metadata, &mut out);

        let mut their_decoder = their_hpack::Decoder::new();
        let theirs = their_decoder.decode(&out).unwrap();
        assert_eq!(
            theirs,
            metadata
                .iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v.to_vec()))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn our_decoder_reads_their_encoding() {
        let headers = vec![
            (&b":status"[..], &b"200"[..]),
            (&b"content-type"[..], &b"application/grpc"[..]),
            (&b"grpc-encoding"[..], &b"identity"[..]),
        ];
        let mut their_encoder = their_hpack::Encoder::new();
        let encoded = their_encoder.encode(headers.clone());

        let decoded = decode_metadata(&encoded).unwrap();
        assert_eq!(
            decoded
                .iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v.to_vec()))
                .collect::<Vec<_>>(),
            headers
                .into_iter()
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .collect::<Vec<_>>()
        );
    }
}
