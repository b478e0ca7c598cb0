use bytes::Bytes;
use std::time::Duration;

/// Ordered (key, value) pairs. Keys are ASCII; values are opaque octets, so
/// binary headers pass through untouched. Insertion order is what goes on
/// the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, Bytes)>,
}

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl AsRef<[u8]>) {
        self.entries
            .push((key.into(), Bytes::copy_from_slice(value.as_ref())));
    }

    pub fn add_bytes(&mut self, key: String, value: Bytes) {
        self.entries.push((key, value));
    }

    /// First value for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// First value for `key` as UTF-8, lossy.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Bytes)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Bytes)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, Bytes)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = &'a (String, Bytes);
    type IntoIter = std::slice::Iter<'a, (String, Bytes)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Percent-encode a `grpc-message` value: bytes outside the printable ASCII
/// range and `%` itself become `%XX`.
/// https://github.com/grpc/grpc/blob/master/doc/PROTOCOL-HTTP2.md
#[must_use]
pub fn percent_encode(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for byte in message.bytes() {
        match byte {
            b'%' => out.push_str("%25"),
            0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Decode a percent-encoded `grpc-message`. Malformed escapes pass through
/// verbatim rather than erroring, matching the gRPC wire format rules.
#[must_use]
pub fn percent_decode(message: &str) -> String {
    let bytes = message.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(message.get(i + 1..i + 3).unwrap_or(""), 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Render a deadline as a `grpc-timeout` header value in milliseconds.
#[must_use]
pub fn format_timeout(remaining: Duration) -> String {
    format!("{}m", remaining.as_millis().max(1))
}

/// Parse a `grpc-timeout` header value (digits plus a unit octet).
#[must_use]
pub fn parse_timeout(value: &str) -> Option<Duration> {
    let (digits, unit) = value.split_at(value.len().checked_sub(1)?);
    let amount: u64 = digits.parse().ok()?;
    Some(match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_preserved() {
        let mut metadata = Metadata::new();
        metadata.add("b", "2");
        metadata.add("a", "1");
        metadata.add("b", "3");
        let keys: Vec<_> = metadata.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "a", "b"]);
        assert_eq!(metadata.get("b").unwrap().as_ref(), b"2");
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut metadata = Metadata::new();
        metadata.add("Content-Type", "application/grpc");
        assert_eq!(
            metadata.get_str("content-type").as_deref(),
            Some("application/grpc")
        );
    }

    #[test]
    fn percent_roundtrip() {
        let message = "nicht gefunden: café \u{1f980}";
        assert_eq!(percent_decode(&percent_encode(message)), message);
    }

    #[test]
    fn percent_encoding_leaves_plain_ascii_alone() {
        assert_eq!(percent_encode("plain message"), "plain message");
        assert_eq!(percent_encode("50%"), "50%25");
    }

    #[test]
    fn malformed_escapes_pass_through() {
        assert_eq!(percent_decode("50%"), "50%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn timeout_roundtrip() {
        let timeout = format_timeout(Duration::from_millis(5000));
        assert_eq!(timeout, "5000m");
        assert_eq!(parse_timeout(&timeout), Some(Duration::from_millis(5000)));
        assert_eq!(parse_timeout("10S"), Some(Duration::from_secs(10)));
        assert_eq!(parse_timeout("bogus"), None);
    }
}
