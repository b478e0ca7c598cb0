use flate2::{
    read::{DeflateDecoder, GzDecoder},
    write::{DeflateEncoder, GzEncoder},
    Compression,
};
use std::io::{Read, Write};

/// Message encodings carried in `grpc-encoding` / `grpc-accept-encoding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    Identity,
    Gzip,
    Deflate,
}

impl Algorithm {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "identity" => Some(Self::Identity),
            "gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

pub fn compress(data: &[u8], algorithm: Algorithm) -> std::io::Result<Vec<u8>> {
    match algorithm {
        Algorithm::Identity => Ok(data.to_vec()),
        Algorithm::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Algorithm::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
    }
}

pub fn decompress(data: &[u8], algorithm: Algorithm) -> std::io::Result<Vec<u8>> {
    match algorithm {
        Algorithm::Identity => Ok(data.to_vec()),
        Algorithm::Gzip => {
            let mut out = Vec::new();
            GzDecoder::new(data).read_to_end(&mut out)?;
            Ok(out)
        }
        Algorithm::Deflate => {
            let mut out = Vec::new();
            DeflateDecoder::new(data).read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(algorithm: Algorithm) {
        for data in [
            &b""[..],
            &b"a"[..],
            &b"the quick brown fox jumps over the lazy dog"[..],
            &[0u8; 10_000][..],
        ] {
            let packed = compress(data, algorithm).unwrap();
            assert_eq!(decompress(&packed, algorithm).unwrap(), data);
        }
    }

    #[test]
    fn gzip_roundtrip() {
        roundtrip(Algorithm::Gzip);
    }

    #[test]
    fn deflate_roundtrip() {
        roundtrip(Algorithm::Deflate);
    }

    #[test]
    fn identity_is_passthrough() {
        let data = b"untouched";
        assert_eq!(compress(data, Algorithm::Identity).unwrap(), data);
        roundtrip(Algorithm::Identity);
    }

    #[test]
    fn names_roundtrip() {
        for algorithm in [Algorithm::Identity, Algorithm::Gzip, Algorithm::Deflate] {
            assert_eq!(Algorithm::from_name(algorithm.name()), Some(algorithm));
        }
        assert_eq!(Algorithm::from_name("snappy"), None);
    }
}
