//! Streaming compression codecs for externally stored bodies
//!
//! The external store sees opaque bytes; compression is layered onto its
//! readers and writers here. Absence of compression is the null codec, so
//! callers never branch on "is compression configured".

use std::io::{self, Read, Write};

/// Wraps external-store streams with compression/decompression.
pub trait Codec: Send + Sync {
    fn wrap_compress<'a>(
        &self,
        w: Box<dyn Write + Send + 'a>,
    ) -> io::Result<Box<dyn Write + Send + 'a>>;

    fn wrap_decompress<'a>(
        &self,
        r: Box<dyn Read + Send + 'a>,
    ) -> io::Result<Box<dyn Read + Send + 'a>>;
}

/// Identity codec.
pub struct NullCodec;

impl Codec for NullCodec {
    fn wrap_compress<'a>(
        &self,
        w: Box<dyn Write + Send + 'a>,
    ) -> io::Result<Box<dyn Write + Send + 'a>> {
        Ok(w)
    }

    fn wrap_decompress<'a>(
        &self,
        r: Box<dyn Read + Send + 'a>,
    ) -> io::Result<Box<dyn Read + Send + 'a>> {
        Ok(r)
    }
}

/// zstd streaming codec. The compressed frame is finished when the writer
/// is dropped.
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Codec for ZstdCodec {
    fn wrap_compress<'a>(
        &self,
        w: Box<dyn Write + Send + 'a>,
    ) -> io::Result<Box<dyn Write + Send + 'a>> {
        Ok(Box::new(zstd::Encoder::new(w, self.level)?.auto_finish()))
    }

    fn wrap_decompress<'a>(
        &self,
        r: Box<dyn Read + Send + 'a>,
    ) -> io::Result<Box<dyn Read + Send + 'a>> {
        Ok(Box::new(zstd::Decoder::new(r)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(codec: &dyn Codec, data: &[u8]) -> Vec<u8> {
        let mut compressed = Vec::new();
        {
            let w = codec.wrap_compress(Box::new(&mut compressed)).unwrap();
            let mut w = w;
            w.write_all(data).unwrap();
            w.flush().unwrap();
        }
        let mut out = Vec::new();
        codec
            .wrap_decompress(Box::new(compressed.as_slice()))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_null_round_trip() {
        let data = b"To: someone@example.org\r\n\r\nhello";
        assert_eq!(round_trip(&NullCodec, data), data);
    }

    #[test]
    fn test_zstd_round_trip() {
        let data = "body line\r\n".repeat(500);
        assert_eq!(round_trip(&ZstdCodec::new(3), data.as_bytes()), data.as_bytes());
    }

    #[test]
    fn test_zstd_actually_compresses() {
        let codec = ZstdCodec::new(3);
        let data = "body line\r\n".repeat(1000);
        let mut compressed = Vec::new();
        {
            let mut w = codec.wrap_compress(Box::new(&mut compressed)).unwrap();
            w.write_all(data.as_bytes()).unwrap();
        }
        assert!(compressed.len() < data.len());
    }
}
