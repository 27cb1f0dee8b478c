//! Body codecs for hook-rewritten payloads.
//!
//! Only the encodings the proxy advertises upstream (`Accept-Encoding:
//! gzip,deflate`) are supported. Streaming bodies are never recoded; a
//! body passes through here only after a hook materialised it in memory.

use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use std::io::{self, Read, Write};

/// Compress `data` with the named `Content-Encoding` token.
/// `identity` (or empty) passes through.
pub fn compress(encoding: &str, data: &[u8]) -> io::Result<Vec<u8>> {
    match normalise(encoding) {
        "gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        "deflate" => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        "" | "identity" => Ok(data.to_vec()),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported content encoding: {}", other),
        )),
    }
}

/// Decompress `data` previously encoded with the named token.
pub fn decompress(encoding: &str, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match normalise(encoding) {
        "gzip" => GzDecoder::new(data).read_to_end(&mut out).map(|_| out),
        "deflate" => ZlibDecoder::new(data).read_to_end(&mut out).map(|_| out),
        "" | "identity" => Ok(data.to_vec()),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported content encoding: {}", other),
        )),
    }
}

fn normalise(encoding: &str) -> &str {
    encoding.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let body = b"hook-rewritten response body".repeat(16);
        let packed = compress("gzip", &body).unwrap();
        assert!(packed.len() < body.len());
        assert_eq!(decompress("gzip", &packed).unwrap(), body);
    }

    #[test]
    fn deflate_uses_zlib_framing() {
        let packed = compress("deflate", b"abc").unwrap();
        // zlib header: CMF byte 0x78 for 32K window deflate
        assert_eq!(packed[0], 0x78);
        assert_eq!(decompress("deflate", &packed).unwrap(), b"abc");
    }

    #[test]
    fn identity_passes_through() {
        assert_eq!(compress("identity", b"x").unwrap(), b"x");
        assert_eq!(compress("", b"x").unwrap(), b"x");
    }

    #[test]
    fn unknown_encoding_rejected() {
        assert!(compress("br", b"x").is_err());
        assert!(decompress("zstd", b"x").is_err());
    }
}
