//! Body transfer between the client and the origin.
//!
//! Three framings exist on the wire: identity with a known length,
//! chunked, and close-delimited. Streaming transfers re-emit the original
//! framing; materialised (hook-read) bodies are re-sent identity-framed
//! by the session loop.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use tokio::io::AsyncWrite;

use crate::ProxyError;
use crate::message::{Request, Response};
use crate::stream::FramedStream;

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Length(u64),
    Chunked,
    UntilClose,
}

/// Framing of a request body, `None` when the request has none.
pub fn request_framing(request: &Request) -> Option<BodyFraming> {
    if request.chunked {
        return Some(BodyFraming::Chunked);
    }
    match request.content_length {
        Some(0) | None => None,
        Some(n) => Some(BodyFraming::Length(n)),
    }
}

/// Framing of a response body, `None` when the exchange carries none.
/// `HEAD` responses and bodyless statuses advertise lengths they do not
/// send.
pub fn response_framing(request_method: &str, response: &Response) -> Option<BodyFraming> {
    if request_method.eq_ignore_ascii_case("HEAD") || response.is_bodyless() {
        return None;
    }
    if response.chunked {
        return Some(BodyFraming::Chunked);
    }
    match response.content_length {
        Some(0) => None,
        Some(n) => Some(BodyFraming::Length(n)),
        None => Some(BodyFraming::UntilClose),
    }
}

/// Stream a body from `src` to `dst` preserving the original framing.
/// Returns the payload byte count (chunk data only, framing excluded).
/// Every payload chunk is surfaced to `observer` before it is written.
pub async fn pump(
    src: &mut FramedStream,
    dst: &mut (dyn AsyncWrite + Unpin + Send),
    framing: BodyFraming,
    observer: &mut (dyn FnMut(&[u8]) + Send),
) -> Result<u64, ProxyError> {
    match framing {
        BodyFraming::Length(n) => {
            src.copy_to(dst, n, observer).await?;
            Ok(n)
        }
        BodyFraming::UntilClose => src.copy_until_eof(dst, observer).await,
        BodyFraming::Chunked => pump_chunked(src, dst, observer).await,
    }
}

async fn pump_chunked(
    src: &mut FramedStream,
    dst: &mut (dyn AsyncWrite + Unpin + Send),
    observer: &mut (dyn FnMut(&[u8]) + Send),
) -> Result<u64, ProxyError> {
    use tokio::io::AsyncWriteExt;

    let mut total = 0u64;
    loop {
        let size_line = src.read_line().await?;
        let size = parse_chunk_size(&size_line)?;
        // The original size line is re-emitted verbatim, extensions included
        dst.write_all(size_line.as_bytes()).await?;
        dst.write_all(b"\r\n").await?;

        if size == 0 {
            // Trailers run until the blank line
            loop {
                let trailer = src.read_line().await?;
                dst.write_all(trailer.as_bytes()).await?;
                dst.write_all(b"\r\n").await?;
                if trailer.is_empty() {
                    return Ok(total);
                }
            }
        }

        src.copy_to(dst, size, observer).await?;
        total += size;

        let terminator = src.read_line().await?;
        if !terminator.is_empty() {
            return Err(ProxyError::MalformedFraming("chunk data not CRLF-terminated"));
        }
        dst.write_all(b"\r\n").await?;
    }
}

/// Materialise a body into memory so a hook can inspect or replace it.
pub async fn read_body(
    src: &mut FramedStream,
    framing: BodyFraming,
) -> Result<Vec<u8>, ProxyError> {
    match framing {
        BodyFraming::Length(n) => {
            let mut body = vec![0u8; n as usize];
            src.read_exact_into(&mut body)
                .await
                .map_err(|_| ProxyError::ClientAborted)?;
            Ok(body)
        }
        BodyFraming::UntilClose => {
            let mut body = Vec::new();
            src.copy_until_eof(&mut body, &mut |_| {}).await?;
            Ok(body)
        }
        BodyFraming::Chunked => {
            let mut body = Vec::new();
            loop {
                let size_line = src.read_line().await?;
                let size = parse_chunk_size(&size_line)?;
                if size == 0 {
                    // Trailers are dropped from materialised bodies
                    loop {
                        if src.read_line().await?.is_empty() {
                            return Ok(body);
                        }
                    }
                }
                let offset = body.len();
                body.resize(offset + size as usize, 0);
                src.read_exact_into(&mut body[offset..])
                    .await
                    .map_err(|_| ProxyError::ClientAborted)?;
                if !src.read_line().await?.is_empty() {
                    return Err(ProxyError::MalformedFraming("chunk data not CRLF-terminated"));
                }
            }
        }
    }
}

/// Hex chunk size, tolerating `;name=value` extensions.
fn parse_chunk_size(line: &str) -> Result<u64, ProxyError> {
    let size_token = line.split(';').next().unwrap_or("").trim();
    if size_token.is_empty() {
        return Err(ProxyError::MalformedFraming("empty chunk size line"));
    }
    u64::from_str_radix(size_token, 16)
        .map_err(|_| ProxyError::MalformedFraming("invalid chunk size"))
}

/// Fixed-size relay buffers, recycled across connections.
///
/// A lease returns its buffer to the pool on drop, so release happens on
/// every exit path.
pub struct BufferPool {
    chunk_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn lease(&self) -> BufferLease<'_> {
        let buf = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| vec![0u8; self.chunk_size]);
        BufferLease {
            pool: self,
            buf: Some(buf),
        }
    }

    fn put_back(&self, buf: Vec<u8>) {
        if buf.len() != self.chunk_size {
            return;
        }
        if let Ok(mut free) = self.free.lock() {
            free.push(buf);
        }
    }
}

pub struct BufferLease<'a> {
    pool: &'a BufferPool,
    buf: Option<Vec<u8>>,
}

impl Deref for BufferLease<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for BufferLease<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for BufferLease<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn framed(data: &[u8]) -> FramedStream {
        let (client, mut server) = tokio::io::duplex(65536);
        let data = data.to_vec();
        tokio::spawn(async move {
            server.write_all(&data).await.unwrap();
            server.shutdown().await.unwrap();
        });
        FramedStream::new(Box::new(client), 8192)
    }

    #[tokio::test]
    async fn chunked_pump_preserves_framing() {
        let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut src = framed(wire);
        let mut sink = Vec::new();
        let total = pump(&mut src, &mut sink, BodyFraming::Chunked, &mut |_| {})
            .await
            .unwrap();
        assert_eq!(total, 11);
        assert_eq!(sink, wire);
    }

    #[tokio::test]
    async fn chunked_pump_keeps_extensions_and_trailers() {
        let wire = b"5;note=x\r\nhello\r\n0\r\nX-Trailer: v\r\n\r\n";
        let mut src = framed(wire);
        let mut sink = Vec::new();
        let total = pump(&mut src, &mut sink, BodyFraming::Chunked, &mut |_| {})
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(sink, wire);
    }

    #[tokio::test]
    async fn chunked_bad_size_is_malformed() {
        let mut src = framed(b"zz\r\nhello\r\n");
        let mut sink = Vec::new();
        assert!(matches!(
            pump(&mut src, &mut sink, BodyFraming::Chunked, &mut |_| {}).await,
            Err(ProxyError::MalformedFraming(_))
        ));
    }

    #[tokio::test]
    async fn chunked_missing_terminator_is_malformed() {
        let mut src = framed(b"5\r\nhelloXX\r\n0\r\n\r\n");
        let mut sink = Vec::new();
        assert!(matches!(
            pump(&mut src, &mut sink, BodyFraming::Chunked, &mut |_| {}).await,
            Err(ProxyError::MalformedFraming(_))
        ));
    }

    #[tokio::test]
    async fn identity_pump_copies_exact_length() {
        let mut src = framed(b"hello trailing-garbage");
        let mut sink = Vec::new();
        let mut observed = 0usize;
        let total = pump(
            &mut src,
            &mut sink,
            BodyFraming::Length(5),
            &mut |chunk| observed += chunk.len(),
        )
        .await
        .unwrap();
        assert_eq!(total, 5);
        assert_eq!(sink, b"hello");
        assert_eq!(observed, 5);
    }

    #[tokio::test]
    async fn read_body_collects_chunked_payload() {
        let mut src = framed(b"3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n");
        let body = read_body(&mut src, BodyFraming::Chunked).await.unwrap();
        assert_eq!(body, b"abcdef");
    }

    #[test]
    fn chunk_size_parses_hex_and_extensions() {
        assert_eq!(parse_chunk_size("1a").unwrap(), 26);
        assert_eq!(parse_chunk_size("A; ext=1").unwrap(), 10);
        assert!(parse_chunk_size("").is_err());
        assert!(parse_chunk_size("xyz").is_err());
    }

    #[test]
    fn buffer_pool_recycles() {
        let pool = BufferPool::new(64);
        {
            let mut lease = pool.lease();
            lease[0] = 7;
            assert_eq!(lease.len(), 64);
        }
        // The returned buffer is reused
        let lease = pool.lease();
        assert_eq!(lease.len(), 64);
        assert_eq!(pool.free.lock().unwrap().len(), 0);
    }

    #[test]
    fn head_responses_have_no_framing() {
        let response = Response {
            version: crate::message::HttpVersion::V11,
            status: 200,
            reason: "OK".into(),
            headers: crate::message::Headers::new(),
            body: None,
            content_length: Some(100),
            chunked: false,
            keep_alive: true,
            continue_received: false,
            expectation_failed: false,
            locked: false,
            re_request: false,
        };
        assert_eq!(response_framing("HEAD", &response), None);
        assert_eq!(
            response_framing("GET", &response),
            Some(BodyFraming::Length(100))
        );
    }
}
