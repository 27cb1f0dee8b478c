//! Buffered framed I/O over an arbitrary duplex stream.
//!
//! The proxy swaps transports underneath a connection (raw TCP before a
//! tunnel is established, TLS after decryption), so everything here works
//! on boxed trait objects. The single internal buffer is the only place
//! lookahead lives: bytes surfaced by a peek are always surfaced again by
//! the next read or copy.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::ProxyError;

/// Any stream the proxy can sit on: TCP, TLS, or an in-memory pipe in tests.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + ?Sized> Duplex for T {}

/// A duplex stream with a fixed-capacity read buffer supporting line
/// reading, non-consuming byte peeks, and counted body copies.
pub struct FramedStream {
    inner: Box<dyn Duplex>,
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl FramedStream {
    pub fn new(inner: Box<dyn Duplex>, buffer_size: usize) -> Self {
        Self {
            inner,
            buf: vec![0u8; buffer_size],
            start: 0,
            end: 0,
        }
    }

    /// Count of buffered but unconsumed bytes.
    pub fn available(&self) -> usize {
        self.end - self.start
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The buffered window, without consuming it.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Slide the buffered window to the front so the tail is writable.
    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }

    /// Read once from the underlying stream into the buffer tail.
    /// Returns the number of bytes added, 0 on EOF or full buffer.
    async fn fill(&mut self) -> io::Result<usize> {
        self.compact();
        if self.end == self.buf.len() {
            return Ok(0);
        }
        let n = self.inner.read(&mut self.buf[self.end..]).await?;
        self.end += n;
        Ok(n)
    }

    /// Buffer at least `n` bytes if the peer provides them. Returns the
    /// number actually available, which is smaller only on EOF or when
    /// `n` exceeds the buffer capacity.
    pub async fn fill_to(&mut self, n: usize) -> io::Result<usize> {
        let target = n.min(self.buf.len());
        while self.available() < target {
            if self.fill().await? == 0 {
                break;
            }
        }
        Ok(self.available())
    }

    /// The byte at `offset` within the buffered window, without
    /// consuming it. `None` when the stream ends before `offset + 1`
    /// bytes exist or `offset` falls outside the buffer capacity.
    pub async fn peek_byte(&mut self, offset: usize) -> io::Result<Option<u8>> {
        if offset >= self.buf.len() {
            return Ok(None);
        }
        if self.fill_to(offset + 1).await? <= offset {
            return Ok(None);
        }
        Ok(Some(self.buf[self.start + offset]))
    }

    /// Consume and discard `n` buffered bytes. Caller must not exceed
    /// `available()`.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Drain the buffered window into an owned vector, leaving the
    /// stream positioned after it. Used to hand already-peeked bytes to
    /// a TLS handshake or a splice.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        let bytes = self.buf[self.start..self.end].to_vec();
        self.start = 0;
        self.end = 0;
        bytes
    }

    /// Unwrap into the leftover buffered bytes and the underlying stream.
    pub fn into_parts(mut self) -> (Vec<u8>, Box<dyn Duplex>) {
        let leftover = self.take_buffered();
        (leftover, self.inner)
    }

    /// Read bytes up to (but not including) the next CRLF.
    ///
    /// Returns an empty string on clean EOF before any byte. A line that
    /// outgrows the buffer without a terminator, or one that is not
    /// valid UTF-8, is malformed framing; EOF mid-line means the client
    /// went away.
    pub async fn read_line(&mut self) -> Result<String, ProxyError> {
        loop {
            let window = &self.buf[self.start..self.end];
            if let Some(pos) = window.iter().position(|&b| b == b'\n') {
                let mut line = &window[..pos];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                let text = std::str::from_utf8(line)
                    .map_err(|_| ProxyError::MalformedFraming("line is not valid UTF-8"))?
                    .to_string();
                self.consume(pos + 1);
                return Ok(text);
            }
            if self.available() == self.buf.len() {
                return Err(ProxyError::MalformedFraming("line exceeds buffer size"));
            }
            // An abrupt close without close_notify surfaces as an error
            // from TLS transports; with nothing buffered it is a plain EOF
            let filled = match self.fill().await {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && self.available() == 0 => 0,
                Err(e) => return Err(e.into()),
            };
            if filled == 0 {
                if self.available() == 0 {
                    return Ok(String::new());
                }
                return Err(ProxyError::ClientAborted);
            }
        }
    }

    /// Fill `out` completely from the buffer and then the stream.
    pub async fn read_exact_into(&mut self, out: &mut [u8]) -> io::Result<()> {
        let buffered = self.available().min(out.len());
        out[..buffered].copy_from_slice(&self.buf[self.start..self.start + buffered]);
        self.consume(buffered);
        if buffered < out.len() {
            self.inner.read_exact(&mut out[buffered..]).await?;
        }
        Ok(())
    }

    /// Copy exactly `n` bytes to `writer`, surfacing each chunk to the
    /// observer before it is written.
    pub async fn copy_to(
        &mut self,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        n: u64,
        observer: &mut (dyn FnMut(&[u8]) + Send),
    ) -> Result<(), ProxyError> {
        let mut remaining = n;
        while remaining > 0 {
            if self.available() == 0 && self.fill().await? == 0 {
                return Err(ProxyError::ClientAborted);
            }
            let take = (self.available() as u64).min(remaining) as usize;
            let chunk = &self.buf[self.start..self.start + take];
            observer(chunk);
            writer.write_all(chunk).await?;
            self.consume(take);
            remaining -= take as u64;
        }
        Ok(())
    }

    /// Copy until EOF, surfacing each chunk to the observer. Returns the
    /// total byte count.
    pub async fn copy_until_eof(
        &mut self,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        observer: &mut (dyn FnMut(&[u8]) + Send),
    ) -> Result<u64, ProxyError> {
        let mut total = 0u64;
        loop {
            if self.available() == 0 && self.fill().await? == 0 {
                return Ok(total);
            }
            let take = self.available();
            let chunk = &self.buf[self.start..self.start + take];
            observer(chunk);
            writer.write_all(chunk).await?;
            self.consume(take);
            total += take as u64;
        }
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    /// Direct mutable access to the transport write side, for body pumps
    /// that read from another framed stream.
    pub fn writer(&mut self) -> &mut (dyn AsyncWrite + Unpin + Send) {
        &mut self.inner
    }
}

/// Replays a prefix of already-read bytes before the wrapped stream.
///
/// TLS handshakes consume their own bytes, so the peeked ClientHello held
/// in a [`FramedStream`] buffer is handed back through this adapter
/// rather than a second buffer that could desynchronise framing.
pub struct Prepend<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> Prepend<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prepend<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let take = (self.prefix.len() - self.offset).min(buf.remaining());
            let offset = self.offset;
            buf.put_slice(&self.prefix[offset..offset + take]);
            self.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prepend<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(data: &[u8], capacity: usize) -> FramedStream {
        let (client, mut server) = tokio::io::duplex(65536);
        let data = data.to_vec();
        tokio::spawn(async move {
            server.write_all(&data).await.unwrap();
            server.shutdown().await.unwrap();
        });
        FramedStream::new(Box::new(client), capacity)
    }

    #[tokio::test]
    async fn read_line_strips_crlf() {
        let mut stream = framed(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n", 1024);
        assert_eq!(stream.read_line().await.unwrap(), "GET / HTTP/1.1");
        assert_eq!(stream.read_line().await.unwrap(), "Host: h");
        assert_eq!(stream.read_line().await.unwrap(), "");
    }

    #[tokio::test]
    async fn read_line_empty_on_clean_eof() {
        let mut stream = framed(b"", 1024);
        assert_eq!(stream.read_line().await.unwrap(), "");
    }

    #[tokio::test]
    async fn read_line_rejects_oversized() {
        let long = vec![b'a'; 128];
        let mut stream = framed(&long, 64);
        assert!(matches!(
            stream.read_line().await,
            Err(ProxyError::MalformedFraming(_))
        ));
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let mut stream = framed(b"CONNECT host:443 HTTP/1.1\r\n\r\n", 1024);
        assert_eq!(stream.peek_byte(0).await.unwrap(), Some(b'C'));
        assert_eq!(stream.peek_byte(8).await.unwrap(), Some(b'h'));
        // Peeked bytes come back unchanged on the next read
        assert_eq!(stream.read_line().await.unwrap(), "CONNECT host:443 HTTP/1.1");
    }

    #[tokio::test]
    async fn peek_past_eof_is_none() {
        let mut stream = framed(b"ab", 1024);
        assert_eq!(stream.peek_byte(1).await.unwrap(), Some(b'b'));
        assert_eq!(stream.peek_byte(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn copy_to_counts_exactly() {
        let mut stream = framed(b"hello world", 8);
        let mut sink = Vec::new();
        let mut seen = 0usize;
        stream
            .copy_to(&mut sink, 5, &mut |chunk| seen += chunk.len())
            .await
            .unwrap();
        assert_eq!(sink, b"hello");
        assert_eq!(seen, 5);
        assert_eq!(stream.peek_byte(0).await.unwrap(), Some(b' '));
    }

    #[tokio::test]
    async fn take_buffered_returns_peeked_window() {
        let mut stream = framed(b"\x16\x03\x01rest", 1024);
        stream.fill_to(7).await.unwrap();
        let leftover = stream.take_buffered();
        assert_eq!(leftover, b"\x16\x03\x01rest");
        assert_eq!(stream.available(), 0);
    }

    #[tokio::test]
    async fn prepend_replays_prefix_first() {
        let (client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server.write_all(b" world").await.unwrap();
            server.shutdown().await.unwrap();
        });
        let mut stream = Prepend::new(b"hello".to_vec(), client);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }
}
