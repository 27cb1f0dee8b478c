//! The explicit-endpoint CONNECT state machine.
//!
//! A freshly accepted client either opens a tunnel with `CONNECT` or
//! sends plain absolute-URL requests. Tunnels are classified by a
//! non-consuming ClientHello peek and then either spliced verbatim or
//! TLS-terminated with a minted certificate.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::ProxyError;
use crate::certs;
use crate::handler::ProxyCore;
use crate::message::{Headers, TargetUri, parse_request_line};
use crate::relay;
use crate::session::{ConnectRequest, ExplicitEndpoint};
use crate::session_loop::{LoopMode, SessionLoop};
use crate::stream::{FramedStream, Prepend};
use crate::tlspeek;
use crate::upstream::UpstreamIdentity;

pub(crate) async fn handle_explicit(
    core: &ProxyCore,
    endpoint: &ExplicitEndpoint,
    mut client: FramedStream,
    client_addr: SocketAddr,
) -> Result<(), ProxyError> {
    let line = client.read_line().await?;
    if line.is_empty() {
        // Probe connection, closed before any command
        return Ok(());
    }
    let (method, target, version) = parse_request_line(&line)?;

    if method != "CONNECT" {
        let session = SessionLoop::new(
            core,
            client,
            client_addr,
            LoopMode::PlainExplicit,
            None,
            Some((method, target, version)),
        );
        return session.run().await;
    }

    let Some((host, port)) = TargetUri::parse_authority(&target) else {
        let reply = format!("{} 400 Bad Request\r\nContent-Length: 0\r\n\r\n", version);
        client.write_all(reply.as_bytes()).await?;
        client.flush().await?;
        return Err(ProxyError::MalformedFraming("invalid CONNECT target"));
    };
    let headers = Headers::read_block(&mut client).await?;

    let mut connect = ConnectRequest {
        excluded: endpoint.is_excluded(&host),
        host,
        port,
        version,
        headers,
        is_tls: false,
        client_hello: None,
        server_hello: None,
    };

    core.hooks.tunnel_connect_request(&mut connect).await?;

    if !core.hooks.authorize(&connect.headers, &mut client).await? {
        debug!(peer = %client_addr, target = %connect.authority(), "Tunnel authorisation denied");
        core.hooks.tunnel_connect_response(&mut connect).await?;
        return Ok(());
    }

    let established = format!("{} 200 Connection Established\r\n\r\n", connect.version);
    client.write_all(established.as_bytes()).await?;
    client.flush().await?;

    connect.client_hello = client_hello_peek(&mut client).await?;
    connect.is_tls = connect.client_hello.is_some();

    core.hooks.tunnel_connect_response(&mut connect).await?;

    if connect.excluded || !connect.is_tls {
        debug!(
            peer = %client_addr,
            target = %connect.authority(),
            tls = connect.is_tls,
            excluded = connect.excluded,
            "Splicing tunnel"
        );
        core.count_tunnel("splice");
        return splice_raw(core, connect, client).await;
    }

    // Decrypt: terminate TLS with a certificate minted for the host
    let pattern = certs::wildcard_pattern(&connect.host);
    let tls_config = match &endpoint.generic_certificate {
        Some(config) => config.clone(),
        None => core
            .certs
            .server_config(&pattern)
            .map_err(|error| ProxyError::TlsHandshakeFailed(io::Error::other(error.to_string())))?,
    };
    let acceptor = TlsAcceptor::from(tls_config);
    let (leftover, client_io) = client.into_parts();
    let tls_stream = acceptor
        .accept(Prepend::new(leftover, client_io))
        .await
        .map_err(ProxyError::TlsHandshakeFailed)?;
    let mut client = FramedStream::new(Box::new(tls_stream), core.config.proxy.buffer_size);
    core.count_tunnel("decrypt");

    // Some protocols tunnel non-HTTP over 443; those bytes are relayed
    // opaquely over a fresh TLS connection to the origin.
    if !looks_like_http_method(&mut client).await? {
        debug!(
            peer = %client_addr,
            target = %connect.authority(),
            "Decrypted stream is not HTTP, relaying opaquely"
        );
        return splice_decrypted(core, connect, client).await;
    }

    let mode = LoopMode::DecryptedTunnel {
        host: connect.host.clone(),
        port: connect.port,
    };
    let session = SessionLoop::new(core, client, client_addr, mode, Some(Arc::new(connect)), None);
    session.run().await
}

/// Peek up to 10 bytes for an HTTP request line: at least three ASCII
/// letters followed by a space. Anything else is not HTTP.
pub(crate) async fn looks_like_http_method(stream: &mut FramedStream) -> io::Result<bool> {
    for offset in 0..10 {
        match stream.peek_byte(offset).await? {
            None => return Ok(false),
            Some(b' ') => return Ok(offset >= 3),
            Some(byte) if byte.is_ascii_alphabetic() => {}
            Some(_) => return Ok(false),
        }
    }
    Ok(false)
}

/// Blind splice: raw TCP to the origin, bytes forwarded verbatim. For
/// TLS tunnels the origin's ServerHello is peeked off the outbound
/// stream and recorded before relaying begins.
async fn splice_raw(
    core: &ProxyCore,
    mut connect: ConnectRequest,
    mut client: FramedStream,
) -> Result<(), ProxyError> {
    let identity = UpstreamIdentity {
        host: connect.host.clone(),
        port: connect.port,
        version: connect.version,
        tls: connect.is_tls,
        upstream_proxy: core.config.proxy.upstream_https_proxy.clone(),
        bind_endpoint: core
            .config
            .proxy
            .upstream_bind_endpoint
            .as_deref()
            .and_then(|endpoint| endpoint.parse().ok()),
    };
    let mut upstream = core.factory.acquire(&identity, true).await?;

    // Forward the already-buffered client bytes (the peeked handshake)
    // so the origin can answer before the relay starts.
    let buffered = client.take_buffered();
    if !buffered.is_empty() {
        core.hooks.data_sent(&buffered);
        upstream.stream.write_all(&buffered).await?;
        upstream.stream.flush().await?;
    }
    if connect.is_tls {
        connect.server_hello = tlspeek::server_hello(&mut upstream.stream)
            .await
            .map_err(ProxyError::Io)?;
    }

    let (client_leftover, client_io) = client.into_parts();
    let (server_leftover, server_io) = upstream.stream.into_parts();
    relay::relay(
        client_io,
        client_leftover,
        server_io,
        server_leftover,
        &core.buffers,
        Duration::from_secs(core.config.timeouts.idle),
        core.hooks.clone(),
        core.relay_counters(),
    )
    .await
    .map_err(ProxyError::Io)
}

/// Relay a decrypted but non-HTTP stream over a fresh TLS connection to
/// the origin.
async fn splice_decrypted(
    core: &ProxyCore,
    connect: ConnectRequest,
    client: FramedStream,
) -> Result<(), ProxyError> {
    let identity = UpstreamIdentity {
        host: connect.host.clone(),
        port: connect.port,
        version: connect.version,
        tls: true,
        upstream_proxy: core.config.proxy.upstream_https_proxy.clone(),
        bind_endpoint: core
            .config
            .proxy
            .upstream_bind_endpoint
            .as_deref()
            .and_then(|endpoint| endpoint.parse().ok()),
    };
    let upstream = core.factory.acquire(&identity, false).await?;

    let (client_leftover, client_io) = client.into_parts();
    let (server_leftover, server_io) = upstream.stream.into_parts();
    relay::relay(
        client_io,
        client_leftover,
        server_io,
        server_leftover,
        &core.buffers,
        Duration::from_secs(core.config.timeouts.idle),
        core.hooks.clone(),
        core.relay_counters(),
    )
    .await
    .map_err(ProxyError::Io)
}

/// ClientHello classification; a peek failure on the client side means
/// the tunnel simply is not TLS.
async fn client_hello_peek(
    client: &mut FramedStream,
) -> Result<Option<crate::tlspeek::ClientHelloInfo>, ProxyError> {
    match tlspeek::client_hello(client).await {
        Ok(info) => Ok(info),
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(error) => Err(ProxyError::Io(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn probe(data: &[u8]) -> bool {
        let (near, mut far) = tokio::io::duplex(4096);
        let payload = data.to_vec();
        tokio::spawn(async move {
            far.write_all(&payload).await.unwrap();
            far.shutdown().await.unwrap();
        });
        let mut stream = FramedStream::new(Box::new(near), 4096);
        looks_like_http_method(&mut stream).await.unwrap()
    }

    #[tokio::test]
    async fn http_methods_are_recognised() {
        assert!(probe(b"GET / HTTP/1.1\r\n").await);
        assert!(probe(b"DELETE /x HTTP/1.1\r\n").await);
        assert!(probe(b"OPTIONS * HTTP/1.1\r\n").await);
    }

    #[tokio::test]
    async fn short_or_binary_prefixes_are_rejected() {
        // Two letters then space
        assert!(!probe(b"GO / HTTP/1.1\r\n").await);
        // TLS record
        assert!(!probe(&[0x16, 0x03, 0x01, 0x02, 0x00]).await);
        // EOF before anything
        assert!(!probe(b"").await);
        // Letters but never a space within the probe window
        assert!(!probe(b"ABCDEFGHIJKLMNOP").await);
    }

    #[tokio::test]
    async fn probe_does_not_consume() {
        let (near, mut far) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            far.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
            far.shutdown().await.unwrap();
        });
        let mut stream = FramedStream::new(Box::new(near), 4096);
        assert!(looks_like_http_method(&mut stream).await.unwrap());
        assert_eq!(stream.read_line().await.unwrap(), "GET / HTTP/1.1");
    }
}
