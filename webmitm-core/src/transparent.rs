//! Transparent-endpoint handling: origin-directed traffic, TLS
//! terminated immediately based on SNI.

use std::io;
use std::net::SocketAddr;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::ProxyError;
use crate::certs;
use crate::handler::ProxyCore;
use crate::session::TransparentEndpoint;
use crate::session_loop::{LoopMode, SessionLoop};
use crate::stream::{FramedStream, Prepend};
use crate::tlspeek;

pub(crate) async fn handle_transparent(
    core: &ProxyCore,
    endpoint: &TransparentEndpoint,
    mut client: FramedStream,
    client_addr: SocketAddr,
) -> Result<(), ProxyError> {
    if endpoint.tls
        && let Some(hello) = tlspeek::client_hello(&mut client).await?
    {
        let name = hello
            .sni
            .clone()
            .or_else(|| endpoint.default_sni.clone())
            .ok_or_else(|| {
                warn!(peer = %client_addr, "ClientHello without SNI and no fallback name");
                ProxyError::TlsHandshakeFailed(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "no SNI and no configured fallback certificate name",
                ))
            })?;
        debug!(peer = %client_addr, sni = %name, "Terminating transparent TLS");

        let pattern = certs::wildcard_pattern(&name);
        let tls_config = core
            .certs
            .server_config(&pattern)
            .map_err(|error| ProxyError::TlsHandshakeFailed(io::Error::other(error.to_string())))?;
        let acceptor = TlsAcceptor::from(tls_config);
        let (leftover, client_io) = client.into_parts();
        let tls_stream = acceptor
            .accept(Prepend::new(leftover, client_io))
            .await
            .map_err(ProxyError::TlsHandshakeFailed)?;
        let client = FramedStream::new(Box::new(tls_stream), core.config.proxy.buffer_size);

        let mode = LoopMode::Transparent {
            tls: true,
            implicit_host: Some(name),
        };
        return SessionLoop::new(core, client, client_addr, mode, None, None)
            .run()
            .await;
    }

    // Plaintext: requests are routed on their Host header
    let mode = LoopMode::Transparent {
        tls: false,
        implicit_host: endpoint.default_sni.clone(),
    };
    SessionLoop::new(core, client, client_addr, mode, None, None)
        .run()
        .await
}
