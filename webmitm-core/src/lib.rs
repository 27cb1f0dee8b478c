pub mod body;
pub mod certs;
pub mod codec;
pub mod handler;
pub mod hooks;
pub mod message;
pub mod metrics;
pub mod relay;
pub mod session;
mod session_loop;
pub mod stream;
pub mod tlspeek;
mod transparent;
mod tunnel;
pub mod upstream;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use prometheus::Registry;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::{error, info};
use webmitm_config::Config;

pub use handler::ProxyCore;
pub use hooks::{AuthChallenger, Authorizer, BasicAuthorizer, ExceptionReporter, HookSet, InterceptHandler};
pub use session::{ConnectRequest, Endpoint, Exchange};

/// Error kinds the core surfaces. Each session-scoped failure is
/// reported once and terminates its exchange; resources release on
/// every path through scoped ownership.
#[derive(Debug)]
pub enum ProxyError {
    /// The client stream closed mid-exchange; exits quietly.
    ClientAborted,
    /// The connection factory could not reach the origin.
    UpstreamUnreachable(io::Error),
    /// Start line, headers, or chunk framing could not be parsed.
    MalformedFraming(&'static str),
    /// Either side's TLS handshake failed.
    TlsHandshakeFailed(io::Error),
    /// A user hook failed; fatal for the exchange.
    Hook(String),
    Io(io::Error),
    /// A session-scoped failure wrapping its cause.
    Exchange {
        context: &'static str,
        source: Box<ProxyError>,
    },
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::ClientAborted => write!(f, "client closed the connection mid-exchange"),
            ProxyError::UpstreamUnreachable(e) => write!(f, "upstream unreachable: {}", e),
            ProxyError::MalformedFraming(detail) => write!(f, "malformed framing: {}", detail),
            ProxyError::TlsHandshakeFailed(e) => write!(f, "TLS handshake failed: {}", e),
            ProxyError::Hook(detail) => write!(f, "hook failed: {}", detail),
            ProxyError::Io(e) => write!(f, "I/O error: {}", e),
            ProxyError::Exchange { context, source } => write!(f, "{}: {}", context, source),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::UpstreamUnreachable(e)
            | ProxyError::TlsHandshakeFailed(e)
            | ProxyError::Io(e) => Some(e),
            ProxyError::Exchange { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        ProxyError::Io(err)
    }
}

impl ProxyError {
    /// Label for the error metric.
    pub fn kind_label(&self) -> &'static str {
        match self {
            ProxyError::ClientAborted => "client_aborted",
            ProxyError::UpstreamUnreachable(_) => "upstream_unreachable",
            ProxyError::MalformedFraming(_) => "malformed_framing",
            ProxyError::TlsHandshakeFailed(_) => "tls_handshake",
            ProxyError::Hook(_) => "hook",
            ProxyError::Io(_) => "io",
            ProxyError::Exchange { source, .. } => source.kind_label(),
        }
    }

    /// Client misbehaviour is logged at debug, real faults at error.
    pub fn is_client_fault(&self) -> bool {
        match self {
            ProxyError::ClientAborted | ProxyError::MalformedFraming(_) => true,
            ProxyError::TlsHandshakeFailed(_) => true,
            ProxyError::Exchange { source, .. } => source.is_client_fault(),
            _ => false,
        }
    }
}

/// Bind every configured endpoint and serve until shutdown.
pub async fn run_proxy(
    config: Config,
    hooks: HookSet,
    registry: Option<Registry>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let core = Arc::new(ProxyCore::new(
        config.clone(),
        Arc::new(hooks),
        registry.as_ref(),
    )?);

    let mut listeners: Vec<(TcpListener, Arc<Endpoint>)> = Vec::new();
    for endpoint_config in &config.endpoints {
        let endpoint = Arc::new(core.build_endpoint(endpoint_config)?);
        let addr: SocketAddr = endpoint_config.listen().parse()?;
        info!("Starting {} listener on {}", endpoint.kind(), addr);
        listeners.push((TcpListener::bind(addr).await?, endpoint));
    }

    let cleanup = core.factory.clone().start_cleanup_task(Duration::from_secs(10));

    info!("Proxy started, waiting for connections...");

    loop {
        let mut accepts = FuturesUnordered::new();
        for (listener, endpoint) in &listeners {
            accepts.push(async move { (listener.accept().await, endpoint.clone()) });
        }

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Received shutdown signal");
                break;
            }
            _ = signal::ctrl_c() => {
                info!("Received interrupt");
                break;
            }
            Some((result, endpoint)) = accepts.next() => {
                match result {
                    Ok((socket, addr)) => {
                        let core = core.clone();
                        tokio::spawn(async move {
                            core.handle_client(socket, addr, endpoint).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }

    cleanup.abort();
    info!("Shutting down proxy");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_label_through_wrapping() {
        let inner = ProxyError::UpstreamUnreachable(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        let wrapped = ProxyError::Exchange {
            context: "sending request head",
            source: Box::new(inner),
        };
        assert_eq!(wrapped.kind_label(), "upstream_unreachable");
        assert!(!wrapped.is_client_fault());
        assert!(wrapped.to_string().contains("sending request head"));
    }

    #[test]
    fn client_faults_are_quiet() {
        assert!(ProxyError::ClientAborted.is_client_fault());
        assert!(ProxyError::MalformedFraming("x").is_client_fault());
        assert!(!ProxyError::Hook("boom".into()).is_client_fault());
    }
}
