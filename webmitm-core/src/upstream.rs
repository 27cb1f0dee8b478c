//! Outbound connection establishment and pooling.
//!
//! Connections are pooled per full identity tuple: a hook-induced change
//! to upstream routing, or a different bind endpoint, never reuses a
//! socket dialed for another route. Handles are lent exclusively to one
//! session and return to the pool only on explicit release.

use dashmap::DashMap;
use prometheus::{IntCounter, Registry};
use rustls::ClientConfig;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::ProxyError;
use crate::message::{HttpVersion, parse_status_line};
use crate::stream::{FramedStream, Prepend};

/// Everything that distinguishes one outbound route from another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamIdentity {
    pub host: String,
    pub port: u16,
    pub version: HttpVersion,
    pub tls: bool,
    /// Upstream proxy this route is chained through, as "host:port".
    pub upstream_proxy: Option<String>,
    /// Local address the outbound socket binds to.
    pub bind_endpoint: Option<SocketAddr>,
}

impl fmt::Display for UpstreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}",
            if self.tls { "https" } else { "http" },
            self.host,
            self.port
        )?;
        if let Some(proxy) = &self.upstream_proxy {
            write!(f, " via {}", proxy)?;
        }
        Ok(())
    }
}

/// An outbound connection lent to exactly one session at a time.
pub struct Upstream {
    pub identity: UpstreamIdentity,
    pub stream: FramedStream,
    /// Whether this handle came out of the pool (stale-connection
    /// rotation applies only to reused sockets).
    pub reused: bool,
}

struct PooledUpstream {
    stream: FramedStream,
    created_at: Instant,
    last_used: Instant,
}

impl PooledUpstream {
    fn is_valid(&self, ttl: Duration, idle: Duration) -> bool {
        self.created_at.elapsed() <= ttl && self.last_used.elapsed() <= idle
    }
}

struct PoolMetrics {
    pool_hits: IntCounter,
    pool_misses: IntCounter,
    pool_evictions: IntCounter,
}

impl PoolMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let pool_hits = IntCounter::new(
            "webmitm_pool_hits_total",
            "Total upstream pool hits (reused connections)",
        )?;
        let pool_misses = IntCounter::new(
            "webmitm_pool_misses_total",
            "Total upstream pool misses (fresh dials)",
        )?;
        let pool_evictions = IntCounter::new(
            "webmitm_pool_evictions_total",
            "Total upstream connections evicted (expired or idle)",
        )?;
        registry.register(Box::new(pool_hits.clone()))?;
        registry.register(Box::new(pool_misses.clone()))?;
        registry.register(Box::new(pool_evictions.clone()))?;
        Ok(Self {
            pool_hits,
            pool_misses,
            pool_evictions,
        })
    }
}

/// Dials, wraps, pools, and recycles outbound connections.
pub struct ConnectionFactory {
    buffer_size: usize,
    connect_timeout: Duration,
    pool_enabled: bool,
    max_per_identity: usize,
    connection_ttl: Duration,
    idle_timeout: Duration,
    pools: DashMap<UpstreamIdentity, Vec<PooledUpstream>>,
    tls: TlsConnector,
    metrics: Option<PoolMetrics>,
}

impl ConnectionFactory {
    pub fn new(config: &webmitm_config::Config, registry: Option<&Registry>) -> Self {
        let pool = config.connection_pool.clone().unwrap_or_default();
        let metrics = registry.and_then(|r| PoolMetrics::new(r).ok());
        Self {
            buffer_size: config.proxy.buffer_size,
            connect_timeout: Duration::from_secs(config.timeouts.connect),
            pool_enabled: pool.enabled,
            max_per_identity: pool.max_per_host,
            connection_ttl: Duration::from_secs(pool.connection_ttl),
            idle_timeout: Duration::from_secs(pool.idle_timeout),
            pools: DashMap::new(),
            tls: TlsConnector::from(insecure_client_config()),
            metrics,
        }
    }

    /// Take a pooled connection or dial a fresh one. `is_for_connect`
    /// yields a raw TCP stream even for TLS identities: a blind splice
    /// forwards the client's own handshake.
    pub async fn acquire(
        &self,
        identity: &UpstreamIdentity,
        is_for_connect: bool,
    ) -> Result<Upstream, ProxyError> {
        if !is_for_connect
            && let Some(stream) = self.take_pooled(identity)
        {
            return Ok(Upstream {
                identity: identity.clone(),
                stream,
                reused: true,
            });
        }
        if let Some(metrics) = &self.metrics {
            metrics.pool_misses.inc();
        }
        let stream = self.dial(identity, is_for_connect).await?;
        Ok(Upstream {
            identity: identity.clone(),
            stream,
            reused: false,
        })
    }

    /// Dial a fresh connection unconditionally, bypassing the pool. Used
    /// when a pooled socket turns out to be stale on first write.
    pub async fn acquire_fresh(&self, identity: &UpstreamIdentity) -> Result<Upstream, ProxyError> {
        let stream = self.dial(identity, false).await?;
        Ok(Upstream {
            identity: identity.clone(),
            stream,
            reused: false,
        })
    }

    fn take_pooled(&self, identity: &UpstreamIdentity) -> Option<FramedStream> {
        if !self.pool_enabled {
            return None;
        }
        let mut pool = self.pools.get_mut(identity)?;
        while let Some(conn) = pool.pop() {
            if conn.is_valid(self.connection_ttl, self.idle_timeout) {
                debug!(identity = %identity, "Upstream pool hit");
                if let Some(metrics) = &self.metrics {
                    metrics.pool_hits.inc();
                }
                return Some(conn.stream);
            }
            debug!(identity = %identity, "Evicting expired upstream connection");
            if let Some(metrics) = &self.metrics {
                metrics.pool_evictions.inc();
            }
        }
        None
    }

    /// Return a clean connection to the pool. Connections that saw an
    /// I/O error must be dropped instead.
    pub fn release(&self, upstream: Upstream) {
        if !self.pool_enabled {
            return;
        }
        let mut pool = self.pools.entry(upstream.identity.clone()).or_default();
        if pool.len() >= self.max_per_identity {
            debug!(identity = %upstream.identity, "Upstream pool full, dropping connection");
            return;
        }
        let now = Instant::now();
        pool.push(PooledUpstream {
            stream: upstream.stream,
            created_at: now,
            last_used: now,
        });
    }

    /// Evict expired connections from all pools.
    pub fn cleanup(&self) {
        let mut evicted = 0usize;
        for mut entry in self.pools.iter_mut() {
            let pool = entry.value_mut();
            let before = pool.len();
            pool.retain(|conn| conn.is_valid(self.connection_ttl, self.idle_timeout));
            evicted += before - pool.len();
        }
        if evicted > 0 {
            info!(evicted, "Upstream pool cleanup complete");
            if let Some(metrics) = &self.metrics {
                metrics.pool_evictions.inc_by(evicted as u64);
            }
        }
    }

    /// Periodic cleanup driver.
    pub fn start_cleanup_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.cleanup();
            }
        })
    }

    async fn dial(
        &self,
        identity: &UpstreamIdentity,
        is_for_connect: bool,
    ) -> Result<FramedStream, ProxyError> {
        let dial_target = identity
            .upstream_proxy
            .clone()
            .unwrap_or_else(|| format!("{}:{}", identity.host, identity.port));

        debug!(identity = %identity, target = %dial_target, "Dialing upstream");
        let addr = lookup_host(&dial_target)
            .await
            .map_err(ProxyError::UpstreamUnreachable)?
            .next()
            .ok_or_else(|| {
                ProxyError::UpstreamUnreachable(io::Error::new(
                    io::ErrorKind::NotFound,
                    "failed to resolve upstream",
                ))
            })?;

        let tcp = timeout(self.connect_timeout, connect_bound(addr, identity.bind_endpoint))
            .await
            .map_err(|_| {
                ProxyError::UpstreamUnreachable(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream connect timed out",
                ))
            })?
            .map_err(ProxyError::UpstreamUnreachable)?;

        let mut stream = FramedStream::new(Box::new(tcp), self.buffer_size);

        // A TLS route through an upstream proxy needs its own tunnel; so
        // does a spliced route, which forwards opaque bytes.
        if identity.upstream_proxy.is_some() && (identity.tls || is_for_connect) {
            self.establish_chained_tunnel(&mut stream, identity).await?;
        }

        if identity.tls && !is_for_connect {
            let server_name = ServerName::try_from(identity.host.clone()).map_err(|_| {
                ProxyError::UpstreamUnreachable(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "target host is not a valid server name",
                ))
            })?;
            let (leftover, io) = stream.into_parts();
            let tls = self
                .tls
                .connect(server_name, Prepend::new(leftover, io))
                .await
                .map_err(ProxyError::TlsHandshakeFailed)?;
            stream = FramedStream::new(Box::new(tls), self.buffer_size);
        }

        Ok(stream)
    }

    /// Issue a CONNECT through the configured upstream proxy and consume
    /// its response head.
    async fn establish_chained_tunnel(
        &self,
        stream: &mut FramedStream,
        identity: &UpstreamIdentity,
    ) -> Result<(), ProxyError> {
        let connect = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
            host = identity.host,
            port = identity.port
        );
        stream.write_all(connect.as_bytes()).await?;
        stream.flush().await?;

        let status_line = stream.read_line().await?;
        let (_, status, _) = parse_status_line(&status_line)?;
        loop {
            if stream.read_line().await?.is_empty() {
                break;
            }
        }
        if status != 200 {
            return Err(ProxyError::UpstreamUnreachable(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("upstream proxy refused tunnel with status {}", status),
            )));
        }
        Ok(())
    }
}

async fn connect_bound(addr: SocketAddr, bind: Option<SocketAddr>) -> io::Result<TcpStream> {
    match bind {
        None => TcpStream::connect(addr).await,
        Some(bind) => {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(bind)?;
            socket.connect(addr).await
        }
    }
}

/// Client-side TLS configuration that accepts any origin certificate.
/// An intercepting proxy re-signs traffic with its own authority, so
/// upstream trust decisions belong to hooks, not the dialer.
fn insecure_client_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    Arc::new(config)
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_config() -> webmitm_config::Config {
        webmitm_config::Config::parse(
            r#"
endpoints:
  - kind: explicit
    listen: "127.0.0.1:0"
timeouts:
  connect: 1
  handshake: 1
  idle: 5
"#,
        )
        .unwrap()
    }

    fn identity(port: u16) -> UpstreamIdentity {
        UpstreamIdentity {
            host: "127.0.0.1".to_string(),
            port,
            version: HttpVersion::V11,
            tls: false,
            upstream_proxy: None,
            bind_endpoint: None,
        }
    }

    #[tokio::test]
    async fn acquire_dials_and_release_pools() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let factory = ConnectionFactory::new(&test_config(), None);
        let identity = identity(port);

        let first = factory.acquire(&identity, false).await.unwrap();
        assert!(!first.reused);
        factory.release(first);

        let second = factory.acquire(&identity, false).await.unwrap();
        assert!(second.reused);
    }

    #[tokio::test]
    async fn identities_do_not_share_pools() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let factory = ConnectionFactory::new(&test_config(), None);
        let plain = identity(port);
        let via_proxy = UpstreamIdentity {
            upstream_proxy: Some("10.0.0.1:3128".to_string()),
            ..plain.clone()
        };

        let conn = factory.acquire(&plain, false).await.unwrap();
        factory.release(conn);

        // A different identity tuple must not see the pooled socket
        assert_ne!(plain, via_proxy);
        assert!(factory.take_pooled(&via_proxy).is_none());
        assert!(factory.take_pooled(&plain).is_some());
    }

    #[tokio::test]
    async fn unreachable_target_is_reported() {
        let factory = ConnectionFactory::new(&test_config(), None);
        // Reserved TEST-NET-1 address, nothing listens there
        let mut identity = identity(9);
        identity.host = "192.0.2.1".to_string();
        let result = factory.acquire(&identity, false).await;
        assert!(matches!(result, Err(ProxyError::UpstreamUnreachable(_))));
    }
}
