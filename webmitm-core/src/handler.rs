//! Per-connection entry point and shared collaborators.

use prometheus::{IntCounter, Registry};
use regex::Regex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};
use webmitm_config::{Config, EndpointConfig};

use crate::ProxyError;
use crate::body::BufferPool;
use crate::certs::CertificateStore;
use crate::hooks::HookSet;
use crate::metrics::ProxyMetrics;
use crate::session::{Endpoint, ExplicitEndpoint, TransparentEndpoint};
use crate::stream::{Duplex, FramedStream};
use crate::transparent;
use crate::tunnel;
use crate::upstream::ConnectionFactory;

/// Everything a client task needs: configuration, hooks, the certificate
/// store, the connection factory, relay buffers, and metrics. One
/// instance serves every listener.
pub struct ProxyCore {
    pub config: Arc<Config>,
    pub hooks: Arc<HookSet>,
    pub certs: Arc<CertificateStore>,
    pub factory: Arc<ConnectionFactory>,
    pub buffers: Arc<BufferPool>,
    pub metrics: Option<Arc<ProxyMetrics>>,
}

impl ProxyCore {
    pub fn new(
        config: Arc<Config>,
        hooks: Arc<HookSet>,
        registry: Option<&Registry>,
    ) -> Result<Self, ProxyError> {
        let certs = CertificateStore::new(&config.proxy.supported_tls_protocols)
            .map_err(|error| ProxyError::TlsHandshakeFailed(io::Error::other(error.to_string())))?;
        let factory = Arc::new(ConnectionFactory::new(&config, registry));
        let buffers = Arc::new(BufferPool::new(config.proxy.buffer_size));
        let metrics = registry.map(|registry| Arc::new(ProxyMetrics::new(registry)));
        Ok(Self {
            config,
            hooks,
            certs: Arc::new(certs),
            factory,
            buffers,
            metrics,
        })
    }

    /// Compile an endpoint descriptor: regex filters and any
    /// operator-supplied certificate material.
    pub fn build_endpoint(
        &self,
        config: &EndpointConfig,
    ) -> Result<Endpoint, Box<dyn std::error::Error>> {
        match config {
            EndpointConfig::Explicit {
                decrypt,
                include_regex,
                exclude_regex,
                generic_certificate,
                generic_certificate_key,
                ..
            } => {
                let include = include_regex.as_deref().map(Regex::new).transpose()?;
                let exclude = exclude_regex.as_deref().map(Regex::new).transpose()?;
                let generic_certificate = match (generic_certificate, generic_certificate_key) {
                    (Some(cert_path), Some(key_path)) => {
                        let cert_pem = std::fs::read_to_string(cert_path)?;
                        let key_pem = std::fs::read_to_string(key_path)?;
                        Some(self.certs.from_pem(&cert_pem, &key_pem)?)
                    }
                    _ => None,
                };
                Ok(Endpoint::Explicit(ExplicitEndpoint {
                    include,
                    exclude,
                    decrypt_default: *decrypt,
                    generic_certificate,
                }))
            }
            EndpointConfig::Transparent {
                tls,
                generic_certificate_name,
                ..
            } => Ok(Endpoint::Transparent(TransparentEndpoint {
                tls: *tls,
                default_sni: generic_certificate_name.clone(),
            })),
        }
    }

    /// Drive one accepted client to completion, with instrumentation.
    pub async fn handle_client<S: Duplex + 'static>(
        &self,
        stream: S,
        client_addr: SocketAddr,
        endpoint: Arc<Endpoint>,
    ) {
        let peer = client_addr.to_string();
        let start = std::time::Instant::now();

        if let Some(metrics) = &self.metrics {
            metrics.connections_active.inc();
        }
        info!(peer, endpoint = endpoint.kind(), "New connection");

        let result = self.process(stream, client_addr, &endpoint).await;
        let duration = start.elapsed().as_secs_f64();

        if let Some(metrics) = &self.metrics {
            metrics.connections_active.dec();
            let status = if result.is_ok() { "success" } else { "failure" };
            metrics
                .connections_total
                .with_label_values(&[endpoint.kind(), status])
                .inc();
        }

        match result {
            Ok(()) => info!(peer, duration_secs = %duration, "Connection completed"),
            // The client going away is not an incident
            Err(ProxyError::ClientAborted) => {
                debug!(peer, duration_secs = %duration, "Client closed mid-exchange");
            }
            Err(error) => {
                self.hooks.report(&error);
                if error.is_client_fault() {
                    debug!(peer, error = %error, duration_secs = %duration, "Client request rejected");
                } else {
                    error!(peer, error = %error, duration_secs = %duration, "Connection error");
                }
                if let Some(metrics) = &self.metrics {
                    metrics
                        .errors_total
                        .with_label_values(&[error.kind_label()])
                        .inc();
                }
            }
        }
    }

    async fn process<S: Duplex + 'static>(
        &self,
        stream: S,
        client_addr: SocketAddr,
        endpoint: &Endpoint,
    ) -> Result<(), ProxyError> {
        let framed = FramedStream::new(Box::new(stream), self.config.proxy.buffer_size);
        match endpoint {
            Endpoint::Explicit(explicit) => {
                tunnel::handle_explicit(self, explicit, framed, client_addr).await
            }
            Endpoint::Transparent(transparent) => {
                transparent::handle_transparent(self, transparent, framed, client_addr).await
            }
        }
    }

    pub(crate) fn relay_counters(&self) -> Option<(IntCounter, IntCounter)> {
        self.metrics.as_ref().map(|metrics| {
            (
                metrics.bytes_transferred.with_label_values(&["tx"]),
                metrics.bytes_transferred.with_label_values(&["rx"]),
            )
        })
    }

    pub(crate) fn count_tunnel(&self, mode: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.tunnels_total.with_label_values(&[mode]).inc();
        }
    }
}
