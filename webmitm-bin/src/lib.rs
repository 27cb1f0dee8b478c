use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use webmitm_config::Config;
use webmitm_core::{HookSet, run_proxy};

pub async fn run(config_path: &Path) -> Result<(), Box<dyn Error>> {
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("webmitm_core=debug".parse()?),
        )
        .with_target(false)
        .json()
        .init();

    let config = Config::from_file(config_path)?;

    // Shutdown channel coordinating the proxy and the metrics server
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    let (registry, metrics_handle) = if config.metrics.enabled {
        let registry = Registry::new();
        let metrics_addr: SocketAddr = config.metrics.address.parse()?;
        let metrics_listener = TcpListener::bind(metrics_addr).await?;
        info!("Metrics server listening on {}", metrics_addr);

        let registry_clone = registry.clone();
        let mut shutdown_rx_clone = shutdown_rx.resubscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx_clone.recv() => {
                        info!("Metrics server shutting down");
                        break;
                    }
                    result = metrics_listener.accept() => {
                        if let Ok((stream, _)) = result {
                            let registry = registry_clone.clone();
                            let io = TokioIo::new(stream);

                            tokio::spawn(async move {
                                let service = hyper::service::service_fn(
                                    move |req: Request<hyper::body::Incoming>| {
                                        let registry = registry.clone();
                                        async move { serve_metrics(&registry, &req) }
                                    },
                                );

                                if let Err(err) =
                                    http1::Builder::new().serve_connection(io, service).await
                                {
                                    warn!("Metrics server connection error: {}", err);
                                }
                            });
                        }
                    }
                }
            }
        });

        (Some(registry), Some(handle))
    } else {
        (None, None)
    };

    let proxy_result = run_proxy(config, HookSet::new(), registry, shutdown_rx).await;

    let _ = shutdown_tx.send(());
    if let Some(handle) = metrics_handle {
        info!("Waiting for metrics server to shut down");
        let _ = handle.await;
    }

    proxy_result
}

fn serve_metrics(
    registry: &Registry,
    req: &Request<hyper::body::Incoming>,
) -> Result<Response<Full<bytes::Bytes>>, String> {
    match req.uri().path() {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let mut buffer = vec![];
            encoder
                .encode(&registry.gather(), &mut buffer)
                .map_err(|e| format!("Metrics encoding error: {}", e))?;
            Ok(Response::new(Full::new(bytes::Bytes::from(buffer))))
        }
        "/health" => Ok(Response::new(Full::new(bytes::Bytes::from(
            r#"{"status":"healthy","service":"webmitm"}"#,
        )))),
        _ => Ok(Response::new(Full::new(bytes::Bytes::from(
            r#"{"error":"not_found"}"#,
        )))),
    }
}
