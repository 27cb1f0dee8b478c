//! Prometheus instrumentation for the proxy core.

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

/// Counters and gauges the connection handler updates. Constructed only
/// when a registry is supplied; a `None` handle disables metrics.
pub struct ProxyMetrics {
    pub connections_active: IntGauge,
    pub connections_total: IntCounterVec,
    pub tunnels_total: IntCounterVec,
    pub bytes_transferred: IntCounterVec,
    pub errors_total: IntCounterVec,
}

impl ProxyMetrics {
    pub fn new(registry: &Registry) -> Self {
        let connections_active = IntGauge::new(
            "webmitm_connections_active",
            "Number of currently active client connections",
        )
        .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();

        let connections_total = IntCounterVec::new(
            Opts::new(
                "webmitm_connections_total",
                "Total number of client connections handled",
            ),
            &["endpoint", "status"],
        )
        .unwrap();
        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();

        let tunnels_total = IntCounterVec::new(
            Opts::new(
                "webmitm_tunnels_total",
                "CONNECT tunnels by handling mode (decrypt or splice)",
            ),
            &["mode"],
        )
        .unwrap();
        registry.register(Box::new(tunnels_total.clone())).unwrap();

        let bytes_transferred = IntCounterVec::new(
            Opts::new(
                "webmitm_bytes_transferred_total",
                "Total relayed bytes per direction",
            ),
            &["direction"],
        )
        .unwrap();
        registry
            .register(Box::new(bytes_transferred.clone()))
            .unwrap();

        let errors_total = IntCounterVec::new(
            Opts::new("webmitm_errors_total", "Total number of errors by kind"),
            &["kind"],
        )
        .unwrap();
        registry.register(Box::new(errors_total.clone())).unwrap();

        Self {
            connections_active,
            connections_total,
            tunnels_total,
            bytes_transferred,
            errors_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    #[test]
    fn registers_all_collectors() {
        let registry = Registry::new();
        let metrics = ProxyMetrics::new(&registry);
        metrics.connections_active.inc();
        metrics
            .connections_total
            .with_label_values(&["explicit", "success"])
            .inc();
        metrics.tunnels_total.with_label_values(&["splice"]).inc();

        let mut rendered = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut rendered)
            .unwrap();
        let rendered = String::from_utf8(rendered).unwrap();
        assert!(rendered.contains("webmitm_connections_active 1"));
        assert!(rendered.contains("webmitm_tunnels_total"));
    }
}
