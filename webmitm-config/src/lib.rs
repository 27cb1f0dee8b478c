use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// webmitm configuration loaded from YAML.
///
/// Defines the listening endpoints (explicit proxy ports and transparent
/// interception ports), global proxy behaviour, timeout settings, metrics
/// configuration, and upstream routing defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listening endpoints. At least one is required.
    pub endpoints: Vec<EndpointConfig>,
    /// Behaviour knobs shared by all endpoints
    #[serde(default)]
    pub proxy: ProxySettings,
    /// Timeout configuration for various operations
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Prometheus metrics configuration
    #[serde(default)]
    pub metrics: Metrics,
    /// Upstream connection pooling configuration (optional)
    #[serde(default)]
    pub connection_pool: Option<ConnectionPool>,
}

/// One listening endpoint.
///
/// `explicit` endpoints receive `CONNECT` tunnels and absolute-URL plain
/// requests from clients configured to use the proxy. `transparent`
/// endpoints receive origin-directed traffic (via NAT/iptables) and
/// terminate TLS immediately based on SNI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EndpointConfig {
    Explicit {
        /// Address to listen on (e.g., "0.0.0.0:8080")
        listen: String,
        /// Decrypt TLS tunnels by default (default: true)
        #[serde(default = "default_true")]
        decrypt: bool,
        /// Only hosts matching this regex are decrypted. When set it
        /// overrides the exclude decision.
        #[serde(default)]
        include_regex: Option<String>,
        /// Hosts matching this regex are tunneled without decryption
        #[serde(default)]
        exclude_regex: Option<String>,
        /// PEM certificate chain used in place of minting (optional)
        #[serde(default)]
        generic_certificate: Option<String>,
        /// PEM private key for `generic_certificate`
        #[serde(default)]
        generic_certificate_key: Option<String>,
    },
    Transparent {
        /// Address to listen on (e.g., "0.0.0.0:8443")
        listen: String,
        /// Terminate TLS on this endpoint (default: true)
        #[serde(default = "default_true")]
        tls: bool,
        /// Fallback certificate name when the client sends no SNI
        #[serde(default)]
        generic_certificate_name: Option<String>,
    },
}

impl EndpointConfig {
    /// The listen address regardless of endpoint kind.
    pub fn listen(&self) -> &str {
        match self {
            EndpointConfig::Explicit { listen, .. } => listen,
            EndpointConfig::Transparent { listen, .. } => listen,
        }
    }
}

/// Behaviour knobs shared by all endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Framed stream buffer capacity and relay chunk size in bytes
    /// (default: 8192)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Enable 401 challenge handling and request body pre-buffering for
    /// authenticated upstreams (default: false)
    #[serde(default)]
    pub enable_windows_auth: bool,
    /// Forward `100 Continue` / `417 Expectation Failed` interim
    /// responses to the client (default: true)
    #[serde(default = "default_true")]
    pub enable_100_continue: bool,
    /// TLS versions offered when acting as server on intercepted tunnels.
    /// Recognised values: "1.2", "1.3" (default: both)
    #[serde(default = "default_tls_protocols")]
    pub supported_tls_protocols: Vec<String>,
    /// Upstream proxy for plain HTTP requests, as "host:port" (optional)
    #[serde(default)]
    pub upstream_http_proxy: Option<String>,
    /// Upstream proxy for HTTPS tunnels, as "host:port" (optional)
    #[serde(default)]
    pub upstream_https_proxy: Option<String>,
    /// Local address outbound sockets bind to (optional)
    #[serde(default)]
    pub upstream_bind_endpoint: Option<String>,
}

fn default_buffer_size() -> usize {
    8192
}

fn default_true() -> bool {
    true
}

fn default_tls_protocols() -> Vec<String> {
    vec!["1.2".to_string(), "1.3".to_string()]
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            enable_windows_auth: false,
            enable_100_continue: true,
            supported_tls_protocols: default_tls_protocols(),
            upstream_http_proxy: None,
            upstream_https_proxy: None,
            upstream_bind_endpoint: None,
        }
    }
}

/// Timeout settings for proxy operations (all values in seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Maximum time to establish an upstream connection (default: 10s)
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
    /// Maximum time to receive a TLS ClientHello or request headers
    /// (default: 10s)
    #[serde(default = "default_handshake_timeout")]
    pub handshake: u64,
    /// Maximum idle time for spliced tunnels (default: 300s)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    300
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            handshake: default_handshake_timeout(),
            idle: default_idle_timeout_secs(),
        }
    }
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to enable metrics collection
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (e.g., "127.0.0.1:9000")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

fn default_metrics_address() -> String {
    "127.0.0.1:9000".to_string()
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

/// Upstream connection pooling configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConnectionPool {
    /// Enable connection pooling (default: true)
    #[serde(default = "default_pool_enabled")]
    pub enabled: bool,
    /// Maximum pooled connections per upstream identity (default: 100)
    #[serde(default = "default_max_per_host")]
    pub max_per_host: usize,
    /// Connection TTL in seconds (default: 60)
    #[serde(default = "default_connection_ttl")]
    pub connection_ttl: u64,
    /// Idle timeout in seconds (default: 30)
    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout: u64,
}

fn default_pool_enabled() -> bool {
    true
}

fn default_max_per_host() -> usize {
    100
}

fn default_connection_ttl() -> u64 {
    60
}

fn default_pool_idle_timeout() -> u64 {
    30
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self {
            enabled: default_pool_enabled(),
            max_per_host: default_max_per_host(),
            connection_ttl: default_connection_ttl(),
            idle_timeout: default_pool_idle_timeout(),
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use webmitm_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml_ng::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Examples
    ///
    /// ```
    /// use webmitm_config::Config;
    ///
    /// let yaml = r#"
    /// endpoints:
    ///   - kind: explicit
    ///     listen: "0.0.0.0:8080"
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.endpoints[0].listen(), "0.0.0.0:8080");
    /// ```
    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Config = serde_yaml_ng::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.endpoints.is_empty() {
            return Err("at least one endpoint is required".into());
        }
        if self.proxy.buffer_size < 1024 {
            return Err("buffer_size must be at least 1024 bytes".into());
        }
        for proto in &self.proxy.supported_tls_protocols {
            if proto != "1.2" && proto != "1.3" {
                return Err(format!("unsupported TLS protocol version: {}", proto).into());
            }
        }
        for endpoint in &self.endpoints {
            if let EndpointConfig::Explicit {
                generic_certificate,
                generic_certificate_key,
                ..
            } = endpoint
                && generic_certificate.is_some() != generic_certificate_key.is_some()
            {
                return Err(
                    "generic_certificate and generic_certificate_key must be set together".into(),
                );
            }
        }
        Ok(())
    }
}
