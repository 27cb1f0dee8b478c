//! Per-exchange state and endpoint descriptors.

use regex::Regex;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::message::{Headers, HttpVersion, Request, Response};
use crate::tlspeek::{ClientHelloInfo, ServerHelloInfo};

/// Immutable per-listener configuration, compiled from the config crate.
pub enum Endpoint {
    Explicit(ExplicitEndpoint),
    Transparent(TransparentEndpoint),
}

impl Endpoint {
    pub fn kind(&self) -> &'static str {
        match self {
            Endpoint::Explicit(_) => "explicit",
            Endpoint::Transparent(_) => "transparent",
        }
    }
}

pub struct ExplicitEndpoint {
    /// Only matching hosts are decrypted; when configured this overrides
    /// the exclude decision.
    pub include: Option<Regex>,
    /// Matching hosts are spliced without decryption.
    pub exclude: Option<Regex>,
    /// Decrypt tunnels whose host no filter claims.
    pub decrypt_default: bool,
    /// Pre-loaded certificate used in place of minting.
    pub generic_certificate: Option<Arc<ServerConfig>>,
}

impl ExplicitEndpoint {
    /// The splice-or-decrypt decision for a tunnel host. The exclude
    /// regex is evaluated first; a configured include list then
    /// re-decides on its own match alone.
    pub fn is_excluded(&self, host: &str) -> bool {
        let mut excluded = !self.decrypt_default;
        if let Some(exclude) = &self.exclude
            && exclude.is_match(host)
        {
            excluded = true;
        }
        if let Some(include) = &self.include {
            excluded = !include.is_match(host);
        }
        excluded
    }
}

pub struct TransparentEndpoint {
    pub tls: bool,
    /// Certificate name used when the client sends no SNI.
    pub default_sni: Option<String>,
}

/// A `CONNECT` command with what the tunnel peeks revealed. Tunnel hooks
/// receive it mutably (and may force `excluded`); the session loop keeps
/// a frozen shared view.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub version: HttpVersion,
    pub headers: Headers,
    /// Decided by endpoint filters, overridable by tunnel hooks.
    pub excluded: bool,
    pub is_tls: bool,
    pub client_hello: Option<ClientHelloInfo>,
    /// Present only when decryption was bypassed and the raw handshake
    /// was forwarded.
    pub server_hello: Option<ServerHelloInfo>,
}

impl ConnectRequest {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One request/response pair in flight. Hooks receive this mutably;
/// the session owns it for exactly one loop iteration.
pub struct Exchange {
    pub client_addr: SocketAddr,
    pub request: Request,
    pub response: Option<Response>,
    /// The tunnel this exchange runs inside, when decrypted.
    pub connect: Option<Arc<ConnectRequest>>,
}

impl Exchange {
    pub fn new(client_addr: SocketAddr, request: Request) -> Self {
        Self {
            client_addr,
            request,
            response: None,
            connect: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(
        include: Option<&str>,
        exclude: Option<&str>,
        decrypt_default: bool,
    ) -> ExplicitEndpoint {
        ExplicitEndpoint {
            include: include.map(|p| Regex::new(p).unwrap()),
            exclude: exclude.map(|p| Regex::new(p).unwrap()),
            decrypt_default,
            generic_certificate: None,
        }
    }

    #[test]
    fn exclude_regex_marks_host_excluded() {
        let endpoint = endpoint(None, Some(r"^secure\.bank$"), true);
        assert!(endpoint.is_excluded("secure.bank"));
        assert!(!endpoint.is_excluded("api.test"));
    }

    #[test]
    fn include_overrides_exclude_decision() {
        let endpoint = endpoint(Some(r"\.corp\.test$"), Some(r"^api\.corp\.test$"), true);
        // Excluded by the exclude regex, re-included by the include list
        assert!(!endpoint.is_excluded("api.corp.test"));
        // Not matched by include at all
        assert!(endpoint.is_excluded("other.example"));
    }

    #[test]
    fn decrypt_default_off_excludes_unclaimed_hosts() {
        let passive = endpoint(None, None, false);
        assert!(passive.is_excluded("anything.test"));
        let with_include = endpoint(Some(r"^pick\.me$"), None, false);
        assert!(!with_include.is_excluded("pick.me"));
    }
}
