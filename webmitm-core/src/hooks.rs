//! User-supplied interception points.
//!
//! Handlers are held in an ordered list and invoked sequentially; the
//! first failure aborts the exchange and reaches the exception reporter.
//! Bodies are streamed by default — a handler that needs one declares
//! interest through `wants_request_body`/`wants_response_body` and finds
//! the materialised (and decoded) bytes on the session when its
//! lifecycle method runs.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::io;
use std::sync::Arc;
use tracing::error;

use crate::ProxyError;
use crate::message::Headers;
use crate::session::{ConnectRequest, Exchange};
use crate::stream::FramedStream;

/// Errors surfaced by user hook code.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Lifecycle observer/mutator for intercepted traffic. All methods
/// default to no-ops so handlers implement only what they watch.
#[async_trait]
pub trait InterceptHandler: Send + Sync {
    /// After a `CONNECT` command and its headers are read, before the
    /// tunnel is accepted.
    async fn tunnel_connect_request(&self, _connect: &mut ConnectRequest) -> Result<(), HookError> {
        Ok(())
    }

    /// After the tunnel is classified (`is_tls` is known), before the
    /// splice-or-decrypt decision is applied.
    async fn tunnel_connect_response(&self, _connect: &mut ConnectRequest) -> Result<(), HookError> {
        Ok(())
    }

    /// Before the request is sent upstream. May mutate headers and the
    /// materialised body, set `cancel`, or override the upstream proxy.
    async fn before_request(&self, _exchange: &mut Exchange) -> Result<(), HookError> {
        Ok(())
    }

    /// Before the response status is written to the client. May mutate
    /// headers and the materialised body, or set `re_request`.
    async fn before_response(&self, _exchange: &mut Exchange) -> Result<(), HookError> {
        Ok(())
    }

    /// Ask for the request body to be read into memory before
    /// `before_request` runs.
    fn wants_request_body(&self, _exchange: &Exchange) -> bool {
        false
    }

    /// Ask for the response body to be read into memory before
    /// `before_response` runs.
    fn wants_response_body(&self, _exchange: &Exchange) -> bool {
        false
    }

    /// Byte observer for client-to-origin payloads, in byte order.
    fn data_sent(&self, _chunk: &[u8]) {}

    /// Byte observer for origin-to-client payloads, in byte order.
    fn data_received(&self, _chunk: &[u8]) {}
}

/// Gate on explicit-proxy requests and CONNECT commands. On denial the
/// implementation writes its own complete challenge response (407) and
/// returns `false`; on acceptance it writes nothing.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, headers: &Headers, client: &mut FramedStream) -> io::Result<bool>;
}

/// Origin `401` handling when Windows auth support is enabled. Returns
/// `true` when it disposed the session.
#[async_trait]
pub trait AuthChallenger: Send + Sync {
    async fn handle_401(&self, exchange: &mut Exchange) -> io::Result<bool>;
}

/// Receives every session-scoped failure before the loop terminates.
pub trait ExceptionReporter: Send + Sync {
    fn report(&self, error: &ProxyError);
}

/// The ordered hook registry one proxy instance runs with.
#[derive(Default)]
pub struct HookSet {
    handlers: Vec<Arc<dyn InterceptHandler>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    challenger: Option<Arc<dyn AuthChallenger>>,
    reporter: Option<Arc<dyn ExceptionReporter>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&mut self, handler: Arc<dyn InterceptHandler>) {
        self.handlers.push(handler);
    }

    pub fn set_authorizer(&mut self, authorizer: Arc<dyn Authorizer>) {
        self.authorizer = Some(authorizer);
    }

    pub fn set_challenger(&mut self, challenger: Arc<dyn AuthChallenger>) {
        self.challenger = Some(challenger);
    }

    pub fn set_reporter(&mut self, reporter: Arc<dyn ExceptionReporter>) {
        self.reporter = Some(reporter);
    }

    pub fn challenger(&self) -> Option<&Arc<dyn AuthChallenger>> {
        self.challenger.as_ref()
    }

    pub async fn tunnel_connect_request(
        &self,
        connect: &mut ConnectRequest,
    ) -> Result<(), ProxyError> {
        for handler in &self.handlers {
            handler
                .tunnel_connect_request(connect)
                .await
                .map_err(|e| ProxyError::Hook(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn tunnel_connect_response(
        &self,
        connect: &mut ConnectRequest,
    ) -> Result<(), ProxyError> {
        for handler in &self.handlers {
            handler
                .tunnel_connect_response(connect)
                .await
                .map_err(|e| ProxyError::Hook(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn before_request(&self, exchange: &mut Exchange) -> Result<(), ProxyError> {
        for handler in &self.handlers {
            handler
                .before_request(exchange)
                .await
                .map_err(|e| ProxyError::Hook(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn before_response(&self, exchange: &mut Exchange) -> Result<(), ProxyError> {
        for handler in &self.handlers {
            handler
                .before_response(exchange)
                .await
                .map_err(|e| ProxyError::Hook(e.to_string()))?;
        }
        Ok(())
    }

    pub fn wants_request_body(&self, exchange: &Exchange) -> bool {
        self.handlers.iter().any(|h| h.wants_request_body(exchange))
    }

    pub fn wants_response_body(&self, exchange: &Exchange) -> bool {
        self.handlers.iter().any(|h| h.wants_response_body(exchange))
    }

    pub fn data_sent(&self, chunk: &[u8]) {
        for handler in &self.handlers {
            handler.data_sent(chunk);
        }
    }

    pub fn data_received(&self, chunk: &[u8]) {
        for handler in &self.handlers {
            handler.data_received(chunk);
        }
    }

    /// Run the authorisation pipeline. Without a configured authorizer
    /// every request is accepted.
    pub async fn authorize(
        &self,
        headers: &Headers,
        client: &mut FramedStream,
    ) -> Result<bool, ProxyError> {
        match &self.authorizer {
            None => Ok(true),
            Some(authorizer) => Ok(authorizer.authorize(headers, client).await?),
        }
    }

    pub fn report(&self, error: &ProxyError) {
        match &self.reporter {
            Some(reporter) => reporter.report(error),
            None => error!(error = %error, "session failed"),
        }
    }
}

/// RFC 7617 Basic proxy authorisation against a fixed credential pair.
pub struct BasicAuthorizer {
    username: String,
    password: String,
    realm: String,
}

impl BasicAuthorizer {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: "webmitm".to_string(),
        }
    }

    fn credentials_match(&self, header: &str) -> bool {
        let Some(encoded) = header.trim().strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = BASE64.decode(encoded.trim()) else {
            return false;
        };
        let Ok(credentials) = String::from_utf8(decoded) else {
            return false;
        };
        match credentials.split_once(':') {
            Some((user, pass)) => user == self.username && pass == self.password,
            None => false,
        }
    }
}

#[async_trait]
impl Authorizer for BasicAuthorizer {
    async fn authorize(&self, headers: &Headers, client: &mut FramedStream) -> io::Result<bool> {
        if headers
            .get("Proxy-Authorization")
            .is_some_and(|value| self.credentials_match(value))
        {
            return Ok(true);
        }
        let challenge = format!(
            "HTTP/1.1 407 Proxy Authentication Required\r\n\
             Proxy-Authenticate: Basic realm=\"{}\"\r\n\
             Content-Length: 0\r\n\
             Connection: close\r\n\r\n",
            self.realm
        );
        client.write_all(challenge.as_bytes()).await?;
        client.flush().await?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn header_with(value: &str) -> Headers {
        let mut headers = Headers::new();
        headers.push("Proxy-Authorization", value);
        headers
    }

    #[tokio::test]
    async fn basic_authorizer_accepts_valid_credentials() {
        let authorizer = BasicAuthorizer::new("user", "secret");
        // "user:secret"
        let headers = header_with("Basic dXNlcjpzZWNyZXQ=");
        let (near, _far) = tokio::io::duplex(1024);
        let mut client = FramedStream::new(Box::new(near), 1024);
        assert!(authorizer.authorize(&headers, &mut client).await.unwrap());
    }

    #[tokio::test]
    async fn basic_authorizer_writes_challenge_on_denial() {
        let authorizer = BasicAuthorizer::new("user", "secret");
        let headers = Headers::new();
        let (near, mut far) = tokio::io::duplex(1024);
        let mut client = FramedStream::new(Box::new(near), 1024);
        assert!(!authorizer.authorize(&headers, &mut client).await.unwrap());

        let mut buf = vec![0u8; 64];
        let n = far.read(&mut buf).await.unwrap();
        let written = String::from_utf8_lossy(&buf[..n]);
        assert!(written.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
    }

    #[tokio::test]
    async fn basic_authorizer_rejects_wrong_password() {
        let authorizer = BasicAuthorizer::new("user", "secret");
        // "user:wrong"
        let headers = header_with("Basic dXNlcjp3cm9uZw==");
        let (near, _far) = tokio::io::duplex(1024);
        let mut client = FramedStream::new(Box::new(near), 1024);
        assert!(!authorizer.authorize(&headers, &mut client).await.unwrap());
    }
}
