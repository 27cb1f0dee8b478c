//! The keep-alive request loop: one accepted client, many exchanges.
//!
//! Each iteration completes a full request/response pair or exits. At
//! most one outbound connection is held across iterations and reused
//! only while its identity still matches the next request's route. The
//! client stream is owned here for the rest of the accepted lifetime.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::debug;

use crate::ProxyError;
use crate::body::{self, BodyFraming};
use crate::codec;
use crate::handler::ProxyCore;
use crate::message::{
    Headers, HttpVersion, Request, Response, TargetUri, compute_keep_alive, parse_request_line,
    split_authority,
};
use crate::relay;
use crate::session::{ConnectRequest, Exchange};
use crate::stream::FramedStream;
use crate::upstream::{Upstream, UpstreamIdentity};

/// How requests on this client map to origins.
pub(crate) enum LoopMode {
    /// Absolute-URL requests on an explicit endpoint, no tunnel.
    PlainExplicit,
    /// Requests inside a decrypted CONNECT tunnel.
    DecryptedTunnel { host: String, port: u16 },
    /// Origin-directed requests on a transparent endpoint.
    Transparent {
        tls: bool,
        implicit_host: Option<String>,
    },
}

enum Iteration {
    Continue,
    Exit,
    Upgrade(Upstream),
}

enum ResponseOutcome {
    Done,
    ReRequest,
    Disposed,
}

struct SendState {
    /// A response the origin produced before the body was sent (417, or
    /// an early final answer to an expectation).
    early: Option<Response>,
    saw_continue: bool,
}

pub(crate) struct SessionLoop<'a> {
    core: &'a ProxyCore,
    client: FramedStream,
    client_addr: SocketAddr,
    mode: LoopMode,
    connect: Option<Arc<ConnectRequest>>,
    /// First request line when the dispatcher already consumed it.
    pending: Option<(String, String, HttpVersion)>,
    held: Option<Upstream>,
    response_bytes_emitted: bool,
}

impl<'a> SessionLoop<'a> {
    pub(crate) fn new(
        core: &'a ProxyCore,
        client: FramedStream,
        client_addr: SocketAddr,
        mode: LoopMode,
        connect: Option<Arc<ConnectRequest>>,
        pending: Option<(String, String, HttpVersion)>,
    ) -> Self {
        Self {
            core,
            client,
            client_addr,
            mode,
            connect,
            pending,
            held: None,
            response_bytes_emitted: false,
        }
    }

    pub(crate) async fn run(mut self) -> Result<(), ProxyError> {
        let upgraded = loop {
            match self.iteration().await {
                Ok(Iteration::Continue) => {
                    self.response_bytes_emitted = false;
                }
                Ok(Iteration::Exit) => {
                    if let Some(held) = self.held.take() {
                        self.core.factory.release(held);
                    }
                    return Ok(());
                }
                Ok(Iteration::Upgrade(upstream)) => break upstream,
                Err(error) => {
                    // A failed connection is never pooled
                    self.held.take();
                    return Err(error);
                }
            }
        };

        // Opaque pumping after a protocol upgrade; neither side returns
        // to keep-alive afterwards.
        let (client_leftover, client_io) = self.client.into_parts();
        let (server_leftover, server_io) = upgraded.stream.into_parts();
        relay::relay(
            client_io,
            client_leftover,
            server_io,
            server_leftover,
            &self.core.buffers,
            Duration::from_secs(self.core.config.timeouts.idle),
            self.core.hooks.clone(),
            self.core.relay_counters(),
        )
        .await
        .map_err(ProxyError::Io)
    }

    async fn iteration(&mut self) -> Result<Iteration, ProxyError> {
        let (method, raw_target, version) = match self.pending.take() {
            Some(parsed) => parsed,
            None => {
                let line = self.client.read_line().await?;
                if line.is_empty() {
                    return Ok(Iteration::Exit);
                }
                parse_request_line(&line)?
            }
        };
        let headers = Headers::read_block(&mut self.client).await?;
        let target = self.effective_target(&raw_target, &headers)?;
        let request = Request::new(method, raw_target, target, version, headers);
        let mut exchange = Exchange::new(self.client_addr, request);
        exchange.connect = self.connect.clone();

        if matches!(self.mode, LoopMode::PlainExplicit)
            && !self
                .core
                .hooks
                .authorize(&exchange.request.headers, &mut self.client)
                .await?
        {
            debug!(peer = %self.client_addr, "Proxy authorisation denied");
            return Ok(Iteration::Exit);
        }

        // The only decodings this proxy can read back when a hook
        // inspects the body. Upgrade handshakes pass through verbatim.
        if !exchange.request.upgrade_websocket {
            exchange.request.headers.set("Accept-Encoding", "gzip,deflate");
        }
        exchange.request.headers.remove("Proxy-Connection");
        exchange.request.headers.remove("Proxy-Authorization");

        // Pre-buffer the body when it may need replaying after an auth
        // challenge.
        if self.core.config.proxy.enable_windows_auth
            && exchange.request.body.is_none()
            && let Some(framing) = body::request_framing(&exchange.request)
        {
            exchange.request.body = Some(body::read_body(&mut self.client, framing).await?);
        }

        if exchange.request.body.is_none()
            && self.core.hooks.wants_request_body(&exchange)
            && let Some(framing) = body::request_framing(&exchange.request)
        {
            exchange.request.body = Some(body::read_body(&mut self.client, framing).await?);
        }

        self.core.hooks.before_request(&mut exchange).await?;
        exchange.request.refresh_semantics();
        if !exchange.request.upgrade_websocket {
            sanitize_accept_encoding(&mut exchange.request.headers);
        }

        if exchange.request.cancel {
            debug!(peer = %self.client_addr, "Hook cancelled the exchange");
            return Ok(Iteration::Exit);
        }

        let identity = self.identity_for(&exchange.request);
        if let Some(held) = &self.held
            && held.identity != identity
        {
            if let Some(held) = self.held.take() {
                self.core.factory.release(held);
            }
        }
        let mut upstream = match self.held.take() {
            Some(held) => held,
            None => match self.core.factory.acquire(&identity, false).await {
                Ok(upstream) => upstream,
                Err(error) => {
                    self.emit_bad_gateway(exchange.request.version).await;
                    return Err(error);
                }
            },
        };

        if exchange.request.upgrade_websocket {
            self.forward_upgrade_head(&mut exchange, &mut upstream).await?;
            return Ok(Iteration::Upgrade(upstream));
        }

        loop {
            let sent = self.send_request(&mut exchange, &mut upstream).await?;
            match self.handle_response(&mut exchange, &mut upstream, sent).await? {
                ResponseOutcome::Done => break,
                ResponseOutcome::Disposed => return Ok(Iteration::Exit),
                ResponseOutcome::ReRequest => {
                    debug!(peer = %self.client_addr, "Hook requested re-send");
                    exchange.response = None;
                    exchange.request.locked = false;
                }
            }
        }

        let keep_alive = exchange
            .response
            .as_ref()
            .is_some_and(|response| compute_keep_alive(&exchange.request, response));
        self.held = Some(upstream);
        if keep_alive {
            Ok(Iteration::Continue)
        } else {
            Ok(Iteration::Exit)
        }
    }

    /// Write the request head (and body, expectation permitting) to the
    /// origin.
    async fn send_request(
        &mut self,
        exchange: &mut Exchange,
        upstream: &mut Upstream,
    ) -> Result<SendState, ProxyError> {
        // A materialised body is always re-sent identity-framed with a
        // recomputed length; chunked re-send of hook bodies is not
        // supported.
        let payload = match &exchange.request.body {
            Some(body) => {
                let encoded = match exchange.request.headers.get("Content-Encoding") {
                    Some(encoding) => codec::compress(encoding, body).map_err(|error| {
                        ProxyError::Exchange {
                            context: "re-encoding request body",
                            source: Box::new(ProxyError::Io(error)),
                        }
                    })?,
                    None => body.clone(),
                };
                exchange
                    .request
                    .headers
                    .set("Content-Length", encoded.len().to_string());
                exchange.request.headers.remove("Transfer-Encoding");
                exchange.request.content_length = Some(encoded.len() as u64);
                exchange.request.chunked = false;
                Some(encoded)
            }
            None => None,
        };

        let absolute_form = upstream.identity.upstream_proxy.is_some() && !upstream.identity.tls;
        let head = exchange.request.write_head(absolute_form);
        if let Err(error) = upstream.stream.write_all(&head).await {
            if !upstream.reused {
                return Err(ProxyError::Exchange {
                    context: "sending request head",
                    source: Box::new(ProxyError::Io(error)),
                });
            }
            // The pooled socket went stale between exchanges; nothing
            // reached the origin yet, so one fresh dial is safe.
            debug!(identity = %upstream.identity, "Pooled connection stale, redialing");
            let identity = upstream.identity.clone();
            *upstream = self.core.factory.acquire_fresh(&identity).await?;
            upstream
                .stream
                .write_all(&head)
                .await
                .map_err(|error| ProxyError::Exchange {
                    context: "sending request head",
                    source: Box::new(ProxyError::Io(error)),
                })?;
        }
        upstream.stream.flush().await?;
        exchange.request.locked = true;

        let mut state = SendState {
            early: None,
            saw_continue: false,
        };

        if exchange.request.expect_continue && exchange.request.has_body() {
            let interim = Response::read(&mut upstream.stream).await?;
            match interim.status {
                100 => {
                    state.saw_continue = true;
                    if self.core.config.proxy.enable_100_continue {
                        self.client.write_all(&interim.write_head()).await?;
                        self.client.flush().await?;
                        self.response_bytes_emitted = true;
                    }
                }
                _ => {
                    // 417, or the origin skipped the expectation dance
                    // entirely; the body is never sent.
                    let mut interim = interim;
                    interim.expectation_failed = interim.status == 417;
                    state.early = Some(interim);
                    return Ok(state);
                }
            }
        }

        if let Some(payload) = payload {
            self.core.hooks.data_sent(&payload);
            upstream
                .stream
                .write_all(&payload)
                .await
                .map_err(|error| ProxyError::Exchange {
                    context: "sending request body",
                    source: Box::new(ProxyError::Io(error)),
                })?;
        } else if let Some(framing) = body::request_framing(&exchange.request) {
            let hooks = self.core.hooks.clone();
            body::pump(
                &mut self.client,
                upstream.stream.writer(),
                framing,
                &mut |chunk| hooks.data_sent(chunk),
            )
            .await?;
        }
        upstream.stream.flush().await?;
        Ok(state)
    }

    /// Receive the origin's response and stream it to the client.
    async fn handle_response(
        &mut self,
        exchange: &mut Exchange,
        upstream: &mut Upstream,
        sent: SendState,
    ) -> Result<ResponseOutcome, ProxyError> {
        let mut response = match sent.early {
            Some(early) => early,
            None => Response::read(&mut upstream.stream).await?,
        };
        // Unsolicited interim responses are consumed, not forwarded
        while response.status == 100 && !response.expectation_failed {
            response = Response::read(&mut upstream.stream).await?;
        }
        response.continue_received = sent.saw_continue;
        response.re_request = false;

        exchange.response = Some(response);

        if self.core.config.proxy.enable_windows_auth
            && exchange.response.as_ref().is_some_and(|r| r.status == 401)
            && let Some(challenger) = self.core.hooks.challenger()
        {
            let challenger = challenger.clone();
            if challenger
                .handle_401(exchange)
                .await
                .map_err(ProxyError::Io)?
            {
                return Ok(ResponseOutcome::Disposed);
            }
        }

        // Materialise the body for interested hooks, decoding what we
        // asked the origin to send.
        let locked = exchange.response.as_ref().is_some_and(|r| r.locked);
        if !locked
            && self.core.hooks.wants_response_body(&exchange)
            && let Some(response) = exchange.response.as_mut()
            && response.body.is_none()
            && let Some(framing) = body::response_framing(&exchange.request.method, response)
        {
            let raw = body::read_body(&mut upstream.stream, framing).await?;
            let decoded = match response.headers.get("Content-Encoding") {
                Some(encoding) => {
                    codec::decompress(encoding, &raw).map_err(|error| ProxyError::Exchange {
                        context: "decoding response body",
                        source: Box::new(ProxyError::Io(error)),
                    })?
                }
                None => raw,
            };
            response.body = Some(decoded);
        }

        if !locked {
            self.core.hooks.before_response(exchange).await?;
        }

        let Some(response) = exchange.response.as_mut() else {
            return Ok(ResponseOutcome::Done);
        };

        if response.re_request {
            // Drain an unread body so the connection is clean for the
            // re-send.
            if response.body.is_none()
                && let Some(framing) = body::response_framing(&exchange.request.method, response)
                && framing != BodyFraming::UntilClose
            {
                body::read_body(&mut upstream.stream, framing).await?;
            }
            return Ok(ResponseOutcome::ReRequest);
        }
        response.locked = true;

        let keep_alive = compute_keep_alive(&exchange.request, response);
        response.keep_alive = keep_alive;
        response.headers.remove("Proxy-Connection");
        if !keep_alive {
            response.headers.set("Connection", "close");
        }

        let framing = body::response_framing(&exchange.request.method, response);
        let body_sendable = !exchange.request.method.eq_ignore_ascii_case("HEAD")
            && !response.is_bodyless();

        if let Some(body) = &response.body {
            let payload = match response.headers.get("Content-Encoding") {
                Some(encoding) => {
                    codec::compress(encoding, body).map_err(|error| ProxyError::Exchange {
                        context: "re-encoding response body",
                        source: Box::new(ProxyError::Io(error)),
                    })?
                }
                None => body.clone(),
            };
            // Hook-rewritten bodies go out identity-framed
            response.headers.remove("Transfer-Encoding");
            response.chunked = false;
            response.headers.set("Content-Length", payload.len().to_string());
            response.content_length = Some(payload.len() as u64);

            self.write_response_head(&response.write_head()).await?;
            if body_sendable {
                self.core.hooks.data_received(&payload);
                self.client
                    .write_all(&payload)
                    .await
                    .map_err(|error| ProxyError::Exchange {
                        context: "writing response body",
                        source: Box::new(ProxyError::Io(error)),
                    })?;
            }
        } else {
            self.write_response_head(&response.write_head()).await?;
            if let Some(framing) = framing {
                let hooks = self.core.hooks.clone();
                body::pump(
                    &mut upstream.stream,
                    self.client.writer(),
                    framing,
                    &mut |chunk| hooks.data_received(chunk),
                )
                .await
                .map_err(|error| ProxyError::Exchange {
                    context: "streaming response body",
                    source: Box::new(error),
                })?;
            }
        }
        self.client.flush().await?;
        Ok(ResponseOutcome::Done)
    }

    async fn write_response_head(&mut self, head: &[u8]) -> Result<(), ProxyError> {
        self.client
            .write_all(head)
            .await
            .map_err(|error| ProxyError::Exchange {
                context: "writing response head",
                source: Box::new(ProxyError::Io(error)),
            })?;
        self.response_bytes_emitted = true;
        Ok(())
    }

    /// Forward a WebSocket handshake and surface the response to hooks;
    /// the caller switches to opaque relaying.
    async fn forward_upgrade_head(
        &mut self,
        exchange: &mut Exchange,
        upstream: &mut Upstream,
    ) -> Result<(), ProxyError> {
        let head = exchange.request.write_head(false);
        upstream.stream.write_all(&head).await?;
        upstream.stream.flush().await?;
        exchange.request.locked = true;

        let response = Response::read(&mut upstream.stream).await?;
        let locked = response.locked;
        exchange.response = Some(response);
        if !locked {
            self.core.hooks.before_response(exchange).await?;
        }
        if let Some(response) = exchange.response.as_mut() {
            response.locked = true;
            let head = response.write_head();
            self.write_response_head(&head).await?;
            self.client.flush().await?;
        }
        Ok(())
    }

    /// The effective absolute URI this request routes on.
    fn effective_target(
        &self,
        raw_target: &str,
        headers: &Headers,
    ) -> Result<TargetUri, ProxyError> {
        match &self.mode {
            LoopMode::PlainExplicit => {
                if let Some(uri) = TargetUri::parse_absolute(raw_target) {
                    return Ok(uri);
                }
                // Some clients send origin-form to explicit proxies
                if raw_target.starts_with('/')
                    && let Some(host) = headers.get("Host")
                    && let Some((host, port)) = split_authority(host, 80)
                {
                    return Ok(TargetUri {
                        tls: false,
                        host,
                        port,
                        path: raw_target.to_string(),
                    });
                }
                Err(ProxyError::MalformedFraming(
                    "explicit request requires an absolute URL",
                ))
            }
            LoopMode::DecryptedTunnel { host, port } => {
                if let Some(uri) = TargetUri::parse_absolute(raw_target) {
                    return Ok(uri);
                }
                let (host, port) = match headers.get("Host") {
                    Some(authority) => split_authority(authority, *port)
                        .ok_or(ProxyError::MalformedFraming("invalid Host header"))?,
                    None => (host.clone(), *port),
                };
                Ok(TargetUri {
                    tls: true,
                    host,
                    port,
                    path: origin_form(raw_target),
                })
            }
            LoopMode::Transparent { tls, implicit_host } => {
                let default_port = if *tls { 443 } else { 80 };
                let authority = headers
                    .get("Host")
                    .map(str::to_string)
                    .or_else(|| implicit_host.clone())
                    .ok_or(ProxyError::MalformedFraming(
                        "transparent request requires a Host header",
                    ))?;
                let (host, port) = split_authority(&authority, default_port)
                    .ok_or(ProxyError::MalformedFraming("invalid Host header"))?;
                Ok(TargetUri {
                    tls: *tls,
                    host,
                    port,
                    path: origin_form(raw_target),
                })
            }
        }
    }

    fn identity_for(&self, request: &Request) -> UpstreamIdentity {
        let tls = request.target.tls;
        let proxy_settings = &self.core.config.proxy;
        let upstream_proxy = request.upstream_proxy.clone().or_else(|| {
            if tls {
                proxy_settings.upstream_https_proxy.clone()
            } else {
                proxy_settings.upstream_http_proxy.clone()
            }
        });
        let bind_endpoint = proxy_settings
            .upstream_bind_endpoint
            .as_deref()
            .and_then(|endpoint| endpoint.parse().ok());
        UpstreamIdentity {
            host: request.target.host.clone(),
            port: request.target.port,
            version: request.version,
            tls,
            upstream_proxy,
            bind_endpoint,
        }
    }

    /// A synthetic 502, allowed only while the client has seen nothing
    /// of this exchange.
    async fn emit_bad_gateway(&mut self, version: HttpVersion) {
        if self.response_bytes_emitted {
            return;
        }
        let reply = format!(
            "{} 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            version
        );
        let _ = self.client.write_all(reply.as_bytes()).await;
        let _ = self.client.flush().await;
        self.response_bytes_emitted = true;
    }
}

fn origin_form(raw_target: &str) -> String {
    if raw_target.starts_with('/') {
        raw_target.to_string()
    } else {
        format!("/{}", raw_target)
    }
}

/// The origin must only ever see encodings the proxy can decode.
fn sanitize_accept_encoding(headers: &mut Headers) {
    let tokens: Vec<String> = headers
        .get_all("Accept-Encoding")
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| token == "gzip" || token == "deflate")
        .collect();
    let value = if tokens.is_empty() {
        "gzip,deflate".to_string()
    } else {
        tokens.join(",")
    };
    headers.set("Accept-Encoding", value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_encoding_is_clamped_to_supported_tokens() {
        let mut headers = Headers::new();
        headers.push("Accept-Encoding", "br, gzip, zstd");
        sanitize_accept_encoding(&mut headers);
        assert_eq!(headers.get("Accept-Encoding"), Some("gzip"));

        let mut headers = Headers::new();
        headers.push("Accept-Encoding", "br");
        sanitize_accept_encoding(&mut headers);
        assert_eq!(headers.get("Accept-Encoding"), Some("gzip,deflate"));
    }

    #[test]
    fn origin_form_prefixes_slash() {
        assert_eq!(origin_form("/v1"), "/v1");
        assert_eq!(origin_form("v1"), "/v1");
    }
}
