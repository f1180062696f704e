use super::rewrite::{self, OriginalUrl};
use super::{mitm, ProxyBody, ProxyError, ProxyState};
use crate::rules::{self, Action};
use crate::transport::UpstreamError;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioIo, TokioTimer};
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error, info};

/// Bounded deadline for reading a request head from the client.
pub(crate) const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Handles a single accepted connection.
pub struct ProxyHandler {
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
}

impl ProxyHandler {
    pub fn new(state: Arc<ProxyState>, client_addr: SocketAddr) -> Self {
        Self { state, client_addr }
    }

    /// Serve HTTP/1.1 on the raw client socket. CONNECT requests upgrade
    /// into MITM tunnels; everything else is forwarded as plain HTTP.
    pub async fn handle(self, stream: TcpStream) -> Result<(), ProxyError> {
        let io = TokioIo::new(stream);

        let state = Arc::clone(&self.state);
        let client_addr = self.client_addr;

        ServerBuilder::new()
            .preserve_header_case(true)
            .timer(TokioTimer::new())
            .header_read_timeout(HEADER_READ_TIMEOUT)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { Self::handle_request(state, client_addr, req).await }
                }),
            )
            .with_upgrades()
            .await
            .map_err(|e| ProxyError::HttpError(e.to_string()))?;

        Ok(())
    }

    async fn handle_request(
        state: Arc<ProxyState>,
        client_addr: SocketAddr,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        if req.method() == Method::CONNECT {
            return mitm::intercept(state, client_addr, req).await;
        }

        debug!("{} {} from {}", req.method(), req.uri(), client_addr);
        Self::handle_http(state, req).await
    }

    /// Plain HTTP forward with the same rule table as the intercepted paths.
    async fn handle_http(
        state: Arc<ProxyState>,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        let uri = req.uri();
        let Some(authority) = uri.authority().map(|a| a.to_string()) else {
            // proxied requests carry absolute URIs; nothing else is routable
            return Ok(rewrite::bad_gateway("request target must be absolute"));
        };
        let origin = OriginalUrl {
            scheme: "http",
            authority,
            path: uri.path().to_string(),
            query: uri.query().map(String::from),
        };

        Ok(process_request(&state, req, origin).await)
    }
}

/// Apply the rule table to one request and produce the client response.
///
/// The store is consulted once up front; the matched rule drives the
/// short-circuit actions, request-header mutation and target rewrite, and is
/// re-checked after the upstream response for `respHeader`.
pub(crate) async fn process_request(
    state: &ProxyState,
    req: Request<Incoming>,
    origin: OriginalUrl,
) -> Response<ProxyBody> {
    let rule = state.rules.match_url(&origin.authority, &origin.path);
    let mut req = req.map(|body| body.boxed());
    let mut target = origin.to_uri();

    if let Some(rule) = &rule {
        match rule.action {
            Action::Status => {
                if let Some(code) = rules::parse_status(&rule.param)
                    .and_then(|c| StatusCode::from_u16(c).ok())
                {
                    info!("status {} {}", code.as_u16(), origin.full());
                    return rewrite::status_response(code);
                }
            }
            Action::MapLocal => {
                info!("map local {} -> {}", origin.full(), rule.param);
                return rewrite::serve_map_local(&rule.param).await;
            }
            Action::ReqHeader => {
                rewrite::apply_header_directive(req.headers_mut(), &rule.param);
            }
            Action::MapRemote => {
                if let Some(uri) = rewrite::build_map_remote_uri(rule, &origin.path) {
                    info!("map remote {} -> {}", origin.full(), uri);
                    target = Some(uri);
                }
            }
            Action::RespHeader => {}
        }
    }

    let Some(target) = target else {
        return rewrite::bad_gateway("invalid request target");
    };

    match forward(state, req, target).await {
        Ok(mut resp) => {
            if let Some(rule) = &rule {
                if rule.action == Action::RespHeader {
                    rewrite::apply_header_directive(resp.headers_mut(), &rule.param);
                }
            }
            rewrite::strip_hop_by_hop(resp.headers_mut());
            resp.map(|body| body.boxed())
        }
        Err(e) => {
            error!("forward {} failed: {}", origin.full(), e);
            rewrite::bad_gateway(&error_chain(&e))
        }
    }
}

async fn forward(
    state: &ProxyState,
    mut req: Request<ProxyBody>,
    target: Uri,
) -> Result<Response<Incoming>, UpstreamError> {
    rewrite::strip_hop_by_hop(req.headers_mut());
    if let Some(authority) = target.authority() {
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            req.headers_mut().insert(HOST, value);
        }
    }
    *req.uri_mut() = target;

    state.upstream.round_trip(req).await
}

/// Flatten an error and its sources into one line for a 502 body.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
