use super::handler::{process_request, HEADER_READ_TIMEOUT};
use super::rewrite::OriginalUrl;
use super::tls::TlsAcceptor;
use super::{empty_body, ProxyBody, ProxyError, ProxyState};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info};

/// CONNECT entry: acknowledge the tunnel, take over the raw client stream,
/// and serve the decrypted side of it.
pub(crate) async fn intercept(
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let host = req.uri().host().unwrap_or("").to_string();
    let port = req.uri().port_u16().unwrap_or(443);

    if host.is_empty() {
        return Ok(Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(empty_body())
            .unwrap());
    }

    info!("CONNECT {}:{} from {}", host, port, client_addr);

    tokio::task::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                if let Err(e) = serve_intercepted(state, io, host.clone(), port).await {
                    debug!("MITM session for {}:{} ended: {}", host, port, e);
                }
            }
            Err(e) => {
                error!("CONNECT upgrade failed: {}", e);
            }
        }
    });

    // the 200 acknowledges the tunnel; hyper then cedes the raw stream
    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .unwrap())
}

/// Terminate TLS with a minted leaf and serve the negotiated protocol.
async fn serve_intercepted<I>(
    state: Arc<ProxyState>,
    io: I,
    host: String,
    port: u16,
) -> Result<(), ProxyError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let leaf = state.ca.leaf_for_host(&host)?;
    let acceptor = TlsAcceptor::from_certified_key(&leaf)?;
    let tls = acceptor.accept(io).await?;

    let negotiated_h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2".as_ref());
    debug!(
        "intercepted {}:{} speaking {}",
        host,
        port,
        if negotiated_h2 { "h2" } else { "http/1.1" }
    );

    let svc_state = Arc::clone(&state);
    let connect_host = host.clone();
    let service = service_fn(move |req| {
        let state = Arc::clone(&svc_state);
        let connect_host = connect_host.clone();
        async move { handle_intercepted(state, req, connect_host, port).await }
    });

    if negotiated_h2 {
        http2::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(tls), service)
            .await
            .map_err(|e| ProxyError::HttpError(e.to_string()))
    } else {
        http1::Builder::new()
            .preserve_header_case(true)
            .timer(TokioTimer::new())
            .header_read_timeout(HEADER_READ_TIMEOUT)
            .serve_connection(TokioIo::new(tls), service)
            .await
            .map_err(|e| ProxyError::HttpError(e.to_string()))
    }
}

/// One decrypted request. The HTTP/2 server may deliver requests without
/// scheme or authority; both are patched from the tunnel target before the
/// shared rule pipeline runs.
async fn handle_intercepted(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    connect_host: String,
    port: u16,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let authority = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .unwrap_or_else(|| {
            if port == 443 {
                connect_host.clone()
            } else {
                format!("{}:{}", connect_host, port)
            }
        });

    let path = match req.uri().path() {
        "" => "/".to_string(),
        p => p.to_string(),
    };
    let query = req.uri().query().map(String::from);

    debug!("HTTPS {} https://{}{}", req.method(), authority, path);

    let origin = OriginalUrl {
        scheme: "https",
        authority,
        path,
        query,
    };
    Ok(process_request(&state, req, origin).await)
}
