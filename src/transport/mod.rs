use crate::proxy::ProxyBody;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 200;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream round trip failed: {0}")]
    RoundTrip(#[from] hyper_util::client::legacy::Error),
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("invalid connect target: {0}")]
    BadTarget(String),
    #[error("dial {0} timed out")]
    DialTimeout(String),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("proxy CONNECT to {0} failed: {1}")]
    ProxyConnect(String, String),
}

/// Shared, process-wide upstream HTTP client.
///
/// Connection-pooled, HTTP/2 capable via ALPN, and deliberately permissive
/// about upstream certificates: this proxy is the trust anchor for its
/// clients, not for the origins it contacts. Standard `HTTP_PROXY` /
/// `HTTPS_PROXY` / `NO_PROXY` environment variables select an outer proxy.
pub struct Upstream {
    client: Client<UpstreamConnector, ProxyBody>,
}

impl Upstream {
    pub fn from_env() -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_timer(TokioTimer::new())
            .build(UpstreamConnector::from_env());
        Self { client }
    }

    /// Issue a request and return the streaming response.
    pub async fn round_trip(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, UpstreamError> {
        Ok(self.client.request(req).await?)
    }
}

/// Upstream proxy selection derived from the environment.
struct ProxyEnv {
    http: Option<Uri>,
    https: Option<Uri>,
    no_proxy: Vec<String>,
    bypass_all: bool,
}

impl ProxyEnv {
    fn from_env() -> Self {
        let no_proxy_raw = env_first(&["NO_PROXY", "no_proxy"]).unwrap_or_default();
        let (no_proxy, bypass_all) = parse_no_proxy(&no_proxy_raw);
        Self {
            http: env_first(&["HTTP_PROXY", "http_proxy"])
                .as_deref()
                .and_then(normalize_proxy_uri),
            https: env_first(&["HTTPS_PROXY", "https_proxy"])
                .as_deref()
                .and_then(normalize_proxy_uri),
            no_proxy,
            bypass_all,
        }
    }

    fn proxy_for(&self, is_https: bool, host: &str) -> Option<&Uri> {
        if self.bypass_all || self.bypassed(host) {
            return None;
        }
        if is_https {
            self.https.as_ref()
        } else {
            self.http.as_ref()
        }
    }

    fn bypassed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        // loopback traffic never goes through an outer proxy
        if host == "localhost" {
            return true;
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            if ip.is_loopback() {
                return true;
            }
        }
        self.no_proxy
            .iter()
            .any(|entry| host == *entry || host.ends_with(&format!(".{}", entry)))
    }
}

fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn normalize_proxy_uri(value: &str) -> Option<Uri> {
    let candidate = if value.contains("://") {
        value.to_string()
    } else {
        format!("http://{}", value)
    };
    match candidate.parse::<Uri>() {
        Ok(uri) if uri.host().is_some() => Some(uri),
        _ => {
            debug!("ignoring unparseable proxy address {:?}", value);
            None
        }
    }
}

fn proxy_addr(proxy: &Uri) -> Result<(String, u16), ConnectError> {
    let host = proxy
        .host()
        .ok_or_else(|| ConnectError::BadTarget(proxy.to_string()))?
        .to_string();
    let port = proxy
        .port_u16()
        .unwrap_or(if proxy.scheme_str() == Some("https") { 443 } else { 80 });
    Ok((host, port))
}

fn parse_no_proxy(raw: &str) -> (Vec<String>, bool) {
    let mut entries = Vec::new();
    let mut bypass_all = false;
    for part in raw.split(',') {
        let part = part.trim().trim_start_matches('.').to_ascii_lowercase();
        if part.is_empty() {
            continue;
        }
        if part == "*" {
            bypass_all = true;
            continue;
        }
        entries.push(part);
    }
    (entries, bypass_all)
}

/// Connector used by the pooled client: direct TCP, direct TLS, or either
/// through the environment-configured proxy.
#[derive(Clone)]
pub struct UpstreamConnector {
    tls: TlsConnector,
    proxies: Arc<ProxyEnv>,
    dial_timeout: Duration,
}

impl UpstreamConnector {
    fn from_env() -> Self {
        let mut tls_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Self {
            tls: TlsConnector::from(Arc::new(tls_config)),
            proxies: Arc::new(ProxyEnv::from_env()),
            dial_timeout: DIAL_TIMEOUT,
        }
    }

    async fn connect(self, dst: Uri) -> Result<UpstreamStream, ConnectError> {
        let host = dst
            .host()
            .ok_or_else(|| ConnectError::BadTarget(dst.to_string()))?
            .to_string();
        let is_https = dst.scheme_str() == Some("https");
        let port = dst.port_u16().unwrap_or(if is_https { 443 } else { 80 });

        match self.proxies.proxy_for(is_https, &host) {
            Some(proxy) if !is_https => {
                let (proxy_host, proxy_port) = proxy_addr(proxy)?;
                debug!("forwarding http://{} via proxy {}:{}", host, proxy_host, proxy_port);
                let tcp = self.dial(&proxy_host, proxy_port).await?;
                // absolute-form requests ride the proxy connection directly
                Ok(UpstreamStream::plain(tcp, true))
            }
            Some(proxy) => {
                let (proxy_host, proxy_port) = proxy_addr(proxy)?;
                debug!("tunneling https://{} via proxy {}:{}", host, proxy_host, proxy_port);
                let mut tcp = self.dial(&proxy_host, proxy_port).await?;
                proxy_connect(&mut tcp, &host, port).await?;
                self.tls_handshake(tcp, &host).await
            }
            None => {
                let tcp = self.dial(&host, port).await?;
                if is_https {
                    self.tls_handshake(tcp, &host).await
                } else {
                    Ok(UpstreamStream::plain(tcp, false))
                }
            }
        }
    }

    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, ConnectError> {
        let addr = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        match tokio::time::timeout(self.dial_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ConnectError::Io(e)),
            Err(_) => Err(ConnectError::DialTimeout(addr)),
        }
    }

    async fn tls_handshake(
        &self,
        tcp: TcpStream,
        host: &str,
    ) -> Result<UpstreamStream, ConnectError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ConnectError::Tls(e.to_string()))?;
        let tls = tokio::time::timeout(self.dial_timeout, self.tls.connect(server_name, tcp))
            .await
            .map_err(|_| ConnectError::DialTimeout(host.to_string()))?
            .map_err(|e| ConnectError::Tls(e.to_string()))?;

        let h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2".as_ref());
        Ok(UpstreamStream::tls(tls, h2))
    }
}

impl tower_service::Service<Uri> for UpstreamConnector {
    type Response = UpstreamStream;
    type Error = ConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<UpstreamStream, ConnectError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        Box::pin(self.clone().connect(dst))
    }
}

/// Issue a CONNECT request on a fresh proxy connection and wait for the
/// 200 acknowledging the tunnel.
async fn proxy_connect(stream: &mut TcpStream, host: &str, port: u16) -> Result<(), ConnectError> {
    let target = format!("{}:{}", host, port);
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await?;

    let mut response = Vec::with_capacity(256);
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ConnectError::ProxyConnect(
                target,
                "connection closed before response".to_string(),
            ));
        }
        response.extend_from_slice(&buf[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if response.len() > 8192 {
            return Err(ConnectError::ProxyConnect(
                target,
                "oversized response header".to_string(),
            ));
        }
    }

    let head = String::from_utf8_lossy(&response);
    let ok = head.starts_with("HTTP/1.") && head.split_whitespace().nth(1) == Some("200");
    if !ok {
        let line = head.lines().next().unwrap_or("").to_string();
        return Err(ConnectError::ProxyConnect(target, line));
    }
    Ok(())
}

/// Pooled upstream connection, plain TCP or TLS.
pub struct UpstreamStream {
    io: TokioIo<UpstreamIo>,
    proxied: bool,
    h2: bool,
}

impl UpstreamStream {
    fn plain(stream: TcpStream, proxied: bool) -> Self {
        Self {
            io: TokioIo::new(UpstreamIo::Plain(stream)),
            proxied,
            h2: false,
        }
    }

    fn tls(stream: tokio_rustls::client::TlsStream<TcpStream>, h2: bool) -> Self {
        Self {
            io: TokioIo::new(UpstreamIo::Tls(Box::new(stream))),
            proxied: false,
            h2,
        }
    }
}

enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamIo::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamIo::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamIo::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamIo::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl hyper::rt::Read for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl Connection for UpstreamStream {
    fn connected(&self) -> Connected {
        let mut connected = Connected::new();
        if self.proxied {
            connected = connected.proxy(true);
        }
        if self.h2 {
            connected = connected.negotiated_h2();
        }
        connected
    }
}

/// Accepts every upstream certificate. The proxy is its clients' trust
/// anchor; upstream identity is not part of the contract.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
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
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(http: Option<&str>, https: Option<&str>, no_proxy: &str) -> ProxyEnv {
        let (no_proxy, bypass_all) = parse_no_proxy(no_proxy);
        ProxyEnv {
            http: http.and_then(normalize_proxy_uri),
            https: https.and_then(normalize_proxy_uri),
            no_proxy,
            bypass_all,
        }
    }

    #[test]
    fn test_normalize_proxy_uri() {
        let uri = normalize_proxy_uri("proxy.corp:3128").unwrap();
        assert_eq!(uri.host(), Some("proxy.corp"));
        assert_eq!(uri.port_u16(), Some(3128));
        assert!(normalize_proxy_uri("http://proxy.corp:3128").is_some());
        assert!(normalize_proxy_uri("://").is_none());
    }

    #[test]
    fn test_no_proxy_suffix_match() {
        let env = env(Some("proxy:3128"), Some("proxy:3128"), "example.com, .corp.net");
        assert!(env.proxy_for(false, "example.com").is_none());
        assert!(env.proxy_for(false, "api.example.com").is_none());
        assert!(env.proxy_for(true, "internal.corp.net").is_none());
        assert!(env.proxy_for(false, "notexample.com").is_some());
        assert!(env.proxy_for(true, "example.org").is_some());
    }

    #[test]
    fn test_no_proxy_wildcard() {
        let env = env(Some("proxy:3128"), None, "*");
        assert!(env.proxy_for(false, "anything.example").is_none());
    }

    #[test]
    fn test_loopback_is_never_proxied() {
        let env = env(Some("proxy:3128"), Some("proxy:3128"), "");
        assert!(env.proxy_for(false, "127.0.0.1").is_none());
        assert!(env.proxy_for(true, "localhost").is_none());
        assert!(env.proxy_for(true, "::1").is_none());
    }

    #[test]
    fn test_scheme_selects_proxy() {
        let env = env(Some("p1:8080"), None, "");
        assert!(env.proxy_for(false, "example.com").is_some());
        assert!(env.proxy_for(true, "example.com").is_none());
    }
}
