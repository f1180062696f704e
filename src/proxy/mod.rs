mod handler;
mod mitm;
mod rewrite;
mod tls;

pub use handler::ProxyHandler;

use crate::cert::CertificateAuthority;
use crate::config::Config;
use crate::rules::RuleStore;
use crate::transport::Upstream;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Body type flowing between client and upstream; everything is boxed so
/// literal, file and streamed upstream bodies share one response type.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub(crate) fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|e| match e {}).boxed()
}

pub(crate) fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    TlsError(String),
    #[error("Certificate error: {0}")]
    CertError(#[from] crate::cert::CertError),
    #[error("Rule error: {0}")]
    RuleError(#[from] crate::rules::RuleError),
    #[error("HTTP error: {0}")]
    HttpError(String),
}

/// Shared proxy state: one trust anchor, one rule store, one pooled
/// upstream client for the whole process.
pub struct ProxyState {
    pub config: Config,
    pub ca: Arc<CertificateAuthority>,
    pub rules: Arc<RuleStore>,
    pub upstream: Upstream,
}

impl ProxyState {
    pub fn new(config: Config, ca: CertificateAuthority) -> Result<Self, ProxyError> {
        let rules = RuleStore::new(&config.rules.file, &config.rules.legacy_file)?;
        Ok(Self {
            config,
            ca: Arc::new(ca),
            rules,
            upstream: Upstream::from_env(),
        })
    }
}

/// HTTP/HTTPS intercepting proxy server
pub struct ProxyServer {
    state: Arc<ProxyState>,
}

impl ProxyServer {
    pub fn new(config: Config, ca: CertificateAuthority) -> Result<Self, ProxyError> {
        let state = Arc::new(ProxyState::new(config, ca)?);
        if let Err(e) = state.rules.watch() {
            warn!("rule file watcher unavailable: {}", e);
        }
        Ok(Self { state })
    }

    pub fn state(&self) -> Arc<ProxyState> {
        Arc::clone(&self.state)
    }

    /// Accept connections until the token is cancelled.
    pub async fn run(&self, cancel_token: CancellationToken) -> Result<(), ProxyError> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.state.config.proxy.host, self.state.config.proxy.port
        )
        .parse()
        .map_err(|e| {
            ProxyError::IoError(std::io::Error::other(format!("Invalid address: {}", e)))
        })?;

        let listener = TcpListener::bind(addr).await?;
        info!("Proxy server listening on {}", addr);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Proxy server shutting down...");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let state = Arc::clone(&self.state);
                            let token = cancel_token.clone();
                            tokio::spawn(async move {
                                let handler = ProxyHandler::new(state, client_addr);
                                tokio::select! {
                                    _ = token.cancelled() => {}
                                    result = handler.handle(stream) => {
                                        if let Err(e) = result {
                                            error!("Error handling connection from {}: {}", client_addr, e);
                                        }
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        info!("Proxy server stopped");
        Ok(())
    }
}
