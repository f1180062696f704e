use super::{empty_body, full_body, ProxyBody};
use crate::rules::{self, Rule};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode, Uri};
use tracing::debug;

/// The URL a request was originally addressed to, as observed by the proxy.
/// Rule matching runs against `authority` and `path`; the other fields
/// rebuild the default forwarding target.
pub(crate) struct OriginalUrl {
    pub scheme: &'static str,
    pub authority: String,
    pub path: String,
    pub query: Option<String>,
}

impl OriginalUrl {
    pub fn full(&self) -> String {
        match &self.query {
            Some(q) => format!("{}://{}{}?{}", self.scheme, self.authority, self.path, q),
            None => format!("{}://{}{}", self.scheme, self.authority, self.path),
        }
    }

    pub fn to_uri(&self) -> Option<Uri> {
        self.full().parse().ok()
    }
}

/// Compute the forwarding target for a map-remote rule.
///
/// The rule param is the target verbatim unless the rule's path pattern ends
/// in `*`; then the source path with the pattern prefix stripped is appended,
/// with exactly one `/` at the seam.
pub(crate) fn build_map_remote_uri(rule: &Rule, source_path: &str) -> Option<Uri> {
    let mut target = rule.param.clone();
    if let Some(prefix) = rule.path_raw.strip_suffix('*') {
        let suffix = source_path.strip_prefix(prefix).unwrap_or(source_path);
        match (target.ends_with('/'), suffix.starts_with('/')) {
            (true, true) => target.push_str(&suffix[1..]),
            (false, false) => {
                target.push('/');
                target.push_str(suffix);
            }
            _ => target.push_str(suffix),
        }
    }
    target.parse().ok()
}

/// Apply a header directive `op:key=value`. `set` replaces every existing
/// value, `add` appends, `del`/`remove` drop the key entirely; an unknown op
/// is a no-op.
pub(crate) fn apply_header_directive(headers: &mut HeaderMap, param: &str) {
    let (op, key, value) = rules::parse_header_param(param);
    let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
        debug!("ignoring header directive with invalid name {:?}", key);
        return;
    };
    match op.to_ascii_lowercase().as_str() {
        "add" => {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name, value);
            }
        }
        "set" => {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        }
        "del" | "remove" => {
            headers.remove(name);
        }
        _ => {}
    }
}

/// Short-circuit response for a `status://` rule.
pub(crate) fn status_response(code: StatusCode) -> Response<ProxyBody> {
    Response::builder().status(code).body(empty_body()).unwrap()
}

/// Serve a `mapLocal://` param: `@path` streams a local file, anything else
/// is the literal response body.
pub(crate) async fn serve_map_local(param: &str) -> Response<ProxyBody> {
    let Some(path) = param.strip_prefix('@') else {
        return Response::builder()
            .status(StatusCode::OK)
            .body(full_body(param.as_bytes().to_vec()))
            .unwrap();
    };

    match tokio::fs::read(path).await {
        Ok(content) => {
            let mut builder = Response::builder().status(StatusCode::OK);
            if let Some(mime) = mime_guess::from_path(path).first() {
                builder = builder.header(CONTENT_TYPE, mime.as_ref());
            }
            builder.body(full_body(content)).unwrap()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full_body(format!("{}: {}", path, e)))
            .unwrap(),
        Err(e) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(full_body(format!("{}: {}", path, e)))
            .unwrap(),
    }
}

/// 502 reply carrying the upstream error text.
pub(crate) fn bad_gateway(message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(full_body(format!("Proxy Error: {}", message)))
        .unwrap()
}

const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Drop connection-scoped headers before relaying in either direction.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}
