//! Helper endpoints on the reserved pseudo-host.
//!
//! Pages served through the proxy reach these over their own scheme
//! (`//pywb.proxy/...`), so every response carries CORS headers:
//!
//! - `/proxy-fetch/<absolute-url>` fetches a URL live, bypassing the archive
//! - `/proxy-worker` serves the preservation worker script
//! - `/static/<asset>` serves the scripts the head insert references
//!
//! `OPTIONS` on any path is a successful preflight. Failed fetches are
//! answered here too, so the error still carries CORS headers.

use bytes::Bytes;
use http::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
    CONTENT_LENGTH, CONTENT_TYPE, ORIGIN, VARY,
};
use http::{HeaderMap, Method, Request, Response, StatusCode};

use crate::error::{ProxyError, Result};
use crate::inject::{
    strip_hop_by_hop, CorsPolicy, BANNER_SCRIPT, BANNER_STYLESHEET, PROXY_MODE_SCRIPT,
};
use crate::upstream::UpstreamClient;

const PROXY_FETCH_PREFIX: &str = "/proxy-fetch/";
const PROXY_WORKER_PATH: &str = "/proxy-worker";
const STATIC_PREFIX: &str = "/static/";

const JAVASCRIPT: &str = "application/javascript";

/// Preservation worker script.
pub const PROXY_WORKER_JS: &str = include_str!("../assets/proxy-worker.js");

const PROXY_MODE_JS: &str = include_str!("../assets/wombatProxyMode.js");
const BANNER_JS: &str = include_str!("../assets/default_banner.js");
const BANNER_CSS: &str = include_str!("../assets/default_banner.css");

/// Which helper a request addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperRoute {
    /// CORS preflight.
    Preflight,
    /// Live fetch of the contained URL.
    ProxyFetch(String),
    /// The worker script.
    ProxyWorker,
    /// A static asset.
    Static(String),
    /// Nothing here.
    Unknown,
}

impl HelperRoute {
    /// Classifies a request to the reserved host.
    pub fn classify(method: &Method, path_and_query: &str) -> Self {
        if method == Method::OPTIONS {
            return Self::Preflight;
        }

        if let Some(target) = path_and_query.strip_prefix(PROXY_FETCH_PREFIX) {
            return if target.is_empty() {
                Self::Unknown
            } else {
                Self::ProxyFetch(target.to_string())
            };
        }

        let path = path_and_query.split('?').next().unwrap_or(path_and_query);
        if path == PROXY_WORKER_PATH {
            return Self::ProxyWorker;
        }

        match path.strip_prefix(STATIC_PREFIX) {
            Some(name) if !name.is_empty() => Self::Static(name.to_string()),
            _ => Self::Unknown,
        }
    }
}

/// Serves the reserved host.
#[derive(Debug, Clone)]
pub struct HelperEndpoints {
    upstream: UpstreamClient,
}

impl HelperEndpoints {
    /// Creates the helper endpoints.
    pub fn new(upstream: UpstreamClient) -> Self {
        Self { upstream }
    }

    /// Handles one request to the reserved host.
    pub async fn handle(&self, req: &Request<Bytes>) -> Response<Bytes> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let origin = req.headers().get(ORIGIN).cloned();

        let mut response = match HelperRoute::classify(req.method(), path_and_query) {
            HelperRoute::Preflight => preflight(),
            HelperRoute::ProxyFetch(target) => match self.proxy_fetch(req, &target).await {
                Ok(response) => response,
                Err(e) => {
                    if e.status().is_server_error() {
                        tracing::warn!("proxy-fetch {} failed: {}", target, e);
                    } else {
                        tracing::debug!("proxy-fetch {} rejected: {}", target, e);
                    }
                    e.to_response()
                }
            },
            HelperRoute::ProxyWorker => asset_response(JAVASCRIPT, PROXY_WORKER_JS),
            HelperRoute::Static(name) => match static_asset(&name) {
                Some((content_type, body)) => asset_response(content_type, body),
                None => not_found(),
            },
            HelperRoute::Unknown => not_found(),
        };

        apply_cors(
            response.headers_mut(),
            CorsPolicy::ReflectOrigin,
            origin.as_ref(),
        );
        response
    }

    async fn proxy_fetch(&self, req: &Request<Bytes>, target: &str) -> Result<Response<Bytes>> {
        if !(target.starts_with("http://") || target.starts_with("https://")) {
            return Err(ProxyError::BadRequest(format!(
                "proxy-fetch needs an absolute URL, got {:?}",
                target
            )));
        }

        let mut headers = req.headers().clone();
        headers.remove(ORIGIN);

        let upstream = self
            .upstream
            .fetch(req.method(), target, &headers, req.body().clone())
            .await?;
        let status = upstream.status();
        let mut out = strip_hop_by_hop(upstream.headers());
        let body = upstream
            .bytes()
            .await
            .map_err(|e| ProxyError::Upstream(format!("{}: {}", target, e)))?;

        // origin CORS headers are replaced by ours
        out.remove(ACCESS_CONTROL_ALLOW_ORIGIN);
        out.remove(ACCESS_CONTROL_ALLOW_CREDENTIALS);
        out.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

        tracing::debug!("proxy-fetch {} -> {}", target, status);

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = out;
        Ok(response)
    }
}

/// Adds CORS headers according to `policy`.
///
/// With `ReflectOrigin` the request `Origin` is echoed (credentials allowed),
/// or `*` when the request carried none.
pub fn apply_cors(headers: &mut HeaderMap, policy: CorsPolicy, origin: Option<&HeaderValue>) {
    if policy == CorsPolicy::None {
        return;
    }

    match origin {
        Some(origin) => {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
            headers.insert(
                ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
            headers.append(VARY, HeaderValue::from_static("Origin"));
        }
        None => {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        }
    }
}

fn static_asset(name: &str) -> Option<(&'static str, &'static str)> {
    match name {
        PROXY_MODE_SCRIPT => Some((JAVASCRIPT, PROXY_MODE_JS)),
        BANNER_SCRIPT => Some((JAVASCRIPT, BANNER_JS)),
        BANNER_STYLESHEET => Some(("text/css", BANNER_CSS)),
        _ => None,
    }
}

fn preflight() -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    let headers = response.headers_mut();
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, OPTIONS, DELETE, PATCH, HEAD, TRACE, CONNECT"),
    );
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("1800"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(0));
    response
}

fn asset_response(content_type: &'static str, body: &'static str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from_static(body.as_bytes()));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    response
}

fn not_found() -> Response<Bytes> {
    let body = Bytes::from_static(b"Not Found");
    let mut response = Response::new(body.clone());
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    response
}
