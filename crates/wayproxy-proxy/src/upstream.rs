//! Live fetches to the origin server.

use bytes::Bytes;
use http::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, HOST};
use http::{HeaderMap, Method};

use wayproxy_core::UpstreamConfig;

use crate::error::{ProxyError, Result};
use crate::inject::strip_hop_by_hop;

/// HTTP client used for recording and `proxy-fetch`.
///
/// Redirects are returned to the client rather than followed, so the archive
/// holds exactly what the origin sent. Environment proxy settings are ignored.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    /// Builds a client from the upstream settings.
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ProxyError::Upstream(format!("Failed to build client: {}", e)))?;

        Ok(Self { client })
    }

    /// Sends a request upstream and returns once the response head arrives.
    ///
    /// Any status is a successful fetch; only transport failures are errors.
    pub async fn fetch(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let headers = forwardable_headers(headers);

        tracing::debug!("Fetching {} {}", method, url);

        self.client
            .request(method.clone(), url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(format!("{} {}: {}", method, url, e)))
    }
}

/// Request headers that are forwarded to the origin.
///
/// Compression is refused so archived HTML can be rewritten on replay.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = strip_hop_by_hop(headers);
    out.remove(HOST);
    out.remove(CONTENT_LENGTH);
    out.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONNECTION, USER_AGENT};

    #[test]
    fn forwardable_headers_drop_connection_fields() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "example.com".parse().unwrap());
        headers.insert(CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(ACCEPT_ENCODING, "gzip, br".parse().unwrap());
        headers.insert(USER_AGENT, "test-agent".parse().unwrap());
        headers.insert("proxy-connection", "keep-alive".parse().unwrap());

        let out = forwardable_headers(&headers);
        assert!(out.get(HOST).is_none());
        assert!(out.get(CONNECTION).is_none());
        assert!(out.get("proxy-connection").is_none());
        assert_eq!(out.get(ACCEPT_ENCODING).unwrap(), "identity");
        assert_eq!(out.get(USER_AGENT).unwrap(), "test-agent");
    }

    #[test]
    fn client_builds_from_defaults() {
        assert!(UpstreamClient::new(&UpstreamConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn unreachable_origin_is_upstream_error() {
        let client = UpstreamClient::new(&UpstreamConfig::default()).unwrap();
        // bind then release a port so nothing is listening on it
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = client
            .fetch(
                &Method::GET,
                &format!("http://127.0.0.1:{}/", port),
                &HeaderMap::new(),
                Bytes::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Upstream(_)));
        assert_eq!(err.status(), http::StatusCode::BAD_GATEWAY);
    }
}
