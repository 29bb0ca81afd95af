//! Shared setup for the end-to-end tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Request;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::{TimeZone, Utc};
use http::{HeaderMap, StatusCode};
use tempfile::TempDir;
use tokio::net::TcpListener;

use wayproxy_core::{CaptureRecord, GatewayConfig, ListenConfig, ProxyOptions};
use wayproxy_proxy::{ProxyHandle, ProxyServer};
use wayproxy_storage::{ArchiveStore, FsArchiveStore};

pub const EXAMPLE_HTML: &str = "<!doctype html>\n<html>\n<head>\n<title>Example Domain</title>\n</head>\n<body>\n<h1>Example Domain</h1>\n</body>\n</html>\n";

/// A running gateway with its own root CA and archive directory.
pub struct TestGateway {
    pub dir: TempDir,
    pub store: Arc<FsArchiveStore>,
    pub handle: ProxyHandle,
    pub client: reqwest::Client,
}

impl TestGateway {
    /// Starts a gateway with `options`; the CA lives in the temp directory.
    pub async fn start(options: ProxyOptions) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsArchiveStore::new(dir.path().join("collections")));

        store.init_collection("pywb").await.unwrap();
        write_fixtures(&store).await;
        if options.collection != "pywb" {
            store.init_collection(&options.collection).await.unwrap();
        }

        let config = GatewayConfig {
            listen: ListenConfig {
                port: 0,
                ..ListenConfig::default()
            },
            proxy: options.with_ca("wayproxy test CA", dir.path().join("ca").join("test-ca.pem")),
            ..GatewayConfig::default()
        };

        let server = ProxyServer::new(&config, store.clone()).unwrap();
        let handle = server.start().await.unwrap();
        let client = proxied_client(&handle);

        Self {
            dir,
            store,
            handle,
            client,
        }
    }

    /// Rebuilds the router with new options, keeping the test CA.
    pub async fn reconfigure(&self, options: ProxyOptions) {
        let options = options.with_ca(
            "wayproxy test CA",
            self.dir.path().join("ca").join("test-ca.pem"),
        );
        self.handle.reconfigure(options).await.unwrap();
    }

    /// Number of archive files in a collection.
    pub fn archive_files(&self, collection: &str) -> usize {
        std::fs::read_dir(self.store.archive_dir(collection))
            .unwrap()
            .count()
    }

    pub async fn get(&self, url: &str) -> (StatusCode, HeaderMap, String) {
        let response = self.client.get(url).send().await.unwrap();
        into_parts(response).await
    }

    pub async fn stop(self) {
        self.handle.stop().await.unwrap();
    }
}

/// A client that sends everything through the gateway and trusts its root.
pub fn proxied_client(handle: &ProxyHandle) -> reqwest::Client {
    let root = reqwest::Certificate::from_pem(handle.ca_cert_pem().as_bytes()).unwrap();
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{}", handle.addr())).unwrap())
        .add_root_certificate(root)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

pub async fn into_parts(response: reqwest::Response) -> (StatusCode, HeaderMap, String) {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap();
    (status, headers, body)
}

/// Two captures of example.com in the `pywb` collection.
async fn write_fixtures(store: &FsArchiveStore) {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, "text/html; charset=UTF-8".parse().unwrap());

    let newer = CaptureRecord::new(
        "http://example.com",
        Utc.with_ymd_and_hms(2014, 1, 27, 17, 12, 51).unwrap(),
        StatusCode::OK,
        headers.clone(),
        EXAMPLE_HTML,
    );
    let older = CaptureRecord::new(
        "http://test@example.com/",
        Utc.with_ymd_and_hms(2013, 7, 29, 19, 51, 51).unwrap(),
        StatusCode::OK,
        headers,
        EXAMPLE_HTML,
    );

    let mut writer = store.open_writer("pywb").await.unwrap();
    writer.write(&newer).await.unwrap();
    writer.write(&older).await.unwrap();
    writer.close().await.unwrap();
}

/// Size of the binary body served under `/download`.
pub const DOWNLOAD_LEN: usize = 256 * 1024;

/// Starts a local origin that echoes the request path in an HTML page.
///
/// Paths under `/download` get `DOWNLOAD_LEN` bytes of binary instead.
pub async fn start_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = Router::new().fallback(echo_page);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

async fn echo_page(req: Request) -> Response {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();
    if path.starts_with("/download") {
        let body = vec![0xABu8; DOWNLOAD_LEN];
        return ([(CONTENT_TYPE, "application/octet-stream")], body).into_response();
    }

    let html = format!(
        "<html><head><title>origin</title></head><body>origin page {}</body></html>",
        path
    );
    ([(CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response()
}
