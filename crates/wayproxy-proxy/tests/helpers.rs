//! The reserved helper host and its CORS contract.

mod common;

use common::{start_origin, TestGateway};
use http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, LINK};
use reqwest::Method;
use wayproxy_core::ProxyOptions;

const ORIGIN: &str = "https://example.com";

#[tokio::test]
async fn options_echo_origin() {
    let gateway = TestGateway::start(ProxyOptions::new("pywb")).await;

    for scheme in ["http", "https"] {
        for path in ["/", "/proxy-fetch/https://example.com/", "/proxy-worker"] {
            let url = format!("{}://pywb.proxy{}", scheme, path);
            let response = gateway
                .client
                .request(Method::OPTIONS, &url)
                .header("Origin", ORIGIN)
                .send()
                .await
                .unwrap();

            assert!(response.status().is_success(), "{}", url);
            assert_eq!(
                response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
                ORIGIN,
                "{}",
                url
            );
        }
    }

    gateway.stop().await;
}

#[tokio::test]
async fn worker_without_origin() {
    let gateway = TestGateway::start(ProxyOptions::new("pywb")).await;

    for scheme in ["http", "https"] {
        let (status, headers, body) = gateway
            .get(&format!("{}://pywb.proxy/proxy-worker", scheme))
            .await;

        assert_eq!(status, 200);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/javascript");
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert!(body.contains("Preserver.prototype.safeResolve"));
        assert!(headers.get("memento-datetime").is_none());
    }

    gateway.stop().await;
}

#[tokio::test]
async fn proxy_fetch_bypasses_archive() {
    let origin = start_origin().await;
    let gateway = TestGateway::start(ProxyOptions::new("pywb")).await;
    let target = format!("http://{}/live?x=1", origin);

    for scheme in ["http", "https"] {
        let response = gateway
            .client
            .get(format!("{}://pywb.proxy/proxy-fetch/{}", scheme, target))
            .header("Origin", ORIGIN)
            .send()
            .await
            .unwrap();
        let (status, headers, body) = common::into_parts(response).await;

        assert_eq!(status, 200);
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), ORIGIN);
        assert!(body.contains("origin page /live?x=1"));
        // passthrough: not rewritten, no Memento headers
        assert!(!body.contains("WB Insert"));
        assert!(headers.get(LINK).is_none());
        assert!(headers.get("memento-datetime").is_none());
    }

    gateway.stop().await;
}

#[tokio::test]
async fn failed_proxy_fetch_keeps_cors() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let gateway = TestGateway::start(ProxyOptions::new("pywb")).await;

    for (target, expected) in [
        (format!("http://{}/", dead), 502u16),
        ("example.com/".to_string(), 400u16),
    ] {
        let response = gateway
            .client
            .get(format!("https://pywb.proxy/proxy-fetch/{}", target))
            .header("Origin", ORIGIN)
            .send()
            .await
            .unwrap();
        let (status, headers, _) = common::into_parts(response).await;

        assert_eq!(status, expected, "{}", target);
        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), ORIGIN);
    }

    gateway.stop().await;
}

#[tokio::test]
async fn proxy_fetch_does_not_record() {
    let origin = start_origin().await;
    let gateway = TestGateway::start(ProxyOptions::new("test").with_recording(true)).await;

    let (status, _, _) = gateway
        .get(&format!("http://pywb.proxy/proxy-fetch/http://{}/", origin))
        .await;
    assert_eq!(status, 200);
    assert_eq!(
        gateway.handle.router().recorder().unwrap().recorded_count(),
        0
    );
    assert_eq!(gateway.archive_files("test"), 0);

    gateway.stop().await;
}

#[tokio::test]
async fn static_assets_and_unknown_paths() {
    let gateway = TestGateway::start(ProxyOptions::new("pywb")).await;

    let (status, headers, body) = gateway
        .get("https://pywb.proxy/static/default_banner.js")
        .await;
    assert_eq!(status, 200);
    assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/javascript");
    assert!(!body.is_empty());

    let (status, headers, _) = gateway
        .get("https://pywb.proxy/static/wombatProxyMode.js")
        .await;
    assert_eq!(status, 200);
    assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");

    let (status, _, _) = gateway.get("https://pywb.proxy/nothing").await;
    assert_eq!(status, 404);

    gateway.stop().await;
}
