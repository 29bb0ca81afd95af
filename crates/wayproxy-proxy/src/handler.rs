//! hudsucker HTTP handler.
//!
//! Buffers each intercepted request, hands it to the current
//! [`FrontEndRouter`](crate::FrontEndRouter) and always answers with the
//! router's response, so hudsucker itself never forwards anything upstream.
//! Streamed response bodies are passed through without buffering.

use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{Method, Request, Response, StatusCode},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;

use crate::body::ResponseBody;
use crate::router::RouterSlot;

fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

fn into_body(body: ResponseBody) -> Body {
    match body {
        ResponseBody::Full(bytes) => bytes_to_body(bytes.unwrap_or_default()),
        streamed => Body::from(
            streamed
                .map_err(|e| {
                    tracing::warn!("Response body failed: {}", e);
                    hudsucker::Error::Decode
                })
                .boxed(),
        ),
    }
}

/// HTTP handler for the gateway proxy.
#[derive(Clone, Debug)]
pub struct GatewayHandler {
    routers: RouterSlot,
}

impl GatewayHandler {
    /// Creates a handler serving requests from `routers`.
    pub fn new(routers: RouterSlot) -> Self {
        Self { routers }
    }

    fn bad_request(reason: &str) -> Response<Body> {
        let mut response = Response::new(bytes_to_body(Bytes::from(reason.to_string())));
        *response.status_mut() = StatusCode::BAD_REQUEST;
        response
    }
}

impl HttpHandler for GatewayHandler {
    async fn handle_request(&mut self, ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        // hudsucker terminates the tunnel itself; the decrypted requests
        // come back through here
        if req.method() == Method::CONNECT {
            tracing::debug!("CONNECT {} from {}", req.uri(), ctx.client_addr);
            return RequestOrResponse::Request(req);
        }

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Failed to read request body for {}: {}", parts.uri, e);
                return RequestOrResponse::Response(Self::bad_request("unreadable request body"));
            }
        };

        let router = self.routers.current();
        let response = router.handle(Request::from_parts(parts, body)).await;

        RequestOrResponse::Response(response.map(into_body))
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        res
    }
}
