//! Front-end request routing.
//!
//! Every decrypted or plain-HTTP request lands in [`FrontEndRouter::handle`],
//! which picks a [`Mode`] and produces the complete response:
//!
//! ```text
//! request ─► select_mode ─┬─ Replay      ─► archive lookup ─┐
//!                         ├─ Record      ─► upstream + recorder ─┼─► injection ─► client
//!                         └─ Passthrough ─► helper endpoints ────────────────────► client
//! ```
//!
//! Recorded HTML is buffered so the head insert can be placed; any other
//! recorded body is forwarded chunk by chunk while the recorder keeps a copy.

use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use wayproxy_core::timestamp::parse_http_date;
use wayproxy_core::{target_url, CapturedRequest, MementoDescriptor, ProxyOptions, RouteSpec};
use wayproxy_storage::ArchiveStore;

use crate::body::ResponseBody;
use crate::endpoints::HelperEndpoints;
use crate::error::{ProxyError, Result};
use crate::inject::{add_memento_headers, strip_hop_by_hop, InjectionPipeline};
use crate::recorder::{PendingCapture, SessionRecorder};
use crate::upstream::{forwardable_headers, UpstreamClient};

/// `Accept-Datetime` request header.
pub const ACCEPT_DATETIME: &str = "accept-datetime";

/// Chunks in flight between a recorded upstream and its client.
const STREAM_DEPTH: usize = 16;

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Serve the closest archived capture.
    Replay,
    /// Fetch live and record.
    Record,
    /// Helper endpoint; neither archive nor recorder is involved.
    Passthrough,
}

/// Picks the mode for a request.
///
/// The reserved host always bypasses the archive; everything else follows
/// the route.
pub fn select_mode(route: &RouteSpec, magic_host: &str, uri: &Uri) -> Mode {
    let is_magic = uri
        .host()
        .is_some_and(|host| host.eq_ignore_ascii_case(magic_host));

    if is_magic {
        Mode::Passthrough
    } else if route.record {
        Mode::Record
    } else {
        Mode::Replay
    }
}

/// Routes requests for one set of proxy options.
///
/// Options are fixed at construction; build a new router to change them.
pub struct FrontEndRouter {
    options: ProxyOptions,
    route: RouteSpec,
    store: Arc<dyn ArchiveStore>,
    upstream: UpstreamClient,
    pipeline: InjectionPipeline,
    endpoints: HelperEndpoints,
    recorder: Option<Arc<SessionRecorder>>,
}

impl std::fmt::Debug for FrontEndRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontEndRouter")
            .field("route", &self.route)
            .field("recorder", &self.recorder)
            .finish_non_exhaustive()
    }
}

impl FrontEndRouter {
    /// Builds a router.
    ///
    /// Invalid options are rejected here, before any request is served.
    pub fn new(
        options: ProxyOptions,
        store: Arc<dyn ArchiveStore>,
        upstream: UpstreamClient,
    ) -> Result<Self> {
        options.validate()?;
        let route = options.route()?;

        let recorder = route
            .record
            .then(|| Arc::new(SessionRecorder::new(store.clone(), &route.collection)));

        tracing::info!(
            "Router for {} ({})",
            route,
            if route.record { "record" } else { "replay" }
        );

        Ok(Self {
            pipeline: InjectionPipeline::new(&options, &route),
            endpoints: HelperEndpoints::new(upstream.clone()),
            options,
            route,
            store,
            upstream,
            recorder,
        })
    }

    /// Options this router was built from.
    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Route this router serves.
    pub fn route(&self) -> &RouteSpec {
        &self.route
    }

    /// Recorder of a recording route.
    pub fn recorder(&self) -> Option<&Arc<SessionRecorder>> {
        self.recorder.as_ref()
    }

    /// Handles one request; errors become error responses.
    pub async fn handle(&self, req: Request<Bytes>) -> Response<ResponseBody> {
        let method = req.method().clone();
        let uri = req.uri().clone();

        match self.dispatch(req).await {
            Ok(response) => response,
            Err(e) => {
                let status = e.status();
                if status.is_server_error() {
                    tracing::warn!("{} {} failed: {}", method, uri, e);
                } else {
                    tracing::debug!("{} {} -> {}: {}", method, uri, status, e);
                }
                e.to_response().map(ResponseBody::from)
            }
        }
    }

    async fn dispatch(&self, req: Request<Bytes>) -> Result<Response<ResponseBody>> {
        let mode = select_mode(&self.route, &self.options.magic_host, req.uri());
        tracing::debug!("{} {} -> {:?}", req.method(), req.uri(), mode);

        match mode {
            Mode::Passthrough => Ok(self.endpoints.handle(&req).await.map(ResponseBody::from)),
            Mode::Replay => self
                .replay(&req)
                .await
                .map(|response| response.map(ResponseBody::from)),
            Mode::Record => self.record(req).await,
        }
    }

    async fn replay(&self, req: &Request<Bytes>) -> Result<Response<Bytes>> {
        let url = request_url(req.uri())?;
        let requested = accept_datetime(req)?;
        let collection = &self.route.collection;

        let record = self
            .store
            .lookup(collection, &url, requested)
            .await?
            .ok_or_else(|| ProxyError::NotFound(format!("{} in {}", url, collection)))?;

        let memento = MementoDescriptor::replay(&record, collection);
        let (headers, body) =
            self.pipeline
                .rewrite(&record.headers, record.body.clone(), &memento, requested);

        let mut response = Response::new(body);
        *response.status_mut() = record.status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    async fn record(&self, req: Request<Bytes>) -> Result<Response<ResponseBody>> {
        let recorder = self
            .recorder
            .as_ref()
            .ok_or_else(|| ProxyError::Proxy("recording route without recorder".into()))?;

        let url = request_url(req.uri())?;
        let (parts, body) = req.into_parts();

        let upstream = self
            .upstream
            .fetch(&parts.method, &url, &parts.headers, body.clone())
            .await?;
        let status = upstream.status();
        let upstream_headers = upstream.headers().clone();

        let request = CapturedRequest {
            method: parts.method.clone(),
            path_and_query: parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            headers: forwardable_headers(&parts.headers),
            body,
        };

        if !self.pipeline.decide(&upstream_headers).modifies_body() {
            let capture = recorder.begin(request, &url, status, &upstream_headers)?;
            return Ok(stream_recorded(
                status,
                &upstream_headers,
                capture,
                Box::pin(upstream.bytes_stream()),
            ));
        }

        let record = recorder
            .record(
                request,
                &url,
                status,
                &upstream_headers,
                Box::pin(upstream.bytes_stream()),
            )
            .await?;

        let memento = MementoDescriptor::live(&record, &self.route.collection);
        let (headers, body) = self
            .pipeline
            .rewrite(&record.headers, record.body.clone(), &memento, None);

        let mut response = Response::new(ResponseBody::from(body));
        *response.status_mut() = record.status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Forwards a recorded body to the client as it arrives.
///
/// The origin's `Content-Length`, if any, is kept since the body is not
/// modified.
fn stream_recorded<S, E>(
    status: StatusCode,
    upstream_headers: &HeaderMap,
    capture: PendingCapture,
    upstream: S,
) -> Response<ResponseBody>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let mut headers = strip_hop_by_hop(upstream_headers);
    add_memento_headers(&mut headers, &capture.memento());

    let (tx, body) = ResponseBody::channel(STREAM_DEPTH);
    tokio::spawn(tee(upstream, capture, tx));

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Copies `upstream` to the client and into `capture`.
///
/// The capture is committed only after a clean end and before the client
/// body ends, so a flush after the client is done sees it. An upstream
/// failure or a departed client aborts it.
async fn tee<S, E>(
    mut upstream: S,
    mut capture: PendingCapture,
    client: mpsc::Sender<Result<Bytes>>,
) where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: Display,
{
    while let Some(chunk) = upstream.next().await {
        match chunk {
            Ok(chunk) => {
                capture.push(&chunk);
                if client.send(Ok(chunk)).await.is_err() {
                    tracing::debug!("Client left; not recording {}", capture.url());
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Aborted capture of {}: {}", capture.url(), e);
                let _ = client
                    .send(Err(ProxyError::Upstream(e.to_string())))
                    .await;
                return;
            }
        }
    }

    let url = capture.url().to_string();
    if let Err(e) = capture.commit().await {
        tracing::warn!("Capture of {} dropped: {}", url, e);
    }
}

/// The router currently serving requests.
///
/// Requests take a snapshot per request, so swapping in a new router never
/// affects requests already in flight.
#[derive(Debug, Clone)]
pub struct RouterSlot {
    inner: Arc<RwLock<Arc<FrontEndRouter>>>,
}

impl RouterSlot {
    /// Creates a slot holding `router`.
    pub fn new(router: FrontEndRouter) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(router))),
        }
    }

    /// The current router.
    pub fn current(&self) -> Arc<FrontEndRouter> {
        self.inner.read().clone()
    }

    /// Installs a new router and returns the previous one.
    pub fn replace(&self, router: FrontEndRouter) -> Arc<FrontEndRouter> {
        std::mem::replace(&mut *self.inner.write(), Arc::new(router))
    }
}

fn request_url(uri: &Uri) -> Result<String> {
    target_url(uri)
        .ok_or_else(|| ProxyError::BadRequest(format!("not a proxy request: {}", uri)))
}

/// Parses the `Accept-Datetime` hint; absent means "most recent".
fn accept_datetime(req: &Request<Bytes>) -> Result<Option<DateTime<Utc>>> {
    let Some(value) = req.headers().get(ACCEPT_DATETIME) else {
        return Ok(None);
    };

    let value = value
        .to_str()
        .map_err(|_| ProxyError::BadRequest("Accept-Datetime is not ASCII".into()))?;
    parse_http_date(value)
        .map(Some)
        .map_err(|e| ProxyError::BadRequest(format!("Accept-Datetime: {}", e)))
}
