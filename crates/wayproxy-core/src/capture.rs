//! Archived capture model and Memento header derivation.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode};

use crate::timestamp::{format_http_date, to_timestamp14};
use crate::urlkey::canonical_key;

/// The request half of a live capture.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    /// Request method.
    pub method: Method,
    /// Path and query as sent on the request line.
    pub path_and_query: String,
    /// Request headers forwarded upstream.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Bytes,
}

impl CapturedRequest {
    /// Creates a GET request capture with no headers.
    pub fn get(path_and_query: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// One archived response for a URL at a specific datetime.
///
/// Created once by the recorder (or an import), then only ever read.
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    /// Original URL, kept verbatim including percent-encoding.
    pub url: String,
    /// Capture datetime, second precision.
    pub datetime: DateTime<Utc>,
    /// Response status.
    pub status: StatusCode,
    /// Response headers as archived.
    pub headers: HeaderMap,
    /// Response payload, transfer-decoded.
    pub body: Bytes,
    /// Request that produced the response, when known.
    pub request: Option<CapturedRequest>,
}

impl CaptureRecord {
    /// Creates a capture without request metadata.
    pub fn new(
        url: impl Into<String>,
        datetime: DateTime<Utc>,
        status: StatusCode,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            url: url.into(),
            datetime,
            status,
            headers,
            body: body.into(),
            request: None,
        }
    }

    /// Attaches the originating request.
    pub fn with_request(mut self, request: CapturedRequest) -> Self {
        self.request = Some(request);
        self
    }

    /// Canonical index key of the capture URL.
    pub fn url_key(&self) -> String {
        canonical_key(&self.url)
    }

    /// 14-digit capture timestamp.
    pub fn timestamp(&self) -> String {
        to_timestamp14(&self.datetime)
    }

    /// The `Content-Type` header value, if present and valid UTF-8.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    /// Bare MIME type, without parameters, lowercased.
    pub fn mime(&self) -> Option<String> {
        self.content_type().map(mime_essence)
    }
}

/// Strips parameters from a content type and lowercases it.
pub fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase()
}

/// Temporal identity of a response served through the gateway.
///
/// Derived per response, never stored. `Memento-Datetime` and the `datetime`
/// attribute of `Link` are both rendered from the same field, so they always
/// agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MementoDescriptor {
    /// URL the capture was taken from.
    pub original_url: String,
    /// Capture datetime.
    pub datetime: DateTime<Utc>,
    /// Collection serving the capture.
    pub collection: String,
    /// Whether the response is a live recording rather than a replay.
    pub live: bool,
}

impl MementoDescriptor {
    /// Describes a replayed capture.
    pub fn replay(record: &CaptureRecord, collection: impl Into<String>) -> Self {
        Self {
            original_url: record.url.clone(),
            datetime: record.datetime,
            collection: collection.into(),
            live: false,
        }
    }

    /// Describes a capture being recorded live.
    pub fn live(record: &CaptureRecord, collection: impl Into<String>) -> Self {
        Self::live_at(&record.url, record.datetime, collection)
    }

    /// Describes a live recording whose body is still arriving.
    pub fn live_at(
        url: impl Into<String>,
        datetime: DateTime<Utc>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            original_url: url.into(),
            datetime,
            collection: collection.into(),
            live: true,
        }
    }

    /// Value of the `Memento-Datetime` header.
    pub fn memento_datetime(&self) -> String {
        format_http_date(&self.datetime)
    }

    /// Value of the `Link` header.
    pub fn link_header(&self) -> String {
        format!(
            "<{}>; rel=\"memento\"; datetime=\"{}\"; collection=\"{}\"",
            self.original_url,
            self.memento_datetime(),
            self.collection
        )
    }

    /// 14-digit capture timestamp.
    pub fn timestamp(&self) -> String {
        to_timestamp14(&self.datetime)
    }
}
