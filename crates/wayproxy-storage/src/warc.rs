//! WARC/1.0 record encoding.
//!
//! Archive files are sequences of gzip members, one WARC record per member,
//! so any record can be read back from its `(offset, length)` alone. Each
//! capture is written as a `response` record followed by the `request`
//! record that produced it, linked through `WARC-Concurrent-To`.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode};

use wayproxy_core::timestamp::{format_warc_date, parse_warc_date};
use wayproxy_core::{CaptureRecord, CapturedRequest};

const WARC_VERSION: &str = "WARC/1.0";

const INITIAL_HEADERS: usize = 64;
const MAX_HEADERS: usize = 1024;

/// WARC header names used by the store.
pub mod headers {
    /// Record type.
    pub const WARC_TYPE: &str = "WARC-Type";
    /// Unique record identifier.
    pub const WARC_RECORD_ID: &str = "WARC-Record-ID";
    /// URL the record describes.
    pub const WARC_TARGET_URI: &str = "WARC-Target-URI";
    /// Capture datetime.
    pub const WARC_DATE: &str = "WARC-Date";
    /// Id of the record captured alongside this one.
    pub const WARC_CONCURRENT_TO: &str = "WARC-Concurrent-To";
    /// Block content type.
    pub const CONTENT_TYPE: &str = "Content-Type";
    /// Block length.
    pub const CONTENT_LENGTH: &str = "Content-Length";
}

/// A parsed or to-be-written WARC record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarcRecord {
    /// Named fields, in order, excluding `Content-Length`.
    pub headers: Vec<(String, String)>,
    /// Record block.
    pub payload: Bytes,
}

impl WarcRecord {
    /// Creates a record with the mandatory fields set.
    pub fn new(warc_type: &str, target_uri: &str, date: &str, content_type: &str) -> Self {
        Self {
            headers: vec![
                (headers::WARC_TYPE.to_string(), warc_type.to_string()),
                (headers::WARC_RECORD_ID.to_string(), new_record_id()),
                (headers::WARC_TARGET_URI.to_string(), target_uri.to_string()),
                (headers::WARC_DATE.to_string(), date.to_string()),
                (headers::CONTENT_TYPE.to_string(), content_type.to_string()),
            ],
            payload: Bytes::new(),
        }
    }

    /// Sets the block.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Appends a named field.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Looks up a named field, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `WARC-Type` value.
    pub fn warc_type(&self) -> Option<&str> {
        self.header(headers::WARC_TYPE)
    }

    /// `WARC-Record-ID` value.
    pub fn record_id(&self) -> Option<&str> {
        self.header(headers::WARC_RECORD_ID)
    }

    /// `WARC-Target-URI` value.
    pub fn target_uri(&self) -> Option<&str> {
        self.header(headers::WARC_TARGET_URI)
    }

    /// Serializes the record, uncompressed.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 512);
        out.extend_from_slice(WARC_VERSION.as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case(headers::CONTENT_LENGTH) {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(
            format!("{}: {}\r\n\r\n", headers::CONTENT_LENGTH, self.payload.len()).as_bytes(),
        );
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(b"\r\n\r\n");
        out
    }

    /// Serializes the record as a standalone gzip member.
    pub fn to_gzip_member(&self) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&self.to_bytes())?;
        encoder.finish()
    }

    /// Parses an uncompressed record.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        let (head, rest) = split_head(data).ok_or("missing end of WARC headers")?;
        let head = std::str::from_utf8(head).map_err(|_| "WARC headers are not UTF-8")?;

        let mut lines = head.lines();
        let version = lines.next().unwrap_or_default().trim();
        if !version.starts_with("WARC/") {
            return Err(format!("unexpected version line {:?}", version));
        }

        let mut fields = Vec::new();
        let mut length = None;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim());
            if name.eq_ignore_ascii_case(headers::CONTENT_LENGTH) {
                length = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| format!("invalid Content-Length {:?}", value))?,
                );
            } else {
                fields.push((name.to_string(), value.to_string()));
            }
        }

        let length = length.ok_or("missing Content-Length")?;
        if rest.len() < length {
            return Err(format!("block truncated: {} of {} bytes", rest.len(), length));
        }

        Ok(Self {
            headers: fields,
            payload: Bytes::copy_from_slice(&rest[..length]),
        })
    }
}

/// Builds the response and request records for a capture.
pub fn capture_to_records(record: &CaptureRecord) -> Vec<WarcRecord> {
    let date = format_warc_date(&record.datetime);

    let response = WarcRecord::new(
        "response",
        &record.url,
        &date,
        "application/http; msgtype=response",
    )
    .with_payload(encode_http_response(record.status, &record.headers, &record.body));

    let mut records = Vec::with_capacity(2);
    if let Some(request) = &record.request {
        let concurrent_to = response.record_id().unwrap_or_default().to_string();
        let request = WarcRecord::new(
            "request",
            &record.url,
            &date,
            "application/http; msgtype=request",
        )
        .with_header(headers::WARC_CONCURRENT_TO, &concurrent_to)
        .with_payload(encode_http_request(request, &record.url));
        records.push(response);
        records.push(request);
    } else {
        records.push(response);
    }

    records
}

/// Rebuilds a capture from a `response` record.
pub fn record_to_capture(record: &WarcRecord) -> Result<CaptureRecord, String> {
    if record.warc_type() != Some("response") {
        return Err(format!("not a response record: {:?}", record.warc_type()));
    }

    let url = record.target_uri().ok_or("missing WARC-Target-URI")?;
    let date = record
        .header(headers::WARC_DATE)
        .ok_or("missing WARC-Date")?;
    let datetime = parse_warc_date(date).map_err(|e| e.to_string())?;
    let (status, headers, body) = parse_http_response(&record.payload)?;

    Ok(CaptureRecord::new(url, datetime, status, headers, body))
}

/// Serializes an HTTP response message.
///
/// The body is stored transfer-decoded, so `Transfer-Encoding` is dropped and
/// `Content-Length` always matches the stored body.
pub fn encode_http_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 512);
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );

    for (name, value) in headers {
        if name == TRANSFER_ENCODING || name == CONTENT_LENGTH {
            continue;
        }
        write_header(&mut out, name, value);
    }
    out.extend_from_slice(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out
}

/// Serializes an HTTP request message.
pub fn encode_http_request(request: &CapturedRequest, url: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(request.body.len() + 256);
    out.extend_from_slice(
        format!("{} {} HTTP/1.1\r\n", request.method, request.path_and_query).as_bytes(),
    );

    if !request.headers.contains_key(HOST) {
        if let Some(host) = url
            .parse::<http::Uri>()
            .ok()
            .and_then(|u| u.authority().map(|a| a.to_string()))
        {
            out.extend_from_slice(format!("host: {}\r\n", host).as_bytes());
        }
    }

    for (name, value) in &request.headers {
        write_header(&mut out, name, value);
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}

/// Parses an HTTP response message.
///
/// Header values are kept as raw bytes, so values that are not UTF-8 replay
/// exactly as archived.
pub fn parse_http_response(data: &[u8]) -> Result<(StatusCode, HeaderMap, Bytes), String> {
    let mut capacity = INITIAL_HEADERS;
    loop {
        let mut storage = vec![httparse::EMPTY_HEADER; capacity];
        let mut response = httparse::Response::new(&mut storage);

        let head_len = match response.parse(data) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Err("missing end of HTTP headers".into()),
            Err(httparse::Error::TooManyHeaders) if capacity < MAX_HEADERS => {
                capacity *= 4;
                continue;
            }
            Err(e) => return Err(format!("invalid HTTP response head: {}", e)),
        };

        let code = response.code.ok_or("missing status code")?;
        let status = StatusCode::from_u16(code).map_err(|e| e.to_string())?;

        let mut headers = HeaderMap::with_capacity(response.headers.len());
        for header in response.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| format!("invalid header name {:?}: {}", header.name, e))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| format!("invalid value for {}: {}", header.name, e))?;
            headers.append(name, value);
        }

        return Ok((status, headers, Bytes::copy_from_slice(&data[head_len..])));
    }
}

/// Iterates the gzip members of an archive file.
///
/// Yields `(offset, length, record)` per member. A member that fails to
/// decode ends the iteration with an error; for the last member of a file
/// being appended to this is an incomplete write, not corruption.
pub struct MemberIter<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> MemberIter<'a> {
    /// Iterates members of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for MemberIter<'a> {
    type Item = Result<(u64, u64, WarcRecord), (u64, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }

        let start = self.offset;
        let input = &self.data[start..];
        let mut decoder = flate2::bufread::GzDecoder::new(input);
        let mut raw = Vec::new();

        if let Err(e) = decoder.read_to_end(&mut raw) {
            self.failed = true;
            return Some(Err((start as u64, e.to_string())));
        }

        let remaining = decoder.into_inner().len();
        let length = input.len() - remaining;
        if length == 0 {
            self.failed = true;
            return Some(Err((start as u64, "empty gzip member".to_string())));
        }
        self.offset = start + length;

        Some(
            WarcRecord::parse(&raw)
                .map(|record| (start as u64, length as u64, record))
                .map_err(|reason| (start as u64, reason)),
        )
    }
}

/// Decodes a single gzip member into a record.
pub fn decode_member(member: &[u8]) -> Result<WarcRecord, String> {
    let mut decoder = flate2::bufread::GzDecoder::new(member);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw).map_err(|e| e.to_string())?;
    WarcRecord::parse(&raw)
}

fn write_header(out: &mut Vec<u8>, name: &HeaderName, value: &HeaderValue) {
    out.extend_from_slice(name.as_str().as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn split_head(data: &[u8]) -> Option<(&[u8], &[u8])> {
    if let Some(pos) = find(data, b"\r\n\r\n") {
        return Some((&data[..pos], &data[pos + 4..]));
    }
    find(data, b"\n\n").map(|pos| (&data[..pos], &data[pos + 2..]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn new_record_id() -> String {
    let v: u128 = rand::random();
    let hex = format!("{:032x}", v);
    format!(
        "<urn:uuid:{}-{}-{}-{}-{}>",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
