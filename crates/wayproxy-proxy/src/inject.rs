//! Response rewriting: head insert, banner, rewriting scripts, Memento headers.
//!
//! What gets injected is decided per response by [`RewriteDecision::decide`],
//! a pure function of the proxy options and the response content type. Only
//! HTML is ever modified; everything else passes through with its headers
//! augmented.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, LINK,
    PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http::HeaderMap;
use once_cell::sync::Lazy;
use regex::bytes::Regex;

use wayproxy_core::timestamp::to_timestamp14;
use wayproxy_core::{mime_essence, MementoDescriptor, ProxyOptions, RouteSpec};

/// Marker opening the head insert.
pub const HEAD_INSERT_START: &str = "<!-- WB Insert -->";

/// Marker closing the head insert.
pub const HEAD_INSERT_END: &str = "<!-- End WB Insert -->";

/// Client-side rewriting script served in proxy mode.
pub const PROXY_MODE_SCRIPT: &str = "wombatProxyMode.js";

/// Banner script.
pub const BANNER_SCRIPT: &str = "default_banner.js";

/// Banner stylesheet.
pub const BANNER_STYLESHEET: &str = "default_banner.css";

/// `Memento-Datetime` header.
pub const MEMENTO_DATETIME: &str = "memento-datetime";

static HEAD_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<head(\s[^>]*)?>").expect("Invalid regex pattern"));
static HTML_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<html(\s[^>]*)?>").expect("Invalid regex pattern"));

const HTML_TYPES: &[&str] = &["text/html", "application/xhtml+xml"];

/// Which client-side rewriting script, if any, a page gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptVariant {
    /// No rewriting script.
    None,
    /// Full client-side URL rewriting.
    Wombat,
    /// Preservation worker only.
    PreserveWorker,
    /// Both, as one combined script.
    Both,
}

impl ScriptVariant {
    /// Selects the variant from the two script flags.
    pub fn select(use_wombat: bool, use_preserve_worker: bool) -> Self {
        match (use_wombat, use_preserve_worker) {
            (true, true) => Self::Both,
            (true, false) => Self::Wombat,
            (false, true) => Self::PreserveWorker,
            (false, false) => Self::None,
        }
    }

    /// Mode flag embedded in the page for the combined script.
    pub fn mode_flag(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Wombat => Some("w"),
            Self::PreserveWorker => Some("p"),
            Self::Both => Some("wp"),
        }
    }
}

/// Cross-origin headers a response carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorsPolicy {
    /// No CORS headers.
    None,
    /// Reflect the request `Origin`, or `*` without one.
    ReflectOrigin,
}

/// What to do to one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteDecision {
    /// Insert the banner.
    pub inject_banner: bool,
    /// Insert the head marker fragment.
    pub inject_head: bool,
    /// Rewriting script to include.
    pub script: ScriptVariant,
    /// CORS headers to add.
    pub cors: CorsPolicy,
}

impl RewriteDecision {
    /// A decision that leaves the response untouched.
    pub fn passthrough() -> Self {
        Self {
            inject_banner: false,
            inject_head: false,
            script: ScriptVariant::None,
            cors: CorsPolicy::None,
        }
    }

    /// Decides how to rewrite a response of `content_type`.
    ///
    /// Banner and scripts hang off the head insert, so neither is emitted
    /// without it.
    pub fn decide(options: &ProxyOptions, content_type: Option<&str>) -> Self {
        let html = content_type
            .map(mime_essence)
            .is_some_and(|mime| HTML_TYPES.contains(&mime.as_str()));

        let inject_head = html && options.use_head_insert;
        let script = if inject_head {
            ScriptVariant::select(options.use_wombat, options.use_preserve_worker)
        } else {
            ScriptVariant::None
        };

        Self {
            inject_banner: inject_head && options.use_banner,
            inject_head,
            script,
            cors: CorsPolicy::None,
        }
    }

    /// Whether the body is modified at all.
    pub fn modifies_body(&self) -> bool {
        self.inject_head
    }
}

/// Rewrites responses for one router.
#[derive(Debug, Clone)]
pub struct InjectionPipeline {
    options: ProxyOptions,
    modifier: String,
}

impl InjectionPipeline {
    /// Creates a pipeline for the given options and route.
    pub fn new(options: &ProxyOptions, route: &RouteSpec) -> Self {
        Self {
            options: options.clone(),
            modifier: route.modifier.clone(),
        }
    }

    /// Decides how to rewrite a response with these headers.
    pub fn decide(&self, headers: &HeaderMap) -> RewriteDecision {
        let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        RewriteDecision::decide(&self.options, content_type)
    }

    /// Rewrites a replayed or recorded response.
    ///
    /// `requested` is the datetime the client asked for, if any.
    pub fn rewrite(
        &self,
        headers: &HeaderMap,
        body: Bytes,
        memento: &MementoDescriptor,
        requested: Option<DateTime<Utc>>,
    ) -> (HeaderMap, Bytes) {
        let mut out = strip_hop_by_hop(headers);
        out.remove(CONTENT_LENGTH);
        add_memento_headers(&mut out, memento);

        let mut decision = self.decide(headers);
        if decision.modifies_body() && !is_identity_encoded(headers) {
            tracing::debug!("Not injecting into encoded body of {}", memento.original_url);
            decision = RewriteDecision::passthrough();
        }

        let body = if decision.modifies_body() {
            let insert = self.head_insert(&decision, memento, requested);
            insert_into_head(&body, &insert)
        } else {
            body
        };

        out.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        (out, body)
    }

    /// Renders the head insert fragment.
    pub fn head_insert(
        &self,
        decision: &RewriteDecision,
        memento: &MementoDescriptor,
        requested: Option<DateTime<Utc>>,
    ) -> String {
        let magic = &self.options.magic_host;
        let timestamp = memento.timestamp();
        let request_ts = requested
            .map(|dt| to_timestamp14(&dt))
            .unwrap_or_else(|| timestamp.clone());

        let mut out = String::with_capacity(1024);
        out.push_str(HEAD_INSERT_START);
        out.push_str("\n<script>\nwbinfo = {};\n");
        push_var(&mut out, "url", &js_string(&memento.original_url));
        push_var(&mut out, "timestamp", &js_string(&timestamp));
        push_var(&mut out, "request_ts", &js_string(&request_ts));
        push_var(&mut out, "mod", &js_string(&self.modifier));
        push_var(&mut out, "is_framed", "false");
        push_var(&mut out, "is_live", if memento.live { "true" } else { "false" });
        push_var(&mut out, "coll", &js_string(&memento.collection));
        push_var(&mut out, "proxy_magic", &js_string(magic));
        push_var(
            &mut out,
            "static_prefix",
            &js_string(&format!("//{}/static/", magic)),
        );
        if let Some(mode) = decision.script.mode_flag() {
            push_var(&mut out, "wombat_mode", &js_string(mode));
        }
        out.push_str("</script>\n");

        if decision.script != ScriptVariant::None {
            out.push_str(&format!(
                "<script src=\"//{}/static/{}\"></script>\n",
                magic, PROXY_MODE_SCRIPT
            ));
        }

        if decision.inject_banner {
            out.push_str(&format!(
                "<script src=\"//{}/static/{}\"></script>\n",
                magic, BANNER_SCRIPT
            ));
            out.push_str(&format!(
                "<link rel=\"stylesheet\" href=\"//{}/static/{}\"/>\n",
                magic, BANNER_STYLESHEET
            ));
        }

        out.push_str(HEAD_INSERT_END);
        out
    }
}

/// Sets `Memento-Datetime` and `Link` from one descriptor.
pub fn add_memento_headers(headers: &mut HeaderMap, memento: &MementoDescriptor) {
    let name = HeaderName::from_static(MEMENTO_DATETIME);
    match HeaderValue::from_str(&memento.memento_datetime()) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => tracing::warn!("Invalid Memento-Datetime value: {}", e),
    }

    match HeaderValue::from_str(&memento.link_header()) {
        Ok(value) => {
            headers.insert(LINK, value);
        }
        Err(e) => tracing::warn!("Invalid Link value for {}: {}", memento.original_url, e),
    }
}

/// Copies `headers` without connection-level fields.
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let hop_by_hop = [
        CONNECTION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
    ];

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if hop_by_hop.contains(name)
            || name.as_str() == "keep-alive"
            || name.as_str() == "proxy-connection"
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Inserts `insert` right after the opening `<head>` tag.
///
/// Falls back to after `<html>`, then to the start of the document.
pub fn insert_into_head(body: &[u8], insert: &str) -> Bytes {
    let position = [&*HEAD_TAG, &*HTML_TAG]
        .iter()
        .find_map(|re| re.find(body))
        .map(|m| m.end())
        .unwrap_or(0);

    let mut out = Vec::with_capacity(body.len() + insert.len());
    out.extend_from_slice(&body[..position]);
    out.extend_from_slice(insert.as_bytes());
    out.extend_from_slice(&body[position..]);
    Bytes::from(out)
}

fn is_identity_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().is_empty() || v.trim().eq_ignore_ascii_case("identity"))
        .unwrap_or(true)
}

fn push_var(out: &mut String, name: &str, value: &str) {
    out.push_str("wbinfo.");
    out.push_str(name);
    out.push_str(" = ");
    out.push_str(value);
    out.push_str(";\n");
}

/// Quotes a string for a script block; `%XX` sequences are kept as is.
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string())
        .to_string()
        .replace("</", "<\\/")
}
