//! Wayproxy Proxy - web archive replay/record MITM proxy.
//!
//! Clients use the gateway as an ordinary HTTP/HTTPS proxy. Every site they
//! visit is either replayed from an archive collection or fetched live and
//! recorded into one, and HTML responses get a small head insert that lets
//! client-side scripts know which capture they are looking at.
//!
//! ## Features
//!
//! - Generates a root CA on first run and reuses it afterwards
//! - Issues and caches one certificate per host, once, even under concurrency
//! - Replays the capture closest to `Accept-Datetime`, with Memento headers
//! - Records live traffic through a single-writer session recorder, streaming
//!   non-HTML bodies to the client as they arrive
//! - Serves the `proxy-fetch` / `proxy-worker` helpers on a reserved host
//!
//! ## Architecture
//!
//! ```text
//! Client ─► hudsucker (TLS via CertificateCache) ─► GatewayHandler ─► FrontEndRouter
//!                                                                        │
//!                     ┌──────────────────────┬───────────────────────────┤
//!                     │ Replay               │ Record                    │ Passthrough
//!                     ▼                      ▼                           ▼
//!               ArchiveStore          UpstreamClient ─► SessionRecorder  HelperEndpoints
//!                     │                      │
//!                     └──── InjectionPipeline ┘
//! ```

mod body;
mod ca;
mod cert_cache;
pub mod endpoints;
mod error;
mod handler;
pub mod inject;
mod proxy;
mod recorder;
pub mod router;
mod upstream;

pub use body::ResponseBody;
pub use ca::{CaManager, CaManagerError, RootIdentity};
pub use cert_cache::{CertificateCache, CertificateEntry};
pub use endpoints::{apply_cors, HelperEndpoints, HelperRoute, PROXY_WORKER_JS};
pub use error::{ProxyError, RecorderError, Result};
pub use handler::GatewayHandler;
pub use inject::{CorsPolicy, InjectionPipeline, RewriteDecision, ScriptVariant};
pub use proxy::{ProxyHandle, ProxyServer};
pub use recorder::{PendingCapture, SessionRecorder};
pub use router::{select_mode, FrontEndRouter, Mode, RouterSlot};
pub use upstream::UpstreamClient;
