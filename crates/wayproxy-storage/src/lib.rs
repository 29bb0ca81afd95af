//! Wayproxy Storage - WARC archives with a SQLite capture index.
//!
//! This crate provides the archive store behind the proxy:
//!
//! - [`ArchiveStore`] / [`ArchiveWriter`], the interface the proxy uses
//! - [`FsArchiveStore`], collections on disk as gzipped WARC files plus a
//!   per-collection index database
//! - closest-capture selection by datetime
//!
//! # Example
//!
//! ```no_run
//! use wayproxy_storage::{ArchiveStore, FsArchiveStore};
//!
//! # async fn run() -> wayproxy_storage::Result<()> {
//! let store = FsArchiveStore::new("collections");
//! store.init_collection("pywb").await?;
//!
//! if let Some(capture) = store.lookup("pywb", "http://example.com/", None).await? {
//!     println!("{} captured at {}", capture.url, capture.datetime);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
mod fs_store;
pub mod index;
mod pool;
mod schema;
pub mod select;
mod store;
pub mod warc;

pub use error::{Result, StorageError};
pub use fs_store::{FsArchiveStore, FsArchiveWriter};
pub use pool::IndexPool;
pub use select::{select_closest, Candidate};
pub use store::{ArchiveStore, ArchiveWriter, ReindexSummary};
