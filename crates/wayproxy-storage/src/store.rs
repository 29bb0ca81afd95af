//! Archive store interface.
//!
//! The proxy only talks to archives through [`ArchiveStore`]. Collections are
//! named by [`wayproxy_core::validate_collection_name`]-valid strings; a
//! collection that does not exist is [`StorageError::CollectionNotFound`],
//! while a URL with no capture is simply `Ok(None)`.
//!
//! [`StorageError::CollectionNotFound`]: crate::StorageError::CollectionNotFound

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use wayproxy_core::CaptureRecord;

use crate::error::Result;

/// Outcome of rebuilding a collection index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReindexSummary {
    /// Archive files scanned.
    pub files: usize,
    /// Response records indexed.
    pub records: usize,
    /// Records or file tails that could not be read and were skipped.
    pub skipped: usize,
}

/// Persistent archive of captures, grouped into collections.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Creates an empty collection.
    async fn init_collection(&self, collection: &str) -> Result<()>;

    /// Names of all collections, sorted.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Whether a collection exists.
    async fn has_collection(&self, collection: &str) -> Result<bool>;

    /// Finds the capture of `url` closest to `datetime` (latest if `None`).
    async fn lookup(
        &self,
        collection: &str,
        url: &str,
        datetime: Option<DateTime<Utc>>,
    ) -> Result<Option<CaptureRecord>>;

    /// Opens a writer appending to `collection`.
    ///
    /// Records become visible to [`ArchiveStore::lookup`] as soon as
    /// [`ArchiveWriter::write`] returns.
    async fn open_writer(&self, collection: &str) -> Result<Box<dyn ArchiveWriter>>;

    /// Rebuilds the index of `collection` from its archive files.
    async fn reindex(&self, collection: &str) -> Result<ReindexSummary>;

    /// Appends a single capture.
    async fn append(&self, collection: &str, record: &CaptureRecord) -> Result<()> {
        let mut writer = self.open_writer(collection).await?;
        writer.write(record).await?;
        writer.close().await
    }
}

/// An open archive file accepting captures.
#[async_trait]
pub trait ArchiveWriter: Send {
    /// Writes one capture and indexes it.
    async fn write(&mut self, record: &CaptureRecord) -> Result<()>;

    /// Flushes and releases the file.
    async fn close(&mut self) -> Result<()>;
}
