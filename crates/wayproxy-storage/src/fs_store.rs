//! Filesystem archive store.
//!
//! ```text
//! <root>/<collection>/archive/rec-<timestamp>-<suffix>.warc.gz
//! <root>/<collection>/indexes/index.db
//! ```
//!
//! Each writer appends to its own archive file, created on first write. The
//! index is derived data: `reindex` rebuilds it from the archive files alone.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use wayproxy_core::timestamp::{now_seconds, to_timestamp14};
use wayproxy_core::{canonical_key, validate_collection_name, CaptureRecord};

use crate::error::{Result, StorageError};
use crate::index::{IndexRepo, NewIndexEntry};
use crate::pool::IndexPool;
use crate::select::select_closest;
use crate::store::{ArchiveStore, ArchiveWriter, ReindexSummary};
use crate::warc::{capture_to_records, decode_member, record_to_capture, MemberIter};

const ARCHIVE_DIR: &str = "archive";
const INDEX_DIR: &str = "indexes";
const INDEX_FILE: &str = "index.db";
const ARCHIVE_SUFFIX: &str = ".warc.gz";

/// Archive store rooted at a collections directory.
#[derive(Clone)]
pub struct FsArchiveStore {
    root: PathBuf,
    pools: Arc<Mutex<HashMap<String, IndexPool>>>,
}

impl std::fmt::Debug for FsArchiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsArchiveStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl FsArchiveStore {
    /// Creates a store over `root`. The directory is created on first use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pools: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The collections directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a collection's archive files.
    pub fn archive_dir(&self, collection: &str) -> PathBuf {
        self.root.join(collection).join(ARCHIVE_DIR)
    }

    fn index_path(&self, collection: &str) -> PathBuf {
        self.root.join(collection).join(INDEX_DIR).join(INDEX_FILE)
    }

    /// Copies an existing `.warc.gz` file into a collection.
    ///
    /// The index is not updated; call [`ArchiveStore::reindex`] afterwards.
    pub async fn add_archive(&self, collection: &str, source: &Path) -> Result<PathBuf> {
        self.ensure_collection(collection).await?;

        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| n.ends_with(ARCHIVE_SUFFIX))
            .ok_or_else(|| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("not a {} file: {}", ARCHIVE_SUFFIX, source.display()),
                ))
            })?;

        let dest = self.archive_dir(collection).join(name);
        if fs::try_exists(&dest).await? {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already in collection {}", name, collection),
            )));
        }

        fs::copy(source, &dest).await?;
        info!("Added {} to collection {}", name, collection);
        Ok(dest)
    }

    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        if self.has_collection(collection).await? {
            Ok(())
        } else {
            Err(StorageError::CollectionNotFound(collection.to_string()))
        }
    }

    /// Index pool for an existing collection, opened once and cached.
    fn pool(&self, collection: &str) -> Result<IndexPool> {
        let mut pools = self
            .pools
            .lock()
            .map_err(|_| StorageError::Unavailable("index cache poisoned".to_string()))?;

        if let Some(pool) = pools.get(collection) {
            return Ok(pool.clone());
        }

        let path = self.index_path(collection);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pool = IndexPool::open(&path)?;
        pools.insert(collection.to_string(), pool.clone());
        Ok(pool)
    }

    /// Opens a writer appending to `collection`.
    pub async fn writer(&self, collection: &str) -> Result<FsArchiveWriter> {
        let pool = self.existing_pool(collection).await?;
        Ok(FsArchiveWriter {
            collection: collection.to_string(),
            archive_dir: self.archive_dir(collection),
            pool,
            file: None,
            filename: String::new(),
            offset: 0,
            #[cfg(test)]
            fail_after: None,
        })
    }

    async fn existing_pool(&self, collection: &str) -> Result<IndexPool> {
        self.ensure_collection(collection).await?;
        let store = self.clone();
        let collection = collection.to_string();
        run_blocking(move || store.pool(&collection)).await
    }
}

#[async_trait]
impl ArchiveStore for FsArchiveStore {
    async fn init_collection(&self, collection: &str) -> Result<()> {
        validate_collection_name(collection)?;

        let dir = self.root.join(collection);
        if fs::try_exists(&dir).await? {
            return Err(StorageError::CollectionExists(collection.to_string()));
        }

        fs::create_dir_all(self.archive_dir(collection)).await?;
        fs::create_dir_all(dir.join(INDEX_DIR)).await?;
        self.existing_pool(collection).await?;

        info!("Created collection {} at {:?}", collection, dir);
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if !fs::try_exists(&self.root).await? {
            return Ok(names);
        }

        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_collection_name(&name).is_ok()
                && fs::try_exists(entry.path().join(ARCHIVE_DIR)).await?
            {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    async fn has_collection(&self, collection: &str) -> Result<bool> {
        if validate_collection_name(collection).is_err() {
            return Ok(false);
        }
        Ok(fs::try_exists(self.archive_dir(collection)).await?)
    }

    async fn lookup(
        &self,
        collection: &str,
        url: &str,
        datetime: Option<DateTime<Utc>>,
    ) -> Result<Option<CaptureRecord>> {
        let pool = self.existing_pool(collection).await?;
        let archive_dir = self.archive_dir(collection);
        let url = url.to_string();

        let found = run_blocking(move || lookup_blocking(&pool, &archive_dir, &url, datetime)).await?;
        debug!(
            "Lookup in {}: {}",
            collection,
            if found.is_some() { "hit" } else { "miss" }
        );
        Ok(found)
    }

    async fn open_writer(&self, collection: &str) -> Result<Box<dyn ArchiveWriter>> {
        Ok(Box::new(self.writer(collection).await?))
    }

    async fn reindex(&self, collection: &str) -> Result<ReindexSummary> {
        let pool = self.existing_pool(collection).await?;
        let archive_dir = self.archive_dir(collection);

        let summary = run_blocking(move || reindex_blocking(&pool, &archive_dir)).await?;
        info!(
            "Reindexed collection {}: {} files, {} records, {} skipped",
            collection, summary.files, summary.records, summary.skipped
        );
        Ok(summary)
    }
}

/// Writer appending to one archive file.
///
/// `offset` is the end of the last complete capture. Bytes past it belong to
/// a failed write and are cut off before the next one.
pub struct FsArchiveWriter {
    collection: String,
    archive_dir: PathBuf,
    pool: IndexPool,
    file: Option<File>,
    filename: String,
    offset: u64,
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl FsArchiveWriter {
    async fn file(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            let filename = new_archive_name();
            let file = OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(self.archive_dir.join(&filename))
                .await?;
            info!("Opened archive file {} in {}", filename, self.collection);
            self.filename = filename;
            self.offset = 0;
            self.file = Some(file);
        }

        self.file
            .as_mut()
            .ok_or_else(|| StorageError::Unavailable("archive file not open".to_string()))
    }

    async fn append(&mut self, data: &[u8]) -> Result<()> {
        #[cfg(test)]
        let fail_after = self.fail_after.take();

        let file = self.file().await?;

        #[cfg(test)]
        if let Some(written) = fail_after {
            file.write_all(&data[..written.min(data.len())]).await?;
            file.flush().await?;
            return Err(StorageError::Io(std::io::Error::other("short write")));
        }

        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Cuts the file back to the last complete capture. If that fails the
    /// file is abandoned and the next write starts a new one.
    async fn discard_partial(&mut self) {
        let Some(file) = self.file.as_mut() else {
            return;
        };

        match file.set_len(self.offset).await {
            Ok(()) => warn!(
                "Discarded partial capture in {} past offset {}",
                self.filename, self.offset
            ),
            Err(e) => {
                warn!(
                    "Cannot truncate {} ({}); continuing in a new archive file",
                    self.filename, e
                );
                self.file = None;
            }
        }
    }
}

#[async_trait]
impl ArchiveWriter for FsArchiveWriter {
    async fn write(&mut self, record: &CaptureRecord) -> Result<()> {
        let mut data = Vec::new();
        let mut response_member = None;

        for warc in capture_to_records(record) {
            let member = warc.to_gzip_member()?;
            if warc.warc_type() == Some("response") {
                response_member = Some((data.len() as u64, member.len() as u64));
            }
            data.extend_from_slice(&member);
        }

        if let Err(e) = self.append(&data).await {
            self.discard_partial().await;
            return Err(e);
        }

        let base = self.offset;
        self.offset += data.len() as u64;

        if let Some((offset, length)) = response_member {
            let entry = NewIndexEntry {
                urlkey: record.url_key(),
                timestamp: record.timestamp(),
                url: record.url.clone(),
                status: record.status.as_u16(),
                mime: record.mime(),
                filename: self.filename.clone(),
                offset: base + offset,
                length,
            };
            let pool = self.pool.clone();
            run_blocking(move || {
                let conn = pool.get()?;
                IndexRepo::insert(&conn, &entry)
            })
            .await?;
        }

        debug!("Wrote capture of {} to {}", record.url, self.filename);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
            info!("Closed archive file {} in {}", self.filename, self.collection);
        }
        Ok(())
    }
}

fn lookup_blocking(
    pool: &IndexPool,
    archive_dir: &Path,
    url: &str,
    datetime: Option<DateTime<Utc>>,
) -> Result<Option<CaptureRecord>> {
    let entries = {
        let conn = pool.get()?;
        IndexRepo::find_by_urlkey(&conn, &canonical_key(url))?
    };

    let Some(entry) = select_closest(&entries, datetime) else {
        return Ok(None);
    };

    let member = read_member(&archive_dir.join(&entry.filename), entry.offset, entry.length)?;
    let record = decode_member(&member)
        .and_then(|warc| record_to_capture(&warc))
        .map_err(|reason| StorageError::MalformedRecord {
            file: entry.filename.clone(),
            offset: entry.offset,
            reason,
        })?;

    Ok(Some(record))
}

fn read_member(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn reindex_blocking(pool: &IndexPool, archive_dir: &Path) -> Result<ReindexSummary> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(archive_dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(ARCHIVE_SUFFIX) {
                files.push(name.to_string());
            }
        }
    }
    files.sort();

    let mut summary = ReindexSummary::default();
    let mut rows = Vec::new();

    for filename in &files {
        let data = std::fs::read(archive_dir.join(filename))?;
        summary.files += 1;

        for member in MemberIter::new(&data) {
            match member {
                Ok((offset, length, warc)) => {
                    if warc.warc_type() != Some("response") {
                        continue;
                    }
                    match record_to_capture(&warc) {
                        Ok(capture) => rows.push(NewIndexEntry {
                            urlkey: capture.url_key(),
                            timestamp: capture.timestamp(),
                            url: capture.url.clone(),
                            status: capture.status.as_u16(),
                            mime: capture.mime(),
                            filename: filename.clone(),
                            offset,
                            length,
                        }),
                        Err(reason) => {
                            warn!("Skipping record in {} at {}: {}", filename, offset, reason);
                            summary.skipped += 1;
                        }
                    }
                }
                Err((offset, reason)) => {
                    warn!("Stopping at {} offset {}: {}", filename, offset, reason);
                    summary.skipped += 1;
                }
            }
        }
    }

    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    IndexRepo::clear(&tx)?;
    for row in &rows {
        IndexRepo::insert(&tx, row)?;
    }
    tx.commit()?;

    summary.records = rows.len();
    Ok(summary)
}

fn new_archive_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!(
        "rec-{}-{}{}",
        to_timestamp14(&now_seconds()),
        suffix.to_ascii_lowercase(),
        ARCHIVE_SUFFIX
    )
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Unavailable(format!("blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use http::header::CONTENT_TYPE;
    use http::{HeaderMap, StatusCode};
    use tempfile::TempDir;
    use wayproxy_core::CapturedRequest;

    fn capture(url: &str, y: i32, mo: u32, d: u32, body: &str) -> CaptureRecord {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "text/html".parse().unwrap());
        CaptureRecord::new(
            url,
            Utc.with_ymd_and_hms(y, mo, d, 12, 0, 0).unwrap(),
            StatusCode::OK,
            headers,
            body.to_string(),
        )
        .with_request(CapturedRequest::get("/"))
    }

    async fn store_with_collection(name: &str) -> (TempDir, FsArchiveStore) {
        let dir = TempDir::new().unwrap();
        let store = FsArchiveStore::new(dir.path().join("collections"));
        store.init_collection(name).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn init_and_list() {
        let (_dir, store) = store_with_collection("pywb").await;
        store.init_collection("test").await.unwrap();

        assert_eq!(store.list_collections().await.unwrap(), vec!["pywb", "test"]);
        assert!(store.has_collection("pywb").await.unwrap());
        assert!(!store.has_collection("missing").await.unwrap());
    }

    #[tokio::test]
    async fn init_rejects_duplicates_and_bad_names() {
        let (_dir, store) = store_with_collection("pywb").await;

        assert!(matches!(
            store.init_collection("pywb").await,
            Err(StorageError::CollectionExists(_))
        ));
        assert!(matches!(
            store.init_collection("../evil").await,
            Err(StorageError::InvalidCollection(_))
        ));
    }

    #[tokio::test]
    async fn list_without_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FsArchiveStore::new(dir.path().join("nothing"));
        assert!(store.list_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_collection_is_not_found() {
        let (_dir, store) = store_with_collection("pywb").await;

        let err = store
            .lookup("missing", "http://example.com/", None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.open_writer("missing").await.is_err());
    }

    #[tokio::test]
    async fn append_then_lookup() {
        let (_dir, store) = store_with_collection("pywb").await;

        store
            .append("pywb", &capture("http://example.com/", 2014, 1, 27, "Example Domain"))
            .await
            .unwrap();

        let found = store
            .lookup("pywb", "http://example.com/", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.url, "http://example.com/");
        assert_eq!(found.body, "Example Domain");
        assert_eq!(found.status, StatusCode::OK);

        assert!(store
            .lookup("pywb", "http://example.org/", None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn lookup_selects_closest() {
        let (_dir, store) = store_with_collection("pywb").await;
        let mut writer = store.open_writer("pywb").await.unwrap();
        writer
            .write(&capture("http://example.com/", 2013, 7, 29, "old"))
            .await
            .unwrap();
        writer
            .write(&capture("http://example.com/", 2014, 1, 27, "new"))
            .await
            .unwrap();
        writer.close().await.unwrap();

        let latest = store
            .lookup("pywb", "http://example.com/", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.body, "new");

        let target = Utc.with_ymd_and_hms(2013, 12, 1, 0, 0, 0).unwrap();
        let older = store
            .lookup("pywb", "http://example.com/", Some(target))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(older.body, "old");

        let early = Utc.with_ymd_and_hms(2011, 1, 1, 0, 0, 0).unwrap();
        let first = store
            .lookup("pywb", "http://example.com/", Some(early))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.body, "old");
    }

    #[tokio::test]
    async fn userinfo_and_www_share_key() {
        let (_dir, store) = store_with_collection("pywb").await;
        store
            .append("pywb", &capture("http://test@example.com/", 2013, 7, 29, "userinfo"))
            .await
            .unwrap();

        let found = store
            .lookup("pywb", "http://www.example.com/", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.url, "http://test@example.com/");
    }

    #[tokio::test]
    async fn reindex_rebuilds_from_archives() {
        let (_dir, store) = store_with_collection("pywb").await;
        let mut writer = store.open_writer("pywb").await.unwrap();
        writer
            .write(&capture("http://example.com/", 2014, 1, 27, "a"))
            .await
            .unwrap();
        writer
            .write(&capture("http://example.com/b", 2014, 1, 27, "b"))
            .await
            .unwrap();
        writer.close().await.unwrap();

        // drop the index; lookups miss until reindexed
        {
            let pool = store.pool("pywb").unwrap();
            let conn = pool.get().unwrap();
            IndexRepo::clear(&conn).unwrap();
        }
        assert!(store
            .lookup("pywb", "http://example.com/b", None)
            .await
            .unwrap()
            .is_none());

        let summary = store.reindex("pywb").await.unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(summary.records, 2);
        assert_eq!(summary.skipped, 0);

        let found = store
            .lookup("pywb", "http://example.com/b", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.body, "b");
    }

    #[tokio::test]
    async fn reindex_tolerates_truncated_tail() {
        let (_dir, store) = store_with_collection("pywb").await;
        store
            .append("pywb", &capture("http://example.com/", 2014, 1, 27, "ok"))
            .await
            .unwrap();

        let archive = store.archive_dir("pywb");
        let mut names: Vec<_> = std::fs::read_dir(&archive)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        let path = names.pop().unwrap();

        let extra = capture("http://example.com/cut", 2014, 1, 27, "cut");
        let member = capture_to_records(&extra)[0].to_gzip_member().unwrap();
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&member[..member.len() / 2]);
        std::fs::write(&path, data).unwrap();

        let summary = store.reindex("pywb").await.unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.skipped, 1);
        assert!(store
            .lookup("pywb", "http://example.com/", None)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn failed_write_leaves_no_partial_capture() {
        let (_dir, store) = store_with_collection("pywb").await;
        let mut writer = store.writer("pywb").await.unwrap();

        writer
            .write(&capture("http://example.com/a", 2014, 1, 27, "a"))
            .await
            .unwrap();
        let good_len = writer.offset;

        writer.fail_after = Some(40);
        assert!(writer
            .write(&capture("http://example.com/lost", 2014, 1, 27, "lost"))
            .await
            .is_err());
        assert_eq!(writer.offset, good_len);

        writer
            .write(&capture("http://example.com/c", 2014, 1, 27, "c"))
            .await
            .unwrap();
        writer.close().await.unwrap();

        let path = store.archive_dir("pywb").join(&writer.filename);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), writer.offset);

        let found = store
            .lookup("pywb", "http://example.com/c", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.body, "c");
        assert!(store
            .lookup("pywb", "http://example.com/lost", None)
            .await
            .unwrap()
            .is_none());

        let summary = store.reindex("pywb").await.unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test]
    async fn add_archive_copies_and_reindexes() {
        let (dir, store) = store_with_collection("source").await;
        store
            .append("source", &capture("http://example.com/", 2014, 1, 27, "imported"))
            .await
            .unwrap();
        let source_file = std::fs::read_dir(store.archive_dir("source"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();

        let other = FsArchiveStore::new(dir.path().join("other"));
        other.init_collection("pywb").await.unwrap();
        other.add_archive("pywb", &source_file).await.unwrap();
        assert!(other.add_archive("pywb", &source_file).await.is_err());

        other.reindex("pywb").await.unwrap();
        let found = other
            .lookup("pywb", "http://example.com/", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.body, "imported");
    }

    #[tokio::test]
    async fn add_archive_rejects_other_files() {
        let (dir, store) = store_with_collection("pywb").await;
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "x").unwrap();
        assert!(store.add_archive("pywb", &path).await.is_err());
    }

    #[test]
    fn archive_names_are_unique() {
        let a = new_archive_name();
        let b = new_archive_name();
        assert_ne!(a, b);
        assert!(a.starts_with("rec-"));
        assert!(a.ends_with(".warc.gz"));
    }
}
