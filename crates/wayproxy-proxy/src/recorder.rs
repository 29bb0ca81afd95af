//! Live capture recording.
//!
//! A [`SessionRecorder`] records into one collection. Captures are handed to
//! a single background writer task over a bounded channel, so concurrent
//! requests never write to the archive at the same time and the client never
//! waits on archive IO. The writer opens its archive file on the first
//! capture and keeps it until [`SessionRecorder::close`].
//!
//! A response is recorded through a [`PendingCapture`]: chunks are pushed as
//! they are forwarded to the client, and the capture is queued only once the
//! body has ended cleanly. Dropping a pending capture discards it.

use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use http::header::{HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use wayproxy_core::timestamp::now_seconds;
use wayproxy_core::{CaptureRecord, CapturedRequest, MementoDescriptor};
use wayproxy_storage::{ArchiveStore, ArchiveWriter, StorageError};

use crate::error::RecorderError;
use crate::inject::strip_hop_by_hop;

/// Captures queued ahead of the writer before `commit` waits.
const WRITE_QUEUE_DEPTH: usize = 64;

enum WriteCommand {
    Append(Box<CaptureRecord>),
    /// Acked with the number of failed writes since the previous flush.
    Flush(oneshot::Sender<usize>),
}

enum RecorderState {
    Idle,
    Open(mpsc::Sender<WriteCommand>),
    Closed,
}

/// Counters shared with the writer task.
#[derive(Debug, Default)]
struct Counters {
    recorded: AtomicUsize,
    written: AtomicUsize,
    failed: AtomicUsize,
}

/// Records live responses into one collection.
pub struct SessionRecorder {
    store: Arc<dyn ArchiveStore>,
    collection: String,
    state: Mutex<RecorderState>,
    /// Resolves to the failures no flush has reported yet.
    task: Mutex<Option<JoinHandle<Result<usize, StorageError>>>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for SessionRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecorder")
            .field("collection", &self.collection)
            .field("recorded", &self.recorded_count())
            .field("failed", &self.failed_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionRecorder {
    /// Creates a recorder for `collection`. Nothing is opened until the
    /// first capture.
    pub fn new(store: Arc<dyn ArchiveStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
            state: Mutex::new(RecorderState::Idle),
            task: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Collection being recorded into.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Captures accepted so far.
    pub fn recorded_count(&self) -> usize {
        self.counters.recorded.load(Ordering::SeqCst)
    }

    /// Captures written to the archive so far.
    pub fn written_count(&self) -> usize {
        self.counters.written.load(Ordering::SeqCst)
    }

    /// Accepted captures the archive failed to store.
    pub fn failed_count(&self) -> usize {
        self.counters.failed.load(Ordering::SeqCst)
    }

    /// Whether [`SessionRecorder::close`] has been called.
    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), RecorderState::Closed)
    }

    fn sender(&self) -> Result<mpsc::Sender<WriteCommand>, RecorderError> {
        let mut state = self.state.lock();
        match &*state {
            RecorderState::Open(tx) => Ok(tx.clone()),
            RecorderState::Closed => Err(RecorderError::Closed),
            RecorderState::Idle => {
                let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
                let handle = tokio::spawn(run_writer(
                    self.store.clone(),
                    self.collection.clone(),
                    rx,
                    self.counters.clone(),
                ));
                *self.task.lock() = Some(handle);
                *state = RecorderState::Open(tx.clone());
                Ok(tx)
            }
        }
    }

    /// Starts recording a response whose head has arrived.
    ///
    /// The capture datetime is taken now. Fails only if the recorder is
    /// closed.
    pub fn begin(
        &self,
        request: CapturedRequest,
        url: &str,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Result<PendingCapture, RecorderError> {
        let tx = self.sender()?;

        let mut headers = strip_hop_by_hop(headers);
        headers.remove(TRANSFER_ENCODING);

        Ok(PendingCapture {
            tx,
            counters: self.counters.clone(),
            collection: self.collection.clone(),
            request,
            url: url.to_string(),
            datetime: now_seconds(),
            status,
            headers,
            body: BytesMut::new(),
        })
    }

    /// Records one response.
    ///
    /// Consumes `body` to the end and queues the capture. If the stream
    /// fails, or this future is dropped first, nothing is recorded.
    pub async fn record<S, E>(
        &self,
        request: CapturedRequest,
        url: &str,
        status: StatusCode,
        headers: &HeaderMap,
        mut body: S,
    ) -> Result<CaptureRecord, RecorderError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let mut capture = self.begin(request, url, status, headers)?;

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => capture.push(&chunk),
                Err(e) => {
                    warn!("Aborted capture of {}: {}", url, e);
                    return Err(RecorderError::Aborted(e.to_string()));
                }
            }
        }

        capture.commit().await
    }

    /// Waits until every capture queued so far has been handled.
    ///
    /// Returns [`RecorderError::WriteFailed`] if any capture queued since the
    /// previous flush could not be written.
    pub async fn flush(&self) -> Result<(), RecorderError> {
        let tx = match &*self.state.lock() {
            RecorderState::Open(tx) => tx.clone(),
            RecorderState::Idle => return Ok(()),
            RecorderState::Closed => return Err(RecorderError::Closed),
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(WriteCommand::Flush(ack_tx))
            .await
            .map_err(|_| RecorderError::Closed)?;

        match ack_rx.await.map_err(|_| RecorderError::Closed)? {
            0 => Ok(()),
            failed => Err(RecorderError::WriteFailed(failed)),
        }
    }

    /// Flushes pending captures and releases the archive file.
    ///
    /// Safe to call repeatedly or concurrently; only the first call does the
    /// work, later ones return `Ok(())`. Captures already being recorded when
    /// close starts are still written. Write failures no flush has reported,
    /// and a failure to finalize the file, are returned; the file is released
    /// regardless.
    pub async fn close(&self) -> Result<(), RecorderError> {
        let previous = std::mem::replace(&mut *self.state.lock(), RecorderState::Closed);
        drop(previous);

        let Some(handle) = self.task.lock().take() else {
            return Ok(());
        };

        match handle.await {
            Ok(Ok(0)) => {
                info!(
                    "Recorder for {} closed after {} captures",
                    self.collection,
                    self.written_count()
                );
                Ok(())
            }
            Ok(Ok(failed)) => {
                error!(
                    "Recorder for {} closed; {} captures were not written",
                    self.collection, failed
                );
                Err(RecorderError::WriteFailed(failed))
            }
            Ok(Err(e)) => {
                error!("Recorder for {} failed to close cleanly: {}", self.collection, e);
                Err(RecorderError::Store(e))
            }
            Err(e) => Err(RecorderError::Store(StorageError::Unavailable(format!(
                "writer task failed: {}",
                e
            )))),
        }
    }
}

/// A response being recorded while it is forwarded.
pub struct PendingCapture {
    tx: mpsc::Sender<WriteCommand>,
    counters: Arc<Counters>,
    collection: String,
    request: CapturedRequest,
    url: String,
    datetime: DateTime<Utc>,
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
}

impl std::fmt::Debug for PendingCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCapture")
            .field("url", &self.url)
            .field("datetime", &self.datetime)
            .field("buffered", &self.body.len())
            .finish_non_exhaustive()
    }
}

impl PendingCapture {
    /// URL being recorded.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Datetime the capture will be stored under.
    pub fn datetime(&self) -> DateTime<Utc> {
        self.datetime
    }

    /// Memento headers for the live response.
    pub fn memento(&self) -> MementoDescriptor {
        MementoDescriptor::live_at(&self.url, self.datetime, &self.collection)
    }

    /// Appends a chunk of the response body.
    pub fn push(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    /// Queues the capture for writing.
    pub async fn commit(self) -> Result<CaptureRecord, RecorderError> {
        let Self {
            tx,
            counters,
            collection,
            request,
            url,
            datetime,
            status,
            mut headers,
            body,
        } = self;

        let body = body.freeze();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        let record = CaptureRecord::new(url, datetime, status, headers, body).with_request(request);

        tx.send(WriteCommand::Append(Box::new(record.clone())))
            .await
            .map_err(|_| RecorderError::Closed)?;
        counters.recorded.fetch_add(1, Ordering::SeqCst);
        debug!("Queued capture of {} for {}", record.url, collection);

        Ok(record)
    }
}

async fn run_writer(
    store: Arc<dyn ArchiveStore>,
    collection: String,
    mut rx: mpsc::Receiver<WriteCommand>,
    counters: Arc<Counters>,
) -> Result<usize, StorageError> {
    let mut writer: Option<Box<dyn ArchiveWriter>> = None;
    let mut unreported = 0;

    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Append(record) => {
                if writer.is_none() {
                    match store.open_writer(&collection).await {
                        Ok(w) => writer = Some(w),
                        Err(e) => {
                            error!("Cannot open archive for {}: {}", collection, e);
                            counters.failed.fetch_add(1, Ordering::SeqCst);
                            unreported += 1;
                            continue;
                        }
                    }
                }

                if let Some(w) = writer.as_mut() {
                    match w.write(&record).await {
                        Ok(()) => {
                            counters.written.fetch_add(1, Ordering::SeqCst);
                            info!("Recorded {} into {}", record.url, collection);
                        }
                        Err(e) => {
                            error!("Failed to record {}: {}", record.url, e);
                            counters.failed.fetch_add(1, Ordering::SeqCst);
                            unreported += 1;
                        }
                    }
                }
            }
            WriteCommand::Flush(ack) => {
                // an abandoned flush leaves its failures for the next one
                if let Err(failed) = ack.send(std::mem::take(&mut unreported)) {
                    unreported = failed;
                }
            }
        }
    }

    if let Some(mut w) = writer.take() {
        w.close().await?;
    }
    Ok(unreported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use http::header::CONTENT_TYPE;
    use tempfile::TempDir;
    use wayproxy_storage::{FsArchiveStore, ReindexSummary};

    fn html_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "text/html".parse().unwrap());
        headers.insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers
    }

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, String>> + Unpin {
        futures::stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    async fn fs_recorder(dir: &TempDir) -> (Arc<FsArchiveStore>, SessionRecorder) {
        let store = Arc::new(FsArchiveStore::new(dir.path()));
        store.init_collection("test").await.unwrap();
        let recorder = SessionRecorder::new(store.clone(), "test");
        (store, recorder)
    }

    fn archive_files(store: &FsArchiveStore) -> usize {
        std::fs::read_dir(store.archive_dir("test")).unwrap().count()
    }

    #[tokio::test]
    async fn record_writes_one_archive_file() {
        let dir = TempDir::new().unwrap();
        let (store, recorder) = fs_recorder(&dir).await;

        let record = recorder
            .record(
                CapturedRequest::get("/"),
                "http://example.com/",
                StatusCode::OK,
                &html_headers(),
                chunks(&["<html>", "httpbin(1)", "</html>"]),
            )
            .await
            .unwrap();

        assert_eq!(record.body, "<html>httpbin(1)</html>");
        assert!(record.headers.get(TRANSFER_ENCODING).is_none());
        assert_eq!(record.headers.get(CONTENT_LENGTH).unwrap(), "23");

        recorder.flush().await.unwrap();
        assert_eq!(recorder.written_count(), 1);
        assert_eq!(archive_files(&store), 1);

        let found = store
            .lookup("test", "http://example.com/", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.body, "<html>httpbin(1)</html>");

        recorder.close().await.unwrap();
    }

    #[tokio::test]
    async fn aborted_stream_records_nothing() {
        let dir = TempDir::new().unwrap();
        let (store, recorder) = fs_recorder(&dir).await;

        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"<html>")),
            Err("connection reset".to_string()),
        ]);
        let result = recorder
            .record(
                CapturedRequest::get("/"),
                "http://example.com/",
                StatusCode::OK,
                &html_headers(),
                body,
            )
            .await;

        assert!(matches!(result, Err(RecorderError::Aborted(_))));
        recorder.flush().await.unwrap();
        assert_eq!(recorder.recorded_count(), 0);
        assert_eq!(archive_files(&store), 0);
        recorder.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (_store, recorder) = fs_recorder(&dir).await;

        recorder
            .record(
                CapturedRequest::get("/"),
                "http://example.com/",
                StatusCode::OK,
                &html_headers(),
                chunks(&["x"]),
            )
            .await
            .unwrap();

        let (a, b) = tokio::join!(recorder.close(), recorder.close());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert!(recorder.close().await.is_ok());
        assert!(recorder.is_closed());
        assert_eq!(recorder.written_count(), 1);
    }

    #[tokio::test]
    async fn close_without_captures() {
        let dir = TempDir::new().unwrap();
        let (store, recorder) = fs_recorder(&dir).await;

        recorder.close().await.unwrap();
        assert_eq!(archive_files(&store), 0);
    }

    #[tokio::test]
    async fn record_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let (_store, recorder) = fs_recorder(&dir).await;
        recorder.close().await.unwrap();

        let result = recorder
            .record(
                CapturedRequest::get("/"),
                "http://example.com/",
                StatusCode::OK,
                &html_headers(),
                chunks(&["x"]),
            )
            .await;
        assert!(matches!(result, Err(RecorderError::Closed)));
        assert!(matches!(recorder.flush().await, Err(RecorderError::Closed)));
    }

    #[tokio::test]
    async fn concurrent_records_share_one_file() {
        let dir = TempDir::new().unwrap();
        let (store, recorder) = fs_recorder(&dir).await;
        let recorder = Arc::new(recorder);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let recorder = recorder.clone();
                tokio::spawn(async move {
                    let url = format!("http://example.com/{}", i);
                    recorder
                        .record(
                            CapturedRequest::get(format!("/{}", i)),
                            &url,
                            StatusCode::OK,
                            &HeaderMap::new(),
                            chunks(&["body"]),
                        )
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        recorder.close().await.unwrap();
        assert_eq!(recorder.written_count(), 8);
        assert_eq!(archive_files(&store), 1);
    }

    #[tokio::test]
    async fn dropped_pending_capture_records_nothing() {
        let dir = TempDir::new().unwrap();
        let (store, recorder) = fs_recorder(&dir).await;

        let mut capture = recorder
            .begin(
                CapturedRequest::get("/video"),
                "http://example.com/video",
                StatusCode::OK,
                &html_headers(),
            )
            .unwrap();
        capture.push(b"partial");
        assert!(capture.memento().live);
        drop(capture);

        recorder.flush().await.unwrap();
        assert_eq!(recorder.recorded_count(), 0);
        recorder.close().await.unwrap();
        assert_eq!(archive_files(&store), 0);
    }

    #[tokio::test]
    async fn pending_capture_commits_pushed_chunks() {
        let dir = TempDir::new().unwrap();
        let (store, recorder) = fs_recorder(&dir).await;

        let mut capture = recorder
            .begin(
                CapturedRequest::get("/clip.bin"),
                "http://example.com/clip.bin",
                StatusCode::OK,
                &HeaderMap::new(),
            )
            .unwrap();
        let datetime = capture.datetime();
        capture.push(b"abc");
        capture.push(b"def");
        let record = capture.commit().await.unwrap();

        assert_eq!(record.datetime, datetime);
        assert_eq!(record.headers.get(CONTENT_LENGTH).unwrap(), "6");

        recorder.flush().await.unwrap();
        let found = store
            .lookup("test", "http://example.com/clip.bin", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.body, "abcdef");
        recorder.close().await.unwrap();
    }

    /// Store whose writers fail on demand.
    #[derive(Default)]
    struct FlakyStore {
        fail_open: bool,
        fail_write: bool,
        fail_close: bool,
    }

    struct FlakyWriter {
        fail_write: bool,
        fail_close: bool,
    }

    #[async_trait]
    impl ArchiveWriter for FlakyWriter {
        async fn write(&mut self, _record: &CaptureRecord) -> wayproxy_storage::Result<()> {
            if self.fail_write {
                return Err(StorageError::Io(std::io::Error::other("no space left")));
            }
            Ok(())
        }

        async fn close(&mut self) -> wayproxy_storage::Result<()> {
            if self.fail_close {
                return Err(StorageError::Unavailable("disk full".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ArchiveStore for FlakyStore {
        async fn init_collection(&self, _collection: &str) -> wayproxy_storage::Result<()> {
            Ok(())
        }

        async fn list_collections(&self) -> wayproxy_storage::Result<Vec<String>> {
            Ok(vec!["test".into()])
        }

        async fn has_collection(&self, _collection: &str) -> wayproxy_storage::Result<bool> {
            Ok(true)
        }

        async fn lookup(
            &self,
            _collection: &str,
            _url: &str,
            _datetime: Option<DateTime<Utc>>,
        ) -> wayproxy_storage::Result<Option<CaptureRecord>> {
            Ok(None)
        }

        async fn open_writer(
            &self,
            _collection: &str,
        ) -> wayproxy_storage::Result<Box<dyn ArchiveWriter>> {
            if self.fail_open {
                return Err(StorageError::Unavailable("read-only filesystem".into()));
            }
            Ok(Box::new(FlakyWriter {
                fail_write: self.fail_write,
                fail_close: self.fail_close,
            }))
        }

        async fn reindex(&self, _collection: &str) -> wayproxy_storage::Result<ReindexSummary> {
            Ok(ReindexSummary::default())
        }
    }

    async fn record_one(recorder: &SessionRecorder) {
        recorder
            .record(
                CapturedRequest::get("/"),
                "http://example.com/",
                StatusCode::OK,
                &HeaderMap::new(),
                chunks(&["x"]),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn close_reports_error_and_still_releases() {
        let store = FlakyStore {
            fail_close: true,
            ..FlakyStore::default()
        };
        let recorder = SessionRecorder::new(Arc::new(store), "test");
        record_one(&recorder).await;

        assert!(matches!(recorder.close().await, Err(RecorderError::Store(_))));
        // handle already released; second close has nothing to do
        assert!(recorder.close().await.is_ok());
        assert!(recorder.is_closed());
    }

    #[tokio::test]
    async fn flush_reports_failed_writes() {
        let store = FlakyStore {
            fail_write: true,
            ..FlakyStore::default()
        };
        let recorder = SessionRecorder::new(Arc::new(store), "test");
        record_one(&recorder).await;
        record_one(&recorder).await;

        assert!(matches!(
            recorder.flush().await,
            Err(RecorderError::WriteFailed(2))
        ));
        assert_eq!(recorder.recorded_count(), 2);
        assert_eq!(recorder.written_count(), 0);
        assert_eq!(recorder.failed_count(), 2);

        // already reported
        recorder.flush().await.unwrap();
        recorder.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_reports_unflushed_open_failures() {
        let store = FlakyStore {
            fail_open: true,
            ..FlakyStore::default()
        };
        let recorder = SessionRecorder::new(Arc::new(store), "test");
        record_one(&recorder).await;

        assert!(matches!(
            recorder.close().await,
            Err(RecorderError::WriteFailed(1))
        ));
        assert_eq!(recorder.failed_count(), 1);
        assert!(recorder.is_closed());
    }
}
