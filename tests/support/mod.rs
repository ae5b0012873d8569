//! Shared fakes and fixtures for integration tests.
//!
//! Each test binary compiles this module separately and uses a different subset.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use offline_cache_core::store::TICKS_PER_SECOND;
use offline_cache_core::{
    CatalogError, CatalogItem, CatalogPage, ContentCatalog, Database, DownloadOrchestrator,
    DownloadPaths, DurableScheduler, MediaItemUpsert, RecordStore, SchedulerError,
    StaticSession, StorageAdvisor, StorageError, TaskScheduler, WorkHandle, WorkRequest,
    WorkState,
};
use tempfile::TempDir;
use tokio::sync::watch;
use url::Url;

pub const USER: &str = "user-1";

/// Plenty of room for any test video.
pub const AMPLE_FREE_BYTES: u64 = 1 << 40;

/// Ticks for a whole number of seconds.
pub fn ticks(seconds: i64) -> i64 {
    seconds * TICKS_PER_SECOND
}

/// Storage advisor with scripted answers.
///
/// `is_low` pops from a queue of scripted answers and falls back to a fixed
/// value once the queue is empty.
#[derive(Debug)]
pub struct FakeStorage {
    free_bytes: AtomicU64,
    low_default: AtomicBool,
    low_script: Mutex<VecDeque<bool>>,
    low_queries: AtomicUsize,
}

impl FakeStorage {
    pub fn new(free_bytes: u64) -> Self {
        Self {
            free_bytes: AtomicU64::new(free_bytes),
            low_default: AtomicBool::new(false),
            low_script: Mutex::new(VecDeque::new()),
            low_queries: AtomicUsize::new(0),
        }
    }

    pub fn set_free_bytes(&self, bytes: u64) {
        self.free_bytes.store(bytes, Ordering::SeqCst);
    }

    pub fn set_low(&self, low: bool) {
        self.low_default.store(low, Ordering::SeqCst);
    }

    /// Answers for the next `is_low` calls, in order.
    pub fn script_low(&self, answers: &[bool]) {
        let mut script = self.low_script.lock().unwrap();
        script.clear();
        script.extend(answers.iter().copied());
    }

    pub fn low_queries(&self) -> usize {
        self.low_queries.load(Ordering::SeqCst)
    }
}

impl StorageAdvisor for FakeStorage {
    fn free_bytes(&self) -> Result<u64, StorageError> {
        Ok(self.free_bytes.load(Ordering::SeqCst))
    }

    fn is_low(&self) -> bool {
        self.low_queries.fetch_add(1, Ordering::SeqCst);
        self.low_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.low_default.load(Ordering::SeqCst))
    }
}

/// In-memory catalog serving fixed pages and streaming from `stream_base`.
#[derive(Debug)]
pub struct FakeCatalog {
    pages: Vec<CatalogPage>,
    fail: bool,
    stream_base: Url,
    fetches: AtomicUsize,
}

impl FakeCatalog {
    pub fn new(stream_base: &str) -> Self {
        Self {
            pages: Vec::new(),
            fail: false,
            stream_base: Url::parse(stream_base).unwrap(),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Serves `items` in a single page.
    pub fn with_items(mut self, items: Vec<CatalogItem>) -> Self {
        self.pages = vec![CatalogPage {
            items,
            next_cursor: None,
        }];
        self
    }

    /// Serves `pages`, chaining them with cursors `"1"`, `"2"`, ...
    pub fn with_pages(mut self, pages: Vec<Vec<CatalogItem>>) -> Self {
        let count = pages.len();
        self.pages = pages
            .into_iter()
            .enumerate()
            .map(|(index, items)| CatalogPage {
                items,
                next_cursor: (index + 1 < count).then(|| (index + 1).to_string()),
            })
            .collect();
        self
    }

    /// Every fetch fails with a server error.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentCatalog for FakeCatalog {
    async fn fetch_items(
        &self,
        _user_id: &str,
        _page_size: u32,
        cursor: Option<&str>,
    ) -> Result<CatalogPage, CatalogError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CatalogError::HttpStatus {
                url: self.stream_base.to_string(),
                status: 503,
            });
        }
        let index = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        Ok(self.pages.get(index).cloned().unwrap_or_default())
    }

    fn stream_url(&self, media_item_id: &str) -> Result<Url, CatalogError> {
        let mut url = self.stream_base.clone();
        url.path_segments_mut()
            .map_err(|()| CatalogError::invalid_endpoint(self.stream_base.as_str()))?
            .pop_if_empty()
            .extend(["videos", media_item_id, "stream"]);
        Ok(url)
    }
}

pub fn catalog_item(id: &str, seconds: i64, watched: f64) -> CatalogItem {
    CatalogItem {
        id: id.to_string(),
        duration_ticks: ticks(seconds),
        watched_fraction: watched,
        added_at: None,
    }
}

/// Scheduler whose every call fails, for compensation paths.
#[derive(Debug, Default)]
pub struct UnavailableScheduler;

#[async_trait]
impl TaskScheduler for UnavailableScheduler {
    async fn enqueue_unique(&self, _request: WorkRequest) -> Result<WorkHandle, SchedulerError> {
        Err(SchedulerError::PoolClosed)
    }

    async fn cancel(&self, _handle: &WorkHandle) -> Result<bool, SchedulerError> {
        Err(SchedulerError::PoolClosed)
    }

    async fn cancel_by_tag(&self, _tag: &str) -> Result<u64, SchedulerError> {
        Err(SchedulerError::PoolClosed)
    }

    async fn observe(
        &self,
        _handle: &WorkHandle,
    ) -> Result<watch::Receiver<WorkState>, SchedulerError> {
        Err(SchedulerError::PoolClosed)
    }
}

/// Orchestrator wired to a real store and scheduler on one database.
pub struct Harness {
    pub store: RecordStore,
    pub scheduler: DurableScheduler,
    pub storage: Arc<FakeStorage>,
    pub session: Arc<StaticSession>,
    pub paths: DownloadPaths,
    pub orchestrator: Arc<DownloadOrchestrator>,
    pub dir: TempDir,
}

impl Harness {
    /// In-memory database, signed in as [`USER`], ample free space.
    pub async fn new() -> Self {
        let db = Database::new_in_memory().await.unwrap();
        Self::with_database(db, TempDir::new().unwrap()).await
    }

    /// File-backed database, for tests that need several pooled connections.
    pub async fn file_backed() -> Self {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("cache.db")).await.unwrap();
        Self::with_database(db, dir).await
    }

    async fn with_database(db: Database, dir: TempDir) -> Self {
        let store = RecordStore::new(db.clone());
        let scheduler = DurableScheduler::new(db);
        let storage = Arc::new(FakeStorage::new(AMPLE_FREE_BYTES));
        let session = Arc::new(StaticSession::signed_in(USER));
        let paths = DownloadPaths::new(dir.path().join("videos"));

        let orchestrator = Arc::new(DownloadOrchestrator::new(
            store.clone(),
            Arc::new(scheduler.clone()),
            storage.clone(),
            session.clone(),
            paths.clone(),
        ));

        Self {
            store,
            scheduler,
            storage,
            session,
            paths,
            orchestrator,
            dir,
        }
    }

    /// Orchestrator sharing this harness's store but using `scheduler`.
    pub fn orchestrator_with(&self, scheduler: Arc<dyn TaskScheduler>) -> DownloadOrchestrator {
        DownloadOrchestrator::new(
            self.store.clone(),
            scheduler,
            self.storage.clone(),
            self.session.clone(),
            self.paths.clone(),
        )
    }

    /// Caches a media item for [`USER`].
    pub async fn add_item(&self, id: &str, seconds: i64, watched: f64) {
        self.add_item_at(id, seconds, watched, None).await;
    }

    /// Caches a media item for [`USER`] with an explicit `added_at`.
    pub async fn add_item_at(&self, id: &str, seconds: i64, watched: f64, added_at: Option<i64>) {
        self.store
            .upsert_media_item(&MediaItemUpsert {
                user_id: USER,
                id,
                duration_ticks: ticks(seconds),
                watched_fraction: watched,
                added_at,
            })
            .await
            .unwrap();
    }

    /// Starts and completes a download as a transfer would, writing a file.
    pub async fn complete_item(&self, media_item_id: &str) -> String {
        let id = self.orchestrator.start(media_item_id, true).await.unwrap();
        self.paths.ensure_user_dir(USER).await.unwrap();
        let path = self.paths.final_path(USER, media_item_id);
        tokio::fs::write(&path, b"video").await.unwrap();
        assert!(
            self.store
                .complete_download(&id, &path.to_string_lossy(), 5)
                .await
                .unwrap()
        );
        id
    }
}
