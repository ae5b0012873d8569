//! The three-phase reconciliation run.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use super::{ReconcilerSettings, SyncError, SyncPhase, SyncReport};
use crate::catalog::ContentCatalog;
use crate::orchestrator::{DownloadOrchestrator, estimate_download_bytes};
use crate::session::SessionProvider;
use crate::storage::StorageAdvisor;
use crate::store::{MediaItemUpsert, RecordStore};

/// Watched fraction at which a downloaded item is eligible for eviction.
const EVICT_WATCHED_FRACTION: f64 = 0.9;

/// Candidates for acquisition must be watched less than this.
const CANDIDATE_MAX_WATCHED_FRACTION: f64 = 0.1;

/// Downloaded items watched less than this count toward the target duration.
const UNWATCHED_BELOW_FRACTION: f64 = 0.9;

/// Keeps the offline cache near its target.
pub struct SyncReconciler {
    store: RecordStore,
    catalog: Arc<dyn ContentCatalog>,
    orchestrator: Arc<DownloadOrchestrator>,
    storage: Arc<dyn StorageAdvisor>,
    session: Arc<dyn SessionProvider>,
    settings: ReconcilerSettings,
}

impl SyncReconciler {
    #[must_use]
    pub fn new(
        store: RecordStore,
        catalog: Arc<dyn ContentCatalog>,
        orchestrator: Arc<DownloadOrchestrator>,
        storage: Arc<dyn StorageAdvisor>,
        session: Arc<dyn SessionProvider>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            orchestrator,
            storage,
            session,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Runs catalog refresh, eviction, and acquisition once.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::PhasePanicked`] if a phase panicked. Ordinary phase
    /// failures are logged and reported in [`SyncReport::phase_errors`].
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        let mut panicked = None;
        let user_id = self.session.current_user_id();

        match &user_id {
            Some(user_id) => {
                match isolate(SyncPhase::CatalogRefresh, self.refresh_catalog(user_id)).await {
                    Ok(Ok(refreshed)) => report.refreshed = refreshed,
                    Ok(Err(e)) => {
                        warn!(error = %e, "catalog refresh failed, keeping cached items");
                        report.record_error(SyncPhase::CatalogRefresh, &e);
                    }
                    Err(phase) => panicked = Some(phase),
                }
            }
            None => info!("no signed-in user, skipping catalog refresh"),
        }

        match isolate(SyncPhase::Eviction, self.evict(&mut report)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "eviction failed");
                report.record_error(SyncPhase::Eviction, &e);
            }
            Err(phase) => panicked = panicked.or(Some(phase)),
        }

        match &user_id {
            Some(user_id) => {
                match isolate(SyncPhase::Acquisition, self.acquire(user_id)).await {
                    Ok(Ok(queued)) => report.queued = queued,
                    Ok(Err(e)) => {
                        warn!(error = %e, "acquisition failed");
                        report.record_error(SyncPhase::Acquisition, &e);
                    }
                    Err(phase) => panicked = panicked.or(Some(phase)),
                }
            }
            None => info!("no signed-in user, skipping acquisition"),
        }

        info!(
            refreshed = report.refreshed,
            evicted = report.evicted,
            queued = report.queued,
            failed_phases = report.phase_errors.len(),
            "sync run finished"
        );

        match panicked {
            Some(phase) => Err(SyncError::PhasePanicked { phase }),
            None => Ok(report),
        }
    }

    /// Phase 1: upsert up to `max_catalog_pages` pages of the user's catalog.
    async fn refresh_catalog(&self, user_id: &str) -> Result<usize, SyncError> {
        let mut refreshed = 0;
        let mut cursor: Option<String> = None;

        for page_number in 0..self.settings.max_catalog_pages {
            let page = self
                .catalog
                .fetch_items(user_id, self.settings.catalog_page_size, cursor.as_deref())
                .await?;
            for item in &page.items {
                self.store
                    .upsert_media_item(&MediaItemUpsert {
                        user_id,
                        id: &item.id,
                        duration_ticks: item.duration_ticks,
                        watched_fraction: item.watched_fraction,
                        added_at: item.added_at,
                    })
                    .await?;
            }
            refreshed += page.items.len();
            debug!(page = page_number, items = page.items.len(), "refreshed catalog page");

            match page.next_cursor {
                Some(next) if !page.items.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        info!(refreshed, "catalog refreshed");
        Ok(refreshed)
    }

    /// Phase 2: delete stale downloads, oldest completion first.
    async fn evict(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let started_low = self.storage.is_low();
        let mut low = started_low;

        for record in self.store.completed_downloads_oldest_first().await? {
            let media = self
                .store
                .get_media_item(&record.user_id, &record.media_item_id)
                .await?;
            let reason = match &media {
                None => "media item missing",
                Some(item) if item.watched_fraction >= EVICT_WATCHED_FRACTION => "watched",
                Some(_) if low => "storage low",
                Some(_) => continue,
            };

            if let Err(e) = self.orchestrator.evict(&record).await {
                warn!(download_id = %record.id, error = %e, "failed to evict download");
                continue;
            }
            report.evicted += 1;
            info!(download_id = %record.id, media_item_id = %record.media_item_id, reason, "evicted download");

            low = self.storage.is_low();
            if started_low && !low {
                debug!("storage pressure cleared, stopping eviction");
                break;
            }
        }
        Ok(())
    }

    /// Phase 3: queue new downloads toward the target duration.
    async fn acquire(&self, user_id: &str) -> Result<usize, SyncError> {
        if self.storage.is_low() {
            info!("storage low, skipping acquisition");
            return Ok(0);
        }

        let target = self.settings.target_duration_secs;
        let mut accumulated: u64 = self
            .store
            .downloaded_media_items(user_id)
            .await?
            .iter()
            .filter(|item| item.watched_fraction < UNWATCHED_BELOW_FRACTION)
            .map(|item| u64::try_from(item.duration_seconds()).unwrap_or(0))
            .sum();
        let candidates = self
            .store
            .acquisition_candidates(user_id, CANDIDATE_MAX_WATCHED_FRACTION)
            .await?;
        debug!(current_secs = accumulated, target, candidates = candidates.len(), "planning acquisition");

        let mut queued = 0;
        for candidate in candidates {
            if accumulated >= target || queued >= self.settings.max_new_per_run {
                break;
            }
            let estimate = estimate_download_bytes(candidate.duration_ticks);
            if !self.storage.has_space_for(estimate)? {
                info!(media_item_id = %candidate.id, estimate, "not enough space for next candidate");
                break;
            }

            match self.orchestrator.start(&candidate.id, true).await {
                Ok(download_id) => {
                    queued += 1;
                    accumulated += u64::try_from(candidate.duration_seconds()).unwrap_or(0);
                    debug!(download_id, media_item_id = %candidate.id, accumulated, "queued candidate");
                }
                Err(e) => {
                    warn!(media_item_id = %candidate.id, error = %e, "failed to start candidate, continuing");
                }
            }
        }

        info!(queued, accumulated_secs = accumulated, target, "acquisition finished");
        Ok(queued)
    }
}

/// Runs a phase, turning a panic into `Err(phase)`.
async fn isolate<T>(
    phase: SyncPhase,
    future: impl Future<Output = Result<T, SyncError>>,
) -> Result<Result<T, SyncError>, SyncPhase> {
    AssertUnwindSafe(future).catch_unwind().await.map_err(|_| {
        error!(%phase, "sync phase panicked");
        phase
    })
}
