//! Sync engine: fetch → extract → filter → dedupe → diff → upsert/deactivate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::warn;
use uuid::Uuid;

use rff_adapters::{dedupe, matches_building_filter, resolve_identities, Extractor, ExtractorConfig};
use rff_core::{GalleryImage, ListingRecord, LocalId, SyncPhase, SyncRun, SyncStats};
use rff_storage::{
    FetchError, FileLease, HttpClientConfig, HttpFetcher, ImageStore, JsonListingStore,
    ListingStore, LogLevel, ProgressChannel, RunLog, SyncLease, SyncLog,
};

pub const CRATE_NAME: &str = "rff-sync";

// ---------------------------------------------------------------------------
// Configuration

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Index page to scrape.
    pub source_list_url: String,
    /// Substring filter against address + title + unit; empty matches all.
    pub building_filter: String,
    /// Time of day (`HH:MM`) for the scheduled daily run.
    pub sync_schedule: String,
    /// Origin used to absolutize relative URLs; derived from
    /// `source_list_url` when unset.
    pub base_origin: Option<String>,
    pub gallery_cdn_marker: String,
    /// Fetch each new listing's detail page for the full photo gallery.
    pub fetch_detail_galleries: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub data_dir: PathBuf,
    pub images_dir: PathBuf,
    pub lease_ttl_secs: u64,
    /// A run with no progress write for this long is considered stalled
    /// and may be re-run by the watchdog.
    pub stale_after_secs: i64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("RFF_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        Self {
            source_list_url: std::env::var("RFF_LIST_URL")
                .unwrap_or_else(|_| "https://listings.example.com/listings".to_string()),
            building_filter: std::env::var("RFF_BUILDING_FILTER").unwrap_or_default(),
            sync_schedule: std::env::var("RFF_SYNC_SCHEDULE")
                .unwrap_or_else(|_| "06:00".to_string()),
            base_origin: std::env::var("RFF_BASE_ORIGIN").ok(),
            gallery_cdn_marker: std::env::var("RFF_GALLERY_CDN_MARKER")
                .unwrap_or_else(|_| "images.cdn.appfolio.com".to_string()),
            fetch_detail_galleries: std::env::var("RFF_FETCH_DETAIL_GALLERIES")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            user_agent: std::env::var("RFF_USER_AGENT")
                .unwrap_or_else(|_| HttpClientConfig::default().user_agent),
            http_timeout_secs: std::env::var("RFF_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            images_dir: std::env::var("RFF_IMAGES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("images")),
            data_dir,
            lease_ttl_secs: std::env::var("RFF_LEASE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15 * 60),
            stale_after_secs: std::env::var("RFF_STALE_AFTER_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        }
    }

    /// Overlay operator settings from a YAML file, when it exists.
    pub fn with_settings_file(mut self, path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(self),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let overlay: SettingsFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        if let Some(v) = overlay.source_list_url {
            self.source_list_url = v;
        }
        if let Some(v) = overlay.building_filter {
            self.building_filter = v;
        }
        if let Some(v) = overlay.sync_schedule {
            self.sync_schedule = v;
        }
        if let Some(v) = overlay.base_origin {
            self.base_origin = Some(v);
        }
        if let Some(v) = overlay.gallery_cdn_marker {
            self.gallery_cdn_marker = v;
        }
        if let Some(v) = overlay.fetch_detail_galleries {
            self.fetch_detail_galleries = v;
        }
        Ok(self)
    }

    fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            base_origin: self
                .base_origin
                .clone()
                .unwrap_or_else(|| origin_of(&self.source_list_url)),
            gallery_cdn_marker: self.gallery_cdn_marker.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SettingsFile {
    source_list_url: Option<String>,
    building_filter: Option<String>,
    sync_schedule: Option<String>,
    base_origin: Option<String>,
    gallery_cdn_marker: Option<String>,
    fetch_detail_galleries: Option<bool>,
}

/// `scheme://host` part of a URL, for absolutizing relative links.
fn origin_of(url: &str) -> String {
    if let Some(scheme_end) = url.find("://") {
        let rest = &url[scheme_end + 3..];
        match rest.find('/') {
            Some(path_start) => url[..scheme_end + 3 + path_start].to_string(),
            None => url.to_string(),
        }
    } else {
        url.trim_end_matches('/').to_string()
    }
}

// ---------------------------------------------------------------------------
// Fetcher seam

/// Page/binary fetch contract the reconciler depends on; implemented by
/// the real HTTP fetcher and by canned fixtures in tests.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError>;
    async fn fetch_binary(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        self.fetch_text(url).await
    }

    async fn fetch_binary(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.fetch_image(url).await
    }
}

// ---------------------------------------------------------------------------
// Image materializer

/// Ensures each referenced image exists exactly once in the blob store
/// (keyed by origin URL) and wires gallery rows onto listings.
pub struct ImageMaterializer {
    fetcher: Arc<dyn PageFetcher>,
    images: Arc<ImageStore>,
    store: Arc<dyn ListingStore>,
    log: Arc<SyncLog>,
}

impl ImageMaterializer {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        images: Arc<ImageStore>,
        store: Arc<dyn ListingStore>,
        log: Arc<SyncLog>,
    ) -> Self {
        Self {
            fetcher,
            images,
            store,
            log,
        }
    }

    /// Blob handle for `url`, downloading only on a cache miss. `None`
    /// means the image is skipped, never that the listing fails.
    pub async fn ensure_stored(&self, url: &str) -> Option<String> {
        if let Some(existing) = self.images.find_by_origin_url(url).await {
            self.log
                .append(
                    format!("Image already exists, reused: {}", tail_of(url)),
                    LogLevel::Info,
                )
                .await;
            return Some(existing.handle);
        }

        let bytes = match self.fetcher.fetch_binary(url).await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.log
                    .append(
                        format!("Failed to download image {}: {err}", tail_of(url)),
                        LogLevel::Error,
                    )
                    .await;
                return None;
            }
        };

        match self.images.store(url, &bytes).await {
            Ok(blob) => {
                self.log
                    .append(format!("Downloaded image: {}", tail_of(url)), LogLevel::Info)
                    .await;
                Some(blob.handle)
            }
            Err(err) => {
                self.log
                    .append(
                        format!("Failed to store image {}: {err:#}", tail_of(url)),
                        LogLevel::Error,
                    )
                    .await;
                None
            }
        }
    }

    /// Materialize every URL onto the listing's gallery. The first
    /// successfully stored image becomes primary iff the listing has no
    /// primary yet.
    pub async fn attach_gallery(&self, local_id: LocalId, urls: &[String]) -> usize {
        let mut stored = 0usize;
        let mut first_handle: Option<String> = None;
        for url in urls {
            let Some(handle) = self.ensure_stored(url).await else {
                continue;
            };
            let image = GalleryImage {
                source_url: url.clone(),
                blob_handle: handle.clone(),
                is_primary: false,
            };
            if let Err(err) = self.store.attach_gallery_image(local_id, image).await {
                self.log
                    .append(
                        format!("Failed to attach image {}: {err}", tail_of(url)),
                        LogLevel::Error,
                    )
                    .await;
                continue;
            }
            stored += 1;
            if first_handle.is_none() {
                first_handle = Some(handle);
            }
        }

        if let Some(handle) = first_handle {
            let has_primary = match self.store.gallery(local_id).await {
                Ok(gallery) => gallery.iter().any(|img| img.is_primary),
                Err(_) => false,
            };
            if !has_primary {
                if let Err(err) = self.store.set_primary(local_id, &handle).await {
                    self.log
                        .append(format!("Failed to set primary image: {err}"), LogLevel::Error)
                        .await;
                }
            }
        }

        stored
    }
}

fn tail_of(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

// ---------------------------------------------------------------------------
// Reconciler

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

enum UpsertOutcome {
    Created,
    Updated,
}

/// Releases the lease on every exit path, including early returns.
struct LeaseGuard<'a>(&'a dyn SyncLease);

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.0.release() {
            warn!(error = %err, "failed to release sync lease");
        }
    }
}

/// Drives one sync run through its phases:
/// `Fetching → Parsing → Diffing → Upserting → Deactivating → Finalizing`.
///
/// All collaborators are injected; the reconciler holds no global state
/// and registers no callbacks. Overlapping invocations are excluded by
/// the lease and kept harmless by the snapshot diff even when the lease
/// is bypassed.
pub struct Reconciler {
    config: SyncConfig,
    fetcher: Arc<dyn PageFetcher>,
    extractor: Extractor,
    store: Arc<dyn ListingStore>,
    materializer: ImageMaterializer,
    progress: Arc<ProgressChannel>,
    run_log: Arc<RunLog>,
    log: Arc<SyncLog>,
    lease: Arc<dyn SyncLease>,
}

impl Reconciler {
    pub fn new(
        config: SyncConfig,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn ListingStore>,
        images: Arc<ImageStore>,
        progress: Arc<ProgressChannel>,
        run_log: Arc<RunLog>,
        log: Arc<SyncLog>,
        lease: Arc<dyn SyncLease>,
    ) -> anyhow::Result<Self> {
        let extractor =
            Extractor::new(config.extractor_config()).context("building extractor")?;
        let materializer =
            ImageMaterializer::new(fetcher.clone(), images, store.clone(), log.clone());
        Ok(Self {
            config,
            fetcher,
            extractor,
            store,
            materializer,
            progress,
            run_log,
            log,
            lease,
        })
    }

    /// Build a reconciler with the default file-backed collaborators under
    /// `config.data_dir`.
    pub async fn from_config(config: SyncConfig) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
        })?;
        let store = JsonListingStore::open(&config.data_dir).await?;
        let images = ImageStore::open(&config.images_dir).await?;
        let progress = ProgressChannel::new(&config.data_dir);
        let run_log = RunLog::open(&config.data_dir).await?;
        let log = SyncLog::open(&config.data_dir).await?;
        let lease = FileLease::new(&config.data_dir);
        Self::new(
            config,
            Arc::new(fetcher),
            Arc::new(store),
            Arc::new(images),
            Arc::new(progress),
            Arc::new(run_log),
            Arc::new(log),
            Arc::new(lease),
        )
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ListingStore> {
        self.store.clone()
    }

    pub fn progress_channel(&self) -> Arc<ProgressChannel> {
        self.progress.clone()
    }

    pub fn run_log(&self) -> Arc<RunLog> {
        self.run_log.clone()
    }

    pub fn sync_log(&self) -> Arc<SyncLog> {
        self.log.clone()
    }

    /// Execute one full sync run.
    ///
    /// Returns the run record for both completed and failed runs; the only
    /// error is `AlreadyRunning` when a live lease is held elsewhere.
    pub async fn run(&self) -> Result<SyncRun, SyncError> {
        let ttl = Duration::from_secs(self.config.lease_ttl_secs);
        if !self.lease.acquire(ttl).map_err(SyncError::Other)? {
            self.log
                .append("Sync already in progress, skipping", LogLevel::Warning)
                .await;
            return Err(SyncError::AlreadyRunning);
        }
        let _guard = LeaseGuard(self.lease.as_ref());

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.progress.begin_run("Starting sync...");

        let mut stats = SyncStats::default();
        let phases = self.run_phases(&mut stats).await;

        // Finalizing: stats and history are persisted on success and
        // failure alike, and the lease guard releases on drop.
        let (final_phase, status_text) = match phases {
            Ok(()) => {
                self.progress
                    .publish(SyncPhase::Finalizing, 95, "Saving results...", true);
                (SyncPhase::Completed, "Sync completed successfully!".to_string())
            }
            Err(err) => {
                let text = format!("Error: {err:#}");
                self.log.append(format!("Sync error: {err:#}"), LogLevel::Error).await;
                stats.errors += 1;
                self.progress.publish(SyncPhase::Failed, 0, &text, false);
                (SyncPhase::Failed, text)
            }
        };

        stats.last_run = Some(Utc::now());
        if let Err(err) = self.progress.persist_stats(&stats).await {
            self.log
                .append(format!("Failed to persist stats: {err:#}"), LogLevel::Error)
                .await;
        }

        self.log
            .append(
                format!(
                    "Sync completed: {} created, {} updated, {} deactivated, {} errors",
                    stats.created, stats.updated, stats.deactivated, stats.errors
                ),
                LogLevel::Info,
            )
            .await;

        if final_phase == SyncPhase::Completed {
            self.progress
                .publish(SyncPhase::Completed, 100, &status_text, false);
        }

        let run = SyncRun {
            run_id,
            started_at,
            finished_at: Some(Utc::now()),
            created_count: stats.created,
            updated_count: stats.updated,
            deactivated_count: stats.deactivated,
            error_count: stats.errors,
            final_phase,
            status_text,
        };
        if let Err(err) = self.run_log.append(run.clone()).await {
            self.log
                .append(format!("Failed to append run history: {err:#}"), LogLevel::Error)
                .await;
        }

        Ok(run)
    }

    /// Watchdog entry point: re-run only when no run appears live.
    ///
    /// A run is live when progress says `still_running`, has moved past
    /// 0%, and was updated within the staleness window. Safe against a
    /// dead lease because `run` re-checks it and the diff is idempotent.
    pub async fn run_if_stale(&self) -> Result<Option<SyncRun>, SyncError> {
        let progress = self.progress.read();
        let age = self.progress.seconds_since_update();
        let live = progress.still_running
            && progress.percentage > 0
            && age <= self.config.stale_after_secs;
        if live {
            self.log
                .append(
                    format!(
                        "Fallback check: sync is already running ({}%), last update {age}s ago",
                        progress.percentage
                    ),
                    LogLevel::Info,
                )
                .await;
            return Ok(None);
        }

        let reason = if !progress.still_running {
            "idle".to_string()
        } else if progress.percentage == 0 {
            "not started".to_string()
        } else {
            format!("stalled {age}s")
        };
        self.log
            .append(format!("Running sync fallback - reason: {reason}"), LogLevel::Warning)
            .await;

        match self.run().await {
            Ok(run) => Ok(Some(run)),
            Err(SyncError::AlreadyRunning) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn run_phases(&self, stats: &mut SyncStats) -> anyhow::Result<()> {
        // Fetching. A failure here aborts before any mutation: no partial
        // deactivation can happen for listings that were never fetched.
        self.progress
            .publish(SyncPhase::Fetching, 10, "Fetching listings...", true);
        self.log
            .append(format!("Fetching from: {}", self.config.source_list_url), LogLevel::Info)
            .await;
        let html = self
            .fetcher
            .fetch_page(&self.config.source_list_url)
            .await
            .map_err(|err| anyhow::anyhow!("failed to fetch listings: {err}"))?;

        // Parsing
        self.progress
            .publish(SyncPhase::Parsing, 20, "Parsing listings...", true);
        let extraction = self.extractor.extract(&html);
        match extraction.selector_strategy {
            Some(strategy) => {
                self.log
                    .append(
                        format!(
                            "Found {} elements using strategy: {strategy}",
                            extraction.card_count
                        ),
                        LogLevel::Info,
                    )
                    .await;
            }
            None => {
                self.log
                    .append(
                        "No cards found with any selector strategy. HTML might be dynamically loaded or structure changed.",
                        LogLevel::Warning,
                    )
                    .await;
            }
        }

        let mut records = extraction.records;
        resolve_identities(&mut records);

        let extracted = records.len();
        records.retain(|record| matches_building_filter(record, &self.config.building_filter));
        if records.is_empty() && extracted > 0 && !self.config.building_filter.is_empty() {
            self.log
                .append(
                    format!(
                        "Building filter '{}' did not match any listings. Check the filter text matches the actual building names.",
                        self.config.building_filter
                    ),
                    LogLevel::Warning,
                )
                .await;
        }
        let records = dedupe(records);
        self.log
            .append(
                format!(
                    "Extracted {extracted} records, {} matched building filter",
                    records.len()
                ),
                LogLevel::Info,
            )
            .await;

        // Diffing: point-in-time snapshot of every known identity. The
        // run's own writes must not feed back into this set.
        self.progress
            .publish(SyncPhase::Diffing, 30, "Checking existing listings...", true);
        let mut known = self
            .store
            .all_keys_with_local_ids()
            .await
            .context("loading known source ids")?;

        if records.is_empty() && !known.is_empty() {
            self.log
                .append(
                    format!(
                        "Extracted 0 records while {} listings are known; every active listing will be deactivated",
                        known.len()
                    ),
                    LogLevel::Warning,
                )
                .await;
        }

        // Upserting: one record at a time, extraction order. A failed
        // record is counted and skipped, never aborts the run.
        let total = records.len();
        for (index, record) in records.iter().enumerate() {
            let processed = index + 1;
            let percentage = 30 + ((processed as f64 / total.max(1) as f64) * 50.0) as u8;
            self.progress.publish(
                SyncPhase::Upserting,
                percentage,
                &format!("Processing {processed} of {total} listings..."),
                true,
            );

            match self.upsert_record(record, &known).await {
                Ok(UpsertOutcome::Created) => stats.created += 1,
                Ok(UpsertOutcome::Updated) => stats.updated += 1,
                Err(err) => {
                    stats.errors += 1;
                    self.log
                        .append(format!("Failed to upsert listing: {err:#}"), LogLevel::Error)
                        .await;
                }
            }

            if let Some(source_id) = &record.source_id {
                known.remove(source_id);
            }
        }

        // Deactivating: every identity still in the snapshot disappeared
        // from the source. Flag inactive, never delete.
        self.progress
            .publish(SyncPhase::Deactivating, 85, "Deactivating stale listings...", true);
        let total_stale = known.len();
        let mut stale: Vec<(String, LocalId)> = known.into_iter().collect();
        stale.sort_by(|a, b| a.0.cmp(&b.0));
        for (done, (source_id, local_id)) in stale.into_iter().enumerate() {
            // Rows deactivated by an earlier run stay in the snapshot
            // forever; skipping them keeps repeat runs at zero new
            // deactivations.
            let already_inactive = matches!(
                self.store.get_by_key(&source_id).await,
                Ok(Some(listing)) if !listing.active
            );
            if !already_inactive {
                match self.store.set_active(local_id, false).await {
                    Ok(()) => stats.deactivated += 1,
                    Err(err) => {
                        stats.errors += 1;
                        self.log
                            .append(format!("Failed to deactivate listing: {err}"), LogLevel::Error)
                            .await;
                    }
                }
            }
            let percentage = 85 + (((done + 1) as f64 / total_stale as f64) * 10.0) as u8;
            self.progress.publish(
                SyncPhase::Deactivating,
                percentage,
                &format!("Deactivating {} of {total_stale} stale listings...", done + 1),
                true,
            );
        }

        Ok(())
    }

    async fn upsert_record(
        &self,
        record: &ListingRecord,
        known: &HashMap<String, LocalId>,
    ) -> anyhow::Result<UpsertOutcome> {
        // A record with no resolvable identity is upserted create-only
        // under a fresh identity; it can never match across runs.
        let (source_id, existed) = match &record.source_id {
            Some(id) => (id.clone(), known.contains_key(id)),
            None => (Uuid::new_v4().to_string(), false),
        };

        let local_id = self
            .store
            .upsert_by_key(&source_id, record)
            .await
            .with_context(|| format!("upserting listing {source_id}"))?;

        if existed {
            // Metadata refreshed only: image sets for a stable source_id
            // rarely change and re-fetching them is costly.
            return Ok(UpsertOutcome::Updated);
        }

        let urls = self.gallery_urls_for(record).await;
        if !urls.is_empty() {
            let stored = self.materializer.attach_gallery(local_id, &urls).await;
            self.log
                .append(
                    format!("Stored {stored} of {} images for {source_id}", urls.len()),
                    LogLevel::Info,
                )
                .await;
        }
        Ok(UpsertOutcome::Created)
    }

    /// Gallery URLs for a new listing: the detail page's full gallery when
    /// available, else the card's single image.
    async fn gallery_urls_for(&self, record: &ListingRecord) -> Vec<String> {
        if self.config.fetch_detail_galleries {
            if let Some(detail_url) = &record.detail_url {
                match self.fetcher.fetch_page(detail_url).await {
                    Ok(html) => {
                        let urls = self.extractor.extract_gallery(&html);
                        if !urls.is_empty() {
                            return urls;
                        }
                    }
                    Err(err) => {
                        self.log
                            .append(
                                format!("Failed to fetch detail page {detail_url}: {err}"),
                                LogLevel::Warning,
                            )
                            .await;
                    }
                }
            }
        }
        record.image_url.clone().into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Scheduling

/// 6-field cron expression for a daily `HH:MM` schedule.
pub fn cron_for_schedule(schedule: &str) -> anyhow::Result<String> {
    let (hours, minutes) = schedule
        .split_once(':')
        .with_context(|| format!("invalid sync schedule `{schedule}`, expected HH:MM"))?;
    let hours: u8 = hours
        .trim()
        .parse()
        .with_context(|| format!("invalid hour in sync schedule `{schedule}`"))?;
    let minutes: u8 = minutes
        .trim()
        .parse()
        .with_context(|| format!("invalid minute in sync schedule `{schedule}`"))?;
    anyhow::ensure!(
        hours < 24 && minutes < 60,
        "sync schedule `{schedule}` out of range"
    );
    Ok(format!("0 {minutes} {hours} * * *"))
}

/// Build the scheduler: the daily sync at the configured time plus a
/// per-minute watchdog tick that re-runs a stalled sync.
pub async fn build_scheduler(reconciler: Arc<Reconciler>) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let cron = cron_for_schedule(&reconciler.config().sync_schedule)?;
    let daily = reconciler.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let reconciler = daily.clone();
        Box::pin(async move {
            match reconciler.run().await {
                Ok(_) | Err(SyncError::AlreadyRunning) => {}
                Err(err) => warn!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding daily sync job")?;

    let watchdog = reconciler.clone();
    let tick = Job::new_async("0 * * * * *", move |_uuid, _lock| {
        let reconciler = watchdog.clone();
        Box::pin(async move {
            if let Err(err) = reconciler.run_if_stale().await {
                warn!(error = %err, "watchdog sync failed");
            }
        })
    })
    .context("creating watchdog job")?;
    sched.add(tick).await.context("adding watchdog job")?;

    Ok(sched)
}

/// Kick off a run detached from the caller's lifecycle: the trigger
/// (an HTTP request, typically) returns immediately while the run goes to
/// completion in the background.
pub fn trigger_detached(reconciler: Arc<Reconciler>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match reconciler.run().await {
            Ok(_) | Err(SyncError::AlreadyRunning) => {}
            Err(err) => warn!(error = %err, "detached sync failed"),
        }
    })
}
