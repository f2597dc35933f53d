//! Storage collaborators + HTTP fetch utilities for RFF.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{info_span, warn};
use uuid::Uuid;

use rff_core::{GalleryImage, Listing, ListingRecord, LocalId, Progress, SyncPhase, SyncRun, SyncStats};

pub const CRATE_NAME: &str = "rff-storage";

/// Bodies shorter than this are logged as suspicious (likely a block page
/// or an empty shell) but still handed to the extractor.
const SUSPICIOUS_BODY_BYTES: usize = 1000;

/// Operator log entries retained before the oldest are evicted.
const LOG_CAPACITY: usize = 50;

/// Completed sync runs retained in the history log.
const RUN_LOG_CAPACITY: usize = 50;

// ---------------------------------------------------------------------------
// HTTP fetcher

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retry: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
        }
    }
}

/// Blocking-style HTTP fetcher with a fixed timeout and a single retry.
///
/// Listing sites commonly reject empty or library-default user agents, so
/// every request carries a realistic browser User-Agent and Accept headers.
/// On any failure the request is retried exactly once with identical
/// parameters before the error surfaces.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Fetch an HTML document as text.
    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let bytes = self.fetch_bytes(url, true).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Fetch a binary body (image downloads).
    pub async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.fetch_bytes(url, false).await
    }

    async fn fetch_bytes(&self, url: &str, html: bool) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        match self.fetch_once(url, html).await {
            Ok(body) => Ok(body),
            Err(err) => {
                warn!(url, error = %err, "first fetch attempt failed, retrying once");
                self.fetch_once(url, html).await
            }
        }
    }

    async fn fetch_once(&self, url: &str, html: bool) -> Result<Vec<u8>, FetchError> {
        let mut request = self.client.get(url);
        if html {
            request = request
                .header(
                    reqwest::header::ACCEPT,
                    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
                )
                .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.5");
        }

        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        tracing::info!(url, bytes = body.len(), status = status.as_u16(), "fetched");
        if body.len() < SUSPICIOUS_BODY_BYTES {
            warn!(url, bytes = body.len(), "response body is suspiciously short");
        }
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// Blob store for listing images, keyed by origin URL

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Opaque handle recorded on gallery rows; stable for a given URL.
    pub handle: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressable image store keyed by the *origin URL*, not by the
/// bytes: the same remote URL is trusted to serve the same image across
/// syncs, so one URL maps to exactly one stored blob forever.
#[derive(Debug)]
pub struct ImageStore {
    root: PathBuf,
    index: RwLock<HashMap<String, String>>,
}

impl ImageStore {
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating image store root {}", root.display()))?;
        let index = match fs::read_to_string(root.join("index.json")).await {
            Ok(text) => serde_json::from_str(&text).context("parsing image store index")?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("reading image store index {}", root.join("index.json").display())
                })
            }
        };
        Ok(Self {
            root,
            index: RwLock::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn handle_for(url: &str) -> String {
        let hash = Self::sha256_hex(url.as_bytes());
        let ext = url
            .rsplit('.')
            .next()
            .filter(|ext| ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("img");
        format!("{hash}.{ext}")
    }

    /// Look up a previously stored blob by its exact origin URL.
    pub async fn find_by_origin_url(&self, url: &str) -> Option<StoredBlob> {
        let index = self.index.read().await;
        let handle = index.get(url)?.clone();
        Some(StoredBlob {
            absolute_path: self.root.join(&handle),
            handle,
            byte_size: 0,
            deduplicated: true,
        })
    }

    /// Store bytes for a URL using an atomic temp-file rename. Re-storing a
    /// URL that is already indexed reuses the existing blob untouched.
    pub async fn store(&self, url: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob> {
        if let Some(existing) = self.find_by_origin_url(url).await {
            return Ok(existing);
        }

        let handle = Self::handle_for(url);
        let absolute_path = self.root.join(&handle);
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp blob file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp blob file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp blob file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if err.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(err).with_context(|| {
                    format!(
                        "renaming temp blob {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                });
            }
        }

        {
            let mut index = self.index.write().await;
            index.insert(url.to_string(), handle.clone());
            let snapshot = index.clone();
            drop(index);
            write_json_atomic(&self.root.join("index.json"), &snapshot).await?;
        }

        Ok(StoredBlob {
            absolute_path,
            handle,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Listing persistence

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listing store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("listing store serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown local id {0}")]
    UnknownLocalId(LocalId),
}

/// Upsert-by-key persistence for listings, including gallery attachments.
///
/// The store never deletes: a listing that disappears from the source is
/// flipped inactive via [`ListingStore::set_active`].
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Create or update the listing identified by `source_id` from the
    /// extracted fields, reactivating it if needed. Returns its local id.
    async fn upsert_by_key(
        &self,
        source_id: &str,
        record: &ListingRecord,
    ) -> Result<LocalId, StoreError>;

    async fn get_by_key(&self, source_id: &str) -> Result<Option<Listing>, StoreError>;

    /// Point-in-time snapshot of every known identity, active or not.
    async fn all_keys_with_local_ids(&self) -> Result<HashMap<String, LocalId>, StoreError>;

    async fn set_active(&self, local_id: LocalId, active: bool) -> Result<(), StoreError>;

    async fn active_listings(&self) -> Result<Vec<Listing>, StoreError>;

    async fn gallery(&self, local_id: LocalId) -> Result<Vec<GalleryImage>, StoreError>;

    /// Append one gallery row; a row for the same `source_url` on the same
    /// listing is replaced, not duplicated.
    async fn attach_gallery_image(
        &self,
        local_id: LocalId,
        image: GalleryImage,
    ) -> Result<(), StoreError>;

    /// Flag one gallery row primary and clear the flag everywhere else on
    /// the listing. Idempotent.
    async fn set_primary(&self, local_id: LocalId, blob_handle: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredListing {
    listing: Listing,
    gallery: Vec<GalleryImage>,
}

/// JSON-file-backed [`ListingStore`]. State lives in memory behind a lock
/// and every mutation rewrites the file atomically, so a crash mid-sync
/// leaves the previous consistent snapshot on disk.
#[derive(Debug)]
pub struct JsonListingStore {
    path: PathBuf,
    state: RwLock<HashMap<String, StoredListing>>,
}

impl JsonListingStore {
    pub async fn open(data_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        let path = data_dir.join("listings.json");
        let state = match fs::read_to_string(&path).await {
            Ok(text) => {
                let rows: Vec<StoredListing> =
                    serde_json::from_str(&text).context("parsing listings.json")?;
                rows.into_iter()
                    .map(|row| (row.listing.source_id.clone(), row))
                    .collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()))
            }
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    async fn persist(&self, state: &HashMap<String, StoredListing>) -> Result<(), StoreError> {
        let mut rows: Vec<&StoredListing> = state.values().collect();
        rows.sort_by(|a, b| a.listing.created_at.cmp(&b.listing.created_at));
        let text = serde_json::to_vec_pretty(&rows)?;
        write_bytes_atomic(&self.path, &text).await?;
        Ok(())
    }

    fn apply_fields(listing: &mut Listing, record: &ListingRecord, now: DateTime<Utc>) {
        listing.title = record.title.clone();
        listing.price = record.price;
        listing.bedrooms = record.bedrooms;
        listing.bathrooms = record.bathrooms;
        listing.sqft = record.sqft;
        listing.address = record.address.clone();
        listing.availability_text = record.availability_text.clone();
        listing.image_url = record.image_url.clone();
        listing.detail_url = record.detail_url.clone();
        listing.unit_label = record.unit_label.clone();
        listing.active = true;
        listing.updated_at = now;
    }
}

#[async_trait]
impl ListingStore for JsonListingStore {
    async fn upsert_by_key(
        &self,
        source_id: &str,
        record: &ListingRecord,
    ) -> Result<LocalId, StoreError> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let local_id = match state.get_mut(source_id) {
            Some(row) => {
                Self::apply_fields(&mut row.listing, record, now);
                row.listing.local_id
            }
            None => {
                let local_id = LocalId::mint();
                let mut listing = Listing {
                    local_id,
                    source_id: source_id.to_string(),
                    title: None,
                    price: None,
                    bedrooms: None,
                    bathrooms: None,
                    sqft: None,
                    address: None,
                    availability_text: None,
                    image_url: None,
                    detail_url: None,
                    unit_label: None,
                    active: true,
                    created_at: now,
                    updated_at: now,
                };
                Self::apply_fields(&mut listing, record, now);
                state.insert(
                    source_id.to_string(),
                    StoredListing {
                        listing,
                        gallery: Vec::new(),
                    },
                );
                local_id
            }
        };
        self.persist(&state).await?;
        Ok(local_id)
    }

    async fn get_by_key(&self, source_id: &str) -> Result<Option<Listing>, StoreError> {
        let state = self.state.read().await;
        Ok(state.get(source_id).map(|row| row.listing.clone()))
    }

    async fn all_keys_with_local_ids(&self) -> Result<HashMap<String, LocalId>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .iter()
            .map(|(source_id, row)| (source_id.clone(), row.listing.local_id))
            .collect())
    }

    async fn set_active(&self, local_id: LocalId, active: bool) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let row = state
            .values_mut()
            .find(|row| row.listing.local_id == local_id)
            .ok_or(StoreError::UnknownLocalId(local_id))?;
        row.listing.active = active;
        row.listing.updated_at = Utc::now();
        self.persist(&state).await
    }

    async fn active_listings(&self) -> Result<Vec<Listing>, StoreError> {
        let state = self.state.read().await;
        let mut rows: Vec<Listing> = state
            .values()
            .filter(|row| row.listing.active)
            .map(|row| row.listing.clone())
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn gallery(&self, local_id: LocalId) -> Result<Vec<GalleryImage>, StoreError> {
        let state = self.state.read().await;
        let row = state
            .values()
            .find(|row| row.listing.local_id == local_id)
            .ok_or(StoreError::UnknownLocalId(local_id))?;
        Ok(row.gallery.clone())
    }

    async fn attach_gallery_image(
        &self,
        local_id: LocalId,
        image: GalleryImage,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let row = state
            .values_mut()
            .find(|row| row.listing.local_id == local_id)
            .ok_or(StoreError::UnknownLocalId(local_id))?;
        row.gallery.retain(|existing| existing.source_url != image.source_url);
        row.gallery.push(image);
        self.persist(&state).await
    }

    async fn set_primary(&self, local_id: LocalId, blob_handle: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let row = state
            .values_mut()
            .find(|row| row.listing.local_id == local_id)
            .ok_or(StoreError::UnknownLocalId(local_id))?;
        for image in &mut row.gallery {
            image.is_primary = image.blob_handle == blob_handle;
        }
        self.persist(&state).await
    }
}

// ---------------------------------------------------------------------------
// Progress / stats channel

/// Progress and stats channel shared between the reconciler (writer) and
/// the polling surfaces (readers). Reads are safe at any time; percentage
/// is clamped monotonic within a run and resets only in [`Self::begin_run`].
#[derive(Debug)]
pub struct ProgressChannel {
    data_dir: PathBuf,
    current: std::sync::RwLock<Progress>,
}

impl ProgressChannel {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            current: std::sync::RwLock::new(Progress::default()),
        }
    }

    /// Reset to 0% for a new run.
    pub fn begin_run(&self, status_text: &str) {
        let mut current = self.current.write().expect("progress lock poisoned");
        *current = Progress {
            phase: SyncPhase::Idle,
            percentage: 0,
            status_text: status_text.to_string(),
            still_running: true,
            updated_at: Utc::now(),
        };
    }

    pub fn publish(&self, phase: SyncPhase, percentage: u8, status_text: &str, still_running: bool) {
        let mut current = self.current.write().expect("progress lock poisoned");
        current.phase = phase;
        current.percentage = current.percentage.max(percentage.min(100));
        current.status_text = status_text.to_string();
        current.still_running = still_running;
        current.updated_at = Utc::now();
    }

    pub fn read(&self) -> Progress {
        self.current.read().expect("progress lock poisoned").clone()
    }

    /// Seconds since the last progress write, for the watchdog's
    /// staleness check.
    pub fn seconds_since_update(&self) -> i64 {
        let current = self.current.read().expect("progress lock poisoned");
        (Utc::now() - current.updated_at).num_seconds()
    }

    pub async fn persist_stats(&self, stats: &SyncStats) -> anyhow::Result<()> {
        fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("creating data dir {}", self.data_dir.display()))?;
        write_json_atomic(&self.data_dir.join("stats.json"), stats).await
    }

    pub async fn read_stats(&self) -> anyhow::Result<SyncStats> {
        match fs::read_to_string(self.data_dir.join("stats.json")).await {
            Ok(text) => serde_json::from_str(&text).context("parsing stats.json"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(SyncStats::default()),
            Err(err) => Err(err).context("reading stats.json"),
        }
    }
}

// ---------------------------------------------------------------------------
// Run history

/// Bounded newest-first history of completed sync runs.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    runs: RwLock<Vec<SyncRun>>,
}

impl RunLog {
    pub async fn open(data_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        let path = data_dir.join("runs.json");
        let runs = match fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text).context("parsing runs.json")?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        Ok(Self {
            path,
            runs: RwLock::new(runs),
        })
    }

    pub async fn append(&self, run: SyncRun) -> anyhow::Result<()> {
        let mut runs = self.runs.write().await;
        runs.insert(0, run);
        runs.truncate(RUN_LOG_CAPACITY);
        let snapshot = runs.clone();
        drop(runs);
        write_json_atomic(&self.path, &snapshot).await
    }

    pub async fn recent(&self, n: usize) -> Vec<SyncRun> {
        let runs = self.runs.read().await;
        runs.iter().take(n).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Operator log sink

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Operator-facing log: a bounded newest-first ring persisted as JSON so
/// the admin surface can show the last runs' diagnostics. Every append is
/// also emitted as a `tracing` event.
#[derive(Debug)]
pub struct SyncLog {
    path: PathBuf,
    entries: RwLock<Vec<LogEntry>>,
}

impl SyncLog {
    pub async fn open(data_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        let path = data_dir.join("logs.json");
        let entries = match fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text).context("parsing logs.json")?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub async fn append(&self, message: impl Into<String>, level: LogLevel) {
        let message = message.into();
        match level {
            LogLevel::Info => tracing::info!(target: "rff::sync", "{message}"),
            LogLevel::Warning => tracing::warn!(target: "rff::sync", "{message}"),
            LogLevel::Error => tracing::error!(target: "rff::sync", "{message}"),
        }

        let mut entries = self.entries.write().await;
        entries.insert(
            0,
            LogEntry {
                time: Utc::now(),
                level,
                message,
            },
        );
        entries.truncate(LOG_CAPACITY);
        let snapshot = entries.clone();
        drop(entries);
        // Log persistence must never fail a sync run.
        if let Err(err) = write_json_atomic(&self.path, &snapshot).await {
            warn!(error = %err, "failed to persist operator log");
        }
    }

    pub async fn read_recent(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.read().await;
        entries.iter().take(n).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Sync lease

/// Time-boxed advisory mutex held for the duration of one sync run.
///
/// The lease is advisory: a watchdog may bypass a stale one, so callers
/// must stay correct under overlap (the reconciler's snapshot diff is
/// idempotent for exactly this reason).
pub trait SyncLease: Send + Sync {
    /// Try to take the lease for `ttl`. Returns false when a live lease is
    /// held by someone else; an expired lease is taken over.
    fn acquire(&self, ttl: Duration) -> anyhow::Result<bool>;

    /// Release the lease if this holder still owns it.
    fn release(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseFile {
    holder: Uuid,
    expires_at: DateTime<Utc>,
}

/// Lease backed by a JSON file next to the data files.
#[derive(Debug)]
pub struct FileLease {
    path: PathBuf,
    holder: Uuid,
}

impl FileLease {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join("sync.lease"),
            holder: Uuid::new_v4(),
        }
    }
}

impl SyncLease for FileLease {
    fn acquire(&self, ttl: Duration) -> anyhow::Result<bool> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        if let Ok(text) = std::fs::read_to_string(&self.path) {
            if let Ok(existing) = serde_json::from_str::<LeaseFile>(&text) {
                if existing.holder != self.holder && existing.expires_at > Utc::now() {
                    return Ok(false);
                }
            }
        }
        let lease = LeaseFile {
            holder: self.holder,
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(15)),
        };
        let text = serde_json::to_vec(&lease).context("serializing lease")?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("writing lease {}", self.path.display()))?;
        Ok(true)
    }

    fn release(&self) -> anyhow::Result<()> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => {
                if let Ok(existing) = serde_json::from_str::<LeaseFile>(&text) {
                    if existing.holder == self.holder {
                        std::fs::remove_file(&self.path)
                            .with_context(|| format!("removing lease {}", self.path.display()))?;
                    }
                }
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("reading lease {}", self.path.display())),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared file helpers

async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);
    fs::rename(&temp_path, path).await
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_bytes_atomic(path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(title: &str, price: i64) -> ListingRecord {
        ListingRecord {
            title: Some(title.to_string()),
            price: Some(price),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn image_store_reuses_blob_for_same_url() {
        let dir = tempdir().expect("tempdir");
        let store = ImageStore::open(dir.path()).await.expect("open");

        let first = store
            .store("https://cdn.example.com/a/medium.jpg", b"jpegbytes")
            .await
            .expect("first store");
        let second = store
            .store("https://cdn.example.com/a/medium.jpg", b"jpegbytes")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.handle, second.handle);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn image_store_lookup_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        {
            let store = ImageStore::open(dir.path()).await.expect("open");
            store
                .store("https://cdn.example.com/b/large.png", b"pngbytes")
                .await
                .expect("store");
        }
        let store = ImageStore::open(dir.path()).await.expect("reopen");
        let found = store
            .find_by_origin_url("https://cdn.example.com/b/large.png")
            .await;
        assert!(found.is_some());
        assert!(store.find_by_origin_url("https://cdn.example.com/missing.png").await.is_none());
    }

    #[tokio::test]
    async fn listing_store_upsert_then_update_keeps_local_id() {
        let dir = tempdir().expect("tempdir");
        let store = JsonListingStore::open(dir.path()).await.expect("open");

        let created = store
            .upsert_by_key("unit-1", &record("Plan A", 1200))
            .await
            .expect("create");
        let updated = store
            .upsert_by_key("unit-1", &record("Plan A (renamed)", 1250))
            .await
            .expect("update");

        assert_eq!(created, updated);
        let listing = store.get_by_key("unit-1").await.expect("get").expect("present");
        assert_eq!(listing.price, Some(1250));
        assert_eq!(listing.title.as_deref(), Some("Plan A (renamed)"));
        assert!(listing.active);
    }

    #[tokio::test]
    async fn listing_store_deactivation_retains_row() {
        let dir = tempdir().expect("tempdir");
        let store = JsonListingStore::open(dir.path()).await.expect("open");
        let local_id = store
            .upsert_by_key("unit-2", &record("Plan B", 900))
            .await
            .expect("create");

        store.set_active(local_id, false).await.expect("deactivate");

        assert!(store.active_listings().await.expect("active").is_empty());
        let listing = store.get_by_key("unit-2").await.expect("get").expect("retained");
        assert!(!listing.active);

        let keys = store.all_keys_with_local_ids().await.expect("keys");
        assert_eq!(keys.get("unit-2"), Some(&local_id));
    }

    #[tokio::test]
    async fn listing_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let local_id = {
            let store = JsonListingStore::open(dir.path()).await.expect("open");
            store
                .upsert_by_key("unit-3", &record("Plan C", 1500))
                .await
                .expect("create")
        };
        let store = JsonListingStore::open(dir.path()).await.expect("reopen");
        let listing = store.get_by_key("unit-3").await.expect("get").expect("present");
        assert_eq!(listing.local_id, local_id);
        assert_eq!(listing.price, Some(1500));
    }

    #[tokio::test]
    async fn gallery_primary_is_exclusive() {
        let dir = tempdir().expect("tempdir");
        let store = JsonListingStore::open(dir.path()).await.expect("open");
        let local_id = store
            .upsert_by_key("unit-4", &record("Plan D", 1100))
            .await
            .expect("create");

        for (url, handle) in [("u1", "h1"), ("u2", "h2")] {
            store
                .attach_gallery_image(
                    local_id,
                    GalleryImage {
                        source_url: url.to_string(),
                        blob_handle: handle.to_string(),
                        is_primary: false,
                    },
                )
                .await
                .expect("attach");
        }

        store.set_primary(local_id, "h1").await.expect("primary h1");
        store.set_primary(local_id, "h2").await.expect("primary h2");

        let gallery = store.gallery(local_id).await.expect("gallery");
        let primaries: Vec<_> = gallery.iter().filter(|img| img.is_primary).collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].blob_handle, "h2");
    }

    #[test]
    fn progress_is_monotonic_within_a_run() {
        let dir = tempdir().expect("tempdir");
        let channel = ProgressChannel::new(dir.path());

        channel.begin_run("Starting sync...");
        channel.publish(SyncPhase::Diffing, 30, "Checking existing listings...", true);
        channel.publish(SyncPhase::Fetching, 10, "late fetch message", true);
        assert_eq!(channel.read().percentage, 30);

        channel.begin_run("Starting sync...");
        assert_eq!(channel.read().percentage, 0);
        assert_eq!(channel.read().phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn stats_round_trip() {
        let dir = tempdir().expect("tempdir");
        let channel = ProgressChannel::new(dir.path());
        let stats = SyncStats {
            created: 2,
            updated: 5,
            deactivated: 1,
            errors: 0,
            last_run: Some(Utc::now()),
        };
        channel.persist_stats(&stats).await.expect("persist");
        let read_back = channel.read_stats().await.expect("read");
        assert_eq!(read_back.created, 2);
        assert_eq!(read_back.updated, 5);
        assert_eq!(read_back.deactivated, 1);
    }

    #[tokio::test]
    async fn sync_log_is_bounded_and_newest_first() {
        let dir = tempdir().expect("tempdir");
        let log = SyncLog::open(dir.path()).await.expect("open");
        for i in 0..(LOG_CAPACITY + 10) {
            log.append(format!("entry {i}"), LogLevel::Info).await;
        }
        let recent = log.read_recent(LOG_CAPACITY + 10).await;
        assert_eq!(recent.len(), LOG_CAPACITY);
        assert_eq!(recent[0].message, format!("entry {}", LOG_CAPACITY + 9));
    }

    #[test]
    fn lease_excludes_second_holder_until_expiry() {
        let dir = tempdir().expect("tempdir");
        let first = FileLease::new(dir.path());
        let second = FileLease::new(dir.path());

        assert!(first.acquire(Duration::from_secs(900)).expect("first acquire"));
        assert!(!second.acquire(Duration::from_secs(900)).expect("second acquire"));

        first.release().expect("release");
        assert!(second.acquire(Duration::from_secs(900)).expect("after release"));
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let dir = tempdir().expect("tempdir");
        let first = FileLease::new(dir.path());
        let second = FileLease::new(dir.path());

        assert!(first.acquire(Duration::from_secs(0)).expect("first acquire"));
        assert!(second.acquire(Duration::from_secs(900)).expect("takeover"));
    }

    #[test]
    fn release_is_a_noop_for_non_holder() {
        let dir = tempdir().expect("tempdir");
        let first = FileLease::new(dir.path());
        let second = FileLease::new(dir.path());

        assert!(first.acquire(Duration::from_secs(900)).expect("acquire"));
        second.release().expect("non-holder release");
        assert!(!second.acquire(Duration::from_secs(900)).expect("still held"));
    }
}
