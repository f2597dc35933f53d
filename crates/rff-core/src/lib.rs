//! Core domain model for RFF.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rff-core";

/// Opaque handle minted by the persistence store for one stored listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub Uuid);

impl LocalId {
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Ephemeral record extracted from one listing card.
///
/// Every field except `source_id` is optional: absence means "not found in
/// the markup", not an error. `source_id` is `None` only until (or unless)
/// the identity resolver has run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub source_id: Option<String>,
    pub title: Option<String>,
    /// Monthly rent in whole currency units (no minor units).
    pub price: Option<i64>,
    pub bedrooms: Option<f64>,
    pub bathrooms: Option<f64>,
    pub sqft: Option<f64>,
    pub address: Option<String>,
    pub availability_text: Option<String>,
    pub image_url: Option<String>,
    /// Ordered full-gallery URLs from the detail page; may be empty.
    pub gallery_image_urls: Vec<String>,
    pub detail_url: Option<String>,
    pub unit_label: Option<String>,
}

/// Persisted listing entity.
///
/// `source_id` is immutable and unique across active and inactive listings
/// combined. A listing that disappears from the source is flagged
/// `active = false`, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub local_id: LocalId,
    pub source_id: String,
    pub title: Option<String>,
    pub price: Option<i64>,
    pub bedrooms: Option<f64>,
    pub bathrooms: Option<f64>,
    pub sqft: Option<f64>,
    pub address: Option<String>,
    pub availability_text: Option<String>,
    pub image_url: Option<String>,
    pub detail_url: Option<String>,
    pub unit_label: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One gallery attachment on a listing.
///
/// `blob_handle` identifies the stored bytes; the same handle may be shared
/// by several listings when they reference the same remote URL. At most one
/// image per listing carries `is_primary`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryImage {
    pub source_url: String,
    pub blob_handle: String,
    pub is_primary: bool,
}

/// Aggregate counters persisted at the end of every sync run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub created: u64,
    pub updated: u64,
    pub deactivated: u64,
    pub errors: u64,
    pub last_run: Option<DateTime<Utc>>,
}

/// Phases of one reconciliation run, in order. Transitions are strictly
/// sequential; `Failed` is terminal and always preceded by the same cleanup
/// `Finalizing` performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    Fetching,
    Parsing,
    Diffing,
    Upserting,
    Deactivating,
    Finalizing,
    Completed,
    Failed,
}

impl SyncPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncPhase::Completed | SyncPhase::Failed)
    }
}

/// Live progress snapshot published by the reconciler and polled by the
/// front-end. `percentage` is monotonically non-decreasing within a run and
/// resets to 0 only when a new run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub phase: SyncPhase,
    pub percentage: u8,
    pub status_text: String,
    pub still_running: bool,
    pub updated_at: DateTime<Utc>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            percentage: 0,
            status_text: "Not started".to_string(),
            still_running: false,
            updated_at: DateTime::<Utc>::MIN_UTC,
        }
    }
}

/// Record of one completed (or failed) sync run, kept in a bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_count: u64,
    pub updated_count: u64,
    pub deactivated_count: u64,
    pub error_count: u64,
    pub final_phase: SyncPhase,
    pub status_text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_record_defaults_to_all_absent() {
        let record = ListingRecord::default();
        assert!(record.source_id.is_none());
        assert!(record.price.is_none());
        assert!(record.gallery_image_urls.is_empty());
    }

    #[test]
    fn terminal_phases() {
        assert!(SyncPhase::Completed.is_terminal());
        assert!(SyncPhase::Failed.is_terminal());
        assert!(!SyncPhase::Upserting.is_terminal());
    }

    #[test]
    fn minted_local_ids_are_unique() {
        assert_ne!(LocalId::mint(), LocalId::mint());
    }
}
