//! Storage module for persisting archival state
//!
//! The database is the system of record for every entity in the pipeline:
//! - Tracked projects and their archivable links
//! - Crawl jobs and their lifecycle
//! - Versioned website snapshots, artifacts, and index records
//! - Change records between adjacent snapshots
//! - Crawl schedules and usage counters

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::archive::CdxEntry;
use crate::config::CrawlDefaults;
use crate::detect::ChangeAnalysis;
use crate::state::{
    ChangeType, CrawlEngine, CrawlFrequency, CrawlScope, CrawlStatus, ObservedChangeFrequency,
};
use crate::StrataError;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Storage shared between the scheduler and its workers
///
/// The lock is only ever held for synchronous database calls, never across
/// an `.await`.
pub type SharedStorage = Arc<Mutex<SqliteStorage>>;

/// Opens (or creates) the database and wraps it for sharing
pub fn open_shared(path: &Path) -> Result<SharedStorage, StrataError> {
    Ok(Arc::new(Mutex::new(SqliteStorage::new(path)?)))
}

/// Locks shared storage, reporting a poisoned lock as a storage error
pub fn lock(storage: &SharedStorage) -> Result<MutexGuard<'_, SqliteStorage>, StrataError> {
    storage
        .lock()
        .map_err(|e| StrataError::StorageLock(format!("storage lock poisoned: {}", e)))
}

/// A tracked project
#[derive(Debug, Clone)]
pub struct ProjectRecord {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub market_cap_rank: Option<u32>,
    pub market_cap: Option<f64>,
    pub is_active: bool,
}

/// An archivable link of a project
#[derive(Debug, Clone)]
pub struct LinkRecord {
    pub id: i64,
    pub project_id: i64,
    pub url: String,
    pub link_type: String,
    pub is_active: bool,
}

/// Crawl parameters carried on every job
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlParameters {
    pub scope: CrawlScope,
    pub max_depth: u32,
    pub max_pages: u32,
    pub engine: CrawlEngine,
    pub js_rendering: bool,
    pub respect_robots_txt: bool,
    pub rate_limit_delay_ms: u64,
    pub timeout_secs: u64,
}

impl CrawlParameters {
    pub fn from_defaults(defaults: &CrawlDefaults) -> Self {
        Self {
            scope: defaults.scope,
            max_depth: defaults.max_depth,
            max_pages: defaults.max_pages,
            engine: defaults.engine,
            js_rendering: defaults.js_rendering || defaults.engine.renders_javascript(),
            respect_robots_txt: defaults.respect_robots_txt,
            rate_limit_delay_ms: defaults.rate_limit_delay_ms,
            timeout_secs: defaults.timeout_secs,
        }
    }
}

impl Default for CrawlParameters {
    fn default() -> Self {
        Self {
            scope: CrawlScope::Domain,
            max_depth: 3,
            max_pages: 1000,
            engine: CrawlEngine::Simple,
            js_rendering: false,
            respect_robots_txt: true,
            rate_limit_delay_ms: 1000,
            timeout_secs: 3600,
        }
    }
}

/// Fields needed to create a crawl job in `PENDING`
#[derive(Debug, Clone)]
pub struct NewCrawlJob {
    pub link_id: i64,
    pub project_id: i64,
    pub seed_url: String,
    pub params: CrawlParameters,
    pub max_retries: u32,
    /// Carried over from the failed attempt when this is a retry
    pub retry_count: u32,
    /// Earliest dispatch time; `None` means immediately
    pub next_scheduled_run: Option<DateTime<Utc>>,
}

/// A crawl job row
#[derive(Debug, Clone)]
pub struct CrawlJobRecord {
    pub id: String,
    pub link_id: i64,
    pub project_id: i64,
    pub seed_url: String,
    pub params: CrawlParameters,
    pub status: CrawlStatus,
    pub progress_percentage: f64,
    pub pages_crawled: u32,
    pub bytes_downloaded: u64,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_scheduled_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CrawlJobRecord {
    /// Returns true if another attempt is allowed after this one failed
    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Digests identifying a snapshot's content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprints {
    pub content_hash: String,
    pub structure_hash: String,
    pub resources_hash: String,
    pub full_site_hash: String,
}

/// Fields needed to create a snapshot; the version is assigned by storage
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub link_id: i64,
    pub project_id: i64,
    pub crawl_job_id: String,
    pub captured_at: DateTime<Utc>,
    pub domain: String,
    pub seed_url: String,
    pub pages_captured: u32,
    pub resources_captured: u32,
    pub total_bytes: u64,
    pub crawl_duration_secs: f64,
}

/// A website snapshot row
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub id: i64,
    pub snapshot_token: String,
    pub link_id: i64,
    pub project_id: i64,
    pub crawl_job_id: String,
    pub captured_at: DateTime<Utc>,
    pub version_number: u32,
    pub domain: String,
    pub seed_url: String,
    pub pages_captured: u32,
    pub resources_captured: u32,
    pub total_bytes: u64,
    pub crawl_duration_secs: f64,
    pub fingerprints: Option<Fingerprints>,
    pub is_first_snapshot: bool,
    pub has_significant_changes: bool,
    pub change_type: Option<ChangeType>,
    pub change_score: Option<f64>,
    pub processing_complete: bool,
}

impl SnapshotRecord {
    /// Version of the snapshot this one is compared against
    pub fn previous_version(&self) -> Option<u32> {
        self.version_number.checked_sub(1).filter(|v| *v > 0)
    }
}

/// Fields needed to record a stored artifact
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub crawl_job_id: String,
    pub snapshot_id: Option<i64>,
    pub filename: String,
    pub format: String,
    pub storage_path: String,
    pub storage_backend: String,
    pub file_size: u64,
    pub file_hash: String,
    pub compression: Option<String>,
    pub record_count: u32,
    pub page_count: u32,
    pub resource_count: u32,
}

/// An artifact file row
#[derive(Debug, Clone)]
pub struct ArtifactRecord {
    pub id: i64,
    pub crawl_job_id: String,
    pub snapshot_id: Option<i64>,
    pub filename: String,
    pub format: String,
    pub storage_path: String,
    pub storage_backend: String,
    pub file_size: u64,
    pub file_hash: String,
    pub compression: Option<String>,
    pub record_count: u32,
    pub page_count: u32,
    pub resource_count: u32,
    pub cdx_available: bool,
}

/// A persisted index record
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub id: i64,
    pub artifact_id: i64,
    pub snapshot_id: i64,
    pub entry: CdxEntry,
}

/// A persisted change record
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub id: i64,
    pub old_snapshot_id: i64,
    pub new_snapshot_id: i64,
    pub analysis: ChangeAnalysis,
    /// Cleared by the reanalysis collaborator once it has acted
    pub requires_reanalysis: bool,
    pub computed_at: DateTime<Utc>,
}

/// Fields needed to create a schedule
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub link_id: i64,
    pub project_id: i64,
    pub frequency: CrawlFrequency,
    pub priority: u8,
    pub min_market_cap: Option<f64>,
    pub max_depth: u32,
    pub max_pages: u32,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// A crawl schedule row
#[derive(Debug, Clone)]
pub struct ScheduleRecord {
    pub id: i64,
    pub link_id: i64,
    pub project_id: i64,
    pub enabled: bool,
    pub frequency: CrawlFrequency,
    pub priority: u8,
    pub min_market_cap: Option<f64>,
    pub max_depth: u32,
    pub max_pages: u32,
    pub observed_change: Option<ObservedChangeFrequency>,
    pub last_significant_change: Option<DateTime<Utc>>,
    pub average_change_score: Option<f64>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub consecutive_no_change: u32,
    pub backoff_multiplier: f64,
    pub significance_threshold: Option<f64>,
    pub is_paused: bool,
    pub pause_reason: Option<String>,
}

/// A due schedule joined with what dispatch needs to know about its link
#[derive(Debug, Clone)]
pub struct DueSchedule {
    pub schedule: ScheduleRecord,
    pub seed_url: String,
    pub project_code: String,
    pub market_cap: Option<f64>,
}

/// Request counters for one service on one day
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub service: String,
    /// `YYYY-MM-DD`
    pub day: String,
    pub request_count: u64,
    pub bytes: u64,
}
