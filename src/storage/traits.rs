//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::archive::CdxEntry;
use crate::detect::ChangeAnalysis;
use crate::state::{ChangeType, CrawlFrequency, CrawlStatus, ObservedChangeFrequency};
use crate::storage::{
    ArtifactRecord, ChangeRecord, CrawlJobRecord, DueSchedule, Fingerprints, IndexRecord,
    LinkRecord, NewArtifact, NewCrawlJob, NewSchedule, NewSnapshot, ProjectRecord,
    ScheduleRecord, SnapshotRecord, UsageRecord,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid job transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: CrawlStatus,
        to: CrawlStatus,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// This trait defines every database operation the archival pipeline needs.
/// Methods that write take `&mut self`; callers share one backend behind a
/// mutex.
pub trait Storage {
    // ===== Projects and Links =====

    /// Inserts a project or refreshes the market data of an existing one
    ///
    /// # Arguments
    ///
    /// * `code` - Unique project code
    /// * `name` - Display name
    /// * `market_cap_rank` - Market-cap rank, if known
    /// * `market_cap` - Market capitalization, if known
    ///
    /// # Returns
    ///
    /// The project ID (either newly created or existing)
    fn upsert_project(
        &mut self,
        code: &str,
        name: &str,
        market_cap_rank: Option<u32>,
        market_cap: Option<f64>,
    ) -> StorageResult<i64>;

    fn get_project(&self, project_id: i64) -> StorageResult<ProjectRecord>;

    /// Looks up a project by code, case-insensitively
    fn get_project_by_code(&self, code: &str) -> StorageResult<Option<ProjectRecord>>;

    /// Inserts a link or gets the existing link ID for the same URL
    fn insert_or_get_link(&mut self, project_id: i64, url: &str) -> StorageResult<i64>;

    fn get_link(&self, link_id: i64) -> StorageResult<LinkRecord>;

    fn get_link_by_url(&self, url: &str) -> StorageResult<Option<LinkRecord>>;

    /// Gets the first active link of a project
    fn primary_link_for_project(&self, project_id: i64) -> StorageResult<Option<LinkRecord>>;

    /// Gets active links that have no schedule yet
    fn links_without_schedule(&self) -> StorageResult<Vec<LinkRecord>>;

    // ===== Crawl Jobs =====

    /// Creates a job in `PENDING` and returns its generated ID
    fn create_job(&mut self, job: &NewCrawlJob) -> StorageResult<String>;

    fn get_job(&self, job_id: &str) -> StorageResult<CrawlJobRecord>;

    /// Moves a job from `PENDING` to `IN_PROGRESS` and sets `started_at`
    fn start_job(&mut self, job_id: &str) -> StorageResult<()>;

    /// Moves a job from `IN_PROGRESS` to `COMPLETED`
    fn complete_job(
        &mut self,
        job_id: &str,
        pages_crawled: u32,
        bytes_downloaded: u64,
    ) -> StorageResult<()>;

    /// Moves a job from `IN_PROGRESS` to `FAILED` or `RATE_LIMITED`
    ///
    /// Increments the job's retry count and returns the updated row.
    fn fail_job(
        &mut self,
        job_id: &str,
        status: CrawlStatus,
        error_message: &str,
    ) -> StorageResult<CrawlJobRecord>;

    /// Moves a `PENDING` or `IN_PROGRESS` job to `CANCELLED`
    fn cancel_job(&mut self, job_id: &str, reason: &str) -> StorageResult<()>;

    /// Records crawl progress on an in-flight job
    fn update_job_progress(
        &mut self,
        job_id: &str,
        progress_percentage: f64,
        pages_crawled: u32,
        bytes_downloaded: u64,
    ) -> StorageResult<()>;

    /// Gets the `PENDING` or `IN_PROGRESS` job for a link, if any
    fn active_job_for_link(&self, link_id: i64) -> StorageResult<Option<CrawlJobRecord>>;

    /// Gets `PENDING` jobs whose `next_scheduled_run` is at or before `now`
    fn due_pending_jobs(&self, now: DateTime<Utc>) -> StorageResult<Vec<CrawlJobRecord>>;

    fn jobs_by_status(&self, status: CrawlStatus) -> StorageResult<Vec<CrawlJobRecord>>;

    /// Gets the most recently finished jobs in a terminal failure state
    fn recent_failed_jobs(&self, limit: usize) -> StorageResult<Vec<CrawlJobRecord>>;

    // ===== Snapshots =====

    /// Inserts a snapshot with `version_number = count + 1` for its link
    ///
    /// Version assignment and insertion happen in one immediate transaction;
    /// a lost race on `UNIQUE(link_id, version_number)` is retried.
    fn insert_snapshot_next_version(&mut self, snapshot: &NewSnapshot)
        -> StorageResult<SnapshotRecord>;

    fn get_snapshot(&self, snapshot_id: i64) -> StorageResult<SnapshotRecord>;

    /// Gets all snapshots of a link in version order
    fn snapshots_for_link(&self, link_id: i64) -> StorageResult<Vec<SnapshotRecord>>;

    fn update_snapshot_fingerprints(
        &mut self,
        snapshot_id: i64,
        fingerprints: &Fingerprints,
    ) -> StorageResult<()>;

    /// Backfills the change fields of a snapshot after comparison
    fn update_snapshot_change(
        &mut self,
        snapshot_id: i64,
        change_type: ChangeType,
        change_score: Option<f64>,
        significant: bool,
    ) -> StorageResult<()>;

    fn mark_snapshot_complete(&mut self, snapshot_id: i64) -> StorageResult<()>;

    /// Gets snapshots whose processing did not finish
    fn incomplete_snapshots(&self) -> StorageResult<Vec<SnapshotRecord>>;

    // ===== Artifacts and Index =====

    fn insert_artifact(&mut self, artifact: &NewArtifact) -> StorageResult<i64>;

    fn artifact_for_snapshot(&self, snapshot_id: i64) -> StorageResult<Option<ArtifactRecord>>;

    fn artifact_for_job(&self, job_id: &str) -> StorageResult<Option<ArtifactRecord>>;

    /// Links an artifact stored before its snapshot existed
    fn attach_artifact_to_snapshot(&mut self, artifact_id: i64, snapshot_id: i64)
        -> StorageResult<()>;

    fn set_artifact_indexed(&mut self, artifact_id: i64) -> StorageResult<()>;

    /// Bulk-inserts index records in one transaction
    ///
    /// Entries that repeat an existing `(snapshot, url_key, timestamp)` are
    /// skipped. Returns the number inserted.
    fn insert_index_records(
        &mut self,
        artifact_id: i64,
        snapshot_id: i64,
        entries: &[CdxEntry],
    ) -> StorageResult<usize>;

    fn index_records_for_snapshot(&self, snapshot_id: i64) -> StorageResult<Vec<IndexRecord>>;

    /// Finds the latest capture of a URL key at or before `at`
    ///
    /// # Arguments
    ///
    /// * `url_key` - Canonical index key of the URL
    /// * `snapshot_id` - Restrict the search to one snapshot
    /// * `at` - 14-digit timestamp bound; `None` means the latest capture
    fn lookup_index(
        &self,
        url_key: &str,
        snapshot_id: Option<i64>,
        at: Option<&str>,
    ) -> StorageResult<Option<IndexRecord>>;

    // ===== Change Records =====

    fn insert_change_record(
        &mut self,
        old_snapshot_id: i64,
        new_snapshot_id: i64,
        analysis: &ChangeAnalysis,
    ) -> StorageResult<i64>;

    fn change_for_new_snapshot(&self, new_snapshot_id: i64) -> StorageResult<Option<ChangeRecord>>;

    /// Gets change records awaiting reanalysis with a score at or above `threshold`
    ///
    /// A missing score counts as maximal.
    fn pending_reanalysis(&self, threshold: f64) -> StorageResult<Vec<ChangeRecord>>;

    /// Clears the reanalysis flag once the collaborator has acted on it
    fn clear_reanalysis(&mut self, change_id: i64) -> StorageResult<()>;

    fn recent_significant_changes(&self, limit: usize) -> StorageResult<Vec<ChangeRecord>>;

    // ===== Schedules =====

    fn insert_schedule(&mut self, schedule: &NewSchedule) -> StorageResult<i64>;

    fn get_schedule(&self, schedule_id: i64) -> StorageResult<ScheduleRecord>;

    fn get_schedule_for_link(&self, link_id: i64) -> StorageResult<Option<ScheduleRecord>>;

    /// Gets dispatchable schedules due at `now`
    ///
    /// Enabled, not paused, not on-demand, and `next_run_at <= now`; ordered
    /// by priority descending then by `next_run_at` ascending.
    fn due_schedules(&self, now: DateTime<Utc>) -> StorageResult<Vec<DueSchedule>>;

    /// Writes back the adaptive fields of a schedule
    fn save_schedule_adaptation(&mut self, schedule: &ScheduleRecord) -> StorageResult<()>;

    fn update_schedule_frequency(
        &mut self,
        schedule_id: i64,
        frequency: CrawlFrequency,
        priority: Option<u8>,
    ) -> StorageResult<()>;

    fn set_schedule_paused(
        &mut self,
        schedule_id: i64,
        paused: bool,
        reason: Option<&str>,
    ) -> StorageResult<()>;

    fn list_schedules(&self) -> StorageResult<Vec<ScheduleRecord>>;

    // ===== Usage =====

    /// Adds to the counters of one service for one day
    fn record_usage(
        &mut self,
        service: &str,
        day: &str,
        requests: u64,
        bytes: u64,
    ) -> StorageResult<()>;

    fn usage_for_day(&self, day: &str) -> StorageResult<Vec<UsageRecord>>;

    // ===== Statistics =====

    /// Counts jobs by status
    fn count_jobs_by_status(&self) -> StorageResult<HashMap<CrawlStatus, u64>>;

    /// Average pages and crawl seconds over all snapshots
    fn snapshot_averages(&self) -> StorageResult<(Option<f64>, Option<f64>)>;

    /// Total, distinct links, and incomplete snapshot counts
    fn snapshot_counts(&self) -> StorageResult<(u64, u64, u64)>;

    /// Artifact bytes grouped by backend, with file counts
    fn artifact_totals(&self) -> StorageResult<HashMap<String, (u64, u64)>>;

    fn count_changes_by_type(&self) -> StorageResult<HashMap<ChangeType, u64>>;

    /// Significant change count and average change score
    fn change_summary(&self) -> StorageResult<(u64, Option<f64>)>;

    fn count_schedules_by_frequency(&self) -> StorageResult<HashMap<CrawlFrequency, u64>>;

    /// Counts schedules carrying each observed change label
    fn count_schedules_by_observed(&self)
        -> StorageResult<HashMap<ObservedChangeFrequency, u64>>;
}
