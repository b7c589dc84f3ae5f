//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::archive::CdxEntry;
use crate::detect::{ChangeAnalysis, ChangeDetails, ChangeMetrics};
use crate::state::{
    ChangeType, CrawlEngine, CrawlFrequency, CrawlScope, CrawlStatus, ObservedChangeFrequency,
};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    ArtifactRecord, ChangeRecord, CrawlJobRecord, CrawlParameters, DueSchedule, Fingerprints,
    IndexRecord, LinkRecord, NewArtifact, NewCrawlJob, NewSchedule, NewSnapshot, ProjectRecord,
    ScheduleRecord, SnapshotRecord, UsageRecord,
};
use crate::StrataError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

/// Attempts at claiming a snapshot version before giving up
const MAX_VERSION_ATTEMPTS: u32 = 5;

const PROJECT_COLUMNS: &str = "id, code, name, market_cap_rank, market_cap, is_active";

const LINK_COLUMNS: &str = "id, project_id, url, link_type, is_active";

const JOB_COLUMNS: &str = "id, link_id, project_id, seed_url, crawl_scope, max_depth, max_pages,
    engine, js_rendering, respect_robots_txt, rate_limit_delay_ms, timeout_secs, status,
    progress_percentage, pages_crawled, bytes_downloaded, error_message, retry_count, max_retries,
    next_scheduled_run, created_at, started_at, completed_at";

const SNAPSHOT_COLUMNS: &str = "id, snapshot_token, link_id, project_id, crawl_job_id,
    captured_at, version_number, domain, seed_url, pages_captured, resources_captured,
    total_bytes, crawl_duration_secs, content_hash, structure_hash, resources_hash,
    full_site_hash, is_first_snapshot, has_significant_changes, change_type, change_score,
    processing_complete";

const ARTIFACT_COLUMNS: &str = "id, crawl_job_id, snapshot_id, filename, format, storage_path,
    storage_backend, file_size, file_hash, compression, record_count, page_count,
    resource_count, cdx_available";

const INDEX_COLUMNS: &str = "id, artifact_id, snapshot_id, url_key, timestamp, original_url,
    mime_type, status_code, digest, redirect_url, filename, byte_offset, byte_length,
    content_length, charset";

const CHANGE_COLUMNS: &str = "id, old_snapshot_id, new_snapshot_id, change_type, change_score,
    similarity_score, text_added_bytes, text_removed_bytes, text_changed_percentage,
    structure_diff_score, sections_added, sections_removed, resources_added, resources_removed,
    resources_changed, details, significance_threshold, requires_reanalysis, warning,
    computation_time_secs, computed_at";

const SCHEDULE_COLUMNS: &str = "s.id, s.link_id, s.project_id, s.enabled, s.frequency,
    s.priority, s.min_market_cap, s.max_depth, s.max_pages, s.observed_change,
    s.last_significant_change, s.average_change_score, s.next_run_at, s.last_run_at,
    s.consecutive_no_change, s.backoff_multiplier, s.significance_threshold, s.is_paused,
    s.pause_reason";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(StrataError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, StrataError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, StrataError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Verifies a job transition happened, or explains why it did not
    fn ensure_transitioned(
        &self,
        changed: usize,
        job_id: &str,
        to: CrawlStatus,
    ) -> StorageResult<()> {
        if changed == 1 {
            return Ok(());
        }
        let job = self.get_job(job_id)?;
        Err(StorageError::InvalidTransition {
            job_id: job_id.to_string(),
            from: job.status,
            to,
        })
    }

    fn try_insert_snapshot(&mut self, snapshot: &NewSnapshot) -> rusqlite::Result<i64> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let count: u32 = tx.query_row(
            "SELECT COUNT(*) FROM website_snapshots WHERE link_id = ?1",
            params![snapshot.link_id],
            |row| row.get(0),
        )?;
        let version = count + 1;

        tx.execute(
            "INSERT INTO website_snapshots (snapshot_token, link_id, project_id, crawl_job_id,
             captured_at, version_number, domain, seed_url, pages_captured, resources_captured,
             total_bytes, crawl_duration_secs, is_first_snapshot, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                Uuid::new_v4().to_string(),
                snapshot.link_id,
                snapshot.project_id,
                snapshot.crawl_job_id,
                fmt_ts(&snapshot.captured_at),
                version,
                snapshot.domain,
                snapshot.seed_url,
                snapshot.pages_captured,
                snapshot.resources_captured,
                snapshot.total_bytes as i64,
                snapshot.crawl_duration_secs,
                version == 1,
                fmt_ts(&Utc::now()),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    fn query_jobs(
        &self,
        where_clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<CrawlJobRecord>> {
        let sql = format!("SELECT {} FROM crawl_jobs {}", JOB_COLUMNS, where_clause);
        let mut stmt = self.conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(args, job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn query_snapshots(
        &self,
        where_clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<SnapshotRecord>> {
        let sql = format!(
            "SELECT {} FROM website_snapshots {}",
            SNAPSHOT_COLUMNS, where_clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let snapshots = stmt
            .query_map(args, snapshot_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(snapshots)
    }

    fn query_changes(
        &self,
        where_clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT {} FROM change_records {}",
            CHANGE_COLUMNS, where_clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let changes = stmt
            .query_map(args, change_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(changes)
    }

    fn query_schedules(
        &self,
        where_clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<ScheduleRecord>> {
        let sql = format!(
            "SELECT {} FROM crawl_schedules s {}",
            SCHEDULE_COLUMNS, where_clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let schedules = stmt
            .query_map(args, schedule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(schedules)
    }
}

impl Storage for SqliteStorage {
    // ===== Projects and Links =====

    fn upsert_project(
        &mut self,
        code: &str,
        name: &str,
        market_cap_rank: Option<u32>,
        market_cap: Option<f64>,
    ) -> StorageResult<i64> {
        if let Some(existing) = self.get_project_by_code(code)? {
            self.conn.execute(
                "UPDATE projects SET name = ?1, market_cap_rank = ?2, market_cap = ?3 WHERE id = ?4",
                params![name, market_cap_rank, market_cap, existing.id],
            )?;
            return Ok(existing.id);
        }

        self.conn.execute(
            "INSERT INTO projects (code, name, market_cap_rank, market_cap, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![code, name, market_cap_rank, market_cap, fmt_ts(&Utc::now())],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_project(&self, project_id: i64) -> StorageResult<ProjectRecord> {
        let sql = format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS);
        self.conn
            .query_row(&sql, params![project_id], project_from_row)
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("project {}", project_id)))
    }

    fn get_project_by_code(&self, code: &str) -> StorageResult<Option<ProjectRecord>> {
        let sql = format!(
            "SELECT {} FROM projects WHERE code = ?1 COLLATE NOCASE",
            PROJECT_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![code], project_from_row)
            .optional()?)
    }

    fn insert_or_get_link(&mut self, project_id: i64, url: &str) -> StorageResult<i64> {
        if let Some(link) = self.get_link_by_url(url)? {
            return Ok(link.id);
        }

        self.conn.execute(
            "INSERT INTO project_links (project_id, url, created_at) VALUES (?1, ?2, ?3)",
            params![project_id, url, fmt_ts(&Utc::now())],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_link(&self, link_id: i64) -> StorageResult<LinkRecord> {
        let sql = format!("SELECT {} FROM project_links WHERE id = ?1", LINK_COLUMNS);
        self.conn
            .query_row(&sql, params![link_id], link_from_row)
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("link {}", link_id)))
    }

    fn get_link_by_url(&self, url: &str) -> StorageResult<Option<LinkRecord>> {
        let sql = format!("SELECT {} FROM project_links WHERE url = ?1", LINK_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![url], link_from_row)
            .optional()?)
    }

    fn primary_link_for_project(&self, project_id: i64) -> StorageResult<Option<LinkRecord>> {
        let sql = format!(
            "SELECT {} FROM project_links WHERE project_id = ?1 AND is_active = 1
             ORDER BY id LIMIT 1",
            LINK_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![project_id], link_from_row)
            .optional()?)
    }

    fn links_without_schedule(&self) -> StorageResult<Vec<LinkRecord>> {
        let sql = format!(
            "SELECT {} FROM project_links
             WHERE is_active = 1 AND id NOT IN (SELECT link_id FROM crawl_schedules)
             ORDER BY id",
            LINK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let links = stmt
            .query_map([], link_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    }

    // ===== Crawl Jobs =====

    fn create_job(&mut self, job: &NewCrawlJob) -> StorageResult<String> {
        let id = Uuid::new_v4().to_string();
        let p = &job.params;
        self.conn.execute(
            "INSERT INTO crawl_jobs (id, link_id, project_id, seed_url, crawl_scope, max_depth,
             max_pages, engine, js_rendering, respect_robots_txt, rate_limit_delay_ms,
             timeout_secs, status, retry_count, max_retries, next_scheduled_run, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                id,
                job.link_id,
                job.project_id,
                job.seed_url,
                p.scope.to_db_string(),
                p.max_depth,
                p.max_pages,
                p.engine.to_db_string(),
                p.js_rendering,
                p.respect_robots_txt,
                p.rate_limit_delay_ms as i64,
                p.timeout_secs as i64,
                CrawlStatus::Pending.to_db_string(),
                job.retry_count,
                job.max_retries,
                job.next_scheduled_run.as_ref().map(fmt_ts),
                fmt_ts(&Utc::now()),
            ],
        )?;
        Ok(id)
    }

    fn get_job(&self, job_id: &str) -> StorageResult<CrawlJobRecord> {
        self.query_jobs("WHERE id = ?1", params![job_id])?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound(format!("crawl job {}", job_id)))
    }

    fn start_job(&mut self, job_id: &str) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE crawl_jobs SET status = ?1, started_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                CrawlStatus::InProgress.to_db_string(),
                fmt_ts(&Utc::now()),
                job_id,
                CrawlStatus::Pending.to_db_string()
            ],
        )?;
        self.ensure_transitioned(changed, job_id, CrawlStatus::InProgress)
    }

    fn complete_job(
        &mut self,
        job_id: &str,
        pages_crawled: u32,
        bytes_downloaded: u64,
    ) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE crawl_jobs SET status = ?1, completed_at = ?2, progress_percentage = 100,
             pages_crawled = ?3, bytes_downloaded = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                CrawlStatus::Completed.to_db_string(),
                fmt_ts(&Utc::now()),
                pages_crawled,
                bytes_downloaded as i64,
                job_id,
                CrawlStatus::InProgress.to_db_string()
            ],
        )?;
        self.ensure_transitioned(changed, job_id, CrawlStatus::Completed)
    }

    fn fail_job(
        &mut self,
        job_id: &str,
        status: CrawlStatus,
        error_message: &str,
    ) -> StorageResult<CrawlJobRecord> {
        if !status.is_retryable() {
            return Err(StorageError::InvalidTransition {
                job_id: job_id.to_string(),
                from: CrawlStatus::InProgress,
                to: status,
            });
        }

        let changed = self.conn.execute(
            "UPDATE crawl_jobs SET status = ?1, completed_at = ?2, error_message = ?3,
             retry_count = retry_count + 1
             WHERE id = ?4 AND status = ?5",
            params![
                status.to_db_string(),
                fmt_ts(&Utc::now()),
                error_message,
                job_id,
                CrawlStatus::InProgress.to_db_string()
            ],
        )?;
        self.ensure_transitioned(changed, job_id, status)?;
        self.get_job(job_id)
    }

    fn cancel_job(&mut self, job_id: &str, reason: &str) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE crawl_jobs SET status = ?1, completed_at = ?2, error_message = ?3
             WHERE id = ?4 AND status IN (?5, ?6)",
            params![
                CrawlStatus::Cancelled.to_db_string(),
                fmt_ts(&Utc::now()),
                reason,
                job_id,
                CrawlStatus::Pending.to_db_string(),
                CrawlStatus::InProgress.to_db_string()
            ],
        )?;
        self.ensure_transitioned(changed, job_id, CrawlStatus::Cancelled)
    }

    fn update_job_progress(
        &mut self,
        job_id: &str,
        progress_percentage: f64,
        pages_crawled: u32,
        bytes_downloaded: u64,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE crawl_jobs SET progress_percentage = ?1, pages_crawled = ?2,
             bytes_downloaded = ?3 WHERE id = ?4 AND status = ?5",
            params![
                progress_percentage.clamp(0.0, 100.0),
                pages_crawled,
                bytes_downloaded as i64,
                job_id,
                CrawlStatus::InProgress.to_db_string()
            ],
        )?;
        Ok(())
    }

    fn active_job_for_link(&self, link_id: i64) -> StorageResult<Option<CrawlJobRecord>> {
        Ok(self
            .query_jobs(
                "WHERE link_id = ?1 AND status IN ('pending', 'in_progress')
                 ORDER BY created_at LIMIT 1",
                params![link_id],
            )?
            .into_iter()
            .next())
    }

    fn due_pending_jobs(&self, now: DateTime<Utc>) -> StorageResult<Vec<CrawlJobRecord>> {
        self.query_jobs(
            "WHERE status = 'pending'
             AND (next_scheduled_run IS NULL OR next_scheduled_run <= ?1)
             ORDER BY created_at",
            params![fmt_ts(&now)],
        )
    }

    fn jobs_by_status(&self, status: CrawlStatus) -> StorageResult<Vec<CrawlJobRecord>> {
        self.query_jobs(
            "WHERE status = ?1 ORDER BY created_at",
            params![status.to_db_string()],
        )
    }

    fn recent_failed_jobs(&self, limit: usize) -> StorageResult<Vec<CrawlJobRecord>> {
        self.query_jobs(
            "WHERE status IN ('failed', 'rate_limited') ORDER BY completed_at DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    // ===== Snapshots =====

    fn insert_snapshot_next_version(
        &mut self,
        snapshot: &NewSnapshot,
    ) -> StorageResult<SnapshotRecord> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_insert_snapshot(snapshot) {
                Ok(id) => return self.get_snapshot(id),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation
                        && attempt < MAX_VERSION_ATTEMPTS =>
                {
                    warn!(
                        "Version conflict for link {} (attempt {}), retrying",
                        snapshot.link_id, attempt
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn get_snapshot(&self, snapshot_id: i64) -> StorageResult<SnapshotRecord> {
        self.query_snapshots("WHERE id = ?1", params![snapshot_id])?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound(format!("snapshot {}", snapshot_id)))
    }

    fn snapshots_for_link(&self, link_id: i64) -> StorageResult<Vec<SnapshotRecord>> {
        self.query_snapshots(
            "WHERE link_id = ?1 ORDER BY version_number",
            params![link_id],
        )
    }

    fn update_snapshot_fingerprints(
        &mut self,
        snapshot_id: i64,
        fingerprints: &Fingerprints,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE website_snapshots SET content_hash = ?1, structure_hash = ?2,
             resources_hash = ?3, full_site_hash = ?4 WHERE id = ?5",
            params![
                fingerprints.content_hash,
                fingerprints.structure_hash,
                fingerprints.resources_hash,
                fingerprints.full_site_hash,
                snapshot_id
            ],
        )?;
        Ok(())
    }

    fn update_snapshot_change(
        &mut self,
        snapshot_id: i64,
        change_type: ChangeType,
        change_score: Option<f64>,
        significant: bool,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE website_snapshots SET change_type = ?1, change_score = ?2,
             has_significant_changes = ?3 WHERE id = ?4",
            params![
                change_type.to_db_string(),
                change_score,
                significant,
                snapshot_id
            ],
        )?;
        Ok(())
    }

    fn mark_snapshot_complete(&mut self, snapshot_id: i64) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE website_snapshots SET processing_complete = 1 WHERE id = ?1",
            params![snapshot_id],
        )?;
        Ok(())
    }

    fn incomplete_snapshots(&self) -> StorageResult<Vec<SnapshotRecord>> {
        self.query_snapshots(
            "WHERE processing_complete = 0 ORDER BY link_id, version_number",
            params![],
        )
    }

    // ===== Artifacts and Index =====

    fn insert_artifact(&mut self, artifact: &NewArtifact) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO artifact_files (crawl_job_id, snapshot_id, filename, format,
             storage_path, storage_backend, file_size, file_hash, compression, record_count,
             page_count, resource_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                artifact.crawl_job_id,
                artifact.snapshot_id,
                artifact.filename,
                artifact.format,
                artifact.storage_path,
                artifact.storage_backend,
                artifact.file_size as i64,
                artifact.file_hash,
                artifact.compression,
                artifact.record_count,
                artifact.page_count,
                artifact.resource_count,
                fmt_ts(&Utc::now()),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn artifact_for_snapshot(&self, snapshot_id: i64) -> StorageResult<Option<ArtifactRecord>> {
        let sql = format!(
            "SELECT {} FROM artifact_files WHERE snapshot_id = ?1",
            ARTIFACT_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![snapshot_id], artifact_from_row)
            .optional()?)
    }

    fn artifact_for_job(&self, job_id: &str) -> StorageResult<Option<ArtifactRecord>> {
        let sql = format!(
            "SELECT {} FROM artifact_files WHERE crawl_job_id = ?1",
            ARTIFACT_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![job_id], artifact_from_row)
            .optional()?)
    }

    fn attach_artifact_to_snapshot(
        &mut self,
        artifact_id: i64,
        snapshot_id: i64,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE artifact_files SET snapshot_id = ?1 WHERE id = ?2",
            params![snapshot_id, artifact_id],
        )?;
        Ok(())
    }

    fn set_artifact_indexed(&mut self, artifact_id: i64) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE artifact_files SET cdx_available = 1 WHERE id = ?1",
            params![artifact_id],
        )?;
        Ok(())
    }

    fn insert_index_records(
        &mut self,
        artifact_id: i64,
        snapshot_id: i64,
        entries: &[CdxEntry],
    ) -> StorageResult<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO index_records (artifact_id, snapshot_id, url_key,
                 timestamp, original_url, mime_type, status_code, digest, redirect_url,
                 filename, byte_offset, byte_length, content_length, charset)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;
            for entry in entries {
                inserted += stmt.execute(params![
                    artifact_id,
                    snapshot_id,
                    entry.url_key,
                    entry.timestamp,
                    entry.original_url,
                    entry.mime_type,
                    entry.status_code,
                    entry.digest,
                    entry.redirect_url,
                    entry.filename,
                    entry.offset as i64,
                    entry.length as i64,
                    entry.content_length.map(|n| n as i64),
                    entry.charset,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn index_records_for_snapshot(&self, snapshot_id: i64) -> StorageResult<Vec<IndexRecord>> {
        let sql = format!(
            "SELECT {} FROM index_records WHERE snapshot_id = ?1 ORDER BY url_key, timestamp",
            INDEX_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![snapshot_id], index_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn lookup_index(
        &self,
        url_key: &str,
        snapshot_id: Option<i64>,
        at: Option<&str>,
    ) -> StorageResult<Option<IndexRecord>> {
        let sql = format!(
            "SELECT {} FROM index_records
             WHERE url_key = ?1
             AND (?2 IS NULL OR snapshot_id = ?2)
             AND (?3 IS NULL OR timestamp <= ?3)
             ORDER BY timestamp DESC, id DESC LIMIT 1",
            INDEX_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![url_key, snapshot_id, at], index_from_row)
            .optional()?)
    }

    // ===== Change Records =====

    fn insert_change_record(
        &mut self,
        old_snapshot_id: i64,
        new_snapshot_id: i64,
        analysis: &ChangeAnalysis,
    ) -> StorageResult<i64> {
        let m = analysis.metrics();
        let details = serde_json::to_string(&m.details)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        self.conn.execute(
            "INSERT INTO change_records (old_snapshot_id, new_snapshot_id, change_type,
             change_score, similarity_score, text_added_bytes, text_removed_bytes,
             text_changed_percentage, structure_diff_score, sections_added, sections_removed,
             resources_added, resources_removed, resources_changed, details,
             significance_threshold, is_significant_change, requires_reanalysis, warning,
             computation_time_secs, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20, ?21)",
            params![
                old_snapshot_id,
                new_snapshot_id,
                m.change_type.to_db_string(),
                m.change_score,
                m.similarity_score,
                m.text_added_bytes as i64,
                m.text_removed_bytes as i64,
                m.text_changed_percentage,
                m.structure_diff_score,
                m.sections_added,
                m.sections_removed,
                m.resources_added,
                m.resources_removed,
                m.resources_changed,
                details,
                analysis.threshold(),
                analysis.is_significant(),
                analysis.requires_reanalysis(),
                m.warning,
                m.computation_time_secs,
                fmt_ts(&Utc::now()),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn change_for_new_snapshot(&self, new_snapshot_id: i64) -> StorageResult<Option<ChangeRecord>> {
        Ok(self
            .query_changes("WHERE new_snapshot_id = ?1", params![new_snapshot_id])?
            .into_iter()
            .next())
    }

    fn pending_reanalysis(&self, threshold: f64) -> StorageResult<Vec<ChangeRecord>> {
        self.query_changes(
            "WHERE requires_reanalysis = 1 AND (change_score IS NULL OR change_score >= ?1)
             ORDER BY computed_at",
            params![threshold],
        )
    }

    fn clear_reanalysis(&mut self, change_id: i64) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE change_records SET requires_reanalysis = 0 WHERE id = ?1",
            params![change_id],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("change record {}", change_id)));
        }
        Ok(())
    }

    fn recent_significant_changes(&self, limit: usize) -> StorageResult<Vec<ChangeRecord>> {
        self.query_changes(
            "WHERE is_significant_change = 1 ORDER BY computed_at DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    // ===== Schedules =====

    fn insert_schedule(&mut self, schedule: &NewSchedule) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO crawl_schedules (link_id, project_id, frequency, priority,
             min_market_cap, max_depth, max_pages, next_run_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                schedule.link_id,
                schedule.project_id,
                schedule.frequency.to_db_string(),
                schedule.priority,
                schedule.min_market_cap,
                schedule.max_depth,
                schedule.max_pages,
                schedule.next_run_at.as_ref().map(fmt_ts),
                fmt_ts(&Utc::now()),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_schedule(&self, schedule_id: i64) -> StorageResult<ScheduleRecord> {
        self.query_schedules("WHERE s.id = ?1", params![schedule_id])?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound(format!("schedule {}", schedule_id)))
    }

    fn get_schedule_for_link(&self, link_id: i64) -> StorageResult<Option<ScheduleRecord>> {
        Ok(self
            .query_schedules("WHERE s.link_id = ?1", params![link_id])?
            .into_iter()
            .next())
    }

    fn due_schedules(&self, now: DateTime<Utc>) -> StorageResult<Vec<DueSchedule>> {
        let sql = format!(
            "SELECT {}, l.url, p.code, p.market_cap
             FROM crawl_schedules s
             JOIN project_links l ON l.id = s.link_id
             JOIN projects p ON p.id = s.project_id
             WHERE s.enabled = 1 AND s.is_paused = 0 AND s.frequency != 'on_demand'
             AND l.is_active = 1
             AND s.next_run_at IS NOT NULL AND s.next_run_at <= ?1
             ORDER BY s.priority DESC, s.next_run_at ASC, s.id ASC",
            SCHEDULE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let due = stmt
            .query_map(params![fmt_ts(&now)], |row| {
                Ok(DueSchedule {
                    schedule: schedule_from_row(row)?,
                    seed_url: row.get(19)?,
                    project_code: row.get(20)?,
                    market_cap: row.get(21)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(due)
    }

    fn save_schedule_adaptation(&mut self, schedule: &ScheduleRecord) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE crawl_schedules SET observed_change = ?1, last_significant_change = ?2,
             average_change_score = ?3, next_run_at = ?4, last_run_at = ?5,
             consecutive_no_change = ?6, backoff_multiplier = ?7
             WHERE id = ?8",
            params![
                schedule.observed_change.map(|o| o.to_db_string()),
                schedule.last_significant_change.as_ref().map(fmt_ts),
                schedule.average_change_score,
                schedule.next_run_at.as_ref().map(fmt_ts),
                schedule.last_run_at.as_ref().map(fmt_ts),
                schedule.consecutive_no_change,
                schedule.backoff_multiplier,
                schedule.id
            ],
        )?;
        Ok(())
    }

    fn update_schedule_frequency(
        &mut self,
        schedule_id: i64,
        frequency: CrawlFrequency,
        priority: Option<u8>,
    ) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE crawl_schedules SET frequency = ?1, priority = COALESCE(?2, priority),
             backoff_multiplier = 1.0 WHERE id = ?3",
            params![frequency.to_db_string(), priority, schedule_id],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("schedule {}", schedule_id)));
        }
        Ok(())
    }

    fn set_schedule_paused(
        &mut self,
        schedule_id: i64,
        paused: bool,
        reason: Option<&str>,
    ) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE crawl_schedules SET is_paused = ?1, pause_reason = ?2 WHERE id = ?3",
            params![paused, if paused { reason } else { None }, schedule_id],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("schedule {}", schedule_id)));
        }
        Ok(())
    }

    fn list_schedules(&self) -> StorageResult<Vec<ScheduleRecord>> {
        self.query_schedules("ORDER BY s.priority DESC, s.next_run_at ASC", params![])
    }

    // ===== Usage =====

    fn record_usage(
        &mut self,
        service: &str,
        day: &str,
        requests: u64,
        bytes: u64,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO api_usage (service, day, request_count, bytes) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(service, day) DO UPDATE SET
             request_count = request_count + excluded.request_count,
             bytes = bytes + excluded.bytes",
            params![service, day, requests as i64, bytes as i64],
        )?;
        Ok(())
    }

    fn usage_for_day(&self, day: &str) -> StorageResult<Vec<UsageRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT service, day, request_count, bytes FROM api_usage WHERE day = ?1
             ORDER BY service",
        )?;
        let usage = stmt
            .query_map(params![day], |row| {
                Ok(UsageRecord {
                    service: row.get(0)?,
                    day: row.get(1)?,
                    request_count: row.get::<_, i64>(2)? as u64,
                    bytes: row.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(usage)
    }

    // ===== Statistics =====

    fn count_jobs_by_status(&self) -> StorageResult<HashMap<CrawlStatus, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM crawl_jobs GROUP BY status")?;
        let mut counts = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            if let Some(status) = CrawlStatus::from_db_string(&status) {
                counts.insert(status, count as u64);
            }
        }
        Ok(counts)
    }

    fn snapshot_averages(&self) -> StorageResult<(Option<f64>, Option<f64>)> {
        Ok(self.conn.query_row(
            "SELECT AVG(pages_captured), AVG(crawl_duration_secs) FROM website_snapshots",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
    }

    fn snapshot_counts(&self) -> StorageResult<(u64, u64, u64)> {
        let (total, links, incomplete): (i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT link_id),
             COALESCE(SUM(CASE WHEN processing_complete = 0 THEN 1 ELSE 0 END), 0)
             FROM website_snapshots",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok((total as u64, links as u64, incomplete as u64))
    }

    fn artifact_totals(&self) -> StorageResult<HashMap<String, (u64, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT storage_backend, COUNT(*), COALESCE(SUM(file_size), 0)
             FROM artifact_files GROUP BY storage_backend",
        )?;
        let totals = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    (row.get::<_, i64>(1)? as u64, row.get::<_, i64>(2)? as u64),
                ))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(totals)
    }

    fn count_changes_by_type(&self) -> StorageResult<HashMap<ChangeType, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT change_type, COUNT(*) FROM change_records GROUP BY change_type")?;
        let mut counts = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (change_type, count) = row?;
            if let Some(change_type) = ChangeType::from_db_string(&change_type) {
                counts.insert(change_type, count as u64);
            }
        }
        Ok(counts)
    }

    fn change_summary(&self) -> StorageResult<(u64, Option<f64>)> {
        let (significant, average): (i64, Option<f64>) = self.conn.query_row(
            "SELECT COALESCE(SUM(is_significant_change), 0), AVG(change_score)
             FROM change_records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((significant as u64, average))
    }

    fn count_schedules_by_frequency(&self) -> StorageResult<HashMap<CrawlFrequency, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT frequency, COUNT(*) FROM crawl_schedules GROUP BY frequency")?;
        let mut counts = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (frequency, count) = row?;
            if let Some(frequency) = CrawlFrequency::from_db_string(&frequency) {
                counts.insert(frequency, count as u64);
            }
        }
        Ok(counts)
    }

    fn count_schedules_by_observed(
        &self,
    ) -> StorageResult<HashMap<ObservedChangeFrequency, u64>> {
        let mut stmt = self.conn.prepare(
            "SELECT observed_change, COUNT(*) FROM crawl_schedules
             WHERE observed_change IS NOT NULL GROUP BY observed_change",
        )?;
        let mut counts = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (label, count) = row?;
            if let Some(label) = ObservedChangeFrequency::from_db_string(&label) {
                counts.insert(label, count as u64);
            }
        }
        Ok(counts)
    }
}

/// Formats a timestamp so that string order equals time order
pub(crate) fn fmt_ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn get_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {:?}: {}", raw, e)))
}

fn get_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => get_ts(row, idx).map(Some),
    }
}

fn get_enum<T>(row: &Row, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unknown value {:?}", raw)))
}

fn get_opt_enum<T>(
    row: &Row,
    idx: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => get_enum(row, idx, parse).map(Some),
    }
}

fn project_from_row(row: &Row) -> rusqlite::Result<ProjectRecord> {
    Ok(ProjectRecord {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        market_cap_rank: row.get(3)?,
        market_cap: row.get(4)?,
        is_active: row.get(5)?,
    })
}

fn link_from_row(row: &Row) -> rusqlite::Result<LinkRecord> {
    Ok(LinkRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        url: row.get(2)?,
        link_type: row.get(3)?,
        is_active: row.get(4)?,
    })
}

fn job_from_row(row: &Row) -> rusqlite::Result<CrawlJobRecord> {
    Ok(CrawlJobRecord {
        id: row.get(0)?,
        link_id: row.get(1)?,
        project_id: row.get(2)?,
        seed_url: row.get(3)?,
        params: CrawlParameters {
            scope: get_enum(row, 4, CrawlScope::from_db_string)?,
            max_depth: row.get(5)?,
            max_pages: row.get(6)?,
            engine: get_enum(row, 7, CrawlEngine::from_db_string)?,
            js_rendering: row.get(8)?,
            respect_robots_txt: row.get(9)?,
            rate_limit_delay_ms: row.get::<_, i64>(10)? as u64,
            timeout_secs: row.get::<_, i64>(11)? as u64,
        },
        status: get_enum(row, 12, CrawlStatus::from_db_string)?,
        progress_percentage: row.get(13)?,
        pages_crawled: row.get(14)?,
        bytes_downloaded: row.get::<_, i64>(15)? as u64,
        error_message: row.get(16)?,
        retry_count: row.get(17)?,
        max_retries: row.get(18)?,
        next_scheduled_run: get_opt_ts(row, 19)?,
        created_at: get_ts(row, 20)?,
        started_at: get_opt_ts(row, 21)?,
        completed_at: get_opt_ts(row, 22)?,
    })
}

fn snapshot_from_row(row: &Row) -> rusqlite::Result<SnapshotRecord> {
    let hashes: (
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
    ) = (row.get(13)?, row.get(14)?, row.get(15)?, row.get(16)?);
    let fingerprints = match hashes {
        (Some(content_hash), Some(structure_hash), Some(resources_hash), Some(full_site_hash)) => {
            Some(Fingerprints {
                content_hash,
                structure_hash,
                resources_hash,
                full_site_hash,
            })
        }
        _ => None,
    };

    Ok(SnapshotRecord {
        id: row.get(0)?,
        snapshot_token: row.get(1)?,
        link_id: row.get(2)?,
        project_id: row.get(3)?,
        crawl_job_id: row.get(4)?,
        captured_at: get_ts(row, 5)?,
        version_number: row.get(6)?,
        domain: row.get(7)?,
        seed_url: row.get(8)?,
        pages_captured: row.get(9)?,
        resources_captured: row.get(10)?,
        total_bytes: row.get::<_, i64>(11)? as u64,
        crawl_duration_secs: row.get(12)?,
        fingerprints,
        is_first_snapshot: row.get(17)?,
        has_significant_changes: row.get(18)?,
        change_type: get_opt_enum(row, 19, ChangeType::from_db_string)?,
        change_score: row.get(20)?,
        processing_complete: row.get(21)?,
    })
}

fn artifact_from_row(row: &Row) -> rusqlite::Result<ArtifactRecord> {
    Ok(ArtifactRecord {
        id: row.get(0)?,
        crawl_job_id: row.get(1)?,
        snapshot_id: row.get(2)?,
        filename: row.get(3)?,
        format: row.get(4)?,
        storage_path: row.get(5)?,
        storage_backend: row.get(6)?,
        file_size: row.get::<_, i64>(7)? as u64,
        file_hash: row.get(8)?,
        compression: row.get(9)?,
        record_count: row.get(10)?,
        page_count: row.get(11)?,
        resource_count: row.get(12)?,
        cdx_available: row.get(13)?,
    })
}

fn index_from_row(row: &Row) -> rusqlite::Result<IndexRecord> {
    Ok(IndexRecord {
        id: row.get(0)?,
        artifact_id: row.get(1)?,
        snapshot_id: row.get(2)?,
        entry: CdxEntry {
            url_key: row.get(3)?,
            timestamp: row.get(4)?,
            original_url: row.get(5)?,
            mime_type: row.get(6)?,
            status_code: row.get(7)?,
            digest: row.get(8)?,
            redirect_url: row.get(9)?,
            filename: row.get(10)?,
            offset: row.get::<_, i64>(11)? as u64,
            length: row.get::<_, i64>(12)? as u64,
            content_length: row.get::<_, Option<i64>>(13)?.map(|n| n as u64),
            charset: row.get(14)?,
        },
    })
}

fn change_from_row(row: &Row) -> rusqlite::Result<ChangeRecord> {
    let details_json: String = row.get(15)?;
    let details: ChangeDetails = serde_json::from_str(&details_json)
        .map_err(|e| conversion_error(15, format!("bad change details: {}", e)))?;

    let metrics = ChangeMetrics {
        change_type: get_enum(row, 3, ChangeType::from_db_string)?,
        change_score: row.get(4)?,
        similarity_score: row.get(5)?,
        text_added_bytes: row.get::<_, i64>(6)? as u64,
        text_removed_bytes: row.get::<_, i64>(7)? as u64,
        text_changed_percentage: row.get(8)?,
        structure_diff_score: row.get(9)?,
        sections_added: row.get(10)?,
        sections_removed: row.get(11)?,
        resources_added: row.get(12)?,
        resources_removed: row.get(13)?,
        resources_changed: row.get(14)?,
        details,
        warning: row.get(18)?,
        computation_time_secs: row.get(19)?,
    };

    Ok(ChangeRecord {
        id: row.get(0)?,
        old_snapshot_id: row.get(1)?,
        new_snapshot_id: row.get(2)?,
        analysis: ChangeAnalysis::new(metrics, row.get(16)?),
        requires_reanalysis: row.get(17)?,
        computed_at: get_ts(row, 20)?,
    })
}

fn schedule_from_row(row: &Row) -> rusqlite::Result<ScheduleRecord> {
    Ok(ScheduleRecord {
        id: row.get(0)?,
        link_id: row.get(1)?,
        project_id: row.get(2)?,
        enabled: row.get(3)?,
        frequency: get_enum(row, 4, CrawlFrequency::from_db_string)?,
        priority: row.get(5)?,
        min_market_cap: row.get(6)?,
        max_depth: row.get(7)?,
        max_pages: row.get(8)?,
        observed_change: get_opt_enum(row, 9, ObservedChangeFrequency::from_db_string)?,
        last_significant_change: get_opt_ts(row, 10)?,
        average_change_score: row.get(11)?,
        next_run_at: get_opt_ts(row, 12)?,
        last_run_at: get_opt_ts(row, 13)?,
        consecutive_no_change: row.get(14)?,
        backoff_multiplier: row.get(15)?,
        significance_threshold: row.get(16)?,
        is_paused: row.get(17)?,
        pause_reason: row.get(18)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ChangeMetrics;
    use chrono::Duration;

    fn storage_with_link() -> (SqliteStorage, i64, i64) {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let project_id = storage
            .upsert_project("BTC", "Bitcoin", Some(1), Some(1.0e12))
            .unwrap();
        let link_id = storage
            .insert_or_get_link(project_id, "https://bitcoin.org/")
            .unwrap();
        (storage, project_id, link_id)
    }

    fn new_job(project_id: i64, link_id: i64) -> NewCrawlJob {
        NewCrawlJob {
            link_id,
            project_id,
            seed_url: "https://bitcoin.org/".to_string(),
            params: CrawlParameters::default(),
            max_retries: 3,
            retry_count: 0,
            next_scheduled_run: None,
        }
    }

    fn new_snapshot(project_id: i64, link_id: i64, job_id: &str) -> NewSnapshot {
        NewSnapshot {
            link_id,
            project_id,
            crawl_job_id: job_id.to_string(),
            captured_at: Utc::now(),
            domain: "bitcoin.org".to_string(),
            seed_url: "https://bitcoin.org/".to_string(),
            pages_captured: 3,
            resources_captured: 2,
            total_bytes: 4096,
            crawl_duration_secs: 1.5,
        }
    }

    fn completed_job(storage: &mut SqliteStorage, project_id: i64, link_id: i64) -> String {
        let job_id = storage.create_job(&new_job(project_id, link_id)).unwrap();
        storage.start_job(&job_id).unwrap();
        storage.complete_job(&job_id, 3, 4096).unwrap();
        job_id
    }

    fn metrics(change_type: ChangeType, score: Option<f64>) -> ChangeMetrics {
        ChangeMetrics {
            change_type,
            change_score: score,
            similarity_score: score.map(|s| 1.0 - s),
            ..ChangeMetrics::default()
        }
    }

    #[test]
    fn test_create_in_memory() {
        assert!(SqliteStorage::new_in_memory().is_ok());
    }

    #[test]
    fn test_upsert_project_refreshes_market_data() {
        let (mut storage, project_id, _) = storage_with_link();
        let again = storage
            .upsert_project("btc", "Bitcoin", Some(2), Some(9.0e11))
            .unwrap();
        assert_eq!(again, project_id);

        let project = storage.get_project(project_id).unwrap();
        assert_eq!(project.market_cap_rank, Some(2));
        assert_eq!(project.market_cap, Some(9.0e11));
    }

    #[test]
    fn test_insert_duplicate_link() {
        let (mut storage, project_id, link_id) = storage_with_link();
        let again = storage
            .insert_or_get_link(project_id, "https://bitcoin.org/")
            .unwrap();
        assert_eq!(again, link_id);
    }

    #[test]
    fn test_job_lifecycle() {
        let (mut storage, project_id, link_id) = storage_with_link();
        let job_id = storage.create_job(&new_job(project_id, link_id)).unwrap();
        assert_eq!(storage.get_job(&job_id).unwrap().status, CrawlStatus::Pending);

        storage.start_job(&job_id).unwrap();
        let job = storage.get_job(&job_id).unwrap();
        assert_eq!(job.status, CrawlStatus::InProgress);
        assert!(job.started_at.is_some());

        storage.update_job_progress(&job_id, 40.0, 2, 100).unwrap();
        assert_eq!(storage.get_job(&job_id).unwrap().pages_crawled, 2);

        storage.complete_job(&job_id, 5, 2048).unwrap();
        let job = storage.get_job(&job_id).unwrap();
        assert_eq!(job.status, CrawlStatus::Completed);
        assert_eq!(job.pages_crawled, 5);
        assert_eq!(job.bytes_downloaded, 2048);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_terminal_job_cannot_restart() {
        let (mut storage, project_id, link_id) = storage_with_link();
        let job_id = completed_job(&mut storage, project_id, link_id);

        let err = storage.start_job(&job_id).unwrap_err();
        assert!(matches!(
            err,
            StorageError::InvalidTransition {
                from: CrawlStatus::Completed,
                to: CrawlStatus::InProgress,
                ..
            }
        ));
    }

    #[test]
    fn test_fail_job_increments_retry_count() {
        let (mut storage, project_id, link_id) = storage_with_link();
        let job_id = storage.create_job(&new_job(project_id, link_id)).unwrap();
        storage.start_job(&job_id).unwrap();

        let failed = storage
            .fail_job(&job_id, CrawlStatus::Failed, "timeout")
            .unwrap();
        assert_eq!(failed.status, CrawlStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_message.as_deref(), Some("timeout"));
        assert!(failed.retries_remaining());
    }

    #[test]
    fn test_fail_job_rejects_non_failure_status() {
        let (mut storage, project_id, link_id) = storage_with_link();
        let job_id = storage.create_job(&new_job(project_id, link_id)).unwrap();
        storage.start_job(&job_id).unwrap();
        assert!(storage
            .fail_job(&job_id, CrawlStatus::Completed, "nope")
            .is_err());
    }

    #[test]
    fn test_cancel_pending_job() {
        let (mut storage, project_id, link_id) = storage_with_link();
        let job_id = storage.create_job(&new_job(project_id, link_id)).unwrap();
        storage.cancel_job(&job_id, "shutdown").unwrap();
        assert_eq!(
            storage.get_job(&job_id).unwrap().status,
            CrawlStatus::Cancelled
        );
        assert!(storage.cancel_job(&job_id, "again").is_err());
    }

    #[test]
    fn test_active_job_for_link() {
        let (mut storage, project_id, link_id) = storage_with_link();
        assert!(storage.active_job_for_link(link_id).unwrap().is_none());

        let job_id = storage.create_job(&new_job(project_id, link_id)).unwrap();
        assert_eq!(
            storage.active_job_for_link(link_id).unwrap().map(|j| j.id),
            Some(job_id.clone())
        );

        storage.start_job(&job_id).unwrap();
        storage.complete_job(&job_id, 1, 1).unwrap();
        assert!(storage.active_job_for_link(link_id).unwrap().is_none());
    }

    #[test]
    fn test_due_pending_jobs_respects_next_run() {
        let (mut storage, project_id, link_id) = storage_with_link();
        let mut later = new_job(project_id, link_id);
        later.next_scheduled_run = Some(Utc::now() + Duration::hours(1));
        storage.create_job(&later).unwrap();

        assert!(storage.due_pending_jobs(Utc::now()).unwrap().is_empty());
        assert_eq!(
            storage
                .due_pending_jobs(Utc::now() + Duration::hours(2))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_snapshot_versions_are_contiguous() {
        let (mut storage, project_id, link_id) = storage_with_link();

        for expected in 1..=3u32 {
            let job_id = completed_job(&mut storage, project_id, link_id);
            let snapshot = storage
                .insert_snapshot_next_version(&new_snapshot(project_id, link_id, &job_id))
                .unwrap();
            assert_eq!(snapshot.version_number, expected);
            assert_eq!(snapshot.is_first_snapshot, expected == 1);
            assert!(!snapshot.processing_complete);
        }

        let versions: Vec<u32> = storage
            .snapshots_for_link(link_id)
            .unwrap()
            .iter()
            .map(|s| s.version_number)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn test_snapshot_fingerprints_and_completion() {
        let (mut storage, project_id, link_id) = storage_with_link();
        let job_id = completed_job(&mut storage, project_id, link_id);
        let snapshot = storage
            .insert_snapshot_next_version(&new_snapshot(project_id, link_id, &job_id))
            .unwrap();
        assert!(snapshot.fingerprints.is_none());

        let fingerprints = Fingerprints {
            content_hash: "c".to_string(),
            structure_hash: "s".to_string(),
            resources_hash: "r".to_string(),
            full_site_hash: "f".to_string(),
        };
        storage
            .update_snapshot_fingerprints(snapshot.id, &fingerprints)
            .unwrap();
        assert_eq!(storage.incomplete_snapshots().unwrap().len(), 1);

        storage.mark_snapshot_complete(snapshot.id).unwrap();
        let snapshot = storage.get_snapshot(snapshot.id).unwrap();
        assert_eq!(snapshot.fingerprints, Some(fingerprints));
        assert!(snapshot.processing_complete);
        assert!(storage.incomplete_snapshots().unwrap().is_empty());
    }

    #[test]
    fn test_one_artifact_per_job() {
        let (mut storage, project_id, link_id) = storage_with_link();
        let job_id = completed_job(&mut storage, project_id, link_id);
        let artifact = NewArtifact {
            crawl_job_id: job_id.clone(),
            snapshot_id: None,
            filename: "BTC_20240101_000000_abcd1234.warc".to_string(),
            format: "warc".to_string(),
            storage_path: "/tmp/a.warc".to_string(),
            storage_backend: "local".to_string(),
            file_size: 10,
            file_hash: "00".to_string(),
            compression: None,
            record_count: 2,
            page_count: 1,
            resource_count: 0,
        };
        storage.insert_artifact(&artifact).unwrap();
        assert!(storage.insert_artifact(&artifact).is_err());
        assert!(storage.artifact_for_job(&job_id).unwrap().is_some());
    }

    #[test]
    fn test_index_lookup_at_or_before() {
        let (mut storage, project_id, link_id) = storage_with_link();
        let job_id = completed_job(&mut storage, project_id, link_id);
        let snapshot = storage
            .insert_snapshot_next_version(&new_snapshot(project_id, link_id, &job_id))
            .unwrap();
        let artifact_id = storage
            .insert_artifact(&NewArtifact {
                crawl_job_id: job_id,
                snapshot_id: Some(snapshot.id),
                filename: "a.warc".to_string(),
                format: "warc".to_string(),
                storage_path: "/tmp/a.warc".to_string(),
                storage_backend: "local".to_string(),
                file_size: 10,
                file_hash: "00".to_string(),
                compression: None,
                record_count: 2,
                page_count: 2,
                resource_count: 0,
            })
            .unwrap();

        let entry = |ts: &str, offset: u64| CdxEntry {
            url_key: "org,bitcoin)/".to_string(),
            timestamp: ts.to_string(),
            original_url: "https://bitcoin.org/".to_string(),
            mime_type: Some("text/html".to_string()),
            status_code: Some(200),
            digest: None,
            redirect_url: None,
            filename: "a.warc".to_string(),
            offset,
            length: 100,
            content_length: Some(50),
            charset: None,
        };
        let entries = vec![
            entry("20240101000000", 0),
            entry("20240201000000", 100),
            entry("20240201000000", 100),
        ];
        let inserted = storage
            .insert_index_records(artifact_id, snapshot.id, &entries)
            .unwrap();
        assert_eq!(inserted, 2);

        let found = storage
            .lookup_index("org,bitcoin)/", None, Some("20240115000000"))
            .unwrap()
            .unwrap();
        assert_eq!(found.entry.offset, 0);

        let latest = storage
            .lookup_index("org,bitcoin)/", Some(snapshot.id), None)
            .unwrap()
            .unwrap();
        assert_eq!(latest.entry.timestamp, "20240201000000");

        assert!(storage
            .lookup_index("org,bitcoin)/", None, Some("20231231000000"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_change_record_roundtrip_and_reanalysis() {
        let (mut storage, project_id, link_id) = storage_with_link();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let job_id = completed_job(&mut storage, project_id, link_id);
            ids.push(
                storage
                    .insert_snapshot_next_version(&new_snapshot(project_id, link_id, &job_id))
                    .unwrap()
                    .id,
            );
        }

        let significant = ChangeAnalysis::new(metrics(ChangeType::ContentAdded, Some(0.45)), 0.3);
        let fallback = ChangeAnalysis::new(metrics(ChangeType::ContentModified, None), 0.3);
        let first = storage
            .insert_change_record(ids[0], ids[1], &significant)
            .unwrap();
        storage.insert_change_record(ids[1], ids[2], &fallback).unwrap();
        assert!(storage
            .insert_change_record(ids[0], ids[1], &significant)
            .is_err());

        let stored = storage.change_for_new_snapshot(ids[1]).unwrap().unwrap();
        assert_eq!(stored.analysis, significant);
        assert!(stored.requires_reanalysis);

        // A missing score counts as maximal
        assert_eq!(storage.pending_reanalysis(0.9).unwrap().len(), 1);
        assert_eq!(storage.pending_reanalysis(0.3).unwrap().len(), 2);

        storage.clear_reanalysis(first).unwrap();
        assert_eq!(storage.pending_reanalysis(0.3).unwrap().len(), 1);
        assert_eq!(storage.recent_significant_changes(10).unwrap().len(), 2);
    }

    #[test]
    fn test_due_schedules_order_and_filters() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let now = Utc::now();
        let mut add = |code: &str, priority: u8, due_offset_mins: i64| {
            let project_id = storage.upsert_project(code, code, None, None).unwrap();
            let link_id = storage
                .insert_or_get_link(project_id, &format!("https://{}.example/", code))
                .unwrap();
            storage
                .insert_schedule(&NewSchedule {
                    link_id,
                    project_id,
                    frequency: CrawlFrequency::Weekly,
                    priority,
                    min_market_cap: None,
                    max_depth: 2,
                    max_pages: 50,
                    next_run_at: Some(now + Duration::minutes(due_offset_mins)),
                })
                .unwrap()
        };

        let low = add("low", 3, -30);
        let high_late = add("highlate", 8, -5);
        let high_early = add("highearly", 8, -60);
        let future = add("future", 10, 60);
        let paused = add("paused", 9, -10);

        storage
            .set_schedule_paused(paused, true, Some("manual"))
            .unwrap();

        let due: Vec<i64> = storage
            .due_schedules(now)
            .unwrap()
            .iter()
            .map(|d| d.schedule.id)
            .collect();
        assert_eq!(due, vec![high_early, high_late, low]);
        assert!(!due.contains(&future));

        let paused = storage.get_schedule(paused).unwrap();
        assert!(paused.is_paused);
        assert_eq!(paused.pause_reason.as_deref(), Some("manual"));
    }

    #[test]
    fn test_on_demand_schedules_never_due() {
        let (mut storage, project_id, link_id) = storage_with_link();
        let id = storage
            .insert_schedule(&NewSchedule {
                link_id,
                project_id,
                frequency: CrawlFrequency::Weekly,
                priority: 5,
                min_market_cap: None,
                max_depth: 2,
                max_pages: 50,
                next_run_at: Some(Utc::now() - Duration::days(1)),
            })
            .unwrap();
        storage
            .update_schedule_frequency(id, CrawlFrequency::OnDemand, Some(9))
            .unwrap();

        assert!(storage.due_schedules(Utc::now()).unwrap().is_empty());
        assert_eq!(storage.get_schedule(id).unwrap().priority, 9);
        assert!(storage.links_without_schedule().unwrap().is_empty());
    }

    #[test]
    fn test_record_usage_accumulates() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        storage.record_usage("crawler", "2024-01-01", 3, 300).unwrap();
        storage.record_usage("crawler", "2024-01-01", 2, 50).unwrap();

        let usage = storage.usage_for_day("2024-01-01").unwrap();
        assert_eq!(
            usage,
            vec![UsageRecord {
                service: "crawler".to_string(),
                day: "2024-01-01".to_string(),
                request_count: 5,
                bytes: 350,
            }]
        );
    }

    #[test]
    fn test_statistics_on_empty_database() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        assert!(storage.count_jobs_by_status().unwrap().is_empty());
        assert_eq!(storage.snapshot_counts().unwrap(), (0, 0, 0));
        assert_eq!(storage.snapshot_averages().unwrap(), (None, None));
        assert_eq!(storage.change_summary().unwrap(), (0, None));
        assert!(storage.artifact_totals().unwrap().is_empty());
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = Utc::now();
        let late = early + Duration::microseconds(1);
        assert!(fmt_ts(&early) < fmt_ts(&late));
        assert_eq!(fmt_ts(&early).len(), fmt_ts(&late).len());
    }
}
