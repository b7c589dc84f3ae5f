//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Sumi-Strata database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Tracked projects
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    market_cap_rank INTEGER,
    market_cap REAL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

-- Archivable links belonging to projects
CREATE TABLE IF NOT EXISTS project_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    url TEXT NOT NULL UNIQUE,
    link_type TEXT NOT NULL DEFAULT 'website',
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_links_project ON project_links(project_id);

-- One execution attempt of a crawl
CREATE TABLE IF NOT EXISTS crawl_jobs (
    id TEXT PRIMARY KEY,
    link_id INTEGER NOT NULL REFERENCES project_links(id),
    project_id INTEGER NOT NULL REFERENCES projects(id),
    seed_url TEXT NOT NULL,
    crawl_scope TEXT NOT NULL,
    max_depth INTEGER NOT NULL,
    max_pages INTEGER NOT NULL,
    engine TEXT NOT NULL,
    js_rendering INTEGER NOT NULL,
    respect_robots_txt INTEGER NOT NULL,
    rate_limit_delay_ms INTEGER NOT NULL,
    timeout_secs INTEGER NOT NULL,
    status TEXT NOT NULL,
    progress_percentage REAL NOT NULL DEFAULT 0,
    pages_crawled INTEGER NOT NULL DEFAULT 0,
    bytes_downloaded INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    next_scheduled_run TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON crawl_jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_link ON crawl_jobs(link_id);

-- Versioned captures of a link
CREATE TABLE IF NOT EXISTS website_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_token TEXT NOT NULL UNIQUE,
    link_id INTEGER NOT NULL REFERENCES project_links(id),
    project_id INTEGER NOT NULL REFERENCES projects(id),
    crawl_job_id TEXT NOT NULL REFERENCES crawl_jobs(id),
    captured_at TEXT NOT NULL,
    version_number INTEGER NOT NULL,
    domain TEXT NOT NULL,
    seed_url TEXT NOT NULL,
    pages_captured INTEGER NOT NULL,
    resources_captured INTEGER NOT NULL,
    total_bytes INTEGER NOT NULL,
    crawl_duration_secs REAL NOT NULL,
    content_hash TEXT,
    structure_hash TEXT,
    resources_hash TEXT,
    full_site_hash TEXT,
    is_first_snapshot INTEGER NOT NULL,
    has_significant_changes INTEGER NOT NULL DEFAULT 0,
    change_type TEXT,
    change_score REAL,
    processing_complete INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(link_id, version_number)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_link ON website_snapshots(link_id);

-- Packaged capture bytes, one set per successful job
CREATE TABLE IF NOT EXISTS artifact_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    crawl_job_id TEXT NOT NULL UNIQUE REFERENCES crawl_jobs(id),
    snapshot_id INTEGER REFERENCES website_snapshots(id),
    filename TEXT NOT NULL,
    format TEXT NOT NULL,
    storage_path TEXT NOT NULL,
    storage_backend TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    file_hash TEXT NOT NULL,
    compression TEXT,
    record_count INTEGER NOT NULL DEFAULT 0,
    page_count INTEGER NOT NULL DEFAULT 0,
    resource_count INTEGER NOT NULL DEFAULT 0,
    cdx_available INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_artifacts_snapshot ON artifact_files(snapshot_id);

-- URL to artifact byte range lookup
CREATE TABLE IF NOT EXISTS index_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    artifact_id INTEGER NOT NULL REFERENCES artifact_files(id),
    snapshot_id INTEGER NOT NULL REFERENCES website_snapshots(id),
    url_key TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    original_url TEXT NOT NULL,
    mime_type TEXT,
    status_code INTEGER,
    digest TEXT,
    redirect_url TEXT,
    filename TEXT NOT NULL,
    byte_offset INTEGER NOT NULL,
    byte_length INTEGER NOT NULL,
    content_length INTEGER,
    charset TEXT,
    UNIQUE(snapshot_id, url_key, timestamp)
);

CREATE INDEX IF NOT EXISTS idx_index_url_key ON index_records(url_key);

-- Diff between two adjacent snapshots
CREATE TABLE IF NOT EXISTS change_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    old_snapshot_id INTEGER NOT NULL REFERENCES website_snapshots(id),
    new_snapshot_id INTEGER NOT NULL REFERENCES website_snapshots(id),
    change_type TEXT NOT NULL,
    change_score REAL,
    similarity_score REAL,
    text_added_bytes INTEGER NOT NULL,
    text_removed_bytes INTEGER NOT NULL,
    text_changed_percentage REAL NOT NULL,
    structure_diff_score REAL NOT NULL,
    sections_added INTEGER NOT NULL,
    sections_removed INTEGER NOT NULL,
    resources_added INTEGER NOT NULL,
    resources_removed INTEGER NOT NULL,
    resources_changed INTEGER NOT NULL,
    details TEXT NOT NULL,
    significance_threshold REAL NOT NULL,
    is_significant_change INTEGER NOT NULL,
    requires_reanalysis INTEGER NOT NULL,
    warning TEXT,
    computation_time_secs REAL NOT NULL,
    computed_at TEXT NOT NULL,
    UNIQUE(old_snapshot_id, new_snapshot_id)
);

CREATE INDEX IF NOT EXISTS idx_changes_reanalysis ON change_records(requires_reanalysis);

-- Recurring crawl policy, one per link
CREATE TABLE IF NOT EXISTS crawl_schedules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    link_id INTEGER NOT NULL UNIQUE REFERENCES project_links(id),
    project_id INTEGER NOT NULL REFERENCES projects(id),
    enabled INTEGER NOT NULL DEFAULT 1,
    frequency TEXT NOT NULL,
    priority INTEGER NOT NULL,
    min_market_cap REAL,
    max_depth INTEGER NOT NULL,
    max_pages INTEGER NOT NULL,
    observed_change TEXT,
    last_significant_change TEXT,
    average_change_score REAL,
    next_run_at TEXT,
    last_run_at TEXT,
    consecutive_no_change INTEGER NOT NULL DEFAULT 0,
    backoff_multiplier REAL NOT NULL DEFAULT 1.0,
    significance_threshold REAL,
    is_paused INTEGER NOT NULL DEFAULT 0,
    pause_reason TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_schedules_due ON crawl_schedules(next_run_at);

-- Outbound request counters per service and day
CREATE TABLE IF NOT EXISTS api_usage (
    service TEXT NOT NULL,
    day TEXT NOT NULL,
    request_count INTEGER NOT NULL DEFAULT 0,
    bytes INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY(service, day)
);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
