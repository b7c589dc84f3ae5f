//! Archive statistics from the database
//!
//! This module provides the monitoring read interface: counts and averages
//! over jobs, snapshots, artifacts, change records, and schedules.

use crate::state::{ChangeType, CrawlFrequency, CrawlStatus, ObservedChangeFrequency};
use crate::storage::{ChangeRecord, CrawlJobRecord, Storage};
use crate::StrataError;
use std::collections::HashMap;

/// Artifact storage usage
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub artifact_count: u64,
    pub total_bytes: u64,
    /// Backend name to (file count, bytes)
    pub by_backend: HashMap<String, (u64, u64)>,
}

/// Crawl job outcomes
#[derive(Debug, Clone, Default)]
pub struct CrawlStats {
    pub by_status: HashMap<CrawlStatus, u64>,
    /// Completed share of finished jobs, in percent; `None` before any finished
    pub success_rate: Option<f64>,
    pub average_pages: Option<f64>,
    pub average_duration_secs: Option<f64>,
}

impl CrawlStats {
    pub fn count(&self, status: CrawlStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.by_status.values().sum()
    }
}

/// Change detection results
#[derive(Debug, Clone, Default)]
pub struct ChangeStats {
    pub by_type: HashMap<ChangeType, u64>,
    pub significant: u64,
    pub average_score: Option<f64>,
    pub pending_reanalysis: u64,
}

/// Snapshot counts
#[derive(Debug, Clone, Default)]
pub struct SnapshotStats {
    pub total: u64,
    pub tracked_links: u64,
    pub incomplete: u64,
}

/// Schedule counts
#[derive(Debug, Clone, Default)]
pub struct ScheduleStats {
    pub total: u64,
    pub enabled: u64,
    pub paused: u64,
    pub by_frequency: HashMap<CrawlFrequency, u64>,
    pub by_observed: HashMap<ObservedChangeFrequency, u64>,
}

/// Archive statistics summary
#[derive(Debug, Clone, Default)]
pub struct ArchiveStatistics {
    pub storage: StorageStats,
    pub crawls: CrawlStats,
    pub changes: ChangeStats,
    pub snapshots: SnapshotStats,
    pub schedules: ScheduleStats,
    pub recent_failures: Vec<CrawlJobRecord>,
    pub recent_changes: Vec<ChangeRecord>,
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `storage` - The storage backend to query
/// * `recent_limit` - How many recent failures and significant changes to include
///
/// # Returns
///
/// * `Ok(ArchiveStatistics)` - Successfully loaded statistics
/// * `Err(StrataError)` - Failed to query statistics
pub fn load_statistics(
    storage: &dyn Storage,
    recent_limit: usize,
) -> Result<ArchiveStatistics, StrataError> {
    let by_backend = storage.artifact_totals()?;
    let storage_stats = StorageStats {
        artifact_count: by_backend.values().map(|(count, _)| count).sum(),
        total_bytes: by_backend.values().map(|(_, bytes)| bytes).sum(),
        by_backend,
    };

    let by_status = storage.count_jobs_by_status()?;
    let completed = by_status.get(&CrawlStatus::Completed).copied().unwrap_or(0);
    let finished: u64 = by_status
        .iter()
        .filter(|(status, _)| status.is_terminal() && **status != CrawlStatus::Cancelled)
        .map(|(_, count)| count)
        .sum();
    let (average_pages, average_duration_secs) = storage.snapshot_averages()?;
    let crawls = CrawlStats {
        by_status,
        success_rate: (finished > 0).then(|| completed as f64 / finished as f64 * 100.0),
        average_pages,
        average_duration_secs,
    };

    let (significant, average_score) = storage.change_summary()?;
    let changes = ChangeStats {
        by_type: storage.count_changes_by_type()?,
        significant,
        average_score,
        pending_reanalysis: storage.pending_reanalysis(0.0)?.len() as u64,
    };

    let (total, tracked_links, incomplete) = storage.snapshot_counts()?;
    let snapshots = SnapshotStats {
        total,
        tracked_links,
        incomplete,
    };

    let all_schedules = storage.list_schedules()?;
    let schedules = ScheduleStats {
        total: all_schedules.len() as u64,
        enabled: all_schedules.iter().filter(|s| s.enabled).count() as u64,
        paused: all_schedules.iter().filter(|s| s.is_paused).count() as u64,
        by_frequency: storage.count_schedules_by_frequency()?,
        by_observed: storage.count_schedules_by_observed()?,
    };

    Ok(ArchiveStatistics {
        storage: storage_stats,
        crawls,
        changes,
        snapshots,
        schedules,
        recent_failures: storage.recent_failed_jobs(recent_limit)?,
        recent_changes: storage.recent_significant_changes(recent_limit)?,
    })
}

/// Formats a byte count with a binary unit
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn format_optional(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_else(|| "n/a".to_string())
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &ArchiveStatistics) {
    println!("=== Archive Statistics ===\n");

    println!("Storage:");
    println!("  Artifacts: {}", stats.storage.artifact_count);
    println!("  Total size: {}", format_bytes(stats.storage.total_bytes));
    let mut backends: Vec<_> = stats.storage.by_backend.iter().collect();
    backends.sort_by(|a, b| a.0.cmp(b.0));
    for (backend, (count, bytes)) in backends {
        println!("  {}: {} files, {}", backend, count, format_bytes(*bytes));
    }
    println!();

    println!("Crawl Jobs ({}):", stats.crawls.total());
    for status in CrawlStatus::all_states() {
        let count = stats.crawls.count(status);
        if count > 0 {
            println!("  {}: {}", status, count);
        }
    }
    println!(
        "  Success rate: {}%",
        format_optional(stats.crawls.success_rate, 1)
    );
    println!(
        "  Average pages: {}",
        format_optional(stats.crawls.average_pages, 1)
    );
    println!(
        "  Average duration: {}s",
        format_optional(stats.crawls.average_duration_secs, 1)
    );
    println!();

    println!("Snapshots:");
    println!("  Total: {}", stats.snapshots.total);
    println!("  Tracked links: {}", stats.snapshots.tracked_links);
    println!("  Incomplete: {}", stats.snapshots.incomplete);
    println!();

    println!("Changes:");
    let mut by_type: Vec<_> = stats.changes.by_type.iter().collect();
    by_type.sort_by(|a, b| b.1.cmp(a.1));
    for (change_type, count) in by_type {
        println!("  {}: {}", change_type, count);
    }
    println!("  Significant: {}", stats.changes.significant);
    println!(
        "  Average score: {}",
        format_optional(stats.changes.average_score, 3)
    );
    println!(
        "  Awaiting reanalysis: {}",
        stats.changes.pending_reanalysis
    );
    println!();

    println!("Schedules:");
    println!(
        "  Total: {} ({} enabled, {} paused)",
        stats.schedules.total, stats.schedules.enabled, stats.schedules.paused
    );
    for frequency in CrawlFrequency::all() {
        if let Some(count) = stats.schedules.by_frequency.get(&frequency) {
            println!("  {}: {}", frequency, count);
        }
    }
    let mut observed: Vec<_> = stats.schedules.by_observed.iter().collect();
    observed.sort_by(|a, b| b.1.cmp(a.1));
    for (label, count) in observed {
        println!("  observed {}: {}", label, count);
    }

    if !stats.recent_failures.is_empty() {
        println!("\nRecent Failures:");
        for job in &stats.recent_failures {
            println!(
                "  - {} {} ({}): {}",
                job.id,
                job.seed_url,
                job.status,
                job.error_message.as_deref().unwrap_or("no message")
            );
        }
    }

    if !stats.recent_changes.is_empty() {
        println!("\nRecent Significant Changes:");
        for change in &stats.recent_changes {
            println!(
                "  - change {}: {} (score {}) snapshot {} -> {}",
                change.id,
                change.analysis.change_type(),
                format_optional(change.analysis.change_score(), 3),
                change.old_snapshot_id,
                change.new_snapshot_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CrawlParameters, NewCrawlJob, SqliteStorage};

    fn new_job(storage: &mut SqliteStorage, link_id: i64, project_id: i64) -> String {
        storage
            .create_job(&NewCrawlJob {
                link_id,
                project_id,
                seed_url: "https://uniswap.org/".to_string(),
                params: CrawlParameters::default(),
                max_retries: 3,
                retry_count: 0,
                next_scheduled_run: None,
            })
            .unwrap()
    }

    #[test]
    fn test_empty_database_statistics() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        let stats = load_statistics(&storage, 5).unwrap();
        assert_eq!(stats.storage.artifact_count, 0);
        assert_eq!(stats.crawls.total(), 0);
        assert_eq!(stats.crawls.success_rate, None);
        assert_eq!(stats.snapshots.total, 0);
        assert!(stats.recent_failures.is_empty());
    }

    #[test]
    fn test_success_rate_ignores_cancelled_and_active() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let project_id = storage.upsert_project("UNI", "Uniswap", Some(20), None).unwrap();
        let link_id = storage
            .insert_or_get_link(project_id, "https://uniswap.org/")
            .unwrap();

        let done = new_job(&mut storage, link_id, project_id);
        storage.start_job(&done).unwrap();
        storage.complete_job(&done, 3, 300).unwrap();

        let failed = new_job(&mut storage, link_id, project_id);
        storage.start_job(&failed).unwrap();
        storage.fail_job(&failed, CrawlStatus::Failed, "boom").unwrap();

        let cancelled = new_job(&mut storage, link_id, project_id);
        storage.cancel_job(&cancelled, "test").unwrap();

        new_job(&mut storage, link_id, project_id);

        let stats = load_statistics(&storage, 5).unwrap();
        assert_eq!(stats.crawls.total(), 4);
        assert_eq!(stats.crawls.count(CrawlStatus::Pending), 1);
        assert_eq!(stats.crawls.success_rate, Some(50.0));
        assert_eq!(stats.recent_failures.len(), 1);
        assert_eq!(stats.recent_failures[0].id, failed);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
