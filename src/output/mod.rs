//! Output module for archive statistics and reports
//!
//! This module handles:
//! - Loading monitoring statistics from storage
//! - Printing them to the terminal
//! - Exporting a markdown report

mod markdown;
pub mod stats;

pub use markdown::{format_markdown_report, write_markdown_report};
pub use stats::{
    format_bytes, load_statistics, print_statistics, ArchiveStatistics, ChangeStats, CrawlStats,
    ScheduleStats, SnapshotStats, StorageStats,
};

use crate::storage::{ScheduleRecord, Storage};
use crate::StrataError;
use chrono::{DateTime, Utc};

/// Everything the markdown report shows
#[derive(Debug, Clone)]
pub struct ArchiveReport {
    pub generated_at: DateTime<Utc>,
    pub statistics: ArchiveStatistics,
    pub schedules: Vec<ScheduleRecord>,
}

/// Generates a report from storage
///
/// # Arguments
///
/// * `storage` - The storage backend containing archive data
/// * `recent_limit` - How many recent failures and changes to list
///
/// # Returns
///
/// * `Ok(ArchiveReport)` - Successfully generated report
/// * `Err(StrataError)` - Failed to query storage
pub fn generate_report(storage: &dyn Storage, recent_limit: usize) -> Result<ArchiveReport, StrataError> {
    Ok(ArchiveReport {
        generated_at: Utc::now(),
        statistics: load_statistics(storage, recent_limit)?,
        schedules: storage.list_schedules()?,
    })
}
