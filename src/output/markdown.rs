//! Markdown report generation
//!
//! Renders an [`ArchiveReport`] as a human-readable markdown document.

use crate::output::stats::format_bytes;
use crate::output::ArchiveReport;
use crate::state::{CrawlFrequency, CrawlStatus};
use crate::StrataError;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Writes the markdown report to `output_path`
///
/// # Arguments
///
/// * `report` - The report data
/// * `output_path` - Path where the markdown file should be written
pub fn write_markdown_report(report: &ArchiveReport, output_path: &Path) -> Result<(), StrataError> {
    let markdown = format_markdown_report(report);

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = File::create(output_path)?;
    file.write_all(markdown.as_bytes())?;

    Ok(())
}

fn or_na(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_else(|| "n/a".to_string())
}

/// Formats the report as markdown
pub fn format_markdown_report(report: &ArchiveReport) -> String {
    let stats = &report.statistics;
    let mut md = String::new();

    md.push_str("# Sumi-Strata Archive Report\n\n");
    md.push_str(&format!(
        "Generated {}\n\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    // Overview
    md.push_str("## Overview\n\n");
    md.push_str(&format!("- **Snapshots**: {}\n", stats.snapshots.total));
    md.push_str(&format!(
        "- **Tracked Links**: {}\n",
        stats.snapshots.tracked_links
    ));
    md.push_str(&format!(
        "- **Incomplete Snapshots**: {}\n",
        stats.snapshots.incomplete
    ));
    md.push_str(&format!(
        "- **Artifacts**: {} ({})\n",
        stats.storage.artifact_count,
        format_bytes(stats.storage.total_bytes)
    ));
    md.push_str(&format!(
        "- **Crawl Success Rate**: {}%\n",
        or_na(stats.crawls.success_rate, 2)
    ));
    md.push_str(&format!(
        "- **Average Pages per Snapshot**: {}\n",
        or_na(stats.crawls.average_pages, 1)
    ));
    md.push_str(&format!(
        "- **Average Crawl Duration**: {}s\n\n",
        or_na(stats.crawls.average_duration_secs, 1)
    ));

    // Jobs
    md.push_str("## Crawl Jobs\n\n");
    md.push_str("| Status | Count |\n");
    md.push_str("|--------|-------|\n");
    for status in CrawlStatus::all_states() {
        md.push_str(&format!("| {} | {} |\n", status, stats.crawls.count(status)));
    }
    md.push('\n');

    // Changes
    md.push_str("## Changes\n\n");
    md.push_str(&format!(
        "- **Significant**: {}\n",
        stats.changes.significant
    ));
    md.push_str(&format!(
        "- **Average Score**: {}\n",
        or_na(stats.changes.average_score, 3)
    ));
    md.push_str(&format!(
        "- **Awaiting Reanalysis**: {}\n\n",
        stats.changes.pending_reanalysis
    ));
    if !stats.changes.by_type.is_empty() {
        let mut by_type: Vec<_> = stats.changes.by_type.iter().collect();
        by_type.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.to_string().cmp(&b.0.to_string())));
        md.push_str("| Change Type | Count |\n");
        md.push_str("|-------------|-------|\n");
        for (change_type, count) in by_type {
            md.push_str(&format!("| {} | {} |\n", change_type, count));
        }
        md.push('\n');
    }

    if !stats.recent_changes.is_empty() {
        md.push_str("### Recent Significant Changes\n\n");
        md.push_str("| Change | Type | Score | Snapshots | Computed |\n");
        md.push_str("|--------|------|-------|-----------|----------|\n");
        for change in &stats.recent_changes {
            md.push_str(&format!(
                "| {} | {} | {} | {} → {} | {} |\n",
                change.id,
                change.analysis.change_type(),
                or_na(change.analysis.change_score(), 3),
                change.old_snapshot_id,
                change.new_snapshot_id,
                change.computed_at.format("%Y-%m-%d %H:%M")
            ));
        }
        md.push('\n');
    }

    // Schedules
    md.push_str("## Schedules\n\n");
    md.push_str(&format!(
        "- **Total**: {} ({} enabled, {} paused)\n",
        stats.schedules.total, stats.schedules.enabled, stats.schedules.paused
    ));
    for frequency in CrawlFrequency::all() {
        if let Some(count) = stats.schedules.by_frequency.get(&frequency) {
            md.push_str(&format!("- **{}**: {}\n", frequency, count));
        }
    }
    md.push('\n');

    if !report.schedules.is_empty() {
        md.push_str("| Schedule | Link | Frequency | Priority | Observed | Backoff | Next Run | State |\n");
        md.push_str("|----------|------|-----------|----------|----------|---------|----------|-------|\n");
        for schedule in &report.schedules {
            let state = if schedule.is_paused {
                format!(
                    "paused ({})",
                    schedule.pause_reason.as_deref().unwrap_or("no reason")
                )
            } else if schedule.enabled {
                "active".to_string()
            } else {
                "disabled".to_string()
            };
            md.push_str(&format!(
                "| {} | {} | {} | {} | {} | {:.1}x | {} | {} |\n",
                schedule.id,
                schedule.link_id,
                schedule.frequency,
                schedule.priority,
                schedule
                    .observed_change
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                schedule.backoff_multiplier,
                schedule
                    .next_run_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string()),
                state
            ));
        }
        md.push('\n');
    }

    // Failures
    if !stats.recent_failures.is_empty() {
        md.push_str("## Recent Failures\n\n");
        for job in &stats.recent_failures {
            md.push_str(&format!(
                "- `{}` {} ({}, attempt {} of {}): {}\n",
                job.id,
                job.seed_url,
                job.status,
                job.retry_count,
                job.max_retries,
                job.error_message.as_deref().unwrap_or("no message")
            ));
        }
        md.push('\n');
    }

    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::stats::ArchiveStatistics;
    use chrono::Utc;
    use tempfile::TempDir;

    fn report() -> ArchiveReport {
        ArchiveReport {
            generated_at: Utc::now(),
            statistics: ArchiveStatistics::default(),
            schedules: Vec::new(),
        }
    }

    #[test]
    fn test_format_empty_report() {
        let md = format_markdown_report(&report());
        assert!(md.contains("# Sumi-Strata Archive Report"));
        assert!(md.contains("- **Snapshots**: 0"));
        assert!(md.contains("- **Crawl Success Rate**: n/a%"));
        assert!(md.contains("| completed | 0 |"));
        assert!(!md.contains("## Recent Failures"));
    }

    #[test]
    fn test_write_report_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports").join("archive.md");
        write_markdown_report(&report(), &path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# Sumi-Strata Archive Report"));
    }
}
