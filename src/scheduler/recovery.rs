//! Failed-job retries and the stale-job sweep

use crate::config::SchedulerConfig;
use crate::scheduler::policy::{AdaptivePolicy, RunObservation};
use crate::state::CrawlStatus;
use crate::storage::{CrawlJobRecord, NewCrawlJob, Storage};
use crate::StrataError;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Message recorded on jobs failed by the sweep
pub const STALE_JOB_MESSAGE: &str = "stale job swept after exceeding timeout";

/// What happened after a job failed
#[derive(Debug, Clone, PartialEq)]
pub enum FailureResolution {
    /// A retry job was queued
    Retry {
        job_id: String,
        not_before: DateTime<Utc>,
    },
    /// No attempts left; the schedule (if any) moved on one interval
    Exhausted,
}

/// Queues a retry for a failed job or, with no attempts left, advances its
/// schedule
///
/// The schedule is left untouched while retries remain.
///
/// # Arguments
///
/// * `db` - Storage holding the job and its schedule
/// * `failed` - The job as recorded after `fail_job`
/// * `config` - Retry delays
/// * `policy` - Applied to the schedule when retries are exhausted
/// * `now` - Current time
pub fn resolve_failure(
    db: &mut dyn Storage,
    failed: &CrawlJobRecord,
    config: &SchedulerConfig,
    policy: &AdaptivePolicy,
    now: DateTime<Utc>,
) -> Result<FailureResolution, StrataError> {
    if !failed.status.is_retryable() {
        return Err(StrataError::Processing(format!(
            "job {} is {}, not a failure",
            failed.id, failed.status
        )));
    }

    if failed.retries_remaining() {
        let delay_secs = if failed.status == CrawlStatus::RateLimited {
            config.rate_limit_cooldown_secs
        } else {
            config.retry_delay_secs
        };
        let not_before = now + Duration::seconds(delay_secs as i64);
        let job_id = db.create_job(&NewCrawlJob {
            link_id: failed.link_id,
            project_id: failed.project_id,
            seed_url: failed.seed_url.clone(),
            params: failed.params.clone(),
            max_retries: failed.max_retries,
            retry_count: failed.retry_count,
            next_scheduled_run: Some(not_before),
        })?;
        info!(
            "Queued retry {} for job {} (attempt {} of {}) not before {}",
            job_id,
            failed.id,
            failed.retry_count + 1,
            failed.max_retries,
            not_before
        );
        return Ok(FailureResolution::Retry { job_id, not_before });
    }

    warn!(
        "Job {} for {} exhausted its {} attempts",
        failed.id, failed.seed_url, failed.max_retries
    );
    if let Some(mut schedule) = db.get_schedule_for_link(failed.link_id)? {
        policy.apply(&mut schedule, RunObservation::RetriesExhausted, now);
        db.save_schedule_adaptation(&schedule)?;
    }
    Ok(FailureResolution::Exhausted)
}

/// Returns true if an in-progress job has outlived its timeout plus `grace`
pub fn is_stale(job: &CrawlJobRecord, grace_secs: u64, now: DateTime<Utc>) -> bool {
    if job.status != CrawlStatus::InProgress {
        return false;
    }
    let Some(started_at) = job.started_at else {
        return false;
    };
    let limit = Duration::seconds((job.params.timeout_secs + grace_secs) as i64);
    started_at + limit < now
}

/// Fails in-progress jobs that outlived their timeout and applies retry logic
///
/// Jobs in `owned` belong to a worker that is still running and are left
/// alone however long they take; that worker records their outcome.
///
/// # Returns
///
/// Each swept job with what was done about it
pub fn sweep_stale_jobs(
    db: &mut dyn Storage,
    config: &SchedulerConfig,
    policy: &AdaptivePolicy,
    owned: &HashSet<String>,
    now: DateTime<Utc>,
) -> Result<Vec<(CrawlJobRecord, FailureResolution)>, StrataError> {
    let mut stale = Vec::new();
    for job in db.jobs_by_status(CrawlStatus::InProgress)? {
        if !is_stale(&job, config.stale_job_grace_secs, now) {
            continue;
        }
        if owned.contains(&job.id) {
            debug!("Job {} is overdue but its worker is still running", job.id);
            continue;
        }
        stale.push(job);
    }

    let mut swept = Vec::with_capacity(stale.len());
    for job in stale {
        warn!(
            "Sweeping stale job {} for {} (started {:?})",
            job.id, job.seed_url, job.started_at
        );
        let failed = db.fail_job(&job.id, CrawlStatus::Failed, STALE_JOB_MESSAGE)?;
        let resolution = resolve_failure(db, &failed, config, policy, now)?;
        swept.push((failed, resolution));
    }
    Ok(swept)
}
