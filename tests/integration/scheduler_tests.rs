//! Scheduler dispatch: ordering, the concurrency ceiling, gating, and shutdown

use crate::helpers::{
    project, scheduler_with, scheduler_with_store, test_config, RecordingSink, ScriptedExecutor,
    SlowStore,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use sumi_strata::scheduler::{is_stale, DispatchItem, SkipReason};
use sumi_strata::storage::{self, CrawlParameters, NewCrawlJob, Storage};
use sumi_strata::{CrawlFrequency, CrawlStatus, Scheduler};
use tempfile::TempDir;

const ALPHA: &str = "https://alpha.example/";
const BRAVO: &str = "https://bravo.example/";
const CHARLIE: &str = "https://charlie.example/";
const DELTA: &str = "https://delta.example/";

fn scheduler(
    dir: &TempDir,
    max_concurrent: usize,
    executor: Arc<ScriptedExecutor>,
    projects: Vec<sumi_strata::config::ProjectEntry>,
) -> Scheduler {
    let config = test_config(dir, max_concurrent, projects);
    scheduler_with(config, executor, Arc::new(RecordingSink::default()))
}

fn ranked_projects() -> Vec<sumi_strata::config::ProjectEntry> {
    vec![
        project("CHARLIE", Some(5000), None, CHARLIE),
        project("ALPHA", Some(3), None, ALPHA),
        project("BRAVO", Some(400), None, BRAVO),
    ]
}

#[tokio::test]
async fn test_dispatch_follows_priority_under_single_slot() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(StdDuration::from_millis(30)));
    let scheduler = scheduler(&dir, 1, Arc::clone(&executor), ranked_projects());
    assert_eq!(scheduler.init_schedules().unwrap(), 3);

    let plan = scheduler.dry_run().unwrap();
    let planned: Vec<&str> = plan.dispatch.iter().map(DispatchItem::seed_url).collect();
    assert_eq!(planned, vec![ALPHA, BRAVO, CHARLIE]);
    assert!(plan.skipped.is_empty());

    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.dispatched.len(), 3);
    scheduler.wait_idle().await;

    assert_eq!(executor.started(), vec![ALPHA, BRAVO, CHARLIE]);
    assert_eq!(executor.peak(), 1);
    assert_eq!(scheduler.in_flight(), 0);
}

#[tokio::test]
async fn test_concurrency_ceiling_is_never_exceeded() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(StdDuration::from_millis(150)));
    let mut projects = ranked_projects();
    projects.push(project("DELTA", Some(50), None, DELTA));
    let scheduler = scheduler(&dir, 2, Arc::clone(&executor), projects);
    scheduler.init_schedules().unwrap();

    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.dispatched.len(), 4);
    scheduler.wait_idle().await;

    assert_eq!(executor.started().len(), 4);
    assert_eq!(executor.peak(), 2);

    let db = storage::lock(scheduler.storage()).unwrap();
    let counts = db.count_jobs_by_status().unwrap();
    assert_eq!(counts.get(&CrawlStatus::Completed), Some(&4));
}

#[tokio::test]
async fn test_completed_runs_push_schedules_out() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(StdDuration::from_millis(5)));
    let scheduler = scheduler(&dir, 2, Arc::clone(&executor), ranked_projects());
    scheduler.init_schedules().unwrap();

    scheduler.run_cycle().await.unwrap();
    scheduler.wait_idle().await;
    assert!(scheduler.dry_run().unwrap().is_empty());

    let db = storage::lock(scheduler.storage()).unwrap();
    let schedules = db.list_schedules().unwrap();
    assert_eq!(schedules.len(), 3);
    for schedule in schedules {
        let interval = schedule.frequency.base_interval().unwrap();
        let next = schedule.next_run_at.unwrap();
        assert!(next > Utc::now() + interval - Duration::minutes(1));
        assert!(schedule.last_run_at.is_some());
    }
}

#[tokio::test]
async fn test_failed_crawl_retries_before_new_work() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(StdDuration::from_millis(5)).failing_on(ALPHA));
    let scheduler = scheduler(&dir, 1, Arc::clone(&executor), ranked_projects());
    scheduler.init_schedules().unwrap();

    scheduler.run_cycle().await.unwrap();
    scheduler.wait_idle().await;

    let retry = {
        let db = storage::lock(scheduler.storage()).unwrap();
        let pending = db.jobs_by_status(CrawlStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seed_url, ALPHA);
        pending[0].clone()
    };

    // Once the retry delay has passed it comes first in the plan
    let later = retry.next_scheduled_run.unwrap() + Duration::seconds(1);
    let plan = scheduler.plan(later).unwrap();
    assert!(matches!(&plan.dispatch[0], DispatchItem::Retry(job) if job.id == retry.id));
    assert!(plan
        .skipped
        .iter()
        .any(|(due, reason)| due.seed_url == ALPHA
            && matches!(reason, SkipReason::ActiveJob { status: CrawlStatus::Pending, .. })));
}

#[tokio::test]
async fn test_market_cap_gate_skips_small_projects() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(StdDuration::from_millis(5)));
    let mut config = test_config(
        &dir,
        2,
        vec![
            project("ALPHA", Some(3), Some(5.0e9), ALPHA),
            project("BRAVO", Some(900), Some(2.0e6), BRAVO),
            project("CHARLIE", None, None, CHARLIE),
        ],
    );
    config.scheduler.min_market_cap = Some(1.0e8);
    let scheduler = scheduler_with(config, executor, Arc::new(RecordingSink::default()));
    scheduler.init_schedules().unwrap();

    let plan = scheduler.dry_run().unwrap();
    let planned: Vec<&str> = plan.dispatch.iter().map(DispatchItem::seed_url).collect();
    assert_eq!(planned, vec![ALPHA, CHARLIE]);
    assert_eq!(plan.skipped.len(), 1);
    assert_eq!(plan.skipped[0].0.seed_url, BRAVO);
    assert_eq!(
        plan.skipped[0].1,
        SkipReason::BelowMarketCap {
            required: 1.0e8,
            actual: 2.0e6
        }
    );
}

#[tokio::test]
async fn test_paused_and_retimed_schedules() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(StdDuration::from_millis(5)));
    let scheduler = scheduler(&dir, 1, executor, ranked_projects());
    scheduler.init_schedules().unwrap();

    let ids: Vec<i64> = {
        let db = storage::lock(scheduler.storage()).unwrap();
        db.list_schedules().unwrap().iter().map(|s| s.id).collect()
    };
    scheduler.pause_schedule(ids[0], "site migration").unwrap();
    assert_eq!(scheduler.dry_run().unwrap().dispatch.len(), 2);

    scheduler.resume_schedule(ids[0]).unwrap();
    assert_eq!(scheduler.dry_run().unwrap().dispatch.len(), 3);

    let updated = scheduler
        .update_schedule_frequency(ids[1], CrawlFrequency::Daily, Some(9))
        .unwrap();
    assert_eq!(updated.frequency, CrawlFrequency::Daily);
    assert_eq!(updated.priority, 9);
    assert_eq!(updated.backoff_multiplier, 1.0);
    assert!(updated.next_run_at.unwrap() > Utc::now() + Duration::hours(23));
    assert_eq!(scheduler.dry_run().unwrap().dispatch.len(), 2);
}

#[tokio::test]
async fn test_shutdown_cancels_queued_jobs() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(StdDuration::from_millis(5)));
    let scheduler = scheduler(&dir, 1, Arc::clone(&executor), ranked_projects());
    scheduler.sync_projects().unwrap();

    let queued = {
        let mut db = storage::lock(scheduler.storage()).unwrap();
        let project = db.get_project_by_code("ALPHA").unwrap().unwrap();
        let link = db.primary_link_for_project(project.id).unwrap().unwrap();
        db.create_job(&NewCrawlJob {
            link_id: link.id,
            project_id: project.id,
            seed_url: link.url.clone(),
            params: CrawlParameters::default(),
            max_retries: 3,
            retry_count: 1,
            next_scheduled_run: Some(Utc::now() + Duration::hours(1)),
        })
        .unwrap()
    };

    scheduler.request_shutdown();
    tokio::time::timeout(StdDuration::from_secs(5), scheduler.run_daemon())
        .await
        .expect("daemon did not stop")
        .unwrap();

    assert!(executor.started().is_empty());
    let db = storage::lock(scheduler.storage()).unwrap();
    assert_eq!(db.get_job(&queued).unwrap().status, CrawlStatus::Cancelled);
}

#[tokio::test]
async fn test_daemon_crawls_due_work_until_stopped() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(StdDuration::from_millis(20)));
    let scheduler = Arc::new(scheduler(&dir, 2, Arc::clone(&executor), ranked_projects()));

    let daemon = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run_daemon().await })
    };

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    while executor.started().len() < 3 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    scheduler.request_shutdown();
    tokio::time::timeout(StdDuration::from_secs(10), daemon)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(executor.started().len(), 3);
    let db = storage::lock(scheduler.storage()).unwrap();
    let counts = db.count_jobs_by_status().unwrap();
    assert_eq!(counts.get(&CrawlStatus::Completed), Some(&3));
    assert_eq!(db.snapshot_counts().unwrap().0, 3);
}

#[tokio::test]
async fn test_running_job_reports_progress() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(StdDuration::from_millis(600)));
    let scheduler = scheduler(&dir, 1, executor, vec![project("ALPHA", Some(3), None, ALPHA)]);
    scheduler.init_schedules().unwrap();

    let report = scheduler.run_cycle().await.unwrap();
    let job_id = report.dispatched[0].clone();

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(2);
    let running = loop {
        let job = storage::lock(scheduler.storage())
            .unwrap()
            .get_job(&job_id)
            .unwrap();
        if job.progress_percentage > 0.0 || tokio::time::Instant::now() > deadline {
            break job;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    };
    assert_eq!(running.status, CrawlStatus::InProgress);
    assert_eq!(running.pages_crawled, 1);
    let expected = 100.0 / running.params.max_pages as f64;
    assert!((running.progress_percentage - expected).abs() < 1e-9);

    scheduler.wait_idle().await;
    let done = storage::lock(scheduler.storage())
        .unwrap()
        .get_job(&job_id)
        .unwrap();
    assert_eq!(done.status, CrawlStatus::Completed);
    assert_eq!(done.progress_percentage, 100.0);
}

#[tokio::test]
async fn test_overdue_job_with_live_worker_is_not_swept() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(StdDuration::from_millis(20)));
    let mut config = test_config(&dir, 1, vec![project("ALPHA", Some(3), None, ALPHA)]);
    config.crawl.timeout_secs = 1;
    config.scheduler.stale_job_grace_secs = 0;
    let store = Arc::new(SlowStore::new(
        &config.storage.artifact_dir,
        StdDuration::from_millis(2500),
    ));
    let scheduler =
        scheduler_with_store(config, executor, Arc::new(RecordingSink::default()), store);
    scheduler.init_schedules().unwrap();

    let first = scheduler.run_cycle().await.unwrap();
    assert_eq!(first.dispatched.len(), 1);
    let job_id = first.dispatched[0].clone();

    // The crawl finished quickly but storing its capture outlasts timeout plus grace
    tokio::time::sleep(StdDuration::from_millis(1500)).await;
    {
        let db = storage::lock(scheduler.storage()).unwrap();
        let job = db.get_job(&job_id).unwrap();
        assert_eq!(job.status, CrawlStatus::InProgress);
        assert!(is_stale(&job, 0, Utc::now()));
    }
    let second = scheduler.run_cycle().await.unwrap();
    assert_eq!(second.swept, 0);
    assert!(second.dispatched.is_empty());

    scheduler.wait_idle().await;
    let db = storage::lock(scheduler.storage()).unwrap();
    assert_eq!(db.get_job(&job_id).unwrap().status, CrawlStatus::Completed);
    assert!(db.jobs_by_status(CrawlStatus::Pending).unwrap().is_empty());
    let link = db.get_link_by_url(ALPHA).unwrap().unwrap();
    assert_eq!(db.snapshots_for_link(link.id).unwrap().len(), 1);
}
