//! End-to-end crawls against a mock site: capture, versioning, change
//! detection, indexing, and failure handling

use crate::helpers::{
    pipeline_with, project, scheduler_with, test_config, user_agent, RecordingSink,
    ScriptedExecutor,
};
use chrono::{Duration, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use sumi_strata::archive::{lookup, snapshot_urls, JobOutcome, LocalArtifactStore};
use sumi_strata::crawler::{SimpleHttpExecutor, UsageCounter};
use sumi_strata::reanalysis::{acknowledge, pending_signals};
use sumi_strata::scheduler::{CrawlTarget, ManualCrawl, SkipReason, STALE_JOB_MESSAGE};
use sumi_strata::storage::{self, CrawlParameters, NewCrawlJob, Storage};
use sumi_strata::{ChangeType, CrawlStatus, Scheduler};
use tempfile::TempDir;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HOME: &str = "<html><body>\
    <section id=\"about\"><p>We build a fast settlement layer for global payments with low fees</p></section>\
    <section id=\"team\"><p>Our team has shipped consensus research and production wallets</p></section>\
    </body></html>";

const REDESIGNED: &str = "<html><body><main class=\"v2\"><h1>Totally new product launch</h1>\
    <p>Nothing from before survives in this version of the page</p></main></body></html>";

async fn serve_home(server: &MockServer, body: &str) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html"))
        .mount(server)
        .await;
}

fn http_scheduler(dir: &TempDir, website: &str, sink: Arc<RecordingSink>) -> Scheduler {
    let config = test_config(dir, 2, vec![project("PAY", Some(10), None, website)]);
    let executor = SimpleHttpExecutor::new(&user_agent(), UsageCounter::new()).unwrap();
    scheduler_with(config, Arc::new(executor), sink)
}

fn crawl_pay() -> ManualCrawl {
    ManualCrawl::new(CrawlTarget::Project("PAY".to_string()))
}

#[tokio::test]
async fn test_recrawls_build_version_chain_and_flag_redesign() {
    let server = MockServer::start().await;
    let website = format!("{}/", server.uri());
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let scheduler = http_scheduler(&dir, &website, Arc::clone(&sink));
    assert_eq!(scheduler.init_schedules().unwrap(), 1);

    // First capture: version 1, nothing to compare against
    serve_home(&server, HOME).await;
    let first = scheduler.trigger_manual(&crawl_pay()).await.unwrap();
    assert!(first.outcome.is_completed());
    assert_eq!(first.snapshot_version(), Some(1));
    assert!(first.change().is_none());

    // Unchanged site: version 2, exact no-change
    let second = scheduler.trigger_manual(&crawl_pay()).await.unwrap();
    assert_eq!(second.snapshot_version(), Some(2));
    let unchanged = second.change().unwrap();
    assert_eq!(unchanged.analysis.change_type(), ChangeType::NoChange);
    assert!(!unchanged.analysis.is_significant());
    assert!(!unchanged.requires_reanalysis);

    // Redesigned site: version 3, significant and pushed for reanalysis
    serve_home(&server, REDESIGNED).await;
    let third = scheduler.trigger_manual(&crawl_pay()).await.unwrap();
    assert_eq!(third.snapshot_version(), Some(3));
    assert!(third.outcome.is_significant());
    let redesign = third.change().unwrap();
    assert!(redesign.requires_reanalysis);

    let signals = sink.signals();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].project_code, "PAY");
    assert_eq!(signals[0].new_version, 3);
    assert_eq!(signals[0].change_id, redesign.id);

    let mut db = storage::lock(scheduler.storage()).unwrap();
    let link = db.get_link_by_url(&website).unwrap().unwrap();

    let chain = db.snapshots_for_link(link.id).unwrap();
    let versions: Vec<u32> = chain.iter().map(|s| s.version_number).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert!(chain.iter().all(|s| s.processing_complete));
    assert!(chain[0].is_first_snapshot);
    assert!(chain[2].has_significant_changes);

    // Each snapshot owns a stored, indexed artifact
    for snapshot in &chain {
        let artifact = db.artifact_for_snapshot(snapshot.id).unwrap().unwrap();
        assert!(artifact.cdx_available);
        assert!(Path::new(&artifact.storage_path).exists());
    }
    let staged: Vec<_> = std::fs::read_dir(dir.path().join("staging"))
        .map(|entries| entries.flatten().collect())
        .unwrap_or_default();
    assert!(staged.is_empty());

    let record = lookup(&*db, &website, Some(chain[0].id), None).unwrap().unwrap();
    assert_eq!(record.snapshot_id, chain[0].id);
    assert_eq!(record.entry.status_code, Some(200));
    assert!(snapshot_urls(&*db, chain[2].id)
        .unwrap()
        .iter()
        .any(|url| url.trim_end_matches('/') == website.trim_end_matches('/')));

    // The schedule saw one no-change run, then a significant one
    let schedule = db.get_schedule_for_link(link.id).unwrap().unwrap();
    assert_eq!(schedule.consecutive_no_change, 0);
    assert!(schedule.last_significant_change.is_some());
    assert!(schedule.next_run_at.unwrap() > Utc::now() + Duration::days(6));

    let pending = pending_signals(&*db, 0.3).unwrap();
    assert_eq!(pending.len(), 1);
    acknowledge(&mut *db, redesign.id).unwrap();
    assert!(pending_signals(&*db, 0.3).unwrap().is_empty());
}

#[tokio::test]
async fn test_server_error_fails_job_and_queues_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let website = format!("{}/", server.uri());
    let dir = TempDir::new().unwrap();
    let scheduler = http_scheduler(&dir, &website, Arc::new(RecordingSink::default()));
    scheduler.init_schedules().unwrap();

    let result = scheduler.trigger_manual(&crawl_pay()).await.unwrap();
    let JobOutcome::Failed { job, rate_limited, .. } = &result.outcome else {
        panic!("expected a failed crawl, got {:?}", result.outcome);
    };
    assert!(!rate_limited);
    assert_eq!(job.status, CrawlStatus::Failed);
    assert_eq!(job.retry_count, 1);
    assert!(result.snapshot_version().is_none());

    let overview = scheduler.list_pending().unwrap();
    assert_eq!(overview.pending_jobs.len(), 1);
    let retry = &overview.pending_jobs[0];
    assert_eq!(retry.retry_count, 1);
    assert!(retry.next_scheduled_run.unwrap() > Utc::now() + Duration::seconds(800));

    // The retry is not due yet, and it blocks the schedule from dispatching
    assert!(overview.plan.dispatch.is_empty());
    assert_eq!(overview.plan.skipped.len(), 1);
    assert!(matches!(
        &overview.plan.skipped[0].1,
        SkipReason::ActiveJob { job_id, status: CrawlStatus::Pending } if *job_id == retry.id
    ));

    let db = storage::lock(scheduler.storage()).unwrap();
    let link = db.get_link_by_url(&website).unwrap().unwrap();
    assert!(db.snapshots_for_link(link.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_throttled_seed_waits_for_cooldown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    let website = format!("{}/", server.uri());
    let dir = TempDir::new().unwrap();
    let scheduler = http_scheduler(&dir, &website, Arc::new(RecordingSink::default()));
    scheduler.sync_projects().unwrap();

    let result = scheduler.trigger_manual(&crawl_pay()).await.unwrap();
    assert!(matches!(
        &result.outcome,
        JobOutcome::Failed { rate_limited: true, job, .. } if job.status == CrawlStatus::RateLimited
    ));

    let overview = scheduler.list_pending().unwrap();
    assert_eq!(overview.pending_jobs.len(), 1);
    let not_before = overview.pending_jobs[0].next_scheduled_run.unwrap();
    assert!(not_before > Utc::now() + Duration::seconds(3500));
}

#[tokio::test]
async fn test_manual_crawl_of_untracked_url() {
    let server = MockServer::start().await;
    serve_home(&server, HOME).await;
    let website = format!("{}/", server.uri());
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, 1, Vec::new());
    let executor = SimpleHttpExecutor::new(&user_agent(), UsageCounter::new()).unwrap();
    let scheduler = scheduler_with(config, Arc::new(executor), Arc::new(RecordingSink::default()));

    let result = scheduler
        .trigger_manual(&ManualCrawl {
            target: CrawlTarget::parse(&website),
            engine: None,
            max_depth: Some(0),
            max_pages: Some(1),
        })
        .await
        .unwrap();
    assert_eq!(result.snapshot_version(), Some(1));

    let db = storage::lock(scheduler.storage()).unwrap();
    let project = db.get_project_by_code("127.0.0.1").unwrap().unwrap();
    let link = db.primary_link_for_project(project.id).unwrap().unwrap();
    assert_eq!(link.url, website);
    let job = db.get_job(&result.job_id).unwrap();
    assert_eq!(job.params.max_depth, 0);
    assert_eq!(job.params.max_pages, 1);
    assert_eq!(job.status, CrawlStatus::Completed);
}

#[tokio::test]
async fn test_unknown_project_is_rejected() {
    let dir = TempDir::new().unwrap();
    let scheduler = http_scheduler(&dir, "https://pay.example/", Arc::new(RecordingSink::default()));
    let err = scheduler
        .trigger_manual(&ManualCrawl::new(CrawlTarget::Project("NOPE".to_string())))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("NOPE"));
}

fn words(prefix: &str, count: usize) -> String {
    (0..count)
        .map(|i| format!("{}{}", prefix, i))
        .collect::<Vec<_>>()
        .join(" ")
}

const IMAGES: [&str; 3] = ["/chart.png", "/team.jpg", "/map.svg"];

async fn serve_site(server: &MockServer, body: &str, images: &[&str]) {
    serve_home(server, &format!("<html><body>{}</body></html>", body)).await;
    for image in images {
        Mock::given(method("GET"))
            .and(path(*image))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(format!("pixels of {}", image), "image/png"),
            )
            .mount(server)
            .await;
    }
}

/// Crawls `old_body`, then `new_body` with three new images, and returns the change
async fn crawl_growth(old_body: &str, new_body: &str) -> (JobOutcome, Vec<u32>) {
    let server = MockServer::start().await;
    let website = format!("{}/", server.uri());
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let scheduler = http_scheduler(&dir, &website, Arc::clone(&sink));
    scheduler.init_schedules().unwrap();

    serve_site(&server, old_body, &[]).await;
    let first = scheduler.trigger_manual(&crawl_pay()).await.unwrap();
    assert_eq!(first.snapshot_version(), Some(1));

    let images: String = IMAGES
        .iter()
        .map(|src| format!("<img src=\"{}\">", src))
        .collect();
    serve_site(&server, &format!("{}{}", new_body, images), &IMAGES).await;
    let second = scheduler.trigger_manual(&crawl_pay()).await.unwrap();
    assert_eq!(second.snapshot_version(), Some(2));

    let versions = sink.signals().iter().map(|s| s.new_version).collect();
    (second.outcome, versions)
}

fn assert_flagged_growth(outcome: &JobOutcome, signalled: &[u32]) {
    let JobOutcome::Completed {
        change: Some(change),
        ..
    } = outcome
    else {
        panic!("expected a compared snapshot, got {:?}", outcome);
    };
    let metrics = change.analysis.metrics();
    assert!(matches!(
        metrics.change_type,
        ChangeType::ContentAdded | ChangeType::StructureChanged
    ));
    assert!(change.analysis.change_score().unwrap() >= 0.3);
    assert_eq!(metrics.text_removed_bytes, 0);
    assert_eq!(metrics.resources_added, 3);
    assert!(change.analysis.is_significant());
    assert!(change.requires_reanalysis);
    assert_eq!(signalled, &[2]);
}

#[tokio::test]
async fn test_new_section_on_plain_page_is_flagged_growth() {
    let intro = words("intro", 500);
    let news = words("news", 1000);
    let (outcome, signalled) = crawl_growth(
        &format!("<p>{}</p>", intro),
        &format!("<p>{}</p><section id=\"news\"><p>{}</p></section>", intro, news),
    )
    .await;
    assert_flagged_growth(&outcome, &signalled);
}

#[tokio::test]
async fn test_new_section_beside_existing_ones_is_flagged_growth() {
    let intro = words("intro", 500);
    let news = words("news", 1000);
    let (outcome, signalled) = crawl_growth(
        &format!("<section id=\"intro\"><p>{}</p></section>", intro),
        &format!(
            "<section id=\"intro\"><p>{}</p></section><section id=\"news\"><p>{}</p></section>",
            intro, news
        ),
    )
    .await;
    assert_flagged_growth(&outcome, &signalled);
}

#[tokio::test]
async fn test_abort_of_job_failed_elsewhere_reports_cancelled() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, 1, Vec::new());
    let executor = Arc::new(ScriptedExecutor::new(StdDuration::from_secs(5)));
    let store = Arc::new(LocalArtifactStore::new(&config.storage.artifact_dir));
    let (shared, pipeline) =
        pipeline_with(&config, executor, Arc::new(RecordingSink::default()), store);

    let job_id = {
        let mut db = storage::lock(&shared).unwrap();
        let project_id = db.upsert_project("PAY", "Pay Project", Some(10), None).unwrap();
        let link_id = db.insert_or_get_link(project_id, "https://pay.example/").unwrap();
        db.create_job(&NewCrawlJob {
            link_id,
            project_id,
            seed_url: "https://pay.example/".to_string(),
            params: CrawlParameters::default(),
            max_retries: 3,
            retry_count: 0,
            next_scheduled_run: None,
        })
        .unwrap()
    };

    let (abort_tx, abort_rx) = watch::channel(false);
    let run = {
        let pipeline = Arc::clone(&pipeline);
        let job_id = job_id.clone();
        tokio::spawn(async move { pipeline.run_job(&job_id, abort_rx).await })
    };

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(2);
    while storage::lock(&shared).unwrap().get_job(&job_id).unwrap().status != CrawlStatus::InProgress
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }

    // Another process already gave up on the job
    storage::lock(&shared)
        .unwrap()
        .fail_job(&job_id, CrawlStatus::Failed, STALE_JOB_MESSAGE)
        .unwrap();
    abort_tx.send(true).unwrap();

    let outcome = tokio::time::timeout(StdDuration::from_secs(3), run)
        .await
        .expect("job did not stop")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, JobOutcome::Cancelled));
    assert_eq!(
        storage::lock(&shared).unwrap().get_job(&job_id).unwrap().status,
        CrawlStatus::Failed
    );
}
