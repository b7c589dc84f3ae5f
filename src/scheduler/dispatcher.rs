//! Crawl dispatch: due work, the concurrency ceiling, and shutdown

use crate::archive::{
    signalled, ArchivePipeline, ArtifactStore, JobOutcome, LocalArtifactStore, SnapshotBuilder,
};
use crate::config::{Config, ProjectEntry};
use crate::crawler::{default_router, UsageCounter};
use crate::detect::ChangeDetector;
use crate::reanalysis::LoggingReanalysisSink;
use crate::scheduler::policy::{new_default_schedule, next_run, AdaptivePolicy, RunObservation};
use crate::scheduler::recovery::{resolve_failure, sweep_stale_jobs, FailureResolution};
use crate::state::{CrawlEngine, CrawlFrequency, CrawlStatus};
use crate::storage::{
    self, ChangeRecord, CrawlJobRecord, CrawlParameters, DueSchedule, LinkRecord, NewCrawlJob,
    ScheduleRecord, SharedStorage, Storage,
};
use crate::url::{extract_domain, normalize_url};
use crate::{StrataError, UrlError};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Time workers get to record `CANCELLED` after being told to abort
const ABORT_WAIT: Duration = Duration::from_secs(10);

/// Why a due schedule was not dispatched
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// The link already has a pending or running job
    ActiveJob { job_id: String, status: CrawlStatus },
    /// The project's market cap is under the schedule's gate
    BelowMarketCap { required: f64, actual: f64 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ActiveJob { job_id, status } => write!(f, "job {} is {}", job_id, status),
            Self::BelowMarketCap { required, actual } => {
                write!(f, "market cap {:.0} below {:.0}", actual, required)
            }
        }
    }
}

/// Work the scheduler would start, in dispatch order
#[derive(Debug, Clone)]
pub enum DispatchItem {
    /// A retry job whose delay has passed
    Retry(CrawlJobRecord),
    /// A schedule whose next run is due
    Scheduled(DueSchedule),
}

impl DispatchItem {
    pub fn seed_url(&self) -> &str {
        match self {
            Self::Retry(job) => &job.seed_url,
            Self::Scheduled(due) => &due.seed_url,
        }
    }

    pub fn link_id(&self) -> i64 {
        match self {
            Self::Retry(job) => job.link_id,
            Self::Scheduled(due) => due.schedule.link_id,
        }
    }
}

/// Everything one cycle would dispatch or skip
#[derive(Debug, Clone, Default)]
pub struct DispatchPlan {
    pub dispatch: Vec<DispatchItem>,
    pub skipped: Vec<(DueSchedule, SkipReason)>,
}

impl DispatchPlan {
    pub fn is_empty(&self) -> bool {
        self.dispatch.is_empty() && self.skipped.is_empty()
    }
}

/// What one dispatch cycle did
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub swept: usize,
    pub dispatched: Vec<String>,
    pub skipped: usize,
}

/// Jobs waiting or running, plus what is due now
#[derive(Debug, Clone)]
pub struct PendingOverview {
    pub pending_jobs: Vec<CrawlJobRecord>,
    pub in_progress: Vec<CrawlJobRecord>,
    pub plan: DispatchPlan,
}

/// What a manual crawl targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlTarget {
    Project(String),
    Url(String),
}

impl CrawlTarget {
    /// Treats anything with a scheme as a URL, everything else as a project code
    pub fn parse(target: &str) -> Self {
        if target.contains("://") {
            Self::Url(target.to_string())
        } else {
            Self::Project(target.to_string())
        }
    }
}

/// A manual crawl request
#[derive(Debug, Clone)]
pub struct ManualCrawl {
    pub target: CrawlTarget,
    pub engine: Option<CrawlEngine>,
    pub max_depth: Option<u32>,
    pub max_pages: Option<u32>,
}

impl ManualCrawl {
    pub fn new(target: CrawlTarget) -> Self {
        Self {
            target,
            engine: None,
            max_depth: None,
            max_pages: None,
        }
    }
}

/// Result of a manual crawl
#[derive(Debug, Clone)]
pub struct ManualCrawlOutcome {
    pub job_id: String,
    pub outcome: JobOutcome,
}

impl ManualCrawlOutcome {
    pub fn snapshot_version(&self) -> Option<u32> {
        match &self.outcome {
            JobOutcome::Completed {
                snapshot: Some(snapshot),
                ..
            } => Some(snapshot.version_number),
            _ => None,
        }
    }

    pub fn change(&self) -> Option<&ChangeRecord> {
        match &self.outcome {
            JobOutcome::Completed { change, .. } => change.as_ref(),
            _ => None,
        }
    }
}

/// Ids of jobs a worker in this process is running
#[derive(Clone, Default)]
struct OwnedJobs(Arc<Mutex<HashSet<String>>>);

impl OwnedJobs {
    fn claim(&self, job_id: &str) -> JobClaim {
        self.lock().insert(job_id.to_string());
        JobClaim {
            owned: self.clone(),
            job_id: job_id.to_string(),
        }
    }

    fn ids(&self) -> HashSet<String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the job id when the worker ends, even if its task is aborted
struct JobClaim {
    owned: OwnedJobs,
    job_id: String,
}

impl Drop for JobClaim {
    fn drop(&mut self) {
        self.owned.lock().remove(&self.job_id);
    }
}

/// What a worker needs after its job finishes
#[derive(Clone)]
struct WorkerContext {
    config: Arc<Config>,
    storage: SharedStorage,
    pipeline: Arc<ArchivePipeline>,
    policy: AdaptivePolicy,
    abort: watch::Receiver<bool>,
}

impl WorkerContext {
    async fn run(self, job_id: String) {
        match self.pipeline.run_job(&job_id, self.abort.clone()).await {
            Ok(outcome) => {
                if let Err(e) = self.settle(&job_id, &outcome) {
                    error!("Failed to update schedule after job {}: {}", job_id, e);
                }
            }
            Err(e) => error!("Job {} could not run: {}", job_id, e),
        }
    }

    fn settle(&self, job_id: &str, outcome: &JobOutcome) -> Result<(), StrataError> {
        let mut db = storage::lock(&self.storage)?;
        settle(
            &mut *db,
            job_id,
            outcome,
            &self.config,
            &self.policy,
            Utc::now(),
        )
        .map(|_| ())
    }
}

/// Feeds a finished job back into its schedule
///
/// Completed jobs adapt the schedule; failed jobs are retried or, with no
/// attempts left, advance it; cancelled jobs change nothing.
fn settle(
    db: &mut dyn Storage,
    job_id: &str,
    outcome: &JobOutcome,
    config: &Config,
    policy: &AdaptivePolicy,
    now: DateTime<Utc>,
) -> Result<Option<FailureResolution>, StrataError> {
    match outcome {
        JobOutcome::Completed {
            snapshot, change, ..
        } => {
            let link_id = match snapshot {
                Some(snapshot) => snapshot.link_id,
                None => db.get_job(job_id)?.link_id,
            };
            let observation = match change {
                Some(change) => RunObservation::Compared {
                    change_score: change.analysis.change_score(),
                    significant: change.analysis.is_significant(),
                },
                None => RunObservation::Uncompared,
            };
            if let Some(mut schedule) = db.get_schedule_for_link(link_id)? {
                policy.apply(&mut schedule, observation, now);
                db.save_schedule_adaptation(&schedule)?;
                debug!(
                    "Schedule {} next run {:?} (backoff {:.1}, no-change streak {})",
                    schedule.id,
                    schedule.next_run_at,
                    schedule.backoff_multiplier,
                    schedule.consecutive_no_change
                );
            }
            Ok(None)
        }
        JobOutcome::Failed { job, .. } => {
            resolve_failure(db, job, &config.scheduler, policy, now).map(Some)
        }
        JobOutcome::Cancelled => Ok(None),
    }
}

/// Decides when each tracked site is crawled and runs the crawls
pub struct Scheduler {
    config: Arc<Config>,
    storage: SharedStorage,
    pipeline: Arc<ArchivePipeline>,
    policy: AdaptivePolicy,
    permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    abort: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    owned: OwnedJobs,
}

impl Scheduler {
    pub fn new(config: Arc<Config>, storage: SharedStorage, pipeline: Arc<ArchivePipeline>) -> Self {
        let ceiling = config.scheduler.max_concurrent_crawls.max(1);
        let policy = AdaptivePolicy::new(&config.scheduler);
        Self {
            config,
            storage,
            pipeline,
            policy,
            permits: Arc::new(Semaphore::new(ceiling)),
            shutdown: watch::channel(false).0,
            abort: watch::channel(false).0,
            workers: Mutex::new(Vec::new()),
            owned: OwnedJobs::default(),
        }
    }

    /// Wires the default pipeline from configuration
    ///
    /// Opens the database, stores artifacts on the local filesystem, crawls
    /// with the plain HTTP executor, and logs reanalysis signals.
    pub fn from_config(config: Config) -> Result<Self, StrataError> {
        let storage = storage::open_shared(Path::new(&config.storage.database_path))?;
        let usage = UsageCounter::new();
        let router = Arc::new(default_router(&config.user_agent, usage.clone())?);
        let store: Arc<dyn ArtifactStore> =
            Arc::new(LocalArtifactStore::new(&config.storage.artifact_dir));
        let builder = Arc::new(SnapshotBuilder::new(
            Arc::clone(&storage),
            Arc::clone(&store),
            ChangeDetector::new(config.detection.clone()),
        ));
        let pipeline = Arc::new(ArchivePipeline::new(
            Arc::clone(&storage),
            router,
            store,
            builder,
            Arc::new(LoggingReanalysisSink),
            usage,
            config.storage.staging_dir.clone(),
        ));
        Ok(Self::new(Arc::new(config), storage, pipeline))
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Asks the daemon to stop dispatching and wind down
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // ===== Projects and schedules =====

    /// Upserts the configured projects and their website links
    ///
    /// # Returns
    ///
    /// The number of projects synced
    pub fn sync_projects(&self) -> Result<usize, StrataError> {
        let mut db = storage::lock(&self.storage)?;
        for project in &self.config.projects {
            upsert_project_link(&mut *db, project)?;
        }
        Ok(self.config.projects.len())
    }

    /// Creates default schedules for every active link without one
    ///
    /// New schedules are due immediately.
    pub fn init_schedules(&self) -> Result<usize, StrataError> {
        self.sync_projects()?;
        let now = Utc::now();
        let mut db = storage::lock(&self.storage)?;
        let links = db.links_without_schedule()?;
        for link in &links {
            let project = db.get_project(link.project_id)?;
            let schedule = new_default_schedule(
                link.id,
                project.id,
                project.market_cap_rank,
                &self.config.scheduler,
                &self.config.crawl,
                now,
            );
            db.insert_schedule(&schedule)?;
            info!(
                "Created {} schedule (priority {}) for {} ({})",
                schedule.frequency, schedule.priority, project.code, link.url
            );
        }
        Ok(links.len())
    }

    /// Changes a schedule's frequency and re-times its next run
    ///
    /// The backoff multiplier resets to 1.
    pub fn update_schedule_frequency(
        &self,
        schedule_id: i64,
        frequency: CrawlFrequency,
        priority: Option<u8>,
    ) -> Result<ScheduleRecord, StrataError> {
        let mut db = storage::lock(&self.storage)?;
        db.update_schedule_frequency(schedule_id, frequency, priority)?;
        let mut schedule = db.get_schedule(schedule_id)?;
        let anchor = schedule.last_run_at.unwrap_or_else(Utc::now);
        schedule.next_run_at = next_run(frequency, schedule.backoff_multiplier, anchor);
        db.save_schedule_adaptation(&schedule)?;
        info!("Schedule {} now {}", schedule_id, frequency);
        Ok(schedule)
    }

    pub fn pause_schedule(&self, schedule_id: i64, reason: &str) -> Result<(), StrataError> {
        storage::lock(&self.storage)?.set_schedule_paused(schedule_id, true, Some(reason))?;
        info!("Paused schedule {}: {}", schedule_id, reason);
        Ok(())
    }

    pub fn resume_schedule(&self, schedule_id: i64) -> Result<(), StrataError> {
        storage::lock(&self.storage)?.set_schedule_paused(schedule_id, false, None)?;
        info!("Resumed schedule {}", schedule_id);
        Ok(())
    }

    // ===== Planning =====

    /// Works out what a cycle at `now` would dispatch, without side effects
    pub fn plan(&self, now: DateTime<Utc>) -> Result<DispatchPlan, StrataError> {
        let db = storage::lock(&self.storage)?;
        let mut plan = DispatchPlan::default();

        let running: Vec<i64> = db
            .jobs_by_status(CrawlStatus::InProgress)?
            .iter()
            .map(|job| job.link_id)
            .collect();
        for job in db.due_pending_jobs(now)? {
            if !running.contains(&job.link_id) {
                plan.dispatch.push(DispatchItem::Retry(job));
            }
        }

        for due in db.due_schedules(now)? {
            if let Some(active) = db.active_job_for_link(due.schedule.link_id)? {
                let reason = SkipReason::ActiveJob {
                    job_id: active.id,
                    status: active.status,
                };
                plan.skipped.push((due, reason));
                continue;
            }
            if let (Some(required), Some(actual)) = (due.schedule.min_market_cap, due.market_cap) {
                if actual < required {
                    plan.skipped
                        .push((due, SkipReason::BelowMarketCap { required, actual }));
                    continue;
                }
            }
            plan.dispatch.push(DispatchItem::Scheduled(due));
        }

        Ok(plan)
    }

    /// Dry-run: the plan for right now
    pub fn dry_run(&self) -> Result<DispatchPlan, StrataError> {
        self.plan(Utc::now())
    }

    pub fn list_pending(&self) -> Result<PendingOverview, StrataError> {
        let plan = self.plan(Utc::now())?;
        let db = storage::lock(&self.storage)?;
        Ok(PendingOverview {
            pending_jobs: db.jobs_by_status(CrawlStatus::Pending)?,
            in_progress: db.jobs_by_status(CrawlStatus::InProgress)?,
            plan,
        })
    }

    // ===== Dispatch =====

    /// Runs one dispatch cycle
    ///
    /// Sweeps stale jobs, then starts due work in plan order. Each start
    /// waits for a free slot under the concurrency ceiling, so a cycle can
    /// block until earlier crawls finish. Jobs still held by this
    /// scheduler's workers are never swept.
    pub async fn run_cycle(&self) -> Result<CycleReport, StrataError> {
        let now = Utc::now();
        let owned = self.owned.ids();
        let swept = {
            let mut db = storage::lock(&self.storage)?;
            sweep_stale_jobs(&mut *db, &self.config.scheduler, &self.policy, &owned, now)?
        };
        self.reap_workers();

        let plan = self.plan(now)?;
        for (due, reason) in &plan.skipped {
            debug!("Skipping {}: {}", due.seed_url, reason);
        }

        let mut report = CycleReport {
            swept: swept.len(),
            dispatched: Vec::new(),
            skipped: plan.skipped.len(),
        };

        for item in plan.dispatch {
            let Some(permit) = self.acquire_slot().await? else {
                break;
            };
            match self.begin(&item) {
                Ok(Some(job_id)) => {
                    info!("Dispatched job {} for {}", job_id, item.seed_url());
                    let claim = self.owned.claim(&job_id);
                    self.spawn_worker(job_id.clone(), permit, claim);
                    report.dispatched.push(job_id);
                }
                Ok(None) => debug!("{} already has an active job", item.seed_url()),
                Err(e) => error!("Could not dispatch {}: {}", item.seed_url(), e),
            }
        }

        Ok(report)
    }

    /// Waits for a slot; `None` once shutdown was requested
    async fn acquire_slot(&self) -> Result<Option<OwnedSemaphorePermit>, StrataError> {
        if self.is_shutting_down() {
            return Ok(None);
        }
        tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit
                .map(Some)
                .map_err(|e| StrataError::Processing(format!("dispatch slots closed: {}", e))),
            _ = signalled(self.shutdown.subscribe()) => Ok(None),
        }
    }

    /// Creates (if needed) and starts the job for a dispatch item
    ///
    /// Returns `None` when the link gained an active job since planning.
    fn begin(&self, item: &DispatchItem) -> Result<Option<String>, StrataError> {
        let mut db = storage::lock(&self.storage)?;
        match item {
            DispatchItem::Retry(job) => {
                if db.get_job(&job.id)?.status != CrawlStatus::Pending {
                    return Ok(None);
                }
                db.start_job(&job.id)?;
                Ok(Some(job.id.clone()))
            }
            DispatchItem::Scheduled(due) => {
                if db.active_job_for_link(due.schedule.link_id)?.is_some() {
                    return Ok(None);
                }
                let mut params = CrawlParameters::from_defaults(&self.config.crawl);
                params.max_depth = due.schedule.max_depth;
                params.max_pages = due.schedule.max_pages;
                let job_id = db.create_job(&NewCrawlJob {
                    link_id: due.schedule.link_id,
                    project_id: due.schedule.project_id,
                    seed_url: due.seed_url.clone(),
                    params,
                    max_retries: self.config.scheduler.max_retries,
                    retry_count: 0,
                    next_scheduled_run: None,
                })?;
                db.start_job(&job_id)?;
                Ok(Some(job_id))
            }
        }
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            config: Arc::clone(&self.config),
            storage: Arc::clone(&self.storage),
            pipeline: Arc::clone(&self.pipeline),
            policy: self.policy,
            abort: self.abort.subscribe(),
        }
    }

    fn spawn_worker(&self, job_id: String, permit: OwnedSemaphorePermit, claim: JobClaim) {
        let ctx = self.worker_context();
        let handle = tokio::spawn(async move {
            ctx.run(job_id).await;
            drop(claim);
            drop(permit);
        });
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    fn reap_workers(&self) {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|handle| !handle.is_finished());
    }

    /// Number of crawls currently holding a slot
    pub fn in_flight(&self) -> usize {
        let ceiling = self.config.scheduler.max_concurrent_crawls.max(1);
        ceiling - self.permits.available_permits()
    }

    /// Waits for every spawned worker to finish
    pub async fn wait_idle(&self) {
        let mut handles = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        join_all(&mut handles).await;
    }

    // ===== Manual triggers =====

    /// Crawls a project or URL now
    ///
    /// Skips the due check but still waits for a slot under the concurrency
    /// ceiling. An unknown URL is tracked on the fly under a project named
    /// after its host.
    pub async fn trigger_manual(&self, request: &ManualCrawl) -> Result<ManualCrawlOutcome, StrataError> {
        let (link, schedule) = self.resolve_target(&request.target)?;

        let permit = self.acquire_slot().await?.ok_or_else(|| {
            StrataError::Processing("scheduler is shutting down".to_string())
        })?;

        let job_id = {
            let mut db = storage::lock(&self.storage)?;
            if let Some(active) = db.active_job_for_link(link.id)? {
                return Err(StrataError::Processing(format!(
                    "{} already has job {} ({})",
                    link.url, active.id, active.status
                )));
            }
            let mut params = CrawlParameters::from_defaults(&self.config.crawl);
            if let Some(schedule) = &schedule {
                params.max_depth = schedule.max_depth;
                params.max_pages = schedule.max_pages;
            }
            if let Some(engine) = request.engine {
                params.engine = engine;
                params.js_rendering = params.js_rendering || engine.renders_javascript();
            }
            if let Some(depth) = request.max_depth {
                params.max_depth = depth;
            }
            if let Some(pages) = request.max_pages {
                params.max_pages = pages;
            }
            let job_id = db.create_job(&NewCrawlJob {
                link_id: link.id,
                project_id: link.project_id,
                seed_url: link.url.clone(),
                params,
                max_retries: self.config.scheduler.max_retries,
                retry_count: 0,
                next_scheduled_run: None,
            })?;
            db.start_job(&job_id)?;
            job_id
        };
        let claim = self.owned.claim(&job_id);
        info!("Manual crawl {} started for {}", job_id, link.url);

        let outcome = self.pipeline.run_job(&job_id, self.abort.subscribe()).await?;
        drop(permit);

        {
            let mut db = storage::lock(&self.storage)?;
            settle(
                &mut *db,
                &job_id,
                &outcome,
                &self.config,
                &self.policy,
                Utc::now(),
            )?;
        }
        drop(claim);

        Ok(ManualCrawlOutcome { job_id, outcome })
    }

    /// Starts tracking a newly discovered project and crawls it right away
    pub async fn on_project_discovered(
        &self,
        project: &ProjectEntry,
    ) -> Result<ManualCrawlOutcome, StrataError> {
        {
            let mut db = storage::lock(&self.storage)?;
            let link = upsert_project_link(&mut *db, project)?;
            if db.get_schedule_for_link(link.id)?.is_none() {
                let schedule = new_default_schedule(
                    link.id,
                    link.project_id,
                    project.market_cap_rank,
                    &self.config.scheduler,
                    &self.config.crawl,
                    Utc::now(),
                );
                db.insert_schedule(&schedule)?;
                info!(
                    "Tracking new project {} with a {} schedule",
                    project.code, schedule.frequency
                );
            }
        }
        self.trigger_manual(&ManualCrawl::new(CrawlTarget::Project(project.code.clone())))
            .await
    }

    fn resolve_target(
        &self,
        target: &CrawlTarget,
    ) -> Result<(LinkRecord, Option<ScheduleRecord>), StrataError> {
        let mut db = storage::lock(&self.storage)?;
        let link = match target {
            CrawlTarget::Project(code) => {
                let project = db
                    .get_project_by_code(code)?
                    .ok_or_else(|| StrataError::NotFound(format!("project {}", code)))?;
                db.primary_link_for_project(project.id)?.ok_or_else(|| {
                    StrataError::NotFound(format!("active link for project {}", code))
                })?
            }
            CrawlTarget::Url(raw) => {
                let url = normalize_url(raw)?;
                match db.get_link_by_url(url.as_str())? {
                    Some(link) => link,
                    None => {
                        let host = extract_domain(&url).ok_or(UrlError::MissingDomain)?;
                        let project_id = match db.get_project_by_code(&host)? {
                            Some(project) => project.id,
                            None => db.upsert_project(&host, &host, None, None)?,
                        };
                        let link_id = db.insert_or_get_link(project_id, url.as_str())?;
                        info!("Tracking {} under project {}", url, host);
                        db.get_link(link_id)?
                    }
                }
            }
        };
        let schedule = db.get_schedule_for_link(link.id)?;
        Ok((link, schedule))
    }

    // ===== Daemon =====

    /// Runs dispatch cycles until shutdown is requested
    ///
    /// On start the configured projects are synced, missing schedules are
    /// created, and incomplete snapshots are repaired.
    pub async fn run_daemon(&self) -> Result<(), StrataError> {
        info!(
            "Scheduler starting: up to {} concurrent crawls, polling every {}s",
            self.config.scheduler.max_concurrent_crawls, self.config.scheduler.poll_interval_secs
        );
        let created = self.init_schedules()?;
        if created > 0 {
            info!("Created {} default schedules", created);
        }
        match self.pipeline.builder().repair_incomplete().await {
            Ok(0) => {}
            Ok(repaired) => info!("Repaired {} incomplete snapshots", repaired),
            Err(e) => warn!("Snapshot repair failed: {}", e),
        }

        let poll = Duration::from_secs(self.config.scheduler.poll_interval_secs.max(1));
        while !self.is_shutting_down() {
            match self.run_cycle().await {
                Ok(report) if !report.dispatched.is_empty() || report.swept > 0 => info!(
                    "Cycle: dispatched {}, skipped {}, swept {}",
                    report.dispatched.len(),
                    report.skipped,
                    report.swept
                ),
                Ok(_) => debug!("Cycle: nothing due"),
                Err(e) => error!("Dispatch cycle failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = signalled(self.shutdown.subscribe()) => {}
            }
        }

        self.shutdown_workers().await
    }

    /// Cancels queued jobs and winds down in-flight crawls
    ///
    /// Workers get `shutdown_grace_secs` to finish; after that they are told
    /// to abort and record `CANCELLED`.
    pub async fn shutdown_workers(&self) -> Result<(), StrataError> {
        info!("Scheduler shutting down");
        {
            let mut db = storage::lock(&self.storage)?;
            for job in db.jobs_by_status(CrawlStatus::Pending)? {
                match db.cancel_job(&job.id, "scheduler shutdown before dispatch") {
                    Ok(()) => debug!("Cancelled queued job {}", job.id),
                    Err(e) => warn!("Could not cancel queued job {}: {}", job.id, e),
                }
            }
        }

        self.reap_workers();
        let mut handles = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        if handles.is_empty() {
            return Ok(());
        }

        let grace = Duration::from_secs(self.config.scheduler.shutdown_grace_secs);
        info!(
            "Waiting up to {}s for {} in-flight crawls",
            grace.as_secs(),
            handles.len()
        );
        if tokio::time::timeout(grace, join_all(&mut handles)).await.is_ok() {
            return Ok(());
        }

        warn!("{} crawls still running, aborting them", handles.len());
        self.abort.send_replace(true);
        if tokio::time::timeout(ABORT_WAIT, join_all(&mut handles)).await.is_err() {
            for handle in &handles {
                handle.abort();
            }
            warn!(
                "{} workers did not stop; their jobs will be swept on next start",
                handles.len()
            );
        }
        Ok(())
    }
}

/// Awaits handles from the back, dropping each once it has finished
///
/// Safe to call again after a timeout interrupted it.
async fn join_all(handles: &mut Vec<JoinHandle<()>>) {
    while let Some(handle) = handles.last_mut() {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!("Crawl worker panicked: {}", e);
            }
        }
        handles.pop();
    }
}

/// Upserts a configured project and its website link
fn upsert_project_link(db: &mut dyn Storage, project: &ProjectEntry) -> Result<LinkRecord, StrataError> {
    let project_id = db.upsert_project(
        &project.code,
        &project.name,
        project.market_cap_rank,
        project.market_cap,
    )?;
    let url = normalize_url(&project.website)?;
    let link_id = db.insert_or_get_link(project_id, url.as_str())?;
    Ok(db.get_link(link_id)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crawl_target_parse() {
        assert_eq!(
            CrawlTarget::parse("https://example.com/"),
            CrawlTarget::Url("https://example.com/".to_string())
        );
        assert_eq!(CrawlTarget::parse("BTC"), CrawlTarget::Project("BTC".to_string()));
    }

    #[test]
    fn test_skip_reason_display() {
        let reason = SkipReason::BelowMarketCap {
            required: 1_000_000.0,
            actual: 5_000.0,
        };
        assert_eq!(reason.to_string(), "market cap 5000 below 1000000");
    }
}
