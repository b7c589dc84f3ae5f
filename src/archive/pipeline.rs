//! One crawl job from dispatch to snapshot
//!
//! The pipeline runs the job's executor, stores the capture it produced,
//! records the job outcome, and builds the next snapshot. Outcomes are data:
//! a failed crawl is a [`JobOutcome::Failed`], not an error.

use crate::archive::snapshot::{CaptureSummary, SnapshotBuilder};
use crate::archive::store::{artifact_filename, ArtifactStore};
use crate::crawler::{
    execute_with_timeout, CrawlConfig, CrawlProgressUpdate, CrawlResult, EngineRouter,
    ProgressReporter, UsageCounter,
};
use crate::reanalysis::{signal_for, ReanalysisSink};
use crate::state::CrawlStatus;
use crate::storage::{self, ChangeRecord, CrawlJobRecord, SharedStorage, SnapshotRecord, Storage};
use crate::StrataError;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How a job ended
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// The crawl succeeded and the job is `COMPLETED`
    Completed {
        /// `None` when the snapshot row could not be created
        snapshot: Option<SnapshotRecord>,
        change: Option<ChangeRecord>,
        /// Set when the snapshot was left incomplete
        processing_error: Option<String>,
    },
    /// The job is `FAILED` or `RATE_LIMITED`
    Failed {
        job: CrawlJobRecord,
        message: String,
        rate_limited: bool,
    },
    /// The job was cancelled before its crawl finished
    Cancelled,
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// True when a completed job produced a significant change
    pub fn is_significant(&self) -> bool {
        match self {
            Self::Completed {
                change: Some(change),
                ..
            } => change.analysis.is_significant(),
            _ => false,
        }
    }
}

/// Runs crawl jobs through capture, storage, and snapshot building
pub struct ArchivePipeline {
    storage: SharedStorage,
    router: Arc<EngineRouter>,
    store: Arc<dyn ArtifactStore>,
    builder: Arc<SnapshotBuilder>,
    reanalysis: Arc<dyn ReanalysisSink>,
    usage: UsageCounter,
    staging_dir: PathBuf,
}

impl ArchivePipeline {
    pub fn new(
        storage: SharedStorage,
        router: Arc<EngineRouter>,
        store: Arc<dyn ArtifactStore>,
        builder: Arc<SnapshotBuilder>,
        reanalysis: Arc<dyn ReanalysisSink>,
        usage: UsageCounter,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            storage,
            router,
            store,
            builder,
            reanalysis,
            usage,
            staging_dir: staging_dir.into(),
        }
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub fn builder(&self) -> &Arc<SnapshotBuilder> {
        &self.builder
    }

    /// Runs one job to its terminal state
    ///
    /// A `PENDING` job is started first. Setting `cancel` to `true` while the
    /// crawl runs abandons it and records the job as `CANCELLED`.
    ///
    /// # Returns
    ///
    /// * `Ok(JobOutcome)` - The job reached a terminal state
    /// * `Err(StrataError)` - The job could not be loaded or transitioned
    pub async fn run_job(
        &self,
        job_id: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<JobOutcome, StrataError> {
        let (job, project_code) = {
            let mut db = storage::lock(&self.storage)?;
            let mut job = db.get_job(job_id)?;
            if job.status == CrawlStatus::Pending {
                db.start_job(job_id)?;
                job = db.get_job(job_id)?;
            }
            let project = db.get_project(job.project_id)?;
            (job, project.code)
        };

        if job.status != CrawlStatus::InProgress {
            return Err(StrataError::Processing(format!(
                "job {} is {}, not runnable",
                job.id, job.status
            )));
        }

        let captured_at = job.started_at.unwrap_or_else(Utc::now);
        let mut config = self.crawl_config(&job, &project_code, &captured_at);
        let (reporter, updates) = ProgressReporter::channel();
        let tracker = self.track_progress(&job.id, config.clone(), updates);
        config.progress = reporter;
        let executor = self.router.route(job.params.engine);
        info!(
            "Starting job {} for {} with {} executor (depth {}, pages {})",
            job.id,
            job.seed_url,
            executor.name(),
            config.max_depth,
            config.max_pages
        );

        let result = tokio::select! {
            result = execute_with_timeout(executor.as_ref(), &config) => Some(result),
            _ = signalled(cancel) => None,
        };
        config.progress = ProgressReporter::disabled();
        finish_tracking(tracker).await;
        self.flush_usage();

        let Some(result) = result else {
            discard_staged(&config.artifact_path()).await;
            let cancelled = storage::lock(&self.storage)
                .and_then(|mut db| Ok(db.cancel_job(&job.id, "cancelled during shutdown")?));
            match cancelled {
                Ok(()) => warn!("Job {} cancelled while crawling", job.id),
                Err(e) => warn!("Job {} abandoned but could not be marked cancelled: {}", job.id, e),
            }
            return Ok(JobOutcome::Cancelled);
        };

        if !result.success {
            if let Some(path) = &result.artifact_path {
                discard_staged(path).await;
            }
            discard_staged(&config.artifact_path()).await;
            let message = result
                .error_message
                .clone()
                .unwrap_or_else(|| "crawl failed without a message".to_string());
            return self.fail(&job, &message, result.rate_limited);
        }

        let Some(staged) = result.artifact_path.clone() else {
            return self.fail(&job, "crawl reported success without a capture file", false);
        };

        let stored = match self
            .store
            .store(&staged, &project_code, captured_at, &job.id)
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                discard_staged(&staged).await;
                return self.fail(&job, &format!("artifact storage failed: {}", e), false);
            }
        };
        discard_staged(&staged).await;
        debug!("Job {} artifact stored at {}", job.id, stored.location);

        let job = {
            let mut db = storage::lock(&self.storage)?;
            db.complete_job(&job.id, result.pages_crawled, result.bytes_downloaded)?;
            db.get_job(&job.id)?
        };

        let summary = summary_of(&result, captured_at);
        let built = match self.builder.build(&job, &stored, &summary).await {
            Ok(built) => built,
            Err(e) => {
                error!("Job {} completed but its snapshot was not created: {}", job.id, e);
                return Ok(JobOutcome::Completed {
                    snapshot: None,
                    change: None,
                    processing_error: Some(e.to_string()),
                });
            }
        };

        if let Some(change) = &built.change {
            if change.requires_reanalysis {
                self.signal(change).await;
            }
        }

        Ok(JobOutcome::Completed {
            snapshot: Some(built.snapshot),
            change: built.change,
            processing_error: built.processing_error,
        })
    }

    fn crawl_config(
        &self,
        job: &CrawlJobRecord,
        project_code: &str,
        captured_at: &DateTime<Utc>,
    ) -> CrawlConfig {
        let filename = artifact_filename(project_code, captured_at, &job.id);
        let artifact_stem = Path::new(&filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or(filename);

        CrawlConfig {
            seed_url: job.seed_url.clone(),
            scope: job.params.scope,
            max_depth: job.params.max_depth,
            max_pages: job.params.max_pages,
            engine: job.params.engine,
            js_rendering: job.params.js_rendering,
            respect_robots_txt: job.params.respect_robots_txt,
            rate_limit_delay: Duration::from_millis(job.params.rate_limit_delay_ms),
            timeout: Duration::from_secs(job.params.timeout_secs),
            output_dir: self.staging_dir.clone(),
            artifact_stem,
            progress: ProgressReporter::disabled(),
        }
    }

    /// Records progress updates on the job row until the crawl drops its reporter
    fn track_progress(
        &self,
        job_id: &str,
        config: CrawlConfig,
        mut updates: mpsc::UnboundedReceiver<CrawlProgressUpdate>,
    ) -> JoinHandle<()> {
        let storage = Arc::clone(&self.storage);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                let percentage = config.progress_percentage(update.pages_crawled);
                let recorded = storage::lock(&storage).and_then(|mut db| {
                    Ok(db.update_job_progress(
                        &job_id,
                        percentage,
                        update.pages_crawled,
                        update.bytes_downloaded,
                    )?)
                });
                if let Err(e) = recorded {
                    debug!("Could not record progress of job {}: {}", job_id, e);
                }
            }
        })
    }

    fn fail(
        &self,
        job: &CrawlJobRecord,
        message: &str,
        rate_limited: bool,
    ) -> Result<JobOutcome, StrataError> {
        let status = if rate_limited {
            CrawlStatus::RateLimited
        } else {
            CrawlStatus::Failed
        };
        let job = storage::lock(&self.storage)?.fail_job(&job.id, status, message)?;
        warn!(
            "Job {} {} (attempt {} of {}): {}",
            job.id, status, job.retry_count, job.max_retries, message
        );
        Ok(JobOutcome::Failed {
            job,
            message: message.to_string(),
            rate_limited,
        })
    }

    async fn signal(&self, change: &ChangeRecord) {
        let signal = match storage::lock(&self.storage).and_then(|db| signal_for(&*db, change)) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Could not build reanalysis signal for change {}: {}", change.id, e);
                return;
            }
        };
        if let Err(e) = self.reanalysis.notify(&signal).await {
            warn!("Reanalysis sink rejected change {}: {}", change.id, e);
        }
    }

    fn flush_usage(&self) {
        if let Err(e) = self.usage.flush(&self.storage) {
            warn!("Failed to record usage: {}", e);
        }
    }
}

fn summary_of(result: &CrawlResult, captured_at: DateTime<Utc>) -> CaptureSummary {
    CaptureSummary {
        captured_at,
        pages_crawled: result.pages_crawled,
        resources_crawled: result.resources_crawled,
        bytes_downloaded: result.bytes_downloaded,
        crawl_duration_secs: result.crawl_duration.as_secs_f64(),
    }
}

/// Resolves once the flag is set; never resolves if the sender is gone
pub(crate) async fn signalled(mut flag: watch::Receiver<bool>) {
    loop {
        if *flag.borrow_and_update() {
            return;
        }
        if flag.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Lets the progress tracker drain what the crawl reported
///
/// An executor that leaked its reporter into a background task would keep
/// the channel open, so the wait is bounded.
async fn finish_tracking(tracker: JoinHandle<()>) {
    let abort = tracker.abort_handle();
    if tokio::time::timeout(Duration::from_secs(1), tracker).await.is_err() {
        abort.abort();
    }
}

async fn discard_staged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed staged capture {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove staged capture {}: {}", path.display(), e),
    }
}
