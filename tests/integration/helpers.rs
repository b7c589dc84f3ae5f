//! Shared fixtures: test configuration, a scripted executor, and a
//! recording reanalysis sink

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sumi_strata::archive::{
    ArchivePipeline, ArtifactStore, CaptureWriter, HttpCapture, LocalArtifactStore,
    SnapshotBuilder, StorageMetadata,
};
use sumi_strata::config::{
    Config, CrawlDefaults, DetectionConfig, ProjectEntry, SchedulerConfig, StorageConfig,
    UserAgentConfig,
};
use sumi_strata::crawler::{CrawlConfig, CrawlExecutor, CrawlResult, EngineRouter, UsageCounter};
use sumi_strata::reanalysis::{ReanalysisSignal, ReanalysisSink};
use sumi_strata::storage::{self, SharedStorage};
use sumi_strata::{ChangeDetector, Scheduler, StrataError};
use tempfile::TempDir;

pub fn user_agent() -> UserAgentConfig {
    UserAgentConfig {
        crawler_name: "StrataTest".to_string(),
        crawler_version: "1.0".to_string(),
        contact_url: "https://example.com/about".to_string(),
        contact_email: "archive@example.com".to_string(),
    }
}

pub fn project(code: &str, rank: Option<u32>, market_cap: Option<f64>, website: &str) -> ProjectEntry {
    ProjectEntry {
        code: code.to_string(),
        name: format!("{} Project", code),
        market_cap_rank: rank,
        market_cap,
        website: website.to_string(),
    }
}

/// Configuration rooted in `dir` with fast crawl settings
pub fn test_config(dir: &TempDir, max_concurrent: usize, projects: Vec<ProjectEntry>) -> Config {
    let root = dir.path();
    let path = |name: &str| root.join(name).to_string_lossy().into_owned();
    Config {
        scheduler: SchedulerConfig {
            max_concurrent_crawls: max_concurrent,
            poll_interval_secs: 1,
            shutdown_grace_secs: 5,
            ..SchedulerConfig::default()
        },
        crawl: CrawlDefaults {
            max_depth: 1,
            max_pages: 10,
            rate_limit_delay_ms: 0,
            timeout_secs: 30,
            ..CrawlDefaults::default()
        },
        detection: DetectionConfig::default(),
        storage: StorageConfig {
            database_path: path("strata.db"),
            artifact_dir: path("artifacts"),
            staging_dir: path("staging"),
            report_path: path("report.md"),
        },
        user_agent: user_agent(),
        projects,
    }
}

/// Builds a scheduler whose every crawl goes through `executor`
pub fn scheduler_with(
    config: Config,
    executor: Arc<dyn CrawlExecutor>,
    sink: Arc<dyn ReanalysisSink>,
) -> Scheduler {
    let store: Arc<dyn ArtifactStore> =
        Arc::new(LocalArtifactStore::new(&config.storage.artifact_dir));
    scheduler_with_store(config, executor, sink, store)
}

pub fn scheduler_with_store(
    config: Config,
    executor: Arc<dyn CrawlExecutor>,
    sink: Arc<dyn ReanalysisSink>,
    store: Arc<dyn ArtifactStore>,
) -> Scheduler {
    let (shared, pipeline) = pipeline_with(&config, executor, sink, store);
    Scheduler::new(Arc::new(config), shared, pipeline)
}

/// The archive pipeline alone, for driving jobs by hand
pub fn pipeline_with(
    config: &Config,
    executor: Arc<dyn CrawlExecutor>,
    sink: Arc<dyn ReanalysisSink>,
    store: Arc<dyn ArtifactStore>,
) -> (SharedStorage, Arc<ArchivePipeline>) {
    let shared = storage::open_shared(Path::new(&config.storage.database_path)).unwrap();
    let builder = Arc::new(SnapshotBuilder::new(
        Arc::clone(&shared),
        Arc::clone(&store),
        ChangeDetector::new(config.detection.clone()),
    ));
    let pipeline = Arc::new(ArchivePipeline::new(
        Arc::clone(&shared),
        Arc::new(EngineRouter::new(executor)),
        store,
        builder,
        sink,
        UsageCounter::new(),
        config.storage.staging_dir.clone(),
    ));
    (shared, pipeline)
}

/// Local store that takes `delay` before every write
pub struct SlowStore {
    inner: LocalArtifactStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(base_path: &str, delay: Duration) -> Self {
        Self {
            inner: LocalArtifactStore::new(base_path),
            delay,
        }
    }
}

#[async_trait]
impl ArtifactStore for SlowStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn store(
        &self,
        local_path: &Path,
        project_code: &str,
        captured_at: DateTime<Utc>,
        job_id: &str,
    ) -> Result<StorageMetadata, StrataError> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .store(local_path, project_code, captured_at, job_id)
            .await
    }

    async fn verify(&self, metadata: &StorageMetadata) -> Result<bool, StrataError> {
        self.inner.verify(metadata).await
    }
}

/// Collects every signal it is notified of
#[derive(Default)]
pub struct RecordingSink {
    signals: Mutex<Vec<ReanalysisSignal>>,
}

impl RecordingSink {
    pub fn signals(&self) -> Vec<ReanalysisSignal> {
        self.signals.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReanalysisSink for RecordingSink {
    async fn notify(&self, signal: &ReanalysisSignal) -> Result<(), StrataError> {
        self.signals.lock().unwrap().push(signal.clone());
        Ok(())
    }
}

/// Executor that writes a one-page capture after a fixed delay
///
/// Reports one crawled page as soon as it starts. Tracks start order and
/// how many crawls overlapped.
pub struct ScriptedExecutor {
    delay: Duration,
    failing: HashSet<String>,
    running: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            failing: HashSet::new(),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Crawls of `seed_url` fail
    pub fn failing_on(mut self, seed_url: &str) -> Self {
        self.failing.insert(seed_url.to_string());
        self
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CrawlExecutor for ScriptedExecutor {
    async fn execute(&self, config: &CrawlConfig) -> CrawlResult {
        self.started.lock().unwrap().push(config.seed_url.clone());
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        config.progress.report(1, 128);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&config.seed_url) {
            return CrawlResult::failure("scripted failure", self.delay);
        }

        let body = format!(
            "<html><body><section id=\"about\"><p>Archived copy of {}</p></section></body></html>",
            config.seed_url
        );
        let path = config.artifact_path();
        let mut writer = CaptureWriter::create(&path, "scripted/1.0").unwrap();
        writer
            .write_response(&HttpCapture {
                url: config.seed_url.clone(),
                status: 200,
                reason: "OK".to_string(),
                headers: vec![("Content-Type".to_string(), "text/html".to_string())],
                body: body.clone().into_bytes(),
                captured_at: Utc::now(),
            })
            .unwrap();
        let path = writer.finish().unwrap();

        CrawlResult {
            success: true,
            pages_crawled: 1,
            resources_crawled: 0,
            bytes_downloaded: body.len() as u64,
            crawl_duration: self.delay,
            artifact_path: Some(path),
            ..CrawlResult::default()
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
