//! Crawl executor contract and engine routing

use crate::state::{CrawlEngine, CrawlScope};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Running totals of a crawl in flight
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CrawlProgressUpdate {
    pub pages_crawled: u32,
    pub bytes_downloaded: u64,
}

/// Sends progress of a running crawl to whoever tracks the job
///
/// A reporter without a receiver drops updates.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<CrawlProgressUpdate>>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CrawlProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn report(&self, pages_crawled: u32, bytes_downloaded: u64) {
        if let Some(tx) = &self.tx {
            // A closed receiver only means nobody is watching anymore
            let _ = tx.send(CrawlProgressUpdate {
                pages_crawled,
                bytes_downloaded,
            });
        }
    }
}

/// Everything an executor needs to run one crawl
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub seed_url: String,
    pub scope: CrawlScope,
    pub max_depth: u32,
    pub max_pages: u32,
    pub engine: CrawlEngine,
    pub js_rendering: bool,
    pub respect_robots_txt: bool,
    /// Pause between consecutive requests
    pub rate_limit_delay: Duration,
    /// Hard bound on the whole crawl
    pub timeout: Duration,
    /// Directory the capture file is written to
    pub output_dir: PathBuf,
    /// Capture filename without extension
    pub artifact_stem: String,
    pub progress: ProgressReporter,
}

impl CrawlConfig {
    /// Path of the capture file this crawl writes
    pub fn artifact_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.warc", self.artifact_stem))
    }

    /// Share of the page budget crawled so far, in percent
    pub fn progress_percentage(&self, pages_crawled: u32) -> f64 {
        if self.max_pages == 0 {
            return 0.0;
        }
        (pages_crawled as f64 * 100.0 / self.max_pages as f64).min(100.0)
    }
}

/// Outcome reported by an executor
#[derive(Debug, Clone, Default)]
pub struct CrawlResult {
    pub success: bool,
    pub pages_crawled: u32,
    pub resources_crawled: u32,
    pub bytes_downloaded: u64,
    pub crawl_duration: Duration,
    /// Capture file, present when `success` is true
    pub artifact_path: Option<PathBuf>,
    pub error_message: Option<String>,
    /// The target site throttled the crawl
    pub rate_limited: bool,
}

impl CrawlResult {
    /// A failed crawl with a readable message
    pub fn failure(message: impl Into<String>, crawl_duration: Duration) -> Self {
        Self {
            success: false,
            crawl_duration,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Fetches a bounded web graph from a seed URL into a capture file
///
/// Executors never return errors: every failure is reported as a
/// `CrawlResult` with `success = false` and a message.
#[async_trait]
pub trait CrawlExecutor: Send + Sync {
    async fn execute(&self, config: &CrawlConfig) -> CrawlResult;

    /// Executor name for logging
    fn name(&self) -> &'static str;
}

/// Runs an executor under the crawl's hard timeout
///
/// A crawl that exceeds `config.timeout` is abandoned and reported as a
/// failure whose message starts with `timeout`.
pub async fn execute_with_timeout(executor: &dyn CrawlExecutor, config: &CrawlConfig) -> CrawlResult {
    match tokio::time::timeout(config.timeout, executor.execute(config)).await {
        Ok(result) => result,
        Err(_) => CrawlResult::failure(
            format!(
                "timeout after {}s crawling {}",
                config.timeout.as_secs(),
                config.seed_url
            ),
            config.timeout,
        ),
    }
}

/// Picks the executor for a crawl engine
///
/// Engines without a registered executor fall back to the default one.
pub struct EngineRouter {
    executors: HashMap<CrawlEngine, Arc<dyn CrawlExecutor>>,
    fallback: Arc<dyn CrawlExecutor>,
}

impl EngineRouter {
    pub fn new(fallback: Arc<dyn CrawlExecutor>) -> Self {
        Self {
            executors: HashMap::new(),
            fallback,
        }
    }

    /// Registers an executor for an engine, replacing any previous one
    pub fn register(&mut self, engine: CrawlEngine, executor: Arc<dyn CrawlExecutor>) {
        self.executors.insert(engine, executor);
    }

    pub fn route(&self, engine: CrawlEngine) -> Arc<dyn CrawlExecutor> {
        match self.executors.get(&engine) {
            Some(executor) => Arc::clone(executor),
            None => {
                warn!(
                    "No executor registered for engine {}, using {}",
                    engine,
                    self.fallback.name()
                );
                Arc::clone(&self.fallback)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, Duration);

    #[async_trait]
    impl CrawlExecutor for Named {
        async fn execute(&self, _config: &CrawlConfig) -> CrawlResult {
            tokio::time::sleep(self.1).await;
            CrawlResult {
                success: true,
                ..CrawlResult::default()
            }
        }

        fn name(&self) -> &'static str {
            self.0
        }
    }

    fn config(timeout: Duration) -> CrawlConfig {
        CrawlConfig {
            seed_url: "https://example.com/".to_string(),
            scope: CrawlScope::Domain,
            max_depth: 1,
            max_pages: 1,
            engine: CrawlEngine::Simple,
            js_rendering: false,
            respect_robots_txt: true,
            rate_limit_delay: Duration::ZERO,
            timeout,
            output_dir: PathBuf::from("/tmp"),
            artifact_stem: "EX_20240101_000000_abcdef12".to_string(),
            progress: ProgressReporter::disabled(),
        }
    }

    #[test]
    fn test_route_falls_back() {
        let mut router = EngineRouter::new(Arc::new(Named("simple", Duration::ZERO)));
        router.register(
            CrawlEngine::Browsertrix,
            Arc::new(Named("browsertrix", Duration::ZERO)),
        );
        assert_eq!(router.route(CrawlEngine::Browsertrix).name(), "browsertrix");
        assert_eq!(router.route(CrawlEngine::Brozzler).name(), "simple");
    }

    #[test]
    fn test_artifact_path() {
        assert_eq!(
            config(Duration::from_secs(1)).artifact_path(),
            PathBuf::from("/tmp/EX_20240101_000000_abcdef12.warc")
        );
    }

    #[test]
    fn test_progress_reporting() {
        let mut config = config(Duration::from_secs(1));
        config.max_pages = 8;
        assert_eq!(config.progress_percentage(2), 25.0);
        assert_eq!(config.progress_percentage(12), 100.0);

        let (reporter, mut rx) = ProgressReporter::channel();
        reporter.report(2, 512);
        assert_eq!(
            rx.try_recv().unwrap(),
            CrawlProgressUpdate {
                pages_crawled: 2,
                bytes_downloaded: 512
            }
        );
        drop(rx);
        reporter.report(3, 600);
        ProgressReporter::disabled().report(1, 1);
    }

    #[tokio::test]
    async fn test_timeout_reports_failure() {
        let slow = Named("slow", Duration::from_secs(5));
        let result = execute_with_timeout(&slow, &config(Duration::from_millis(20))).await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().starts_with("timeout"));

        let fast = Named("fast", Duration::ZERO);
        assert!(execute_with_timeout(&fast, &config(Duration::from_secs(1))).await.success);
    }
}
