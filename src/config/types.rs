use crate::state::{CrawlEngine, CrawlScope};
use serde::Deserialize;

/// Main configuration structure for Sumi-Strata
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub crawl: CrawlDefaults,
    #[serde(default)]
    pub detection: DetectionConfig,
    pub storage: StorageConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    #[serde(default, rename = "project")]
    pub projects: Vec<ProjectEntry>,
}

/// Scheduler behavior configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of crawl jobs in progress at the same time
    #[serde(rename = "max-concurrent-crawls")]
    pub max_concurrent_crawls: usize,

    /// Seconds between daemon poll cycles
    #[serde(rename = "poll-interval-secs")]
    pub poll_interval_secs: u64,

    /// Attempts allowed per scheduled crawl before giving up until the next slot
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Delay before a failed job is retried (seconds)
    #[serde(rename = "retry-delay-secs")]
    pub retry_delay_secs: u64,

    /// Mandatory cool-down before a rate-limited job is retried (seconds)
    #[serde(rename = "rate-limit-cooldown-secs")]
    pub rate_limit_cooldown_secs: u64,

    /// Extra time past a job's timeout before the sweep declares it stale (seconds)
    #[serde(rename = "stale-job-grace-secs")]
    pub stale_job_grace_secs: u64,

    /// Consecutive no-change runs before the interval starts to lengthen
    #[serde(rename = "no-change-threshold")]
    pub no_change_threshold: u32,

    /// Factor applied to the backoff multiplier per additional no-change run
    #[serde(rename = "backoff-growth")]
    pub backoff_growth: f64,

    /// Upper bound on the backoff multiplier
    #[serde(rename = "max-backoff-multiplier")]
    pub max_backoff_multiplier: f64,

    /// Time in-flight crawls are given to finish on shutdown (seconds)
    #[serde(rename = "shutdown-grace-secs")]
    pub shutdown_grace_secs: u64,

    /// Market-cap gate copied onto newly created schedules
    #[serde(rename = "min-market-cap")]
    pub min_market_cap: Option<f64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_crawls: 3,
            poll_interval_secs: 60,
            max_retries: 3,
            retry_delay_secs: 900,
            rate_limit_cooldown_secs: 3600,
            stale_job_grace_secs: 300,
            no_change_threshold: 3,
            backoff_growth: 2.0,
            max_backoff_multiplier: 4.0,
            shutdown_grace_secs: 60,
            min_market_cap: None,
        }
    }
}

/// Default crawl parameters applied to scheduled jobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlDefaults {
    pub engine: CrawlEngine,

    pub scope: CrawlScope,

    #[serde(rename = "max-depth")]
    pub max_depth: u32,

    #[serde(rename = "max-pages")]
    pub max_pages: u32,

    #[serde(rename = "js-rendering")]
    pub js_rendering: bool,

    #[serde(rename = "respect-robots-txt")]
    pub respect_robots_txt: bool,

    /// Delay between requests to the crawled site (milliseconds)
    #[serde(rename = "rate-limit-delay-ms")]
    pub rate_limit_delay_ms: u64,

    /// Hard bound on a single crawl (seconds)
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,
}

impl Default for CrawlDefaults {
    fn default() -> Self {
        Self {
            engine: CrawlEngine::Simple,
            scope: CrawlScope::Domain,
            max_depth: 2,
            max_pages: 50,
            js_rendering: false,
            respect_robots_txt: true,
            rate_limit_delay_ms: 1000,
            timeout_secs: 3600,
        }
    }
}

/// Change detection thresholds and weights
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Change scores below this are treated as no change
    #[serde(rename = "noise-floor")]
    pub noise_floor: f64,

    /// Default change score at or above which a change is significant
    #[serde(rename = "significance-threshold")]
    pub significance_threshold: f64,

    #[serde(rename = "text-weight")]
    pub text_weight: f64,

    #[serde(rename = "structure-weight")]
    pub structure_weight: f64,

    #[serde(rename = "resource-weight")]
    pub resource_weight: f64,

    /// Structure diff score above which a redesign is considered
    #[serde(rename = "redesign-structure-threshold")]
    pub redesign_structure_threshold: f64,

    /// Text change percentage above which a redesign is considered
    #[serde(rename = "redesign-text-threshold")]
    pub redesign_text_threshold: f64,

    /// Structure diff score above which the structure counts as changed
    #[serde(rename = "structure-change-threshold")]
    pub structure_change_threshold: f64,

    /// Text change percentage below which text change counts as low
    #[serde(rename = "low-text-change-threshold")]
    pub low_text_change_threshold: f64,

    /// Added + removed + changed resources needed for a resource change
    #[serde(rename = "resource-change-count")]
    pub resource_change_count: u32,

    /// Added:removed byte ratio that makes a change an addition (or removal)
    #[serde(rename = "content-ratio")]
    pub content_ratio: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            noise_floor: 0.02,
            significance_threshold: 0.3,
            text_weight: 0.5,
            structure_weight: 0.3,
            resource_weight: 0.2,
            redesign_structure_threshold: 0.6,
            redesign_text_threshold: 0.5,
            structure_change_threshold: 0.3,
            low_text_change_threshold: 0.2,
            resource_change_count: 5,
            content_ratio: 2.0,
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Root directory for stored artifacts
    #[serde(rename = "artifact-dir")]
    pub artifact_dir: String,

    /// Directory where executors write captures before they are stored
    #[serde(rename = "staging-dir")]
    pub staging_dir: String,

    /// Path of the markdown report written by --export-report
    #[serde(rename = "report-path", default = "default_report_path")]
    pub report_path: String,
}

fn default_report_path() -> String {
    "./archive-report.md".to_string()
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Formats the user agent header value
    ///
    /// Format: `CrawlerName/Version (+ContactURL; ContactEmail)`
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// A tracked project seeded from the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectEntry {
    /// Short unique project code (e.g., "BTC")
    pub code: String,

    pub name: String,

    #[serde(rename = "market-cap-rank")]
    pub market_cap_rank: Option<u32>,

    #[serde(rename = "market-cap")]
    pub market_cap: Option<f64>,

    /// Website URL to archive
    pub website: String,
}
