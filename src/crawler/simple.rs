//! Plain HTTP crawl executor
//!
//! Walks the site breadth-first from the seed, writing every response it
//! receives to a WARC capture file. JavaScript is never executed.

use crate::archive::CaptureWriter;
use crate::config::UserAgentConfig;
use crate::crawler::executor::{CrawlConfig, CrawlExecutor, CrawlResult};
use crate::crawler::fetcher::{build_http_client, fetch_url, FetchResult, FetchedResponse};
use crate::crawler::parser::parse_html;
use crate::crawler::usage::{UsageCounter, HTTP_CRAWL_SERVICE};
use crate::robots::{fetch_robots, RobotsRules};
use crate::url::{in_scope, normalize_url};
use crate::StrataError;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Bound on a single request; the crawl as a whole has its own timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a crawl stopped without producing a capture
enum Abort {
    Failed(String),
    RateLimited(String),
}

/// Counters accumulated while crawling
#[derive(Default)]
struct CrawlProgress {
    requests: u32,
    pages: u32,
    resources: u32,
    bytes: u64,
}

/// Breadth-first HTTP crawler
pub struct SimpleHttpExecutor {
    client: Client,
    robots_agent: String,
    software: String,
    usage: UsageCounter,
}

impl SimpleHttpExecutor {
    pub fn new(user_agent: &UserAgentConfig, usage: UsageCounter) -> Result<Self, StrataError> {
        Ok(Self {
            client: build_http_client(user_agent, REQUEST_TIMEOUT)?,
            robots_agent: user_agent.crawler_name.clone(),
            software: format!("{}/{}", user_agent.crawler_name, user_agent.crawler_version),
            usage,
        })
    }

    async fn crawl(
        &self,
        config: &CrawlConfig,
        writer: &mut CaptureWriter,
    ) -> Result<CrawlProgress, Abort> {
        let seed = normalize_url(&config.seed_url)
            .map_err(|e| Abort::Failed(format!("invalid seed URL {}: {}", config.seed_url, e)))?;

        let robots = if config.respect_robots_txt {
            fetch_robots(&self.client, &seed).await
        } else {
            RobotsRules::allow_all()
        };
        if !robots.is_allowed(seed.as_str(), &self.robots_agent) {
            return Err(Abort::Failed(format!(
                "robots.txt disallows crawling {}",
                seed
            )));
        }

        let delay = robots
            .crawl_delay(&self.robots_agent)
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(Duration::from_secs_f64)
            .map_or(config.rate_limit_delay, |d| d.max(config.rate_limit_delay));

        if config.js_rendering {
            debug!("JavaScript rendering requested for {}, not available in plain HTTP crawls", seed);
        }

        let mut progress = CrawlProgress::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<(Url, u32)> = VecDeque::new();
        let mut resources: Vec<Url> = Vec::new();

        visited.insert(seed.to_string());
        frontier.push_back((seed.clone(), 0));

        while let Some((url, depth)) = frontier.pop_front() {
            if progress.pages >= config.max_pages {
                break;
            }
            if !robots.is_allowed(url.as_str(), &self.robots_agent) {
                debug!("Skipping {} (disallowed by robots.txt)", url);
                continue;
            }

            let is_seed = progress.requests == 0;
            let Some(response) = self.fetch(&url, delay, &mut progress).await? else {
                if is_seed {
                    return Err(Abort::Failed(format!("failed to fetch seed {}", url)));
                }
                continue;
            };

            if response.is_rate_limited() {
                if progress.pages == 0 {
                    return Err(Abort::RateLimited(format!(
                        "rate limited (HTTP 429) by {}",
                        url
                    )));
                }
                warn!("Rate limited by {} after {} pages, stopping", url, progress.pages);
                break;
            }

            record(writer, &response)?;

            if is_seed && !response.is_success() && !response.is_redirect() {
                return Err(Abort::Failed(format!(
                    "seed {} returned HTTP {}",
                    url, response.status
                )));
            }

            if response.is_redirect() {
                if let Some(target) = redirect_target(&response, &url) {
                    if in_scope(config.scope, &seed, &target) && visited.insert(target.to_string()) {
                        frontier.push_front((target, depth));
                    }
                }
                continue;
            }

            if !response.is_success() {
                continue;
            }

            if !response.is_html() {
                progress.resources += 1;
                continue;
            }

            progress.pages += 1;
            config.progress.report(progress.pages, progress.bytes);
            let html = String::from_utf8_lossy(&response.body);
            let parsed = parse_html(&html, &url);

            if depth < config.max_depth {
                for link in &parsed.links {
                    let Ok(link) = normalize_url(link) else {
                        continue;
                    };
                    if in_scope(config.scope, &seed, &link) && visited.insert(link.to_string()) {
                        frontier.push_back((link, depth + 1));
                    }
                }
            }

            for resource in &parsed.resources {
                let Ok(resource) = normalize_url(resource) else {
                    continue;
                };
                if in_scope(config.scope, &seed, &resource)
                    && visited.insert(resource.to_string())
                {
                    resources.push(resource);
                }
            }
        }

        if progress.pages == 0 {
            return Err(Abort::Failed(format!("no pages captured from {}", seed)));
        }

        for resource in resources {
            if progress.resources >= config.max_pages {
                break;
            }
            if !robots.is_allowed(resource.as_str(), &self.robots_agent) {
                continue;
            }
            let Some(response) = self.fetch(&resource, delay, &mut progress).await? else {
                continue;
            };
            if response.is_rate_limited() {
                warn!("Rate limited while fetching resources from {}, stopping", resource);
                break;
            }
            record(writer, &response)?;
            if response.is_success() {
                progress.resources += 1;
            }
        }

        Ok(progress)
    }

    /// Fetches one URL after the politeness delay
    ///
    /// Network errors are logged and yield `None`.
    async fn fetch(
        &self,
        url: &Url,
        delay: Duration,
        progress: &mut CrawlProgress,
    ) -> Result<Option<FetchedResponse>, Abort> {
        if progress.requests > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        progress.requests += 1;

        match fetch_url(&self.client, url.as_str()).await {
            FetchResult::Response(response) => {
                let size = response.body.len() as u64;
                progress.bytes += size;
                self.usage.record(HTTP_CRAWL_SERVICE, size);
                debug!("Fetched {} (HTTP {}, {} bytes)", url, response.status, size);
                Ok(Some(response))
            }
            FetchResult::NetworkError { error, timed_out } => {
                self.usage.record(HTTP_CRAWL_SERVICE, 0);
                if timed_out {
                    warn!("Request to {} timed out", url);
                } else {
                    warn!("Request to {} failed: {}", url, error);
                }
                Ok(None)
            }
        }
    }
}

fn record(writer: &mut CaptureWriter, response: &FetchedResponse) -> Result<(), Abort> {
    writer
        .write_response(&response.to_capture())
        .map(|_| ())
        .map_err(|e| Abort::Failed(format!("failed to write capture: {}", e)))
}

fn redirect_target(response: &FetchedResponse, url: &Url) -> Option<Url> {
    let location = response.header("location")?;
    let target = url.join(location).ok()?;
    normalize_url(target.as_str()).ok()
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!("Could not remove partial capture {}: {}", path.display(), e);
    }
}

#[async_trait]
impl CrawlExecutor for SimpleHttpExecutor {
    async fn execute(&self, config: &CrawlConfig) -> CrawlResult {
        let started = Instant::now();
        let artifact_path = config.artifact_path();

        let mut writer = match CaptureWriter::create(&artifact_path, &self.software) {
            Ok(writer) => writer,
            Err(e) => {
                return CrawlResult::failure(
                    format!("failed to create capture {}: {}", artifact_path.display(), e),
                    started.elapsed(),
                )
            }
        };

        let outcome = self.crawl(config, &mut writer).await;
        let finished = writer.finish();

        match (outcome, finished) {
            (Ok(progress), Ok(path)) => {
                info!(
                    "Crawled {}: {} pages, {} resources, {} bytes in {:.1}s",
                    config.seed_url,
                    progress.pages,
                    progress.resources,
                    progress.bytes,
                    started.elapsed().as_secs_f64()
                );
                CrawlResult {
                    success: true,
                    pages_crawled: progress.pages,
                    resources_crawled: progress.resources,
                    bytes_downloaded: progress.bytes,
                    crawl_duration: started.elapsed(),
                    artifact_path: Some(path),
                    error_message: None,
                    rate_limited: false,
                }
            }
            (Ok(_), Err(e)) => {
                discard(&artifact_path);
                CrawlResult::failure(
                    format!("failed to finish capture: {}", e),
                    started.elapsed(),
                )
            }
            (Err(abort), _) => {
                discard(&artifact_path);
                let (message, rate_limited) = match abort {
                    Abort::Failed(message) => (message, false),
                    Abort::RateLimited(message) => (message, true),
                };
                warn!("Crawl of {} failed: {}", config.seed_url, message);
                CrawlResult {
                    rate_limited,
                    ..CrawlResult::failure(message, started.elapsed())
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "simple"
    }
}
