//! Crawler module: the crawl executor contract and its plain HTTP engine
//!
//! This module contains:
//! - The `CrawlExecutor` trait every engine implements
//! - Routing from a job's engine to an executor
//! - HTTP fetching and HTML link extraction
//! - A breadth-first HTTP executor that writes WARC captures
//! - Request accounting shared across executors

mod executor;
mod fetcher;
mod parser;
mod simple;
mod usage;

pub use executor::{
    execute_with_timeout, CrawlConfig, CrawlExecutor, CrawlProgressUpdate, CrawlResult,
    EngineRouter, ProgressReporter,
};
pub use fetcher::{build_http_client, fetch_url, FetchResult, FetchedResponse};
pub use parser::{extract_resources, parse_html, ParsedPage};
pub use simple::SimpleHttpExecutor;
pub use usage::{UsageCounter, UsageTotals, HTTP_CRAWL_SERVICE};

use crate::config::UserAgentConfig;
use crate::StrataError;
use std::sync::Arc;

/// Builds the router used by the scheduler
///
/// Only the plain HTTP executor ships with the crate, so every engine routes
/// to it until a browser-driven executor is registered.
///
/// # Arguments
///
/// * `user_agent` - Identification sent with every request
/// * `usage` - Counter the executors add their requests to
pub fn default_router(
    user_agent: &UserAgentConfig,
    usage: UsageCounter,
) -> Result<EngineRouter, StrataError> {
    let simple: Arc<dyn CrawlExecutor> = Arc::new(SimpleHttpExecutor::new(user_agent, usage)?);
    let mut router = EngineRouter::new(Arc::clone(&simple));
    router.register(crate::state::CrawlEngine::Simple, simple);
    Ok(router)
}
