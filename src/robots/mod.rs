//! Robots.txt handling module
//!
//! Crawls that respect robots.txt fetch the file once per origin and consult
//! it before every request. A missing or unreadable file allows everything.

mod parser;

pub use parser::RobotsRules;

use reqwest::{Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

/// Fetches robots.txt for the origin of `url`
///
/// # Arguments
///
/// * `client` - The HTTP client to use
/// * `url` - Any URL on the origin whose robots.txt should be fetched
///
/// # Returns
///
/// The parsed rules. Any non-success response or network failure yields
/// permissive rules, so a broken robots.txt never blocks a crawl.
pub async fn fetch_robots(client: &Client, url: &Url) -> RobotsRules {
    let Ok(robots_url) = url.join("/robots.txt") else {
        return RobotsRules::allow_all();
    };

    match client.get(robots_url.as_str()).send().await {
        Ok(response) if response.status() == StatusCode::OK => match response.text().await {
            Ok(body) => {
                debug!("Loaded robots.txt from {}", robots_url);
                RobotsRules::from_content(&body)
            }
            Err(e) => {
                warn!("Failed to read robots.txt body from {}: {}", robots_url, e);
                RobotsRules::allow_all()
            }
        },
        Ok(response) => {
            debug!(
                "No robots.txt at {} (HTTP {}), allowing all",
                robots_url,
                response.status().as_u16()
            );
            RobotsRules::allow_all()
        }
        Err(e) => {
            warn!("Failed to fetch robots.txt from {}: {}", robots_url, e);
            RobotsRules::allow_all()
        }
    }
}
