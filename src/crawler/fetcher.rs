//! HTTP fetcher implementation
//!
//! This module handles all HTTP requests made during a crawl:
//! - Building HTTP clients with the configured user agent string
//! - GET requests whose full response is kept for capture
//! - Manual redirect handling (redirects are captured, not followed)
//! - Error classification

use crate::archive::HttpCapture;
use crate::config::UserAgentConfig;
use chrono::{DateTime, Utc};
use reqwest::{redirect::Policy, Client, StatusCode};
use std::time::Duration;

/// Headers dropped from captures because the body is stored decoded
const HOP_HEADERS: &[&str] = &["transfer-encoding", "content-encoding", "content-length"];

/// A complete HTTP response, ready to be written to a capture file
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub url: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_html(&self) -> bool {
        self.content_type()
            .map(|ct| {
                let ct = ct.to_ascii_lowercase();
                ct.contains("text/html") || ct.contains("application/xhtml+xml")
            })
            .unwrap_or(false)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS.as_u16()
    }

    /// Converts the response into a capture record
    pub fn to_capture(&self) -> HttpCapture {
        HttpCapture {
            url: self.url.clone(),
            status: self.status,
            reason: self.reason.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            captured_at: self.fetched_at,
        }
    }
}

/// Result of a fetch operation
#[derive(Debug)]
pub enum FetchResult {
    /// The server answered; any status, including errors and redirects
    Response(FetchedResponse),

    /// Network error (connection refused, timeout, TLS, body read failure)
    NetworkError {
        /// Error description
        error: String,
        /// Whether the request timed out
        timed_out: bool,
    },
}

/// Builds an HTTP client with proper configuration
///
/// Redirects are not followed automatically so that each hop is captured as
/// its own record.
///
/// # Arguments
///
/// * `config` - The user agent configuration
/// * `request_timeout` - Bound on a single request
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use sumi_strata::config::UserAgentConfig;
/// use sumi_strata::crawler::build_http_client;
///
/// let config = UserAgentConfig {
///     crawler_name: "SumiStrata".to_string(),
///     crawler_version: "1.0".to_string(),
///     contact_url: "https://example.com/about".to_string(),
///     contact_email: "admin@example.com".to_string(),
/// };
///
/// let client = build_http_client(&config, Duration::from_secs(30)).unwrap();
/// ```
pub fn build_http_client(
    config: &UserAgentConfig,
    request_timeout: Duration,
) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.header_value())
        .timeout(request_timeout)
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::none())
        .gzip(true)
        .brotli(true)
        .build()
}

/// Fetches a URL and keeps the whole response
///
/// # Classification
///
/// | Condition | Result |
/// |-----------|--------|
/// | Any HTTP status | `Response` (callers inspect the status) |
/// | Timeout | `NetworkError { timed_out: true }` |
/// | Connection refused, TLS error | `NetworkError` |
/// | Body read failure | `NetworkError` |
pub async fn fetch_url(client: &Client, url: &str) -> FetchResult {
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => return network_error(e),
    };

    let status = response.status();
    let headers = response
        .headers()
        .iter()
        .filter(|(name, _)| !HOP_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let fetched_at = Utc::now();

    match response.bytes().await {
        Ok(body) => FetchResult::Response(FetchedResponse {
            url: url.to_string(),
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            headers,
            body: body.to_vec(),
            fetched_at,
        }),
        Err(e) => network_error(e),
    }
}

fn network_error(e: reqwest::Error) -> FetchResult {
    if e.is_timeout() {
        FetchResult::NetworkError {
            error: "Request timeout".to_string(),
            timed_out: true,
        }
    } else if e.is_connect() {
        FetchResult::NetworkError {
            error: format!("Connection failed: {}", e),
            timed_out: false,
        }
    } else {
        FetchResult::NetworkError {
            error: e.to_string(),
            timed_out: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_config() -> UserAgentConfig {
        UserAgentConfig {
            crawler_name: "TestCrawler".to_string(),
            crawler_version: "1.0".to_string(),
            contact_url: "https://example.com/about".to_string(),
            contact_email: "admin@example.com".to_string(),
        }
    }

    fn client() -> Client {
        build_http_client(&create_test_config(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_html_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<html><body>hi</body></html>", "text/html"),
            )
            .mount(&server)
            .await;

        let url = format!("{}/", server.uri());
        let FetchResult::Response(response) = fetch_url(&client(), &url).await else {
            panic!("expected a response");
        };
        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "OK");
        assert!(response.is_html());
        assert!(response.is_success());
        assert_eq!(response.body, b"<html><body>hi</body></html>");
        assert!(response.header("content-length").is_none());

        let capture = response.to_capture();
        assert_eq!(capture.url, url);
        assert_eq!(capture.status, 200);
    }

    #[tokio::test]
    async fn test_redirect_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
            .mount(&server)
            .await;

        let url = format!("{}/old", server.uri());
        let FetchResult::Response(response) = fetch_url(&client(), &url).await else {
            panic!("expected a response");
        };
        assert!(response.is_redirect());
        assert_eq!(response.header("Location"), Some("/new"));
    }

    #[tokio::test]
    async fn test_rate_limited_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let FetchResult::Response(response) = fetch_url(&client(), &server.uri()).await else {
            panic!("expected a response");
        };
        assert!(response.is_rate_limited());
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Nothing listens on port 9 locally
        let result = fetch_url(&client(), "http://127.0.0.1:9/").await;
        assert!(matches!(
            result,
            FetchResult::NetworkError {
                timed_out: false,
                ..
            }
        ));
    }
}
