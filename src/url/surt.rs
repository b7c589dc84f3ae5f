//! Index keys for captured URLs
//!
//! Captures are indexed under a sort-friendly key that reverses the host
//! labels, so all captures of one site sort next to each other.

use chrono::{DateTime, NaiveDateTime, Utc};
use url::Url;

/// Format of capture timestamps in index records
pub const CDX_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Converts a URL to its index key
///
/// The host is lowercased, a leading `www.` is dropped, the labels are
/// reversed and joined with commas, then `)` and the path (plus query) are
/// appended. Strings that do not parse as URLs are returned unchanged.
///
/// # Examples
///
/// ```
/// use sumi_strata::url::url_key;
///
/// assert_eq!(url_key("https://www.Example.com/path?q=1"), "com,example)/path?q=1");
/// assert_eq!(url_key("https://docs.example.com"), "com,example,docs)/");
/// ```
pub fn url_key(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return url.to_string();
    };

    let Some(host) = parsed.host_str() else {
        return url.to_string();
    };

    let host = host.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let reversed = host.split('.').rev().collect::<Vec<_>>().join(",");

    let mut key = format!("{}){}", reversed, parsed.path());
    if let Some(query) = parsed.query() {
        key.push('?');
        key.push_str(query);
    }
    key
}

/// Formats a capture time as a 14-digit index timestamp
pub fn cdx_timestamp(at: &DateTime<Utc>) -> String {
    at.format(CDX_TIMESTAMP_FORMAT).to_string()
}

/// Parses a 14-digit index timestamp
pub fn parse_cdx_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, CDX_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
