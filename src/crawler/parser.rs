//! HTML parser for extracting links and page resources
//!
//! This module handles parsing HTML content to extract:
//! - Links to follow (from <a> tags and canonical links)
//! - Resources to capture alongside the page (images, scripts, stylesheets)
//! - Page title

use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Extracted information from an HTML page
#[derive(Debug, Clone)]
pub struct ParsedPage {
    /// The page title (from <title> tag)
    pub title: Option<String>,

    /// All links found on the page (absolute URLs)
    pub links: Vec<String>,

    /// Images, scripts, and stylesheets referenced by the page (absolute URLs)
    pub resources: Vec<String>,
}

/// Parses HTML content and extracts links, resources, and the title
///
/// # Link Extraction Rules
///
/// **Links:**
/// - `<a href="...">` tags, except those with a `download` attribute
/// - `<link rel="canonical" href="...">`
///
/// **Resources:**
/// - `<img src="...">`
/// - `<script src="...">`
/// - `<link rel="stylesheet" href="...">`
///
/// `javascript:`, `mailto:`, `tel:` and data URIs are skipped everywhere.
///
/// # Example
///
/// ```
/// use sumi_strata::crawler::parse_html;
/// use url::Url;
///
/// let html = r#"<html><head><title>Test</title></head><body><a href="/page">Link</a></body></html>"#;
/// let base_url = Url::parse("https://example.com/").unwrap();
/// let parsed = parse_html(html, &base_url);
/// assert_eq!(parsed.title, Some("Test".to_string()));
/// assert_eq!(parsed.links, vec!["https://example.com/page".to_string()]);
/// ```
pub fn parse_html(html: &str, base_url: &Url) -> ParsedPage {
    let document = Html::parse_document(html);

    ParsedPage {
        title: extract_title(&document),
        links: extract_links(&document, base_url),
        resources: extract_resources(&document, base_url),
    }
}

/// Extracts the page title from the HTML document
fn extract_title(document: &Html) -> Option<String> {
    let title_selector = Selector::parse("title").ok()?;

    document
        .select(&title_selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Extracts all followable links from the HTML document
fn extract_links(document: &Html, base_url: &Url) -> Vec<String> {
    let mut links = Vec::new();

    if let Ok(a_selector) = Selector::parse("a[href]") {
        for element in document.select(&a_selector) {
            if element.value().attr("download").is_some() {
                continue;
            }
            if let Some(absolute_url) = element
                .value()
                .attr("href")
                .and_then(|href| resolve_link(href, base_url))
            {
                links.push(absolute_url);
            }
        }
    }

    if let Ok(canonical_selector) = Selector::parse("link[rel='canonical'][href]") {
        for element in document.select(&canonical_selector) {
            if let Some(absolute_url) = element
                .value()
                .attr("href")
                .and_then(|href| resolve_link(href, base_url))
            {
                links.push(absolute_url);
            }
        }
    }

    links
}

/// Extracts resource URLs referenced by an already-parsed document
///
/// Duplicates are removed; document order is kept.
pub fn extract_resources(document: &Html, base_url: &Url) -> Vec<String> {
    let mut resources: Vec<String> = Vec::new();

    for (selector, attr) in [
        ("img[src]", "src"),
        ("script[src]", "src"),
        ("link[href]", "href"),
    ] {
        let Ok(selector) = Selector::parse(selector) else {
            continue;
        };
        for element in document.select(&selector) {
            if element.value().name() == "link" && !is_stylesheet(&element) {
                continue;
            }
            if let Some(absolute_url) = element
                .value()
                .attr(attr)
                .and_then(|value| resolve_link(value, base_url))
            {
                if !resources.contains(&absolute_url) {
                    resources.push(absolute_url);
                }
            }
        }
    }

    resources
}

fn is_stylesheet(element: &ElementRef) -> bool {
    element.value().attr("rel").map_or(false, |rel| {
        rel.split_whitespace()
            .any(|r| r.eq_ignore_ascii_case("stylesheet"))
    })
}

/// Resolves an href to an absolute http(s) URL without its fragment
///
/// Returns None if the link should be excluded:
/// - javascript:, mailto:, tel: schemes
/// - data: URIs
/// - Fragment-only links
/// - Invalid or non-HTTP(S) URLs
fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    if href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }

    let mut absolute_url = base_url.join(href).ok()?;
    if absolute_url.scheme() != "http" && absolute_url.scheme() != "https" {
        return None;
    }
    absolute_url.set_fragment(None);
    Some(absolute_url.to_string())
}
