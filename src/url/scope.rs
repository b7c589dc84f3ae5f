//! Crawl scope checks
//!
//! Decides whether a discovered URL belongs to the site being archived.

use crate::state::CrawlScope;
use crate::url::domain::strip_www;
use url::Url;

/// Checks if a host is the base domain or one of its subdomains
///
/// `"example.com"` matches `"example.com"`, `"blog.example.com"` and
/// `"api.v2.example.com"`, but not `"myexample.com"`.
///
/// # Arguments
///
/// * `base` - The lowercase base domain
/// * `candidate` - The lowercase host to check
pub fn is_same_or_subdomain(base: &str, candidate: &str) -> bool {
    if base.is_empty() {
        return false;
    }
    candidate == base || candidate.ends_with(&format!(".{}", base))
}

/// Checks if `candidate` falls inside the crawl scope rooted at `seed`
///
/// # Scope Rules
///
/// | Scope | Rule |
/// |-------|------|
/// | `Domain` | Same host as the seed, ignoring a leading `www.` |
/// | `Subdomain` | Seed domain or any of its subdomains |
/// | `Path` | Same host and the path starts with the seed's directory |
///
/// Ports must match for every scope, so a crawl never wanders onto another
/// service running on the same host.
///
/// # Arguments
///
/// * `scope` - The crawl scope
/// * `seed` - The crawl's seed URL
/// * `candidate` - The discovered URL
pub fn in_scope(scope: CrawlScope, seed: &Url, candidate: &Url) -> bool {
    let (Some(seed_host), Some(host)) = (seed.host_str(), candidate.host_str()) else {
        return false;
    };

    if seed.port_or_known_default() != candidate.port_or_known_default() {
        return false;
    }

    let seed_host = seed_host.to_lowercase();
    let host = host.to_lowercase();

    match scope {
        CrawlScope::Domain => strip_www(&seed_host) == strip_www(&host),
        CrawlScope::Subdomain => is_same_or_subdomain(strip_www(&seed_host), &host),
        CrawlScope::Path => {
            strip_www(&seed_host) == strip_www(&host)
                && candidate.path().starts_with(seed_directory(seed))
        }
    }
}

/// Returns the directory portion of the seed path (`/docs/intro` -> `/docs/`)
fn seed_directory(seed: &Url) -> &str {
    let path = seed.path();
    match path.rfind('/') {
        Some(idx) => &path[..=idx],
        None => "/",
    }
}
