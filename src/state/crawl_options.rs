//! Crawl engine and scope selections carried on every crawl job

use serde::Deserialize;
use std::fmt;

/// Which crawl executor runs a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlEngine {
    /// Browser-driven crawler with JavaScript rendering
    Browsertrix,
    /// Headless-browser crawler
    Brozzler,
    /// Plain HTTP crawler without JavaScript
    Simple,
}

impl CrawlEngine {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Browsertrix => "browsertrix",
            Self::Brozzler => "brozzler",
            Self::Simple => "simple",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "browsertrix" => Some(Self::Browsertrix),
            "brozzler" => Some(Self::Brozzler),
            "simple" => Some(Self::Simple),
            _ => None,
        }
    }

    /// Returns true if the engine renders JavaScript
    pub fn renders_javascript(&self) -> bool {
        matches!(self, Self::Browsertrix | Self::Brozzler)
    }
}

impl fmt::Display for CrawlEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Which discovered URLs a crawl is allowed to follow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlScope {
    /// Same host as the seed (ignoring a leading `www.`)
    Domain,
    /// The seed's domain and any of its subdomains
    Subdomain,
    /// Same host, and the path must start with the seed's path
    Path,
}

impl CrawlScope {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Subdomain => "subdomain",
            Self::Path => "path",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "domain" => Some(Self::Domain),
            "subdomain" => Some(Self::Subdomain),
            "path" => Some(Self::Path),
            _ => None,
        }
    }
}

impl fmt::Display for CrawlScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
