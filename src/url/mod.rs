//! URL handling module for Sumi-Strata
//!
//! This module provides URL normalization, domain extraction, crawl scope
//! checks, and the canonical keys used by the capture index.

mod domain;
mod normalize;
mod scope;
mod surt;

// Re-export main functions
pub use domain::{extract_domain, strip_www};
pub use normalize::normalize_url;
pub use scope::{in_scope, is_same_or_subdomain};
pub use surt::{cdx_timestamp, parse_cdx_timestamp, url_key, CDX_TIMESTAMP_FORMAT};
