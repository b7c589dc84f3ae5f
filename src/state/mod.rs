//! State module for the archival lifecycle
//!
//! This module holds the closed sets of values that flow through storage,
//! the scheduler, and the change detector.
//!
//! # Components
//!
//! - `CrawlStatus`: Lifecycle of a crawl job (pending, in progress, terminal outcomes)
//! - `CrawlFrequency`: Recurrence of a schedule, and `ObservedChangeFrequency` labels
//! - `ChangeType`: Classification of the change between two snapshots
//! - `CrawlEngine` / `CrawlScope`: Executor selection and link-following scope

mod change_type;
mod crawl_options;
mod frequency;
mod job_status;

// Re-export main types
pub use change_type::ChangeType;
pub use crawl_options::{CrawlEngine, CrawlScope};
pub use frequency::{CrawlFrequency, ObservedChangeFrequency};
pub use job_status::CrawlStatus;
