//! Crawl scheduling
//!
//! Decides when each tracked link is crawled, dispatches due work under a
//! concurrency ceiling, adapts re-crawl intervals to observed change, and
//! recovers from failed or abandoned jobs.

mod dispatcher;
pub mod policy;
pub mod recovery;

pub use dispatcher::{
    CrawlTarget, CycleReport, DispatchItem, DispatchPlan, ManualCrawl, ManualCrawlOutcome,
    PendingOverview, Scheduler, SkipReason,
};
pub use policy::{default_schedule_for_rank, next_run, AdaptivePolicy, DefaultSchedule, RunObservation};
pub use recovery::{
    is_stale, resolve_failure, sweep_stale_jobs, FailureResolution, STALE_JOB_MESSAGE,
};
