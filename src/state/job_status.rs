/// Crawl job status definitions
///
/// This module defines the lifecycle a crawl job moves through, from creation
/// by the scheduler (or a manual trigger) to one of its terminal outcomes.
use std::fmt;

/// Represents the current status of a crawl job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrawlStatus {
    // ===== Active States =====
    /// Job has been created but not yet dispatched
    Pending,

    /// Job has been dispatched to a crawl executor
    InProgress,

    // ===== Terminal States =====
    /// Executor reported success and the capture was handed to the snapshot pipeline
    Completed,

    /// Executor reported failure, timed out, or the job was swept as stale
    Failed,

    /// Job was aborted by an explicit stop request
    Cancelled,

    /// Executor or target site signalled throttling
    RateLimited,
}

impl CrawlStatus {
    /// Returns true if this is a terminal state (the job row will not change again)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::InProgress)
    }

    /// Returns true if this is an active state (job still owns a slot or a place in line)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Returns true if this outcome is eligible for a retry job
    ///
    /// Cancelled jobs are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::RateLimited)
    }

    /// Returns true if moving from this status to `next` is allowed
    ///
    /// Transitions are one-directional:
    /// `Pending -> InProgress -> {Completed, Failed, Cancelled, RateLimited}`,
    /// plus `Pending -> Cancelled` for jobs cancelled before dispatch.
    pub fn can_transition_to(&self, next: CrawlStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::InProgress | Self::Cancelled),
            Self::InProgress => next.is_terminal(),
            Self::Completed | Self::Failed | Self::Cancelled | Self::RateLimited => false,
        }
    }

    /// Converts the status to a database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RateLimited => "rate_limited",
        }
    }

    /// Parses a status from a database string representation
    ///
    /// Returns None if the string doesn't match any known status.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "rate_limited" => Some(Self::RateLimited),
            _ => None,
        }
    }

    /// Returns all possible job statuses
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Pending,
            Self::InProgress,
            Self::Completed,
            Self::Failed,
            Self::Cancelled,
            Self::RateLimited,
        ]
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
