//! Schedule frequency definitions

use chrono::Duration;
use std::fmt;

/// How often a tracked site is re-crawled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrawlFrequency {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    /// Never dispatched automatically, only by a manual trigger
    OnDemand,
}

impl CrawlFrequency {
    /// Returns the nominal interval between runs
    ///
    /// # Returns
    ///
    /// * `Some(Duration)` - The base interval for recurring frequencies
    /// * `None` - For `OnDemand`, which has no recurrence
    pub fn base_interval(&self) -> Option<Duration> {
        match self {
            Self::Daily => Some(Duration::days(1)),
            Self::Weekly => Some(Duration::days(7)),
            Self::Biweekly => Some(Duration::days(14)),
            Self::Monthly => Some(Duration::days(30)),
            Self::OnDemand => None,
        }
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Biweekly => "biweekly",
            Self::Monthly => "monthly",
            Self::OnDemand => "on_demand",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "biweekly" => Some(Self::Biweekly),
            "monthly" => Some(Self::Monthly),
            "on_demand" => Some(Self::OnDemand),
            _ => None,
        }
    }

    pub fn all() -> Vec<Self> {
        vec![
            Self::Daily,
            Self::Weekly,
            Self::Biweekly,
            Self::Monthly,
            Self::OnDemand,
        ]
    }
}

impl fmt::Display for CrawlFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Label describing how often a site has actually been observed to change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservedChangeFrequency {
    /// Running average change score is high
    Frequent,
    Occasional,
    Rare,
    /// Enough consecutive no-change runs that the schedule is backing off
    Static,
}

impl ObservedChangeFrequency {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Frequent => "frequent",
            Self::Occasional => "occasional",
            Self::Rare => "rare",
            Self::Static => "static",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "frequent" => Some(Self::Frequent),
            "occasional" => Some(Self::Occasional),
            "rare" => Some(Self::Rare),
            "static" => Some(Self::Static),
            _ => None,
        }
    }
}

impl fmt::Display for ObservedChangeFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
