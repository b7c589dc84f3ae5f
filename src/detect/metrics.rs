use crate::state::ChangeType;
use serde::{Deserialize, Serialize};

/// Per-category lists of what changed between two snapshots
///
/// Stored as a JSON document on the change record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeDetails {
    pub pages_added: Vec<String>,
    pub pages_removed: Vec<String>,
    pub pages_changed: Vec<String>,
    pub sections_added: Vec<String>,
    pub sections_removed: Vec<String>,
    pub resources_added: Vec<String>,
    pub resources_removed: Vec<String>,
    pub resources_changed: Vec<String>,
    pub text_similarity: f64,
    pub structure_similarity: f64,
    pub resource_similarity: f64,
}

/// Measured difference between two snapshots
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeMetrics {
    pub change_type: ChangeType,
    /// `1 - similarity`; `None` when the comparison itself failed
    pub change_score: Option<f64>,
    pub similarity_score: Option<f64>,
    pub text_added_bytes: u64,
    pub text_removed_bytes: u64,
    /// `(added + removed) / max(1, old text length)`
    pub text_changed_percentage: f64,
    pub structure_diff_score: f64,
    pub sections_added: u32,
    pub sections_removed: u32,
    pub resources_added: u32,
    pub resources_removed: u32,
    pub resources_changed: u32,
    pub details: ChangeDetails,
    /// Data-quality or computation warning surfaced with the record
    pub warning: Option<String>,
    pub computation_time_secs: f64,
}

impl Default for ChangeMetrics {
    fn default() -> Self {
        Self {
            change_type: ChangeType::NoChange,
            change_score: Some(0.0),
            similarity_score: Some(1.0),
            text_added_bytes: 0,
            text_removed_bytes: 0,
            text_changed_percentage: 0.0,
            structure_diff_score: 0.0,
            sections_added: 0,
            sections_removed: 0,
            resources_added: 0,
            resources_removed: 0,
            resources_changed: 0,
            details: ChangeDetails::default(),
            warning: None,
            computation_time_secs: 0.0,
        }
    }
}

/// Change metrics together with the significance judgment made on them
///
/// The only way to build one is [`ChangeAnalysis::new`], so significance and
/// the reanalysis flag can never disagree with the score and threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeAnalysis {
    metrics: ChangeMetrics,
    threshold: f64,
    significant: bool,
}

impl ChangeAnalysis {
    /// Judges the metrics against a significance threshold
    ///
    /// A missing change score counts as maximal, so a failed comparison is
    /// always significant.
    pub fn new(metrics: ChangeMetrics, threshold: f64) -> Self {
        let significant = is_significant(metrics.change_score, threshold);
        Self {
            metrics,
            threshold,
            significant,
        }
    }

    pub fn metrics(&self) -> &ChangeMetrics {
        &self.metrics
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_significant(&self) -> bool {
        self.significant
    }

    /// Reanalysis is requested exactly when the change is significant
    pub fn requires_reanalysis(&self) -> bool {
        self.significant
    }

    pub fn change_type(&self) -> ChangeType {
        self.metrics.change_type
    }

    pub fn change_score(&self) -> Option<f64> {
        self.metrics.change_score
    }
}

/// `score >= threshold`, with a missing score treated as maximal
pub fn is_significant(score: Option<f64>, threshold: f64) -> bool {
    score.map_or(true, |s| s >= threshold)
}
