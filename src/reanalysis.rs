//! Reanalysis signal for downstream consumers
//!
//! A significant change between two snapshots flags its change record with
//! `requires_reanalysis`. Consumers are pushed a [`ReanalysisSignal`] through a
//! [`ReanalysisSink`] as soon as the change is recorded, and can also pull the
//! outstanding records with [`pending_signals`]. The flag stays set until the
//! consumer calls [`acknowledge`].

use crate::state::ChangeType;
use crate::storage::{ChangeRecord, Storage};
use crate::StrataError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

/// A change that warrants downstream reanalysis
#[derive(Debug, Clone, PartialEq)]
pub struct ReanalysisSignal {
    pub change_id: i64,
    pub project_id: i64,
    pub project_code: String,
    pub seed_url: String,
    pub old_snapshot_id: i64,
    pub new_snapshot_id: i64,
    pub new_version: u32,
    pub change_type: ChangeType,
    /// `None` when the score could not be computed
    pub change_score: Option<f64>,
    pub computed_at: DateTime<Utc>,
}

/// Receives reanalysis signals as changes are recorded
#[async_trait]
pub trait ReanalysisSink: Send + Sync {
    async fn notify(&self, signal: &ReanalysisSignal) -> Result<(), StrataError>;
}

/// Sink that only logs each signal
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingReanalysisSink;

#[async_trait]
impl ReanalysisSink for LoggingReanalysisSink {
    async fn notify(&self, signal: &ReanalysisSignal) -> Result<(), StrataError> {
        info!(
            "Reanalysis requested for {} ({}): {} in v{} (change {}, score {})",
            signal.project_code,
            signal.seed_url,
            signal.change_type,
            signal.new_version,
            signal.change_id,
            signal
                .change_score
                .map(|s| format!("{:.3}", s))
                .unwrap_or_else(|| "n/a".to_string())
        );
        Ok(())
    }
}

/// Resolves the project and snapshot behind a change record
pub fn signal_for(storage: &dyn Storage, change: &ChangeRecord) -> Result<ReanalysisSignal, StrataError> {
    let snapshot = storage.get_snapshot(change.new_snapshot_id)?;
    let project = storage.get_project(snapshot.project_id)?;
    Ok(ReanalysisSignal {
        change_id: change.id,
        project_id: project.id,
        project_code: project.code,
        seed_url: snapshot.seed_url,
        old_snapshot_id: change.old_snapshot_id,
        new_snapshot_id: change.new_snapshot_id,
        new_version: snapshot.version_number,
        change_type: change.analysis.change_type(),
        change_score: change.analysis.change_score(),
        computed_at: change.computed_at,
    })
}

/// Signals still awaiting reanalysis with a score at or above `threshold`
///
/// Records whose score could not be computed are always included.
pub fn pending_signals(
    storage: &dyn Storage,
    threshold: f64,
) -> Result<Vec<ReanalysisSignal>, StrataError> {
    storage
        .pending_reanalysis(threshold)?
        .iter()
        .map(|change| signal_for(storage, change))
        .collect()
}

/// Clears the reanalysis flag once the consumer has acted on a change
pub fn acknowledge(storage: &mut dyn Storage, change_id: i64) -> Result<(), StrataError> {
    storage.clear_reanalysis(change_id)?;
    info!("Reanalysis of change {} acknowledged", change_id);
    Ok(())
}
