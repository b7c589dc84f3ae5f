//! Versioned snapshot construction
//!
//! Turns a stored capture into the next snapshot of its link: assigns the
//! version, records fingerprints, the artifact row, and index records, then
//! compares against the previous version. Every step after the snapshot row
//! exists is idempotent so an interrupted build can be repaired later.

use crate::archive::content::SiteContent;
use crate::archive::index::{index_artifact, write_cdx_file};
use crate::archive::store::{ArtifactStore, StorageMetadata};
use crate::detect::{Baseline, ChangeDetector};
use crate::storage::{
    self, ArtifactRecord, ChangeRecord, CrawlJobRecord, NewArtifact, NewSnapshot, SharedStorage,
    SnapshotRecord, Storage,
};
use crate::StrataError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Snapshots of one link in version order
///
/// Version `v` lives at index `v - 1`, so the previous snapshot of `v` is at
/// index `v - 2`.
#[derive(Debug, Clone, Default)]
pub struct SnapshotChain {
    snapshots: Vec<SnapshotRecord>,
}

impl SnapshotChain {
    pub fn load(storage: &dyn Storage, link_id: i64) -> Result<Self, StrataError> {
        Ok(Self::from_records(storage.snapshots_for_link(link_id)?))
    }

    pub fn from_records(mut snapshots: Vec<SnapshotRecord>) -> Self {
        snapshots.sort_by_key(|s| s.version_number);
        Self { snapshots }
    }

    pub fn get(&self, version: u32) -> Option<&SnapshotRecord> {
        let index = (version as usize).checked_sub(1)?;
        self.snapshots
            .get(index)
            .filter(|s| s.version_number == version)
    }

    /// The snapshot that version `version` is compared against
    pub fn previous_of(&self, version: u32) -> Option<&SnapshotRecord> {
        self.get(version.checked_sub(1)?)
    }

    pub fn latest(&self) -> Option<&SnapshotRecord> {
        self.snapshots.last()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SnapshotRecord> {
        self.snapshots.iter()
    }
}

/// What the builder needs to know about a finished crawl
#[derive(Debug, Clone)]
pub struct CaptureSummary {
    pub captured_at: DateTime<Utc>,
    pub pages_crawled: u32,
    pub resources_crawled: u32,
    pub bytes_downloaded: u64,
    pub crawl_duration_secs: f64,
}

/// Result of building (or repairing) a snapshot
#[derive(Debug, Clone)]
pub struct BuiltSnapshot {
    pub snapshot: SnapshotRecord,
    pub change: Option<ChangeRecord>,
    /// First processing failure; the snapshot is left incomplete when set
    pub processing_error: Option<String>,
}

impl BuiltSnapshot {
    pub fn is_complete(&self) -> bool {
        self.processing_error.is_none()
    }
}

/// Builds versioned snapshots from stored captures
pub struct SnapshotBuilder {
    storage: SharedStorage,
    store: Arc<dyn ArtifactStore>,
    detector: ChangeDetector,
    link_locks: std::sync::Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl SnapshotBuilder {
    pub fn new(
        storage: SharedStorage,
        store: Arc<dyn ArtifactStore>,
        detector: ChangeDetector,
    ) -> Self {
        Self {
            storage,
            store,
            detector,
            link_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn link_lock(&self, link_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .link_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(link_id).or_default())
    }

    /// Builds the next snapshot for a completed job
    ///
    /// # Arguments
    ///
    /// * `job` - The completed crawl job
    /// * `stored` - Where the job's artifact was stored
    /// * `summary` - Counts and timing reported by the executor
    ///
    /// # Returns
    ///
    /// * `Ok(BuiltSnapshot)` - The snapshot exists; check `processing_error`
    /// * `Err(StrataError)` - The snapshot row could not be created
    pub async fn build(
        &self,
        job: &CrawlJobRecord,
        stored: &StorageMetadata,
        summary: &CaptureSummary,
    ) -> Result<BuiltSnapshot, StrataError> {
        let link_lock = self.link_lock(job.link_id);
        let _guard = link_lock.lock().await;

        let content = load_content(PathBuf::from(&stored.location)).await;
        let (pages, resources) = match &content {
            Ok(c) => (c.page_count() as u32, c.captured_resource_count() as u32),
            Err(_) => (summary.pages_crawled, summary.resources_crawled),
        };

        let new_snapshot = NewSnapshot {
            link_id: job.link_id,
            project_id: job.project_id,
            crawl_job_id: job.id.clone(),
            captured_at: summary.captured_at,
            domain: url::Url::parse(&job.seed_url)
                .ok()
                .and_then(|u| crate::url::extract_domain(&u))
                .unwrap_or_default(),
            seed_url: job.seed_url.clone(),
            pages_captured: pages,
            resources_captured: resources,
            total_bytes: summary.bytes_downloaded,
            crawl_duration_secs: summary.crawl_duration_secs,
        };

        let artifact = |snapshot_id: Option<i64>| NewArtifact {
            crawl_job_id: job.id.clone(),
            snapshot_id,
            filename: stored.filename.clone(),
            format: "warc".to_string(),
            storage_path: stored.location.clone(),
            storage_backend: stored.backend.clone(),
            file_size: stored.file_size,
            file_hash: stored.file_hash.clone(),
            compression: None,
            record_count: summary.pages_crawled + summary.resources_crawled,
            page_count: pages,
            resource_count: resources,
        };

        let inserted = storage::lock(&self.storage)?.insert_snapshot_next_version(&new_snapshot);
        let snapshot = match inserted {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Keep the stored capture on record even without a snapshot
                if let Err(record_err) = storage::lock(&self.storage)?.insert_artifact(&artifact(None)) {
                    warn!("Could not record orphaned artifact for job {}: {}", job.id, record_err);
                }
                return Err(e.into());
            }
        };
        info!(
            "Created snapshot v{} for link {} (job {})",
            snapshot.version_number, snapshot.link_id, job.id
        );

        let artifact_row = {
            let mut db = storage::lock(&self.storage)?;
            db.insert_artifact(&artifact(Some(snapshot.id)))
                .and_then(|_| db.artifact_for_snapshot(snapshot.id))
        };

        match artifact_row {
            Ok(Some(artifact)) => Ok(self.process(snapshot, Some(artifact), content).await),
            Ok(None) => Ok(self
                .incomplete(snapshot, "artifact row missing after insert".to_string())),
            Err(e) => Ok(self.incomplete(snapshot, format!("artifact row: {}", e))),
        }
    }

    /// Re-runs the unfinished processing steps of an incomplete snapshot
    pub async fn repair_snapshot(&self, snapshot_id: i64) -> Result<BuiltSnapshot, StrataError> {
        let snapshot = storage::lock(&self.storage)?.get_snapshot(snapshot_id)?;
        let link_lock = self.link_lock(snapshot.link_id);
        let _guard = link_lock.lock().await;

        let (snapshot, change) = {
            let db = storage::lock(&self.storage)?;
            (db.get_snapshot(snapshot_id)?, db.change_for_new_snapshot(snapshot_id)?)
        };
        if snapshot.processing_complete {
            return Ok(BuiltSnapshot {
                snapshot,
                change,
                processing_error: None,
            });
        }

        let artifact = {
            let mut db = storage::lock(&self.storage)?;
            match db.artifact_for_snapshot(snapshot_id)? {
                Some(artifact) => Some(artifact),
                None => match db.artifact_for_job(&snapshot.crawl_job_id)? {
                    Some(orphan) => {
                        db.attach_artifact_to_snapshot(orphan.id, snapshot_id)?;
                        db.artifact_for_snapshot(snapshot_id)?
                    }
                    None => None,
                },
            }
        };

        let content = match &artifact {
            Some(a) => load_content(PathBuf::from(&a.storage_path)).await,
            None => Err("snapshot has no artifact".to_string()),
        };

        info!("Repairing snapshot {} (v{})", snapshot_id, snapshot.version_number);
        Ok(self.process(snapshot, artifact, content).await)
    }

    /// Repairs every incomplete snapshot; returns how many became complete
    pub async fn repair_incomplete(&self) -> Result<usize, StrataError> {
        let incomplete = storage::lock(&self.storage)?.incomplete_snapshots()?;
        let mut repaired = 0;
        for snapshot in incomplete {
            match self.repair_snapshot(snapshot.id).await {
                Ok(built) if built.is_complete() => repaired += 1,
                Ok(built) => warn!(
                    "Snapshot {} still incomplete: {}",
                    snapshot.id,
                    built.processing_error.unwrap_or_default()
                ),
                Err(e) => warn!("Repair of snapshot {} failed: {}", snapshot.id, e),
            }
        }
        Ok(repaired)
    }

    fn incomplete(&self, snapshot: SnapshotRecord, error: String) -> BuiltSnapshot {
        warn!(
            "Snapshot {} left incomplete: {}",
            snapshot.id, error
        );
        BuiltSnapshot {
            snapshot,
            change: None,
            processing_error: Some(error),
        }
    }

    /// Runs fingerprints, index, and change detection where still missing
    async fn process(
        &self,
        snapshot: SnapshotRecord,
        artifact: Option<ArtifactRecord>,
        content: Result<SiteContent, String>,
    ) -> BuiltSnapshot {
        let mut errors: Vec<String> = Vec::new();

        if snapshot.fingerprints.is_none() {
            match &content {
                Ok(c) => {
                    let fingerprints = c.fingerprints();
                    if let Err(e) = storage::lock(&self.storage)
                        .and_then(|mut db| Ok(db.update_snapshot_fingerprints(snapshot.id, &fingerprints)?))
                    {
                        errors.push(format!("fingerprints: {}", e));
                    }
                }
                Err(e) => errors.push(format!("content: {}", e)),
            }
        }

        match &artifact {
            Some(a) if !a.cdx_available => {
                if let Err(e) = self.index(&snapshot, a).await {
                    errors.push(format!("index: {}", e));
                }
            }
            Some(_) => {}
            None => errors.push("artifact: none recorded".to_string()),
        }

        let mut change = match storage::lock(&self.storage)
            .and_then(|db| Ok(db.change_for_new_snapshot(snapshot.id)?))
        {
            Ok(existing) => existing,
            Err(e) => {
                errors.push(format!("change lookup: {}", e));
                None
            }
        };

        if change.is_none() && snapshot.previous_version().is_some() {
            match self.detect_change(&snapshot, content).await {
                Ok(record) => change = Some(record),
                Err(e) => errors.push(format!("change detection: {}", e)),
            }
        }

        if errors.is_empty() {
            if let Err(e) = storage::lock(&self.storage)
                .and_then(|mut db| Ok(db.mark_snapshot_complete(snapshot.id)?))
            {
                errors.push(format!("completion: {}", e));
            }
        }

        let snapshot_id = snapshot.id;
        let snapshot = storage::lock(&self.storage)
            .and_then(|db| Ok(db.get_snapshot(snapshot_id)?))
            .unwrap_or(snapshot);

        if let Some(first) = errors.first() {
            warn!("Snapshot {} left incomplete: {}", snapshot.id, errors.join("; "));
            return BuiltSnapshot {
                snapshot,
                change,
                processing_error: Some(first.clone()),
            };
        }

        debug!("Snapshot {} processing complete", snapshot.id);
        BuiltSnapshot {
            snapshot,
            change,
            processing_error: None,
        }
    }

    async fn index(&self, snapshot: &SnapshotRecord, artifact: &ArtifactRecord) -> Result<(), StrataError> {
        let path = PathBuf::from(&artifact.storage_path);
        let captured_at = snapshot.captured_at;
        let entries = tokio::task::spawn_blocking(move || -> Result<_, StrataError> {
            let entries = index_artifact(&path, &captured_at)?;
            write_cdx_file(&path, &entries)?;
            Ok(entries)
        })
        .await
        .map_err(|e| StrataError::Processing(format!("index task failed: {}", e)))??;

        let mut db = storage::lock(&self.storage)?;
        let inserted = db.insert_index_records(artifact.id, snapshot.id, &entries)?;
        db.set_artifact_indexed(artifact.id)?;
        debug!(
            "Indexed {} records ({} new) for snapshot {}",
            entries.len(),
            inserted,
            snapshot.id
        );
        Ok(())
    }

    async fn detect_change(
        &self,
        snapshot: &SnapshotRecord,
        content: Result<SiteContent, String>,
    ) -> Result<ChangeRecord, StrataError> {
        let (previous, previous_artifact, threshold) = {
            let db = storage::lock(&self.storage)?;
            let chain = SnapshotChain::load(&*db, snapshot.link_id)?;
            let previous = chain
                .previous_of(snapshot.version_number)
                .cloned()
                .ok_or_else(|| {
                    StrataError::NotFound(format!(
                        "v{} of link {}",
                        snapshot.version_number.saturating_sub(1),
                        snapshot.link_id
                    ))
                })?;
            let threshold = db
                .get_schedule_for_link(snapshot.link_id)?
                .and_then(|s| s.significance_threshold)
                .unwrap_or(self.detector.config().significance_threshold);
            let artifact = db.artifact_for_snapshot(previous.id)?;
            (previous, artifact, threshold)
        };

        let analysis = match content {
            Ok(new_content) => {
                let baseline = self.baseline(previous_artifact).await;
                self.detector.detect(baseline, new_content, threshold).await
            }
            Err(e) => {
                warn!("New content of snapshot {} unreadable: {}", snapshot.id, e);
                ChangeDetector::computation_failed(&e, threshold)
            }
        };

        let mut db = storage::lock(&self.storage)?;
        let change_id = db.insert_change_record(previous.id, snapshot.id, &analysis)?;
        db.update_snapshot_change(
            snapshot.id,
            analysis.change_type(),
            analysis.change_score(),
            analysis.is_significant(),
        )?;
        info!(
            "Snapshot v{} of link {}: {} (score {}, significant: {})",
            snapshot.version_number,
            snapshot.link_id,
            analysis.change_type(),
            analysis
                .change_score()
                .map(|s| format!("{:.3}", s))
                .unwrap_or_else(|| "n/a".to_string()),
            analysis.is_significant()
        );

        db.change_for_new_snapshot(snapshot.id)?
            .ok_or_else(|| StrataError::NotFound(format!("change record {}", change_id)))
    }

    /// Verifies the previous artifact before trusting it as a baseline
    async fn baseline(&self, artifact: Option<ArtifactRecord>) -> Baseline {
        let Some(artifact) = artifact else {
            return Baseline::Missing("previous snapshot has no artifact".to_string());
        };
        let metadata = metadata_of(&artifact);
        match self.store.verify(&metadata).await {
            Ok(true) => Baseline::Artifact(PathBuf::from(&artifact.storage_path)),
            Ok(false) => Baseline::Missing(format!(
                "integrity check failed for {}",
                artifact.filename
            )),
            Err(e) => Baseline::Missing(format!("{}: {}", artifact.filename, e)),
        }
    }
}

fn metadata_of(artifact: &ArtifactRecord) -> StorageMetadata {
    StorageMetadata {
        filename: artifact.filename.clone(),
        location: artifact.storage_path.clone(),
        backend: artifact.storage_backend.clone(),
        file_size: artifact.file_size,
        file_hash: artifact.file_hash.clone(),
    }
}

async fn load_content(path: PathBuf) -> Result<SiteContent, String> {
    let display = path.display().to_string();
    match tokio::task::spawn_blocking(move || SiteContent::load(Path::new(&path))).await {
        Ok(Ok(content)) => Ok(content),
        Ok(Err(e)) => Err(format!("{}: {}", display, e)),
        Err(e) => Err(format!("{}: extraction task failed: {}", display, e)),
    }
}
