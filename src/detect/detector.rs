use crate::archive::SiteContent;
use crate::config::DetectionConfig;
use crate::detect::metrics::{ChangeAnalysis, ChangeDetails, ChangeMetrics};
use crate::detect::similarity::{line_deltas, resource_diff, section_diff, text_similarity};
use crate::state::ChangeType;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;

/// Content of the previous snapshot, or why it is unusable
#[derive(Debug)]
pub enum Baseline {
    /// Verified artifact of the previous snapshot
    Artifact(PathBuf),
    /// Already extracted previous content
    Content(SiteContent),
    /// The previous artifact is missing, corrupted, or failed verification
    Missing(String),
}

/// Compares consecutive snapshots of a site
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    config: DetectionConfig,
}

impl ChangeDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Compares two snapshots' content
    ///
    /// Deterministic for the same inputs. Identical content short-circuits
    /// to a similarity of exactly 1.0.
    ///
    /// # Arguments
    ///
    /// * `old` - Content of the previous snapshot
    /// * `new` - Content of the snapshot being built
    /// * `threshold` - Significance threshold for this site
    pub fn compare(&self, old: &SiteContent, new: &SiteContent, threshold: f64) -> ChangeAnalysis {
        let started = Instant::now();

        if old.is_identical_to(new) {
            let metrics = ChangeMetrics {
                details: ChangeDetails {
                    text_similarity: 1.0,
                    structure_similarity: 1.0,
                    resource_similarity: 1.0,
                    ..ChangeDetails::default()
                },
                computation_time_secs: started.elapsed().as_secs_f64(),
                ..ChangeMetrics::default()
            };
            return ChangeAnalysis::new(metrics, threshold);
        }

        let old_text = old.text();
        let new_text = new.text();
        let text_sim = text_similarity(&old_text, &new_text);

        let sections = section_diff(
            &old.sections(),
            &new.sections(),
            &old.layout_signature(),
            &new.layout_signature(),
        );
        let structure_sim = 1.0 - sections.diff_score;

        let resources = resource_diff(&old.resources, &new.resources);

        let similarity = self.weighted_similarity(text_sim, structure_sim, resources.similarity);
        let change_score = (1.0 - similarity).clamp(0.0, 1.0);

        let (added_bytes, removed_bytes) = line_deltas(&old_text, &new_text);
        let text_changed_percentage =
            (added_bytes + removed_bytes) as f64 / (old_text.len() as f64).max(1.0);

        let old_pages: BTreeSet<&String> = old.pages.keys().collect();
        let new_pages: BTreeSet<&String> = new.pages.keys().collect();

        let details = ChangeDetails {
            pages_added: new_pages.difference(&old_pages).map(|u| u.to_string()).collect(),
            pages_removed: old_pages.difference(&new_pages).map(|u| u.to_string()).collect(),
            pages_changed: old
                .pages
                .iter()
                .filter(|(url, page)| new.pages.get(*url).map_or(false, |n| n != *page))
                .map(|(url, _)| url.clone())
                .collect(),
            sections_added: sections.appeared.clone(),
            sections_removed: sections.disappeared.clone(),
            resources_added: resources.added.clone(),
            resources_removed: resources.removed.clone(),
            resources_changed: resources.changed.clone(),
            text_similarity: text_sim,
            structure_similarity: structure_sim,
            resource_similarity: resources.similarity,
        };

        let mut metrics = ChangeMetrics {
            change_type: ChangeType::NoChange,
            change_score: Some(change_score),
            similarity_score: Some(similarity),
            text_added_bytes: added_bytes,
            text_removed_bytes: removed_bytes,
            text_changed_percentage,
            structure_diff_score: sections.diff_score,
            sections_added: sections.appeared.len() as u32,
            sections_removed: sections.disappeared.len() as u32,
            resources_added: resources.added.len() as u32,
            resources_removed: resources.removed.len() as u32,
            resources_changed: resources.changed.len() as u32,
            details,
            warning: None,
            computation_time_secs: 0.0,
        };
        let removed_share = removed_bytes as f64 / (old_text.len() as f64).max(1.0);
        metrics.change_type = self.classify(&metrics, change_score, removed_share);
        metrics.computation_time_secs = started.elapsed().as_secs_f64();

        ChangeAnalysis::new(metrics, threshold)
    }

    fn weighted_similarity(&self, text: f64, structure: f64, resources: f64) -> f64 {
        let c = &self.config;
        let total = c.text_weight + c.structure_weight + c.resource_weight;
        if total <= 0.0 {
            return (text + structure + resources) / 3.0;
        }
        (c.text_weight * text + c.structure_weight * structure + c.resource_weight * resources)
            / total
    }

    /// Picks the change type; the first matching rule wins
    ///
    /// A redesign must also lose something from the old snapshot: a section
    /// disappeared, or the removed text exceeds the low-change share of the
    /// old text. Pure growth is never a redesign.
    fn classify(&self, m: &ChangeMetrics, change_score: f64, removed_share: f64) -> ChangeType {
        let c = &self.config;

        if change_score < c.noise_floor {
            return ChangeType::NoChange;
        }

        let structure = m.structure_diff_score;
        let text = m.text_changed_percentage;
        let text_low = text < c.low_text_change_threshold;
        let lost = m.sections_removed > 0 || removed_share > c.low_text_change_threshold;

        if structure > c.redesign_structure_threshold && text > c.redesign_text_threshold && lost {
            return ChangeType::MajorRedesign;
        }

        if structure > c.structure_change_threshold && text_low {
            return ChangeType::StructureChanged;
        }

        let resource_changes = m.resources_added + m.resources_removed + m.resources_changed;
        if resource_changes >= c.resource_change_count
            && text_low
            && structure <= c.structure_change_threshold
        {
            return ChangeType::ResourcesChanged;
        }

        let added = m.text_added_bytes as f64;
        let removed = m.text_removed_bytes as f64;
        if added > 0.0 && added > removed * c.content_ratio {
            return ChangeType::ContentAdded;
        }
        if removed > 0.0 && removed > added * c.content_ratio {
            return ChangeType::ContentRemoved;
        }

        ChangeType::ContentModified
    }

    /// Record for a comparison without a usable baseline: maximal change
    pub fn baseline_missing(reason: &str, threshold: f64) -> ChangeAnalysis {
        ChangeAnalysis::new(
            ChangeMetrics {
                change_type: ChangeType::MajorRedesign,
                change_score: Some(1.0),
                similarity_score: Some(0.0),
                structure_diff_score: 1.0,
                text_changed_percentage: 1.0,
                warning: Some(format!("previous snapshot content unavailable: {}", reason)),
                ..ChangeMetrics::default()
            },
            threshold,
        )
    }

    /// Record for a comparison that could not be computed
    pub fn computation_failed(reason: &str, threshold: f64) -> ChangeAnalysis {
        ChangeAnalysis::new(
            ChangeMetrics {
                change_type: ChangeType::ContentModified,
                change_score: None,
                similarity_score: None,
                warning: Some(format!("change computation failed: {}", reason)),
                ..ChangeMetrics::default()
            },
            threshold,
        )
    }

    /// Runs the comparison on the blocking pool
    ///
    /// Never fails: an unusable baseline yields [`Self::baseline_missing`]
    /// and a panic or join error yields [`Self::computation_failed`], both
    /// logged as warnings.
    pub async fn detect(&self, baseline: Baseline, new: SiteContent, threshold: f64) -> ChangeAnalysis {
        let detector = self.clone();
        let task = tokio::task::spawn_blocking(move || {
            let old = match baseline {
                Baseline::Content(content) => content,
                Baseline::Artifact(path) => match SiteContent::load(&path) {
                    Ok(content) => content,
                    Err(e) => {
                        return ChangeDetector::baseline_missing(&e.to_string(), threshold);
                    }
                },
                Baseline::Missing(reason) => {
                    return ChangeDetector::baseline_missing(&reason, threshold);
                }
            };
            detector.compare(&old, &new, threshold)
        });

        let analysis = match task.await {
            Ok(analysis) => analysis,
            Err(e) => ChangeDetector::computation_failed(&e.to_string(), threshold),
        };

        if let Some(warning) = &analysis.metrics().warning {
            tracing::warn!("Change detection degraded: {}", warning);
        }
        analysis
    }
}
