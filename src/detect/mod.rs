//! Change detection between consecutive snapshots
//!
//! The detector combines three component similarities (visible text, page
//! sections, and resources) into one similarity score, derives the change
//! score from it, and classifies the dominant kind of change. Rules are
//! tested in this order and the first match wins:
//!
//! 1. `NoChange` below the noise floor
//! 2. `MajorRedesign` when both structure and text changed heavily
//! 3. `StructureChanged` when structure moved but text barely did
//! 4. `ResourcesChanged` when only resources churned
//! 5. `ContentAdded` / `ContentRemoved` when one direction dominates
//! 6. `ContentModified` otherwise

mod detector;
mod metrics;
mod report;
mod similarity;

pub use detector::{Baseline, ChangeDetector};
pub use metrics::{is_significant, ChangeAnalysis, ChangeDetails, ChangeMetrics};
pub use report::format_change_report;
pub use similarity::{line_deltas, resource_diff, section_diff, text_similarity};
