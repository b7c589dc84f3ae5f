use crate::storage::ChangeRecord;

fn percent(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}%", v * 100.0))
        .unwrap_or_else(|| "n/a".to_string())
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

/// Renders a change record as a plain-text report
pub fn format_change_report(record: &ChangeRecord) -> String {
    let analysis = &record.analysis;
    let m = analysis.metrics();
    let rule = "=".repeat(60);

    let mut lines = vec![
        rule.clone(),
        format!(
            "SNAPSHOT CHANGE REPORT ({} -> {})",
            record.old_snapshot_id, record.new_snapshot_id
        ),
        rule.clone(),
        format!("Change Score: {}", percent(m.change_score)),
        format!("Similarity: {}", percent(m.similarity_score)),
        format!("Change Type: {}", m.change_type),
        format!(
            "Significant: {} (threshold {:.2})",
            yes_no(analysis.is_significant()),
            analysis.threshold()
        ),
        format!("Requires Reanalysis: {}", yes_no(record.requires_reanalysis)),
    ];
    if let Some(warning) = &m.warning {
        lines.push(format!("Warning: {}", warning));
    }

    lines.push(String::new());
    lines.push("CONTENT CHANGES:".to_string());
    lines.push(format!("  Text Added: {} bytes", m.text_added_bytes));
    lines.push(format!("  Text Removed: {} bytes", m.text_removed_bytes));
    lines.push(format!(
        "  Text Changed: {:.1}%",
        m.text_changed_percentage * 100.0
    ));

    lines.push(String::new());
    lines.push("STRUCTURE CHANGES:".to_string());
    lines.push(format!(
        "  Structure Diff: {:.2}%",
        m.structure_diff_score * 100.0
    ));
    lines.push(format!("  New Sections: {}", m.sections_added));
    lines.push(format!("  Removed Sections: {}", m.sections_removed));

    lines.push(String::new());
    lines.push("RESOURCE CHANGES:".to_string());
    lines.push(format!("  Added: {}", m.resources_added));
    lines.push(format!("  Removed: {}", m.resources_removed));
    lines.push(format!("  Changed: {}", m.resources_changed));

    lines.push(String::new());
    lines.push("PAGE CHANGES:".to_string());
    lines.push(format!("  Added: {}", m.details.pages_added.len()));
    lines.push(format!("  Removed: {}", m.details.pages_removed.len()));
    lines.push(format!("  Modified: {}", m.details.pages_changed.len()));
    lines.push(rule);

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ChangeDetector;
    use chrono::Utc;

    #[test]
    fn test_report_for_fallback_record() {
        let record = ChangeRecord {
            id: 1,
            old_snapshot_id: 4,
            new_snapshot_id: 5,
            analysis: ChangeDetector::computation_failed("worker panicked", 0.3),
            requires_reanalysis: true,
            computed_at: Utc::now(),
        };
        let report = format_change_report(&record);
        assert!(report.contains("(4 -> 5)"));
        assert!(report.contains("Change Score: n/a"));
        assert!(report.contains("Significant: Yes"));
        assert!(report.contains("Warning: change computation failed: worker panicked"));
    }
}
