//! Component similarity measures used by the change detector

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

const SHINGLE_SIZE: usize = 3;

/// Jaccard similarity over word 3-shingles of lowercased text
///
/// When either text has fewer than three tokens both sides fall back to
/// single tokens. Two empty texts are identical.
pub fn text_similarity(old: &str, new: &str) -> f64 {
    let old_tokens: Vec<String> = old.split_whitespace().map(str::to_lowercase).collect();
    let new_tokens: Vec<String> = new.split_whitespace().map(str::to_lowercase).collect();

    if old_tokens.is_empty() && new_tokens.is_empty() {
        return 1.0;
    }

    let size = if old_tokens.len() < SHINGLE_SIZE || new_tokens.len() < SHINGLE_SIZE {
        1
    } else {
        SHINGLE_SIZE
    };

    jaccard(&shingles(&old_tokens, size), &shingles(&new_tokens, size))
}

fn shingles(tokens: &[String], size: usize) -> HashSet<String> {
    tokens.windows(size).map(|w| w.join(" ")).collect()
}

fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Bytes of text added and removed, from a multiset diff of lines
pub fn line_deltas(old: &str, new: &str) -> (u64, u64) {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for line in old.lines() {
        *counts.entry(line).or_insert(0) -= 1;
    }
    for line in new.lines() {
        *counts.entry(line).or_insert(0) += 1;
    }

    let mut added = 0u64;
    let mut removed = 0u64;
    for (line, count) in counts {
        let bytes = line.len() as u64 * count.unsigned_abs();
        if count > 0 {
            added += bytes;
        } else {
            removed += bytes;
        }
    }
    (added, removed)
}

/// Section keys that appeared and disappeared between two snapshots
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SectionDiff {
    pub appeared: Vec<String>,
    pub disappeared: Vec<String>,
    pub diff_score: f64,
}

/// Compares identified sections, falling back to layout signatures
///
/// With sections on either side, the score is
/// `(appeared + disappeared) / max(|old|, |new|)`, capped at 1. With no
/// sections on either side it is one minus the normalized Levenshtein
/// similarity of the layout signatures.
pub fn section_diff(
    old: &BTreeSet<String>,
    new: &BTreeSet<String>,
    old_layout: &str,
    new_layout: &str,
) -> SectionDiff {
    if old.is_empty() && new.is_empty() {
        return SectionDiff {
            diff_score: 1.0 - strsim::normalized_levenshtein(old_layout, new_layout),
            ..SectionDiff::default()
        };
    }

    let appeared: Vec<String> = new.difference(old).cloned().collect();
    let disappeared: Vec<String> = old.difference(new).cloned().collect();
    let largest = old.len().max(new.len()) as f64;
    let diff_score = ((appeared.len() + disappeared.len()) as f64 / largest).min(1.0);

    SectionDiff {
        appeared,
        disappeared,
        diff_score,
    }
}

/// Resource URLs added, removed, and changed between two snapshots
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    /// Unchanged resources over the union of URLs
    pub similarity: f64,
}

pub fn resource_diff(
    old: &BTreeMap<String, Option<String>>,
    new: &BTreeMap<String, Option<String>>,
) -> ResourceDiff {
    let mut diff = ResourceDiff::default();
    let mut unchanged = 0usize;

    for (url, new_digest) in new {
        match old.get(url) {
            None => diff.added.push(url.clone()),
            Some(old_digest) if old_digest != new_digest => diff.changed.push(url.clone()),
            Some(_) => unchanged += 1,
        }
    }
    diff.removed = old
        .keys()
        .filter(|url| !new.contains_key(*url))
        .cloned()
        .collect();

    let union = new.len() + diff.removed.len();
    diff.similarity = if union == 0 {
        1.0
    } else {
        unchanged as f64 / union as f64
    };
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_similarity_bounds() {
        assert_eq!(text_similarity("", ""), 1.0);
        assert_eq!(text_similarity("one two three four", "ONE two  three\nfour"), 1.0);
        assert_eq!(text_similarity("alpha beta gamma", ""), 0.0);
        assert_eq!(text_similarity("a b c", "x y z"), 0.0);
    }

    #[test]
    fn test_text_similarity_partial() {
        // shingles: "a b c", "b c d" vs "a b c", "b c e"
        let sim = text_similarity("a b c d", "a b c e");
        assert!((sim - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_text_uses_single_tokens() {
        let sim = text_similarity("hello world", "hello there");
        assert!((sim - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_line_deltas_multiset() {
        let (added, removed) = line_deltas("keep\ngone\nkeep", "keep\nnew line\nkeep\nkeep");
        assert_eq!(added, "new line".len() as u64 + "keep".len() as u64);
        assert_eq!(removed, "gone".len() as u64);
        assert_eq!(line_deltas("same\ntext", "text\nsame"), (0, 0));
    }

    #[test]
    fn test_section_diff_counts() {
        let old: BTreeSet<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let new: BTreeSet<String> = ["a", "b", "c", "e"].iter().map(|s| s.to_string()).collect();
        let diff = section_diff(&old, &new, "", "");
        assert_eq!(diff.appeared, vec!["e".to_string()]);
        assert_eq!(diff.disappeared, vec!["d".to_string()]);
        assert!((diff.diff_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_section_diff_layout_fallback() {
        let none = BTreeSet::new();
        let same = section_diff(&none, &none, "header:1|nav:1", "header:1|nav:1");
        assert_eq!(same.diff_score, 0.0);
        let changed = section_diff(&none, &none, "header:1|nav:1", "header:0|nav:2");
        assert!(changed.diff_score > 0.0 && changed.diff_score < 1.0);
    }

    #[test]
    fn test_resource_diff() {
        let old: BTreeMap<String, Option<String>> = [
            ("/a.js", Some("1")),
            ("/b.css", Some("2")),
            ("/gone.png", None),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
        .collect();
        let new: BTreeMap<String, Option<String>> = [
            ("/a.js", Some("1")),
            ("/b.css", Some("3")),
            ("/new.png", None),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
        .collect();

        let diff = resource_diff(&old, &new);
        assert_eq!(diff.added, vec!["/new.png".to_string()]);
        assert_eq!(diff.removed, vec!["/gone.png".to_string()]);
        assert_eq!(diff.changed, vec!["/b.css".to_string()]);
        assert!((diff.similarity - 0.25).abs() < 1e-9);

        let empty = BTreeMap::new();
        assert_eq!(resource_diff(&empty, &empty).similarity, 1.0);
    }
}
