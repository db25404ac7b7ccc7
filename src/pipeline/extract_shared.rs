//! Shared helper for the `extract_*` trio (and the table/contradiction
//! expansions): link an extracted span back to the bboxes it came from.

use crate::models::BoundingBox;

/// Filter `boxes` (already scoped to one chunk) to the subset whose text is
/// contained in, or contains, `span` — the "regex/token overlap" filter
/// named in §4.4 for entity/citation/event bbox backlinks.
pub fn bboxes_for_span<'a>(span: &str, boxes: &'a [BoundingBox]) -> Vec<&'a BoundingBox> {
    let needle = span.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }
    boxes
        .iter()
        .filter(|b| {
            let haystack = b.text.trim().to_lowercase();
            !haystack.is_empty() && (haystack.contains(&needle) || needle.contains(&haystack))
        })
        .collect()
}

/// Act-name deduplication threshold named per the Open Question resolution
/// in SPEC_FULL §9.
pub const ACT_NAME_DEDUP_THRESHOLD: f64 = 0.85;

/// Canonicalize two act-name candidates as the same entity if their
/// normalized-Levenshtein similarity meets [`ACT_NAME_DEDUP_THRESHOLD`].
pub fn same_act_name(a: &str, b: &str) -> bool {
    let norm = |s: &str| s.trim().to_lowercase();
    strsim::normalized_levenshtein(&norm(a), &norm(b)) >= ACT_NAME_DEDUP_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(text: &str) -> BoundingBox {
        BoundingBox::new("doc".into(), 1, 0.0, 0.0, 0.1, 0.1, text.into(), 0.9)
    }

    #[test]
    fn finds_bboxes_containing_span() {
        let boxes = vec![bbox("John Smith filed a motion"), bbox("unrelated text")];
        let matches = bboxes_for_span("John Smith", &boxes);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn act_names_with_minor_variation_are_treated_as_same() {
        assert!(same_act_name("Companies Act 2013", "Companies Act, 2013"));
    }

    #[test]
    fn unrelated_act_names_are_not_same() {
        assert!(!same_act_name("Companies Act 2013", "Income Tax Act 1961"));
    }
}
