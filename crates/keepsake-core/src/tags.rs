//! Tag normalization and legacy repair
//!
//! Tags are stored denormalized as a comma-delimited string and re-parsed on
//! read. Older databases accumulated JSON serialization artefacts in that
//! column (`["ai"`, `"[tag]"`, `[\"a\",\"b\"]`); the repair path here
//! recognizes those forms and normalizes them into clean tag lists.

/// Maximum accepted length for a single tag
pub const MAX_TAG_LENGTH: usize = 100;

/// Whether a stored tag still carries JSON artefacts
pub fn is_malformed_tag(tag: &str) -> bool {
    tag.contains('"') || tag.contains('[') || tag.contains(']') || tag.contains('\\')
}

/// Repair a single possibly-malformed tag into zero or more clean tags.
///
/// Handles full JSON arrays (recursively), escaped-quote fragments, and
/// stray bracket/quote characters. Clean tags pass through untouched.
pub fn repair_malformed_tag(tag: &str) -> Vec<String> {
    let tag = tag.trim();
    if tag.is_empty() {
        return vec![];
    }
    if !is_malformed_tag(tag) {
        return vec![tag.to_string()];
    }

    // Full JSON array form: parse and recursively clean each element
    if tag.starts_with('[') && tag.ends_with(']') {
        if let Ok(serde_json::Value::Array(items)) = serde_json::from_str::<serde_json::Value>(tag)
        {
            let mut out = Vec::new();
            for item in items {
                let text = match item {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                out.extend(repair_malformed_tag(&text));
            }
            return out;
        }
    }

    // Fragment forms: strip every artefact character and keep what remains
    let cleaned: String = tag
        .chars()
        .filter(|c| !matches!(c, '"' | '[' | ']' | '\\'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        vec![]
    } else {
        vec![cleaned.to_string()]
    }
}

/// Normalize a tag list: repair artefacts, trim, drop empty and
/// control-character-only entries, dedupe preserving order.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for raw in tags {
        for repaired in repair_malformed_tag(raw.as_ref()) {
            let trimmed: String = repaired
                .trim()
                .chars()
                .filter(|c| !c.is_control())
                .collect();
            if trimmed.is_empty() {
                continue;
            }
            if seen.insert(trimmed.clone()) {
                out.push(trimmed);
            }
        }
    }
    out
}

/// Validate a normalized tag list before any I/O.
///
/// Returns a precise message for the first offending tag.
pub fn validate_tags(tags: &[String]) -> Result<(), String> {
    for tag in tags {
        if tag.len() > MAX_TAG_LENGTH {
            return Err(format!(
                "Tag exceeds maximum length of {MAX_TAG_LENGTH} characters: '{}...'",
                &tag[..tag.char_indices().nth(40).map(|(i, _)| i).unwrap_or(tag.len())]
            ));
        }
        if tag.chars().any(|c| c.is_control()) {
            return Err(format!("Tag contains control characters: {tag:?}"));
        }
        if tag.contains(',') {
            return Err(format!(
                "Tag may not contain commas (reserved as the storage delimiter): {tag:?}"
            ));
        }
    }
    Ok(())
}

/// Serialize tags into the comma-delimited storage form
pub fn serialize_tags(tags: &[String]) -> String {
    tags.join(",")
}

/// Parse the stored comma-delimited form back into a clean tag list,
/// repairing any legacy artefacts encountered along the way.
pub fn parse_tags_field(stored: &str) -> Vec<String> {
    if stored.trim().is_empty() {
        return vec![];
    }
    // Whole-field legacy JSON array takes priority over comma splitting so
    // that `["a","b"]` does not shred into bracket fragments.
    if stored.trim_start().starts_with('[') {
        let repaired = repair_malformed_tag(stored);
        if !repaired.is_empty() {
            return normalize_tags(repaired);
        }
    }
    normalize_tags(stored.split(','))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_tags_pass_through() {
        assert_eq!(repair_malformed_tag("work"), vec!["work".to_string()]);
        assert_eq!(normalize_tags(["a", "b"]), vec!["a", "b"]);
    }

    #[test]
    fn test_legacy_fragment_forms() {
        assert_eq!(repair_malformed_tag("[\"ai\""), vec!["ai".to_string()]);
        assert_eq!(repair_malformed_tag("\"[tag]\""), vec!["tag".to_string()]);
        assert_eq!(repair_malformed_tag("\"bug-fix\""), vec!["bug-fix".to_string()]);
    }

    #[test]
    fn test_legacy_json_array() {
        assert_eq!(
            repair_malformed_tag(r#"["a","b"]"#),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(
            parse_tags_field(r#"["important"]"#),
            vec!["important".to_string()]
        );
    }

    #[test]
    fn test_empty_and_control_dropped() {
        assert_eq!(normalize_tags(["", "  ", "\u{0007}"]), Vec::<String>::new());
        assert_eq!(normalize_tags(["ok", "\t \n"]), vec!["ok"]);
    }

    #[test]
    fn test_dedupe_preserves_order() {
        assert_eq!(normalize_tags(["b", "a", "b"]), vec!["b", "a"]);
    }

    #[test]
    fn test_oversize_tag_rejected() {
        let long = "x".repeat(MAX_TAG_LENGTH + 1);
        let err = validate_tags(&[long]).unwrap_err();
        assert!(err.contains("maximum length"));
        let ok = "x".repeat(MAX_TAG_LENGTH);
        assert!(validate_tags(&[ok]).is_ok());
    }

    #[test]
    fn test_comma_rejected() {
        assert!(validate_tags(&["a,b".to_string()]).is_err());
    }

    #[test]
    fn test_round_trip_storage_form() {
        let tags = vec!["work".to_string(), "meeting".to_string()];
        let stored = serialize_tags(&tags);
        assert_eq!(stored, "work,meeting");
        assert_eq!(parse_tags_field(&stored), tags);
    }

    #[test]
    fn test_parse_repairs_stored_artefacts() {
        assert_eq!(parse_tags_field(r#"["ai","ml"]"#), vec!["ai", "ml"]);
        assert_eq!(parse_tags_field("\"quoted\",plain"), vec!["quoted", "plain"]);
    }
}
