use crate::core::report::MetadataMatch;
use std::collections::BTreeMap;

/// Tracked metadata keys and their labels, in report order. Entries with a
/// blank key are reserved and never reported.
pub const TRACKED_KEYS: &[(&str, &str)] = &[
    ("Author", "Author"),
    ("CreationDate", "Creation date"),
    ("", "Version"),
    ("Creator", "Creator application"),
    ("", "Title"),
    ("ModDate", "Modification date"),
    ("", "Subject"),
    ("", "Company"),
    ("", "Keywords"),
    ("", "Last modified by"),
];

/// Compare the tracked keys of two metadata maps.
pub fn compare_metadata(
    a: &BTreeMap<String, String>,
    b: &BTreeMap<String, String>,
) -> Vec<MetadataMatch> {
    TRACKED_KEYS
        .iter()
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, label)| {
            let value_a = a.get(*key).cloned();
            let value_b = b.get(*key).cloned();
            MetadataMatch {
                label: (*label).to_string(),
                same: value_a == value_b,
                a: value_a,
                b: value_b,
            }
        })
        .collect()
}
