// Utility functions and helpers

use std::collections::BTreeSet;

/// Deep-merge `overlay` into `base`. Objects merge key by key; any other
/// overlay value replaces the base value.
pub fn merge_json_objects(
    base: serde_json::Value,
    overlay: serde_json::Value,
) -> serde_json::Value {
    match (base, overlay) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => merge_json_objects(base_value, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            serde_json::Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Merge several result lists into one sorted, duplicate-free list.
///
/// The output depends only on the set of values, never on the order in
/// which the inputs arrived.
pub fn merge_unique<I, L, S>(lists: I) -> Vec<String>
where
    I: IntoIterator<Item = L>,
    L: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lists
        .into_iter()
        .flatten()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Non-empty, trimmed lines of tool output.
pub fn output_lines(output: &str) -> impl Iterator<Item = &str> {
    output.lines().map(str::trim).filter(|l| !l.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_overrides_nested_keys_only() {
        let base = json!({
            "rate_limit": {"calls_per_second": 150.0, "burst_size": 10},
            "execution": {"threads": 10}
        });
        let overlay = json!({"rate_limit": {"burst_size": 5}});

        let merged = merge_json_objects(base, overlay);
        assert_eq!(merged["rate_limit"]["burst_size"], 5);
        assert_eq!(merged["rate_limit"]["calls_per_second"], 150.0);
        assert_eq!(merged["execution"]["threads"], 10);
    }

    #[test]
    fn test_merge_replaces_non_objects() {
        let merged = merge_json_objects(json!({"a": [1, 2]}), json!({"a": [3], "b": true}));
        assert_eq!(merged, json!({"a": [3], "b": true}));
    }

    #[test]
    fn test_merge_unique_is_order_independent() {
        let first = vec!["x.com", "y.com", "x.com"];
        let second = vec!["y.com", "z.com"];

        let a = merge_unique([first.clone(), second.clone()]);
        let b = merge_unique([second, first]);
        assert_eq!(a, vec!["x.com", "y.com", "z.com"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_merge_unique_drops_blank_entries() {
        let merged = merge_unique([vec![" a.example.com ", "", "   "]]);
        assert_eq!(merged, vec!["a.example.com"]);
    }

    #[test]
    fn test_output_lines() {
        let lines: Vec<&str> = output_lines("one\n\n  two  \n").collect();
        assert_eq!(lines, vec!["one", "two"]);
    }
}
