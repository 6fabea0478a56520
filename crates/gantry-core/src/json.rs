//! JSON value helpers shared by the coordinator and built-in nodes

use serde_json::Value;

/// Deep merge `patch` into `base`
///
/// Objects merge key-wise recursively; anything else is replaced, so the
/// last writer wins on scalar and array conflicts.
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                deep_merge(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base_slot, patch) => *base_slot = patch.clone(),
    }
}

/// Look up a dot-separated path (`user.address.city`) in a JSON value
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge_recurses_objects() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        deep_merge(&mut base, &json!({"b": 2, "nested": {"y": 3}}));
        assert_eq!(base, json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 3}}));
    }

    #[test]
    fn test_deep_merge_replaces_arrays() {
        let mut base = json!({"items": [1, 2, 3]});
        deep_merge(&mut base, &json!({"items": [4]}));
        assert_eq!(base, json!({"items": [4]}));
    }

    #[test]
    fn test_lookup_path() {
        let value = json!({"user": {"address": {"city": "Utrecht"}}, "tags": ["a", "b"]});

        assert_eq!(lookup_path(&value, "user.address.city"), Some(&json!("Utrecht")));
        assert_eq!(lookup_path(&value, "tags.1"), Some(&json!("b")));
        assert_eq!(lookup_path(&value, "user.missing"), None);
        assert_eq!(lookup_path(&value, "tags.9"), None);
    }
}
