//! JSON merge patch (RFC 7386).

use serde_json::Value;

/// Apply `patch` to `target` in place.
pub fn json_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                json_merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_patch_semantics() {
        let mut doc = json!({
            "metadata": {"annotations": {"a": "1", "b": "2"}},
            "spec": {"list": [1, 2]}
        });
        json_merge_patch(
            &mut doc,
            &json!({
                "metadata": {"annotations": {"a": null, "c": "3"}},
                "spec": {"list": [3]}
            }),
        );
        assert_eq!(
            doc,
            json!({
                "metadata": {"annotations": {"b": "2", "c": "3"}},
                "spec": {"list": [3]}
            })
        );
    }

    #[test]
    fn test_merge_patch_into_scalar() {
        let mut doc = json!("text");
        json_merge_patch(&mut doc, &json!({"a": {"b": null, "c": 1}}));
        assert_eq!(doc, json!({"a": {"c": 1}}));
    }
}
