use serde_json::Value;

/// Applies a group's `param_overrides` document onto an outbound request
/// body. Overlapping keys are replaced; nested objects merge recursively;
/// a `null` in the override deletes the corresponding key from the base.
///
/// Idempotent: applying the same overrides twice in a row yields the same
/// result as applying them once.
pub fn apply_param_overrides(base: &mut Value, overrides: &Value) {
    let Value::Object(overrides) = overrides else {
        return;
    };
    let Value::Object(base_map) = base else {
        return;
    };
    for (key, value) in overrides {
        match value {
            Value::Null => {
                base_map.remove(key);
            }
            Value::Object(_) => {
                let entry = base_map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Default::default()));
                if !entry.is_object() {
                    *entry = Value::Object(Default::default());
                }
                apply_param_overrides(entry, value);
            }
            other => {
                base_map.insert(key.clone(), other.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_override_replaces_value() {
        let mut base = json!({"temperature": 0.7, "model": "gpt-4"});
        apply_param_overrides(&mut base, &json!({"temperature": 0.2}));
        assert_eq!(base, json!({"temperature": 0.2, "model": "gpt-4"}));
    }

    #[test]
    fn null_deletes_key() {
        let mut base = json!({"temperature": 0.7, "top_p": 0.9});
        apply_param_overrides(&mut base, &json!({"top_p": null}));
        assert_eq!(base, json!({"temperature": 0.7}));
    }

    #[test]
    fn nested_objects_merge_recursively() {
        let mut base = json!({"metadata": {"a": 1, "b": 2}});
        apply_param_overrides(&mut base, &json!({"metadata": {"b": 3, "c": 4}}));
        assert_eq!(base, json!({"metadata": {"a": 1, "b": 3, "c": 4}}));
    }

    #[test]
    fn new_keys_are_added() {
        let mut base = json!({"model": "gpt-4"});
        apply_param_overrides(&mut base, &json!({"max_tokens": 256}));
        assert_eq!(base, json!({"model": "gpt-4", "max_tokens": 256}));
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let overrides = json!({"temperature": 0.2, "metadata": {"b": 3}, "top_p": null});
        let mut base = json!({"temperature": 0.7, "top_p": 0.9, "metadata": {"a": 1, "b": 2}});
        apply_param_overrides(&mut base, &overrides);
        let once = base.clone();
        apply_param_overrides(&mut base, &overrides);
        assert_eq!(base, once);
    }
}
