//! Values handling with deep merge support

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_json::map::Entry;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

/// Values container with deep merge capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Values {
    /// Create empty values
    pub fn new() -> Self {
        Self(JsonValue::Object(serde_json::Map::new()))
    }

    /// Parse values from YAML string
    ///
    /// An empty document yields empty values. Anything other than a
    /// mapping at the top level is rejected.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: JsonValue = serde_yaml::from_str(yaml)?;
        Self::from_json_value(value)
    }

    /// Wrap a JSON value, treating `null` as empty
    pub fn from_json_value(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Null => Ok(Self::new()),
            JsonValue::Object(_) => Ok(Self(value)),
            other => Err(CoreError::ValuesMerge {
                message: format!("values must be a mapping, got {}", type_name(&other)),
            }),
        }
    }

    /// Deep merge another Values into this one
    ///
    /// Rules:
    /// - Scalars: overlay replaces base
    /// - Objects: recursive merge
    /// - Arrays: overlay replaces base (not appended)
    pub fn merge(&mut self, overlay: Values) {
        deep_merge(&mut self.0, overlay.0);
    }

    /// Merge multiple values in order
    pub fn merge_all(values: Vec<Values>) -> Self {
        let mut result = Values::new();
        for v in values {
            result.merge(v);
        }
        result
    }

    /// Get a value by dotted path
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        let parts: Vec<&str> = path.split('.').collect();
        get_nested(&self.0, &parts)
    }

    /// Get the inner JSON value
    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    /// Check if values are empty
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }

    /// Serialize to YAML; keys come out sorted so equal values render equally
    pub fn to_yaml(&self) -> Result<String> {
        if self.is_empty() {
            return Ok(String::new());
        }
        Ok(serde_yaml::to_string(&self.0)?)
    }

    /// SHA-256 hex digest of the YAML rendering
    pub fn checksum(&self) -> Result<String> {
        let yaml = self.to_yaml()?;
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Merge `overlay` into `base`, moving overlay nodes into place
fn deep_merge(base: &mut JsonValue, overlay: JsonValue) {
    let JsonValue::Object(overlay_map) = overlay else {
        *base = overlay;
        return;
    };

    match base {
        JsonValue::Object(base_map) => {
            for (key, value) in overlay_map {
                match base_map.entry(key) {
                    Entry::Occupied(mut slot) => deep_merge(slot.get_mut(), value),
                    Entry::Vacant(slot) => {
                        slot.insert(value);
                    }
                }
            }
        }
        other => *other = JsonValue::Object(overlay_map),
    }
}

fn get_nested<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let Some((key, remaining)) = path.split_first() else {
        return Some(value);
    };

    match value {
        JsonValue::Object(map) => map.get(*key).and_then(|v| get_nested(v, remaining)),
        _ => None,
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "sequence",
        JsonValue::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge() {
        let mut base = Values(json!({
            "image": {"repository": "nginx", "tag": "1.0"},
            "replicas": 1,
            "ports": [80]
        }));
        let overlay = Values(json!({
            "image": {"tag": "2.0"},
            "ports": [443, 8443]
        }));

        base.merge(overlay);

        assert_eq!(base.get("image.repository"), Some(&json!("nginx")));
        assert_eq!(base.get("image.tag"), Some(&json!("2.0")));
        assert_eq!(base.get("replicas"), Some(&json!(1)));
        assert_eq!(base.get("ports"), Some(&json!([443, 8443])));
    }

    #[test]
    fn test_scalar_replaces_mapping() {
        let mut base = Values(json!({"resources": {"limits": {"cpu": "1"}}}));
        base.merge(Values(json!({"resources": null})));
        assert_eq!(base.get("resources"), Some(&JsonValue::Null));
    }

    #[test]
    fn test_mapping_replaces_scalar() {
        let mut base = Values(json!({"ingress": false, "name": "app"}));
        base.merge(Values(json!({"ingress": {"enabled": true, "hosts": ["a.example"]}})));
        assert_eq!(base.get("ingress.enabled"), Some(&json!(true)));
        assert_eq!(base.get("ingress.hosts"), Some(&json!(["a.example"])));
        assert_eq!(base.get("name"), Some(&json!("app")));
    }

    #[test]
    fn test_merge_all_order() {
        let merged = Values::merge_all(vec![
            Values(json!({"a": 1, "b": 1})),
            Values(json!({"b": 2})),
            Values(json!({"b": 3, "c": 3})),
        ]);
        assert_eq!(merged.inner(), &json!({"a": 1, "b": 3, "c": 3}));
    }

    #[test]
    fn test_from_yaml_empty_document() {
        let values = Values::from_yaml("").unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn test_from_yaml_rejects_sequence() {
        let err = Values::from_yaml("- a\n- b\n").unwrap_err();
        assert!(err.to_string().contains("sequence"));
    }

    #[test]
    fn test_checksum_ignores_key_order() {
        let a = Values::from_yaml("b: 2\na: 1\n").unwrap();
        let b = Values::from_yaml("a: 1\nb: 2\n").unwrap();
        assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());

        let c = Values::from_yaml("a: 1\nb: 3\n").unwrap();
        assert_ne!(a.checksum().unwrap(), c.checksum().unwrap());
    }

    #[test]
    fn test_checksum_of_empty_values() {
        // sha256 of the empty string
        assert_eq!(
            Values::new().checksum().unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
