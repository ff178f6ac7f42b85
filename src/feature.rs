//! Features: identity-bearing records built from table rows

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A raw row as produced by a row source: column name to value, in column order
pub type Row = Map<String, Value>;

/// A row surfaced with its identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Feature id (`{table}.{key values}` or a synthesized `{table}.fid-...`)
    pub id: String,
    /// Attribute values
    pub properties: Map<String, Value>,
    /// Whether any property changed since the feature was read or last written
    #[serde(skip)]
    modified: bool,
}

impl Feature {
    /// Create a new feature with the given properties
    pub fn new(id: impl Into<String>, properties: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            properties,
            modified: false,
        }
    }

    /// Create a feature with no properties
    pub fn empty(id: impl Into<String>) -> Self {
        Self::new(id, Map::new())
    }

    /// Get an attribute value
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Set an attribute value, marking the feature as modified
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.properties.insert(name.into(), value);
        self.modified = true;
    }

    /// Whether the feature has unsaved changes
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn mark_clean(&mut self) {
        self.modified = false;
    }
}

/// Predicate applied to one attribute value of a feature
pub trait FeatureFilter: Send + Sync {
    fn accepts(&self, value: &Value) -> bool;
}

impl<F> FeatureFilter for F
where
    F: Fn(&Value) -> bool + Send + Sync,
{
    fn accepts(&self, value: &Value) -> bool {
        self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_marks_modified() {
        let mut feature = Feature::empty("roads.1");
        assert!(!feature.is_modified());

        feature.set("name", json!("Main St"));
        assert!(feature.is_modified());
        assert_eq!(feature.get("name"), Some(&json!("Main St")));

        feature.mark_clean();
        assert!(!feature.is_modified());
    }

    #[test]
    fn test_closure_filter() {
        let filter = |v: &Value| v.as_i64().is_some_and(|n| n > 10);
        assert!(filter.accepts(&json!(11)));
        assert!(!filter.accepts(&json!(3)));
        assert!(!filter.accepts(&Value::Null));
    }

    #[test]
    fn test_feature_serialization_skips_modified_flag() {
        let mut feature = Feature::empty("roads.1");
        feature.set("lanes", json!(2));
        let json = serde_json::to_string(&feature).unwrap();
        assert!(json.contains("\"id\":\"roads.1\""));
        assert!(!json.contains("modified"));
    }
}
