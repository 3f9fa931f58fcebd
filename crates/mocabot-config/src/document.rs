//! JSON documents held by a [`crate::WatchedStore`] and the changes between revisions.

use std::collections::HashSet;
use std::fmt::Debug;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::store::StoreOptions;

/// Key/value document backing `system.json` and `flags.json`.
pub type JsonMap = serde_json::Map<String, Value>;

/// A whole-file JSON document that can be diffed against a previous revision.
pub trait Document: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Description of a single difference between two revisions.
    type Change: Clone + Debug + PartialEq + Send + Sync + 'static;

    /// Differences between `previous` and `next`, in a stable order.
    fn diff(previous: &Self, next: &Self) -> Vec<Self::Change>;

    /// Bring a freshly parsed or mutated document into canonical form.
    fn normalize(&mut self, _options: &StoreOptions) {}
}

/// A key whose value differs between two map revisions.
///
/// Absent keys are reported as `Value::Null`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyChange {
    /// Key that changed.
    pub key: String,
    /// Value before the change.
    pub old: Value,
    /// Value after the change.
    pub new: Value,
}

/// An entry added to or removed from a list document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListChange {
    /// Entry present only in the newer revision.
    Added(String),
    /// Entry present only in the older revision.
    Removed(String),
}

impl Document for JsonMap {
    type Change = KeyChange;

    fn diff(previous: &Self, next: &Self) -> Vec<KeyChange> {
        let keys: HashSet<&String> = previous.keys().chain(next.keys()).collect();
        let mut changes: Vec<KeyChange> = keys
            .into_iter()
            .filter_map(|key| {
                let old = previous.get(key).cloned().unwrap_or(Value::Null);
                let new = next.get(key).cloned().unwrap_or(Value::Null);
                (old != new).then(|| KeyChange {
                    key: key.clone(),
                    old,
                    new,
                })
            })
            .collect();
        changes.sort_by(|left, right| left.key.cmp(&right.key));
        changes
    }
}

impl Document for Vec<String> {
    type Change = ListChange;

    fn diff(previous: &Self, next: &Self) -> Vec<ListChange> {
        let before: HashSet<&str> = previous.iter().map(String::as_str).collect();
        let after: HashSet<&str> = next.iter().map(String::as_str).collect();
        let removed = previous
            .iter()
            .filter(|item| !after.contains(item.as_str()))
            .map(|item| ListChange::Removed(item.clone()));
        let added = next
            .iter()
            .filter(|item| !before.contains(item.as_str()))
            .map(|item| ListChange::Added(item.clone()));
        removed.chain(added).collect()
    }

    fn normalize(&mut self, options: &StoreOptions) {
        if options.deduplicate {
            let mut seen = HashSet::with_capacity(self.len());
            self.retain(|item| seen.insert(item.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            _ => JsonMap::new(),
        }
    }

    #[test]
    fn map_diff_reports_changed_added_and_removed_keys() {
        let before = map(json!({"a": 1, "b": true, "c": "keep"}));
        let after = map(json!({"a": 2, "c": "keep", "d": null, "e": [1]}));

        let changes = JsonMap::diff(&before, &after);
        assert_eq!(
            changes,
            vec![
                KeyChange {
                    key: "a".into(),
                    old: json!(1),
                    new: json!(2)
                },
                KeyChange {
                    key: "b".into(),
                    old: json!(true),
                    new: Value::Null
                },
                KeyChange {
                    key: "e".into(),
                    old: Value::Null,
                    new: json!([1])
                },
            ]
        );
    }

    #[test]
    fn list_diff_and_dedupe() {
        let before = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        let after = vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()];
        assert_eq!(
            Vec::<String>::diff(&before, &after),
            vec![
                ListChange::Removed("10.0.0.1".into()),
                ListChange::Added("10.0.0.3".into()),
            ]
        );

        let mut doc = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        doc.normalize(&StoreOptions { deduplicate: false });
        assert_eq!(doc.len(), 3);
        doc.normalize(&StoreOptions { deduplicate: true });
        assert_eq!(doc, vec!["a".to_string(), "b".to_string()]);
    }
}
