//! JSON merge-patch engine.
//!
//! Computes and applies RFC 7386 style patches between two JSON objects:
//!
//! ```text
//! previous  {"a":1,"b":{"x":1,"y":2},"c":[1,2]}
//! next      {"a":1,"b":{"x":1},"c":[1,3],"d":true}
//! ─────────────────────────────────────────────────
//! diff      {"b":{"y":null},"c":[1,3],"d":true}
//! ```
//!
//! - `null` marks a deleted key.
//! - Objects are diffed recursively.
//! - Arrays are never diffed element-by-element; any difference replaces
//!   the whole array.
//! - Scalars compare by exact value.
//!
//! Values that are themselves `null` inside `next` cannot be expressed by
//! a merge patch and are treated as deletions on the receiving side.

use serde_json::{Map, Value};
use thiserror::Error;

/// A parsed JSON object document.
pub type Document = Map<String, Value>;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("invalid JSON document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("document is not a JSON object")]
    NotObject,
}

/// Compute the merge patch that turns `previous` into `next`.
///
/// Returns an empty map when both documents are equal.
pub fn diff(previous: &Document, next: &Document) -> Document {
    let mut patch = Map::new();

    for (key, next_value) in next {
        let Some(prev_value) = previous.get(key) else {
            patch.insert(key.clone(), next_value.clone());
            continue;
        };

        match (prev_value, next_value) {
            (Value::Object(a), Value::Object(b)) => {
                let nested = diff(a, b);
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            // Arrays and scalars of the same kind are replaced only when different.
            (a, b) if same_kind(a, b) => {
                if a != b {
                    patch.insert(key.clone(), b.clone());
                }
            }
            _ => {
                patch.insert(key.clone(), next_value.clone());
            }
        }
    }

    for key in previous.keys() {
        if !next.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }

    patch
}

/// Apply a merge patch to `document` in place.
pub fn apply(document: &mut Document, patch: &Document) {
    for (key, patch_value) in patch {
        match patch_value {
            Value::Null => {
                document.remove(key);
            }
            Value::Object(nested_patch) => match document.get_mut(key) {
                Some(Value::Object(nested_doc)) => apply(nested_doc, nested_patch),
                _ => {
                    document.insert(key.clone(), patch_value.clone());
                }
            },
            _ => {
                document.insert(key.clone(), patch_value.clone());
            }
        }
    }
}

/// Parse `text` as a JSON object.
pub fn parse_document(text: &str) -> Result<Document, MergeError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        _ => Err(MergeError::NotObject),
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

/// Diff cache that keeps the last parsed document.
///
/// Each call to [`MergePatcher::patch`] parses only the new document and
/// diffs it against the cached parse of the previous one.
#[derive(Debug, Default)]
pub struct MergePatcher {
    previous: Option<Document>,
}

impl MergePatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the cache with a document without producing a patch.
    ///
    /// Non-object documents leave the cache empty.
    pub fn seed(&mut self, text: &str) -> Result<(), MergeError> {
        self.previous = match parse_document(text) {
            Ok(document) => Some(document),
            Err(MergeError::NotObject) => None,
            Err(e) => return Err(e),
        };
        Ok(())
    }

    /// Drop the cached document. The next patch is computed against `{}`.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Whether a previous document is cached.
    pub fn is_seeded(&self) -> bool {
        self.previous.is_some()
    }

    /// Diff `text` against the cached document and cache it for next time.
    ///
    /// On error the cache is cleared, so the next successful patch carries
    /// the complete document.
    pub fn patch(&mut self, text: &str) -> Result<Document, MergeError> {
        let next = match parse_document(text) {
            Ok(next) => next,
            Err(e) => {
                self.previous = None;
                return Err(e);
            }
        };
        let patch = match &self.previous {
            Some(previous) => diff(previous, &next),
            None => diff(&Map::new(), &next),
        };
        self.previous = Some(next);
        Ok(patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_diff_equal_documents_is_empty() {
        let a = doc(json!({"a": 1, "b": {"c": [1, 2]}}));
        assert!(diff(&a, &a.clone()).is_empty());
    }

    #[test]
    fn test_diff_added_changed_deleted() {
        let a = doc(json!({"a": 1, "b": 2, "gone": true}));
        let b = doc(json!({"a": 1, "b": 3, "new": "x"}));
        let patch = diff(&a, &b);
        assert_eq!(Value::Object(patch), json!({"b": 3, "new": "x", "gone": null}));
    }

    #[test]
    fn test_diff_recurses_into_objects() {
        let a = doc(json!({"o": {"x": 1, "y": 2}, "same": {"k": 1}}));
        let b = doc(json!({"o": {"x": 1, "y": 5}, "same": {"k": 1}}));
        assert_eq!(Value::Object(diff(&a, &b)), json!({"o": {"y": 5}}));
    }

    #[test]
    fn test_diff_replaces_whole_array() {
        let a = doc(json!({"list": [1, 2, 3]}));
        let b = doc(json!({"list": [1, 2, 4]}));
        assert_eq!(Value::Object(diff(&a, &b)), json!({"list": [1, 2, 4]}));

        let c = doc(json!({"list": [1, 2, 3]}));
        assert!(diff(&a, &c).is_empty());
    }

    #[test]
    fn test_diff_type_mismatch_is_verbatim() {
        let a = doc(json!({"v": {"x": 1}, "n": 1}));
        let b = doc(json!({"v": [1], "n": "1"}));
        assert_eq!(Value::Object(diff(&a, &b)), json!({"v": [1], "n": "1"}));
    }

    #[test]
    fn test_diff_exact_number_equality() {
        let a = doc(json!({"n": 1}));
        let b = doc(json!({"n": 1.0}));
        assert_eq!(diff(&a, &b).len(), 1);
    }

    #[test]
    fn test_apply_deletes_and_merges() {
        let mut d = doc(json!({"a": 1, "o": {"x": 1, "y": 2}}));
        let patch = doc(json!({"a": null, "o": {"y": null, "z": 3}, "b": [1]}));
        apply(&mut d, &patch);
        assert_eq!(Value::Object(d), json!({"o": {"x": 1, "z": 3}, "b": [1]}));
    }

    #[test]
    fn test_apply_object_over_scalar() {
        let mut d = doc(json!({"a": 1}));
        apply(&mut d, &doc(json!({"a": {"b": 2}})));
        assert_eq!(Value::Object(d), json!({"a": {"b": 2}}));
    }

    #[test]
    fn test_apply_delete_missing_key_is_noop() {
        let mut d = doc(json!({"a": 1}));
        apply(&mut d, &doc(json!({"missing": null})));
        assert_eq!(Value::Object(d), json!({"a": 1}));
    }

    #[test]
    fn test_patcher_sequence() {
        let mut patcher = MergePatcher::new();
        patcher.seed(r#"{"a":1}"#).unwrap();

        let p = patcher.patch(r#"{"a":1,"b":2}"#).unwrap();
        assert_eq!(Value::Object(p), json!({"b": 2}));

        let p = patcher.patch(r#"{"b":2}"#).unwrap();
        assert_eq!(Value::Object(p), json!({"a": null}));

        let p = patcher.patch(r#"{"b":2}"#).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn test_patcher_reset_produces_full_document() {
        let mut patcher = MergePatcher::new();
        patcher.seed(r#"{"a":1}"#).unwrap();
        patcher.reset();
        assert!(!patcher.is_seeded());
        let p = patcher.patch(r#"{"a":1}"#).unwrap();
        assert_eq!(Value::Object(p), json!({"a": 1}));
    }

    #[test]
    fn test_patcher_rejects_non_object() {
        let mut patcher = MergePatcher::new();
        assert!(matches!(patcher.patch("[1,2]"), Err(MergeError::NotObject)));
        assert!(matches!(patcher.patch("{nope"), Err(MergeError::Parse(_))));
        patcher.seed("[1]").unwrap();
        assert!(!patcher.is_seeded());
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::from),
            any::<i32>().prop_map(Value::from),
            "[a-z]{0,6}".prop_map(Value::from),
        ]
    }

    // Nulls are excluded from object members: a merge patch cannot
    // represent a key whose value is null.
    fn value() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(prop_oneof![inner.clone(), Just(Value::Null)], 0..4)
                    .prop_map(Value::Array),
                prop::collection::btree_map("[a-d]", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn document() -> impl Strategy<Value = Document> {
        prop::collection::btree_map("[a-f]", value(), 0..6).prop_map(|m| m.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_apply_diff_round_trips(a in document(), b in document()) {
            let patch = diff(&a, &b);
            let mut merged = a.clone();
            apply(&mut merged, &patch);
            prop_assert_eq!(merged, b);
        }

        #[test]
        fn prop_key_set_follows_target(a in document(), b in document()) {
            let mut merged = a.clone();
            apply(&mut merged, &diff(&a, &b));
            let merged_keys: BTreeSet<_> = merged.keys().collect();
            let target_keys: BTreeSet<_> = b.keys().collect();
            prop_assert_eq!(merged_keys, target_keys);
        }
    }
}
