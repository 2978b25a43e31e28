//! JSON diffing for the `changes` map
//!
//! The service accepts any [`Differ`]; [`JsonDiffer`] is the default. Each
//! change record is keyed by its dotted path and carries at least `from` and
//! `to`, which is the shape the sensitive-data manager looks for when it
//! redacts changes.

use serde_json::{json, Value};
use std::collections::BTreeSet;

use crate::entry::DataMap;
use crate::error::Result;

/// Fields never reported as changed unless the caller overrides the list.
pub const DEFAULT_IGNORED_FIELDS: &[&str] = &["updated_at", "updatedAt", "version"];

const FLOAT_EPSILON: f64 = 1e-9;

/// Controls what a diff reports and how much of each change it records.
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Field names skipped at any depth
    pub ignore_fields: Vec<String>,
    /// Emit only `{from, to}` per change
    pub compact: bool,
    /// Nested objects deeper than this are compared as whole values
    pub max_depth: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            ignore_fields: DEFAULT_IGNORED_FIELDS.iter().map(|s| s.to_string()).collect(),
            compact: false,
            max_depth: 16,
        }
    }
}

impl DiffOptions {
    /// Default options with the reduced `{from, to}` shape.
    pub fn compact() -> Self {
        Self {
            compact: true,
            ..Self::default()
        }
    }
}

/// Produces a `changes` map from two snapshots of a resource.
pub trait Differ: Send + Sync {
    /// Compare `before` and `after`, returning change records keyed by path.
    fn diff(&self, before: &Value, after: &Value, options: &DiffOptions) -> Result<DataMap>;
}

/// Recursive object differ with whole-array replacement.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDiffer;

impl Differ for JsonDiffer {
    fn diff(&self, before: &Value, after: &Value, options: &DiffOptions) -> Result<DataMap> {
        let empty = Value::Object(DataMap::new());
        // A missing snapshot on one side (create or delete) diffs against `{}`.
        let (before, after) = match (before, after) {
            (Value::Null, Value::Object(_)) => (&empty, after),
            (Value::Object(_), Value::Null) => (before, &empty),
            _ => (before, after),
        };
        let mut changes = DataMap::new();
        walk(before, after, "", 0, options, &mut changes);
        Ok(changes)
    }
}

fn walk(from: &Value, to: &Value, path: &str, depth: usize, options: &DiffOptions, out: &mut DataMap) {
    match (from, to) {
        (Value::Object(from_obj), Value::Object(to_obj)) if depth < options.max_depth => {
            let keys: BTreeSet<&String> = from_obj.keys().chain(to_obj.keys()).collect();
            for key in keys {
                if options.ignore_fields.iter().any(|f| f == key) {
                    continue;
                }
                let field_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                match (from_obj.get(key), to_obj.get(key)) {
                    (Some(f), Some(t)) => walk(f, t, &field_path, depth + 1, options, out),
                    (Some(f), None) => record(out, field_path, f, &Value::Null, "deleted", options),
                    (None, Some(t)) => record(out, field_path, &Value::Null, t, "created", options),
                    (None, None) => {}
                }
            }
        }
        _ => {
            if !values_equal(from, to) {
                let path = if path.is_empty() { "$" } else { path };
                record(out, path.to_string(), from, to, "updated", options);
            }
        }
    }
}

fn record(out: &mut DataMap, path: String, from: &Value, to: &Value, kind: &str, options: &DiffOptions) {
    let change = if options.compact {
        json!({ "from": from, "to": to })
    } else {
        let typed = if to.is_null() { from } else { to };
        json!({
            "from": from,
            "to": to,
            "type": kind,
            "fieldType": field_type(typed),
            "path": path,
        })
    };
    out.insert(path, change);
}

fn field_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) => (fx - fy).abs() < FLOAT_EPSILON,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_changes_use_dotted_paths() {
        let before = json!({"status": "New", "stop": {"city": "Austin", "zip": "78701"}});
        let after = json!({"status": "InTransit", "stop": {"city": "Dallas", "zip": "78701"}});

        let changes = JsonDiffer.diff(&before, &after, &DiffOptions::default()).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes["status"]["from"], "New");
        assert_eq!(changes["status"]["to"], "InTransit");
        assert_eq!(changes["stop.city"]["type"], "updated");
        assert_eq!(changes["stop.city"]["fieldType"], "string");
        assert_eq!(changes["stop.city"]["path"], "stop.city");
    }

    #[test]
    fn test_ignored_fields_are_skipped() {
        let before = json!({"name": "a", "updated_at": 1, "version": 1});
        let after = json!({"name": "a", "updated_at": 2, "version": 2});
        let changes = JsonDiffer.diff(&before, &after, &DiffOptions::default()).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_arrays_are_replaced_whole() {
        let before = json!({"tags": ["a", "b"]});
        let after = json!({"tags": ["a", "c"]});
        let changes = JsonDiffer.diff(&before, &after, &DiffOptions::default()).unwrap();
        assert_eq!(changes["tags"]["to"], json!(["a", "c"]));
        assert_eq!(changes["tags"]["fieldType"], "array");
    }

    #[test]
    fn test_created_and_deleted_fields() {
        let before = json!({"old": 1});
        let after = json!({"new": 2});
        let changes = JsonDiffer.diff(&before, &after, &DiffOptions::default()).unwrap();
        assert_eq!(changes["old"]["type"], "deleted");
        assert_eq!(changes["old"]["fieldType"], "number");
        assert_eq!(changes["new"]["type"], "created");
    }

    #[test]
    fn test_delete_diffs_against_empty() {
        let changes = JsonDiffer
            .diff(&json!({"name": "FY2026"}), &Value::Null, &DiffOptions::default())
            .unwrap();
        assert_eq!(changes["name"]["type"], "deleted");
        assert_eq!(changes["name"]["to"], Value::Null);
    }

    #[test]
    fn test_compact_shape() {
        let changes = JsonDiffer
            .diff(&json!({"a": 1}), &json!({"a": 2}), &DiffOptions::compact())
            .unwrap();
        let change = changes["a"].as_object().unwrap();
        assert_eq!(change.len(), 2);
        assert_eq!(change["from"], 1);
        assert_eq!(change["to"], 2);
    }

    #[test]
    fn test_float_tolerance() {
        let changes = JsonDiffer
            .diff(&json!({"rate": 0.1 + 0.2}), &json!({"rate": 0.3}), &DiffOptions::default())
            .unwrap();
        assert!(changes.is_empty());
    }
}
