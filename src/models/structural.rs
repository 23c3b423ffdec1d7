// dtctl - CLI for the Darktrace API
// Copyright (C) 2024 Mathias Uhl <mathiasuhl@gmx.de>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Recursive diff of two JSON values.
//!
//! Produces `change`, `add` and `remove` records addressed by key path.
//! Records serialize as `[operation, path, value]` where the path is a dotted
//! string when every segment is a plain key and an array otherwise.

use serde::ser::{Serialize, SerializeSeq, SerializeTuple, Serializer};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Change {
        path: Vec<PathSegment>,
        old: Value,
        new: Value,
    },
    Add {
        path: Vec<PathSegment>,
        entries: Vec<(PathSegment, Value)>,
    },
    Remove {
        path: Vec<PathSegment>,
        entries: Vec<(PathSegment, Value)>,
    },
}

impl Change {
    pub fn operation(&self) -> &'static str {
        match self {
            Change::Change { .. } => "change",
            Change::Add { .. } => "add",
            Change::Remove { .. } => "remove",
        }
    }

    pub fn path(&self) -> &[PathSegment] {
        match self {
            Change::Change { path, .. } | Change::Add { path, .. } | Change::Remove { path, .. } => {
                path
            }
        }
    }
}

pub fn diff(first: &Value, second: &Value) -> Vec<Change> {
    let mut out = Vec::new();
    walk(first, second, &mut Vec::new(), &mut out);
    out
}

/// Equal when the diff finds nothing; numbers compare by value.
pub fn values_equal(first: &Value, second: &Value) -> bool {
    diff(first, second).is_empty()
}

fn walk(first: &Value, second: &Value, path: &mut Vec<PathSegment>, out: &mut Vec<Change>) {
    match (first, second) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, left) in a {
                if let Some(right) = b.get(key) {
                    path.push(PathSegment::Key(key.clone()));
                    walk(left, right, path, out);
                    path.pop();
                }
            }
            let added: Vec<_> = b
                .iter()
                .filter(|(key, _)| !a.contains_key(*key))
                .map(|(key, value)| (PathSegment::Key(key.clone()), value.clone()))
                .collect();
            if !added.is_empty() {
                out.push(Change::Add {
                    path: path.clone(),
                    entries: added,
                });
            }
            let removed: Vec<_> = a
                .iter()
                .filter(|(key, _)| !b.contains_key(*key))
                .map(|(key, value)| (PathSegment::Key(key.clone()), value.clone()))
                .collect();
            if !removed.is_empty() {
                out.push(Change::Remove {
                    path: path.clone(),
                    entries: removed,
                });
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            let common = a.len().min(b.len());
            for index in 0..common {
                path.push(PathSegment::Index(index));
                walk(&a[index], &b[index], path, out);
                path.pop();
            }
            if b.len() > common {
                out.push(Change::Add {
                    path: path.clone(),
                    entries: (common..b.len())
                        .map(|i| (PathSegment::Index(i), b[i].clone()))
                        .collect(),
                });
            }
            if a.len() > common {
                out.push(Change::Remove {
                    path: path.clone(),
                    entries: (common..a.len())
                        .rev()
                        .map(|i| (PathSegment::Index(i), a[i].clone()))
                        .collect(),
                });
            }
        }
        _ => {
            if !leaf_eq(first, second) {
                out.push(Change::Change {
                    path: path.clone(),
                    old: first.clone(),
                    new: second.clone(),
                });
            }
        }
    }
}

fn leaf_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y || x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

impl Serialize for PathSegment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PathSegment::Key(key) => serializer.serialize_str(key),
            PathSegment::Index(index) => serializer.serialize_u64(*index as u64),
        }
    }
}

struct PathRef<'a>(&'a [PathSegment]);

impl Serialize for PathRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let dotted = self
            .0
            .iter()
            .all(|segment| matches!(segment, PathSegment::Key(key) if !key.contains('.')));
        if dotted {
            let joined = self
                .0
                .iter()
                .filter_map(|segment| match segment {
                    PathSegment::Key(key) => Some(key.as_str()),
                    PathSegment::Index(_) => None,
                })
                .collect::<Vec<_>>()
                .join(".");
            return serializer.serialize_str(&joined);
        }
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for segment in self.0 {
            seq.serialize_element(segment)?;
        }
        seq.end()
    }
}

impl Serialize for Change {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(self.operation())?;
        tuple.serialize_element(&PathRef(self.path()))?;
        match self {
            Change::Change { old, new, .. } => tuple.serialize_element(&(old, new))?,
            Change::Add { entries, .. } | Change::Remove { entries, .. } => {
                tuple.serialize_element(entries)?
            }
        }
        tuple.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_values_have_no_changes() {
        let value = json!({"a": [1, {"b": 2.5}], "c": null});
        assert!(diff(&value, &value.clone()).is_empty());
    }

    #[test]
    fn test_integers_and_floats_compare_numerically() {
        assert!(diff(&json!({"w": 1}), &json!({"w": 1.0})).is_empty());
    }

    #[test]
    fn test_reports_nested_change_with_dotted_path() {
        let changes = diff(
            &json!({"trigger": {"value": "22"}}),
            &json!({"trigger": {"value": "443"}}),
        );
        assert_eq!(
            serde_json::to_value(&changes).unwrap(),
            json!([["change", "trigger.value", ["22", "443"]]])
        );
    }

    #[test]
    fn test_reports_added_then_removed_keys() {
        let changes = diff(&json!({"a": 1, "b": 2}), &json!({"a": 1, "c": 3}));
        assert_eq!(
            serde_json::to_value(&changes).unwrap(),
            json!([["add", "", [["c", 3]]], ["remove", "", [["b", 2]]]])
        );
    }

    #[test]
    fn test_list_tails_use_index_paths() {
        let changes = diff(&json!({"l": [1, 2, 3]}), &json!({"l": [9]}));
        assert_eq!(
            serde_json::to_value(&changes).unwrap(),
            json!([
                ["change", ["l", 0], [1, 9]],
                ["remove", "l", [[2, 3], [1, 2]]]
            ])
        );

        let grown = diff(&json!([1]), &json!([1, 2]));
        assert_eq!(
            serde_json::to_value(&grown).unwrap(),
            json!([["add", "", [[1, 2]]]])
        );
    }

    #[test]
    fn test_type_mismatch_is_a_change() {
        let changes = diff(&json!({"a": {"x": 1}}), &json!({"a": [1]}));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation(), "change");
        assert_eq!(changes[0].path(), &[PathSegment::Key("a".into())]);
    }
}
