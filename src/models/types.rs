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

//! Typed views of the vendor model JSON.
//!
//! Every struct keeps fields it does not name in a flattened map so that a
//! model can be written back out unchanged and compared field by field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Entry of `/models`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Model {
    pub pid: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default, rename = "autoUpdatable")]
    pub auto_updatable: bool,
    #[serde(default, rename = "autoUpdate")]
    pub auto_update: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<Logic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub phid: i64,
    #[serde(default)]
    pub modified: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body of `/models/{pid}?phid={phid}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSnapshot {
    pub policy: Policy,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub actions: Map<String, Value>,
    #[serde(default)]
    pub logic: Logic,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Logic {
    #[serde(default)]
    pub data: Vec<LogicEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `logic.data` holds either weighted records or bare component ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum LogicEntry {
    Record(LogicRecord),
    Bare(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogicRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<i64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub weight: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Component {
    pub cid: i64,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Filter ids are letters on current appliances and numbers on older ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(untagged)]
pub enum FilterId {
    Number(i64),
    Letter(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    pub id: FilterId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Model {
    /// History sorted by `modified`, most recent first. Ties keep their
    /// original order.
    pub fn history_by_recency(&self) -> Vec<&HistoryEntry> {
        let mut sorted: Vec<&HistoryEntry> = self.history.iter().collect();
        sorted.sort_by(|a, b| b.modified.cmp(&a.modified));
        sorted
    }

    pub fn has_pending_update(&self) -> bool {
        self.history_by_recency()
            .first()
            .is_some_and(|latest| !latest.active)
    }

    /// The pending head of history and the first active entry after it.
    pub fn pending_and_active(&self) -> Option<(&HistoryEntry, Option<&HistoryEntry>)> {
        let sorted = self.history_by_recency();
        let (pending, older) = sorted.split_first()?;
        let active = older.iter().find(|entry| entry.active).copied();
        Some((*pending, active))
    }

    pub fn is_enhanced(&self) -> bool {
        self.tags
            .iter()
            .any(|tag| tag.to_lowercase().contains("enhanced"))
    }

    pub fn has_tag_like(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.tags
            .iter()
            .any(|tag| tag.to_lowercase().contains(&needle))
    }
}

impl LogicEntry {
    pub fn cid(&self) -> Option<i64> {
        match self {
            LogicEntry::Record(record) => record.cid,
            LogicEntry::Bare(value) => value.as_i64(),
        }
    }

    /// Weight of a record entry; bare ids carry none.
    pub fn weight(&self) -> Option<&Value> {
        match self {
            LogicEntry::Record(record) => Some(&record.weight),
            LogicEntry::Bare(_) => None,
        }
    }
}

impl Filter {
    pub fn comparator(&self) -> Option<&str> {
        self.fields.get("comparator").and_then(Value::as_str)
    }

    /// Same keys with null values, keeping only the id.
    pub fn placeholder(&self) -> Filter {
        Filter {
            id: self.id.clone(),
            fields: self
                .fields
                .keys()
                .map(|key| (key.clone(), Value::Null))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_logic_entries_accept_records_and_bare_ids() {
        let logic: Logic = serde_json::from_value(json!({
            "data": [{"cid": 10, "weight": 1}, 11],
            "type": "weightedComponentList"
        }))
        .unwrap();
        assert_eq!(logic.data[0].cid(), Some(10));
        assert_eq!(logic.data[0].weight(), Some(&json!(1)));
        assert_eq!(logic.data[1].cid(), Some(11));
        assert_eq!(logic.data[1].weight(), None);
        assert_eq!(logic.extra["type"], "weightedComponentList");
    }

    #[test]
    fn test_pending_and_active_scan_history_by_recency() {
        let model: Model = serde_json::from_value(json!({
            "pid": 1,
            "name": "Device::Anomaly",
            "history": [
                {"phid": 1, "modified": "2019-01-01 00:00:00", "active": true},
                {"phid": 3, "modified": "2019-03-01 00:00:00", "active": false},
                {"phid": 2, "modified": "2019-02-01 00:00:00", "active": true}
            ]
        }))
        .unwrap();
        assert!(model.has_pending_update());
        let (pending, active) = model.pending_and_active().unwrap();
        assert_eq!(pending.phid, 3);
        assert_eq!(active.map(|h| h.phid), Some(2));
    }

    #[test]
    fn test_unknown_fields_survive_a_round_trip() {
        let raw = json!({"pid": 5, "name": "x", "uuid": "abc", "history": [], "tags": []});
        let model: Model = serde_json::from_value(raw).unwrap();
        let back = serde_json::to_value(&model).unwrap();
        assert_eq!(back["uuid"], "abc");
    }

    #[test]
    fn test_placeholder_nulls_everything_but_id() {
        let filter: Filter = serde_json::from_value(json!({
            "id": 4, "cfid": 9, "comparator": "display", "trigger": {"value": "x"}
        }))
        .unwrap();
        let lettered: Filter = serde_json::from_value(json!({"id": "B"})).unwrap();
        assert_eq!(lettered.id, FilterId::Letter("B".into()));
        let placeholder = filter.placeholder();
        assert_eq!(placeholder.id, FilterId::Number(4));
        assert_eq!(placeholder.fields.len(), 3);
        assert!(placeholder.fields.values().all(Value::is_null));
    }
}
