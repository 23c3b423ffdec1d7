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

//! Differences between the pending and the active version of a model.
//!
//! Components and filters are paired by position after each side has been
//! put in its own derived order (components by `policy.logic.data`, filters by
//! id). When counts differ only the count deltas are reported for components
//! and weights, and filter lists are padded with placeholders. Both are
//! approximations: a shifted position pairs unrelated entries.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::pending_updates;
use super::structural::{self, Change};
use super::types::{Component, Filter, FilterId, LogicEntry, ModelSnapshot, Policy};
use crate::client::ApiQuery;

const COMPONENT_KEYS_IGNORED: [&str; 6] = ["cid", "chid", "mlid", "active", "filters", "logic"];
const FILTER_KEYS_IGNORED: [&str; 3] = ["id", "cfid", "cfhid"];
const POLICY_KEYS_IGNORED: [&str; 14] = [
    "history",
    "pid",
    "uuid",
    "phid",
    "active",
    "modified",
    "activeTimes",
    "created",
    "edited",
    "version",
    "logic",
    "actions",
    "tags",
    "message",
];

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum UpdateDiff {
    Changes(ModelDiff),
    Unresolved(UnresolvedModel),
}

/// A pending model whose history has no active version to compare against.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UnresolvedModel {
    pub model: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelDiff {
    pub model: String,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyDiff>,
    #[serde(flatten)]
    pub components: ComponentDiff,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ComponentDiff {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nr_of_new_components: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nr_of_components_removed: Option<usize>,
    pub components: Vec<ComponentChange>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ComponentChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterDiff>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub base: Vec<Change>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FilterDiff {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nr_of_filters_added: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nr_of_filters_removed: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub display: Vec<Vec<Change>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Vec<Change>>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PolicyDiff {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<TagDiff>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Change>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_weight_changes: Option<WeightDiff>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub base: Vec<Change>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TagDiff {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed_tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub added_tags: Vec<String>,
}

/// Serialized as one map: the count keys, then `component_<index>` entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightDiff {
    pub nr_of_weights_added: Option<usize>,
    pub nr_of_weights_removed: Option<usize>,
    pub changes: Vec<WeightChange>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightChange {
    pub index: usize,
    pub kind: WeightChangeKind,
    pub weight: Value,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WeightChangeKind {
    Changed,
    Added,
}

impl ComponentChange {
    pub fn is_empty(&self) -> bool {
        self.filters.is_none() && self.base.is_empty()
    }
}

impl FilterDiff {
    pub fn is_empty(&self) -> bool {
        self.nr_of_filters_added.is_none()
            && self.nr_of_filters_removed.is_none()
            && self.display.is_empty()
            && self.rules.is_empty()
    }
}

impl PolicyDiff {
    pub fn is_empty(&self) -> bool {
        self.tags.is_none()
            && self.actions.is_empty()
            && self.component_weight_changes.is_none()
            && self.base.is_empty()
    }
}

impl TagDiff {
    pub fn is_empty(&self) -> bool {
        self.removed_tags.is_empty() && self.added_tags.is_empty()
    }
}

impl WeightDiff {
    pub fn is_empty(&self) -> bool {
        self.nr_of_weights_added.is_none()
            && self.nr_of_weights_removed.is_none()
            && self.changes.is_empty()
    }
}

impl Serialize for WeightDiff {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(added) = self.nr_of_weights_added {
            map.serialize_entry("nr_of_weights_added", &added)?;
        }
        if let Some(removed) = self.nr_of_weights_removed {
            map.serialize_entry("nr_of_weights_removed", &removed)?;
        }
        for change in &self.changes {
            map.serialize_entry(
                &format!("component_{}", change.index),
                &(change.kind, &change.weight),
            )?;
        }
        map.end()
    }
}

/// One record per model with a pending update.
pub fn update_diffs<A: ApiQuery + ?Sized>(api: &A) -> Result<Vec<UpdateDiff>> {
    let models = pending_updates(api)?;
    let mut diffs = Vec::with_capacity(models.len());

    for model in &models {
        let Some((pending, active)) = model.pending_and_active() else {
            continue;
        };
        let Some(active) = active else {
            warn!(model = %model.name, pid = model.pid, "pending update has no active version to compare with");
            diffs.push(UpdateDiff::Unresolved(UnresolvedModel {
                model: model.name.clone(),
                error: "no active history entry precedes the pending update".to_string(),
            }));
            continue;
        };

        debug!(model = %model.name, pending = pending.phid, active = active.phid, "diffing model versions");
        let updated = fetch_snapshot(api, model.pid, pending.phid)?;
        let current = fetch_snapshot(api, model.pid, active.phid)?;
        diffs.push(UpdateDiff::Changes(diff_snapshots(&updated, &current)));
    }

    Ok(diffs)
}

pub fn fetch_snapshot<A: ApiQuery + ?Sized>(api: &A, pid: i64, phid: i64) -> Result<ModelSnapshot> {
    let endpoint = format!("/models/{pid}");
    let value = api.get(&endpoint, &[("phid", phid.to_string())])?;
    serde_json::from_value(value).with_context(|| format!("parsing model {pid} version {phid}"))
}

pub fn diff_snapshots(updated: &ModelSnapshot, active: &ModelSnapshot) -> ModelDiff {
    let components = component_differences(updated, active);
    let policy = policy_differences(&updated.policy, &active.policy);
    ModelDiff {
        model: updated.policy.name.clone(),
        message: updated.policy.message.clone(),
        policy: (!policy.is_empty()).then_some(policy),
        components,
    }
}

pub fn component_differences(updated: &ModelSnapshot, active: &ModelSnapshot) -> ComponentDiff {
    let updated_sorted = components_by_cid(
        &cid_order(&updated.policy.logic.data),
        &updated.components,
    );
    let active_sorted = components_by_cid(&cid_order(&active.policy.logic.data), &active.components);

    let mut differences = ComponentDiff::default();
    match updated_sorted.len().cmp(&active_sorted.len()) {
        Ordering::Greater => {
            differences.nr_of_new_components = Some(updated_sorted.len() - active_sorted.len())
        }
        Ordering::Less => {
            differences.nr_of_components_removed = Some(active_sorted.len() - updated_sorted.len())
        }
        Ordering::Equal => {}
    }

    if updated.components.len() != active.components.len() {
        return differences;
    }

    differences.components = compare_by_derived_order(&updated_sorted, &active_sorted);
    differences
}

pub fn cid_order(logic_data: &[LogicEntry]) -> Vec<i64> {
    logic_data.iter().filter_map(LogicEntry::cid).collect()
}

pub fn components_by_cid<'a>(order: &[i64], components: &'a [Component]) -> Vec<&'a Component> {
    order
        .iter()
        .flat_map(|cid| components.iter().filter(move |c| c.cid == *cid))
        .collect()
}

/// Pairs components purely by position in their derived orders. Non-empty
/// results are prepended, so the output runs last pair first.
pub fn compare_by_derived_order(
    updated: &[&Component],
    active: &[&Component],
) -> Vec<ComponentChange> {
    let mut changes = Vec::new();
    for (current, pending) in active.iter().zip(updated) {
        let filters = filter_differences(&pending.filters, &current.filters);
        let base = structural::diff(
            &strip(&current.extra, &COMPONENT_KEYS_IGNORED),
            &strip(&pending.extra, &COMPONENT_KEYS_IGNORED),
        );
        let change = ComponentChange {
            filters: (!filters.is_empty()).then_some(filters),
            base,
        };
        if !change.is_empty() {
            changes.insert(0, change);
        }
    }
    changes
}

pub fn filter_differences(updated: &[Filter], active: &[Filter]) -> FilterDiff {
    let mut updated_sorted = updated.to_vec();
    updated_sorted.sort_by(|a, b| a.id.cmp(&b.id));
    let mut active_sorted = active.to_vec();
    active_sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut differences = FilterDiff::default();
    match updated_sorted.len().cmp(&active_sorted.len()) {
        Ordering::Greater => {
            differences.nr_of_filters_added = Some(updated_sorted.len() - active_sorted.len())
        }
        Ordering::Less => {
            differences.nr_of_filters_removed = Some(active_sorted.len() - updated_sorted.len())
        }
        Ordering::Equal => {}
    }

    if updated_sorted.len() != active_sorted.len() {
        (updated_sorted, active_sorted) = fill_missing_filters(updated_sorted, active_sorted);
    }

    for (current, pending) in active_sorted.iter().zip(&updated_sorted) {
        let changes = structural::diff(&filter_body(current), &filter_body(pending));
        if changes.is_empty() {
            continue;
        }
        if current.comparator() == Some("display") || pending.comparator() == Some("display") {
            differences.display.push(changes);
        } else {
            differences.rules.push(changes);
        }
    }

    differences
}

/// Inserts a placeholder for every id missing on the other side, at the index
/// the filter has in its own list. Several insertions can shift later pairs.
pub fn fill_missing_filters(
    mut updated: Vec<Filter>,
    mut active: Vec<Filter>,
) -> (Vec<Filter>, Vec<Filter>) {
    let active_ids: HashSet<FilterId> = active.iter().map(|f| f.id.clone()).collect();
    let updated_ids: HashSet<FilterId> = updated.iter().map(|f| f.id.clone()).collect();

    let removed: Vec<(usize, Filter)> = active
        .iter()
        .enumerate()
        .filter(|(_, f)| !updated_ids.contains(&f.id))
        .map(|(index, f)| (index, f.placeholder()))
        .collect();
    for (index, placeholder) in removed {
        let at = index.min(updated.len());
        updated.insert(at, placeholder);
    }

    let added: Vec<(usize, Filter)> = updated
        .iter()
        .enumerate()
        .filter(|(_, f)| !active_ids.contains(&f.id))
        .map(|(index, f)| (index, f.placeholder()))
        .collect();
    for (index, placeholder) in added {
        let at = index.min(active.len());
        active.insert(at, placeholder);
    }

    (updated, active)
}

pub fn policy_differences(updated: &Policy, active: &Policy) -> PolicyDiff {
    let tags = tag_differences(&updated.tags, &active.tags);
    let actions = structural::diff(&sorted_map(&active.actions), &sorted_map(&updated.actions));
    let weights = weight_differences(&active.logic.data, &updated.logic.data);
    let base = structural::diff(&policy_body(active), &policy_body(updated));

    PolicyDiff {
        tags: (!tags.is_empty()).then_some(tags),
        actions,
        component_weight_changes: (!weights.is_empty()).then_some(weights),
        base,
    }
}

pub fn tag_differences(updated: &[String], active: &[String]) -> TagDiff {
    TagDiff {
        removed_tags: active
            .iter()
            .filter(|tag| !updated.contains(tag))
            .cloned()
            .collect(),
        added_tags: updated
            .iter()
            .filter(|tag| !active.contains(tag))
            .cloned()
            .collect(),
    }
}

/// Compares `weight` per position. On a length mismatch only the count delta
/// is reported, even if the common prefix changed.
pub fn weight_differences(active: &[LogicEntry], updated: &[LogicEntry]) -> WeightDiff {
    let mut differences = WeightDiff::default();
    match updated.len().cmp(&active.len()) {
        Ordering::Greater => differences.nr_of_weights_added = Some(updated.len() - active.len()),
        Ordering::Less => differences.nr_of_weights_removed = Some(active.len() - updated.len()),
        Ordering::Equal => {}
    }
    if updated.len() != active.len() {
        return differences;
    }

    // indexed by position in `updated`, not by record count
    let reference: Vec<&Value> = active.iter().filter_map(LogicEntry::weight).collect();
    for (index, entry) in updated.iter().enumerate() {
        let Some(weight) = entry.weight() else {
            continue;
        };
        let kind = match reference.get(index) {
            Some(expected) if structural::values_equal(expected, weight) => continue,
            Some(_) => WeightChangeKind::Changed,
            None => WeightChangeKind::Added,
        };
        differences.changes.push(WeightChange {
            index,
            kind,
            weight: weight.clone(),
        });
    }
    differences
}

fn strip(map: &Map<String, Value>, ignored: &[&str]) -> Value {
    Value::Object(
        map.iter()
            .filter(|(key, _)| !ignored.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    )
}

fn filter_body(filter: &Filter) -> Value {
    strip(&filter.fields, &FILTER_KEYS_IGNORED)
}

fn policy_body(policy: &Policy) -> Value {
    let mut body = Map::new();
    body.insert("name".to_string(), Value::String(policy.name.clone()));
    if let Value::Object(rest) = strip(&policy.extra, &POLICY_KEYS_IGNORED) {
        body.extend(rest);
    }
    Value::Object(body)
}

fn sorted_map(map: &Map<String, Value>) -> Value {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    Value::Object(
        entries
            .into_iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    )
}
