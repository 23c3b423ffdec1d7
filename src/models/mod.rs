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

//! Model listing, selection and reporting on top of `/models`.

pub mod differ;
pub mod structural;
pub mod types;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::breaches;
use crate::client::{ApiQuery, expect_array};
use crate::report::ReportTable;
use crate::timeutils::{self, DateRange};
use crate::validate::wildcard_match;
use types::Model;

const SYSTEM_ACTORS: [&str; 3] = ["darktrace", "System", "nobody"];

#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    pub enhanced_only: bool,
    pub active_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDiff {
    New,
    Deleted,
    Changed,
}

pub fn fetch_models<A: ApiQuery + ?Sized>(api: &A) -> Result<Vec<Model>> {
    let raw = api.get("/models", &[])?;
    serde_json::from_value(raw).context("parsing /models")
}

fn fetch_raw_models<A: ApiQuery + ?Sized>(api: &A) -> Result<Vec<Value>> {
    expect_array(api.get("/models", &[])?, "/models")
}

impl ModelFilter {
    /// Keeps models passing every enabled filter.
    pub fn apply(&self, models: Vec<Model>) -> Vec<Model> {
        models
            .into_iter()
            .filter(|model| !self.active_only || model.active)
            .filter(|model| !self.enhanced_only || model.is_enhanced())
            .collect()
    }
}

pub fn list_models<A: ApiQuery + ?Sized>(
    api: &A,
    filter: &ModelFilter,
    with_components: bool,
    tag: Option<&str>,
) -> Result<Vec<Model>> {
    let mut models = fetch_models(api)?;
    if with_components {
        attach_components(api, &mut models)?;
    }

    let models = filter.apply(models);
    Ok(match tag {
        Some(tag) => models
            .into_iter()
            .filter(|model| model.has_tag_like(tag))
            .collect(),
        None => models,
    })
}

/// Fills `components` from `/components` in the order of each model's
/// `logic.data`.
fn attach_components<A: ApiQuery + ?Sized>(api: &A, models: &mut [Model]) -> Result<()> {
    let components = expect_array(api.get("/components", &[])?, "/components")?;

    for model in models.iter_mut() {
        let order: Vec<i64> = model
            .logic
            .as_ref()
            .map(|logic| differ::cid_order(&logic.data))
            .unwrap_or_default();
        let attached: Vec<Value> = order
            .iter()
            .flat_map(|cid| {
                components
                    .iter()
                    .filter(move |c| c.get("cid").and_then(Value::as_i64) == Some(*cid))
            })
            .cloned()
            .collect();
        model.components = Some(attached);
    }
    Ok(())
}

/// Parses `key=value` selectors.
pub fn parse_selector(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() && !value.contains('=') => {
            Ok((key.to_string(), value.to_string()))
        }
        _ => bail!("Invalid format for \"{raw}\"\nSELECTORS must be in format \"key=value\""),
    }
}

/// Models with any top-level field whose text equals a selector value,
/// ignoring case.
pub fn select_models<A: ApiQuery + ?Sized>(
    api: &A,
    selectors: &[(String, String)],
) -> Result<Vec<Value>> {
    let models = fetch_raw_models(api)?;
    Ok(models
        .into_iter()
        .filter(|model| {
            selectors.iter().any(|(key, wanted)| {
                model
                    .get(key)
                    .is_some_and(|value| selector_text(value).to_lowercase() == wanted.to_lowercase())
            })
        })
        .collect())
}

fn selector_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn search_models<A: ApiQuery + ?Sized>(api: &A, name_query: &str) -> Result<Vec<Model>> {
    let models = fetch_models(api)?;
    Ok(models
        .into_iter()
        .filter(|model| wildcard_match(name_query, &model.name))
        .collect())
}

pub fn autoupdatable<A: ApiQuery + ?Sized>(api: &A) -> Result<Vec<String>> {
    Ok(fetch_models(api)?
        .into_iter()
        .filter(|model| model.auto_updatable && model.auto_update)
        .map(|model| model.name)
        .collect())
}

/// Models whose most recent history entry is not active.
pub fn pending_updates<A: ApiQuery + ?Sized>(api: &A) -> Result<Vec<Model>> {
    Ok(fetch_models(api)?
        .into_iter()
        .filter(Model::has_pending_update)
        .collect())
}

/// Pending models whose previous version was edited by a person, so that an
/// update would not discard custom changes.
pub fn updatable<A: ApiQuery + ?Sized>(api: &A) -> Result<Vec<String>> {
    Ok(pending_updates(api)?
        .into_iter()
        .filter(|model| {
            model
                .history_by_recency()
                .get(1)
                .and_then(|previous| previous.by.as_deref())
                .is_some_and(|by| !SYSTEM_ACTORS.contains(&by))
        })
        .map(|model| model.name)
        .collect())
}

/// One model name per line; blank lines are skipped.
pub fn read_model_names(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("File \"{}\" does not exist", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Set arithmetic between appliance models and a list of names.
pub fn input_diff<A: ApiQuery + ?Sized>(
    api: &A,
    kind: InputDiff,
    filter: &ModelFilter,
    names: &[String],
    range: &DateRange,
) -> Result<Vec<String>> {
    let mut models = filter.apply(fetch_models(api)?);
    if kind == InputDiff::Changed {
        models.retain(|model| {
            model
                .modified
                .as_deref()
                .and_then(timeutils::parse_display)
                .is_some_and(|modified| range.contains(modified))
        });
    }

    let present: BTreeSet<&str> = models.iter().map(|m| m.name.as_str()).collect();
    let listed: BTreeSet<&str> = names.iter().map(String::as_str).collect();
    debug!(present = present.len(), listed = listed.len(), ?kind, "comparing model names");

    let result: Vec<&str> = match kind {
        InputDiff::New => present.difference(&listed).copied().collect(),
        InputDiff::Deleted => listed.difference(&present).copied().collect(),
        InputDiff::Changed => present.intersection(&listed).copied().collect(),
    };
    Ok(result.into_iter().map(str::to_string).collect())
}

/// Every history entry of every model, ordered by pid then `modified`.
pub fn history_report<A: ApiQuery + ?Sized>(api: &A, active_only: bool) -> Result<ReportTable> {
    let filter = ModelFilter {
        enhanced_only: false,
        active_only,
    };
    let models = filter.apply(fetch_models(api)?);

    let mut entries: Vec<(&Model, &types::HistoryEntry)> = models
        .iter()
        .flat_map(|model| model.history.iter().map(move |entry| (model, entry)))
        .collect();
    entries.sort_by(|a, b| {
        a.0.pid
            .cmp(&b.0.pid)
            .then_with(|| a.1.modified.cmp(&b.1.modified))
    });

    let mut table = ReportTable::new(
        "row",
        &[
            "pid",
            "name",
            "active",
            "modified",
            "created",
            "by",
            "message",
            "description",
            "tags",
            "phid",
        ],
    );
    for (row, (model, entry)) in entries.into_iter().enumerate() {
        let extra = |key: &str| entry.extra.get(key).cloned().unwrap_or(Value::Null);
        table.push(
            row,
            vec![
                Value::from(model.pid),
                Value::from(model.name.clone()),
                Value::from(entry.active),
                Value::from(entry.modified.clone()),
                extra("created"),
                entry.by.clone().map(Value::from).unwrap_or(Value::Null),
                extra("message"),
                model.extra.get("description").cloned().unwrap_or(Value::Null),
                Value::from(model.tags.join(", ")),
                Value::from(entry.phid),
            ],
        );
    }
    Ok(table)
}

/// Breach and acknowledgement counts per model name.
pub fn breach_summary<A: ApiQuery + ?Sized>(api: &A, range: &DateRange) -> Result<ReportTable> {
    let found = breaches::fetch_breaches(api, range)?;

    let mut counts: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    for breach in &found {
        let Some(name) = breach.pointer("/model/name").and_then(Value::as_str) else {
            continue;
        };
        let entry = counts.entry(name.to_string()).or_default();
        entry.0 += 1;
        if breaches::is_acknowledged(breach) {
            entry.1 += 1;
        }
    }

    let mut table = ReportTable::new("model.name", &["nr_of_breaches", "nr_of_acknowledged"]);
    for (name, (total, acknowledged)) in counts {
        table.push(name, vec![Value::from(total), Value::from(acknowledged)]);
    }
    Ok(table)
}
