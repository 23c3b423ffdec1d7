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

//! Model breach listings and breach reports.

use anyhow::Result;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use crate::client::{ApiQuery, expect_array, expect_object};
use crate::output::join_tags;
use crate::report::ReportTable;
use crate::timeutils::{DateRange, format_epoch_millis};

const DESTINATION_FILTERS: [&str; 2] = ["Connection hostname", "Destination IP"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachList {
    All,
    Acknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachReport {
    Brief,
    Commented,
    Acknowledged,
}

impl BreachReport {
    pub fn name(self) -> &'static str {
        match self {
            BreachReport::Brief => "brief",
            BreachReport::Commented => "commented",
            BreachReport::Acknowledged => "acknowledged",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub label: String,
    pub region: Option<String>,
}

/// All breaches in the range, acknowledged ones included.
pub fn fetch_breaches<A: ApiQuery + ?Sized>(api: &A, range: &DateRange) -> Result<Vec<Value>> {
    let [start, end] = range.query();
    let query = [
        start,
        end,
        ("includeacknowledged", "true".to_string()),
        ("historicmodelonly", "true".to_string()),
        ("minimal", "false".to_string()),
        ("includebreachurl", "true".to_string()),
    ];
    expect_array(api.get("/modelbreaches", &query)?, "/modelbreaches")
}

pub fn list_breaches<A: ApiQuery + ?Sized>(
    api: &A,
    which: BreachList,
    range: &DateRange,
) -> Result<Vec<Value>> {
    let breaches = fetch_breaches(api, range)?;
    Ok(match which {
        BreachList::All => breaches,
        BreachList::Acknowledged => breaches.into_iter().filter(is_acknowledged).collect(),
    })
}

/// `acknowledged` is `false` or an object describing who acknowledged.
pub fn is_acknowledged(breach: &Value) -> bool {
    match breach.get("acknowledged") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Number(n)) => n.as_f64() != Some(0.0),
        Some(Value::Bool(true)) => true,
    }
}

pub fn report<A: ApiQuery + ?Sized>(
    api: &A,
    kind: BreachReport,
    range: &DateRange,
    host: &str,
) -> Result<ReportTable> {
    match kind {
        BreachReport::Brief => brief_report(api, range),
        BreachReport::Commented => commented_report(api, range, host),
        BreachReport::Acknowledged => acknowledged_report(api, range, host),
    }
}

/// Instance id to label and region, from `/status`.
pub fn instance_regions<A: ApiQuery + ?Sized>(api: &A) -> Result<HashMap<i64, Instance>> {
    let status = expect_object(api.get("/status", &[])?, "/status")?;
    let mut instances = HashMap::new();
    if let Some(Value::Object(found)) = status.get("instances") {
        for values in found.values() {
            let Some(id) = values.get("id").and_then(Value::as_i64) else {
                continue;
            };
            let label = values
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let region = label
                .split_once('-')
                .map(|(region, _)| region.trim().to_string());
            instances.insert(id, Instance { label, region });
        }
    }
    Ok(instances)
}

/// Breach ids start with the id of the instance that raised them.
pub fn instance_id(pbid: &Value) -> Option<i64> {
    let text = match pbid {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.trim_matches('-')
        .chars()
        .next()
        .and_then(|c| c.to_digit(10))
        .map(i64::from)
}

fn region_of(breach: &Value, instances: &HashMap<i64, Instance>) -> Value {
    breach
        .get("pbid")
        .and_then(instance_id)
        .and_then(|id| instances.get(&id))
        .and_then(|instance| instance.region.clone())
        .map(Value::from)
        .unwrap_or(Value::Null)
}

fn triggered_components(breach: &Value) -> &[Value] {
    breach
        .get("triggeredComponents")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// First device hostname, else its ip, else `Unknown`.
pub fn hostname_or_ip(components: &[Value]) -> String {
    for record in components {
        let Some(device) = record.get("device") else {
            continue;
        };
        for key in ["hostname", "ip"] {
            if let Some(found) = device.get(key).and_then(Value::as_str)
                && !found.is_empty()
            {
                return found.to_string();
            }
        }
    }
    "Unknown".to_string()
}

/// Last non-empty display filter naming a hostname or destination ip. A
/// display `Message` filter is used when none is found.
pub fn destination(components: &[Value]) -> String {
    let mut destination = String::new();
    for record in components {
        let Some(triggers) = record.get("triggeredFilters").and_then(Value::as_array) else {
            continue;
        };
        for trigger in triggers {
            let filter_type = trigger.get("filterType").and_then(Value::as_str);
            let is_display = trigger.get("comparatorType").and_then(Value::as_str) == Some("display");
            let value = trigger
                .pointer("/trigger/value")
                .and_then(Value::as_str)
                .unwrap_or_default();

            if is_display
                && filter_type.is_some_and(|t| DESTINATION_FILTERS.contains(&t))
                && !value.is_empty()
            {
                destination = value.to_string();
            }
            if destination.is_empty() && is_display && filter_type == Some("Message") {
                destination = value.to_string();
            }
        }
    }
    destination
}

/// Distinct values of one device field across the triggered components.
pub fn device_info(components: &[Value], field: &str) -> String {
    let values: BTreeSet<String> = components
        .iter()
        .filter_map(|component| component.get("device"))
        .filter_map(|device| device.get(field))
        .filter(|value| !value.is_null())
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    values.into_iter().collect::<Vec<_>>().join(", ")
}

fn device_cells(breach: &Value) -> Vec<Value> {
    let components = triggered_components(breach);
    ["did", "macaddress", "ip", "hostname", "typelabel"]
        .iter()
        .map(|field| Value::from(device_info(components, field)))
        .collect()
}

fn breach_time(breach: &Value, pointer: &str) -> Value {
    breach
        .pointer(pointer)
        .and_then(Value::as_i64)
        .map(|millis| Value::from(format_epoch_millis(millis)))
        .unwrap_or(Value::Null)
}

fn breach_key(breach: &Value) -> String {
    match breach.get("pbid") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn link(host: &str, pbid: &str) -> String {
    format!("{}/#modelbreach/{pbid}", host.trim_end_matches('/'))
}

fn model_tags(breach: &Value) -> Value {
    join_tags(breach.pointer("/model/tags"))
        .map(Value::from)
        .unwrap_or(Value::Null)
}

fn text_at(breach: &Value, pointer: &str) -> Value {
    breach.pointer(pointer).cloned().unwrap_or(Value::Null)
}

fn brief_report<A: ApiQuery + ?Sized>(api: &A, range: &DateRange) -> Result<ReportTable> {
    let instances = instance_regions(api)?;
    let breaches = fetch_breaches(api, range)?;

    let mut table = ReportTable::new(
        "breach_id",
        &[
            "region",
            "hostname",
            "model_name",
            "score",
            "category",
            "enhanced",
            "acknowledged",
            "tags",
            "time",
        ],
    );
    for breach in &breaches {
        let model_name = breach
            .pointer("/model/name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let category = model_name.split("::").next().unwrap_or_default();
        let enhanced = breach
            .pointer("/model/tags")
            .and_then(Value::as_array)
            .is_some_and(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .any(|tag| tag.to_lowercase().contains("enhanced"))
            });

        table.push(
            breach_key(breach),
            vec![
                region_of(breach, &instances),
                Value::from(hostname_or_ip(triggered_components(breach))),
                Value::from(model_name),
                text_at(breach, "/score"),
                Value::from(category),
                Value::from(u8::from(enhanced)),
                Value::from(u8::from(is_acknowledged(breach))),
                model_tags(breach),
                breach_time(breach, "/time"),
            ],
        );
    }
    Ok(table)
}

/// `username:message` lines for one breach.
pub fn breach_comments<A: ApiQuery + ?Sized>(api: &A, pbid: &str) -> Result<String> {
    let comments = expect_array(
        api.get("/mbcomments", &[("pbid", pbid.to_string())])?,
        "/mbcomments",
    )?;
    Ok(comments
        .iter()
        .map(|comment| {
            format!(
                "{}:{}\n",
                comment.get("username").and_then(Value::as_str).unwrap_or_default(),
                comment.get("message").and_then(Value::as_str).unwrap_or_default()
            )
        })
        .collect())
}

fn acknowledged_report<A: ApiQuery + ?Sized>(
    api: &A,
    range: &DateRange,
    host: &str,
) -> Result<ReportTable> {
    let instances = instance_regions(api)?;
    let breaches = list_breaches(api, BreachList::Acknowledged, range)?;

    let mut table = ReportTable::new(
        "breach_id",
        &[
            "model_name",
            "breach_time",
            "device_id",
            "mac_address",
            "ip_address",
            "hostname",
            "type",
            "destination",
            "acknowledged_by",
            "comment",
            "comments",
            "acknowledged_time",
            "score",
            "tags",
            "link",
            "region",
        ],
    );
    for breach in &breaches {
        let pbid = breach_key(breach);
        let mut cells = vec![text_at(breach, "/model/name"), breach_time(breach, "/time")];
        cells.extend(device_cells(breach));
        cells.extend([
            Value::from(destination(triggered_components(breach))),
            text_at(breach, "/acknowledged/username"),
            Value::from(breach_comments(api, &pbid)?),
            text_at(breach, "/commentCount"),
            breach_time(breach, "/acknowledged/time"),
            text_at(breach, "/score"),
            model_tags(breach),
            Value::from(link(host, &pbid)),
            region_of(breach, &instances),
        ]);
        table.push(pbid, cells);
    }
    table.sort_by_column("breach_time");
    Ok(table)
}

struct CommentThread {
    model_name: Value,
    first_comment_by: Value,
    lines: Vec<String>,
}

fn commented_report<A: ApiQuery + ?Sized>(
    api: &A,
    range: &DateRange,
    host: &str,
) -> Result<ReportTable> {
    let mut comments = expect_array(api.get("/mbcomments", &range.query())?, "/mbcomments")?;
    comments.sort_by_key(|comment| comment.get("time").and_then(Value::as_i64).unwrap_or_default());

    let mut threads: BTreeMap<i64, CommentThread> = BTreeMap::new();
    for comment in &comments {
        let Some(pbid) = comment.get("pbid").and_then(Value::as_i64) else {
            continue;
        };
        let username = comment.get("username").and_then(Value::as_str).unwrap_or_default();
        let message = comment.get("message").and_then(Value::as_str).unwrap_or_default();
        let thread = threads.entry(pbid).or_insert_with(|| CommentThread {
            model_name: text_at(comment, "/name"),
            first_comment_by: Value::from(username),
            lines: Vec::new(),
        });
        thread.lines.push(format!("{username}: {message}"));
    }

    let mut table = ReportTable::new(
        "breach_id",
        &[
            "model_name",
            "breach_time",
            "device_id",
            "mac_address",
            "ip_address",
            "hostname",
            "type",
            "first_comment_by",
            "comments",
            "link",
        ],
    );

    let total = threads.len();
    for (count, (pbid, thread)) in threads.into_iter().enumerate() {
        let response = api.get(
            "/modelbreaches",
            &[("pbid", pbid.to_string()), ("historicmodelonly", "true".to_string())],
        )?;
        info!(
            "{} out of {total} breaches ({}%) done",
            count + 1,
            ((count + 1) * 100) / total
        );

        let breach = match response {
            Value::Array(items) if items.is_empty() => {
                debug!(pbid, "no breach found for commented pbid");
                None
            }
            Value::Array(mut items) => Some(items.remove(0)),
            other => Some(other),
        };

        let mut cells = vec![thread.model_name];
        match &breach {
            Some(breach) => {
                cells.push(breach_time(breach, "/time"));
                cells.extend(device_cells(breach));
            }
            None => cells.extend(std::iter::repeat_n(Value::Null, 6)),
        }
        cells.extend([
            thread.first_comment_by,
            Value::from(thread.lines.join("\n")),
            breach
                .as_ref()
                .map(|_| Value::from(link(host, &pbid.to_string())))
                .unwrap_or(Value::Null),
        ]);
        table.push(pbid, cells);
    }
    table.sort_by_column("breach_time");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;
    use crate::timeutils::determine_date_range;
    use chrono::NaiveDate;
    use serde_json::json;

    fn range() -> DateRange {
        determine_date_range(7, None, None, NaiveDate::from_ymd_opt(2019, 1, 8).unwrap()).unwrap()
    }

    fn status() -> Value {
        json!({"instances": {
            "1": {"id": 1, "label": "EU - Amsterdam"},
            "2": {"id": 2, "label": "Lab"}
        }})
    }

    fn breaches() -> Value {
        json!([
            {
                "pbid": 1001, "time": 1546304461000_i64, "score": 0.8, "commentCount": 1,
                "acknowledged": {"username": "alice", "time": 1546304521000_i64},
                "model": {"name": "Device::Enhanced Scan", "tags": ["Enhanced Monitoring"]},
                "triggeredComponents": [{
                    "device": {"did": 7, "ip": "10.0.0.7", "macaddress": "aa:bb", "typelabel": "Desktop"},
                    "triggeredFilters": [
                        {"filterType": "Message", "comparatorType": "display", "trigger": {"value": "hello"}},
                        {"filterType": "Destination IP", "comparatorType": "display", "trigger": {"value": "8.8.8.8"}}
                    ]
                }]
            },
            {
                "pbid": 2002, "time": 1546300000000_i64, "score": 0.3,
                "acknowledged": false,
                "model": {"name": "Compliance::Tor", "tags": []},
                "triggeredComponents": [{"device": {"did": 9, "hostname": "", "ip": "10.0.0.9"}}]
            }
        ])
    }

    #[test]
    fn test_lists_acknowledged_only() {
        let api = FakeApi::new().on("/modelbreaches", breaches());
        assert_eq!(list_breaches(&api, BreachList::All, &range()).unwrap().len(), 2);
        let acknowledged = list_breaches(&api, BreachList::Acknowledged, &range()).unwrap();
        assert_eq!(acknowledged.len(), 1);
        assert_eq!(acknowledged[0]["pbid"], 1001);
        assert!(api.calls.borrow()[0].contains("includeacknowledged=true"));
    }

    #[test]
    fn test_derives_regions_from_instance_labels() {
        let api = FakeApi::new().on("/status", status());
        let regions = instance_regions(&api).unwrap();
        assert_eq!(regions[&1].region.as_deref(), Some("EU"));
        assert_eq!(regions[&2].region, None);
        assert_eq!(instance_id(&json!(2002)), Some(2));
        assert_eq!(instance_id(&json!("-1234")), Some(1));
    }

    #[test]
    fn test_picks_hostnames_and_destinations() {
        assert_eq!(
            hostname_or_ip(&[json!({"device": {"hostname": "", "ip": "10.0.0.9"}})]),
            "10.0.0.9"
        );
        assert_eq!(hostname_or_ip(&[json!({"other": 1})]), "Unknown");

        let message_only = [json!({"triggeredFilters": [
            {"filterType": "Message", "comparatorType": "display", "trigger": {"value": "note"}},
            {"filterType": "Connection hostname", "comparatorType": "display", "trigger": {"value": ""}}
        ]})];
        assert_eq!(destination(&message_only), "note");

        let breaches = breaches();
        assert_eq!(destination(triggered_components(&breaches[0])), "8.8.8.8");
    }

    #[test]
    fn test_brief_report_rows() {
        let api = FakeApi::new()
            .on("/status", status())
            .on("/modelbreaches", breaches());
        let table = report(&api, BreachReport::Brief, &range(), "https://dt").unwrap();
        assert_eq!(table.index_name, "breach_id");
        assert_eq!(table.rows[0].key, "1001");
        assert_eq!(
            table.rows[0].cells,
            vec![
                json!("EU"),
                json!("10.0.0.7"),
                json!("Device::Enhanced Scan"),
                json!(0.8),
                json!("Device"),
                json!(1),
                json!(1),
                json!("Enhanced Monitoring"),
                json!("2019-01-01 01:01:01"),
            ]
        );
        assert_eq!(table.rows[1].cells[0], Value::Null);
        assert_eq!(table.rows[1].cells[7], Value::Null);
    }

    #[test]
    fn test_acknowledged_report_collects_comments() {
        let api = FakeApi::new()
            .on("/status", status())
            .on("/modelbreaches", breaches())
            .on("/mbcomments", json!([{"username": "alice", "message": "benign"}]));
        let table = report(&api, BreachReport::Acknowledged, &range(), "https://dt/").unwrap();
        assert_eq!(table.rows.len(), 1);
        let cells = &table.rows[0].cells;
        assert_eq!(cells[2], json!("7"));
        assert_eq!(cells[7], json!("8.8.8.8"));
        assert_eq!(cells[8], json!("alice"));
        assert_eq!(cells[9], json!("alice:benign\n"));
        assert_eq!(cells[11], json!("2019-01-01 01:02:01"));
        assert_eq!(cells[14], json!("https://dt/#modelbreach/1001"));
        assert_eq!(cells[15], json!("EU"));
    }

    #[test]
    fn test_commented_report_groups_by_breach() {
        let api = FakeApi::new()
            .on(
                "/mbcomments",
                json!([
                    {"pbid": 1001, "time": 20, "username": "bob", "message": "second", "name": "Device::Enhanced Scan"},
                    {"pbid": 1001, "time": 10, "username": "alice", "message": "first", "name": "Device::Enhanced Scan"},
                    {"pbid": 3003, "time": 5, "username": "carol", "message": "gone", "name": "Old"}
                ]),
            )
            .on_query(
                "/modelbreaches",
                &[("pbid", "1001"), ("historicmodelonly", "true")],
                breaches()[0].clone(),
            )
            .on_query(
                "/modelbreaches",
                &[("pbid", "3003"), ("historicmodelonly", "true")],
                json!([]),
            );
        let table = report(&api, BreachReport::Commented, &range(), "https://dt").unwrap();
        assert_eq!(table.rows.len(), 2);

        let found = table.rows.iter().find(|row| row.key == "1001").unwrap();
        assert_eq!(found.cells[0], json!("Device::Enhanced Scan"));
        assert_eq!(found.cells[7], json!("alice"));
        assert_eq!(found.cells[8], json!("alice: first\nbob: second"));
        assert_eq!(found.cells[9], json!("https://dt/#modelbreach/1001"));

        let missing = table.rows.iter().find(|row| row.key == "3003").unwrap();
        assert_eq!(missing.cells[1], Value::Null);
        assert_eq!(missing.cells[9], Value::Null);
    }
}
