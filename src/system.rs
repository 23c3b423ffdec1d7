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

//! Appliance status, usage and audit information.

use anyhow::Result;
use serde_json::{Map, Value, json};

use crate::client::{ApiQuery, expect_object};
use crate::timeutils::utc_now_timestamp;

pub const MOO: &str = r"
          _________
         < Moooooo >
          ---------
                 \   ^__^
                  \  (oo)\_______
                     (__)\       )\/\/
                         ||----w |
                         ||     ||";

/// The `instances` object of `/status`, keyed by instance name.
pub fn fetch_instances<A: ApiQuery + ?Sized>(api: &A) -> Result<Map<String, Value>> {
    let mut status = expect_object(api.get("/status", &[])?, "/status")?;
    match status.remove("instances") {
        Some(Value::Object(instances)) => Ok(instances),
        _ => Ok(Map::new()),
    }
}

pub fn info<A: ApiQuery + ?Sized>(api: &A) -> Result<Value> {
    api.get("/time", &[])
}

pub fn status<A: ApiQuery + ?Sized>(api: &A) -> Result<Value> {
    api.get("/status", &[])
}

pub fn tags<A: ApiQuery + ?Sized>(api: &A) -> Result<Value> {
    api.get("/tags", &[])
}

pub fn summary_statistics<A: ApiQuery + ?Sized>(api: &A) -> Result<Value> {
    api.get("/summarystatistics", &[])
}

pub fn auditlog<A: ApiQuery + ?Sized>(api: &A, offset: u32, limit: u32) -> Result<Value> {
    api.get(
        "/accountactivity",
        &[("offset", offset.to_string()), ("limit", limit.to_string())],
    )
}

fn field(values: &Value, key: &str) -> Value {
    values.get(key).cloned().unwrap_or(Value::Null)
}

/// Resource usage per instance with its probes nested.
pub fn usage<A: ApiQuery + ?Sized>(api: &A) -> Result<Value> {
    let instances = fetch_instances(api)?;
    let mut usage = Map::new();

    for (name, values) in &instances {
        let mut probes = Map::new();
        if let Some(Value::Object(found)) = values.get("probes") {
            for (probe_name, probe) in found {
                probes.insert(
                    probe_name.clone(),
                    json!({
                        "label": field(probe, "label"),
                        "bandwidthCurrent": field(probe, "bandwidthCurrent"),
                        "memoryUsed": field(probe, "memoryUsed"),
                        "connectionsPerMinuteCurrent": field(probe, "connectionsPerMinuteCurrent"),
                        "cpu": field(probe, "cpu"),
                    }),
                );
            }
        }
        usage.insert(
            name.clone(),
            json!({
                "cpu": field(values, "cpu"),
                "dtqueue": field(values, "darkflowQueue"),
                "memused": field(values, "memoryUsed"),
                "bandwidth": field(values, "bandwidthCurrent"),
                "connectionsPerMinuteCurrent": field(values, "connectionsPerMinuteCurrent"),
                "label": field(values, "label"),
                "probes": probes,
            }),
        );
    }
    Ok(Value::Object(usage))
}

/// Usage flattened to one record per instance and probe, for log and CEF
/// output.
pub fn usage_records<A: ApiQuery + ?Sized>(api: &A) -> Result<Value> {
    Ok(flatten_usage(&usage(api)?, &utc_now_timestamp()))
}

fn flatten_usage(usage: &Value, timestamp: &str) -> Value {
    let mut records = Vec::new();
    let Some(instances) = usage.as_object() else {
        return Value::Array(records);
    };

    for (name, values) in instances {
        records.push(json!({
            "timestamp": timestamp,
            "system": name,
            "type": "master",
            "label": field(values, "label"),
            "bandwidth": field(values, "bandwidth"),
            "memused": field(values, "memused"),
            "connectionsPerMinuteCurrent": field(values, "connectionsPerMinuteCurrent"),
            "cpu": field(values, "cpu"),
            "dtqueue": field(values, "dtqueue"),
        }));
        if let Some(Value::Object(probes)) = values.get("probes") {
            for (probe_name, probe) in probes {
                records.push(json!({
                    "timestamp": timestamp,
                    "system": probe_name,
                    "type": "probe",
                    "label": field(probe, "label"),
                    "bandwidth": field(probe, "bandwidthCurrent"),
                    "memused": field(probe, "memoryUsed"),
                    "connectionsPerMinuteCurrent": field(probe, "connectionsPerMinuteCurrent"),
                    "cpu": field(probe, "cpu"),
                }));
            }
        }
    }
    Value::Array(records)
}

/// Instance ids and labels. The part of a label before `-` is its location.
pub fn instances<A: ApiQuery + ?Sized>(api: &A) -> Result<Value> {
    let found = fetch_instances(api)?;
    let mut instances = Map::new();
    for (name, values) in &found {
        let mut entry = Map::new();
        entry.insert("id".into(), field(values, "id"));
        entry.insert("label".into(), field(values, "label"));
        if let Some((location, _)) = values
            .get("label")
            .and_then(Value::as_str)
            .and_then(|label| label.split_once('-'))
        {
            entry.insert("location".into(), Value::from(location.trim()));
        }
        instances.insert(name.clone(), Value::Object(entry));
    }
    Ok(Value::Object(instances))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cef::Cef;
    use crate::testing::FakeApi;

    fn api() -> FakeApi {
        FakeApi::new().on(
            "/status",
            json!({"instances": {
                "dt-master": {
                    "id": 1, "label": "EU - Master", "cpu": 12, "darkflowQueue": 0,
                    "memoryUsed": 40, "bandwidthCurrent": 1000, "connectionsPerMinuteCurrent": 300,
                    "probes": {
                        "probe-1": {"label": "Probe", "cpu": 3, "memoryUsed": 20,
                                    "bandwidthCurrent": 10, "connectionsPerMinuteCurrent": 5, "version": "4"}
                    }
                },
                "dt-lab": {"id": 2, "label": "Lab"}
            }}),
        )
    }

    #[test]
    fn test_summarizes_usage() {
        let usage = usage(&api()).unwrap();
        assert_eq!(usage["dt-master"]["dtqueue"], 0);
        assert_eq!(usage["dt-master"]["probes"]["probe-1"]["memoryUsed"], 20);
        assert!(usage["dt-master"]["probes"]["probe-1"].get("version").is_none());
        assert_eq!(usage["dt-lab"]["cpu"], Value::Null);
    }

    #[test]
    fn test_flattened_usage_renders_as_cef() {
        let records = flatten_usage(&usage(&api()).unwrap(), "2019-01-01T01:01:01");
        let items = records.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1]["system"], "probe-1");
        assert_eq!(items[1]["type"], "probe");

        let lines = Cef::new(100, "System Usage").generate_logs(&records).unwrap();
        assert!(lines[0].contains("deviceExternalId=dt-master"));
        assert!(lines[0].contains("flexNumber1Label=dtqueue flexNumber1=0"));
    }

    #[test]
    fn test_instances_carry_locations() {
        let instances = instances(&api()).unwrap();
        assert_eq!(instances["dt-master"], json!({"id": 1, "label": "EU - Master", "location": "EU"}));
        assert_eq!(instances["dt-lab"], json!({"id": 2, "label": "Lab"}));
    }

    #[test]
    fn test_auditlog_pages() {
        let api = FakeApi::new().on("/accountactivity", json!([]));
        auditlog(&api, 30, 10).unwrap();
        assert_eq!(api.calls.borrow()[0], "/accountactivity?offset=30&limit=10");
    }
}
