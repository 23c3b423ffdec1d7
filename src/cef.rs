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

//! Common Event Format lines for system monitoring records.

use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDateTime;
use serde_json::{Map, Value};

use crate::timeutils::RECORD_TIMESTAMP_FORMAT;

const VERSION: u8 = 0;
const VENDOR: &str = "Darktrace";
const PRODUCT: &str = "DCIP System Monitoring";
const DEVICE_VERSION: &str = "1.0";
const END_FORMAT: &str = "%b %d %Y %H:%M:%S";

pub const DEFAULT_SEVERITY: u8 = 3;

/// Record keys and the CEF extension fields they land in, per event name.
/// Fields named `...Label` also carry the record key as their label.
fn mapping(name: &str) -> Option<&'static [(&'static str, &'static str)]> {
    match name {
        "System Usage" => Some(&[
            ("type", "cs1Label"),
            ("label", "cs2Label"),
            ("bandwidth", "in"),
            ("memused", "cn1Label"),
            ("connectionsPerMinuteCurrent", "cn2Label"),
            ("cpu", "cn3Label"),
            ("dtqueue", "flexNumber1Label"),
        ]),
        "Packet Loss" => Some(&[
            ("packet_loss", "cfp1Label"),
            ("worker_drop_rate", "cfp2Label"),
        ]),
        "DHCP Quality" => Some(&[
            ("subnets_tracking_dhcp", "cn1Label"),
            ("total_dhcp_quality", "cn2Label"),
            ("average_dhcp_quality", "cn3Label"),
        ]),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cef {
    pub device_event_class_id: u32,
    pub name: String,
    pub severity: u8,
}

impl Cef {
    pub fn new(device_event_class_id: u32, name: &str) -> Self {
        Self::with_severity(device_event_class_id, name, DEFAULT_SEVERITY)
    }

    pub fn with_severity(device_event_class_id: u32, name: &str, severity: u8) -> Self {
        Self {
            device_event_class_id,
            name: name.to_string(),
            severity,
        }
    }

    pub fn generate_log_line(
        &self,
        record: &Map<String, Value>,
        timestamp_key: &str,
        system_key: &str,
    ) -> Result<String> {
        let fields = mapping(&self.name)
            .ok_or_else(|| anyhow!("no CEF field mapping for `{}`", self.name))?;

        let raw_timestamp = record
            .get(timestamp_key)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("record has no `{timestamp_key}` timestamp"))?;
        let timestamp = NaiveDateTime::parse_from_str(raw_timestamp, RECORD_TIMESTAMP_FORMAT)
            .with_context(|| format!("parsing timestamp `{raw_timestamp}`"))?;
        let system = record
            .get(system_key)
            .map(plain_text)
            .ok_or_else(|| anyhow!("record has no `{system_key}` field"))?;

        let mut parts = vec![format!(
            "CEF:{VERSION}|{VENDOR}|{PRODUCT}|{DEVICE_VERSION}|{}|{}|{}|end={} deviceExternalId={}",
            self.device_event_class_id,
            self.name,
            self.severity,
            timestamp.format(END_FORMAT),
            system
        )];
        if let Some(ip) = record.get("ip").filter(|ip| is_truthy(ip)) {
            parts.push(format!("dvc={}", plain_text(ip)));
        }

        for (key, value) in record {
            if key == timestamp_key || key == system_key || key == "ip" {
                continue;
            }
            let Some((_, field)) = fields.iter().find(|(name, _)| name == key) else {
                continue;
            };
            if field.contains("Label") {
                parts.push(format!("{field}={key}"));
            }
            parts.push(format!(
                "{}={}",
                field.replace("Label", ""),
                escape(&plain_text(value))
            ));
        }

        Ok(parts.join(" "))
    }

    pub fn generate_logs(&self, records: &Value) -> Result<Vec<String>> {
        let Value::Array(items) = records else {
            bail!("CEF output needs a list of records");
        };
        items
            .iter()
            .map(|item| match item {
                Value::Object(record) => self.generate_log_line(record, "timestamp", "system"),
                _ => bail!("CEF output needs a list of flat objects"),
            })
            .collect()
    }

    /// Lines for records without a named mapping: every field becomes a
    /// numbered custom field.
    pub fn generate_custom_logs(&self, records: &Value) -> Result<Vec<String>> {
        let Value::Array(items) = records else {
            bail!("CEF output needs a list of records");
        };
        items
            .iter()
            .map(|item| match item {
                Value::Object(record) => Ok(format!(
                    "CEF:{VERSION}|{VENDOR}|{PRODUCT}|{DEVICE_VERSION}|{}|{}|{}|{}",
                    self.device_event_class_id,
                    self.name,
                    self.severity,
                    convert_to_custom_cef_fields(record)?
                )),
                _ => bail!("CEF output needs a list of flat objects"),
            })
            .collect()
    }
}

/// Extension string using numbered device custom fields: strings as `csN`,
/// floats as `cfN`, integers and booleans as `cnN`. Nulls are skipped.
pub fn convert_to_custom_cef_fields(record: &Map<String, Value>) -> Result<String> {
    let (mut strings, mut floats, mut numbers) = (0, 0, 0);
    let mut parts = Vec::new();

    for (key, value) in record {
        let key = escape(key);
        let (prefix, counter) = match value {
            Value::Array(_) | Value::Object(_) => bail!("Nested objects are not supported"),
            Value::Null => continue,
            Value::String(_) => ("cs", &mut strings),
            Value::Number(n) if n.is_f64() => ("cf", &mut floats),
            Value::Number(_) | Value::Bool(_) => ("cn", &mut numbers),
        };
        *counter += 1;
        parts.push(format!(
            "{prefix}{n}Label={key} {prefix}{n}={}",
            escape(&plain_text(value)),
            n = *counter
        ));
    }

    Ok(parts.join(" "))
}

pub fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('=', "\\=")
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_defaults_to_severity_three() {
        let cef = Cef::new(1, "name");
        assert_eq!(cef.severity, 3);
        assert_eq!(Cef::with_severity(1, "name", 5).severity, 5);
    }

    #[test]
    fn test_escapes_backslash_and_equals() {
        assert_eq!(escape("test"), "test");
        assert_eq!(escape("test=test"), r"test\=test");
        assert_eq!(escape(r"test\test"), r"test\\test");
    }

    #[test]
    fn test_generates_system_usage_line() {
        let cef = Cef::new(100, "System Usage");
        let records = json!([{
            "system": "system1",
            "ip": "10.0.0.1",
            "type": "master",
            "timestamp": "2019-01-01T01:01:01",
            "label": "Master machine",
            "bandwidth": 1000000000,
            "memused": 10,
            "connectionsPerMinuteCurrent": 1000,
            "cpu": 10,
            "unmapped": "ignored"
        }]);

        let lines = cef.generate_logs(&records).unwrap();
        assert_eq!(
            lines[0],
            "CEF:0|Darktrace|DCIP System Monitoring|1.0|100|System Usage|3|\
             end=Jan 01 2019 01:01:01 deviceExternalId=system1 dvc=10.0.0.1 \
             cs1Label=type cs1=master cs2Label=label cs2=Master machine in=1000000000 \
             cn1Label=memused cn1=10 cn2Label=connectionsPerMinuteCurrent cn2=1000 \
             cn3Label=cpu cn3=10"
        );
    }

    #[test]
    fn test_rejects_unknown_names_and_non_lists() {
        let record = object(json!({"system": "s", "timestamp": "2019-01-01T00:00:00"}));
        assert!(
            Cef::new(1, "Unknown")
                .generate_log_line(&record, "timestamp", "system")
                .is_err()
        );
        assert!(Cef::new(1, "DHCP Quality").generate_logs(&json!("Not a list")).is_err());
    }

    #[test]
    fn test_converts_to_custom_fields() {
        let record = object(json!({
            "system": "system1",
            "ip": "10.0.0.1",
            "timestamp": "2019-01-01T00:00:01",
            "key1": "value1",
            "key2": 2,
            "key3": 2.5
        }));
        assert_eq!(
            convert_to_custom_cef_fields(&record).unwrap(),
            "cs1Label=system cs1=system1 cs2Label=ip cs2=10.0.0.1 cs3Label=timestamp \
             cs3=2019-01-01T00:00:01 cs4Label=key1 cs4=value1 cn1Label=key2 cn1=2 \
             cf1Label=key3 cf1=2.5"
        );

        let lines = Cef::new(0, "Record")
            .generate_custom_logs(&json!([{"name": "a=b", "count": 2}]))
            .unwrap();
        assert_eq!(
            lines,
            vec![r"CEF:0|Darktrace|DCIP System Monitoring|1.0|0|Record|3|cs1Label=name cs1=a\=b cn1Label=count cn1=2"]
        );

        let nested = object(json!({"key1": [1, 2, 3]}));
        assert!(convert_to_custom_cef_fields(&nested).is_err());
    }
}
