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

//! Rendering of command results: JSON, tables, log lines and CEF.

use anyhow::{Context, Result, anyhow, bail};
use clap::ValueEnum;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

use crate::cef::Cef;

const GENERIC_CEF_NAME: &str = "Record";

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
    Log,
    Cef,
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("No output to write or display")]
    Empty,
    #[error("Nested objects are not supported in log output")]
    Nested,
}

#[derive(Clone, Debug, Default)]
pub struct RenderOpts {
    pub columns_override: Option<Vec<String>>,
    pub sort_by: Option<String>,
    pub filter: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Output {
    pub format: OutputFormat,
    pub outfile: Option<PathBuf>,
    pub render: RenderOpts,
}

impl Output {
    pub fn emit_serialized<T: Serialize>(&self, data: &T, columns: Option<&[&str]>) -> Result<()> {
        let value = serde_json::to_value(data).context("serializing output")?;
        self.emit(&value, columns, None)
    }

    /// `cef` names the event class for commands with a CEF field mapping;
    /// other records are written with numbered custom fields.
    pub fn emit(&self, value: &Value, columns: Option<&[&str]>, cef: Option<&Cef>) -> Result<()> {
        if is_empty_output(value) {
            return Err(OutputError::Empty.into());
        }

        match self.format {
            OutputFormat::Json => match &self.outfile {
                Some(path) => {
                    let rendered = to_indented_json(&sort_keys(value))?;
                    fs::write(path, rendered).with_context(|| format!("writing {}", path.display()))
                }
                None => {
                    println!("{}", to_indented_json(value)?);
                    Ok(())
                }
            },
            OutputFormat::Table => {
                let rendered = match render_table(value, columns, &self.render) {
                    Some(table) => table,
                    None => to_indented_json(value)?,
                };
                self.write_text(&rendered)
            }
            OutputFormat::Log => {
                let lines = convert_json_to_log_lines(value, "timestamp", "system")?;
                self.write_lines(&lines)
            }
            OutputFormat::Cef => {
                let lines = match cef {
                    Some(cef) => cef.generate_logs(value)?,
                    None => Cef::new(0, GENERIC_CEF_NAME).generate_custom_logs(value)?,
                };
                self.write_lines(&lines)
            }
        }
    }

    fn write_text(&self, text: &str) -> Result<()> {
        match &self.outfile {
            Some(path) => {
                fs::write(path, text).with_context(|| format!("writing {}", path.display()))
            }
            None => {
                print!("{text}");
                if !text.ends_with('\n') {
                    println!();
                }
                Ok(())
            }
        }
    }

    fn write_lines(&self, lines: &[String]) -> Result<()> {
        let mut text = lines.join("\n");
        text.push('\n');
        self.write_text(&text)
    }
}

pub fn is_empty_output(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

pub fn to_indented_json(value: &Value) -> Result<String> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    value
        .serialize(&mut serializer)
        .context("serializing JSON")?;
    String::from_utf8(buffer).context("JSON output is not UTF-8")
}

/// Copy of `value` with every object's keys in ascending order.
pub fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// `[timestamp] system key=<json> ...` for each flat record.
pub fn convert_json_to_log_lines(
    output: &Value,
    timestamp_key: &str,
    system_key: &str,
) -> Result<Vec<String>> {
    let Value::Array(records) = output else {
        bail!("log output needs a list of records");
    };

    records
        .iter()
        .map(|record| {
            let Value::Object(map) = record else {
                bail!("log output needs a list of flat objects");
            };
            log_line(map, timestamp_key, system_key)
        })
        .collect()
}

fn log_line(record: &Map<String, Value>, timestamp_key: &str, system_key: &str) -> Result<String> {
    let timestamp = record
        .get(timestamp_key)
        .map(value_to_str)
        .ok_or_else(|| anyhow!("record has no `{timestamp_key}` field"))?;
    let system = record
        .get(system_key)
        .map(value_to_str)
        .ok_or_else(|| anyhow!("record has no `{system_key}` field"))?;

    let mut line = format!("[{timestamp}] {system}");
    for (key, value) in record {
        if key == timestamp_key || key == system_key {
            continue;
        }
        if value.is_array() || value.is_object() {
            return Err(OutputError::Nested.into());
        }
        let _ = write!(line, " {key}={value}");
    }
    Ok(line)
}

/// Comma separated tag names, or `None` for an empty or missing list.
pub fn join_tags(value: Option<&Value>) -> Option<String> {
    let items = value?.as_array()?;
    if items.is_empty() {
        return None;
    }
    Some(
        items
            .iter()
            .map(value_to_str)
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Renders an array of objects as an aligned text table. Returns `None`
/// when the value is not tabular.
pub fn render_table(
    json: &Value,
    columns_hint: Option<&[&str]>,
    render_opts: &RenderOpts,
) -> Option<String> {
    let rows = match json {
        Value::Array(arr) => arr,
        _ => return None,
    };

    if rows.is_empty() {
        return Some("No resources found.\n".to_string());
    }

    let first_obj = match &rows[0] {
        Value::Object(map) => map,
        _ => return None,
    };

    let present = |key: &str| {
        rows.iter()
            .any(|row| row.get(key).map(is_non_empty).unwrap_or(false))
    };

    let mut columns: Vec<String> = Vec::new();

    if let Some(override_cols) = &render_opts.columns_override {
        columns.extend(override_cols.iter().filter(|key| present(key)).cloned());
    }

    if columns.is_empty()
        && let Some(hint) = columns_hint
    {
        columns.extend(hint.iter().filter(|key| present(key)).map(|key| key.to_string()));
    }

    if columns.is_empty() {
        // first eight keys of the first row that carry a value somewhere
        columns.extend(first_obj.keys().filter(|key| present(key)).take(8).cloned());
    }

    if columns.is_empty() {
        return None;
    }

    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    let mut table: Vec<Vec<String>> = Vec::new();
    let needle = render_opts.filter.as_ref().map(|f| f.to_lowercase());

    for row in rows {
        let Value::Object(map) = row else {
            continue;
        };
        let out_row: Vec<String> = columns
            .iter()
            .map(|col| value_to_str(map.get(col).unwrap_or(&Value::Null)))
            .collect();
        if let Some(needle) = &needle
            && !out_row
                .iter()
                .any(|cell| cell.to_lowercase().contains(needle))
        {
            continue;
        }
        for (idx, cell) in out_row.iter().enumerate() {
            widths[idx] = widths[idx].max(cell.chars().count());
        }
        table.push(out_row);
    }

    if table.is_empty() {
        return Some("No resources found.\n".to_string());
    }

    if let Some(sort) = &render_opts.sort_by
        && let Some(idx) = columns.iter().position(|c| c == sort)
    {
        table.sort_by(|a, b| a[idx].cmp(&b[idx]));
    }

    let mut out = String::new();
    push_row(&mut out, &columns, &widths);
    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    push_row(&mut out, &separator, &widths);
    for row in &table {
        push_row(&mut out, row, &widths);
    }
    Some(out)
}

fn push_row(out: &mut String, cells: &[String], widths: &[usize]) {
    let line: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:width$}", cell, width = *width))
        .collect();
    out.push_str(line.join("  ").trim_end());
    out.push('\n');
}

pub fn value_to_str(value: &Value) -> String {
    match value {
        Value::Null => "".into(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(_) => true,
        Value::Number(_) => true,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(arr) => !arr.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
