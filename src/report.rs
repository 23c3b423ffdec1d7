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

//! Tabular reports written as XLSX or CSV.
//!
//! An XLSX report may start from a template workbook whose `RawData` sheet
//! has the same columns. New rows are appended to that sheet and the rest of
//! the workbook (pivots, charts, other sheets) is kept.

use anyhow::{Context, Result, anyhow};
use rust_xlsxwriter::{Format, Table, TableColumn, TableStyle, Workbook};
use umya_spreadsheet::Worksheet;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

pub const RAW_DATA_SHEET: &str = "RawData";
pub const TABLE_NAME: &str = "RawDataTable";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Xlsx,
    Csv,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("No sheet with the name \"RawData\" found.")]
    MissingRawDataSheet,
    #[error("Template file has different columns than requested report\nExpected columns: {0}")]
    TemplateColumns(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub key: String,
    pub cells: Vec<Value>,
}

/// Rows keyed by an index column, followed by named data columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportTable {
    pub index_name: String,
    pub columns: Vec<String>,
    pub rows: Vec<ReportRow>,
}

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Xlsx => "xlsx",
            ReportFormat::Csv => "csv",
        }
    }
}

impl ReportTable {
    pub fn new(index_name: &str, columns: &[&str]) -> Self {
        Self {
            index_name: index_name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, key: impl ToString, cells: Vec<Value>) {
        self.rows.push(ReportRow {
            key: key.to_string(),
            cells,
        });
    }

    /// Stable ascending sort on one column's text.
    pub fn sort_by_column(&mut self, column: &str) {
        if let Some(position) = self.columns.iter().position(|c| c == column) {
            self.rows.sort_by(|a, b| {
                cell_text(a.cells.get(position).unwrap_or(&Value::Null))
                    .cmp(&cell_text(b.cells.get(position).unwrap_or(&Value::Null)))
            });
        }
    }

    pub fn header(&self) -> Vec<String> {
        std::iter::once(self.index_name.clone())
            .chain(self.columns.iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows with cells arranged to follow `header`; unknown names stay empty.
    fn ordered_rows(&self, header: &[String]) -> Vec<Vec<Value>> {
        let positions: HashMap<String, usize> = self
            .header()
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, i))
            .collect();
        self.rows
            .iter()
            .map(|row| {
                let values = self.row_values(row);
                header
                    .iter()
                    .map(|name| {
                        positions
                            .get(name)
                            .and_then(|i| values.get(*i))
                            .cloned()
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            })
            .collect()
    }

    fn row_values(&self, row: &ReportRow) -> Vec<Value> {
        std::iter::once(Value::String(row.key.clone()))
            .chain(
                (0..self.columns.len()).map(|i| row.cells.get(i).cloned().unwrap_or(Value::Null)),
            )
            .collect()
    }
}

pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn write_report(
    table: &ReportTable,
    output_file: &Path,
    template: Option<&Path>,
    format: ReportFormat,
) -> Result<()> {
    debug!(rows = table.rows.len(), path = %output_file.display(), ?format, "writing report");
    match format {
        ReportFormat::Csv => write_csv(table, output_file),
        ReportFormat::Xlsx => write_xlsx(table, output_file, template),
    }
}

fn write_csv(table: &ReportTable, output_file: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(output_file)
        .with_context(|| format!("creating {}", output_file.display()))?;
    writer.write_record(table.header())?;
    for row in &table.rows {
        writer.write_record(table.row_values(row).iter().map(cell_text))?;
    }
    writer.flush().context("flushing CSV report")?;
    Ok(())
}

fn write_xlsx(table: &ReportTable, output_file: &Path, template: Option<&Path>) -> Result<()> {
    match template {
        Some(path) => append_to_template(table, path, output_file),
        None => write_new_workbook(table, output_file),
    }
}

fn write_new_workbook(table: &ReportTable, output_file: &Path) -> Result<()> {
    let header = table.header();
    let rows = table.ordered_rows(&header);

    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(RAW_DATA_SHEET)?;
    let wrap = Format::new().set_text_wrap();

    for (col, name) in header.iter().enumerate() {
        worksheet.write_with_format(0, col as u16, name.as_str(), &wrap)?;
    }
    for (r, row) in rows.iter().enumerate() {
        let r = (r + 1) as u32;
        for (c, value) in row.iter().enumerate() {
            let c = c as u16;
            match value {
                Value::Null => {}
                Value::Bool(b) => {
                    worksheet.write_with_format(r, c, *b, &wrap)?;
                }
                Value::Number(n) => match n.as_f64() {
                    Some(f) => {
                        worksheet.write_with_format(r, c, f, &wrap)?;
                    }
                    None => {
                        worksheet.write_with_format(r, c, n.to_string(), &wrap)?;
                    }
                },
                other => {
                    worksheet.write_with_format(r, c, cell_text(other), &wrap)?;
                }
            }
        }
    }

    if !rows.is_empty() {
        let columns: Vec<TableColumn> = header
            .iter()
            .map(|name| TableColumn::new().set_header(name))
            .collect();
        let data_table = Table::new()
            .set_name(TABLE_NAME)
            .set_style(TableStyle::Light8)
            .set_banded_columns(true)
            .set_columns(&columns);
        worksheet.add_table(0, 0, rows.len() as u32, (header.len() - 1) as u16, &data_table)?;
    }

    for (c, name) in header.iter().enumerate() {
        let widest = rows
            .iter()
            .filter_map(|row| row.get(c))
            .map(|value| cell_text(value).chars().count())
            .chain(std::iter::once(name.chars().count()))
            .max()
            .unwrap_or(0);
        worksheet.set_column_width(c as u16, (widest + 4) as f64 * 1.2)?;
    }

    workbook
        .save(output_file)
        .with_context(|| format!("writing {}", output_file.display()))?;
    Ok(())
}

/// Appends the rows below the template's `RawData` contents in the template's
/// column order and stretches tables on that sheet over them. All other
/// sheets are written back unchanged.
fn append_to_template(table: &ReportTable, template: &Path, output_file: &Path) -> Result<()> {
    let mut book = umya_spreadsheet::reader::xlsx::read(template)
        .map_err(|err| anyhow!("opening template {}: {err}", template.display()))?;
    let sheet = book
        .get_sheet_by_name_mut(RAW_DATA_SHEET)
        .ok_or(ReportError::MissingRawDataSheet)?;

    let header = template_header(sheet);
    check_template_columns(&header, table)?;

    let mut last_row = sheet.get_highest_row().max(1);
    for row in table.ordered_rows(&header) {
        last_row += 1;
        for (c, value) in row.iter().enumerate() {
            let cell = sheet.get_cell_mut(((c + 1) as u32, last_row));
            match value {
                Value::Null => {}
                Value::Bool(b) => {
                    cell.set_value_bool(*b);
                }
                Value::Number(n) => match n.as_f64() {
                    Some(f) => {
                        cell.set_value_number(f);
                    }
                    None => {
                        cell.set_value_string(n.to_string());
                    }
                },
                other => {
                    cell.set_value_string(cell_text(other));
                }
            }
        }
    }

    for data_table in sheet.get_tables_mut() {
        let (start, end) = data_table.get_area().clone();
        let start = (start.get_col_num().to_owned(), start.get_row_num().to_owned());
        let end = (end.get_col_num().to_owned(), last_row);
        data_table.set_area((start, end));
    }

    umya_spreadsheet::writer::xlsx::write(&book, output_file)
        .map_err(|err| anyhow!("writing {}: {err}", output_file.display()))?;
    Ok(())
}

fn template_header(sheet: &Worksheet) -> Vec<String> {
    let mut header: Vec<String> = (1..=sheet.get_highest_column())
        .map(|col| sheet.get_value((col, 1)))
        .collect();
    while header.last().is_some_and(|name| name.is_empty()) {
        header.pop();
    }
    header
}

fn check_template_columns(template_header: &[String], table: &ReportTable) -> Result<()> {
    let expected: HashSet<String> = table.header().into_iter().collect();
    let found: HashSet<String> = template_header.iter().cloned().collect();
    if expected != found {
        let listed = format!("{}, {}", table.columns.join(", "), table.index_name);
        return Err(ReportError::TemplateColumns(listed).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn sample() -> ReportTable {
        let mut table = ReportTable::new("breach_id", &["model_name", "score", "time"]);
        table.push(
            2002,
            vec![json!("Device::Anomalous SSH"), json!(0.42), json!("2019-06-03 14:58:12")],
        );
        table.push(
            1001,
            vec![json!("Compliance::Tor"), json!(1), json!("2019-06-01 08:00:00")],
        );
        table
    }

    #[test]
    fn test_sorts_rows_by_column_text() {
        let mut table = sample();
        table.sort_by_column("time");
        assert_eq!(table.rows[0].key, "1001");
        table.sort_by_column("missing");
        assert_eq!(table.rows[0].key, "1001");
    }

    #[test]
    fn test_writes_csv_with_index_column() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.csv");
        write_report(&sample(), &path, None, ReportFormat::Csv).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "breach_id,model_name,score,time");
        assert_eq!(lines[1], "2002,Device::Anomalous SSH,0.42,2019-06-03 14:58:12");
        assert_eq!(lines.len(), 3);
    }

    fn sheet_rows(path: &Path, name: &str) -> Vec<Vec<String>> {
        let book = umya_spreadsheet::reader::xlsx::read(path).unwrap();
        let sheet = book.get_sheet_by_name(name).unwrap();
        (1..=sheet.get_highest_row())
            .map(|row| {
                (1..=sheet.get_highest_column())
                    .map(|col| sheet.get_value((col, row)))
                    .collect()
            })
            .collect()
    }

    fn template_with_pivot(path: &Path) {
        let mut workbook = Workbook::new();
        let raw = workbook.add_worksheet();
        raw.set_name(RAW_DATA_SHEET).unwrap();
        for (col, name) in ["breach_id", "model_name", "score", "time"].iter().enumerate() {
            raw.write(0, col as u16, *name).unwrap();
        }
        raw.write(1, 0, "900").unwrap();
        raw.write(1, 1, "Antigena::Block").unwrap();
        raw.write(1, 2, 0.5).unwrap();
        raw.write(1, 3, "2019-05-30 10:00:00").unwrap();
        let pivot = workbook.add_worksheet();
        pivot.set_name("Pivot").unwrap();
        pivot.write(0, 0, "Breaches per model").unwrap();
        workbook.save(path).unwrap();
    }

    #[test]
    fn test_new_xlsx_has_raw_data_sheet_and_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.xlsx");
        write_report(&sample(), &path, None, ReportFormat::Xlsx).unwrap();

        let rows = sheet_rows(&path, RAW_DATA_SHEET);
        assert_eq!(rows[0], vec!["breach_id", "model_name", "score", "time"]);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2][1], "Compliance::Tor");

        let book = umya_spreadsheet::reader::xlsx::read(&path).unwrap();
        let sheet = book.get_sheet_by_name(RAW_DATA_SHEET).unwrap();
        assert_eq!(sheet.get_tables().len(), 1);
    }

    #[test]
    fn test_template_keeps_other_sheets_and_cell_types() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("template.xlsx");
        template_with_pivot(&template);

        let out = dir.path().join("out.xlsx");
        write_report(&sample(), &out, Some(&template), ReportFormat::Xlsx).unwrap();

        let book = umya_spreadsheet::reader::xlsx::read(&out).unwrap();
        let pivot = book.get_sheet_by_name("Pivot").unwrap();
        assert_eq!(pivot.get_value((1, 1)), "Breaches per model");

        let raw = book.get_sheet_by_name(RAW_DATA_SHEET).unwrap();
        assert_eq!(raw.get_highest_row(), 4);
        assert_eq!(raw.get_value((2, 2)), "Antigena::Block");
        assert_eq!(raw.get_cell((3, 2)).unwrap().get_value_number(), Some(0.5));
        assert_eq!(raw.get_value((1, 3)), "2002");
        assert_eq!(raw.get_cell((3, 3)).unwrap().get_value_number(), Some(0.42));
        assert_eq!(raw.get_value((2, 4)), "Compliance::Tor");
    }

    #[test]
    fn test_template_table_is_stretched_over_new_rows() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("template.xlsx");
        write_report(&sample(), &template, None, ReportFormat::Xlsx).unwrap();

        let mut more = ReportTable::new("breach_id", &["time", "score", "model_name"]);
        more.push(3003, vec![json!("2019-06-04 00:00:00"), json!(0.9), json!("Unusual Activity")]);
        let out = dir.path().join("second.xlsx");
        write_report(&more, &out, Some(&template), ReportFormat::Xlsx).unwrap();

        let rows = sheet_rows(&out, RAW_DATA_SHEET);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[3], vec!["3003", "Unusual Activity", "0.9", "2019-06-04 00:00:00"]);

        let book = umya_spreadsheet::reader::xlsx::read(&out).unwrap();
        let sheet = book.get_sheet_by_name(RAW_DATA_SHEET).unwrap();
        let (_, end) = sheet.get_tables()[0].get_area();
        assert_eq!(end.get_row_num().to_owned(), 4);
    }

    #[test]
    fn test_template_with_other_columns_is_rejected() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("template.xlsx");
        let other = ReportTable::new("pbid", &["name"]);
        write_report(&other, &template, None, ReportFormat::Xlsx).unwrap();

        let err = write_report(
            &sample(),
            &dir.path().join("out.xlsx"),
            Some(&template),
            ReportFormat::Xlsx,
        )
        .unwrap_err();
        assert!(err.to_string().contains("different columns"));
    }

    #[test]
    fn test_template_without_raw_data_sheet_is_rejected() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("template.xlsx");
        let mut workbook = Workbook::new();
        workbook.add_worksheet().set_name("Summary").unwrap();
        workbook.save(&template).unwrap();

        let err = write_report(
            &sample(),
            &dir.path().join("out.xlsx"),
            Some(&template),
            ReportFormat::Xlsx,
        )
        .unwrap_err();
        assert!(err.to_string().contains("RawData"));
    }
}
