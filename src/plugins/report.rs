//! Human-readable reports built from a run log.

use crate::core::error::FuzzyflowError;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const REPORT_TITLE: &str = "FuzzyFlow Test Report";

/// JSON payload of one `<timestamp> | <json>` line, if it has one.
pub fn parse_log_line(line: &str) -> Option<Map<String, Value>> {
    let (_, payload) = line.split_once(" | ")?;
    if !payload.trim_start().starts_with('{') {
        return None;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

pub fn read_log(path: &Path) -> Result<Vec<Map<String, Value>>, FuzzyflowError> {
    let content = fs::read_to_string(path)?;
    Ok(content.lines().filter_map(parse_log_line).collect())
}

/// Column names in order of first appearance. Record keys keep their
/// logged order through serde_json's `preserve_order` feature.
pub fn columns(rows: &[Map<String, Value>]) -> Vec<String> {
    let mut cols: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !cols.iter().any(|c| c == key) {
                cols.push(key.clone());
            }
        }
    }
    cols
}

fn cell(row: &Map<String, Value>, column: &str) -> String {
    match row.get(column) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub fn export_csv(rows: &[Map<String, Value>], out: &Path) -> Result<(), FuzzyflowError> {
    let cols = columns(rows);
    let mut writer = csv::Writer::from_path(out)?;
    writer.write_record(&cols)?;
    for row in rows {
        writer.write_record(cols.iter().map(|c| cell(row, c)))?;
    }
    writer.flush()?;
    Ok(())
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

pub fn render_html(rows: &[Map<String, Value>]) -> String {
    let cols = columns(rows);
    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str(&format!("<title>{}</title>\n", REPORT_TITLE));
    html.push_str(
        "<style>\n\
         table { border-collapse: collapse; font-family: sans-serif; }\n\
         th { background-color: #101d86; color: white; font-weight: bold; }\n\
         td, th { padding: 5px; }\n\
         tr:nth-child(even) { background-color: #f2f2f2; }\n\
         </style>\n</head>\n<body>\n",
    );
    html.push_str(&format!("<table>\n<caption>{}</caption>\n<thead><tr>", REPORT_TITLE));
    for col in &cols {
        html.push_str(&format!("<th>{}</th>", html_escape(col)));
    }
    html.push_str("</tr></thead>\n<tbody>\n");
    for row in rows {
        html.push_str("<tr>");
        for col in &cols {
            html.push_str(&format!("<td>{}</td>", html_escape(&cell(row, col))));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody>\n</table>\n</body>\n</html>\n");
    html
}

pub fn export_html(rows: &[Map<String, Value>], out: &Path) -> Result<(), FuzzyflowError> {
    fs::write(out, render_html(rows))?;
    Ok(())
}

/// Write `report.csv` and `report.html` into `out_dir`.
pub fn export_reports(log_path: &Path, out_dir: &Path) -> Result<(PathBuf, PathBuf), FuzzyflowError> {
    let rows = read_log(log_path)?;
    let csv_path = out_dir.join("report.csv");
    let html_path = out_dir.join("report.html");
    export_csv(&rows, &csv_path)?;
    export_html(&rows, &html_path)?;
    Ok((csv_path, html_path))
}
