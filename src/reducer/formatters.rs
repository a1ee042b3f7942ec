//! Deterministic output formatters
//!
//! None of these call a model and none can fail.

use super::{ReduceFormat, ReduceSummary};
use crate::mapper::MapResult;
use serde_json::{json, Value};
use std::fmt::Write;
use tracing::warn;

const TABLE_CELL_WIDTH: usize = 40;

/// Format results already ordered by ordinal
pub fn format(format: ReduceFormat, results: &[MapResult], summary: &ReduceSummary) -> String {
    match format {
        ReduceFormat::List => format_list(results, summary),
        ReduceFormat::Table => format_table(results),
        ReduceFormat::Json => format_json(results),
        ReduceFormat::Csv => format_csv(results),
        ReduceFormat::Text => format_text(results),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn format_list(results: &[MapResult], summary: &ReduceSummary) -> String {
    let mut output = String::new();
    let total = results.len();

    for (index, result) in results.iter().enumerate() {
        let status = if result.success { "ok" } else { "failed" };
        writeln!(output, "[{}/{}] {}: {}", index + 1, total, result.id(), status).ok();

        if !result.item.payload.is_empty() {
            writeln!(output, "  input:").ok();
            for (key, value) in &result.item.payload {
                writeln!(output, "    {}: {}", key, value).ok();
            }
        }

        if result.success {
            writeln!(output, "  output:").ok();
            for (key, value) in result.output_fields() {
                let rendered = display_value(&value);
                let mut lines = rendered.lines();
                writeln!(output, "    {}: {}", key, lines.next().unwrap_or("")).ok();
                for line in lines {
                    writeln!(output, "      {}", line).ok();
                }
            }
        } else if let Some(error) = &result.error {
            writeln!(output, "  error: {}", error).ok();
        }
        writeln!(output).ok();
    }

    writeln!(output, "---").ok();
    write!(
        output,
        "Total: {} | Succeeded: {} | Failed: {}",
        summary.total, summary.succeeded, summary.failed
    )
    .ok();
    output
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Input,
    Output,
}

#[derive(Debug, Clone)]
struct Column {
    label: String,
    key: String,
    source: Source,
}

/// Union of input keys then output keys, in order of first appearance.
///
/// An output key that collides with an input key is labelled `output_<key>`.
fn columns(results: &[MapResult]) -> Vec<Column> {
    let mut input_keys: Vec<String> = Vec::new();
    let mut output_keys: Vec<String> = Vec::new();

    for result in results {
        for key in result.item.payload.keys() {
            if !input_keys.contains(key) {
                input_keys.push(key.clone());
            }
        }
        for (key, _) in result.output_fields() {
            if !output_keys.contains(&key) {
                output_keys.push(key);
            }
        }
    }

    let mut columns: Vec<Column> = input_keys
        .iter()
        .map(|key| Column {
            label: key.clone(),
            key: key.clone(),
            source: Source::Input,
        })
        .collect();

    for key in output_keys {
        let label = if input_keys.contains(&key) {
            format!("output_{}", key)
        } else {
            key.clone()
        };
        columns.push(Column {
            label,
            key,
            source: Source::Output,
        });
    }
    columns
}

fn cell(result: &MapResult, column: &Column) -> String {
    match column.source {
        Source::Input => result.item.payload.get(&column.key).cloned().unwrap_or_default(),
        Source::Output => result
            .output_fields()
            .into_iter()
            .find(|(key, _)| key == &column.key)
            .map(|(_, value)| display_value(&value))
            .unwrap_or_default(),
    }
}

fn truncate(text: &str, width: usize) -> String {
    let flat = text.replace(['\r', '\n'], " ").replace('|', "\\|");
    if flat.chars().count() <= width {
        flat
    } else {
        let kept: String = flat.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn format_table(results: &[MapResult]) -> String {
    let columns = columns(results);
    let mut output = String::new();

    let header: Vec<&str> = columns
        .iter()
        .map(|c| c.label.as_str())
        .chain(std::iter::once("success"))
        .collect();
    writeln!(output, "| {} |", header.join(" | ")).ok();
    writeln!(
        output,
        "|{}",
        header.iter().map(|_| "---|").collect::<String>()
    )
    .ok();

    for result in results {
        let cells: Vec<String> = columns
            .iter()
            .map(|column| truncate(&cell(result, column), TABLE_CELL_WIDTH))
            .chain(std::iter::once(result.success.to_string()))
            .collect();
        writeln!(output, "| {} |", cells.join(" | ")).ok();
    }
    output
}

fn format_json(results: &[MapResult]) -> String {
    let entries: Vec<Value> = results
        .iter()
        .map(|result| {
            let mut entry = json!({
                "input": result.item.payload,
                "output": result.output_value(),
                "success": result.success,
            });
            if let Some(error) = &result.error {
                entry["error"] = Value::String(error.clone());
            }
            entry
        })
        .collect();

    serde_json::to_string_pretty(&entries).unwrap_or_else(|_| Value::Array(entries).to_string())
}

fn format_csv(results: &[MapResult]) -> String {
    let columns = columns(results);
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Necessary)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    let header: Vec<&str> = columns
        .iter()
        .map(|c| c.label.as_str())
        .chain(std::iter::once("success"))
        .collect();
    if let Err(e) = writer.write_record(&header) {
        warn!("Failed to write CSV header: {}", e);
    }

    for result in results {
        let row: Vec<String> = columns
            .iter()
            .map(|column| cell(result, column))
            .chain(std::iter::once(result.success.to_string()))
            .collect();
        if let Err(e) = writer.write_record(&row) {
            warn!(item_id = %result.id(), "Failed to write CSV row: {}", e);
        }
    }

    match writer.into_inner() {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Err(e) => {
            warn!("Failed to flush CSV output: {}", e);
            String::new()
        }
    }
}

fn format_text(results: &[MapResult]) -> String {
    let body = |result: &MapResult| -> String {
        if result.success {
            display_value(&result.output_value())
        } else {
            format!("[failed: {}]", result.error.as_deref().unwrap_or("unknown error"))
        }
    };

    if results.len() == 1 {
        return body(&results[0]);
    }

    results
        .iter()
        .map(|result| format!("=== {} ===\n{}", result.id(), body(result).trim_end()))
        .collect::<Vec<_>>()
        .join("\n\n")
}
