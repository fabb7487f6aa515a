use std::borrow::Cow;
use std::fmt::Write as _;

use itertools::Itertools;

use crate::{
    data::Row,
    error::Diagnostic,
    executor::RowResult,
    pipeline::{ImportReport, PreparedImport},
};

/// Longest cell rendered before truncation.
const MAX_CELL_WIDTH: usize = 48;

pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut widths = headers.iter().map(|h| display_width(h)).collect::<Vec<_>>();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(display_width(cell).min(MAX_CELL_WIDTH));
        }
    }
    let widths = widths.into_iter().map(|w| w.max(3)).collect::<Vec<_>>();

    let mut output = String::new();
    let _ = writeln!(output, "{}", format_row(headers, &widths));
    let separator = widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>();
    let _ = writeln!(output, "{}", format_row(&separator, &widths));
    for row in rows {
        let _ = writeln!(output, "{}", format_row(row, &widths));
    }
    output
}

fn format_row(values: &[String], widths: &[usize]) -> String {
    let line = values
        .iter()
        .zip(widths)
        .map(|(value, width)| {
            let cell = truncate(sanitize_cell(value), MAX_CELL_WIDTH);
            let padding = width.saturating_sub(display_width(&cell));
            format!("{cell}{}", " ".repeat(padding))
        })
        .join("  ");
    line.trim_end().to_string()
}

fn display_width(value: &str) -> usize {
    value.chars().count()
}

fn truncate(value: Cow<'_, str>, limit: usize) -> Cow<'_, str> {
    if display_width(&value) <= limit {
        return value;
    }
    let mut shortened = value.chars().take(limit.saturating_sub(3)).collect::<String>();
    shortened.push_str("...");
    Cow::Owned(shortened)
}

fn sanitize_cell(value: &str) -> Cow<'_, str> {
    if value.contains(['\n', '\r', '\t']) {
        Cow::Owned(value.replace(['\n', '\r', '\t'], " "))
    } else {
        Cow::Borrowed(value)
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn row_result_cells(model: &str, row: &RowResult) -> Vec<String> {
    let message = match &row.error {
        Some(error) => error.message.clone(),
        None => row.message.clone(),
    };
    vec![
        model.to_string(),
        row.sheet.clone(),
        row.row_number.to_string(),
        row.row_token.clone(),
        format!("{:?}", row.status).to_lowercase(),
        row.action.map(|a| a.as_str().to_string()).unwrap_or_default(),
        row.record_id.map(|id| id.to_string()).unwrap_or_default(),
        message,
    ]
}

fn diagnostic_cells(level: &str, diagnostic: &Diagnostic) -> Vec<String> {
    vec![
        level.to_string(),
        diagnostic.code.as_str().to_string(),
        diagnostic.sheet.clone().unwrap_or_default(),
        diagnostic.row_number.map(|n| n.to_string()).unwrap_or_default(),
        diagnostic.message.clone(),
    ]
}

/// Summary, per-row outcomes and diagnostics of an import run.
pub fn render_report(report: &ImportReport) -> String {
    let mut output = String::new();
    let counts = &report.counts;
    let _ = writeln!(
        output,
        "{} {}: sheets {} found / {} processed / {} skipped / {} failed; rows {} ok / {} failed / {} skipped",
        report.mode.as_str(),
        if report.committed { "committed" } else { "not committed" },
        counts.sheets_found,
        counts.sheets_processed,
        counts.sheets_skipped,
        counts.sheets_failed,
        counts.rows_ok,
        counts.rows_failed,
        counts.rows_skipped
    );
    for model in &report.models {
        if let Some(dedup) = &model.dedup {
            if dedup.exact_table_duplicate {
                let _ = writeln!(
                    output,
                    "{}: identical to snapshot {}",
                    model.model,
                    dedup.duplicate_of.as_deref().unwrap_or("?")
                );
            } else if let Some(similarity) = dedup.similarity {
                let _ = writeln!(output, "{}: {:.0}% similar to a previous import", model.model, similarity * 100.0);
            }
        }
    }

    let rows = report
        .models
        .iter()
        .flat_map(|model| model.rows.iter().map(|row| row_result_cells(&model.model, row)))
        .collect::<Vec<_>>();
    if !rows.is_empty() {
        output.push('\n');
        output.push_str(&render_table(
            &strings(&["model", "sheet", "row", "token", "status", "action", "id", "message"]),
            &rows,
        ));
    }

    let diagnostics = report
        .errors
        .iter()
        .map(|d| diagnostic_cells("error", d))
        .chain(report.warnings.iter().map(|d| diagnostic_cells("warning", d)))
        .collect::<Vec<_>>();
    if !diagnostics.is_empty() {
        output.push('\n');
        output.push_str(&render_table(
            &strings(&["level", "code", "sheet", "row", "message"]),
            &diagnostics,
        ));
    }
    output
}

fn row_cells(columns: &[String], row: &Row) -> Vec<String> {
    let mut cells = vec![row.sheet.clone(), row.row_number.to_string(), row.row_id.clone()];
    cells.extend(
        columns
            .iter()
            .map(|column| row.fields.get(column).map(|v| v.as_display()).unwrap_or_default()),
    );
    cells
}

/// Transformed rows per entity, one table each.
pub fn render_prepared(prepared: &PreparedImport) -> String {
    let mut output = String::new();
    for batch in &prepared.batches {
        let columns = batch
            .rows
            .iter()
            .flat_map(|row| row.fields.keys().cloned())
            .unique()
            .collect::<Vec<_>>();
        let mut headers = strings(&["sheet", "row", "token"]);
        headers.extend(columns.iter().cloned());
        let rows = batch.rows.iter().map(|row| row_cells(&columns, row)).collect::<Vec<_>>();
        let _ = writeln!(
            output,
            "{} ({} row(s), {} substitution(s))",
            batch.entity,
            batch.rows.len(),
            batch.substitutions.len()
        );
        output.push_str(&render_table(&headers, &rows));
        output.push('\n');
    }
    let diagnostics = prepared
        .errors
        .iter()
        .map(|d| diagnostic_cells("error", d))
        .chain(prepared.warnings.iter().map(|d| diagnostic_cells("warning", d)))
        .collect::<Vec<_>>();
    if !diagnostics.is_empty() {
        output.push_str(&render_table(
            &strings(&["level", "code", "sheet", "row", "message"]),
            &diagnostics,
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_align_and_trailing_space_is_trimmed() {
        let rendered = render_table(
            &strings(&["id", "name"]),
            &[strings(&["1", "Cash"]), strings(&["200", "Line\nbreak"])],
        );
        let lines = rendered.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "id   name");
        assert_eq!(lines[1], "---  ----------");
        assert_eq!(lines[2], "1    Cash");
        assert_eq!(lines[3], "200  Line break");
    }

    #[test]
    fn long_cells_are_truncated() {
        let long = "x".repeat(80);
        let rendered = render_table(&strings(&["memo"]), &[vec![long]]);
        let row = rendered.lines().nth(2).unwrap();
        assert_eq!(row.chars().count(), MAX_CELL_WIDTH);
        assert!(row.ends_with("..."));
    }
}
