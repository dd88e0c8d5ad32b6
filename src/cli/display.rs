//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::CompileReport;
use crate::submit::SubmissionOutcome;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No steps.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    let mut push_row = |cells: Vec<String>| {
        let line: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| match widths.get(i) {
                Some(&w) => format!("{:width$}", cell, width = w),
                None => cell.clone(),
            })
            .collect();
        output.push_str(line.join("   ").trim_end());
        output.push('\n');
    };

    push_row(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        push_row(row);
    }

    output
}

// ============================================================================
// Compile (dry run) display
// ============================================================================

/// Summary of a compiled pipeline: one row per step in execution order.
pub fn format_compile_report(report: &CompileReport) -> String {
    let mut output = String::new();

    output.push_str(&format!("nbpipe v{} - Dry Run\n\n", env!("CARGO_PKG_VERSION")));
    output.push_str(&format!("Pipeline:     {}\n", report.pipeline_name));
    output.push_str(&format!("Steps:        {}\n", report.steps.len()));

    let entry_points: Vec<&str> = report
        .steps
        .entry_points()
        .into_iter()
        .map(|s| s.name.as_str())
        .collect();
    output.push_str(&format!("Entry points: {}\n\n", entry_points.join(", ")));

    let order = match report.steps.topological_order() {
        Ok(order) => order,
        Err(e) => return format!("{}Invalid step graph: {}\n", output, e),
    };
    let rows = order
        .iter()
        .map(|step| {
            let depends_on: Vec<&str> = step
                .depends_on
                .iter()
                .filter_map(|id| report.steps.get(id))
                .map(|dep| dep.name.as_str())
                .collect();
            vec![
                step.id.clone(),
                step.name.clone(),
                step.image.clone(),
                if depends_on.is_empty() {
                    "-".to_string()
                } else {
                    depends_on.join(",")
                },
            ]
        })
        .collect();
    output.push_str(&format_table(&["id", "name", "image", "depends on"], rows));

    output
}

pub fn format_submission(outcome: &SubmissionOutcome) -> String {
    format!(
        "Pipeline {} submitted\nRun:  {}\nURL:  {}\n",
        outcome.pipeline_name, outcome.run_id, outcome.url
    )
}
