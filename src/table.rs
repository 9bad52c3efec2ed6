//! Fixed-width text tables for terminal reports.

use std::{borrow::Cow, fmt::Write as _};

/// Cells wider than this are cut and end in `...`.
pub const MAX_CELL_WIDTH: usize = 72;

pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let cells = rows
        .iter()
        .map(|row| {
            (0..headers.len())
                .map(|idx| clip(&sanitize_cell(row.get(idx).map(String::as_str).unwrap_or(""))))
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let mut widths = headers.iter().map(|h| h.chars().count().max(3)).collect::<Vec<_>>();
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }
    // Columns where every cell is a number read better right-aligned.
    let numeric = (0..headers.len())
        .map(|idx| !cells.is_empty() && cells.iter().all(|row| row[idx].parse::<f64>().is_ok()))
        .collect::<Vec<_>>();

    let mut output = String::new();
    let header_cells = headers.iter().map(|h| sanitize_cell(h).into_owned()).collect::<Vec<_>>();
    let _ = writeln!(output, "{}", format_row(&header_cells, &widths, &numeric));
    let rule = widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>();
    let _ = writeln!(output, "{}", format_row(&rule, &widths, &numeric));
    for row in &cells {
        let _ = writeln!(output, "{}", format_row(row, &widths, &numeric));
    }
    output
}

pub fn print_table(headers: &[String], rows: &[Vec<String>]) {
    print!("{}", render_table(headers, rows));
}

fn format_row(values: &[String], widths: &[usize], numeric: &[bool]) -> String {
    let line = values
        .iter()
        .zip(widths)
        .zip(numeric)
        .map(|((value, width), right)| {
            if *right {
                format!("{value:>width$}")
            } else {
                format!("{value:<width$}")
            }
        })
        .collect::<Vec<_>>()
        .join("  ");
    line.trim_end().to_string()
}

fn clip(value: &str) -> String {
    if value.chars().count() <= MAX_CELL_WIDTH {
        return value.to_string();
    }
    let mut clipped = value.chars().take(MAX_CELL_WIDTH - 3).collect::<String>();
    clipped.push_str("...");
    clipped
}

fn sanitize_cell(value: &str) -> Cow<'_, str> {
    if value.contains(['\n', '\r', '\t']) {
        Cow::Owned(value.replace(['\n', '\r', '\t'], " "))
    } else {
        Cow::Borrowed(value)
    }
}
