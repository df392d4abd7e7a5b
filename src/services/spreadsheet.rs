//! Spreadsheet reader
//!
//! Loads the first sheet of an `.xlsx`, `.xls` or `.csv` file into memory as
//! header-keyed rows. Size limits are enforced before a job is submitted.

use std::collections::HashMap;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use tracing::debug;

use crate::defaults::SUPPORTED_EXTENSIONS;
use crate::error::{IngestError, IngestResult};
use crate::types::{CellValue, RowRecord};

/// Lowercased extension of `path`, if it is one the reader handles
pub fn supported_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    SUPPORTED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Read every data row of the first sheet
pub fn read_spreadsheet(path: &Path) -> IngestResult<Vec<RowRecord>> {
    let shown = path.display().to_string();

    let ext = supported_extension(path).ok_or_else(|| {
        IngestError::unreadable(&shown, "only .xlsx, .xls and .csv files are supported")
    })?;

    if !path.is_file() {
        return Err(IngestError::unreadable(&shown, "file does not exist"));
    }

    let rows = match ext.as_str() {
        "csv" => read_csv(path)?,
        _ => read_workbook(path)?,
    };

    if rows.is_empty() {
        return Err(IngestError::unreadable(&shown, "spreadsheet contains no data rows"));
    }

    debug!("Read {} rows from '{}'", rows.len(), shown);
    Ok(rows)
}

fn read_csv(path: &Path) -> IngestResult<Vec<RowRecord>> {
    let display = path.display().to_string();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| IngestError::unreadable(&display, e))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| IngestError::unreadable(&display, e))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let record = result.map_err(|e| IngestError::unreadable(&display, e))?;
        let line = record
            .position()
            .map(|p| p.line() as u32)
            .unwrap_or(idx as u32 + 2);

        let cells = record.iter().map(|value| {
            if value.is_empty() {
                CellValue::Empty
            } else {
                CellValue::Text(value.to_string())
            }
        });

        if let Some(row) = build_row(line, &headers, cells) {
            rows.push(row);
        }
    }

    Ok(rows)
}

fn read_workbook(path: &Path) -> IngestResult<Vec<RowRecord>> {
    let display = path.display().to_string();
    let mut workbook = open_workbook_auto(path).map_err(|e| IngestError::unreadable(&display, e))?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| IngestError::unreadable(&display, "workbook has no sheets"))?
        .map_err(|e| IngestError::unreadable(&display, e))?;

    // Row numbers are 1-based and account for leading blank rows
    let first_row = range.start().map(|(row, _)| row + 1).unwrap_or(1);

    let mut iter = range.rows();
    let headers: Vec<String> = match iter.next() {
        Some(header) => header
            .iter()
            .map(|cell| convert_cell(cell).as_text().unwrap_or_default())
            .collect(),
        None => return Ok(Vec::new()),
    };

    let rows = iter
        .enumerate()
        .filter_map(|(idx, cells)| {
            let line = first_row + 1 + idx as u32;
            build_row(line, &headers, cells.iter().map(convert_cell))
        })
        .collect();

    Ok(rows)
}

fn convert_cell(cell: &Data) -> CellValue {
    match cell {
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => CellValue::Number(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
        // Error cells (#N/A, #REF!, ...) carry no usable value
        _ => CellValue::Empty,
    }
}

/// Zip headers with cells. Blank header columns are ignored, the first of
/// duplicate headers wins and fully blank rows are skipped.
fn build_row(
    line: u32,
    headers: &[String],
    cells: impl Iterator<Item = CellValue>,
) -> Option<RowRecord> {
    let mut map = HashMap::with_capacity(headers.len());
    for (header, cell) in headers.iter().zip(cells) {
        if header.is_empty() {
            continue;
        }
        map.entry(header.clone()).or_insert(cell);
    }

    let row = RowRecord { row: line, cells: map };
    (!row.is_blank()).then_some(row)
}
