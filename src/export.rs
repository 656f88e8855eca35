use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("row {row} has {got} cells, header has {expected}")]
    RaggedRow {
        row: usize,
        got: usize,
        expected: usize,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single-sheet table ready to hand to a spreadsheet.
#[derive(Debug, Clone, Default)]
pub struct Sheet {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Sheet {
    pub fn new<S: Into<String>>(headers: impl IntoIterator<Item = S>) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }
}

pub fn yes_no(b: bool) -> String {
    if b { "Yes" } else { "No" }.to_string()
}

/// Drops a trailing `.0` so whole numbers read naturally in a spreadsheet.
pub fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// Writes the sheet as CSV and returns the number of data rows.
pub fn write_csv(sheet: &Sheet, out_path: &Path) -> Result<usize, ExportError> {
    for (i, row) in sheet.rows.iter().enumerate() {
        if row.len() != sheet.headers.len() {
            return Err(ExportError::RaggedRow {
                row: i,
                got: row.len(),
                expected: sheet.headers.len(),
            });
        }
    }
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut w = csv::Writer::from_path(out_path)?;
    w.write_record(&sheet.headers)?;
    for row in &sheet.rows {
        w.write_record(row)?;
    }
    w.flush()?;
    Ok(sheet.rows.len())
}
