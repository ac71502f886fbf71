//! Plain-text numeric tables.
//!
//! Whitespace separated columns; blank lines and lines starting with `#`
//! are skipped. Used for n(z) files, mask spectra, COSEBI filters and
//! band-power windows.

use std::fs;
use std::path::Path;

use crate::domain::RedshiftDistribution;
use crate::error::CovError;
use crate::math::Table1D;

/// Read every column of a table. All rows must have the same width.
pub fn read_columns(path: &Path) -> Result<Vec<Vec<f64>>, CovError> {
    let text = fs::read_to_string(path)
        .map_err(|e| CovError::io(format!("Failed to read table '{}': {e}", path.display())))?;
    parse_columns(&text).map_err(|msg| CovError::io(format!("Table '{}': {msg}", path.display())))
}

fn parse_columns(text: &str) -> Result<Vec<Vec<f64>>, String> {
    let mut columns: Vec<Vec<f64>> = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(|tok| tok.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("line {}: {e}", line_no + 1))?;
        if columns.is_empty() {
            columns = vec![Vec::new(); row.len()];
        } else if row.len() != columns.len() {
            return Err(format!(
                "line {} has {} columns, expected {}",
                line_no + 1,
                row.len(),
                columns.len()
            ));
        }
        for (col, v) in columns.iter_mut().zip(row) {
            col.push(v);
        }
    }
    if columns.is_empty() {
        return Err("no data rows".to_string());
    }
    Ok(columns)
}

/// First two columns as `(x, y)`.
pub fn read_table(path: &Path) -> Result<Table1D, CovError> {
    let mut columns = read_columns(path)?;
    if columns.len() < 2 {
        return Err(CovError::io(format!("Table '{}' needs two columns.", path.display())));
    }
    let y = columns.swap_remove(1);
    let x = columns.swap_remove(0);
    Table1D::new(x, y).map_err(|e| CovError::io(format!("Table '{}': {e}", path.display())))
}

/// Redshift distribution `(z, n(z))`, normalized on load.
pub fn read_nz(path: &Path) -> Result<RedshiftDistribution, CovError> {
    let table = read_table(path)?;
    RedshiftDistribution::new(table.x().to_vec(), table.y().to_vec())
        .map_err(|e| CovError::config(format!("n(z) file '{}': {e}", path.display())))
}

/// Which COSEBI filter a table holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CosebiTable {
    /// `W_n(ℓ)`.
    Wn,
    /// `T_+(θ)`.
    Tplus,
    /// `T_-(θ)`.
    Tminus,
}

impl CosebiTable {
    pub fn file_name(self, prefix: &str, mode: usize) -> String {
        let stem = match self {
            CosebiTable::Wn => "Wn",
            CosebiTable::Tplus => "Tplus",
            CosebiTable::Tminus => "Tminus",
        };
        format!("{stem}{prefix}_{mode}.table")
    }
}

/// Load one COSEBI filter table; a missing file is a missing kernel.
pub fn read_cosebi_table(dir: &Path, table: CosebiTable, prefix: &str, mode: usize) -> Result<Table1D, CovError> {
    let name = table.file_name(prefix, mode);
    let path = dir.join(&name);
    if !path.is_file() {
        return Err(CovError::MissingTabulatedKernel { table: name, mode });
    }
    read_table(&path)
}
