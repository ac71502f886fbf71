//! Point catalogs for the survey-geometry term.
//!
//! A catalog is a CSV with (at least) two position columns, a weight and a
//! tomographic bin index (1-based). Column names are configurable; header
//! matching ignores case, surrounding whitespace and a UTF-8 BOM.
//!
//! Rows that fail to parse are skipped and collected in
//! [`PointCatalog::row_errors`].

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use csv::StringRecord;
use serde::{Deserialize, Serialize};

use crate::error::CovError;

/// Names of the catalog columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogColumns {
    /// Right ascension (spherical) or x (flat), degrees.
    pub x: String,
    /// Declination (spherical) or y (flat), degrees.
    pub y: String,
    pub weight: String,
    pub bin: String,
}

impl Default for CatalogColumns {
    fn default() -> Self {
        Self {
            x: "ra".to_string(),
            y: "dec".to_string(),
            weight: "weight".to_string(),
            bin: "zbin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CatalogPoint {
    pub x: f64,
    pub y: f64,
    pub weight: f64,
    /// Zero-based tomographic bin.
    pub bin: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct PointCatalog {
    pub points: Vec<CatalogPoint>,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
}

impl PointCatalog {
    pub fn from_points(points: Vec<CatalogPoint>) -> Self {
        let rows_read = points.len();
        Self {
            points,
            row_errors: Vec::new(),
            rows_read,
        }
    }

    /// Points of one tomographic bin.
    pub fn bin(&self, bin: usize) -> impl Iterator<Item = &CatalogPoint> {
        self.points.iter().filter(move |p| p.bin == bin)
    }
}

/// Load a catalog with `n_bins` tomographic bins.
pub fn read_catalog(path: &Path, columns: &CatalogColumns, n_bins: usize) -> Result<PointCatalog, CovError> {
    let file = File::open(path)
        .map_err(|e| CovError::io(format!("Failed to open catalog '{}': {e}", path.display())))?;
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(file);

    let headers = reader
        .headers()
        .map_err(|e| CovError::io(format!("Failed to read catalog headers: {e}")))?
        .clone();
    let header_map = build_header_map(&headers);
    let index = |name: &str| -> Result<usize, CovError> {
        header_map
            .get(&normalize_header_name(name))
            .copied()
            .ok_or_else(|| CovError::config(format!("Catalog '{}' has no column `{name}`.", path.display())))
    };
    let layout = [index(&columns.x)?, index(&columns.y)?, index(&columns.weight)?, index(&columns.bin)?];

    let mut catalog = PointCatalog::default();
    for (idx, result) in reader.records().enumerate() {
        let line = idx + 2;
        catalog.rows_read += 1;
        let parsed = result
            .map_err(|e| format!("CSV parse error: {e}"))
            .and_then(|record| parse_row(&record, layout, n_bins));
        match parsed {
            Ok(point) => catalog.points.push(point),
            Err(message) => catalog.row_errors.push(RowError { line, message }),
        }
    }
    if catalog.points.is_empty() {
        return Err(CovError::config(format!(
            "Catalog '{}' has no usable rows ({} read).",
            path.display(),
            catalog.rows_read
        )));
    }
    Ok(catalog)
}

/// Write a catalog with the given column names.
pub fn write_catalog(path: &Path, columns: &CatalogColumns, points: &[CatalogPoint]) -> Result<(), CovError> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| CovError::io(format!("Failed to create catalog '{}': {e}", path.display())))?;
    let map_err = |e: csv::Error| CovError::io(format!("Failed to write catalog '{}': {e}", path.display()));
    writer
        .write_record([&columns.x, &columns.y, &columns.weight, &columns.bin])
        .map_err(map_err)?;
    for p in points {
        writer
            .write_record([
                format!("{:.8}", p.x),
                format!("{:.8}", p.y),
                format!("{:.6}", p.weight),
                (p.bin + 1).to_string(),
            ])
            .map_err(map_err)?;
    }
    writer
        .flush()
        .map_err(|e| CovError::io(format!("Failed to flush catalog '{}': {e}", path.display())))
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    name.trim().trim_start_matches('\u{feff}').to_ascii_lowercase()
}

fn parse_row(record: &StringRecord, layout: [usize; 4], n_bins: usize) -> Result<CatalogPoint, String> {
    let [x, y, weight, bin] = layout;
    let field = |idx: usize| -> Result<&str, String> {
        record
            .get(idx)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("missing value in column {}", idx + 1))
    };
    let number = |idx: usize| -> Result<f64, String> {
        let raw = field(idx)?;
        let v: f64 = raw.parse().map_err(|_| format!("invalid number `{raw}`"))?;
        if v.is_finite() { Ok(v) } else { Err(format!("non-finite value `{raw}`")) }
    };

    let weight = number(weight)?;
    if weight < 0.0 {
        return Err(format!("negative weight {weight}"));
    }
    let raw_bin = field(bin)?;
    let bin: usize = raw_bin
        .parse::<f64>()
        .ok()
        .filter(|b| b.fract() == 0.0 && *b >= 1.0)
        .map(|b| b as usize)
        .ok_or_else(|| format!("invalid tomographic bin `{raw_bin}`"))?;
    if bin > n_bins {
        return Err(format!("tomographic bin {bin} exceeds the {n_bins} configured bins"));
    }
    Ok(CatalogPoint {
        x: number(x)?,
        y: number(y)?,
        weight,
        bin: bin - 1,
    })
}
