//! Write the covariance and its run summary.
//!
//! All files land in one output directory:
//!
//! - `covariance_list.dat`: one line per `(i, j)` with the total and every term column
//! - `covariance_matrix.mat`: the dense total, one row per line
//! - `correlation_matrix.mat`: optional correlation matrix
//! - `cells.dat`: optional angular spectra on their native multipoles
//! - `summary.json`: layout, checks and warnings of the run
//!
//! List and matrix print the same `f64`s with the same format, so they agree
//! to the last digit.

use std::fs::{File, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nalgebra::DMatrix;
use serde::Serialize;

use crate::assembler::CovarianceMatrix;
use crate::diagnostics::WarningSummary;
use crate::error::CovError;
use crate::spectra::AngularSpectra;

pub const LIST_FILE: &str = "covariance_list.dat";
pub const MATRIX_FILE: &str = "covariance_matrix.mat";
pub const CORRELATION_FILE: &str = "correlation_matrix.mat";
pub const CELLS_FILE: &str = "cells.dat";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportOptions {
    pub correlation: bool,
    pub cells: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentSummary {
    pub label: String,
    pub offset: usize,
    pub bins: usize,
}

/// Contents of `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub tool: String,
    pub version: String,
    pub created: DateTime<Utc>,
    pub dimension: usize,
    pub columns: Vec<String>,
    pub segments: Vec<SegmentSummary>,
    pub symmetrized: bool,
    pub min_eigenvalue: Option<f64>,
    pub num_cores: usize,
    pub warnings: Vec<WarningSummary>,
}

fn create(path: &Path) -> Result<BufWriter<File>, CovError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| CovError::io(format!("Failed to create '{}': {e}", path.display())))
}

fn write_failed(path: &Path) -> impl Fn(std::io::Error) -> CovError + '_ {
    move |e| CovError::io(format!("Failed to write '{}': {e}", path.display()))
}

/// Write every enabled output into `dir` and return the paths written.
pub fn write_outputs(
    dir: &Path,
    covariance: &CovarianceMatrix,
    spectra: Option<&AngularSpectra>,
    summary: &RunSummary,
    options: ExportOptions,
) -> Result<Vec<PathBuf>, CovError> {
    create_dir_all(dir).map_err(|e| CovError::io(format!("Failed to create output dir '{}': {e}", dir.display())))?;
    let mut written = Vec::new();

    let path = dir.join(LIST_FILE);
    write_list(&path, covariance)?;
    written.push(path);

    let path = dir.join(MATRIX_FILE);
    write_matrix(&path, covariance.total())?;
    written.push(path);

    if options.correlation {
        let path = dir.join(CORRELATION_FILE);
        write_matrix(&path, &covariance.correlation())?;
        written.push(path);
    }
    if let (true, Some(spectra)) = (options.cells, spectra) {
        let path = dir.join(CELLS_FILE);
        write_cells(&path, spectra)?;
        written.push(path);
    }

    let path = dir.join(SUMMARY_FILE);
    write_summary(&path, summary)?;
    written.push(path);
    Ok(written)
}

pub fn write_list(path: &Path, covariance: &CovarianceMatrix) -> Result<(), CovError> {
    let mut file = create(path)?;
    let failed = write_failed(path);

    let terms: Vec<&str> = covariance.columns().iter().map(|k| k.column_name()).collect();
    writeln!(
        file,
        "# i j obs_i comp_i tomo_i bin_i obs_j comp_j tomo_j bin_j cov {}",
        terms.join(" ")
    )
    .map_err(&failed)?;

    let entries = covariance.index().entries();
    for e in covariance.list() {
        let (a, b) = (&entries[e.i], &entries[e.j]);
        write!(
            file,
            "{} {} {} {} {}-{} {} {} {} {}-{} {} {:.16e}",
            e.i,
            e.j,
            a.observable.tag(),
            a.component.tag(),
            a.tracers.0,
            a.tracers.1,
            a.bin + 1,
            b.observable.tag(),
            b.component.tag(),
            b.tracers.0,
            b.tracers.1,
            b.bin + 1,
            e.value
        )
        .map_err(&failed)?;
        for v in &e.terms {
            write!(file, " {v:.16e}").map_err(&failed)?;
        }
        writeln!(file).map_err(&failed)?;
    }
    file.flush().map_err(&failed)
}

pub fn write_matrix(path: &Path, matrix: &DMatrix<f64>) -> Result<(), CovError> {
    let mut file = create(path)?;
    let failed = write_failed(path);
    for i in 0..matrix.nrows() {
        let row: Vec<String> = (0..matrix.ncols()).map(|j| format!("{:.16e}", matrix[(i, j)])).collect();
        writeln!(file, "{}", row.join(" ")).map_err(&failed)?;
    }
    file.flush().map_err(&failed)
}

/// Signal spectra per tracer pair; white-noise levels go in the header.
pub fn write_cells(path: &Path, spectra: &AngularSpectra) -> Result<(), CovError> {
    let mut file = create(path)?;
    let failed = write_failed(path);
    let pairs: Vec<_> = spectra.pairs().collect();

    let mut noise: Vec<String> = Vec::new();
    for ((a, b), _) in &pairs {
        for t in [*a, *b] {
            let label = format!("{t}={:.6e}", spectra.noise(t, t));
            if !noise.contains(&label) {
                noise.push(label);
            }
        }
    }
    writeln!(file, "# noise {}", noise.join(" ")).map_err(&failed)?;
    let labels: Vec<String> = pairs.iter().map(|((a, b), _)| format!("{a}-{b}")).collect();
    writeln!(file, "# ell {}", labels.join(" ")).map_err(&failed)?;

    for (i, ell) in spectra.ell().iter().enumerate() {
        write!(file, "{ell:.8e}").map_err(&failed)?;
        for (_, cells) in &pairs {
            write!(file, " {:.10e}", cells[i]).map_err(&failed)?;
        }
        writeln!(file).map_err(&failed)?;
    }
    file.flush().map_err(&failed)
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<(), CovError> {
    let file = create(path)?;
    serde_json::to_writer_pretty(file, summary)
        .map_err(|e| CovError::io(format!("Failed to write summary JSON '{}': {e}", path.display())))
}

/// Read a dense matrix written by [`write_matrix`].
pub fn read_matrix(path: &Path) -> Result<DMatrix<f64>, CovError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CovError::io(format!("Failed to read '{}': {e}", path.display())))?;
    let rows: Vec<Vec<f64>> = text
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .enumerate()
        .map(|(n, line)| {
            line.split_whitespace()
                .map(|v| {
                    v.parse::<f64>()
                        .map_err(|e| CovError::io(format!("{}: row {}: `{v}`: {e}", path.display(), n + 1)))
                })
                .collect::<Result<Vec<f64>, CovError>>()
        })
        .collect::<Result<_, _>>()?;
    let n = rows.len();
    if rows.iter().any(|r| r.len() != n) {
        return Err(CovError::io(format!("{}: matrix is not square.", path.display())));
    }
    Ok(DMatrix::from_fn(n, n, |i, j| rows[i][j]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::CovarianceAssembler;
    use crate::binning::{BinningScheme, ThetaBins};
    use crate::combinator::{BlockResult, ObservableCombinator, ObservableSetup, TomographicBins};
    use crate::diagnostics::Diagnostics;
    use crate::domain::{ObservableKind, ShearEstimator, Spacing, TermKind, TermSelection};

    fn covariance() -> CovarianceMatrix {
        let scheme = BinningScheme::Theta(ThetaBins::new(10.0, 100.0, 3, Spacing::Log).unwrap());
        let observables = vec![ObservableSetup::new(ObservableKind::CosmicShear, scheme, ShearEstimator::XiP, 0.05).unwrap()];
        let bins = TomographicBins {
            lensing: 1,
            clustering: 0,
        };
        let c = ObservableCombinator::new(observables, bins, TermSelection::default()).unwrap();
        let mut asm = CovarianceAssembler::new(&c, vec![TermKind::Gauss], false);
        asm.insert(BlockResult {
            s: 0,
            t: 0,
            term: TermKind::Gauss,
            block: DMatrix::from_fn(3, 3, |i, j| if i == j { 1.0 / 3.0 } else { 1e-7 * (i + j) as f64 }),
        })
        .unwrap();
        asm.finish(&Diagnostics::new()).unwrap()
    }

    fn summary(cov: &CovarianceMatrix) -> RunSummary {
        RunSummary {
            tool: "lsscov".to_string(),
            version: "test".to_string(),
            created: Utc::now(),
            dimension: cov.dimension(),
            columns: vec!["gauss".to_string()],
            segments: Vec::new(),
            symmetrized: false,
            min_eigenvalue: None,
            num_cores: 1,
            warnings: Vec::new(),
        }
    }

    #[test]
    fn matrix_round_trips_exactly_and_list_agrees() {
        let cov = covariance();
        let dir = std::env::temp_dir().join(format!("lsscov_export_{}", std::process::id()));
        let written = write_outputs(&dir, &cov, None, &summary(&cov), ExportOptions {
            correlation: true,
            cells: true,
        })
        .unwrap();
        // No spectra, so no cells file.
        assert_eq!(written.len(), 4);

        let back = read_matrix(&dir.join(MATRIX_FILE)).unwrap();
        assert_eq!(&back, cov.total());

        let list = std::fs::read_to_string(dir.join(LIST_FILE)).unwrap();
        let lines: Vec<&str> = list.lines().collect();
        assert!(lines[0].starts_with("# i j"));
        assert_eq!(lines.len(), 1 + 9);
        let fields: Vec<&str> = lines[1 + 3 + 1].split_whitespace().collect();
        assert_eq!(&fields[..2], &["1", "1"]);
        assert_eq!(fields[4], "s1-s1");
        let value: f64 = fields[10].parse().unwrap();
        assert_eq!(value.to_bits(), cov.total()[(1, 1)].to_bits());

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join(SUMMARY_FILE)).unwrap()).unwrap();
        assert_eq!(json["dimension"], 3);
        std::fs::remove_dir_all(&dir).ok();
    }
}
