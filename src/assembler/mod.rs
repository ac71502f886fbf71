//! Global covariance assembly.
//!
//! Blocks arrive keyed by `(s, t, term)` with `s <= t` and are scattered into
//! one dense matrix per term column; the lower triangle is mirrored from the
//! upper one. Re-inserting a key overwrites, so retried units are harmless.
//!
//! After assembly the total matrix is checked:
//!
//! - relative asymmetry above [`SYMMETRY_TOLERANCE`] is averaged away with a
//!   warning; above [`SYMMETRY_FATAL`] it is an [`CovError::AssemblyInconsistency`]
//! - a negative diagonal entry is fatal
//! - when the expected blocks were declared, a missing one is fatal
//! - optionally, negative eigenvalues are reported (never corrected)

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::DMatrix;
use serde::Serialize;
use tracing::{debug, info};

use crate::combinator::{BlockResult, ObservableCombinator};
use crate::diagnostics::{Diagnostics, WarningKind};
use crate::domain::{Component, ObservableKind, TermKind, Tracer};
use crate::error::CovError;
use crate::math::linalg::{correlation, max_relative_asymmetry, sorted_eigenvalues, symmetrize};

pub const SYMMETRY_TOLERANCE: f64 = 1e-10;
pub const SYMMETRY_FATAL: f64 = 1e-3;
/// Eigenvalues below `-PSD_TOLERANCE * λ_max` are reported.
pub const PSD_TOLERANCE: f64 = 1e-10;

/// One row of the covariance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndexEntry {
    pub observable: ObservableKind,
    pub component: Component,
    pub tracers: (Tracer, Tracer),
    /// Statistic bin within the segment.
    pub bin: usize,
    /// Bin center in the scheme's native unit.
    pub center: f64,
    pub segment: usize,
}

/// Flattening of (observable and component, tomographic pair, statistic bin).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalIndex {
    entries: Vec<IndexEntry>,
}

impl GlobalIndex {
    pub fn new(combinator: &ObservableCombinator) -> Self {
        let mut entries = Vec::with_capacity(combinator.dimension());
        for (segment, seg) in combinator.segments().iter().enumerate() {
            let centers = combinator.observables()[seg.observable].scheme.bin_centers();
            for (bin, center) in centers.into_iter().enumerate().take(seg.bins) {
                entries.push(IndexEntry {
                    observable: seg.kind,
                    component: seg.component,
                    tracers: seg.tracers,
                    bin,
                    center,
                    segment,
                });
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn entry(&self, i: usize) -> Option<&IndexEntry> {
        self.entries.get(i)
    }
}

/// One `(i, j)` element of the list output.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub i: usize,
    pub j: usize,
    pub value: f64,
    /// Per-term values, in [`CovarianceMatrix::columns`] order.
    pub terms: Vec<f64>,
}

/// The final covariance.
#[derive(Debug, Clone)]
pub struct CovarianceMatrix {
    index: GlobalIndex,
    columns: Vec<TermKind>,
    terms: Vec<DMatrix<f64>>,
    total: DMatrix<f64>,
    symmetrized: bool,
    eigenvalues: Option<Vec<f64>>,
}

impl CovarianceMatrix {
    pub fn index(&self) -> &GlobalIndex {
        &self.index
    }

    pub fn dimension(&self) -> usize {
        self.total.nrows()
    }

    pub fn columns(&self) -> &[TermKind] {
        &self.columns
    }

    pub fn total(&self) -> &DMatrix<f64> {
        &self.total
    }

    pub fn term(&self, kind: TermKind) -> Option<&DMatrix<f64>> {
        self.columns.iter().position(|k| *k == kind).map(|p| &self.terms[p])
    }

    pub fn was_symmetrized(&self) -> bool {
        self.symmetrized
    }

    /// Ascending eigenvalues, when the PSD check ran.
    pub fn eigenvalues(&self) -> Option<&[f64]> {
        self.eigenvalues.as_deref()
    }

    /// Every element in row-major order, read from the same matrices as
    /// [`CovarianceMatrix::total`].
    pub fn list(&self) -> Vec<ListEntry> {
        let n = self.dimension();
        let mut out = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                out.push(ListEntry {
                    i,
                    j,
                    value: self.total[(i, j)],
                    terms: self.terms.iter().map(|m| m[(i, j)]).collect(),
                });
            }
        }
        out
    }

    pub fn correlation(&self) -> DMatrix<f64> {
        correlation(&self.total)
    }
}

/// Range of one segment in the global index.
#[derive(Debug, Clone, Copy)]
struct Span {
    offset: usize,
    bins: usize,
}

#[derive(Debug, Clone)]
pub struct CovarianceAssembler {
    index: GlobalIndex,
    spans: Vec<Span>,
    columns: Vec<TermKind>,
    blocks: BTreeMap<(usize, usize, TermKind), DMatrix<f64>>,
    expected: Option<BTreeSet<(usize, usize, TermKind)>>,
    check_psd: bool,
}

impl CovarianceAssembler {
    /// `columns` lists the term columns the run reports; blocks of any other
    /// term are rejected.
    pub fn new(combinator: &ObservableCombinator, columns: Vec<TermKind>, check_psd: bool) -> Self {
        let spans = combinator
            .segments()
            .iter()
            .map(|s| Span {
                offset: s.offset,
                bins: s.bins,
            })
            .collect();
        Self {
            index: GlobalIndex::new(combinator),
            spans,
            columns,
            blocks: BTreeMap::new(),
            expected: None,
            check_psd,
        }
    }

    pub fn columns(&self) -> &[TermKind] {
        &self.columns
    }

    /// Require every block `combinator` schedules for every column, plus a
    /// mixing block on each diagonal in `mixing_diagonals`.
    pub fn expect_blocks(&mut self, combinator: &ObservableCombinator, mixing_diagonals: &[usize]) {
        let mut expected = BTreeSet::new();
        for (s, t) in combinator.blocks() {
            for &term in self.columns.iter().filter(|k| **k != TermKind::Mixing) {
                expected.insert((s, t, term));
            }
        }
        if self.columns.contains(&TermKind::Mixing) {
            expected.extend(mixing_diagonals.iter().map(|&s| (s, s, TermKind::Mixing)));
        }
        self.expected = Some(expected);
    }

    /// Store one block. Blocks with `s > t` are transposed into `(t, s)`.
    pub fn insert(&mut self, result: BlockResult) -> Result<(), CovError> {
        let BlockResult { s, t, term, block } = result;
        if !self.columns.contains(&term) {
            return Err(CovError::AssemblyInconsistency(format!(
                "Block for term `{}` is not among the run's columns.",
                term.column_name()
            )));
        }
        let (s, t, block) = if s <= t { (s, t, block) } else { (t, s, block.transpose()) };
        let (Some(a), Some(b)) = (self.spans.get(s), self.spans.get(t)) else {
            return Err(CovError::AssemblyInconsistency(format!(
                "Block ({s}, {t}) refers to a segment outside the index ({} segments).",
                self.spans.len()
            )));
        };
        if block.shape() != (a.bins, b.bins) {
            return Err(CovError::AssemblyInconsistency(format!(
                "Block ({s}, {t}) for `{}` has shape {:?}, expected {:?}.",
                term.column_name(),
                block.shape(),
                (a.bins, b.bins)
            )));
        }
        self.blocks.insert((s, t, term), block);
        Ok(())
    }

    pub fn extend(&mut self, results: impl IntoIterator<Item = BlockResult>) -> Result<(), CovError> {
        for r in results {
            self.insert(r)?;
        }
        Ok(())
    }

    /// Scatter, check and freeze the matrix.
    pub fn finish(self, diagnostics: &Diagnostics) -> Result<CovarianceMatrix, CovError> {
        let n = self.index.len();
        if self.columns.is_empty() {
            diagnostics.push(
                WarningKind::DegenerateConfiguration,
                "no covariance term is enabled; the matrix is all zeros",
                None,
            );
        }

        if let Some(expected) = &self.expected {
            let missing: Vec<&(usize, usize, TermKind)> =
                expected.iter().filter(|k| !self.blocks.contains_key(k)).collect();
            if let Some((s, t, term)) = missing.first() {
                return Err(CovError::AssemblyInconsistency(format!(
                    "{} of {} expected blocks never arrived, first ({s}, {t}) for `{}`.",
                    missing.len(),
                    expected.len(),
                    term.column_name()
                )));
            }
        }

        let mut terms: Vec<DMatrix<f64>> = vec![DMatrix::zeros(n, n); self.columns.len()];
        for ((s, t, term), block) in &self.blocks {
            let Some(column) = self.columns.iter().position(|k| k == term) else {
                continue;
            };
            let (a, b) = (self.spans[*s], self.spans[*t]);
            let m = &mut terms[column];
            m.view_mut((a.offset, b.offset), (a.bins, b.bins)).copy_from(block);
            if s != t {
                m.view_mut((b.offset, a.offset), (b.bins, a.bins)).copy_from(&block.transpose());
            }
        }

        let mut total = DMatrix::zeros(n, n);
        for m in &terms {
            total += m;
        }

        let asymmetry = max_relative_asymmetry(&total);
        if asymmetry > SYMMETRY_FATAL {
            return Err(CovError::AssemblyInconsistency(format!(
                "Assembled matrix is asymmetric by {asymmetry:.3e} (relative)."
            )));
        }
        let symmetrized = asymmetry > SYMMETRY_TOLERANCE;
        if symmetrized {
            diagnostics.push(WarningKind::Symmetrized, "assembled covariance", Some(asymmetry));
        }
        // Keep the terms summing bitwise to the total.
        if asymmetry > 0.0 {
            for m in terms.iter_mut() {
                symmetrize(m);
            }
            total = DMatrix::zeros(n, n);
            for m in &terms {
                total += m;
            }
            symmetrize(&mut total);
        }

        if let Some(i) = (0..n).find(|&i| !(total[(i, i)] >= 0.0)) {
            let entry = self.index.entry(i);
            return Err(CovError::AssemblyInconsistency(format!(
                "Diagonal element {i} ({}) is {:e}.",
                entry.map_or_else(String::new, |e| format!(
                    "{} {} {}-{} bin {}",
                    e.observable.tag(),
                    e.component.tag(),
                    e.tracers.0,
                    e.tracers.1,
                    e.bin + 1
                )),
                total[(i, i)]
            )));
        }

        let eigenvalues = if self.check_psd && n > 0 {
            let values = sorted_eigenvalues(&total);
            let largest = values.last().copied().unwrap_or(0.0).abs();
            let smallest = values.first().copied().unwrap_or(0.0);
            if smallest < -PSD_TOLERANCE * largest {
                let negative = values.iter().filter(|v| **v < -PSD_TOLERANCE * largest).count();
                diagnostics.push(
                    WarningKind::NonPositiveEigenvalue,
                    format!("{negative} of {n} eigenvalues are negative"),
                    Some(smallest / largest.max(f64::MIN_POSITIVE)),
                );
            }
            debug!(smallest, largest, "eigenvalue check done");
            Some(values)
        } else {
            None
        };

        info!(
            dimension = n,
            blocks = self.blocks.len(),
            columns = self.columns.len(),
            symmetrized,
            "covariance assembled"
        );
        Ok(CovarianceMatrix {
            index: self.index,
            columns: self.columns,
            terms,
            total,
            symmetrized,
            eigenvalues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::{BinningScheme, ThetaBins};
    use crate::combinator::{ObservableSetup, TomographicBins};
    use crate::domain::{ShearEstimator, Spacing, TermSelection};

    /// Shear `xi_p`, two tomographic bins, two θ bins: segments of 2 rows at
    /// offsets 0, 2 and 4.
    fn combinator() -> ObservableCombinator {
        let scheme = BinningScheme::Theta(ThetaBins::new(10.0, 100.0, 2, Spacing::Log).unwrap());
        let observables = vec![ObservableSetup::new(ObservableKind::CosmicShear, scheme, ShearEstimator::XiP, 0.05).unwrap()];
        let bins = TomographicBins {
            lensing: 2,
            clustering: 0,
        };
        ObservableCombinator::new(observables, bins, TermSelection::default()).unwrap()
    }

    fn block(s: usize, t: usize, term: TermKind, values: [f64; 4]) -> BlockResult {
        BlockResult {
            s,
            t,
            term,
            block: DMatrix::from_row_slice(2, 2, &values),
        }
    }

    #[test]
    fn index_follows_segments() {
        let c = combinator();
        let index = GlobalIndex::new(&c);
        assert_eq!(index.len(), 6);
        let e = index.entry(3).unwrap();
        assert_eq!((e.segment, e.bin), (1, 1));
        assert_eq!(e.tracers.1.bin, 1);
    }

    #[test]
    fn off_diagonal_blocks_are_mirrored_and_overwritten() {
        let c = combinator();
        let mut asm = CovarianceAssembler::new(&c, vec![TermKind::Gauss], false);
        for s in 0..3 {
            asm.insert(block(s, s, TermKind::Gauss, [4.0, 1.0, 1.0, 4.0])).unwrap();
        }
        asm.insert(block(0, 2, TermKind::Gauss, [9.0, 9.0, 9.0, 9.0])).unwrap();
        asm.insert(block(0, 2, TermKind::Gauss, [0.5, 0.25, 0.125, 0.0625])).unwrap();
        let diagnostics = Diagnostics::new();
        let cov = asm.finish(&diagnostics).unwrap();
        let m = cov.total();
        assert_eq!(m[(0, 4)], 0.5);
        assert_eq!(m[(1, 4)], 0.125);
        assert_eq!(m[(4, 1)], 0.125);
        assert_eq!(m[(2, 0)], 0.0);
        assert_eq!(m, &m.transpose());
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn reversed_blocks_are_transposed() {
        let c = combinator();
        let mut asm = CovarianceAssembler::new(&c, vec![TermKind::Gauss], false);
        asm.insert(block(1, 0, TermKind::Gauss, [1.0, 2.0, 3.0, 4.0])).unwrap();
        let cov = asm.finish(&Diagnostics::new()).unwrap();
        assert_eq!(cov.total()[(0, 2)], 1.0);
        assert_eq!(cov.total()[(0, 3)], 3.0);
        assert_eq!(cov.total()[(3, 0)], 3.0);
    }

    #[test]
    fn shape_mismatch_and_unknown_terms_are_rejected() {
        let c = combinator();
        let mut asm = CovarianceAssembler::new(&c, vec![TermKind::Gauss], false);
        let bad = BlockResult {
            s: 0,
            t: 1,
            term: TermKind::Gauss,
            block: DMatrix::zeros(3, 2),
        };
        assert!(matches!(asm.insert(bad), Err(CovError::AssemblyInconsistency(_))));
        let other = block(0, 0, TermKind::Ssc, [1.0, 0.0, 0.0, 1.0]);
        assert!(matches!(asm.insert(other), Err(CovError::AssemblyInconsistency(_))));
        let outside = block(0, 7, TermKind::Gauss, [1.0, 0.0, 0.0, 1.0]);
        assert!(matches!(asm.insert(outside), Err(CovError::AssemblyInconsistency(_))));
    }

    #[test]
    fn small_asymmetry_is_averaged_with_a_warning() {
        let c = combinator();
        let mut asm = CovarianceAssembler::new(&c, vec![TermKind::Gauss], false);
        asm.insert(block(0, 0, TermKind::Gauss, [2.0, 1.0, 1.0 + 1e-6, 2.0])).unwrap();
        let diagnostics = Diagnostics::new();
        let cov = asm.finish(&diagnostics).unwrap();
        assert!(cov.was_symmetrized());
        assert_eq!(cov.total()[(0, 1)], cov.total()[(1, 0)]);
        assert_eq!(diagnostics.count(WarningKind::Symmetrized), 1);
    }

    #[test]
    fn gross_asymmetry_is_fatal() {
        let c = combinator();
        let mut asm = CovarianceAssembler::new(&c, vec![TermKind::Gauss], false);
        asm.insert(block(0, 0, TermKind::Gauss, [2.0, 1.0, 1.5, 2.0])).unwrap();
        assert!(matches!(
            asm.finish(&Diagnostics::new()),
            Err(CovError::AssemblyInconsistency(_))
        ));
    }

    #[test]
    fn negative_diagonal_is_fatal() {
        let c = combinator();
        let mut asm = CovarianceAssembler::new(&c, vec![TermKind::Gauss], false);
        asm.insert(block(1, 1, TermKind::Gauss, [1.0, 0.0, 0.0, -1e-3])).unwrap();
        let err = asm.finish(&Diagnostics::new()).unwrap_err();
        assert!(matches!(err, CovError::AssemblyInconsistency(ref m) if m.contains("Diagonal element 3")), "{err}");
    }

    #[test]
    fn undelivered_blocks_are_fatal_once_declared() {
        let c = combinator();
        let mut asm = CovarianceAssembler::new(&c, vec![TermKind::Gauss, TermKind::Mixing], false);
        asm.expect_blocks(&c, &[0]);
        for (s, t) in c.blocks() {
            asm.insert(block(s, t, TermKind::Gauss, [1.0, 0.0, 0.0, 1.0])).unwrap();
        }
        let err = asm.clone().finish(&Diagnostics::new()).unwrap_err();
        assert!(
            matches!(err, CovError::AssemblyInconsistency(ref m) if m.contains("(0, 0) for `mixing`")),
            "{err}"
        );

        asm.insert(block(0, 0, TermKind::Mixing, [0.5, 0.0, 0.0, 0.5])).unwrap();
        let cov = asm.finish(&Diagnostics::new()).unwrap();
        assert_eq!(cov.total()[(0, 0)], 1.5);
        assert_eq!(cov.total()[(2, 2)], 1.0);

        let mut partial = CovarianceAssembler::new(&c, vec![TermKind::Gauss], false);
        partial.expect_blocks(&c, &[]);
        partial.insert(block(0, 0, TermKind::Gauss, [1.0, 0.0, 0.0, 1.0])).unwrap();
        assert!(matches!(
            partial.finish(&Diagnostics::new()),
            Err(CovError::AssemblyInconsistency(_))
        ));
    }

    #[test]
    fn no_terms_gives_zero_matrix_and_a_warning() {
        let c = combinator();
        let asm = CovarianceAssembler::new(&c, Vec::new(), true);
        let diagnostics = Diagnostics::new();
        let cov = asm.finish(&diagnostics).unwrap();
        assert_eq!(cov.dimension(), 6);
        assert!(cov.total().iter().all(|v| *v == 0.0));
        assert_eq!(diagnostics.count(WarningKind::DegenerateConfiguration), 1);
        assert_eq!(diagnostics.count(WarningKind::NonPositiveEigenvalue), 0);
    }

    #[test]
    fn list_matches_the_dense_matrix_and_sums_the_terms() {
        let c = combinator();
        let columns = vec![TermKind::GaussSva, TermKind::GaussSn];
        let mut asm = CovarianceAssembler::new(&c, columns, true);
        for s in 0..3 {
            asm.insert(block(s, s, TermKind::GaussSva, [0.3, 0.1, 0.1, 0.3])).unwrap();
            asm.insert(block(s, s, TermKind::GaussSn, [0.7, 0.0, 0.0, 0.7])).unwrap();
        }
        asm.insert(block(0, 1, TermKind::GaussSva, [0.05, 0.0, 0.0, 0.05])).unwrap();
        let diagnostics = Diagnostics::new();
        let cov = asm.finish(&diagnostics).unwrap();
        let list = cov.list();
        assert_eq!(list.len(), 36);
        for e in &list {
            assert_eq!(e.value.to_bits(), cov.total()[(e.i, e.j)].to_bits());
            assert_eq!(e.terms[0] + e.terms[1], e.value);
        }
        assert!(cov.eigenvalues().unwrap()[0] > 0.0);
        assert!(diagnostics.is_empty());
        let r = cov.correlation();
        assert!((r[(0, 0)] - 1.0).abs() < 1e-15);
    }

    #[test]
    fn negative_eigenvalues_are_reported_not_fixed() {
        let c = combinator();
        let mut asm = CovarianceAssembler::new(&c, vec![TermKind::Gauss], true);
        asm.insert(block(0, 0, TermKind::Gauss, [1.0, 2.0, 2.0, 1.0])).unwrap();
        let diagnostics = Diagnostics::new();
        let cov = asm.finish(&diagnostics).unwrap();
        assert!(cov.eigenvalues().unwrap()[0] < 0.0);
        assert_eq!(cov.total()[(0, 1)], 2.0);
        assert_eq!(diagnostics.count(WarningKind::NonPositiveEigenvalue), 1);
    }
}
