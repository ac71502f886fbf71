//! Covariance term evaluators.
//!
//! Each evaluator turns one [`BlockRequest`] (two segments, each a tracer
//! pair seen through a [`KernelMatrix`]) into one or more blocks:
//!
//! - [`GaussianTerm`]: disconnected four-point function, optionally split
//!   into sample variance, mixed and noise parts
//! - [`NonGaussianTerm`]: 1-halo trispectrum, optionally damped on large scales
//! - [`SscTerm`]: super-sample covariance with a tree-level or halo-model
//!   response
//!
//! The connected terms work on a coarse log-spaced set of multipoles
//! ([`CoarseEll`]) and reach the statistic bins through kernel moments
//! `M_ak = ∫ dℓ ℓ/(2π) W_a(ℓ) h_k(ℓ)` for piecewise-linear hats `h_k`.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::binning::KernelMatrix;
use crate::domain::{Component, ObservableKind, TermKind, Tracer};
use crate::error::CovError;
use crate::math::{EllGrid, log_space};
use crate::spectra::AngularSpectra;

pub mod gaussian;
pub mod nongaussian;
pub mod ssc;

pub use gaussian::GaussianTerm;
pub use nongaussian::{NonGaussianTerm, TrispectrumSettings};
pub use ssc::{SscSettings, SscTerm, SurveyWindow};

/// Blocks produced for one request, tagged by term.
pub type TermBlocks = Vec<(TermKind, DMatrix<f64>)>;

/// One side of a covariance block.
#[derive(Debug, Clone, Copy)]
pub struct Side<'a> {
    pub observable: ObservableKind,
    pub component: Component,
    /// Tracers of the measured spectrum, in the observable's order.
    pub tracers: (Tracer, Tracer),
    pub kernel: &'a KernelMatrix,
    /// Hat moments of `kernel`; present when connected terms are enabled.
    pub moments: Option<&'a DMatrix<f64>>,
    /// Survey area in steradians.
    pub area: f64,
}

impl Side<'_> {
    pub fn bins(&self) -> usize {
        self.kernel.bins()
    }

    pub fn moments(&self) -> Result<&DMatrix<f64>, CovError> {
        self.moments
            .ok_or_else(|| CovError::numerical("Kernel moments were not prepared for a connected term."))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlockRequest<'a> {
    pub s: Side<'a>,
    pub t: Side<'a>,
}

impl BlockRequest<'_> {
    /// Cross-observable blocks use the larger of the two areas.
    pub fn area(&self) -> f64 {
        self.s.area.max(self.t.area)
    }

    /// `(a, b, c, d)` with `s = (a, b)` and `t = (c, d)`.
    pub fn quartet(&self) -> [Tracer; 4] {
        [self.s.tracers.0, self.s.tracers.1, self.t.tracers.0, self.t.tracers.1]
    }

    pub fn zero_block(&self) -> DMatrix<f64> {
        DMatrix::zeros(self.s.bins(), self.t.bins())
    }
}

/// Shared interface of the covariance terms.
pub trait TermEvaluator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Term kinds this evaluator emits, in output order.
    fn kinds(&self) -> Vec<TermKind>;

    fn compute(&self, request: &BlockRequest<'_>) -> Result<TermBlocks, CovError>;
}

/// Signal spectra resampled on the integration grid, plus noise.
#[derive(Debug, Clone)]
pub struct GridSpectra {
    signal: BTreeMap<(Tracer, Tracer), Vec<f64>>,
    noise: BTreeMap<Tracer, f64>,
}

impl GridSpectra {
    pub fn new(spectra: &AngularSpectra, grid: &EllGrid) -> Self {
        let pairs: Vec<(Tracer, Tracer)> = spectra.pairs().map(|(k, _)| *k).collect();
        let signal = pairs
            .par_iter()
            .map(|&(a, b)| ((a, b), spectra.signal_at(a, b, &grid.nodes)))
            .collect();
        Self {
            signal,
            noise: spectra.noises().clone(),
        }
    }

    /// Signal on the grid; `None` for pairs without a spectrum.
    pub fn signal(&self, a: Tracer, b: Tracer) -> Option<&[f64]> {
        let key = if a <= b { (a, b) } else { (b, a) };
        self.signal.get(&key).map(Vec::as_slice)
    }

    pub fn noise(&self, a: Tracer, b: Tracer) -> f64 {
        if a == b { self.noise.get(&a).copied().unwrap_or(0.0) } else { 0.0 }
    }
}

/// Coarse log-spaced multipoles for the connected terms.
#[derive(Debug, Clone)]
pub struct CoarseEll {
    pub ell: Vec<f64>,
    /// Grid nodes × coarse nodes: `w_i ℓ_i/(2π) h_k(ℓ_i)`.
    hats: DMatrix<f64>,
}

impl CoarseEll {
    pub fn new(grid: &EllGrid, points: usize) -> Result<Self, CovError> {
        if points < 2 {
            return Err(CovError::config("precision.coarse_ell must be >= 2."));
        }
        let ell = log_space(grid.ell_min(), grid.ell_max(), points)?;
        let ln_ell: Vec<f64> = ell.iter().map(|l| l.ln()).collect();
        let mut hats = DMatrix::zeros(grid.len(), points);
        for (i, (&l, &w)) in grid.nodes.iter().zip(&grid.weights).enumerate() {
            let x = l.ln();
            let k = ln_ell.partition_point(|&v| v <= x).clamp(1, points - 1);
            let t = ((x - ln_ell[k - 1]) / (ln_ell[k] - ln_ell[k - 1])).clamp(0.0, 1.0);
            let measure = w * l / (2.0 * PI);
            hats[(i, k - 1)] += measure * (1.0 - t);
            hats[(i, k)] += measure * t;
        }
        Ok(Self { ell, hats })
    }

    pub fn len(&self) -> usize {
        self.ell.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ell.is_empty()
    }

    /// `M = W H`, bins × coarse nodes.
    pub fn moments(&self, kernel: &KernelMatrix) -> DMatrix<f64> {
        &kernel.weights * &self.hats
    }
}

/// `M_s T M_tᵀ`.
pub(crate) fn sandwich(ms: &DMatrix<f64>, inner: &DMatrix<f64>, mt: &DMatrix<f64>) -> DMatrix<f64> {
    ms * inner * mt.transpose()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use nalgebra::DMatrix;

    use crate::domain::{Probe, Tracer};
    use crate::math::log_space;
    use crate::spectra::AngularSpectra;

    pub fn shear(bin: usize) -> Tracer {
        Tracer::new(Probe::Shear, bin)
    }

    pub fn galaxy(bin: usize) -> Tracer {
        Tracer::new(Probe::Galaxy, bin)
    }

    /// Spectra with constant signal per pair and white noise per tracer.
    pub fn flat_spectra(signal: &[((Tracer, Tracer), f64)], noise: &[(Tracer, f64)]) -> AngularSpectra {
        let ell = log_space(0.1, 1e6, 16).unwrap();
        let cells: BTreeMap<_, _> = signal.iter().map(|&(k, v)| (k, vec![v; ell.len()])).collect();
        AngularSpectra::from_tables(ell, cells, noise.iter().copied().collect()).unwrap()
    }

    pub fn max_abs(m: &DMatrix<f64>) -> f64 {
        m.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }
}
