//! Statistic spaces and their multipole kernels.
//!
//! Every scheme reduces to one contract: bin `a` of the statistic is
//!
//! ```text
//! X_a = ∫ dℓ ℓ/(2π) W_a(ℓ) C(ℓ)
//! ```
//!
//! for a harmonic spectrum `C(ℓ)`. [`BinningScheme::kernel`] tabulates
//! `W_a` on the run's [`EllGrid`]; everything downstream (Gaussian, trispectrum
//! and super-sample terms) only ever sees the resulting [`KernelMatrix`].
//!
//! - `ell`: top-hat averages of `C_ℓ`
//! - `theta`: area-weighted bin averages of correlation functions
//! - `cosebi`: tabulated `W_n` filters
//! - `bandpower`: apodized real-space band-power windows
//! - `projected`: top-hat bins in projected radius at the lens distance

use std::f64::consts::PI;

use nalgebra::DMatrix;

use crate::diagnostics::Diagnostics;
use crate::domain::{Spacing, StatisticKind};
use crate::error::CovError;
use crate::math::{BesselOrder, EllGrid, lin_space, log_space};

pub mod bandpower;
pub mod cosebi;
pub mod ell;
pub mod projected;
pub mod theta;

pub use bandpower::BandpowerBins;
pub use cosebi::CosebiModes;
pub use ell::EllBins;
pub use projected::ProjectedBins;
pub use theta::ThetaBins;

pub const ARCMIN_TO_RAD: f64 = PI / 10_800.0;

/// Bin edges between `min` and `max`.
pub fn bin_edges(min: f64, max: f64, bins: usize, spacing: Spacing, what: &str) -> Result<Vec<f64>, CovError> {
    if bins == 0 {
        return Err(CovError::config(format!("{what}: number of bins must be >= 1.")));
    }
    if !(min.is_finite() && max.is_finite() && max > min) {
        return Err(CovError::config(format!("{what}: need min < max (got {min}..{max}).")));
    }
    match spacing {
        Spacing::Log => {
            if min <= 0.0 {
                return Err(CovError::config(format!(
                    "{what}: log binning requires a positive lower bound (got {min})."
                )));
            }
            log_space(min, max, bins + 1)
        }
        Spacing::Lin => {
            if min < 0.0 {
                return Err(CovError::config(format!("{what}: lower bound must be >= 0 (got {min}).")));
            }
            lin_space(min, max, bins + 1)
        }
    }
}

/// Bin centers: geometric for log bins, arithmetic otherwise.
pub fn bin_centers_of(edges: &[f64], spacing: Spacing) -> Vec<f64> {
    edges
        .windows(2)
        .map(|w| match spacing {
            Spacing::Log => (w[0] * w[1]).sqrt(),
            Spacing::Lin => 0.5 * (w[0] + w[1]),
        })
        .collect()
}

/// `W_a(ℓ_i)` for every bin `a` and node `i` of an [`EllGrid`].
#[derive(Debug, Clone, PartialEq)]
pub struct KernelMatrix {
    /// Bins × grid nodes.
    pub weights: DMatrix<f64>,
    /// Exact `∫ dℓ ℓ W_a(ℓ) W_b(ℓ)` when the scheme knows it in closed form.
    pub noise_overlap: Option<DMatrix<f64>>,
}

impl KernelMatrix {
    pub fn new(weights: DMatrix<f64>) -> Self {
        Self {
            weights,
            noise_overlap: None,
        }
    }

    pub fn with_noise_overlap(mut self, overlap: DMatrix<f64>) -> Self {
        self.noise_overlap = Some(overlap);
        self
    }

    pub fn bins(&self) -> usize {
        self.weights.nrows()
    }

    pub fn nodes(&self) -> usize {
        self.weights.ncols()
    }

    /// `∫ dℓ ℓ/(2π) W_a(ℓ) values(ℓ)` for every bin.
    pub fn project(&self, grid: &EllGrid, values: &[f64]) -> Result<Vec<f64>, CovError> {
        if values.len() != grid.len() || self.nodes() != grid.len() {
            return Err(CovError::numerical(format!(
                "Kernel has {} nodes, grid {} and spectrum {}.",
                self.nodes(),
                grid.len(),
                values.len()
            )));
        }
        Ok((0..self.bins())
            .map(|a| {
                grid.nodes
                    .iter()
                    .zip(&grid.weights)
                    .zip(values)
                    .enumerate()
                    .map(|(i, ((ell, w), c))| w * ell / (2.0 * PI) * self.weights[(a, i)] * c)
                    .sum()
            })
            .collect())
    }

    /// `∫ dℓ ℓ W_a W_b` on the grid.
    pub fn numeric_overlap(&self, other: &KernelMatrix, grid: &EllGrid) -> DMatrix<f64> {
        let scaled = DMatrix::from_fn(self.bins(), self.nodes(), |a, i| {
            self.weights[(a, i)] * grid.weights[i] * grid.nodes[i]
        });
        scaled * other.weights.transpose()
    }
}

/// The statistic space of one observable.
#[derive(Debug, Clone)]
pub enum BinningScheme {
    Ell(EllBins),
    Theta(ThetaBins),
    Cosebi(CosebiModes),
    Bandpower(BandpowerBins),
    ProjectedRadius(ProjectedBins),
}

impl BinningScheme {
    pub fn kind(&self) -> StatisticKind {
        match self {
            BinningScheme::Ell(_) => StatisticKind::Ell,
            BinningScheme::Theta(_) => StatisticKind::Theta,
            BinningScheme::Cosebi(_) => StatisticKind::Cosebi,
            BinningScheme::Bandpower(_) => StatisticKind::Bandpower,
            BinningScheme::ProjectedRadius(_) => StatisticKind::ProjectedRadius,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BinningScheme::Cosebi(c) => c.n_modes(),
            _ => self.bin_edges().len() - 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Edges in the scheme's native unit: multipole, arcmin, mode index
    /// (`n ± 1/2`) or Mpc/h.
    pub fn bin_edges(&self) -> Vec<f64> {
        match self {
            BinningScheme::Ell(b) => b.edges().to_vec(),
            BinningScheme::Theta(b) => b.edges_arcmin().to_vec(),
            BinningScheme::Cosebi(c) => (0..=c.n_modes()).map(|n| n as f64 + 0.5).collect(),
            BinningScheme::Bandpower(b) => b.edges().to_vec(),
            BinningScheme::ProjectedRadius(b) => b.edges().to_vec(),
        }
    }

    pub fn bin_centers(&self) -> Vec<f64> {
        match self {
            BinningScheme::Ell(b) => bin_centers_of(b.edges(), b.spacing()),
            BinningScheme::Theta(b) => bin_centers_of(b.edges_arcmin(), b.spacing()),
            BinningScheme::Cosebi(c) => (1..=c.n_modes()).map(|n| n as f64).collect(),
            BinningScheme::Bandpower(b) => bin_centers_of(b.edges(), b.spacing()),
            BinningScheme::ProjectedRadius(b) => bin_centers_of(b.edges(), b.spacing()),
        }
    }

    /// Multipoles at which the kernels jump; the integration grid puts
    /// panel boundaries there.
    pub fn multipole_breaks(&self) -> Vec<f64> {
        match self {
            BinningScheme::Ell(b) => b.edges().to_vec(),
            _ => Vec::new(),
        }
    }

    /// Multipole range the kernels need, if the scheme is band-limited.
    pub fn multipole_range(&self) -> Option<(f64, f64)> {
        match self {
            BinningScheme::Ell(b) => Some((b.edges()[0], b.edges()[b.edges().len() - 1])),
            BinningScheme::Bandpower(b) => Some((b.edges()[0], b.edges()[b.edges().len() - 1])),
            _ => None,
        }
    }

    /// Widest angle (radians) any kernel oscillates on. Projected radii need
    /// the smallest lens distance.
    pub fn widest_angle(&self, lens_chi_min: Option<f64>) -> Option<f64> {
        match self {
            BinningScheme::Ell(_) => None,
            BinningScheme::Theta(b) => b.edges_rad().last().copied(),
            BinningScheme::Cosebi(c) => Some(c.theta_range_rad().1),
            BinningScheme::Bandpower(b) => Some(b.theta_range_rad().1),
            BinningScheme::ProjectedRadius(b) => lens_chi_min.map(|chi| b.edges()[b.edges().len() - 1] / chi),
        }
    }

    /// Whether kernels depend on the lens-bin distance.
    pub fn needs_lens_distance(&self) -> bool {
        matches!(self, BinningScheme::ProjectedRadius(_))
    }

    /// Tabulate `W_a(ℓ)` on `grid` for Bessel order `order`.
    pub fn kernel(
        &self,
        order: BesselOrder,
        grid: &EllGrid,
        lens_chi: Option<f64>,
        diagnostics: &Diagnostics,
    ) -> Result<KernelMatrix, CovError> {
        match self {
            BinningScheme::Ell(b) => Ok(b.kernel(grid)),
            BinningScheme::Theta(b) => Ok(b.kernel(order, grid)),
            BinningScheme::Cosebi(c) => Ok(c.kernel(grid, diagnostics)),
            BinningScheme::Bandpower(b) => b.kernel(order, grid, diagnostics),
            BinningScheme::ProjectedRadius(b) => {
                let chi = lens_chi.ok_or_else(|| {
                    CovError::config("Projected-radius statistics need a clustering sample for the lens distance.")
                })?;
                b.kernel(order, grid, chi)
            }
        }
    }

    /// Project a spectrum tabulated on `grid` into the scheme's bins.
    pub fn project(&self, kernel: &KernelMatrix, grid: &EllGrid, values: &[f64]) -> Result<Vec<f64>, CovError> {
        if kernel.bins() != self.len() {
            return Err(CovError::numerical(format!(
                "Kernel has {} bins, {} scheme has {}.",
                kernel.bins(),
                self.kind().display_name(),
                self.len()
            )));
        }
        kernel.project(grid, values)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::math::{EllGrid, EllGridSpec};

    pub fn grid(ell_min: f64, ell_max: f64, theta_max: Option<f64>, edges: &[f64]) -> EllGrid {
        let spec = EllGridSpec {
            ell_min,
            ell_max,
            log_panels: 200,
            oversample: 24.0,
            max_nodes: 400_000,
            order: 4,
        };
        EllGrid::build(&spec, theta_max, edges).unwrap()
    }
}
