//! Bins in projected comoving radius `r_p` (Mpc/h).
//!
//! Each lens bin maps the radii onto angles `θ = r_p / χ̄` at its mean
//! distance; the kernels are then the angular top hats of [`super::theta`].

use crate::binning::theta::top_hat_kernel;
use crate::binning::{KernelMatrix, bin_edges};
use crate::domain::Spacing;
use crate::error::CovError;
use crate::math::{BesselOrder, EllGrid};

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedBins {
    edges: Vec<f64>,
    spacing: Spacing,
}

impl ProjectedBins {
    pub fn new(min: f64, max: f64, bins: usize, spacing: Spacing) -> Result<Self, CovError> {
        let edges = bin_edges(min, max, bins, spacing, "projected radius")?;
        if edges[0] <= 0.0 {
            return Err(CovError::config("projected radius: the first bin must start above zero."));
        }
        Ok(Self { edges, spacing })
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn spacing(&self) -> Spacing {
        self.spacing
    }

    /// Angular edges (radians) at comoving distance `chi`.
    pub fn angular_edges(&self, chi: f64) -> Vec<f64> {
        self.edges.iter().map(|r| r / chi).collect()
    }

    pub fn kernel(&self, order: BesselOrder, grid: &EllGrid, chi: f64) -> Result<KernelMatrix, CovError> {
        if !(chi.is_finite() && chi > 0.0) {
            return Err(CovError::config(format!("projected radius: lens distance must be > 0 (got {chi}).")));
        }
        Ok(top_hat_kernel(order, grid, &self.angular_edges(chi)))
    }
}
