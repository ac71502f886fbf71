//! Multipole bins: top-hat averages of `C_ℓ`.

use std::f64::consts::PI;

use nalgebra::DMatrix;

use crate::binning::{KernelMatrix, bin_edges};
use crate::domain::Spacing;
use crate::error::CovError;
use crate::math::EllGrid;

#[derive(Debug, Clone, PartialEq)]
pub struct EllBins {
    edges: Vec<f64>,
    spacing: Spacing,
}

impl EllBins {
    pub fn new(min: f64, max: f64, bins: usize, spacing: Spacing) -> Result<Self, CovError> {
        let edges = bin_edges(min, max, bins, spacing, "ell-space")?;
        Ok(Self { edges, spacing })
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn spacing(&self) -> Spacing {
        self.spacing
    }

    /// `W_a(ℓ) = 2π / (ℓ Δℓ_a)` inside the bin, so `X_a` is the plain mean
    /// of `C_ℓ` over the bin.
    pub fn kernel(&self, grid: &EllGrid) -> KernelMatrix {
        let bins = self.edges.len() - 1;
        let weights = DMatrix::from_fn(bins, grid.len(), |a, i| {
            let (lo, hi) = (self.edges[a], self.edges[a + 1]);
            let ell = grid.nodes[i];
            if ell >= lo && ell < hi { 2.0 * PI / (ell * (hi - lo)) } else { 0.0 }
        });
        KernelMatrix::new(weights)
    }
}
