//! Angular bins of correlation functions.
//!
//! Bin `a` reports the area-weighted average of `ξ(θ)` over `[θ1, θ2]`:
//!
//! ```text
//! W_a(ℓ) = ∫_{ℓθ1}^{ℓθ2} x J_n(x) dx / (ℓ² S_a),   S_a = (θ2² - θ1²)/2
//! ```
//!
//! With this kernel a white spectrum `N` has bin covariance
//! `δ_ab N² / (2π A S_a)` per E/B channel, which the kernel carries as its
//! exact noise overlap.

use nalgebra::DMatrix;

use crate::binning::{ARCMIN_TO_RAD, KernelMatrix, bin_edges};
use crate::domain::Spacing;
use crate::error::CovError;
use crate::math::special::integral_x_jn;
use crate::math::{BesselOrder, EllGrid};

#[derive(Debug, Clone, PartialEq)]
pub struct ThetaBins {
    edges_arcmin: Vec<f64>,
    edges_rad: Vec<f64>,
    spacing: Spacing,
}

impl ThetaBins {
    pub fn new(min_arcmin: f64, max_arcmin: f64, bins: usize, spacing: Spacing) -> Result<Self, CovError> {
        let edges_arcmin = bin_edges(min_arcmin, max_arcmin, bins, spacing, "theta-space")?;
        if edges_arcmin[0] <= 0.0 && spacing == Spacing::Lin {
            return Err(CovError::config("theta-space: the first bin must start above zero."));
        }
        let edges_rad = edges_arcmin.iter().map(|t| t * ARCMIN_TO_RAD).collect();
        Ok(Self {
            edges_arcmin,
            edges_rad,
            spacing,
        })
    }

    pub fn edges_arcmin(&self) -> &[f64] {
        &self.edges_arcmin
    }

    pub fn edges_rad(&self) -> &[f64] {
        &self.edges_rad
    }

    pub fn spacing(&self) -> Spacing {
        self.spacing
    }

    pub fn kernel(&self, order: BesselOrder, grid: &EllGrid) -> KernelMatrix {
        top_hat_kernel(order, grid, &self.edges_rad)
    }
}

/// `S = (θ2² - θ1²)/2`, the `∫θ dθ` measure of an annulus.
pub fn annulus_measure(theta_lo: f64, theta_hi: f64) -> f64 {
    0.5 * (theta_hi * theta_hi - theta_lo * theta_lo)
}

/// Area-weighted top-hat kernels for angular edges in radians.
pub fn top_hat_kernel(order: BesselOrder, grid: &EllGrid, edges_rad: &[f64]) -> KernelMatrix {
    let bins = edges_rad.len() - 1;
    let measure: Vec<f64> = edges_rad.windows(2).map(|w| annulus_measure(w[0], w[1])).collect();
    let weights = DMatrix::from_fn(bins, grid.len(), |a, i| {
        let ell = grid.nodes[i];
        integral_x_jn(order, ell * edges_rad[a], ell * edges_rad[a + 1]) / (ell * ell * measure[a])
    });
    let overlap = DMatrix::from_fn(bins, bins, |a, b| if a == b { 1.0 / measure[a] } else { 0.0 });
    KernelMatrix::new(weights).with_noise_overlap(overlap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::test_support::grid;
    use crate::math::special::bessel_j;

    #[test]
    fn small_multipole_limit_is_unity_for_j0() {
        let bins = ThetaBins::new(10.0, 20.0, 1, Spacing::Log).unwrap();
        let grid = grid(1e-3, 10.0, None, &[]);
        let kernel = bins.kernel(BesselOrder::J0, &grid);
        assert!((kernel.weights[(0, 0)] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn kernel_matches_bin_average_of_bessel_function() {
        let bins = ThetaBins::new(30.0, 60.0, 1, Spacing::Lin).unwrap();
        let grid = grid(100.0, 200.0, None, &[]);
        let kernel = bins.kernel(BesselOrder::J2, &grid);
        let (t1, t2) = (bins.edges_rad()[0], bins.edges_rad()[1]);
        let ell = grid.nodes[5];
        let steps = 4000;
        let h = (t2 - t1) / steps as f64;
        let mut avg = 0.0;
        for k in 0..steps {
            let t = t1 + (k as f64 + 0.5) * h;
            avg += t * bessel_j(2, ell * t) * h;
        }
        avg /= annulus_measure(t1, t2);
        assert!((kernel.weights[(0, 5)] - avg).abs() < 1e-7, "{} vs {avg}", kernel.weights[(0, 5)]);
    }

    #[test]
    fn numeric_overlap_approaches_closed_form() {
        let bins = ThetaBins::new(20.0, 200.0, 3, Spacing::Log).unwrap();
        let grid = grid(1.0, 1e5, bins.edges_rad().last().copied(), &[]);
        let kernel = bins.kernel(BesselOrder::J0, &grid);
        let numeric = kernel.numeric_overlap(&kernel, &grid);
        let exact = kernel.noise_overlap.as_ref().unwrap();
        for a in 0..3 {
            let rel = numeric[(a, a)] / exact[(a, a)] - 1.0;
            assert!(rel.abs() < 0.02, "bin {a}: {rel}");
            for b in 0..3 {
                if a != b {
                    assert!(numeric[(a, b)].abs() < 0.02 * exact[(a, a)]);
                }
            }
        }
    }
}
