//! Band powers estimated from apodized correlation functions.
//!
//! Band `a` covers `[ℓ_lo, ℓ_hi]`. Its real-space filter is
//!
//! ```text
//! g_a(θ) = ∫_{ℓ_lo θ}^{ℓ_hi θ} x J_n(x) dx / θ²
//! ```
//!
//! restricted to `[θ_lo, θ_hi]` and multiplied by a cos² taper in `ln θ`.
//! Transforming back gives the harmonic window
//!
//! ```text
//! W_a(ℓ) = (2π / N_a) ∫ θ dθ A(θ) g_a(θ) J_n(ℓθ),   N_a = (ℓ_hi² - ℓ_lo²)/2
//! ```
//!
//! which tends to `2π/N_a` inside the band for an infinite angular range, so a
//! band power is the `ℓ`-weighted mean of `C_ℓ` over the band.

use std::f64::consts::PI;
use std::path::Path;

use nalgebra::DMatrix;
use rayon::prelude::*;
use tracing::debug;

use crate::binning::{ARCMIN_TO_RAD, KernelMatrix, bin_edges};
use crate::diagnostics::{Diagnostics, WarningKind};
use crate::domain::Spacing;
use crate::error::CovError;
use crate::math::quad::composite_gauss_legendre;
use crate::math::special::{bessel_j, integral_x_jn};
use crate::math::{BesselOrder, EllGrid, Extrapolation, Table1D, lin_space, log_space};

const WINDOW_POINTS: usize = 1500;
/// Windows are tabulated up to this multiple of the last band edge.
const WINDOW_REACH: f64 = 10.0;
const THETA_ORDER: usize = 8;
const MAX_THETA_PANELS: usize = 6000;

#[derive(Debug, Clone, PartialEq)]
pub struct BandpowerBins {
    edges: Vec<f64>,
    spacing: Spacing,
    theta_lo: f64,
    theta_hi: f64,
    apodization_log_width: f64,
    windows: Option<Vec<Table1D>>,
}

impl BandpowerBins {
    pub fn new(
        min: f64,
        max: f64,
        bins: usize,
        spacing: Spacing,
        theta_lo_arcmin: f64,
        theta_hi_arcmin: f64,
        apodization_log_width: f64,
    ) -> Result<Self, CovError> {
        let edges = bin_edges(min, max, bins, spacing, "band powers")?;
        if edges[0] <= 0.0 {
            return Err(CovError::config("band powers: the first band must start above ell = 0."));
        }
        if !(theta_lo_arcmin > 0.0 && theta_hi_arcmin > theta_lo_arcmin) {
            return Err(CovError::config(format!(
                "band powers: need 0 < theta_lo < theta_hi (got {theta_lo_arcmin}..{theta_hi_arcmin})."
            )));
        }
        let span = (theta_hi_arcmin / theta_lo_arcmin).ln();
        if !(apodization_log_width >= 0.0 && 2.0 * apodization_log_width <= span) {
            return Err(CovError::config(format!(
                "band powers: apodization width {apodization_log_width} does not fit in ln(theta_hi/theta_lo) = {span:.3}."
            )));
        }
        Ok(Self {
            edges,
            spacing,
            theta_lo: theta_lo_arcmin * ARCMIN_TO_RAD,
            theta_hi: theta_hi_arcmin * ARCMIN_TO_RAD,
            apodization_log_width,
            windows: None,
        })
    }

    /// Use tabulated windows `(ℓ, W_a)` instead of computing them.
    pub fn with_windows(mut self, windows: Vec<Table1D>) -> Result<Self, CovError> {
        if windows.len() != self.edges.len() - 1 {
            return Err(CovError::config(format!(
                "band powers: {} window tables for {} bands.",
                windows.len(),
                self.edges.len() - 1
            )));
        }
        self.windows = Some(windows);
        Ok(self)
    }

    /// Read `window_{a}.table` for every band `a = 1..`.
    pub fn load_windows(self, dir: &Path) -> Result<Self, CovError> {
        let mut windows = Vec::new();
        for band in 1..self.edges.len() {
            let name = format!("window_{band}.table");
            let path = dir.join(&name);
            if !path.is_file() {
                return Err(CovError::MissingTabulatedKernel { table: name, mode: band });
            }
            windows.push(crate::io::tables::read_table(&path)?);
        }
        self.with_windows(windows)
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn spacing(&self) -> Spacing {
        self.spacing
    }

    pub fn theta_range_rad(&self) -> (f64, f64) {
        (self.theta_lo, self.theta_hi)
    }

    /// cos² taper in `ln θ`, one at the centre of the range.
    pub fn apodization(&self, theta: f64) -> f64 {
        if theta < self.theta_lo || theta > self.theta_hi {
            return 0.0;
        }
        let width = self.apodization_log_width;
        if width <= 0.0 {
            return 1.0;
        }
        let x = theta.ln();
        let (lo, hi) = (self.theta_lo.ln(), self.theta_hi.ln());
        if x < lo + width {
            (0.5 * PI * (lo + width - x) / width).cos().powi(2)
        } else if x > hi - width {
            (0.5 * PI * (x - hi + width) / width).cos().powi(2)
        } else {
            1.0
        }
    }

    /// Harmonic windows on a log-spaced table over `[ell_min, ell_top]`.
    pub fn window_tables(&self, order: BesselOrder, ell_min: f64, ell_top: f64) -> Result<Vec<Table1D>, CovError> {
        let ells = log_space(ell_min, ell_top, WINDOW_POINTS)?;
        let panels = (((self.theta_hi - self.theta_lo) * ell_top / PI).ceil() as usize).clamp(16, MAX_THETA_PANELS);
        let breaks = lin_space(self.theta_lo, self.theta_hi, panels + 1)?;
        let (theta, weights) = composite_gauss_legendre(&breaks, THETA_ORDER)?;
        debug!(bands = self.edges.len() - 1, theta_nodes = theta.len(), "band-power windows");

        // Band filters times quadrature weight, θ and taper.
        let filters: Vec<Vec<f64>> = self
            .edges
            .windows(2)
            .map(|band| {
                let norm = 2.0 * PI / (0.5 * (band[1] * band[1] - band[0] * band[0]));
                theta
                    .iter()
                    .zip(&weights)
                    .map(|(&t, &w)| {
                        let g = integral_x_jn(order, band[0] * t, band[1] * t) / (t * t);
                        norm * w * t * self.apodization(t) * g
                    })
                    .collect()
            })
            .collect();

        let n = order.order();
        let rows: Vec<Vec<f64>> = ells
            .par_iter()
            .map(|&ell| {
                let bessel: Vec<f64> = theta.iter().map(|t| bessel_j(n, ell * t)).collect();
                filters
                    .iter()
                    .map(|f| f.iter().zip(&bessel).map(|(a, b)| a * b).sum())
                    .collect()
            })
            .collect();

        (0..filters.len())
            .map(|a| Table1D::new(ells.clone(), rows.iter().map(|r| r[a]).collect()))
            .collect()
    }

    pub fn kernel(&self, order: BesselOrder, grid: &EllGrid, diagnostics: &Diagnostics) -> Result<KernelMatrix, CovError> {
        let computed;
        let tables = match &self.windows {
            Some(tables) => {
                for (a, t) in tables.iter().enumerate() {
                    if t.x_min() > self.edges[a] || t.x_max() < self.edges[a + 1] {
                        diagnostics.push(
                            WarningKind::KernelExtrapolation,
                            format!("band-power window {} does not cover its band", a + 1),
                            None,
                        );
                    }
                }
                tables
            }
            None => {
                let top = grid.ell_max().min(WINDOW_REACH * self.edges[self.edges.len() - 1]);
                computed = self.window_tables(order, grid.ell_min(), top)?;
                &computed
            }
        };
        let weights = DMatrix::from_fn(tables.len(), grid.len(), |a, i| {
            tables[a].eval(grid.nodes[i], Extrapolation::Zero)
        });
        Ok(KernelMatrix::new(weights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::test_support::grid;

    fn bands(apodization: f64) -> BandpowerBins {
        BandpowerBins::new(1000.0, 2000.0, 1, Spacing::Lin, 0.5, 300.0, apodization).unwrap()
    }

    #[test]
    fn window_is_flat_inside_band_and_small_outside() {
        for apodization in [0.0, 0.5] {
            let tables = bands(apodization).window_tables(BesselOrder::J0, 10.0, 20_000.0).unwrap();
            let reference = 2.0 * PI / (0.5 * (2000.0_f64.powi(2) - 1000.0_f64.powi(2)));
            let inside = tables[0].eval(1500.0, Extrapolation::Zero) / reference;
            assert!((inside - 1.0).abs() < 0.1, "apodization {apodization}: {inside}");
            for ell in [500.0, 4000.0, 15_000.0] {
                let outside = tables[0].eval(ell, Extrapolation::Zero) / reference;
                assert!(outside.abs() < 0.1, "apodization {apodization}, ell {ell}: {outside}");
            }
        }
    }

    #[test]
    fn apodization_tapers_both_ends() {
        let b = bands(0.5);
        let (lo, hi) = b.theta_range_rad();
        assert!(b.apodization(lo) < 1e-12);
        assert!(b.apodization(hi) < 1e-12);
        assert_eq!(b.apodization((lo * hi).sqrt()), 1.0);
        assert_eq!(b.apodization(hi * 1.01), 0.0);
    }

    #[test]
    fn oversized_taper_is_rejected() {
        let err = BandpowerBins::new(10.0, 100.0, 2, Spacing::Log, 1.0, 2.0, 1.0).unwrap_err();
        assert!(matches!(err, CovError::Configuration(_)));
    }

    #[test]
    fn tabulated_windows_replace_computed_ones() {
        let window = Table1D::new(vec![900.0, 2100.0], vec![1.0, 1.0]).unwrap();
        let b = bands(0.0).with_windows(vec![window]).unwrap();
        let g = grid(10.0, 5000.0, None, &[]);
        let diagnostics = Diagnostics::new();
        let kernel = b.kernel(BesselOrder::J0, &g, &diagnostics).unwrap();
        let inside = g.nodes.iter().position(|&l| l > 1500.0).unwrap();
        let outside = g.nodes.iter().position(|&l| l > 3000.0).unwrap();
        assert_eq!(kernel.weights[(0, inside)], 1.0);
        assert_eq!(kernel.weights[(0, outside)], 0.0);
        assert!(diagnostics.is_empty());
    }
}
