//! COSEBI modes from tabulated filters.
//!
//! Each mode `n` needs three tables: `W_n(ℓ)` for the harmonic projection and
//! `T_±n(θ)` (θ in arcmin) for the real-space noise and mixing terms. The
//! mode is `E_n = ∫ dℓ ℓ/(2π) W_n(ℓ) C_E(ℓ)`, so `W_n` is used as the kernel
//! directly.

use std::path::Path;

use nalgebra::DMatrix;

use crate::binning::{ARCMIN_TO_RAD, KernelMatrix};
use crate::diagnostics::{Diagnostics, WarningKind};
use crate::error::CovError;
use crate::io::tables::{CosebiTable, read_cosebi_table};
use crate::math::quad::trapezoid;
use crate::math::{EllGrid, Extrapolation, Table1D};

/// Relative size of a filter at the edge of its table above which
/// zero-extrapolation is reported.
const EDGE_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Clone, PartialEq)]
pub struct CosebiModes {
    w: Vec<Table1D>,
    t_plus: Vec<Table1D>,
    t_minus: Vec<Table1D>,
}

impl CosebiModes {
    pub fn new(w: Vec<Table1D>, t_plus: Vec<Table1D>, t_minus: Vec<Table1D>) -> Result<Self, CovError> {
        if w.is_empty() {
            return Err(CovError::config("COSEBIs need at least one mode."));
        }
        if t_plus.len() != w.len() || t_minus.len() != w.len() {
            return Err(CovError::config(format!(
                "COSEBI tables disagree on the number of modes (W: {}, T+: {}, T-: {}).",
                w.len(),
                t_plus.len(),
                t_minus.len()
            )));
        }
        if t_plus.iter().chain(&t_minus).any(|t| t.x_min() <= 0.0) {
            return Err(CovError::config("COSEBI T± tables must start at theta > 0."));
        }
        Ok(Self { w, t_plus, t_minus })
    }

    /// Read `Wn{prefix}_{n}.table`, `Tplus{prefix}_{n}.table` and
    /// `Tminus{prefix}_{n}.table` for `n = 1..=n_modes`.
    pub fn load(dir: &Path, prefix: &str, n_modes: usize) -> Result<Self, CovError> {
        let mut w = Vec::with_capacity(n_modes);
        let mut t_plus = Vec::with_capacity(n_modes);
        let mut t_minus = Vec::with_capacity(n_modes);
        for mode in 1..=n_modes {
            w.push(read_cosebi_table(dir, CosebiTable::Wn, prefix, mode)?);
            t_plus.push(read_cosebi_table(dir, CosebiTable::Tplus, prefix, mode)?);
            t_minus.push(read_cosebi_table(dir, CosebiTable::Tminus, prefix, mode)?);
        }
        Self::new(w, t_plus, t_minus)
    }

    pub fn n_modes(&self) -> usize {
        self.w.len()
    }

    /// Angular support of the `T±` filters in arcmin.
    pub fn theta_range_arcmin(&self) -> (f64, f64) {
        let lo = self.t_plus.iter().chain(&self.t_minus).map(Table1D::x_min).fold(f64::INFINITY, f64::min);
        let hi = self.t_plus.iter().chain(&self.t_minus).map(Table1D::x_max).fold(0.0, f64::max);
        (lo, hi)
    }

    pub fn theta_range_rad(&self) -> (f64, f64) {
        let (lo, hi) = self.theta_range_arcmin();
        (lo * ARCMIN_TO_RAD, hi * ARCMIN_TO_RAD)
    }

    /// `T_+` of mode index `m` (zero based), θ in arcmin.
    pub fn t_plus(&self, m: usize) -> &Table1D {
        &self.t_plus[m]
    }

    pub fn t_minus(&self, m: usize) -> &Table1D {
        &self.t_minus[m]
    }

    pub fn kernel(&self, grid: &EllGrid, diagnostics: &Diagnostics) -> KernelMatrix {
        for (m, w) in self.w.iter().enumerate() {
            let peak = w.y().iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
            let first = w.y()[0].abs();
            let last = w.y()[w.y().len() - 1].abs();
            if grid.ell_min() < w.x_min() && first > EDGE_TOLERANCE * peak {
                diagnostics.push(
                    WarningKind::KernelExtrapolation,
                    format!("W_{} starts at ell = {}", m + 1, w.x_min()),
                    Some(first / peak),
                );
            }
            if grid.ell_max() > w.x_max() && last > EDGE_TOLERANCE * peak {
                diagnostics.push(
                    WarningKind::KernelExtrapolation,
                    format!("W_{} ends at ell = {}", m + 1, w.x_max()),
                    Some(last / peak),
                );
            }
        }
        let weights = DMatrix::from_fn(self.n_modes(), grid.len(), |m, i| {
            self.w[m].eval(grid.nodes[i], Extrapolation::Zero)
        });
        KernelMatrix::new(weights).with_noise_overlap(self.noise_overlap())
    }

    /// `½ ∫ θ dθ (T_+m T_+n + T_-m T_-n)`, θ in radians.
    pub fn noise_overlap(&self) -> DMatrix<f64> {
        let n = self.n_modes();
        let mut out = DMatrix::zeros(n, n);
        for a in 0..n {
            for b in a..n {
                let plus = theta_product_integral(&self.t_plus[a], &self.t_plus[b]);
                let minus = theta_product_integral(&self.t_minus[a], &self.t_minus[b]);
                let v = 0.5 * (plus + minus);
                out[(a, b)] = v;
                out[(b, a)] = v;
            }
        }
        out
    }
}

/// `∫ θ dθ f(θ) g(θ)` on the abscissae of `f`, θ converted to radians.
fn theta_product_integral(f: &Table1D, g: &Table1D) -> f64 {
    let theta: Vec<f64> = f.x().iter().map(|t| t * ARCMIN_TO_RAD).collect();
    let integrand: Vec<f64> = f
        .x()
        .iter()
        .zip(f.y())
        .zip(&theta)
        .map(|((t_arcmin, fv), t)| t * fv * g.eval(*t_arcmin, Extrapolation::Zero))
        .collect();
    trapezoid(&theta, &integrand)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::f64::consts::PI;

    use super::*;
    use crate::binning::test_support::grid;
    use crate::math::quad::composite_gauss_legendre;
    use crate::math::special::bessel_j0;
    use crate::math::{lin_space, log_space};

    const THETA_MIN: f64 = 20.0;
    const THETA_MAX: f64 = 200.0;

    /// `sin²(nπu)` in `u = ln(θ/θ_min)/ln(θ_max/θ_min)`.
    fn bump(n: usize, theta_arcmin: f64) -> f64 {
        let u = (theta_arcmin / THETA_MIN).ln() / (THETA_MAX / THETA_MIN).ln();
        if (0.0..=1.0).contains(&u) { (n as f64 * PI * u).sin().powi(2) } else { 0.0 }
    }

    /// Synthetic modes with `T_+ = T_-` and `W_n` its exact order-0 Hankel
    /// transform, tabulated up to `ℓ = 8000`.
    pub(crate) fn bump_modes(n_modes: usize) -> CosebiModes {
        let theta_table = log_space(THETA_MIN, THETA_MAX, 400).unwrap();
        let breaks = lin_space(THETA_MIN * ARCMIN_TO_RAD, THETA_MAX * ARCMIN_TO_RAD, 41).unwrap();
        let (nodes, weights) = composite_gauss_legendre(&breaks, 20).unwrap();
        let ells = lin_space(1.0, 8001.0, 2001).unwrap();
        let mut w = Vec::new();
        let mut t = Vec::new();
        for n in 1..=n_modes {
            let t_values: Vec<f64> = theta_table.iter().map(|&th| bump(n, th)).collect();
            t.push(Table1D::new(theta_table.clone(), t_values).unwrap());
            let w_values: Vec<f64> = ells
                .iter()
                .map(|&ell| {
                    nodes
                        .iter()
                        .zip(&weights)
                        .map(|(&th, &wt)| wt * th * bump(n, th / ARCMIN_TO_RAD) * bessel_j0(ell * th))
                        .sum()
                })
                .collect();
            w.push(Table1D::new(ells.clone(), w_values).unwrap());
        }
        CosebiModes::new(w, t.clone(), t).unwrap()
    }

    #[test]
    fn harmonic_and_real_space_noise_agree() {
        let modes = bump_modes(2);
        let grid = grid(1.0, 8000.0, Some(modes.theta_range_rad().1), &[]);
        let diagnostics = Diagnostics::new();
        let kernel = modes.kernel(&grid, &diagnostics);
        let numeric = kernel.numeric_overlap(&kernel, &grid);
        let exact = kernel.noise_overlap.as_ref().unwrap();
        for a in 0..2 {
            for b in 0..2 {
                let scale = exact[(a, a)];
                assert!(
                    (numeric[(a, b)] - exact[(a, b)]).abs() < 0.02 * scale,
                    "({a},{b}): {} vs {}",
                    numeric[(a, b)],
                    exact[(a, b)]
                );
            }
        }
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn mode_count_mismatch_is_rejected() {
        let modes = bump_modes(1);
        let err = CosebiModes::new(modes.w.clone(), modes.t_plus.clone(), Vec::new()).unwrap_err();
        assert!(matches!(err, CovError::Configuration(_)));
    }

    #[test]
    fn truncated_filter_is_reported() {
        let w = Table1D::new(vec![1.0, 10.0, 100.0], vec![0.0, 1.0, 0.5]).unwrap();
        let t = Table1D::new(vec![1.0, 10.0], vec![1.0, 1.0]).unwrap();
        let modes = CosebiModes::new(vec![w], vec![t.clone()], vec![t]).unwrap();
        let diagnostics = Diagnostics::new();
        let _ = modes.kernel(&grid(1.0, 1000.0, None, &[]), &diagnostics);
        assert_eq!(diagnostics.count(WarningKind::KernelExtrapolation), 1);
    }
}
