//! Super-sample covariance.
//!
//! ```text
//! S_kl = ∫ dχ q_a q_b q_c q_d / χ⁴ R_ab(k_k) R_cd(k_l) σ_b²(χ)
//! Cov_st = M_s S M_tᵀ
//! ```
//!
//! `R_xy(k) = b_x b_y (68/21 - (1/3) d ln(k³P)/d ln k) P_nl(k)` is the
//! response of the spectrum to a long-wavelength mode and
//!
//! ```text
//! σ_b²(χ) = 1/χ² ∫ dℓ ℓ/(2π) |W̃(ℓ)|² P_lin(ℓ/χ)
//! ```
//!
//! its variance inside the footprint, for a disc of the survey area or a
//! tabulated mask power spectrum (`|W̃|² = 4π C_ℓ^mask / A²`).
//!
//! [`SscResponse::HaloModel`] replaces the response by its halo-model form
//!
//! ```text
//! R_xy(k) = b_x b_y [(68/21 - (1/3) d ln(k³P_lin)/d ln k) Î_x Î_y P_lin(k) + Î_xy(k)]
//! I¹_x(k)  = ∫ dM n(M) b_h(M) F_x(k|M)
//! I¹_xy(k) = ∫ dM n(M) b_h(M) F_x F_y(k|M)
//! ```
//!
//! with `F` as in the 1-halo trispectrum (galaxy pairs count distinct
//! members only). `Î` divides each `F_x` by `I¹_x` at the smallest tabulated
//! wavenumber, so the large-scale limit matches the linear-bias form.

use std::f64::consts::PI;
use std::sync::{Arc, Mutex};

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::cancel::CancelToken;
use crate::domain::{Probe, SscResponse, TermKind, Tracer};
use crate::error::CovError;
use crate::math::quad::trapezoid;
use crate::math::special::disc_window;
use crate::math::{Extrapolation, Table1D, log_space};
use crate::physics::{PhysicsBackend, Population, PowerTable};
use crate::spectra::LineOfSight;
use crate::terms::nongaussian::{RedshiftSlice, redshift_slices};
use crate::terms::{BlockRequest, CoarseEll, TermBlocks, TermEvaluator, sandwich};

const WINDOW_POINTS: usize = 400;

/// Footprint used for the background-mode variance.
#[derive(Debug, Clone, PartialEq)]
pub enum SurveyWindow {
    /// A disc with the area of the block.
    Disc,
    /// Angular power spectrum of the mask, `(ℓ, C_ℓ)`.
    Mask(Table1D),
}

impl SurveyWindow {
    /// `|W̃(ℓ)|²`, normalized to one at `ℓ = 0`.
    fn power(&self, ell: f64, area: f64) -> f64 {
        match self {
            SurveyWindow::Disc => {
                let radius = (area / PI).sqrt();
                disc_window(ell * radius).powi(2)
            }
            SurveyWindow::Mask(cl) => 4.0 * PI * cl.eval(ell, Extrapolation::Zero) / (area * area),
        }
    }

    fn multipoles(&self, area: f64) -> Result<Vec<f64>, CovError> {
        match self {
            SurveyWindow::Disc => {
                let radius = (area / PI).sqrt();
                log_space(1e-3 / radius, 200.0 / radius, WINDOW_POINTS)
            }
            SurveyWindow::Mask(cl) => Ok(cl.x().iter().copied().filter(|l| *l > 0.0).collect()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SscSettings {
    /// Step in `ln(1+z)` between redshift slices.
    pub tri_delta_z: f64,
    pub response: SscResponse,
}

/// Index of a probe pair in [`ResponseSlice::response`].
fn pair_index(a: Probe, b: Probe) -> usize {
    match (a, b) {
        (Probe::Shear, Probe::Shear) => 0,
        (Probe::Galaxy, Probe::Galaxy) => 2,
        _ => 1,
    }
}

/// Response and linear power of one slice on the coarse multipoles.
#[derive(Debug, Clone)]
struct ResponseSlice {
    slice: RedshiftSlice,
    /// Bias-free `R(k)` at `k = ℓ_k / χ` for matter-matter, matter-galaxy
    /// and galaxy-galaxy pairs.
    response: [Vec<f64>; 3],
    linear: Arc<[f64]>,
}

/// Tree-level response of the nonlinear spectrum, the same for every pair.
fn linear_bias_response(
    backend: &dyn PhysicsBackend,
    coarse: &CoarseEll,
    slice: RedshiftSlice,
) -> Result<[Vec<f64>; 3], CovError> {
    let nonlinear = backend.nonlinear_power(slice.z)?;
    let table = PowerTable::new(backend.ln_k_grid(), &nonlinear);
    let response: Vec<f64> = coarse
        .ell
        .iter()
        .map(|l| {
            let k = l / slice.chi;
            let r = 68.0 / 21.0 - (3.0 + table.log_slope(k)) / 3.0;
            r * table.eval(k)
        })
        .collect();
    Ok([response.clone(), response.clone(), response])
}

/// Halo-model response from the `I¹` integrals of one slice.
fn halo_model_response(
    backend: &dyn PhysicsBackend,
    coarse: &CoarseEll,
    slice: RedshiftSlice,
    has_galaxies: bool,
) -> Result<[Vec<f64>; 3], CovError> {
    let z = slice.z;
    let masses = backend.mass_grid();
    let ln_m: Vec<f64> = masses.iter().map(|m| m.ln()).collect();
    let dndm = backend.mass_function(z)?;
    let bias = backend.halo_bias(z)?;
    let rho = backend.rho_mean();
    let nbar = if has_galaxies { backend.galaxy_statistics(z)?.0 } else { 1.0 };
    let measure: Vec<f64> = masses
        .iter()
        .zip(dndm.iter().zip(bias.iter()))
        .map(|(m, (n, b))| m * n * b)
        .collect();

    // (F_m, F_g, 1-halo galaxy pairs) per mass at wavenumber k.
    let profiles = |k: f64, j: usize| -> (f64, f64, f64) {
        let m = masses[j];
        let matter = m / rho * backend.fourier_profile(k, m, z, Population::Central);
        if !has_galaxies {
            return (matter, 0.0, 0.0);
        }
        let central = backend.central_occupation(m);
        let satellite = backend.satellite_occupation(m) * backend.fourier_profile(k, m, z, Population::Satellite);
        let pairs = 2.0 * central * satellite + satellite * satellite;
        (matter, (central + satellite) / nbar, pairs / (nbar * nbar))
    };
    let integrals = |k: f64| -> [f64; 5] {
        let mut columns = vec![Vec::with_capacity(masses.len()); 5];
        for j in 0..masses.len() {
            let (fm, fg, gg) = profiles(k, j);
            for (c, v) in columns.iter_mut().zip([fm, fg, fm * fm, fm * fg, gg]) {
                c.push(measure[j] * v);
            }
        }
        let mut out = [0.0; 5];
        for (o, c) in out.iter_mut().zip(&columns) {
            *o = trapezoid(&ln_m, c);
        }
        out
    };

    let k_ref = backend.k_grid().first().copied().unwrap_or(1e-4);
    let reference = integrals(k_ref);
    let (norm_m, norm_g) = (reference[0], reference[1]);
    if !(norm_m > 0.0) || (has_galaxies && !(norm_g > 0.0)) {
        return Err(CovError::numerical(format!("Halo-model response has no large-scale limit at z={z:.3}.")));
    }
    let norm_g = if has_galaxies { norm_g } else { 1.0 };

    let linear = backend.linear_power(z)?;
    let table = PowerTable::new(backend.ln_k_grid(), &linear);
    let mut out = [Vec::new(), Vec::new(), Vec::new()];
    for l in &coarse.ell {
        let k = l / slice.chi;
        let [im, ig, imm, img, igg] = integrals(k);
        let (im, ig) = (im / norm_m, ig / norm_g);
        let tree = (68.0 / 21.0 - (3.0 + table.log_slope(k)) / 3.0) * table.eval(k);
        out[0].push(tree * im * im + imm / (norm_m * norm_m));
        out[1].push(tree * im * ig + img / (norm_m * norm_g));
        out[2].push(tree * ig * ig + igg / (norm_g * norm_g));
    }
    Ok(out)
}

pub struct SscTerm<'a> {
    los: &'a LineOfSight,
    ln_k: Vec<f64>,
    window: SurveyWindow,
    slices: Vec<ResponseSlice>,
    cancel: CancelToken,
    /// `σ_b²` per slice, keyed by area.
    variance: Mutex<Vec<(f64, Arc<Vec<f64>>)>>,
}

impl std::fmt::Debug for SscTerm<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SscTerm")
            .field("window", &self.window)
            .field("slices", &self.slices.len())
            .finish()
    }
}

impl<'a> SscTerm<'a> {
    pub fn new(
        backend: &dyn PhysicsBackend,
        los: &'a LineOfSight,
        coarse: &CoarseEll,
        settings: SscSettings,
        window: SurveyWindow,
        cancel: CancelToken,
    ) -> Result<Self, CovError> {
        let ln_k = backend.ln_k_grid().to_vec();
        let has_galaxies = los.kernels.tracers().any(|t| t.probe == Probe::Galaxy);
        let slices = redshift_slices(los, settings.tri_delta_z)?
            .into_par_iter()
            .map(|slice| {
                cancel.checkpoint()?;
                let response = match settings.response {
                    SscResponse::LinearBias => linear_bias_response(backend, coarse, slice)?,
                    SscResponse::HaloModel => halo_model_response(backend, coarse, slice, has_galaxies)?,
                };
                Ok(ResponseSlice {
                    slice,
                    response,
                    linear: backend.linear_power(slice.z)?,
                })
            })
            .collect::<Result<Vec<_>, CovError>>()?;
        Ok(Self {
            los,
            ln_k,
            window,
            slices,
            cancel,
            variance: Mutex::new(Vec::new()),
        })
    }

    /// `σ_b²(χ)` at every slice for footprint area `area`.
    pub fn background_variance(&self, area: f64) -> Result<Arc<Vec<f64>>, CovError> {
        let mut guard = self.variance.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((_, v)) = guard.iter().find(|(a, _)| *a == area) {
            return Ok(Arc::clone(v));
        }
        let ells = self.window.multipoles(area)?;
        if ells.len() < 2 {
            return Err(CovError::config("Mask power spectrum needs at least two positive multipoles."));
        }
        let window: Vec<f64> = ells.iter().map(|&l| self.window.power(l, area)).collect();
        let values = self
            .slices
            .iter()
            .map(|s| {
                let table = PowerTable::new(&self.ln_k, &s.linear);
                let integrand: Vec<f64> = ells
                    .iter()
                    .zip(&window)
                    .map(|(&l, w)| l / (2.0 * PI) * w * table.eval(l / s.slice.chi))
                    .collect();
                trapezoid(&ells, &integrand) / (s.slice.chi * s.slice.chi)
            })
            .collect();
        let values = Arc::new(values);
        guard.push((area, Arc::clone(&values)));
        Ok(values)
    }

    fn bias(&self, tracer: Tracer, chi: f64) -> f64 {
        self.los.bias_at_chi(tracer, chi)
    }
}

impl TermEvaluator for SscTerm<'_> {
    fn name(&self) -> &'static str {
        "super-sample"
    }

    fn kinds(&self) -> Vec<TermKind> {
        vec![TermKind::Ssc]
    }

    fn compute(&self, request: &BlockRequest<'_>) -> Result<TermBlocks, CovError> {
        let area = request.area();
        if !(area > 0.0) {
            return Err(CovError::config("Survey area must be > 0 for the super-sample term."));
        }
        let variance = self.background_variance(area)?;
        let [a, b, c, d] = request.quartet();
        let n = self.slices.first().map_or(0, |s| s.response[0].len());
        let (left_pair, right_pair) = (pair_index(a.probe, b.probe), pair_index(c.probe, d.probe));
        let mut inner = DMatrix::zeros(n, n);
        for (s, sigma2) in self.slices.iter().zip(variance.iter()) {
            self.cancel.checkpoint()?;
            let chi = s.slice.chi;
            let mut q = 1.0;
            for t in [a, b, c, d] {
                q *= self.los.kernels.eval(t, chi)?;
            }
            let factor = s.slice.weight * q / chi.powi(4) * sigma2;
            if factor == 0.0 {
                continue;
            }
            let left = self.bias(a, chi) * self.bias(b, chi);
            let right = self.bias(c, chi) * self.bias(d, chi);
            let (rl, rr) = (&s.response[left_pair], &s.response[right_pair]);
            for k in 0..n {
                for l in 0..n {
                    inner[(k, l)] += factor * left * rl[k] * right * rr[l];
                }
            }
        }
        let block = sandwich(request.s.moments()?, &inner, request.t.moments()?);
        Ok(vec![(TermKind::Ssc, block)])
    }
}
