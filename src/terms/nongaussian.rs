//! Connected (non-Gaussian) covariance from the 1-halo trispectrum.
//!
//! ```text
//! T_abcd(ℓ1, ℓ2) = ∫ dχ q_a q_b q_c q_d / χ⁶ ∫ dM n(M) F_a F_b (k1) F_c F_d (k2),   k = ℓ/χ
//! Cov_st = M_s T M_tᵀ / A
//! ```
//!
//! `F` is `M/ρ̄ u(k|M)` for shear tracers and `(N_c + N_s u_s(k|M)) / n̄_g` for
//! galaxy tracers. The `χ` integral runs over nodes equally spaced in
//! `ln(1+z)`; the mass integral is a composite Simpson rule in `ln M`.
//!
//! With `small_k_damping` each side is multiplied by `erf(k / k_d)`,
//! `k_d = 0.1 h/Mpc`, which suppresses the 1-halo term where it would
//! otherwise stay constant as `k → 0`.

use nalgebra::DMatrix;
use rayon::prelude::*;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::diagnostics::{Diagnostics, WarningKind};
use crate::domain::{Probe, TermKind, Tracer};
use crate::error::CovError;
use crate::math::quad::{simpson_weights, trapezoid_weights};
use crate::math::special::erf;
use crate::math::{Extrapolation, interp_linear, lin_space};
use crate::physics::{PhysicsBackend, Population};
use crate::spectra::LineOfSight;
use crate::terms::{BlockRequest, CoarseEll, TermBlocks, TermEvaluator, sandwich};

const MIN_SLICES: usize = 8;
/// Relative Simpson/trapezoid disagreement above which a mass integral is
/// reported as unresolved.
const MASS_RULE_TOLERANCE: f64 = 1e-2;
/// Wavenumber below which the damped 1-halo term is suppressed, h/Mpc.
pub const ONE_HALO_DAMPING_SCALE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrispectrumSettings {
    /// Step in `ln(1+z)` between redshift slices.
    pub tri_delta_z: f64,
    /// Simpson samples per mass interval (odd).
    pub integration_steps: usize,
    pub integration_intervals: usize,
    /// Damp the 1-halo term on large scales.
    pub small_k_damping: bool,
}

/// `erf(k / k_d)` when `damped`, else one.
pub fn one_halo_damping(k: f64, damped: bool) -> f64 {
    if damped { erf(k / ONE_HALO_DAMPING_SCALE) } else { 1.0 }
}

/// A node of the line-of-sight integral.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedshiftSlice {
    pub z: f64,
    pub chi: f64,
    /// Trapezoid weight in `χ`.
    pub weight: f64,
}

/// Slices equally spaced in `ln(1+z)` over the projection grid.
pub fn redshift_slices(los: &LineOfSight, delta: f64) -> Result<Vec<RedshiftSlice>, CovError> {
    if !(delta > 0.0) {
        return Err(CovError::config("precision.tri_delta_z must be > 0."));
    }
    let grid = los.grid();
    let (z_lo, z_hi) = (grid.z[0], grid.z[grid.len() - 1]);
    let (x_lo, x_hi) = (z_lo.ln_1p(), z_hi.ln_1p());
    let n = (((x_hi - x_lo) / delta).ceil() as usize + 1).max(MIN_SLICES);
    let z: Vec<f64> = lin_space(x_lo, x_hi, n)?.iter().map(|x| x.exp_m1()).collect();
    let chi: Vec<f64> = z
        .iter()
        .map(|&z| interp_linear(&grid.z, &grid.chi, z, Extrapolation::Clamp))
        .collect();
    let weights = trapezoid_weights(&chi);
    Ok(z.into_iter()
        .zip(chi)
        .zip(weights)
        .map(|((z, chi), weight)| RedshiftSlice { z, chi, weight })
        .collect())
}

/// Per-slice profile factors on the coarse multipoles.
#[derive(Debug, Clone)]
struct HaloSlice {
    slice: RedshiftSlice,
    /// Coarse ℓ × mass nodes.
    matter: DMatrix<f64>,
    galaxy: DMatrix<f64>,
    /// Quadrature weight times `dn/d ln M`.
    mass_weights: Vec<f64>,
    /// Large-scale damping per coarse ℓ.
    damping: Vec<f64>,
}

impl HaloSlice {
    fn factors(&self, probe: Probe) -> &DMatrix<f64> {
        match probe {
            Probe::Shear => &self.matter,
            Probe::Galaxy => &self.galaxy,
        }
    }

    /// `Σ_M w_M F_a F_b (k) F_c F_d (l)`.
    fn trispectrum(&self, quartet: [Tracer; 4]) -> DMatrix<f64> {
        let [a, b, c, d] = quartet.map(|t| self.factors(t.probe));
        let left = a.component_mul(b);
        let mut right = c.component_mul(d);
        for (j, w) in self.mass_weights.iter().enumerate() {
            right.column_mut(j).scale_mut(*w);
        }
        let mut t = left * right.transpose();
        for (k, dk) in self.damping.iter().enumerate() {
            t.row_mut(k).scale_mut(*dk);
            t.column_mut(k).scale_mut(*dk);
        }
        t
    }
}

pub struct NonGaussianTerm<'a> {
    los: &'a LineOfSight,
    slices: Vec<HaloSlice>,
    cancel: CancelToken,
}

impl std::fmt::Debug for NonGaussianTerm<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonGaussianTerm").field("slices", &self.slices.len()).finish()
    }
}

impl<'a> NonGaussianTerm<'a> {
    pub fn new(
        backend: &dyn PhysicsBackend,
        los: &'a LineOfSight,
        coarse: &CoarseEll,
        settings: TrispectrumSettings,
        cancel: CancelToken,
        diagnostics: &Diagnostics,
    ) -> Result<Self, CovError> {
        let masses = backend.mass_grid();
        let ln_grid: Vec<f64> = masses.iter().map(|m| m.ln()).collect();
        let (ln_lo, ln_hi) = (ln_grid[0], ln_grid[ln_grid.len() - 1]);
        let intervals = settings.integration_intervals.max(1);
        let steps = settings.integration_steps;
        let nodes = intervals * (steps.saturating_sub(1)) + 1;
        let ln_m = lin_space(ln_lo, ln_hi, nodes)?;
        let h = (ln_hi - ln_lo) / (nodes - 1) as f64;
        let panel = simpson_weights(steps, h)?;
        let mut simpson = vec![0.0; nodes];
        for p in 0..intervals {
            for (j, w) in panel.iter().enumerate() {
                simpson[p * (steps - 1) + j] += w;
            }
        }
        let trapezoid = trapezoid_weights(&ln_m);
        let m: Vec<f64> = ln_m.iter().map(|x| x.exp()).collect();
        let rho = backend.rho_mean();
        let has_galaxies = los.kernels.tracers().any(|t| t.probe == Probe::Galaxy);

        let slices = redshift_slices(los, settings.tri_delta_z)?
            .into_par_iter()
            .map(|slice| {
                cancel.checkpoint()?;
                let dndm = backend.mass_function(slice.z)?;
                let n_ln_m: Vec<f64> = ln_m
                    .iter()
                    .zip(&m)
                    .map(|(&x, &mass)| mass * interp_linear(&ln_grid, &dndm, x, Extrapolation::Zero))
                    .collect();
                let nbar = if has_galaxies { backend.galaxy_statistics(slice.z)?.0 } else { 1.0 };
                let matter = DMatrix::from_fn(coarse.len(), m.len(), |k, j| {
                    let kk = coarse.ell[k] / slice.chi;
                    m[j] / rho * backend.fourier_profile(kk, m[j], slice.z, Population::Central)
                });
                let galaxy = if has_galaxies {
                    DMatrix::from_fn(coarse.len(), m.len(), |k, j| {
                        let kk = coarse.ell[k] / slice.chi;
                        let central = backend.central_occupation(m[j]);
                        let satellite = backend.satellite_occupation(m[j])
                            * backend.fourier_profile(kk, m[j], slice.z, Population::Satellite);
                        (central + satellite) / nbar
                    })
                } else {
                    DMatrix::zeros(coarse.len(), m.len())
                };

                // Resolution check on the matter 1-halo term at mid scales.
                let mid = coarse.len() / 2;
                let fourth = |weights: &[f64]| -> f64 {
                    (0..m.len())
                        .map(|j| weights[j] * n_ln_m[j] * matter[(mid, j)].powi(4))
                        .sum()
                };
                let (s, t) = (fourth(&simpson), fourth(&trapezoid));
                if s != 0.0 && ((s - t) / s).abs() > MASS_RULE_TOLERANCE {
                    diagnostics.push(
                        WarningKind::NumericalInstability,
                        format!("1-halo mass integral unresolved at z={:.3}", slice.z),
                        Some((s - t) / s),
                    );
                }

                let mass_weights = simpson.iter().zip(&n_ln_m).map(|(w, n)| w * n).collect();
                let damping = coarse
                    .ell
                    .iter()
                    .map(|l| one_halo_damping(l / slice.chi, settings.small_k_damping))
                    .collect();
                Ok(HaloSlice {
                    slice,
                    matter,
                    galaxy,
                    mass_weights,
                    damping,
                })
            })
            .collect::<Result<Vec<_>, CovError>>()?;
        debug!(slices = slices.len(), mass_nodes = m.len(), "trispectrum tables ready");
        Ok(Self { los, slices, cancel })
    }

    /// Projected trispectrum on the coarse multipoles.
    pub fn projected(&self, quartet: [Tracer; 4]) -> Result<DMatrix<f64>, CovError> {
        let n = self.slices.first().map_or(0, |s| s.matter.nrows());
        let mut total = DMatrix::zeros(n, n);
        for halo in &self.slices {
            self.cancel.checkpoint()?;
            let chi = halo.slice.chi;
            let mut q = 1.0;
            for t in quartet {
                q *= self.los.kernels.eval(t, chi)?;
            }
            let factor = halo.slice.weight * q / chi.powi(6);
            if factor == 0.0 {
                continue;
            }
            total += halo.trispectrum(quartet) * factor;
        }
        Ok(total)
    }
}

impl TermEvaluator for NonGaussianTerm<'_> {
    fn name(&self) -> &'static str {
        "non-gaussian"
    }

    fn kinds(&self) -> Vec<TermKind> {
        vec![TermKind::NonGaussian]
    }

    fn compute(&self, request: &BlockRequest<'_>) -> Result<TermBlocks, CovError> {
        let area = request.area();
        if !(area > 0.0) {
            return Err(CovError::config("Survey area must be > 0 for the non-Gaussian term."));
        }
        let t = self.projected(request.quartet())?;
        let block = sandwich(request.s.moments()?, &t, request.t.moments()?) / area;
        Ok(vec![(TermKind::NonGaussian, block)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::ThetaBins;
    use crate::binning::test_support::grid;
    use crate::domain::{Component, ObservableKind, Spacing};
    use crate::math::BesselOrder;
    use crate::physics::test_support::small_backend;
    use crate::spectra::test_support::line_of_sight;
    use crate::terms::Side;
    use crate::terms::test_support::{galaxy, max_abs, shear};

    fn settings() -> TrispectrumSettings {
        TrispectrumSettings {
            tri_delta_z: 0.5,
            integration_steps: 11,
            integration_intervals: 6,
            small_k_damping: false,
        }
    }

    #[test]
    fn slices_cover_the_projection_range() {
        let backend = small_backend();
        let los = line_of_sight(&backend);
        let slices = redshift_slices(&los, 0.1).unwrap();
        assert!(slices.len() >= MIN_SLICES);
        assert!((slices[0].z - los.grid().z[0]).abs() < 1e-12);
        let total: f64 = slices.iter().map(|s| s.weight).sum();
        let span = slices[slices.len() - 1].chi - slices[0].chi;
        assert!((total - span).abs() < 1e-9 * span);
    }

    #[test]
    fn block_is_positive_scales_with_area_and_transposes() {
        let backend = small_backend();
        let los = line_of_sight(&backend);
        let g = grid(10.0, 1e4, Some(0.03), &[]);
        let coarse = CoarseEll::new(&g, 16).unwrap();
        let diagnostics = Diagnostics::new();
        let term = NonGaussianTerm::new(&backend, &los, &coarse, settings(), CancelToken::new(), &diagnostics).unwrap();

        let bins = ThetaBins::new(5.0, 100.0, 3, Spacing::Log).unwrap();
        let kernel = bins.kernel(BesselOrder::J0, &g);
        let moments = coarse.moments(&kernel);
        let shear_side = |area: f64| Side {
            observable: ObservableKind::CosmicShear,
            component: Component::XiPlus,
            tracers: (shear(0), shear(1)),
            kernel: &kernel,
            moments: Some(&moments),
            area,
        };
        let clustering = Side {
            observable: ObservableKind::Clustering,
            component: Component::Wtheta,
            tracers: (galaxy(0), galaxy(0)),
            ..shear_side(0.01)
        };

        let small = term.compute(&BlockRequest { s: shear_side(0.01), t: shear_side(0.01) }).unwrap();
        let large = term.compute(&BlockRequest { s: shear_side(0.02), t: shear_side(0.02) }).unwrap();
        let (small, large) = (&small[0].1, &large[0].1);
        for a in 0..3 {
            assert!(small[(a, a)] > 0.0);
            assert!((small[(a, a)] / large[(a, a)] - 2.0).abs() < 1e-12);
        }

        let st = &term.compute(&BlockRequest { s: shear_side(0.01), t: clustering }).unwrap()[0].1;
        let ts = &term.compute(&BlockRequest { s: clustering, t: shear_side(0.01) }).unwrap()[0].1;
        let diff = max_abs(&(st - ts.transpose()));
        assert!(diff <= 1e-10 * max_abs(st), "{diff}");
    }

    #[test]
    fn damping_suppresses_large_scales_only() {
        assert_eq!(one_halo_damping(1e-4, false), 1.0);
        assert!(one_halo_damping(1e-3, true) < 0.02);
        assert!((one_halo_damping(1.0, true) - 1.0).abs() < 1e-12);

        let backend = small_backend();
        let los = line_of_sight(&backend);
        let g = grid(10.0, 1e4, None, &[]);
        let coarse = CoarseEll::new(&g, 12).unwrap();
        let diagnostics = Diagnostics::new();
        let plain = NonGaussianTerm::new(&backend, &los, &coarse, settings(), CancelToken::new(), &diagnostics).unwrap();
        let damped_settings = TrispectrumSettings {
            small_k_damping: true,
            ..settings()
        };
        let damped =
            NonGaussianTerm::new(&backend, &los, &coarse, damped_settings, CancelToken::new(), &diagnostics).unwrap();
        let quartet = [shear(0), shear(0), shear(0), shear(0)];
        let (a, b) = (plain.projected(quartet).unwrap(), damped.projected(quartet).unwrap());
        let last = coarse.len() - 1;
        assert!(a[(0, 0)] > 0.0);
        assert!(b[(0, 0)] < a[(0, 0)]);
        assert!(b[(0, 0)] >= 0.0);
        assert!((b[(last, last)] / a[(last, last)] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cancelled_run_stops_at_a_checkpoint() {
        let backend = small_backend();
        let los = line_of_sight(&backend);
        let g = grid(10.0, 1e4, None, &[]);
        let coarse = CoarseEll::new(&g, 8).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = NonGaussianTerm::new(&backend, &los, &coarse, settings(), cancel, &Diagnostics::new()).unwrap_err();
        assert_eq!(err, CovError::Cancelled);
    }

    #[test]
    fn even_simpson_sampling_is_rejected() {
        let backend = small_backend();
        let los = line_of_sight(&backend);
        let g = grid(10.0, 1e4, None, &[]);
        let coarse = CoarseEll::new(&g, 8).unwrap();
        let mut bad = settings();
        bad.integration_steps = 10;
        let err = NonGaussianTerm::new(&backend, &los, &coarse, bad, CancelToken::new(), &Diagnostics::new());
        assert!(matches!(err, Err(CovError::Configuration(_))));
    }
}
