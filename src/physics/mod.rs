//! Physics backend: cosmology, power spectra, halo model and galaxy occupation.
//!
//! Term evaluators only see the [`PhysicsBackend`] trait. The shipped
//! implementation, [`HaloModelBackend`], tabulates every quantity on a fixed
//! wavenumber grid and a fixed mass grid and memoizes each table per
//! redshift in a [`PhysicsCache`].

use std::sync::Arc;

use tracing::info;

use crate::diagnostics::{Diagnostics, WarningKind};
use crate::error::CovError;
use crate::math::interp_loglog;
use crate::math::log_space;
use crate::math::quad::trapezoid;

pub mod cache;
pub mod cosmology;
pub mod halo;
pub mod hod;
pub mod power;

pub use cache::{CacheKey, PhysicsCache, Quantity};
pub use cosmology::{Background, Cosmology};
pub use halo::{HaloModel, HaloModelSpec, Population};
pub use hod::HodSpec;
pub use power::{LinearPower, NonlinearModel};

/// Fixed wavenumber grid (h/Mpc) on which spectra are tabulated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KGrid {
    pub log10_k_min: f64,
    pub log10_k_max: f64,
    pub points: usize,
}

impl Default for KGrid {
    fn default() -> Self {
        Self {
            log10_k_min: -5.0,
            log10_k_max: 4.0,
            points: 200,
        }
    }
}

/// Immutable inputs of the backend, built once per run.
#[derive(Debug, Clone)]
pub struct PhysicsContext {
    pub cosmology: Cosmology,
    pub halo_model: HaloModelSpec,
    pub hod: HodSpec,
    pub nonlinear: NonlinearModel,
    pub k_grid: KGrid,
    /// Largest redshift any kernel reaches.
    pub z_max: f64,
}

/// Numerical contract of the physics consumed by the term evaluators.
///
/// Table-valued methods return values on [`PhysicsBackend::k_grid`] or
/// [`PhysicsBackend::mass_grid`]; repeated calls with the same redshift
/// return the same shared table.
pub trait PhysicsBackend: Send + Sync {
    fn background(&self) -> &Background;
    fn k_grid(&self) -> &[f64];
    /// `ln k` of [`PhysicsBackend::k_grid`].
    fn ln_k_grid(&self) -> &[f64];
    fn mass_grid(&self) -> &[f64];
    fn rho_mean(&self) -> f64;

    fn linear_power(&self, z: f64) -> Result<Arc<[f64]>, CovError>;
    fn nonlinear_power(&self, z: f64) -> Result<Arc<[f64]>, CovError>;
    /// `dn/dM` on the mass grid.
    fn mass_function(&self, z: f64) -> Result<Arc<[f64]>, CovError>;
    fn halo_bias(&self, z: f64) -> Result<Arc<[f64]>, CovError>;
    fn mass_concentration(&self, z: f64, population: Population) -> Result<Arc<[f64]>, CovError>;

    /// Normalized profile `u(k | M)` of the given population.
    fn fourier_profile(&self, k: f64, m: f64, z: f64, population: Population) -> f64;
    fn central_occupation(&self, m: f64) -> f64;
    fn satellite_occupation(&self, m: f64) -> f64;
    /// Mean galaxy density `n̄_g` and large-scale galaxy bias at `z`.
    fn galaxy_statistics(&self, z: f64) -> Result<(f64, f64), CovError>;

    /// Interpolate a k-grid table at `k` (log-log, end slopes continued).
    fn interpolate_k(&self, table: &[f64], k: f64) -> f64 {
        PowerTable::new(self.ln_k_grid(), table).eval(k)
    }
}

/// A k-grid table prepared for repeated log-log interpolation.
#[derive(Debug, Clone)]
pub struct PowerTable<'a> {
    ln_k: &'a [f64],
    ln_p: Vec<f64>,
}

impl<'a> PowerTable<'a> {
    pub fn new(ln_k: &'a [f64], table: &[f64]) -> Self {
        Self {
            ln_k,
            ln_p: table.iter().map(|p| p.max(1e-300).ln()).collect(),
        }
    }

    pub fn eval(&self, k: f64) -> f64 {
        interp_loglog(self.ln_k, &self.ln_p, k)
    }

    /// `d ln P / d ln k` from the tabulated neighbours of `k`.
    pub fn log_slope(&self, k: f64) -> f64 {
        let n = self.ln_k.len();
        let i = self.ln_k.partition_point(|&v| v <= k.ln()).clamp(1, n - 1);
        (self.ln_p[i] - self.ln_p[i - 1]) / (self.ln_k[i] - self.ln_k[i - 1])
    }
}

pub struct HaloModelBackend {
    ctx: PhysicsContext,
    background: Background,
    linear: LinearPower,
    halo: HaloModel,
    k: Vec<f64>,
    ln_k: Vec<f64>,
    occupation: Vec<(f64, f64)>,
    cache: PhysicsCache,
    diagnostics: Arc<Diagnostics>,
}

impl std::fmt::Debug for HaloModelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaloModelBackend")
            .field("nonlinear", &self.ctx.nonlinear)
            .field("k_points", &self.k.len())
            .field("mass_points", &self.halo.masses().len())
            .field("cached_tables", &self.cache.len())
            .finish()
    }
}

impl HaloModelBackend {
    pub fn new(ctx: PhysicsContext, diagnostics: Arc<Diagnostics>) -> Result<Self, CovError> {
        ctx.hod.validate()?;
        if ctx.k_grid.points < 2 || ctx.k_grid.log10_k_max <= ctx.k_grid.log10_k_min {
            return Err(CovError::config("Wavenumber grid must have >= 2 increasing points."));
        }
        let background = Background::new(&ctx.cosmology, ctx.z_max.max(0.1) + 0.5)?;
        let linear = LinearPower::new(&ctx.cosmology)?;
        let halo = HaloModel::new(&ctx.halo_model, &ctx.cosmology, &linear)?;
        let k = log_space(
            10f64.powf(ctx.k_grid.log10_k_min),
            10f64.powf(ctx.k_grid.log10_k_max),
            ctx.k_grid.points,
        )?;
        let ln_k = k.iter().map(|k| k.ln()).collect();
        let occupation = halo
            .masses()
            .iter()
            .map(|&m| (ctx.hod.central_occupation(m), ctx.hod.satellite_occupation(m)))
            .collect();
        info!(
            nonlinear = ctx.nonlinear.tag(),
            k_points = k.len(),
            mass_points = halo.masses().len(),
            "physics backend ready"
        );
        Ok(Self {
            ctx,
            background,
            linear,
            halo,
            k,
            ln_k,
            occupation,
            cache: PhysicsCache::new(),
            diagnostics,
        })
    }

    pub fn cache(&self) -> &PhysicsCache {
        &self.cache
    }

    pub fn context(&self) -> &PhysicsContext {
        &self.ctx
    }

    fn mass_integral(&self, integrand: impl Fn(usize, f64) -> f64) -> f64 {
        let masses = self.halo.masses();
        let ln_m: Vec<f64> = masses.iter().map(|m| m.ln()).collect();
        let values: Vec<f64> = masses.iter().enumerate().map(|(i, &m)| m * integrand(i, m)).collect();
        trapezoid(&ln_m, &values)
    }
}

impl PhysicsBackend for HaloModelBackend {
    fn background(&self) -> &Background {
        &self.background
    }

    fn k_grid(&self) -> &[f64] {
        &self.k
    }

    fn ln_k_grid(&self) -> &[f64] {
        &self.ln_k
    }

    fn mass_grid(&self) -> &[f64] {
        self.halo.masses()
    }

    fn rho_mean(&self) -> f64 {
        self.halo.rho_mean()
    }

    fn linear_power(&self, z: f64) -> Result<Arc<[f64]>, CovError> {
        self.cache.get_or_compute(CacheKey::new(Quantity::LinearPower, "eh98", z), || {
            let g2 = self.background.growth(z).powi(2);
            Ok(self.k.iter().map(|&k| g2 * self.linear.pk0(k)).collect())
        })
    }

    fn nonlinear_power(&self, z: f64) -> Result<Arc<[f64]>, CovError> {
        match self.ctx.nonlinear {
            NonlinearModel::Linear => self.linear_power(z),
            NonlinearModel::Halofit => {
                self.cache
                    .get_or_compute(CacheKey::new(Quantity::NonlinearPower, "halofit", z), || {
                        let growth = self.background.growth(z);
                        match self.linear.halofit_params(growth) {
                            Some(params) => Ok(self
                                .k
                                .iter()
                                .map(|&k| self.linear.halofit_power(k, z, growth, &params))
                                .collect()),
                            None => {
                                self.diagnostics.push(
                                    WarningKind::NumericalInstability,
                                    format!("halofit found no nonlinear scale at z={z:.3}; using linear power"),
                                    Some(z),
                                );
                                Ok(self.k.iter().map(|&k| growth * growth * self.linear.pk0(k)).collect())
                            }
                        }
                    })
            }
        }
    }

    fn mass_function(&self, z: f64) -> Result<Arc<[f64]>, CovError> {
        self.cache.get_or_compute(CacheKey::new(Quantity::MassFunction, "hmf", z), || {
            let n = self.halo.mass_function(z, self.background.growth(z));
            if n.iter().any(|v| !v.is_finite()) {
                return Err(CovError::numerical(format!("Non-finite mass function at z={z}.")));
            }
            Ok(n)
        })
    }

    fn halo_bias(&self, z: f64) -> Result<Arc<[f64]>, CovError> {
        self.cache.get_or_compute(CacheKey::new(Quantity::HaloBias, "bias", z), || {
            Ok(self.halo.bias(z, self.background.growth(z)))
        })
    }

    fn mass_concentration(&self, z: f64, population: Population) -> Result<Arc<[f64]>, CovError> {
        let quantity = match population {
            Population::Central => Quantity::ConcentrationCentral,
            Population::Satellite => Quantity::ConcentrationSatellite,
        };
        self.cache.get_or_compute(CacheKey::new(quantity, "conc", z), || {
            Ok(self
                .halo
                .masses()
                .iter()
                .map(|&m| self.halo.profile_shape(m, z, population).1)
                .collect())
        })
    }

    fn fourier_profile(&self, k: f64, m: f64, z: f64, population: Population) -> f64 {
        self.halo.nfw_fourier(k, m, z, population)
    }

    fn central_occupation(&self, m: f64) -> f64 {
        self.ctx.hod.central_occupation(m)
    }

    fn satellite_occupation(&self, m: f64) -> f64 {
        self.ctx.hod.satellite_occupation(m)
    }

    fn galaxy_statistics(&self, z: f64) -> Result<(f64, f64), CovError> {
        let stats = self.cache.get_or_compute(CacheKey::new(Quantity::GalaxyDensity, "clf", z), || {
            let n = self.mass_function(z)?;
            let b = self.halo_bias(z)?;
            let occ = |i: usize| self.occupation[i].0 + self.occupation[i].1;
            let nbar = self.mass_integral(|i, _| n[i] * occ(i));
            if !(nbar > 0.0 && nbar.is_finite()) {
                return Err(CovError::numerical(format!(
                    "Galaxy density vanishes at z={z}; check the hod luminosity range."
                )));
            }
            let bias = self.mass_integral(|i, _| n[i] * b[i] * occ(i)) / nbar;
            Ok(vec![nbar, bias * self.ctx.halo_model.bias_2h])
        })?;
        Ok((stats[0], stats[1]))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A backend small enough for unit tests.
    pub fn small_backend() -> HaloModelBackend {
        let ctx = PhysicsContext {
            cosmology: Cosmology::default(),
            halo_model: HaloModelSpec {
                mass_bins: 120,
                log10_m_min: 10.0,
                log10_m_max: 16.0,
                ..HaloModelSpec::default()
            },
            hod: HodSpec::default(),
            nonlinear: NonlinearModel::Halofit,
            k_grid: KGrid {
                points: 120,
                ..KGrid::default()
            },
            z_max: 2.0,
        };
        HaloModelBackend::new(ctx, Arc::new(Diagnostics::new())).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::small_backend;
    use super::*;

    #[test]
    fn tables_are_shared_between_calls() {
        let backend = small_backend();
        let a = backend.nonlinear_power(0.5).unwrap();
        let b = backend.nonlinear_power(0.5).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.cache().fills(), 1);
    }

    #[test]
    fn nonlinear_power_exceeds_linear_on_small_scales() {
        let backend = small_backend();
        let lin = backend.linear_power(0.0).unwrap();
        let nl = backend.nonlinear_power(0.0).unwrap();
        let p_lin = backend.interpolate_k(&lin, 2.0);
        let p_nl = backend.interpolate_k(&nl, 2.0);
        assert!(p_nl > 2.0 * p_lin, "{p_nl} vs {p_lin}");
    }

    #[test]
    fn galaxies_are_biased_tracers() {
        let backend = small_backend();
        let (nbar, bias) = backend.galaxy_statistics(0.3).unwrap();
        assert!(nbar > 0.0);
        assert!(bias > 0.8 && bias < 3.0, "{bias}");
    }

    #[test]
    fn concentration_table_matches_direct_evaluation() {
        let backend = small_backend();
        let table = backend.mass_concentration(0.0, Population::Satellite).unwrap();
        let m = backend.mass_grid()[10];
        let direct = backend.halo.profile_shape(m, 0.0, Population::Satellite).1;
        assert!((table[10] - direct).abs() < 1e-12);
    }
}
