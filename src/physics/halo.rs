//! Halo model ingredients.
//!
//! - mass functions: Press–Schechter, Sheth–Tormen, Tinker et al. (2008)
//! - halo bias: Tinker et al. (2010), Sheth–Tormen, Press–Schechter
//! - concentration: Duffy et al. (2008) or constant, separately for
//!   centrals/matter and satellites
//! - truncated NFW profiles in Fourier space, with optional conversion of the
//!   calibrated 200m definition to the configured overdensity
//!
//! Masses are in M_sun/h and calibrated on Δ = 200 times the mean density.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::error::CovError;
use crate::math::special::sici;
use crate::math::{Extrapolation, interp_linear, log_space};
use crate::physics::cosmology::Cosmology;
use crate::physics::power::LinearPower;

pub const DELTA_C: f64 = 1.686;
const CALIBRATION_DELTA: f64 = 200.0;
const BIAS_NORM_LOG10_M_MIN: f64 = 2.0;
const BIAS_NORM_POINTS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MassFunctionModel {
    PressSchechter,
    ShethTormen,
    #[default]
    Tinker08,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BiasModel {
    #[default]
    Tinker10,
    ShethTormen,
    PressSchechter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConcentrationModel {
    #[default]
    Duffy08,
    Constant,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcentrationSpec {
    pub model: ConcentrationModel,
    /// Used by `constant`; multiplies the relation otherwise.
    pub value: f64,
}

impl Default for ConcentrationSpec {
    fn default() -> Self {
        Self {
            model: ConcentrationModel::Duffy08,
            value: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MassReference {
    #[default]
    Mean,
    Critical,
}

/// Which occupation a profile describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Population {
    /// Dark matter and central galaxies.
    Central,
    Satellite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaloModelSpec {
    pub mass_function: MassFunctionModel,
    pub bias: BiasModel,
    pub concentration_centrals: ConcentrationSpec,
    pub concentration_satellites: ConcentrationSpec,
    pub overdensity: f64,
    pub reference: MassReference,
    pub convert_mass_definition: bool,
    pub log10_m_min: f64,
    pub log10_m_max: f64,
    pub mass_bins: usize,
    /// Amplitude applied to the two-halo (large-scale) galaxy bias.
    pub bias_2h: f64,
}

impl Default for HaloModelSpec {
    fn default() -> Self {
        Self {
            mass_function: MassFunctionModel::Tinker08,
            bias: BiasModel::Tinker10,
            concentration_centrals: ConcentrationSpec::default(),
            concentration_satellites: ConcentrationSpec::default(),
            overdensity: 200.0,
            reference: MassReference::Mean,
            convert_mass_definition: true,
            log10_m_min: 9.0,
            log10_m_max: 18.0,
            mass_bins: 900,
            bias_2h: 1.0,
        }
    }
}

impl HaloModelSpec {
    pub fn validate(&self) -> Result<(), CovError> {
        if !(self.log10_m_min.is_finite() && self.log10_m_max > self.log10_m_min) {
            return Err(CovError::config(format!(
                "halo_model mass range must be increasing (got {}..{}).",
                self.log10_m_min, self.log10_m_max
            )));
        }
        if self.log10_m_min <= BIAS_NORM_LOG10_M_MIN {
            return Err(CovError::config("halo_model.log10_m_min must exceed 2."));
        }
        if self.mass_bins < 3 {
            return Err(CovError::config("halo_model.mass_bins must be >= 3."));
        }
        if !(self.overdensity > 0.0 && self.bias_2h > 0.0) {
            return Err(CovError::config("halo_model.overdensity and bias_2h must be > 0."));
        }
        for c in [self.concentration_centrals, self.concentration_satellites] {
            if !(c.value.is_finite() && c.value > 0.0) {
                return Err(CovError::config("Concentration value must be > 0."));
            }
        }
        Ok(())
    }

    fn is_calibration_definition(&self) -> bool {
        self.reference == MassReference::Mean && (self.overdensity - CALIBRATION_DELTA).abs() < 1e-9
    }
}

/// σ(M) at z = 0 and its logarithmic slope on a mass grid.
#[derive(Debug, Clone)]
struct MassTable {
    masses: Vec<f64>,
    sigma0: Vec<f64>,
    dln_sigma_inv: Vec<f64>,
}

impl MassTable {
    fn new(lin: &LinearPower, rho_mean: f64, masses: Vec<f64>) -> Self {
        let sigma0: Vec<f64> = masses
            .iter()
            .map(|m| lin.sigma_tophat((3.0 * m / (4.0 * PI * rho_mean)).cbrt()))
            .collect();
        let n = masses.len();
        let ln_m: Vec<f64> = masses.iter().map(|m| m.ln()).collect();
        let ln_s: Vec<f64> = sigma0.iter().map(|s| s.ln()).collect();
        let dln_sigma_inv = (0..n)
            .map(|i| {
                let (a, b) = if i == 0 {
                    (0, 1)
                } else if i == n - 1 {
                    (n - 2, n - 1)
                } else {
                    (i - 1, i + 1)
                };
                -(ln_s[b] - ln_s[a]) / (ln_m[b] - ln_m[a])
            })
            .collect();
        Self {
            masses,
            sigma0,
            dln_sigma_inv,
        }
    }
}

/// Evaluated halo model for one cosmology.
#[derive(Debug, Clone)]
pub struct HaloModel {
    spec: HaloModelSpec,
    cosmo: Cosmology,
    rho_mean: f64,
    table: MassTable,
    norm_table: MassTable,
}

impl HaloModel {
    pub fn new(spec: &HaloModelSpec, cosmo: &Cosmology, lin: &LinearPower) -> Result<Self, CovError> {
        spec.validate()?;
        let rho_mean = cosmo.rho_mean();
        let masses: Vec<f64> = log_space(10f64.powf(spec.log10_m_min), 10f64.powf(spec.log10_m_max), spec.mass_bins)?;
        let norm_masses = log_space(
            10f64.powf(BIAS_NORM_LOG10_M_MIN),
            10f64.powf(spec.log10_m_max),
            BIAS_NORM_POINTS,
        )?;
        Ok(Self {
            spec: spec.clone(),
            cosmo: cosmo.clone(),
            rho_mean,
            table: MassTable::new(lin, rho_mean, masses),
            norm_table: MassTable::new(lin, rho_mean, norm_masses),
        })
    }

    pub fn spec(&self) -> &HaloModelSpec {
        &self.spec
    }

    pub fn masses(&self) -> &[f64] {
        &self.table.masses
    }

    pub fn rho_mean(&self) -> f64 {
        self.rho_mean
    }

    fn multiplicity(&self, sigma: f64, z: f64) -> f64 {
        let nu = DELTA_C / sigma;
        match self.spec.mass_function {
            MassFunctionModel::PressSchechter => (2.0 / PI).sqrt() * nu * (-0.5 * nu * nu).exp(),
            MassFunctionModel::ShethTormen => {
                let (a_norm, a, p) = (0.3222, 0.707, 0.3);
                let anu2 = a * nu * nu;
                a_norm * (2.0 * a / PI).sqrt() * nu * (1.0 + anu2.powf(-p)) * (-0.5 * anu2).exp()
            }
            MassFunctionModel::Tinker08 => {
                let zp1 = 1.0 + z;
                let alpha = 10f64.powf(-(0.75 / (CALIBRATION_DELTA / 75.0).ln()).powf(1.2));
                let a_amp = 0.186 * zp1.powf(-0.14);
                let a = 1.47 * zp1.powf(-0.06);
                let b = 2.57 * zp1.powf(-alpha);
                let c = 1.19;
                a_amp * ((sigma / b).powf(-a) + 1.0) * (-c / (sigma * sigma)).exp()
            }
        }
    }

    fn dn_dm(&self, table: &MassTable, z: f64, growth: f64) -> Vec<f64> {
        table
            .masses
            .iter()
            .zip(&table.sigma0)
            .zip(&table.dln_sigma_inv)
            .map(|((m, s0), slope)| self.multiplicity(s0 * growth, z) * self.rho_mean / (m * m) * slope)
            .collect()
    }

    /// Halo mass function `dn/dM` on the mass grid.
    pub fn mass_function(&self, z: f64, growth: f64) -> Vec<f64> {
        self.dn_dm(&self.table, z, growth)
    }

    fn raw_bias(&self, sigma: f64) -> f64 {
        let nu = DELTA_C / sigma;
        match self.spec.bias {
            BiasModel::PressSchechter => 1.0 + (nu * nu - 1.0) / DELTA_C,
            BiasModel::ShethTormen => {
                let (a, p) = (0.707, 0.3);
                let anu2 = a * nu * nu;
                1.0 + (anu2 - 1.0) / DELTA_C + 2.0 * p / (DELTA_C * (1.0 + anu2.powf(p)))
            }
            BiasModel::Tinker10 => {
                let y = CALIBRATION_DELTA.log10();
                let ey = (-(4.0 / y).powi(4)).exp();
                let big_a = 1.0 + 0.24 * y * ey;
                let a = 0.44 * y - 0.88;
                let big_b = 0.183;
                let b = 1.5;
                let big_c = 0.019 + 0.107 * y + 0.19 * ey;
                let c = 2.4;
                1.0 - big_a * nu.powf(a) / (nu.powf(a) + DELTA_C.powf(a)) + big_b * nu.powf(b) + big_c * nu.powf(c)
            }
        }
    }

    /// Linear halo bias on the mass grid, normalized so that all matter is
    /// unbiased: `∫ dM n(M) b(M) M / ρ̄ = 1` over `10^2 .. M_max`.
    pub fn bias(&self, z: f64, growth: f64) -> Vec<f64> {
        let n = self.dn_dm(&self.norm_table, z, growth);
        let masses = &self.norm_table.masses;
        let integrand: Vec<f64> = masses
            .iter()
            .zip(&n)
            .zip(&self.norm_table.sigma0)
            .map(|((m, n), s0)| n * self.raw_bias(s0 * growth) * m * m / self.rho_mean)
            .collect();
        let ln_m: Vec<f64> = masses.iter().map(|m| m.ln()).collect();
        let norm = crate::math::quad::trapezoid(&ln_m, &integrand);
        let norm = if norm > 0.0 && norm.is_finite() { norm } else { 1.0 };
        self.table
            .sigma0
            .iter()
            .map(|s0| self.raw_bias(s0 * growth) / norm)
            .collect()
    }

    /// Concentration of the calibrated (200m) profile.
    pub fn concentration(&self, m: f64, z: f64, population: Population) -> f64 {
        let spec = match population {
            Population::Central => self.spec.concentration_centrals,
            Population::Satellite => self.spec.concentration_satellites,
        };
        match spec.model {
            ConcentrationModel::Constant => spec.value,
            ConcentrationModel::Duffy08 => spec.value * 10.14 * (m / 2.0e12).powf(-0.081) * (1.0 + z).powf(-1.01),
        }
    }

    fn radius(&self, m: f64, delta: f64, rho_ref: f64) -> f64 {
        (3.0 * m / (4.0 * PI * delta * rho_ref)).cbrt()
    }

    fn reference_density(&self, z: f64) -> f64 {
        match self.spec.reference {
            MassReference::Mean => self.rho_mean,
            MassReference::Critical => self.cosmo.rho_crit_comoving(z),
        }
    }

    /// Scale radius and concentration of the profile in the configured mass
    /// definition.
    pub fn profile_shape(&self, m: f64, z: f64, population: Population) -> (f64, f64) {
        let c200 = self.concentration(m, z, population);
        if self.spec.is_calibration_definition() {
            let rs = self.radius(m, CALIBRATION_DELTA, self.rho_mean) / c200;
            return (rs, c200);
        }
        if !self.spec.convert_mass_definition {
            let rs = self.radius(m, self.spec.overdensity, self.reference_density(z)) / c200;
            return (rs, c200);
        }
        let rs = self.radius(m, CALIBRATION_DELTA, self.rho_mean) / c200;
        let target = self.spec.overdensity * self.reference_density(z) / (CALIBRATION_DELTA * self.rho_mean)
            * nfw_mass(c200)
            / c200.powi(3);
        (rs, convert_concentration(target))
    }

    /// Normalized Fourier transform of a truncated NFW profile, `u(k | M)`.
    pub fn nfw_fourier(&self, k: f64, m: f64, z: f64, population: Population) -> f64 {
        let (rs, c) = self.profile_shape(m, z, population);
        nfw_fourier(k * rs, c)
    }

    /// Interpolate an array on the mass grid at an arbitrary mass (log-linear).
    pub fn interpolate(&self, values: &[f64], m: f64) -> f64 {
        let ln_m: Vec<f64> = self.table.masses.iter().map(|m| m.ln()).collect();
        interp_linear(&ln_m, values, m.ln(), Extrapolation::Clamp)
    }
}

/// `m(c) = ln(1 + c) - c / (1 + c)`.
pub fn nfw_mass(c: f64) -> f64 {
    (1.0 + c).ln() - c / (1.0 + c)
}

/// Solve `m(x) / x³ = target` for `x` by bisection (the left side decreases
/// monotonically in `x`).
fn convert_concentration(target: f64) -> f64 {
    let f = |x: f64| nfw_mass(x) / x.powi(3) - target;
    let (mut lo, mut hi) = (1e-3_f64, 1e3_f64);
    if f(lo) < 0.0 {
        return lo;
    }
    if f(hi) > 0.0 {
        return hi;
    }
    for _ in 0..100 {
        let mid = (lo * hi).sqrt();
        if f(mid) > 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo * hi).sqrt()
}

/// `u(x = k r_s, c)` for an NFW profile truncated at `c r_s`.
pub fn nfw_fourier(x: f64, c: f64) -> f64 {
    if x < 1e-4 {
        return 1.0;
    }
    let (si_a, ci_a) = sici(x);
    let (si_b, ci_b) = sici((1.0 + c) * x);
    let value = x.sin() * (si_b - si_a) - (c * x).sin() / ((1.0 + c) * x) + x.cos() * (ci_b - ci_a);
    value / nfw_mass(c)
}
