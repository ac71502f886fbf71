//! Background cosmology.
//!
//! Units: distances in Mpc/h, densities in (M_sun/h) / (Mpc/h)^3.
//!
//! [`Background`] tabulates the comoving distance and the linear growth
//! factor once per run; every other component reads from it.

use serde::{Deserialize, Serialize};

use crate::error::CovError;
use crate::math::quad::cumulative_trapezoid;
use crate::math::{Extrapolation, interp_linear};

/// Hubble distance c/H0 in Mpc/h.
pub const HUBBLE_DISTANCE: f64 = 2997.924_58;
/// Critical density today in (M_sun/h)/(Mpc/h)^3.
pub const RHO_CRIT0: f64 = 2.775e11;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cosmology {
    pub sigma8: f64,
    pub h: f64,
    pub omega_m: f64,
    pub omega_b: f64,
    pub omega_de: f64,
    pub w0: f64,
    pub wa: f64,
    pub ns: f64,
    pub neff: f64,
    /// Sum of neutrino masses in eV.
    pub m_nu: f64,
    pub tcmb: f64,
}

impl Default for Cosmology {
    fn default() -> Self {
        Self {
            sigma8: 0.8,
            h: 0.7,
            omega_m: 0.3,
            omega_b: 0.05,
            omega_de: 0.7,
            w0: -1.0,
            wa: 0.0,
            ns: 0.965,
            neff: 3.046,
            m_nu: 0.06,
            tcmb: 2.7255,
        }
    }
}

impl Cosmology {
    pub fn validate(&self) -> Result<(), CovError> {
        let positive = [
            ("sigma8", self.sigma8),
            ("h", self.h),
            ("omega_m", self.omega_m),
            ("omega_b", self.omega_b),
            ("ns", self.ns),
            ("tcmb", self.tcmb),
        ];
        for (name, v) in positive {
            if !(v.is_finite() && v > 0.0) {
                return Err(CovError::config(format!("cosmology.{name} must be finite and > 0 (got {v}).")));
            }
        }
        if self.omega_b >= self.omega_m {
            return Err(CovError::config("cosmology.omega_b must be smaller than omega_m."));
        }
        if !(self.m_nu >= 0.0 && self.neff >= 0.0 && self.omega_de >= 0.0) {
            return Err(CovError::config("cosmology.m_nu, neff and omega_de must be >= 0."));
        }
        if !(self.w0.is_finite() && self.wa.is_finite()) {
            return Err(CovError::config("cosmology.w0 and wa must be finite."));
        }
        if self.omega_k().abs() > 0.5 {
            return Err(CovError::config(format!(
                "Implied curvature omega_k = {:.3} is outside the supported range.",
                self.omega_k()
            )));
        }
        Ok(())
    }

    /// Photons plus relativistic neutrinos.
    pub fn omega_r(&self) -> f64 {
        let omega_gamma = 2.469e-5 * (self.tcmb / 2.7255).powi(4) / (self.h * self.h);
        omega_gamma * (1.0 + 0.2271 * self.neff)
    }

    pub fn omega_k(&self) -> f64 {
        1.0 - self.omega_m - self.omega_de - self.omega_r()
    }

    /// Massive-neutrino fraction of the matter density.
    pub fn f_nu(&self) -> f64 {
        (self.m_nu / 93.14 / (self.h * self.h) / self.omega_m).min(0.5)
    }

    /// Mean comoving matter density.
    pub fn rho_mean(&self) -> f64 {
        RHO_CRIT0 * self.omega_m
    }

    pub fn w_of_z(&self, z: f64) -> f64 {
        self.w0 + self.wa * z / (1.0 + z)
    }

    fn de_scaling(&self, a: f64) -> f64 {
        a.powf(-3.0 * (1.0 + self.w0 + self.wa)) * (-3.0 * self.wa * (1.0 - a)).exp()
    }

    pub fn e2_of_a(&self, a: f64) -> f64 {
        self.omega_r() / a.powi(4)
            + self.omega_m / a.powi(3)
            + self.omega_k() / (a * a)
            + self.omega_de * self.de_scaling(a)
    }

    /// Dimensionless Hubble rate `E(z) = H(z)/H0`.
    pub fn e_of_z(&self, z: f64) -> f64 {
        self.e2_of_a(1.0 / (1.0 + z)).sqrt()
    }

    fn dln_e_dln_a(&self, a: f64) -> f64 {
        let dln_f = -3.0 * (1.0 + self.w0 + self.wa) + 3.0 * self.wa * a;
        let de2 = -4.0 * self.omega_r() / a.powi(4) - 3.0 * self.omega_m / a.powi(3)
            - 2.0 * self.omega_k() / (a * a)
            + self.omega_de * self.de_scaling(a) * dln_f;
        0.5 * de2 / self.e2_of_a(a)
    }

    pub fn omega_m_of_z(&self, z: f64) -> f64 {
        let a = 1.0 / (1.0 + z);
        self.omega_m / a.powi(3) / self.e2_of_a(a)
    }

    pub fn omega_de_of_z(&self, z: f64) -> f64 {
        let a = 1.0 / (1.0 + z);
        self.omega_de * self.de_scaling(a) / self.e2_of_a(a)
    }

    /// Comoving critical density at redshift `z`.
    pub fn rho_crit_comoving(&self, z: f64) -> f64 {
        RHO_CRIT0 * self.e2_of_a(1.0 / (1.0 + z)) / (1.0 + z).powi(3)
    }
}

/// Tabulated distances and growth.
#[derive(Debug, Clone)]
pub struct Background {
    cosmo: Cosmology,
    z: Vec<f64>,
    chi: Vec<f64>,
    ln_a: Vec<f64>,
    growth: Vec<f64>,
}

const GROWTH_Z_INIT: f64 = 50.0;
const GROWTH_STEPS: usize = 2000;

impl Background {
    pub fn new(cosmo: &Cosmology, z_max: f64) -> Result<Self, CovError> {
        cosmo.validate()?;
        if !(z_max.is_finite() && z_max > 0.0) {
            return Err(CovError::config(format!("Background needs z_max > 0 (got {z_max}).")));
        }
        let steps = ((z_max / 0.001).ceil() as usize).max(100) + 1;
        let dz = z_max / (steps - 1) as f64;
        let z: Vec<f64> = (0..steps).map(|i| i as f64 * dz).collect();
        let inv_e: Vec<f64> = z.iter().map(|&z| HUBBLE_DISTANCE / cosmo.e_of_z(z)).collect();
        let chi = cumulative_trapezoid(&z, &inv_e);

        let (ln_a, growth) = solve_growth(cosmo)?;
        Ok(Self {
            cosmo: cosmo.clone(),
            z,
            chi,
            ln_a,
            growth,
        })
    }

    pub fn cosmology(&self) -> &Cosmology {
        &self.cosmo
    }

    pub fn z_max(&self) -> f64 {
        self.z[self.z.len() - 1]
    }

    /// Comoving line-of-sight distance.
    pub fn chi(&self, z: f64) -> f64 {
        interp_linear(&self.z, &self.chi, z, Extrapolation::Linear)
    }

    pub fn z_of_chi(&self, chi: f64) -> f64 {
        interp_linear(&self.chi, &self.z, chi, Extrapolation::Linear)
    }

    /// Comoving angular-diameter distance `f_K(χ)`.
    pub fn transverse(&self, chi: f64) -> f64 {
        let ok = self.cosmo.omega_k();
        if ok.abs() < 1e-8 {
            return chi;
        }
        let sqrt_k = ok.abs().sqrt() / HUBBLE_DISTANCE;
        if ok > 0.0 {
            (sqrt_k * chi).sinh() / sqrt_k
        } else {
            (sqrt_k * chi).sin() / sqrt_k
        }
    }

    /// Linear growth factor normalized to `D(0) = 1`.
    pub fn growth(&self, z: f64) -> f64 {
        let ln_a = -(1.0 + z).ln();
        interp_linear(&self.ln_a, &self.growth, ln_a, Extrapolation::Linear)
    }
}

/// Integrate `D'' + (2 + dlnE/dlna) D' - 1.5 Ω_m(a) D = 0` in `ln a` with RK4.
fn solve_growth(cosmo: &Cosmology) -> Result<(Vec<f64>, Vec<f64>), CovError> {
    let ln_a0 = -(1.0 + GROWTH_Z_INIT).ln();
    let h = -ln_a0 / GROWTH_STEPS as f64;
    let rhs = |ln_a: f64, d: f64, dp: f64| -> (f64, f64) {
        let a = ln_a.exp();
        let om = cosmo.omega_m / a.powi(3) / cosmo.e2_of_a(a);
        (dp, -(2.0 + cosmo.dln_e_dln_a(a)) * dp + 1.5 * om * d)
    };

    let a0 = ln_a0.exp();
    let (mut d, mut dp) = (a0, a0);
    let mut ln_a_out = Vec::with_capacity(GROWTH_STEPS + 1);
    let mut d_out = Vec::with_capacity(GROWTH_STEPS + 1);
    ln_a_out.push(ln_a0);
    d_out.push(d);
    for i in 0..GROWTH_STEPS {
        let x = ln_a0 + h * i as f64;
        let (k1d, k1p) = rhs(x, d, dp);
        let (k2d, k2p) = rhs(x + 0.5 * h, d + 0.5 * h * k1d, dp + 0.5 * h * k1p);
        let (k3d, k3p) = rhs(x + 0.5 * h, d + 0.5 * h * k2d, dp + 0.5 * h * k2p);
        let (k4d, k4p) = rhs(x + h, d + h * k3d, dp + h * k3p);
        d += h / 6.0 * (k1d + 2.0 * k2d + 2.0 * k3d + k4d);
        dp += h / 6.0 * (k1p + 2.0 * k2p + 2.0 * k3p + k4p);
        ln_a_out.push(x + h);
        d_out.push(d);
    }
    let d_today = d;
    if !(d_today.is_finite() && d_today > 0.0) {
        return Err(CovError::numerical("Growth factor integration diverged."));
    }
    for v in &mut d_out {
        *v /= d_today;
    }
    Ok((ln_a_out, d_out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_lcdm_distance_matches_reference() {
        let cosmo = Cosmology {
            neff: 0.0,
            tcmb: 1e-6,
            ..Cosmology::default()
        };
        let bg = Background::new(&cosmo, 3.0).unwrap();
        // Flat ΛCDM with Ωm = 0.3: χ(z=1) ≈ 2312.7 Mpc/h.
        let chi = bg.chi(1.0);
        assert!((chi / 2312.7 - 1.0).abs() < 1e-3, "{chi}");
        assert!((bg.z_of_chi(chi) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn growth_is_normalized_and_decreasing() {
        let bg = Background::new(&Cosmology::default(), 3.0).unwrap();
        assert!((bg.growth(0.0) - 1.0).abs() < 1e-10);
        assert!(bg.growth(1.0) < bg.growth(0.5));
        // ΛCDM Ωm=0.3: D(z=1)/D(0) ≈ 0.61.
        let d1 = bg.growth(1.0);
        assert!((d1 - 0.61).abs() < 0.01, "{d1}");
    }

    #[test]
    fn rejects_unphysical_parameters() {
        let cosmo = Cosmology {
            omega_b: 0.4,
            ..Cosmology::default()
        };
        assert!(cosmo.validate().is_err());
    }

    #[test]
    fn hubble_rate_is_one_today() {
        let cosmo = Cosmology::default();
        assert!((cosmo.e_of_z(0.0) - 1.0).abs() < 1e-12);
        assert!((cosmo.omega_m_of_z(0.0) - cosmo.omega_m).abs() < 1e-12);
    }
}
