//! Halo occupation from a conditional luminosity function.
//!
//! Centrals follow a double power-law mass–luminosity relation with
//! log-normal scatter; satellites follow a modified Schechter function whose
//! knee tracks the central luminosity. Occupations are the integrals of these
//! over the sample's luminosity range.

use serde::{Deserialize, Serialize};

use crate::error::CovError;
use crate::math::quad::simpson_weights;
use crate::math::special::erf;

const SATELLITE_STEPS: usize = 201;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HodSpec {
    pub log10_l0: f64,
    pub log10_m1: f64,
    pub gamma1: f64,
    pub gamma2: f64,
    /// Scatter of log10 L for centrals at fixed mass.
    pub sigma_c: f64,
    pub alpha_s: f64,
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    /// Satellite knee as a fraction of the central luminosity.
    pub lstar_ratio: f64,
    /// Luminosity range of the galaxy sample (log10 L in L_sun/h²).
    pub log10_l_min: f64,
    pub log10_l_max: f64,
}

impl Default for HodSpec {
    fn default() -> Self {
        Self {
            log10_l0: 9.95,
            log10_m1: 11.24,
            gamma1: 3.18,
            gamma2: 0.245,
            sigma_c: 0.157,
            alpha_s: -1.18,
            b0: -1.17,
            b1: 1.53,
            b2: -0.217,
            lstar_ratio: 0.562,
            log10_l_min: 9.5,
            log10_l_max: 12.0,
        }
    }
}

impl HodSpec {
    pub fn validate(&self) -> Result<(), CovError> {
        if !(self.sigma_c > 0.0 && self.lstar_ratio > 0.0) {
            return Err(CovError::config("hod.sigma_c and hod.lstar_ratio must be > 0."));
        }
        if !(self.log10_l_max > self.log10_l_min) {
            return Err(CovError::config(format!(
                "hod luminosity range must be increasing (got {}..{}).",
                self.log10_l_min, self.log10_l_max
            )));
        }
        Ok(())
    }

    /// Median central luminosity at halo mass `m`.
    pub fn central_luminosity(&self, m: f64) -> f64 {
        let x = m / 10f64.powf(self.log10_m1);
        10f64.powf(self.log10_l0) * x.powf(self.gamma1) / (1.0 + x).powf(self.gamma1 - self.gamma2)
    }

    /// Mean number of centrals in the luminosity range.
    pub fn central_occupation(&self, m: f64) -> f64 {
        let log_lc = self.central_luminosity(m).log10();
        let s = std::f64::consts::SQRT_2 * self.sigma_c;
        0.5 * (erf((self.log10_l_max - log_lc) / s) - erf((self.log10_l_min - log_lc) / s))
    }

    /// Mean number of satellites in the luminosity range.
    pub fn satellite_occupation(&self, m: f64) -> f64 {
        let lstar = self.lstar_ratio * self.central_luminosity(m);
        let log_m12 = (m / 1e12).log10();
        let phi_star = 10f64.powf(self.b0 + self.b1 * log_m12 + self.b2 * log_m12 * log_m12);

        // ∫ Φ_s dL = φ* ∫ (L/L*)^{α+1} exp(-(L/L*)²) dln L
        let ln_lo = self.log10_l_min * std::f64::consts::LN_10;
        let ln_hi = self.log10_l_max * std::f64::consts::LN_10;
        let h = (ln_hi - ln_lo) / (SATELLITE_STEPS - 1) as f64;
        let Ok(weights) = simpson_weights(SATELLITE_STEPS, h) else {
            return 0.0;
        };
        let integral: f64 = weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let y = (ln_lo + h * i as f64).exp() / lstar;
                w * y.powf(self.alpha_s + 1.0) * (-y * y).exp()
            })
            .sum();
        phi_star * integral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn central_occupation_saturates_at_high_mass() {
        let hod = HodSpec::default();
        assert!(hod.central_occupation(1e10) < 0.05);
        let high = hod.central_occupation(1e13);
        assert!(high > 0.95 && high <= 1.0 + 1e-9, "{high}");
    }

    #[test]
    fn satellites_grow_with_mass() {
        let hod = HodSpec::default();
        let low = hod.satellite_occupation(1e12);
        let high = hod.satellite_occupation(1e15);
        assert!(high > 10.0 * low, "{low} vs {high}");
    }

    #[test]
    fn central_luminosity_follows_double_power_law() {
        let hod = HodSpec::default();
        let m1 = 10f64.powf(hod.log10_m1);
        let ratio = hod.central_luminosity(2.0 * m1 * 1000.0) / hod.central_luminosity(m1 * 1000.0);
        // High-mass slope is gamma2.
        assert!((ratio.log2() - hod.gamma2).abs() < 0.01, "{ratio}");
    }
}
