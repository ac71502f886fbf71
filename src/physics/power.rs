//! Matter power spectra.
//!
//! - linear: Eisenstein & Hu (1998) no-wiggle transfer function, normalized
//!   to `sigma8` with a top-hat filter
//! - nonlinear: Halofit with the Takahashi et al. (2012) coefficients
//!
//! Wavenumbers are in h/Mpc, spectra in (Mpc/h)^3.

use std::f64::consts::PI;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::CovError;
use crate::math::quad::simpson_weights;
use crate::physics::cosmology::Cosmology;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum NonlinearModel {
    Linear,
    #[default]
    Halofit,
}

impl NonlinearModel {
    pub fn tag(self) -> &'static str {
        match self {
            NonlinearModel::Linear => "linear",
            NonlinearModel::Halofit => "halofit",
        }
    }
}

const LN_K_MIN: f64 = -11.512_925_464_970_229; // ln 1e-5
const LN_K_MAX: f64 = 11.512_925_464_970_229; // ln 1e5
const FINE_STEPS: usize = 4001;

/// Linear power spectrum today plus the fine tabulation used for filtered
/// variances.
#[derive(Debug, Clone)]
pub struct LinearPower {
    cosmo: Cosmology,
    amplitude: f64,
    ln_k: Vec<f64>,
    /// `Δ²(k) = k³ P(k) / 2π²` at z = 0 on `ln_k`.
    delta2: Vec<f64>,
    simpson: Vec<f64>,
}

impl LinearPower {
    pub fn new(cosmo: &Cosmology) -> Result<Self, CovError> {
        let h = (LN_K_MAX - LN_K_MIN) / (FINE_STEPS - 1) as f64;
        let ln_k: Vec<f64> = (0..FINE_STEPS).map(|i| LN_K_MIN + h * i as f64).collect();
        let simpson = simpson_weights(FINE_STEPS, h)?;
        let mut out = Self {
            cosmo: cosmo.clone(),
            amplitude: 1.0,
            ln_k,
            delta2: Vec::new(),
            simpson,
        };
        out.delta2 = out.ln_k.iter().map(|lk| out.delta2_unnormalized(lk.exp())).collect();

        let s8 = out.sigma_tophat(8.0);
        if !(s8.is_finite() && s8 > 0.0) {
            return Err(CovError::numerical("Unnormalized sigma8 is not positive."));
        }
        let scale = (cosmo.sigma8 / s8).powi(2);
        out.amplitude = scale;
        for v in &mut out.delta2 {
            *v *= scale;
        }
        Ok(out)
    }

    /// No-wiggle transfer function.
    pub fn transfer(&self, k: f64) -> f64 {
        let c = &self.cosmo;
        let omh2 = c.omega_m * c.h * c.h;
        let obh2 = c.omega_b * c.h * c.h;
        let fb = c.omega_b / c.omega_m;
        let theta = c.tcmb / 2.7;

        let s = 44.5 * (9.83 / omh2).ln() / (1.0 + 10.0 * obh2.powf(0.75)).sqrt();
        let alpha_gamma = 1.0 - 0.328 * (431.0 * omh2).ln() * fb + 0.38 * (22.3 * omh2).ln() * fb * fb;
        let k_mpc = k * c.h;
        let gamma_eff = c.omega_m * c.h * (alpha_gamma + (1.0 - alpha_gamma) / (1.0 + (0.43 * k_mpc * s).powi(4)));
        let q = k * theta * theta / gamma_eff;
        let l0 = (2.0 * std::f64::consts::E + 1.8 * q).ln();
        let c0 = 14.2 + 731.0 / (1.0 + 62.5 * q);
        l0 / (l0 + c0 * q * q)
    }

    /// Small-scale suppression from free-streaming neutrinos.
    fn neutrino_suppression(&self, k: f64) -> f64 {
        let f_nu = self.cosmo.f_nu();
        if f_nu <= 0.0 {
            return 1.0;
        }
        let k_nr = 0.0145 * (self.cosmo.m_nu / 3.0).sqrt() * self.cosmo.omega_m.sqrt();
        1.0 - 8.0 * f_nu * k * k / (k * k + k_nr * k_nr)
    }

    fn delta2_unnormalized(&self, k: f64) -> f64 {
        let t = self.transfer(k);
        let p = k.powf(self.cosmo.ns) * t * t * self.neutrino_suppression(k);
        k.powi(3) * p / (2.0 * PI * PI)
    }

    /// Linear power at z = 0.
    pub fn pk0(&self, k: f64) -> f64 {
        let t = self.transfer(k);
        self.amplitude * k.powf(self.cosmo.ns) * t * t * self.neutrino_suppression(k)
    }

    /// RMS of the z = 0 linear field in a top-hat sphere of radius `r` (Mpc/h).
    pub fn sigma_tophat(&self, r: f64) -> f64 {
        let mut acc = 0.0;
        for ((lk, d2), w) in self.ln_k.iter().zip(&self.delta2).zip(&self.simpson) {
            let x = lk.exp() * r;
            let win = if x < 1e-3 {
                1.0 - x * x / 10.0
            } else {
                3.0 * (x.sin() - x * x.cos()) / (x * x * x)
            };
            acc += w * d2 * win * win;
        }
        acc.sqrt()
    }

    /// Gaussian-filtered moments `(S0, S1, S2)` of `Δ²` scaled by `growth²`,
    /// with `S_n = ∫ dlnk Δ² k^{2n} exp(-k²R²)`.
    fn gaussian_moments(&self, r: f64, growth: f64) -> (f64, f64, f64) {
        let g2 = growth * growth;
        let (mut s0, mut s1, mut s2) = (0.0, 0.0, 0.0);
        for ((lk, d2), w) in self.ln_k.iter().zip(&self.delta2).zip(&self.simpson) {
            let k2 = (2.0 * lk).exp();
            let arg = k2 * r * r;
            if arg > 700.0 {
                break;
            }
            let base = w * g2 * d2 * (-arg).exp();
            s0 += base;
            s1 += base * k2;
            s2 += base * k2 * k2;
        }
        (s0, s1, s2)
    }

    /// Halofit spectral parameters at a given linear growth factor.
    ///
    /// Returns `None` when the field never reaches σ = 1 on the supported
    /// scales (very high redshift); callers fall back to linear theory.
    pub fn halofit_params(&self, growth: f64) -> Option<HalofitParams> {
        let sigma = |r: f64| self.gaussian_moments(r, growth).0.sqrt();
        let (mut lo, mut hi) = (1e-3_f64.ln(), 50.0_f64.ln());
        if sigma(lo.exp()) < 1.0 || sigma(hi.exp()) > 1.0 {
            return None;
        }
        for _ in 0..60 {
            let mid = 0.5 * (lo + hi);
            if sigma(mid.exp()) > 1.0 {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let r = (0.5 * (lo + hi)).exp();
        let (s0, s1, s2) = self.gaussian_moments(r, growth);
        let y = r * r;
        let neff = -3.0 + 2.0 * y * s1 / s0;
        let curvature = (3.0 + neff).powi(2) + 4.0 * y * s1 / s0 - 4.0 * y * y * s2 / s0;
        Some(HalofitParams {
            k_sigma: 1.0 / r,
            neff,
            curvature,
        })
    }

    /// Halofit nonlinear power at redshift `z` for the given parameters.
    pub fn halofit_power(&self, k: f64, z: f64, growth: f64, p: &HalofitParams) -> f64 {
        let c = &self.cosmo;
        let n = p.neff;
        let cc = p.curvature;
        let om = c.omega_m_of_z(z);
        let ode_w = c.omega_de_of_z(z) * (1.0 + c.w_of_z(z));

        let an = 10f64.powf(
            1.5222 + 2.8553 * n + 2.3706 * n * n + 0.9903 * n.powi(3) + 0.2250 * n.powi(4) - 0.6038 * cc
                + 0.1749 * ode_w,
        );
        let bn = 10f64.powf(-0.5642 + 0.5864 * n + 0.5716 * n * n - 1.5474 * cc + 0.2279 * ode_w);
        let cn = 10f64.powf(0.3698 + 2.0404 * n + 0.8161 * n * n + 0.5869 * cc);
        let gamma = 0.1971 - 0.0843 * n + 0.8460 * cc;
        let alpha = (6.0835 + 1.3373 * n - 0.1959 * n * n - 5.5274 * cc).abs();
        let beta = 2.0379 - 0.7354 * n + 0.3157 * n * n + 1.2490 * n.powi(3) + 0.3980 * n.powi(4) - 0.1682 * cc;
        let nu = 10f64.powf(5.2105 + 3.6902 * n);
        let f1 = om.powf(-0.0307);
        let f2 = om.powf(-0.0585);
        let f3 = om.powf(0.0743);

        let d2_lin = growth * growth * k.powi(3) * self.pk0(k) / (2.0 * PI * PI);
        let y = k / p.k_sigma;
        let fy = y / 4.0 + y * y / 8.0;
        let d2_q = d2_lin * (1.0 + d2_lin).powf(beta) / (1.0 + alpha * d2_lin) * (-fy).exp();
        let d2_h_prime = an * y.powf(3.0 * f1) / (1.0 + bn * y.powf(f2) + (cn * f3 * y).powf(3.0 - gamma));
        let d2_h = d2_h_prime / (1.0 + nu / (y * y));
        (d2_q + d2_h) * 2.0 * PI * PI / k.powi(3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HalofitParams {
    pub k_sigma: f64,
    pub neff: f64,
    pub curvature: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_reproduces_sigma8() {
        let cosmo = Cosmology::default();
        let lin = LinearPower::new(&cosmo).unwrap();
        assert!((lin.sigma_tophat(8.0) - cosmo.sigma8).abs() < 1e-10);
    }

    #[test]
    fn transfer_function_limits() {
        let lin = LinearPower::new(&Cosmology::default()).unwrap();
        assert!((lin.transfer(1e-5) - 1.0).abs() < 1e-3);
        assert!(lin.transfer(10.0) < 1e-3);
    }

    #[test]
    fn halofit_boosts_small_scales_only() {
        let cosmo = Cosmology::default();
        let lin = LinearPower::new(&cosmo).unwrap();
        let params = lin.halofit_params(1.0).unwrap();
        assert!(params.k_sigma > 0.1 && params.k_sigma < 1.0, "{params:?}");

        let large = lin.halofit_power(0.01, 0.0, 1.0, &params) / lin.pk0(0.01);
        assert!((large - 1.0).abs() < 0.02, "{large}");
        let small = lin.halofit_power(1.0, 0.0, 1.0, &params) / lin.pk0(1.0);
        assert!(small > 2.0, "{small}");
    }

    #[test]
    fn halofit_falls_back_when_field_is_linear() {
        let lin = LinearPower::new(&Cosmology::default()).unwrap();
        assert!(lin.halofit_params(1e-3).is_none());
    }
}
