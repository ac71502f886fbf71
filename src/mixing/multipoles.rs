//! Azimuthal multipoles.
//!
//! Around a center pixel, the weighted neighbours of angular bin `a` define
//!
//! ```text
//! G_n^a = Σ_j w_j e^{i n φ_j}
//! ```
//!
//! and the correlation function between two points at radii `θ_a`, `θ_b`
//! and opening angle `φ` expands as `ξ(φ) = Σ_n ξ_n e^{i n φ}`. The
//! triplet sum behind the mixed term is then `Σ_n ξ_n G_n^a conj(G_n^b)`.

use std::f64::consts::PI;

use crate::math::{Extrapolation, Table1D};

/// Minimal complex accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Phase {
    pub re: f64,
    pub im: f64,
}

impl Phase {
    pub fn from_angle(phi: f64) -> Self {
        Self {
            re: phi.cos(),
            im: phi.sin(),
        }
    }

    fn mul(self, other: Self) -> Self {
        Self {
            re: self.re * other.re - self.im * other.im,
            im: self.re * other.im + self.im * other.re,
        }
    }

    /// `Re(self conj(other))`.
    pub fn dot(self, other: Self) -> f64 {
        self.re * other.re + self.im * other.im
    }
}

/// Add `w e^{i n φ}` for `n = 0..=nmax` into `out`.
pub fn accumulate(out: &mut [Phase], weight: f64, phi: f64) {
    let step = Phase::from_angle(phi);
    let mut current = Phase { re: 1.0, im: 0.0 };
    for (n, slot) in out.iter_mut().enumerate() {
        if n > 0 {
            current = current.mul(step);
        }
        slot.re += weight * current.re;
        slot.im += weight * current.im;
    }
}

/// `Σ_{n=-nmax}^{nmax} c_n Re(G_n^a conj(G_n^b))`, using `G_{-n} = conj(G_n)`
/// and an even `c_n`.
pub fn contract(ga: &[Phase], gb: &[Phase], coefficients: &[f64]) -> f64 {
    ga.iter()
        .zip(gb)
        .zip(coefficients)
        .enumerate()
        .map(|(n, ((a, b), c))| {
            let multiplicity = if n == 0 { 1.0 } else { 2.0 };
            multiplicity * c * a.dot(*b)
        })
        .sum()
}

/// `ξ_n(θ_a, θ_b)` for `n = 0..=nmax` by the midpoint rule in `φ`.
pub fn correlation_multipoles(xi: &Table1D, theta_a: f64, theta_b: f64, nmax: usize, nbins_phi: usize) -> Vec<f64> {
    let dphi = 2.0 * PI / nbins_phi as f64;
    let samples: Vec<(f64, f64)> = (0..nbins_phi)
        .map(|k| {
            let phi = (k as f64 + 0.5) * dphi;
            let d2 = theta_a * theta_a + theta_b * theta_b - 2.0 * theta_a * theta_b * phi.cos();
            (phi, xi.eval(d2.max(0.0).sqrt(), Extrapolation::Clamp))
        })
        .collect();
    (0..=nmax)
        .map(|n| samples.iter().map(|(phi, v)| v * (n as f64 * phi).cos()).sum::<f64>() / nbins_phi as f64)
        .collect()
}

/// Spin-4 shift for `ξ_-` blocks: `(ξ_{n-4} + ξ_{n+4}) / 2`, with
/// `ξ_{-m} = ξ_m`. `xi` must reach `nmax + 4`.
pub fn spin_four_shift(xi: &[f64], nmax: usize) -> Vec<f64> {
    (0..=nmax)
        .map(|n| {
            let lower = xi[(n as i64 - 4).unsigned_abs() as usize];
            let upper = xi[n + 4];
            0.5 * (lower + upper)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_ring_has_only_aliased_multipoles() {
        let mut g = vec![Phase::default(); 9];
        for k in 0..8 {
            accumulate(&mut g, 1.0, k as f64 * PI / 4.0);
        }
        assert!((g[0].re - 8.0).abs() < 1e-12);
        for (n, slot) in g.iter().enumerate().take(8).skip(1) {
            assert!(slot.re.abs() < 1e-12 && slot.im.abs() < 1e-12, "n={n}: {slot:?}");
        }
        assert!((g[8].re - 8.0).abs() < 1e-12);
    }

    #[test]
    fn quadratic_correlation_has_two_multipoles() {
        // ξ(d) = d² = θa² + θb² - 2 θa θb cos φ.
        let d: Vec<f64> = (0..400).map(|i| i as f64 * 0.01).collect();
        let xi = Table1D::new(d.clone(), d.iter().map(|x| x * x).collect()).unwrap();
        let (ta, tb) = (0.7, 1.1);
        let m = correlation_multipoles(&xi, ta, tb, 4, 64);
        // Linear interpolation of x² overestimates by at most h²/4.
        let tol = 1e-4;
        assert!((m[0] - (ta * ta + tb * tb)).abs() < tol, "{}", m[0]);
        assert!((m[1] + ta * tb).abs() < tol, "{}", m[1]);
        for v in &m[2..] {
            assert!(v.abs() < tol, "{v}");
        }
    }

    #[test]
    fn contraction_reproduces_direct_triplet_sum() {
        // Two neighbours per annulus; compare Σ_jk ξ(φ_j - φ_k) with the
        // multipole form for ξ(φ) = 1 + 0.5 cos φ + 0.25 cos 2φ.
        let xi = |phi: f64| 1.0 + 0.5 * phi.cos() + 0.25 * (2.0 * phi).cos();
        let coefficients = [1.0, 0.25, 0.125];
        let (aj, ak) = ([0.3, 2.0], [1.1, 4.0]);
        let (wj, wk) = ([1.0, 2.0], [0.5, 1.5]);
        let mut ga = vec![Phase::default(); 3];
        let mut gb = vec![Phase::default(); 3];
        for (w, phi) in wj.iter().zip(aj) {
            accumulate(&mut ga, *w, phi);
        }
        for (w, phi) in wk.iter().zip(ak) {
            accumulate(&mut gb, *w, phi);
        }
        let mut direct = 0.0;
        for (w1, p1) in wj.iter().zip(aj) {
            for (w2, p2) in wk.iter().zip(ak) {
                direct += w1 * w2 * xi(p1 - p2);
            }
        }
        let via_multipoles = contract(&ga, &gb, &coefficients);
        assert!((direct - via_multipoles).abs() < 1e-12, "{direct} vs {via_multipoles}");
    }

    #[test]
    fn spin_four_shift_reflects_negative_orders() {
        let xi: Vec<f64> = (0..9).map(|n| n as f64).collect();
        let shifted = spin_four_shift(&xi, 4);
        assert_eq!(shifted[0], 4.0);
        assert_eq!(shifted[1], 0.5 * (3.0 + 5.0));
        assert_eq!(shifted[4], 0.5 * (0.0 + 8.0));
    }
}
