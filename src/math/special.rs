//! Special functions used by the kernels and halo profiles.
//!
//! - Bessel functions of the first kind `J_n` (series for small argument,
//!   Hankel asymptotic expansion for large argument)
//! - closed-form antiderivatives of `x J_n(x)` for the even orders we need
//! - sine/cosine integrals `Si`, `Ci`
//! - the error function

use std::f64::consts::{FRAC_PI_2, PI};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;
const SERIES_SWITCH: f64 = 12.0;
const MAX_TERMS: usize = 200;

/// Bessel function of the first kind of integer order `n >= 0`, for `x >= 0`.
pub fn bessel_j(n: u32, x: f64) -> f64 {
    let ax = x.abs();
    let value = if ax < SERIES_SWITCH {
        bessel_j_series(n, ax)
    } else {
        bessel_j_asymptotic(n, ax)
    };
    if x < 0.0 && n % 2 == 1 { -value } else { value }
}

pub fn bessel_j0(x: f64) -> f64 {
    bessel_j(0, x)
}

pub fn bessel_j1(x: f64) -> f64 {
    bessel_j(1, x)
}

fn bessel_j_series(n: u32, x: f64) -> f64 {
    let half = 0.5 * x;
    let mut term = 1.0;
    for k in 1..=n {
        term *= half / k as f64;
    }
    if term == 0.0 {
        return 0.0;
    }
    let q = -half * half;
    let mut sum = term;
    for k in 1..MAX_TERMS {
        term *= q / (k as f64 * (k as f64 + n as f64));
        sum += term;
        if term.abs() < 1e-17 * sum.abs() && k as f64 > half {
            break;
        }
    }
    sum
}

fn bessel_j_asymptotic(n: u32, x: f64) -> f64 {
    let mu = 4.0 * (n as f64) * (n as f64);
    let mut p = 1.0;
    let mut q = 0.0;
    let mut t = 1.0_f64;
    for m in 1..60 {
        let odd = (2 * m - 1) as f64;
        let next = t * (mu - odd * odd) / (m as f64 * 8.0 * x);
        if next.abs() > t.abs() && m > 2 {
            break;
        }
        t = next;
        // t_m enters P for even m and Q for odd m, with alternating signs.
        match m % 4 {
            1 => q += t,
            2 => p -= t,
            3 => q -= t,
            _ => p += t,
        }
        if t.abs() < 1e-17 {
            break;
        }
    }
    let chi = x - (0.5 * n as f64 + 0.25) * PI;
    (2.0 / (PI * x)).sqrt() * (p * chi.cos() - q * chi.sin())
}

/// `2 J1(x) / x`, the Fourier transform of a normalized disc.
pub fn disc_window(x: f64) -> f64 {
    if x.abs() < 1e-6 {
        1.0 - x * x / 8.0
    } else {
        2.0 * bessel_j1(x) / x
    }
}

/// Even Bessel orders that appear in projected statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BesselOrder {
    J0,
    J2,
    J4,
}

impl BesselOrder {
    pub fn order(self) -> u32 {
        match self {
            BesselOrder::J0 => 0,
            BesselOrder::J2 => 2,
            BesselOrder::J4 => 4,
        }
    }
}

/// `∫_{x1}^{x2} x J_n(x) dx` for `0 <= x1 <= x2`.
///
/// Uses the power series when both ends are small (where the closed forms
/// lose digits to cancellation) and the closed-form antiderivatives otherwise:
///
/// ```text
/// ∫ x J0 = x J1
/// ∫ x J2 = -x J1 - 2 J0
/// ∫ x J4 = x J1 - 4 J0 - 12 J2
/// ```
pub fn integral_x_jn(order: BesselOrder, x1: f64, x2: f64) -> f64 {
    if x2 <= 4.0 {
        return integral_x_jn_series(order.order(), x1, x2);
    }
    antiderivative_x_jn(order, x2) - antiderivative_x_jn(order, x1)
}

fn antiderivative_x_jn(order: BesselOrder, x: f64) -> f64 {
    let j0 = bessel_j0(x);
    let j1 = bessel_j1(x);
    match order {
        BesselOrder::J0 => x * j1,
        BesselOrder::J2 => -x * j1 - 2.0 * j0,
        BesselOrder::J4 => x * j1 - 4.0 * j0 - 12.0 * bessel_j(2, x),
    }
}

fn integral_x_jn_series(n: u32, x1: f64, x2: f64) -> f64 {
    // c_k = (-1)^k / (k! (k+n)! 2^(2k+n)), term integrates x^(2k+n+1).
    let mut c = 1.0;
    for k in 1..=n {
        c *= 0.5 / k as f64;
    }
    let mut sum = 0.0;
    for k in 0..MAX_TERMS {
        let p = (2 * k as u32 + n + 2) as i32;
        let contribution = c * (x2.powi(p) - x1.powi(p)) / p as f64;
        sum += contribution;
        if contribution.abs() < 1e-18 * sum.abs().max(1e-300) && k > 2 {
            break;
        }
        let kk = k as f64 + 1.0;
        c *= -0.25 / (kk * (kk + n as f64));
    }
    sum
}

#[derive(Debug, Clone, Copy)]
struct Cplx {
    re: f64,
    im: f64,
}

impl Cplx {
    fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
    fn add(self, o: Self) -> Self {
        Self::new(self.re + o.re, self.im + o.im)
    }
    fn mul(self, o: Self) -> Self {
        Self::new(self.re * o.re - self.im * o.im, self.re * o.im + self.im * o.re)
    }
    fn scale(self, s: f64) -> Self {
        Self::new(self.re * s, self.im * s)
    }
    fn recip(self) -> Self {
        let d = self.re * self.re + self.im * self.im;
        Self::new(self.re / d, -self.im / d)
    }
}

/// Sine and cosine integrals `(Si(x), Ci(x))` for `x > 0`.
///
/// Power series below `x = 2`, continued fraction for `E1(ix)` above.
pub fn sici(x: f64) -> (f64, f64) {
    let t = x.abs();
    if t == 0.0 {
        return (0.0, f64::NEG_INFINITY);
    }
    let (si, ci) = if t > 2.0 {
        let mut b = Cplx::new(1.0, t);
        let mut c = Cplx::new(1e300, 0.0);
        let mut d = b.recip();
        let mut h = d;
        for i in 2..MAX_TERMS {
            let a = -((i - 1) as f64).powi(2);
            b = b.add(Cplx::new(2.0, 0.0));
            d = d.scale(a).add(b).recip();
            c = b.add(c.recip().scale(a));
            let del = c.mul(d);
            h = h.mul(del);
            if (del.re - 1.0).abs() + del.im.abs() < 1e-16 {
                break;
            }
        }
        let h = Cplx::new(t.cos(), -t.sin()).mul(h);
        (FRAC_PI_2 + h.im, -h.re)
    } else {
        let mut si = 0.0;
        let mut ci_sum = 0.0;
        let mut fact = 1.0;
        for m in 1..MAX_TERMS {
            fact *= t / m as f64;
            let term = fact / m as f64;
            if m % 2 == 1 {
                let sign = if (m / 2) % 2 == 0 { 1.0 } else { -1.0 };
                si += sign * term;
            } else {
                let sign = if (m / 2) % 2 == 0 { 1.0 } else { -1.0 };
                ci_sum += sign * term;
            }
            if term < 1e-17 * (si.abs() + ci_sum.abs()).max(1e-300) {
                break;
            }
        }
        (si, EULER_GAMMA + t.ln() + ci_sum)
    };
    if x < 0.0 { (-si, ci) } else { (si, ci) }
}

/// Complementary error function, fractional error below 1.2e-7.
pub fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let ans = t * poly.exp();
    if x >= 0.0 { ans } else { 2.0 - ans }
}

pub fn erf(x: f64) -> f64 {
    1.0 - erfc(x)
}
