//! Quadrature rules.
//!
//! - Gauss–Legendre nodes on `[-1, 1]` and composite rules over breakpoints
//! - Simpson and trapezoid rules on tabulated samples

use crate::error::CovError;

/// Gauss–Legendre rule on `[-1, 1]`, nodes ascending.
#[derive(Debug, Clone)]
pub struct GaussLegendre {
    pub nodes: Vec<f64>,
    pub weights: Vec<f64>,
}

impl GaussLegendre {
    pub fn new(n: usize) -> Result<Self, CovError> {
        if n == 0 {
            return Err(CovError::config("Gauss-Legendre order must be >= 1."));
        }
        let mut nodes = vec![0.0; n];
        let mut weights = vec![0.0; n];
        let nf = n as f64;
        for i in 0..n.div_ceil(2) {
            let mut z = (std::f64::consts::PI * (i as f64 + 0.75) / (nf + 0.5)).cos();
            let mut pp = 1.0;
            for _ in 0..100 {
                let mut p1 = 1.0;
                let mut p2 = 0.0;
                for j in 1..=n {
                    let p3 = p2;
                    p2 = p1;
                    let jf = j as f64;
                    p1 = ((2.0 * jf - 1.0) * z * p2 - (jf - 1.0) * p3) / jf;
                }
                pp = nf * (z * p1 - p2) / (z * z - 1.0);
                let z1 = z;
                z = z1 - p1 / pp;
                if (z - z1).abs() < 1e-15 {
                    break;
                }
            }
            nodes[i] = -z;
            nodes[n - 1 - i] = z;
            let w = 2.0 / ((1.0 - z * z) * pp * pp);
            weights[i] = w;
            weights[n - 1 - i] = w;
        }
        Ok(Self { nodes, weights })
    }

    /// Map the rule onto `[a, b]`, appending nodes and weights.
    pub fn push_interval(&self, a: f64, b: f64, nodes: &mut Vec<f64>, weights: &mut Vec<f64>) {
        let half = 0.5 * (b - a);
        let mid = 0.5 * (a + b);
        for (x, w) in self.nodes.iter().zip(&self.weights) {
            nodes.push(mid + half * x);
            weights.push(half * w);
        }
    }
}

/// Composite Gauss–Legendre rule over consecutive breakpoints.
///
/// No node coincides with a breakpoint, so integrands that jump at a
/// breakpoint are integrated exactly piecewise.
pub fn composite_gauss_legendre(breaks: &[f64], order: usize) -> Result<(Vec<f64>, Vec<f64>), CovError> {
    if breaks.len() < 2 {
        return Err(CovError::config("Composite rule needs at least two breakpoints."));
    }
    let rule = GaussLegendre::new(order)?;
    let mut nodes = Vec::with_capacity((breaks.len() - 1) * order);
    let mut weights = Vec::with_capacity((breaks.len() - 1) * order);
    for pair in breaks.windows(2) {
        if pair[1] <= pair[0] {
            return Err(CovError::numerical(format!(
                "Breakpoints must be strictly increasing (got {} then {}).",
                pair[0], pair[1]
            )));
        }
        rule.push_interval(pair[0], pair[1], &mut nodes, &mut weights);
    }
    Ok((nodes, weights))
}

/// Simpson weights for `n` equally spaced samples with spacing `h`.
///
/// `n` must be odd and at least 3.
pub fn simpson_weights(n: usize, h: f64) -> Result<Vec<f64>, CovError> {
    if n < 3 || n % 2 == 0 {
        return Err(CovError::config(format!("Simpson rule needs an odd number >= 3 of samples (got {n}).")));
    }
    let mut w = vec![0.0; n];
    for (i, wi) in w.iter_mut().enumerate() {
        *wi = if i == 0 || i == n - 1 {
            h / 3.0
        } else if i % 2 == 1 {
            4.0 * h / 3.0
        } else {
            2.0 * h / 3.0
        };
    }
    Ok(w)
}

/// Trapezoid weights for arbitrary increasing abscissae.
pub fn trapezoid_weights(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    let mut w = vec![0.0; n];
    for i in 0..n.saturating_sub(1) {
        let h = 0.5 * (x[i + 1] - x[i]);
        w[i] += h;
        w[i + 1] += h;
    }
    w
}

pub fn trapezoid(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| 0.5 * (xs[1] - xs[0]) * (ys[0] + ys[1]))
        .sum()
}

/// Running trapezoid integral, starting at zero.
pub fn cumulative_trapezoid(x: &[f64], y: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(x.len());
    let mut acc = 0.0;
    out.push(0.0);
    for i in 1..x.len() {
        acc += 0.5 * (x[i] - x[i - 1]) * (y[i] + y[i - 1]);
        out.push(acc);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauss_legendre_integrates_polynomials_exactly() {
        let rule = GaussLegendre::new(5).unwrap();
        // Exact up to degree 9.
        let integral: f64 = rule
            .nodes
            .iter()
            .zip(&rule.weights)
            .map(|(x, w)| w * x.powi(8))
            .sum();
        assert!((integral - 2.0 / 9.0).abs() < 1e-14, "{integral}");
        let total: f64 = rule.weights.iter().sum();
        assert!((total - 2.0).abs() < 1e-14);
        assert!(rule.nodes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn composite_rule_handles_step_at_breakpoint() {
        let (nodes, weights) = composite_gauss_legendre(&[0.0, 1.0, 3.0], 3).unwrap();
        let integral: f64 = nodes
            .iter()
            .zip(&weights)
            .map(|(x, w)| w * if *x < 1.0 { 2.0 } else { 5.0 })
            .sum();
        assert!((integral - 12.0).abs() < 1e-13, "{integral}");
    }

    #[test]
    fn simpson_is_exact_for_cubics() {
        let n = 11;
        let h = 0.2;
        let w = simpson_weights(n, h).unwrap();
        let integral: f64 = (0..n).map(|i| w[i] * (i as f64 * h).powi(3)).sum();
        assert!((integral - 2.0_f64.powi(4) / 4.0).abs() < 1e-12, "{integral}");
        assert!(simpson_weights(4, 0.1).is_err());
    }

    #[test]
    fn cumulative_trapezoid_ends_at_total() {
        let x: Vec<f64> = (0..50).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|v| v * v).collect();
        let cum = cumulative_trapezoid(&x, &y);
        assert!((cum[cum.len() - 1] - trapezoid(&x, &y)).abs() < 1e-12);
        let w = trapezoid_weights(&x);
        let via_weights: f64 = w.iter().zip(&y).map(|(a, b)| a * b).sum();
        assert!((via_weights - trapezoid(&x, &y)).abs() < 1e-12);
    }
}
