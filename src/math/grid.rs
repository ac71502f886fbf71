//! Grid generation.
//!
//! Every integral over multipoles in a run uses one shared [`EllGrid`]:
//! log-spaced panels at low ℓ, then linear panels fine enough to resolve the
//! slowest-decaying Bessel oscillation of the widest angular scale, with every
//! bin edge inserted as a panel boundary.

use crate::error::CovError;
use crate::math::quad::composite_gauss_legendre;

/// Generate `steps` log-spaced points between `min` and `max` (inclusive).
pub fn log_space(min: f64, max: f64, steps: usize) -> Result<Vec<f64>, CovError> {
    if !(min.is_finite() && max.is_finite() && min > 0.0 && max > 0.0 && max > min) {
        return Err(CovError::config(format!(
            "Invalid log range: min={min}, max={max} (must be finite, >0, and max>min)."
        )));
    }
    if steps < 2 {
        return Err(CovError::config("Log range steps must be >= 2."));
    }

    let ln_min = min.ln();
    let ln_max = max.ln();
    let step = (ln_max - ln_min) / (steps as f64 - 1.0);

    let mut out = Vec::with_capacity(steps);
    for i in 0..steps {
        out.push((ln_min + step * i as f64).exp());
    }
    // Pin the end point against rounding in exp(ln(max)).
    out[steps - 1] = max;
    Ok(out)
}

/// Generate `steps` linearly spaced points between `min` and `max` (inclusive).
pub fn lin_space(min: f64, max: f64, steps: usize) -> Result<Vec<f64>, CovError> {
    if !(min.is_finite() && max.is_finite() && max > min) {
        return Err(CovError::config(format!("Invalid linear range: min={min}, max={max}.")));
    }
    if steps < 2 {
        return Err(CovError::config("Linear range steps must be >= 2."));
    }
    let step = (max - min) / (steps as f64 - 1.0);
    let mut out: Vec<f64> = (0..steps).map(|i| min + step * i as f64).collect();
    out[steps - 1] = max;
    Ok(out)
}

/// Settings for the shared multipole integration grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EllGridSpec {
    pub ell_min: f64,
    pub ell_max: f64,
    /// Number of log panels spanning `[ell_min, ell_max]` before the switch
    /// to linear panels.
    pub log_panels: usize,
    /// Linear panels per Bessel period of the widest angle.
    pub oversample: f64,
    pub max_nodes: usize,
    pub order: usize,
}

/// Quadrature nodes and weights over multipoles.
#[derive(Debug, Clone)]
pub struct EllGrid {
    pub nodes: Vec<f64>,
    pub weights: Vec<f64>,
    pub breaks: Vec<f64>,
}

impl EllGrid {
    /// Build the grid.
    ///
    /// `theta_max` is the widest angular scale (radians) any kernel
    /// oscillates on; `None` keeps the whole range log-spaced.
    pub fn build(spec: &EllGridSpec, theta_max: Option<f64>, edges: &[f64]) -> Result<Self, CovError> {
        if !(spec.ell_min > 0.0 && spec.ell_max > spec.ell_min) {
            return Err(CovError::config(format!(
                "Multipole range must satisfy 0 < ell_min < ell_max (got {}..{}).",
                spec.ell_min, spec.ell_max
            )));
        }
        if spec.order == 0 || spec.log_panels == 0 {
            return Err(CovError::config("Multipole grid needs a positive order and panel count."));
        }

        let ratio = (spec.ell_max / spec.ell_min).powf(1.0 / spec.log_panels as f64);
        let mut breaks = vec![spec.ell_min];
        match theta_max {
            Some(theta) if theta > 0.0 => {
                let max_panels = (spec.max_nodes / spec.order).max(1);
                let mut step = 2.0 * std::f64::consts::PI / (theta * spec.oversample.max(1.0));
                let mut ell = spec.ell_min;
                while ell < spec.ell_max && ell * (ratio - 1.0) < step {
                    ell *= ratio;
                    breaks.push(ell.min(spec.ell_max));
                }
                let remaining = spec.ell_max - ell;
                if remaining > 0.0 {
                    let log_count = breaks.len();
                    let budget = max_panels.saturating_sub(log_count).max(1);
                    if remaining / step > budget as f64 {
                        step = remaining / budget as f64;
                    }
                    let n_lin = (remaining / step).ceil() as usize;
                    for i in 1..=n_lin {
                        breaks.push((ell + step * i as f64).min(spec.ell_max));
                    }
                }
            }
            _ => {
                for i in 1..=spec.log_panels {
                    breaks.push(spec.ell_min * ratio.powi(i as i32));
                }
            }
        }
        if let Some(last) = breaks.last_mut() {
            *last = spec.ell_max;
        }
        breaks.extend(edges.iter().copied().filter(|e| *e > spec.ell_min && *e < spec.ell_max));
        breaks.sort_by(f64::total_cmp);
        breaks.dedup_by(|a, b| (*a - *b).abs() <= 1e-12 * b.abs().max(1.0));

        let (nodes, weights) = composite_gauss_legendre(&breaks, spec.order)?;
        Ok(Self { nodes, weights, breaks })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ell_min(&self) -> f64 {
        self.breaks[0]
    }

    pub fn ell_max(&self) -> f64 {
        self.breaks[self.breaks.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> EllGridSpec {
        EllGridSpec {
            ell_min: 2.0,
            ell_max: 1.0e4,
            log_panels: 100,
            oversample: 24.0,
            max_nodes: 200_000,
            order: 4,
        }
    }

    #[test]
    fn log_space_includes_endpoints() {
        let v = log_space(0.1, 10.0, 5).unwrap();
        assert!((v[0] - 0.1).abs() < 1e-12);
        assert!((v[v.len() - 1] - 10.0).abs() < 1e-12);
        assert!(log_space(0.0, 10.0, 5).is_err());
    }

    #[test]
    fn grid_contains_edges_as_breakpoints() {
        let grid = EllGrid::build(&spec(), Some(0.01), &[100.0, 333.3]).unwrap();
        assert!(grid.breaks.iter().any(|b| (*b - 333.3).abs() < 1e-9));
        assert!(grid.breaks.windows(2).all(|w| w[0] < w[1]));
        assert!((grid.ell_max() - 1.0e4).abs() < 1e-9);
    }

    #[test]
    fn grid_integrates_smooth_functions() {
        let grid = EllGrid::build(&spec(), Some(0.01), &[]).unwrap();
        let integral: f64 = grid
            .nodes
            .iter()
            .zip(&grid.weights)
            .map(|(l, w)| w / (l * l))
            .sum();
        let exact = 1.0 / 2.0 - 1.0 / 1.0e4;
        assert!((integral - exact).abs() < 1e-10, "{integral} vs {exact}");
    }

    #[test]
    fn linear_step_resolves_widest_angle() {
        let theta = 0.05;
        let grid = EllGrid::build(&spec(), Some(theta), &[]).unwrap();
        let period = 2.0 * std::f64::consts::PI / theta;
        let widest = grid.breaks.windows(2).map(|w| w[1] - w[0]).fold(0.0, f64::max);
        assert!(widest <= period / 20.0, "widest panel {widest}");
    }

    #[test]
    fn node_budget_caps_panel_count() {
        let mut s = spec();
        s.max_nodes = 4_000;
        let grid = EllGrid::build(&s, Some(0.1), &[]).unwrap();
        assert!(grid.len() <= 4_000 + 4 * 4, "{}", grid.len());
    }
}
