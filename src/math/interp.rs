//! One-dimensional tabulated functions.

use crate::error::CovError;

/// What a table returns outside its abscissa range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extrapolation {
    Zero,
    Clamp,
    Linear,
}

/// Piecewise-linear table with strictly increasing abscissae.
#[derive(Debug, Clone, PartialEq)]
pub struct Table1D {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl Table1D {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self, CovError> {
        if x.len() != y.len() {
            return Err(CovError::config(format!(
                "Table columns differ in length ({} vs {}).",
                x.len(),
                y.len()
            )));
        }
        if x.len() < 2 {
            return Err(CovError::config("Table needs at least two rows."));
        }
        if x.windows(2).any(|w| w[1] <= w[0]) || x.iter().chain(&y).any(|v| !v.is_finite()) {
            return Err(CovError::config("Table abscissae must be finite and strictly increasing."));
        }
        Ok(Self { x, y })
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn x_min(&self) -> f64 {
        self.x[0]
    }

    pub fn x_max(&self) -> f64 {
        self.x[self.x.len() - 1]
    }

    pub fn eval(&self, x: f64, mode: Extrapolation) -> f64 {
        interp_linear(&self.x, &self.y, x, mode)
    }

    /// Apply `f` to every ordinate.
    pub fn map_y(&self, f: impl Fn(f64, f64) -> f64) -> Self {
        let y = self.x.iter().zip(&self.y).map(|(&x, &y)| f(x, y)).collect();
        Self { x: self.x.clone(), y }
    }
}

/// Linear interpolation on sorted `xs`.
pub fn interp_linear(xs: &[f64], ys: &[f64], x: f64, mode: Extrapolation) -> f64 {
    let n = xs.len();
    if n == 0 {
        return 0.0;
    }
    if x < xs[0] || x > xs[n - 1] {
        match mode {
            Extrapolation::Zero => return 0.0,
            Extrapolation::Clamp => return if x < xs[0] { ys[0] } else { ys[n - 1] },
            Extrapolation::Linear => {}
        }
    }
    if n == 1 {
        return ys[0];
    }
    let i = xs.partition_point(|&v| v <= x).clamp(1, n - 1);
    let (x0, x1) = (xs[i - 1], xs[i]);
    let t = (x - x0) / (x1 - x0);
    ys[i - 1] + t * (ys[i] - ys[i - 1])
}

/// Interpolate a positive function linearly in `(ln x, ln y)`.
///
/// `ln_x` and `ln_y` are the logarithms of the tabulated values; outside the
/// table the end slopes are continued.
pub fn interp_loglog(ln_x: &[f64], ln_y: &[f64], x: f64) -> f64 {
    interp_linear(ln_x, ln_y, x.ln(), Extrapolation::Linear).exp()
}
