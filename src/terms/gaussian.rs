//! Gaussian (disconnected) covariance.
//!
//! For `s = (a, b)` and `t = (c, d)`
//!
//! ```text
//! Cov_st = 1/(2π A) ∫ dℓ ℓ W_s(ℓ) W_t(ℓ) [C_ac C_bd + C_ad C_bc]
//! ```
//!
//! with `C = S + N` (signal plus white noise). Expanding the products gives
//! the sample-variance (`S S`), mixed (`S N`) and pure-noise (`N N`) parts.
//! Shear correlation functions also pick up the B-mode noise through the
//! components' E/B signs.

use std::f64::consts::PI;

use nalgebra::DMatrix;

use crate::domain::{TermKind, Tracer};
use crate::error::CovError;
use crate::math::EllGrid;
use crate::terms::{BlockRequest, GridSpectra, TermBlocks, TermEvaluator};

pub struct GaussianTerm<'a> {
    grid: &'a EllGrid,
    spectra: &'a GridSpectra,
    split: bool,
}

impl<'a> GaussianTerm<'a> {
    pub fn new(grid: &'a EllGrid, spectra: &'a GridSpectra, split: bool) -> Self {
        Self { grid, spectra, split }
    }

    fn signal(&self, x: Tracer, y: Tracer, i: usize) -> f64 {
        self.spectra.signal(x, y).map_or(0.0, |s| s[i])
    }

    /// `W_s diag(y) W_tᵀ`.
    fn project(&self, request: &BlockRequest<'_>, y: &[f64]) -> DMatrix<f64> {
        let ws = &request.s.kernel.weights;
        let scaled = DMatrix::from_fn(ws.nrows(), ws.ncols(), |a, i| ws[(a, i)] * y[i]);
        scaled * request.t.kernel.weights.transpose()
    }

    /// `∫ dℓ ℓ W_s W_t`, exact when both sides share a kernel that knows it.
    fn noise_overlap(&self, request: &BlockRequest<'_>) -> DMatrix<f64> {
        let (ks, kt) = (request.s.kernel, request.t.kernel);
        match (&ks.noise_overlap, std::ptr::eq(ks, kt)) {
            (Some(overlap), true) => overlap.clone(),
            _ => ks.numeric_overlap(kt, self.grid),
        }
    }
}

impl TermEvaluator for GaussianTerm<'_> {
    fn name(&self) -> &'static str {
        "gaussian"
    }

    fn kinds(&self) -> Vec<TermKind> {
        if self.split {
            vec![TermKind::GaussSva, TermKind::GaussMix, TermKind::GaussSn]
        } else {
            vec![TermKind::Gauss]
        }
    }

    fn compute(&self, request: &BlockRequest<'_>) -> Result<TermBlocks, CovError> {
        let area = request.area();
        if !(area > 0.0) {
            return Err(CovError::config(format!(
                "Survey area for {} x {} must be > 0.",
                request.s.observable, request.t.observable
            )));
        }
        let [a, b, c, d] = request.quartet();
        let (es, bs) = request.s.component.eb_signs();
        let (et, bt) = request.t.component.eb_signs();
        let e_weight = es * et;
        let b_weight = bs * bt;
        let prefactor = 1.0 / (2.0 * PI * area);

        let (n_ac, n_bd, n_ad, n_bc) = (
            self.spectra.noise(a, c),
            self.spectra.noise(b, d),
            self.spectra.noise(a, d),
            self.spectra.noise(b, c),
        );

        let n = self.grid.len();
        let mut sva = vec![0.0; n];
        let mut mix = vec![0.0; n];
        for i in 0..n {
            let (s_ac, s_bd, s_ad, s_bc) = (
                self.signal(a, c, i),
                self.signal(b, d, i),
                self.signal(a, d, i),
                self.signal(b, c, i),
            );
            let measure = self.grid.weights[i] * self.grid.nodes[i] * prefactor * e_weight;
            sva[i] = measure * (s_ac * s_bd + s_ad * s_bc);
            mix[i] = measure * (s_ac * n_bd + n_ac * s_bd + s_ad * n_bc + n_ad * s_bc);
        }
        let sva = self.project(request, &sva);
        let mix = self.project(request, &mix);

        // B-mode spectra carry noise only, with the same level as the E-modes.
        let g_sn = n_ac * n_bd + n_ad * n_bc;
        let sn_weight = (e_weight + b_weight) * g_sn * prefactor;
        let sn = if sn_weight == 0.0 {
            request.zero_block()
        } else {
            self.noise_overlap(request) * sn_weight
        };

        if self.split {
            Ok(vec![
                (TermKind::GaussSva, sva),
                (TermKind::GaussMix, mix),
                (TermKind::GaussSn, sn),
            ])
        } else {
            Ok(vec![(TermKind::Gauss, sva + mix + sn)])
        }
    }
}
