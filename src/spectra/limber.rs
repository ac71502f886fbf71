//! Limber-projected angular power spectra.
//!
//! ```text
//! C_AB(ℓ) = ∫ dχ q_A(χ) q_B(χ) b_A b_B / χ² P_nl((ℓ + 1/2)/χ, z(χ))
//! ```
//!
//! Galaxy tracers carry the effective large-scale bias of the occupation
//! model unless clustering is requested unbiased.

use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::domain::{Probe, Tracer};
use crate::error::CovError;
use crate::math::{Extrapolation, interp_linear, log_space};
use crate::physics::{PhysicsBackend, PowerTable};
use crate::spectra::kernels::{ProjectionGrid, TracerKernels};
use crate::spectra::{SpectraOptions, TracerSamples};

/// Steradians per square arcminute.
pub const ARCMIN2_TO_SR: f64 = (std::f64::consts::PI / 10_800.0) * (std::f64::consts::PI / 10_800.0);

/// Kernels and galaxy bias along the line of sight.
#[derive(Debug, Clone)]
pub struct LineOfSight {
    pub kernels: TracerKernels,
    /// Large-scale galaxy bias on the projection grid.
    pub galaxy_bias: Vec<f64>,
}

impl LineOfSight {
    pub fn new(backend: &dyn PhysicsBackend, samples: &TracerSamples, options: &SpectraOptions) -> Result<Self, CovError> {
        let clustering = samples.clustering_distributions(options.clustering_photo_z);
        let z_max = samples
            .lensing
            .iter()
            .chain(clustering.iter())
            .map(|d| d.z_max())
            .fold(0.0, f64::max);
        let grid = ProjectionGrid::new(backend.background(), z_max, options.nz_steps)?;
        let galaxy_bias = if options.unbiased_clustering || clustering.is_empty() {
            vec![1.0; grid.len()]
        } else {
            grid.z
                .par_iter()
                .map(|&z| backend.galaxy_statistics(z).map(|(_, b)| b))
                .collect::<Result<Vec<_>, _>>()?
        };
        let kernels = TracerKernels::new(backend.background(), grid, &samples.lensing, clustering);
        Ok(Self { kernels, galaxy_bias })
    }

    pub fn grid(&self) -> &ProjectionGrid {
        self.kernels.grid()
    }

    /// Bias of `tracer` at grid index `i`.
    pub fn bias(&self, tracer: Tracer, i: usize) -> f64 {
        match tracer.probe {
            Probe::Shear => 1.0,
            Probe::Galaxy => self.galaxy_bias[i],
        }
    }

    pub fn bias_at_chi(&self, tracer: Tracer, chi: f64) -> f64 {
        match tracer.probe {
            Probe::Shear => 1.0,
            Probe::Galaxy => interp_linear(&self.grid().chi, &self.galaxy_bias, chi, Extrapolation::Clamp),
        }
    }
}

/// Signal spectra on a log-ℓ table plus white noise per tracer.
#[derive(Debug, Clone)]
pub struct AngularSpectra {
    ell: Vec<f64>,
    ln_ell: Vec<f64>,
    cells: BTreeMap<(Tracer, Tracer), Vec<f64>>,
    noise: BTreeMap<Tracer, f64>,
}

fn ordered(a: Tracer, b: Tracer) -> (Tracer, Tracer) {
    if a <= b { (a, b) } else { (b, a) }
}

impl AngularSpectra {
    pub fn compute(
        backend: &dyn PhysicsBackend,
        los: &LineOfSight,
        samples: &TracerSamples,
        options: &SpectraOptions,
    ) -> Result<Self, CovError> {
        let ell = log_space(options.ell_min, options.ell_max, options.ell_points)?;
        let grid = los.grid();

        // P((ℓ+1/2)/χ_i, z_i) for every grid redshift.
        let power: Vec<Vec<f64>> = grid
            .z
            .par_iter()
            .zip(grid.chi.par_iter())
            .map(|(&z, &chi)| {
                let table = backend.nonlinear_power(z)?;
                let interp = PowerTable::new(backend.ln_k_grid(), &table);
                Ok(ell.iter().map(|l| interp.eval((l + 0.5) / chi)).collect())
            })
            .collect::<Result<Vec<_>, CovError>>()?;

        let tracers: Vec<Tracer> = los.kernels.tracers().collect();
        let mut pairs = Vec::new();
        for (ia, a) in tracers.iter().enumerate() {
            for b in &tracers[ia..] {
                pairs.push((*a, *b));
            }
        }
        let cells = pairs
            .par_iter()
            .map(|&(a, b)| {
                let qa = los.kernels.values(a)?;
                let qb = los.kernels.values(b)?;
                let mut c = vec![0.0; ell.len()];
                for i in 0..grid.len() {
                    let weight = grid.weights[i] * qa[i] * qb[i] * los.bias(a, i) * los.bias(b, i)
                        / (grid.chi[i] * grid.chi[i]);
                    if weight == 0.0 {
                        continue;
                    }
                    for (cl, p) in c.iter_mut().zip(&power[i]) {
                        *cl += weight * p;
                    }
                }
                debug!(a = %a, b = %b, c_first = c[0], "limber spectrum");
                Ok(((a, b), c))
            })
            .collect::<Result<BTreeMap<_, _>, CovError>>()?;

        let noise = samples.noise_per_tracer(options.clustering_photo_z)?;
        info!(pairs = cells.len(), ell_points = ell.len(), "angular spectra computed");
        Self::from_tables(ell, cells, noise)
    }

    /// Assemble from precomputed tables.
    pub fn from_tables(
        ell: Vec<f64>,
        cells: BTreeMap<(Tracer, Tracer), Vec<f64>>,
        noise: BTreeMap<Tracer, f64>,
    ) -> Result<Self, CovError> {
        if ell.len() < 2 || ell.windows(2).any(|w| w[1] <= w[0]) || ell[0] <= 0.0 {
            return Err(CovError::config("Spectrum multipoles must be positive and increasing."));
        }
        for (key, c) in &cells {
            if c.len() != ell.len() {
                return Err(CovError::config(format!(
                    "Spectrum {}x{} has {} values for {} multipoles.",
                    key.0,
                    key.1,
                    c.len(),
                    ell.len()
                )));
            }
        }
        let cells = cells.into_iter().map(|((a, b), c)| (ordered(a, b), c)).collect();
        let ln_ell = ell.iter().map(|l| l.ln()).collect();
        Ok(Self {
            ell,
            ln_ell,
            cells,
            noise,
        })
    }

    pub fn ell(&self) -> &[f64] {
        &self.ell
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&(Tracer, Tracer), &Vec<f64>)> {
        self.cells.iter()
    }

    /// Signal spectrum at arbitrary multipoles; zero for unknown pairs.
    pub fn signal_at(&self, a: Tracer, b: Tracer, ell: &[f64]) -> Vec<f64> {
        match self.cells.get(&ordered(a, b)) {
            Some(c) => ell
                .iter()
                .map(|l| interp_linear(&self.ln_ell, c, l.ln(), Extrapolation::Clamp))
                .collect(),
            None => vec![0.0; ell.len()],
        }
    }

    /// White noise of the `(a, b)` spectrum: non-zero only for `a == b`.
    pub fn noise(&self, a: Tracer, b: Tracer) -> f64 {
        if a == b { self.noise.get(&a).copied().unwrap_or(0.0) } else { 0.0 }
    }

    /// White-noise level of every tracer that has one.
    pub fn noises(&self) -> &BTreeMap<Tracer, f64> {
        &self.noise
    }
}
