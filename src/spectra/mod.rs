//! Tracer samples, line-of-sight kernels and Limber spectra.

use std::collections::BTreeMap;

use crate::domain::{Probe, RedshiftDistribution, Tracer};
use crate::error::CovError;

pub mod kernels;
pub mod limber;

pub use kernels::{ProjectionGrid, TracerKernels};
pub use limber::{ARCMIN2_TO_SR, AngularSpectra, LineOfSight};

/// The galaxy samples of a run.
#[derive(Debug, Clone, Default)]
pub struct TracerSamples {
    /// Source (shape) sample, one distribution per tomographic bin.
    pub lensing: Vec<RedshiftDistribution>,
    /// Lens (position) sample.
    pub clustering: Vec<RedshiftDistribution>,
    /// Effective source density per bin, arcmin⁻².
    pub n_eff_lensing: Vec<f64>,
    /// Shape-noise dispersion per ellipticity component.
    pub sigma_e: Vec<f64>,
    /// Lens density per bin, arcmin⁻².
    pub n_eff_clustering: Vec<f64>,
}

impl TracerSamples {
    pub fn validate(&self) -> Result<(), CovError> {
        if self.n_eff_lensing.len() != self.lensing.len() || self.sigma_e.len() != self.lensing.len() {
            return Err(CovError::config(format!(
                "Lensing sample has {} bins but {} densities and {} shape-noise values.",
                self.lensing.len(),
                self.n_eff_lensing.len(),
                self.sigma_e.len()
            )));
        }
        if self.n_eff_clustering.len() != self.clustering.len() {
            return Err(CovError::config(format!(
                "Clustering sample has {} bins but {} densities.",
                self.clustering.len(),
                self.n_eff_clustering.len()
            )));
        }
        let densities = self.n_eff_lensing.iter().chain(&self.n_eff_clustering);
        if densities.clone().any(|n| !(n.is_finite() && *n > 0.0)) {
            return Err(CovError::config("Galaxy densities must be finite and > 0."));
        }
        if self.sigma_e.iter().any(|s| !(s.is_finite() && *s >= 0.0)) {
            return Err(CovError::config("Shape-noise dispersions must be finite and >= 0."));
        }
        Ok(())
    }

    /// Distributions used for the position tracers. With photometric
    /// clustering the lens sample is the source sample.
    pub fn clustering_distributions(&self, photo_z: bool) -> &[RedshiftDistribution] {
        if photo_z { &self.lensing } else { &self.clustering }
    }

    pub fn clustering_bins(&self, photo_z: bool) -> usize {
        self.clustering_distributions(photo_z).len()
    }

    /// White-noise level of each tracer's auto spectrum (steradian units).
    pub fn noise_per_tracer(&self, photo_z: bool) -> Result<BTreeMap<Tracer, f64>, CovError> {
        let mut out = BTreeMap::new();
        for (bin, (n, s)) in self.n_eff_lensing.iter().zip(&self.sigma_e).enumerate() {
            out.insert(Tracer::new(Probe::Shear, bin), s * s / (n / ARCMIN2_TO_SR));
        }
        let lens_density = if photo_z { &self.n_eff_lensing } else { &self.n_eff_clustering };
        for (bin, n) in lens_density.iter().enumerate() {
            if *n <= 0.0 {
                return Err(CovError::config(format!("Lens bin {} has no galaxies.", bin + 1)));
            }
            out.insert(Tracer::new(Probe::Galaxy, bin), 1.0 / (n / ARCMIN2_TO_SR));
        }
        Ok(out)
    }
}

/// Settings of the Limber computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectraOptions {
    pub unbiased_clustering: bool,
    pub clustering_photo_z: bool,
    pub nz_steps: usize,
    pub ell_points: usize,
    pub ell_min: f64,
    pub ell_max: f64,
}
