//! Line-of-sight kernels of the projected tracers.
//!
//! All kernels live on one [`ProjectionGrid`] in redshift; `χ`-integrals use
//! trapezoid weights in comoving distance.

use std::collections::BTreeMap;

use crate::domain::{Probe, RedshiftDistribution, Tracer};
use crate::error::CovError;
use crate::math::lin_space;
use crate::math::quad::trapezoid_weights;
use crate::math::{Extrapolation, interp_linear};
use crate::physics::cosmology::{Background, HUBBLE_DISTANCE};

const Z_FLOOR: f64 = 1e-3;

#[derive(Debug, Clone)]
pub struct ProjectionGrid {
    pub z: Vec<f64>,
    pub chi: Vec<f64>,
    /// Trapezoid weights in `χ`.
    pub weights: Vec<f64>,
}

impl ProjectionGrid {
    pub fn new(background: &Background, z_max: f64, steps: usize) -> Result<Self, CovError> {
        if steps < 3 {
            return Err(CovError::config("precision.nz_steps must be >= 3."));
        }
        if z_max <= Z_FLOOR {
            return Err(CovError::config(format!("n(z) must extend beyond z = {Z_FLOOR}.")));
        }
        let z = lin_space(Z_FLOOR, z_max, steps)?;
        let chi: Vec<f64> = z.iter().map(|&z| background.chi(z)).collect();
        let weights = trapezoid_weights(&chi);
        Ok(Self { z, chi, weights })
    }

    pub fn len(&self) -> usize {
        self.z.len()
    }

    pub fn is_empty(&self) -> bool {
        self.z.is_empty()
    }
}

/// Kernels `q(χ)` of every tracer, without galaxy bias.
#[derive(Debug, Clone)]
pub struct TracerKernels {
    grid: ProjectionGrid,
    kernels: BTreeMap<Tracer, Vec<f64>>,
}

impl TracerKernels {
    /// Build shear kernels for `lensing` bins and galaxy kernels for
    /// `clustering` bins.
    pub fn new(
        background: &Background,
        grid: ProjectionGrid,
        lensing: &[RedshiftDistribution],
        clustering: &[RedshiftDistribution],
    ) -> Self {
        let mut kernels = BTreeMap::new();
        for (bin, nz) in lensing.iter().enumerate() {
            kernels.insert(Tracer::new(Probe::Shear, bin), lensing_kernel(background, &grid, nz));
        }
        for (bin, nz) in clustering.iter().enumerate() {
            kernels.insert(Tracer::new(Probe::Galaxy, bin), galaxy_kernel(background, &grid, nz));
        }
        Self { grid, kernels }
    }

    pub fn grid(&self) -> &ProjectionGrid {
        &self.grid
    }

    pub fn tracers(&self) -> impl Iterator<Item = Tracer> + '_ {
        self.kernels.keys().copied()
    }

    pub fn values(&self, tracer: Tracer) -> Result<&[f64], CovError> {
        self.kernels
            .get(&tracer)
            .map(Vec::as_slice)
            .ok_or_else(|| CovError::config(format!("No redshift distribution for tracer {tracer}.")))
    }

    /// Kernel at an arbitrary comoving distance.
    pub fn eval(&self, tracer: Tracer, chi: f64) -> Result<f64, CovError> {
        Ok(interp_linear(&self.grid.chi, self.values(tracer)?, chi, Extrapolation::Zero))
    }

    /// Comoving-distance range where the kernel is non-zero.
    pub fn support(&self, tracer: Tracer) -> Result<(f64, f64), CovError> {
        let q = self.values(tracer)?;
        let first = q.iter().position(|v| *v > 0.0);
        let last = q.iter().rposition(|v| *v > 0.0);
        match (first, last) {
            (Some(a), Some(b)) => Ok((self.grid.chi[a], self.grid.chi[b])),
            _ => Err(CovError::config(format!("Kernel of tracer {tracer} vanishes everywhere."))),
        }
    }

    /// Mean comoving distance of a galaxy sample, weighted by its kernel.
    pub fn mean_chi(&self, tracer: Tracer) -> Result<f64, CovError> {
        let q = self.values(tracer)?;
        let (mut num, mut den) = (0.0, 0.0);
        for ((w, chi), q) in self.grid.weights.iter().zip(&self.grid.chi).zip(q) {
            num += w * q * chi;
            den += w * q;
        }
        if den <= 0.0 {
            return Err(CovError::config(format!("Kernel of tracer {tracer} vanishes everywhere.")));
        }
        Ok(num / den)
    }
}

/// `q(χ) = 3/2 Ω_m (H0/c)² f_K(χ) (1+z) ∫_χ dχ' p(χ') f_K(χ'-χ)/f_K(χ')`.
fn lensing_kernel(background: &Background, grid: &ProjectionGrid, nz: &RedshiftDistribution) -> Vec<f64> {
    let cosmo = background.cosmology();
    let prefactor = 1.5 * cosmo.omega_m / (HUBBLE_DISTANCE * HUBBLE_DISTANCE);
    let n = grid.len();
    // p(χ) dχ = n(z) dz; integrate on the z grid.
    let nz_on_grid: Vec<f64> = grid.z.iter().map(|&z| nz.eval(z)).collect();
    let z_weights = trapezoid_weights(&grid.z);
    (0..n)
        .map(|i| {
            let chi = grid.chi[i];
            let fk = background.transverse(chi);
            let mut efficiency = 0.0;
            for j in i..n {
                let chi_s = grid.chi[j];
                if chi_s <= 0.0 {
                    continue;
                }
                efficiency += z_weights[j] * nz_on_grid[j] * background.transverse(chi_s - chi)
                    / background.transverse(chi_s);
            }
            prefactor * fk * (1.0 + grid.z[i]) * efficiency
        })
        .collect()
}

/// `q(χ) = n(z) dz/dχ`.
fn galaxy_kernel(background: &Background, grid: &ProjectionGrid, nz: &RedshiftDistribution) -> Vec<f64> {
    let cosmo = background.cosmology();
    grid.z
        .iter()
        .map(|&z| nz.eval(z) * cosmo.e_of_z(z) / HUBBLE_DISTANCE)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::Cosmology;

    fn gaussian_nz(mean: f64, width: f64) -> RedshiftDistribution {
        let z: Vec<f64> = (0..301).map(|i| i as f64 * 0.01).collect();
        let nz = z.iter().map(|z| (-0.5 * ((z - mean) / width).powi(2)).exp()).collect();
        RedshiftDistribution::new(z, nz).unwrap()
    }

    #[test]
    fn galaxy_kernel_integrates_to_one() {
        let bg = Background::new(&Cosmology::default(), 3.5).unwrap();
        let grid = ProjectionGrid::new(&bg, 3.0, 400).unwrap();
        let kernels = TracerKernels::new(&bg, grid, &[], &[gaussian_nz(0.5, 0.1)]);
        let q = kernels.values(Tracer::new(Probe::Galaxy, 0)).unwrap();
        let total: f64 = q.iter().zip(&kernels.grid().weights).map(|(q, w)| q * w).sum();
        assert!((total - 1.0).abs() < 1e-3, "{total}");
    }

    #[test]
    fn lensing_kernel_peaks_before_sources() {
        let bg = Background::new(&Cosmology::default(), 3.5).unwrap();
        let grid = ProjectionGrid::new(&bg, 3.0, 300).unwrap();
        let kernels = TracerKernels::new(&bg, grid, &[gaussian_nz(1.0, 0.05)], &[]);
        let tracer = Tracer::new(Probe::Shear, 0);
        let q = kernels.values(tracer).unwrap();
        let peak = q
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| kernels.grid().z[i])
            .unwrap();
        assert!(peak > 0.2 && peak < 0.7, "{peak}");
        assert!(q.iter().all(|v| *v >= 0.0));
        assert_eq!(q[q.len() - 1], 0.0);
        let (lo, _) = kernels.support(tracer).unwrap();
        assert!(lo < bg.chi(0.01));
    }

    #[test]
    fn missing_tracer_is_a_configuration_error() {
        let bg = Background::new(&Cosmology::default(), 2.0).unwrap();
        let grid = ProjectionGrid::new(&bg, 1.5, 50).unwrap();
        let kernels = TracerKernels::new(&bg, grid, &[], &[]);
        assert!(matches!(
            kernels.values(Tracer::new(Probe::Shear, 2)),
            Err(CovError::Configuration(_))
        ));
    }
}
