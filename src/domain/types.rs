//! Shared domain types.
//!
//! These types are deliberately small and serializable so they can be:
//!
//! - read from the JSON run configuration
//! - used as keys while the matrix is assembled
//! - written back out in the run summary

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::CovError;
use crate::math::BesselOrder;
use crate::math::quad::trapezoid;

/// Observable families, in global-index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ObservableKind {
    CosmicShear,
    Ggl,
    Clustering,
}

impl ObservableKind {
    pub const ALL: [ObservableKind; 3] = [
        ObservableKind::CosmicShear,
        ObservableKind::Ggl,
        ObservableKind::Clustering,
    ];

    pub fn display_name(self) -> &'static str {
        match self {
            ObservableKind::CosmicShear => "cosmic shear",
            ObservableKind::Ggl => "galaxy-galaxy lensing",
            ObservableKind::Clustering => "galaxy clustering",
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            ObservableKind::CosmicShear => "shear",
            ObservableKind::Ggl => "ggl",
            ObservableKind::Clustering => "clustering",
        }
    }

    /// The two tracers whose cross-spectrum this observable measures.
    pub fn probes(self) -> (Probe, Probe) {
        match self {
            ObservableKind::CosmicShear => (Probe::Shear, Probe::Shear),
            ObservableKind::Ggl => (Probe::Galaxy, Probe::Shear),
            ObservableKind::Clustering => (Probe::Galaxy, Probe::Galaxy),
        }
    }

    /// Whether the tomographic pairs are unordered (`i <= j`).
    pub fn is_auto(self) -> bool {
        !matches!(self, ObservableKind::Ggl)
    }
}

impl fmt::Display for ObservableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Which correlation-function components cosmic shear reports in theta space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShearEstimator {
    #[default]
    XiP,
    XiM,
    XiPm,
}

/// One estimator component of an observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    XiPlus,
    XiMinus,
    GammaT,
    Wtheta,
    /// E-mode of a harmonic-space statistic (C_ℓ, COSEBI, band power).
    EMode,
}

impl Component {
    pub fn tag(self) -> &'static str {
        match self {
            Component::XiPlus => "xip",
            Component::XiMinus => "xim",
            Component::GammaT => "gt",
            Component::Wtheta => "w",
            Component::EMode => "E",
        }
    }

    /// Weights of the E- and B-mode spectra in this component.
    ///
    /// `ξ± = ξ_E ± ξ_B`, everything else is E-only.
    pub fn eb_signs(self) -> (f64, f64) {
        match self {
            Component::XiPlus => (1.0, 1.0),
            Component::XiMinus => (1.0, -1.0),
            _ => (1.0, 0.0),
        }
    }

    /// Bessel order of the real-space transform of this component.
    pub fn bessel_order(self, observable: ObservableKind) -> BesselOrder {
        match self {
            Component::XiPlus | Component::Wtheta => BesselOrder::J0,
            Component::XiMinus => BesselOrder::J4,
            Component::GammaT => BesselOrder::J2,
            Component::EMode => match observable {
                ObservableKind::Ggl => BesselOrder::J2,
                _ => BesselOrder::J0,
            },
        }
    }
}

/// Source of a projected field: galaxy shapes or galaxy positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Probe {
    Shear,
    Galaxy,
}

/// A tomographic tracer: one probe in one redshift bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tracer {
    pub probe: Probe,
    pub bin: usize,
}

impl Tracer {
    pub fn new(probe: Probe, bin: usize) -> Self {
        Self { probe, bin }
    }
}

impl fmt::Display for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.probe {
            Probe::Shear => write!(f, "s{}", self.bin + 1),
            Probe::Galaxy => write!(f, "g{}", self.bin + 1),
        }
    }
}

/// Covariance contributions, in reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermKind {
    GaussSva,
    GaussMix,
    GaussSn,
    Gauss,
    NonGaussian,
    Ssc,
    Mixing,
}

impl TermKind {
    pub const ALL: [TermKind; 7] = [
        TermKind::GaussSva,
        TermKind::GaussMix,
        TermKind::GaussSn,
        TermKind::Gauss,
        TermKind::NonGaussian,
        TermKind::Ssc,
        TermKind::Mixing,
    ];

    pub fn column_name(self) -> &'static str {
        match self {
            TermKind::GaussSva => "gauss_sva",
            TermKind::GaussMix => "gauss_mix",
            TermKind::GaussSn => "gauss_sn",
            TermKind::Gauss => "gauss",
            TermKind::NonGaussian => "nongauss",
            TermKind::Ssc => "ssc",
            TermKind::Mixing => "mixing",
        }
    }
}

/// Which covariance terms a run computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TermSelection {
    pub gauss: bool,
    /// Report the Gaussian term as sva / mix / sn instead of one column.
    pub split_gauss: bool,
    pub nongauss: bool,
    pub ssc: bool,
    /// Compute blocks between different observables.
    pub cross_terms: bool,
}

impl Default for TermSelection {
    fn default() -> Self {
        Self {
            gauss: true,
            split_gauss: false,
            nongauss: false,
            ssc: false,
            cross_terms: true,
        }
    }
}

impl TermSelection {
    pub fn any(&self) -> bool {
        self.gauss || self.nongauss || self.ssc
    }

    /// Whether kernel moments on the coarse multipoles are needed.
    pub fn needs_coarse_ell(&self) -> bool {
        self.nongauss || self.ssc
    }

    /// Term columns in output order.
    pub fn columns(&self) -> Vec<TermKind> {
        let mut out = Vec::new();
        if self.gauss {
            if self.split_gauss {
                out.extend([TermKind::GaussSva, TermKind::GaussMix, TermKind::GaussSn]);
            } else {
                out.push(TermKind::Gauss);
            }
        }
        if self.nongauss {
            out.push(TermKind::NonGaussian);
        }
        if self.ssc {
            out.push(TermKind::Ssc);
        }
        out
    }
}

/// Statistic families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
pub enum StatisticKind {
    Ell,
    #[default]
    Theta,
    Cosebi,
    Bandpower,
    ProjectedRadius,
}

impl StatisticKind {
    pub fn display_name(self) -> &'static str {
        match self {
            StatisticKind::Ell => "angular power spectrum",
            StatisticKind::Theta => "real-space correlation function",
            StatisticKind::Cosebi => "COSEBIs",
            StatisticKind::Bandpower => "band powers",
            StatisticKind::ProjectedRadius => "projected real-space statistic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum Spacing {
    Lin,
    #[default]
    Log,
}

/// Model of the spectrum's response to a background density mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SscResponse {
    /// Tree-level response of the nonlinear spectrum times linear bias.
    #[default]
    LinearBias,
    /// Halo-model response from the `I¹` mass integrals.
    HaloModel,
}

/// Normalized redshift distribution `n(z)` of one tomographic bin.
#[derive(Debug, Clone, PartialEq)]
pub struct RedshiftDistribution {
    pub z: Vec<f64>,
    pub nz: Vec<f64>,
}

impl RedshiftDistribution {
    /// Build from raw samples, normalizing to unit integral.
    pub fn new(z: Vec<f64>, nz: Vec<f64>) -> Result<Self, CovError> {
        if z.len() != nz.len() || z.len() < 2 {
            return Err(CovError::config("n(z) needs at least two (z, n) rows of equal length."));
        }
        if z.windows(2).any(|w| w[1] <= w[0]) || z[0] < 0.0 {
            return Err(CovError::config("n(z) redshifts must be non-negative and strictly increasing."));
        }
        if nz.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(CovError::config("n(z) values must be finite and non-negative."));
        }
        let norm = trapezoid(&z, &nz);
        if norm <= 0.0 {
            return Err(CovError::config("n(z) integrates to zero."));
        }
        let nz = nz.into_iter().map(|v| v / norm).collect();
        Ok(Self { z, nz })
    }

    pub fn z_min(&self) -> f64 {
        self.z[0]
    }

    pub fn z_max(&self) -> f64 {
        self.z[self.z.len() - 1]
    }

    pub fn eval(&self, z: f64) -> f64 {
        crate::math::interp_linear(&self.z, &self.nz, z, crate::math::Extrapolation::Zero)
    }

    pub fn mean_z(&self) -> f64 {
        let zn: Vec<f64> = self.z.iter().zip(&self.nz).map(|(z, n)| z * n).collect();
        trapezoid(&self.z, &zn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redshift_distribution_is_normalized() {
        let z: Vec<f64> = (0..101).map(|i| i as f64 * 0.02).collect();
        let nz: Vec<f64> = z.iter().map(|z| z * z * (-z / 0.3_f64).exp() * 7.0).collect();
        let dist = RedshiftDistribution::new(z.clone(), nz).unwrap();
        assert!((trapezoid(&dist.z, &dist.nz) - 1.0).abs() < 1e-12);
        assert!(dist.mean_z() > 0.5 && dist.mean_z() < 1.0, "{}", dist.mean_z());
    }

    #[test]
    fn rejects_empty_distribution() {
        assert!(RedshiftDistribution::new(vec![0.0, 1.0], vec![0.0, 0.0]).is_err());
        assert!(RedshiftDistribution::new(vec![1.0, 0.5], vec![1.0, 1.0]).is_err());
    }

    #[test]
    fn xi_components_carry_eb_signs() {
        assert_eq!(Component::XiPlus.eb_signs(), (1.0, 1.0));
        assert_eq!(Component::XiMinus.eb_signs(), (1.0, -1.0));
        assert_eq!(Component::GammaT.eb_signs(), (1.0, 0.0));
        assert_eq!(
            Component::EMode.bessel_order(ObservableKind::Ggl),
            BesselOrder::J2
        );
    }

    #[test]
    fn split_gauss_changes_the_columns() {
        let mut terms = TermSelection {
            split_gauss: true,
            ssc: true,
            ..TermSelection::default()
        };
        assert_eq!(
            terms.columns(),
            vec![TermKind::GaussSva, TermKind::GaussMix, TermKind::GaussSn, TermKind::Ssc]
        );
        terms.gauss = false;
        terms.ssc = false;
        assert!(!terms.any());
        assert!(terms.columns().is_empty());
    }

    #[test]
    fn observables_sort_in_index_order() {
        let mut kinds = vec![ObservableKind::Clustering, ObservableKind::CosmicShear, ObservableKind::Ggl];
        kinds.sort();
        assert_eq!(kinds, ObservableKind::ALL.to_vec());
    }
}
