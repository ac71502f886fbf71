//! Run configuration.
//!
//! A run is described by one JSON file. Every section has defaults, so a
//! minimal file only names the samples:
//!
//! ```json
//! { "samples": { "lensing": { "mock_means": [0.5, 0.9], "n_eff": [5, 5], "sigma_e": [0.27, 0.27] } } }
//! ```
//!
//! After parsing, `.env` and the process environment may override the core
//! count (`LSSCOV_NUM_CORES`) and the output directory (`LSSCOV_OUTPUT_DIR`).
//! [`RunConfig::validate`] then checks everything that can be checked
//! before any physics runs.

use std::f64::consts::PI;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::binning::{BandpowerBins, BinningScheme, CosebiModes, EllBins, ProjectedBins, ThetaBins};
use crate::data::synthetic::mock_nz;
use crate::domain::{
    ObservableKind, RedshiftDistribution, ShearEstimator, Spacing, SscResponse, StatisticKind, TermSelection,
};
use crate::error::CovError;
use crate::io::catalog::CatalogColumns;
use crate::io::tables::{read_nz, read_table};
use crate::math::{EllGridSpec, Table1D};
use crate::mixing::{Geometry, MixingCombination, MixingSettings};
use crate::physics::{Cosmology, HaloModelSpec, HodSpec, KGrid, NonlinearModel};
use crate::spectra::{SpectraOptions, TracerSamples};
use crate::terms::{SscSettings, TrispectrumSettings};

pub const ENV_NUM_CORES: &str = "LSSCOV_NUM_CORES";
pub const ENV_OUTPUT_DIR: &str = "LSSCOV_OUTPUT_DIR";

const DEG2_TO_SR: f64 = (PI / 180.0) * (PI / 180.0);

/// Which observables enter the covariance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservablesConfig {
    pub cosmic_shear: bool,
    pub ggl: bool,
    pub clustering: bool,
    /// Components reported for cosmic shear in theta space.
    pub shear_estimator: ShearEstimator,
    /// Galaxy bias fixed to one.
    pub unbiased_clustering: bool,
    /// Position tracers use the source sample and its densities.
    pub clustering_photo_z: bool,
}

impl Default for ObservablesConfig {
    fn default() -> Self {
        Self {
            cosmic_shear: true,
            ggl: false,
            clustering: false,
            shear_estimator: ShearEstimator::XiPm,
            unbiased_clustering: false,
            clustering_photo_z: false,
        }
    }
}

impl ObservablesConfig {
    pub fn active(&self) -> Vec<ObservableKind> {
        ObservableKind::ALL
            .into_iter()
            .filter(|k| match k {
                ObservableKind::CosmicShear => self.cosmic_shear,
                ObservableKind::Ggl => self.ggl,
                ObservableKind::Clustering => self.clustering,
            })
            .collect()
    }
}

/// Bin range of a statistic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinRange {
    pub min: f64,
    pub max: f64,
    pub bins: usize,
    #[serde(default)]
    pub spacing: Spacing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CosebiConfig {
    /// Directory with `Wn`, `Tplus` and `Tminus` tables.
    pub dir: PathBuf,
    /// File-name infix, e.g. `_0.50-300.00` in `Wn_0.50-300.00_1.table`.
    pub prefix: String,
    pub n_modes: usize,
}

impl Default for CosebiConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cosebis"),
            prefix: String::new(),
            n_modes: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandpowerConfig {
    pub ell: BinRange,
    /// Angular range of the underlying correlation functions, arcmin.
    pub theta_lo_arcmin: f64,
    pub theta_hi_arcmin: f64,
    /// Apodization width in `ln θ`.
    pub apodization_log_width: f64,
    /// Directory with `window_{a}.table`; windows are computed when absent.
    pub window_dir: Option<PathBuf>,
}

impl Default for BandpowerConfig {
    fn default() -> Self {
        Self {
            ell: BinRange {
                min: 100.0,
                max: 1500.0,
                bins: 8,
                spacing: Spacing::Log,
            },
            theta_lo_arcmin: 0.5,
            theta_hi_arcmin: 300.0,
            apodization_log_width: 0.5,
            window_dir: None,
        }
    }
}

/// Statistic space per observable and the binning of every space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub shear: StatisticKind,
    pub ggl: StatisticKind,
    pub clustering: StatisticKind,
    pub ell: BinRange,
    /// Angular bins, arcmin.
    pub theta: BinRange,
    pub cosebi: CosebiConfig,
    pub bandpower: BandpowerConfig,
    /// Projected radii, Mpc/h.
    pub projected: BinRange,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            shear: StatisticKind::Theta,
            ggl: StatisticKind::Theta,
            clustering: StatisticKind::Theta,
            ell: BinRange {
                min: 10.0,
                max: 3000.0,
                bins: 10,
                spacing: Spacing::Log,
            },
            theta: BinRange {
                min: 0.5,
                max: 300.0,
                bins: 9,
                spacing: Spacing::Log,
            },
            cosebi: CosebiConfig::default(),
            bandpower: BandpowerConfig::default(),
            projected: BinRange {
                min: 0.1,
                max: 20.0,
                bins: 8,
                spacing: Spacing::Log,
            },
        }
    }
}

impl StatisticsConfig {
    pub fn kind_for(&self, observable: ObservableKind) -> StatisticKind {
        match observable {
            ObservableKind::CosmicShear => self.shear,
            ObservableKind::Ggl => self.ggl,
            ObservableKind::Clustering => self.clustering,
        }
    }

    /// Build the scheme of one observable, loading any tabulated kernels.
    pub fn scheme(&self, observable: ObservableKind) -> Result<BinningScheme, CovError> {
        let kind = self.kind_for(observable);
        if observable == ObservableKind::CosmicShear && kind == StatisticKind::ProjectedRadius {
            return Err(CovError::config("Cosmic shear has no projected-radius statistic."));
        }
        Ok(match kind {
            StatisticKind::Ell => {
                let r = self.ell;
                BinningScheme::Ell(EllBins::new(r.min, r.max, r.bins, r.spacing)?)
            }
            StatisticKind::Theta => {
                let r = self.theta;
                BinningScheme::Theta(ThetaBins::new(r.min, r.max, r.bins, r.spacing)?)
            }
            StatisticKind::Cosebi => {
                let c = &self.cosebi;
                BinningScheme::Cosebi(CosebiModes::load(&c.dir, &c.prefix, c.n_modes)?)
            }
            StatisticKind::Bandpower => {
                let b = &self.bandpower;
                let bins = BandpowerBins::new(
                    b.ell.min,
                    b.ell.max,
                    b.ell.bins,
                    b.ell.spacing,
                    b.theta_lo_arcmin,
                    b.theta_hi_arcmin,
                    b.apodization_log_width,
                )?;
                let bins = match &b.window_dir {
                    Some(dir) => bins.load_windows(dir)?,
                    None => bins,
                };
                BinningScheme::Bandpower(bins)
            }
            StatisticKind::ProjectedRadius => {
                let r = self.projected;
                BinningScheme::ProjectedRadius(ProjectedBins::new(r.min, r.max, r.bins, r.spacing)?)
            }
        })
    }
}

/// One galaxy sample: n(z) per tomographic bin plus densities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    pub nz_dir: PathBuf,
    /// One two-column `(z, n(z))` file per bin.
    pub nz_files: Vec<String>,
    /// Gaussian n(z) means used instead of files.
    pub mock_means: Vec<f64>,
    pub mock_width: f64,
    /// Galaxies per arcmin², per bin.
    pub n_eff: Vec<f64>,
    /// Shape-noise dispersion per component, per bin (sources only).
    pub sigma_e: Vec<f64>,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            nz_dir: PathBuf::from("."),
            nz_files: Vec::new(),
            mock_means: Vec::new(),
            mock_width: 0.1,
            n_eff: Vec::new(),
            sigma_e: Vec::new(),
        }
    }
}

impl SampleConfig {
    pub fn bins(&self) -> usize {
        if self.nz_files.is_empty() { self.mock_means.len() } else { self.nz_files.len() }
    }

    pub fn distributions(&self) -> Result<Vec<RedshiftDistribution>, CovError> {
        if !self.nz_files.is_empty() && !self.mock_means.is_empty() {
            return Err(CovError::config("A sample takes either nz_files or mock_means, not both."));
        }
        if self.nz_files.is_empty() {
            let z_max = self.mock_means.iter().fold(0.0_f64, |a, m| a.max(*m)) + 6.0 * self.mock_width;
            return self.mock_means.iter().map(|m| mock_nz(*m, self.mock_width, z_max)).collect();
        }
        self.nz_files.iter().map(|f| read_nz(&self.nz_dir.join(f))).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SamplesConfig {
    pub lensing: SampleConfig,
    pub clustering: SampleConfig,
}

impl SamplesConfig {
    pub fn load(&self) -> Result<TracerSamples, CovError> {
        let samples = TracerSamples {
            lensing: self.lensing.distributions()?,
            clustering: self.clustering.distributions()?,
            n_eff_lensing: self.lensing.n_eff.clone(),
            sigma_e: self.lensing.sigma_e.clone(),
            n_eff_clustering: self.clustering.n_eff.clone(),
        };
        samples.validate()?;
        Ok(samples)
    }
}

/// Survey areas (deg²) and the optional mask spectrum for the SSC window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyConfig {
    pub area_shear_deg2: f64,
    pub area_ggl_deg2: f64,
    pub area_clustering_deg2: f64,
    /// Two-column `(ℓ, C_ℓ)` power spectrum of the survey mask.
    pub mask_cl: Option<PathBuf>,
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            area_shear_deg2: 1000.0,
            area_ggl_deg2: 1000.0,
            area_clustering_deg2: 1000.0,
            mask_cl: None,
        }
    }
}

impl SurveyConfig {
    /// Area in steradians.
    pub fn area_sr(&self, observable: ObservableKind) -> f64 {
        let deg2 = match observable {
            ObservableKind::CosmicShear => self.area_shear_deg2,
            ObservableKind::Ggl => self.area_ggl_deg2,
            ObservableKind::Clustering => self.area_clustering_deg2,
        };
        deg2 * DEG2_TO_SR
    }

    pub fn mask(&self) -> Result<Option<Table1D>, CovError> {
        self.mask_cl.as_deref().map(read_table).transpose()
    }
}

/// Numerical resolution of every integral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionConfig {
    pub nonlinear: NonlinearModel,
    pub log10_k_min: f64,
    pub log10_k_max: f64,
    pub k_points: usize,
    /// Multipole range of the shared integration grid.
    pub ell_min: f64,
    pub ell_max: f64,
    pub log_panels: usize,
    pub oversample: f64,
    pub max_nodes: usize,
    pub quadrature_order: usize,
    /// Redshift steps of the Limber integrals.
    pub nz_steps: usize,
    /// Multipoles at which spectra are tabulated before resampling.
    pub spectra_ell_points: usize,
    /// Coarse multipoles of the connected terms.
    pub coarse_ell_points: usize,
    pub tri_delta_z: f64,
    pub integration_steps: usize,
    pub integration_intervals: usize,
    /// Damp the 1-halo trispectrum below `k ≈ 0.1 h/Mpc`.
    pub small_k_damping: bool,
    pub ssc_response: SscResponse,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        let k = KGrid::default();
        Self {
            nonlinear: NonlinearModel::Halofit,
            log10_k_min: k.log10_k_min,
            log10_k_max: k.log10_k_max,
            k_points: k.points,
            ell_min: 2.0,
            ell_max: 1e5,
            log_panels: 200,
            oversample: 24.0,
            max_nodes: 400_000,
            quadrature_order: 4,
            nz_steps: 200,
            spectra_ell_points: 120,
            coarse_ell_points: 30,
            tri_delta_z: 0.5,
            integration_steps: 9,
            integration_intervals: 30,
            small_k_damping: true,
            ssc_response: SscResponse::LinearBias,
        }
    }
}

impl PrecisionConfig {
    pub fn k_grid(&self) -> KGrid {
        KGrid {
            log10_k_min: self.log10_k_min,
            log10_k_max: self.log10_k_max,
            points: self.k_points,
        }
    }

    pub fn grid_spec(&self) -> EllGridSpec {
        EllGridSpec {
            ell_min: self.ell_min,
            ell_max: self.ell_max,
            log_panels: self.log_panels,
            oversample: self.oversample,
            max_nodes: self.max_nodes,
            order: self.quadrature_order,
        }
    }

    pub fn trispectrum(&self) -> TrispectrumSettings {
        TrispectrumSettings {
            tri_delta_z: self.tri_delta_z,
            integration_steps: self.integration_steps,
            integration_intervals: self.integration_intervals,
            small_k_damping: self.small_k_damping,
        }
    }

    pub fn ssc(&self) -> SscSettings {
        SscSettings {
            tri_delta_z: self.tri_delta_z,
            response: self.ssc_response,
        }
    }

    pub fn validate(&self) -> Result<(), CovError> {
        if !(self.ell_min > 0.0 && self.ell_max > self.ell_min) {
            return Err(CovError::config(format!(
                "precision: need 0 < ell_min < ell_max (got {}..{}).",
                self.ell_min, self.ell_max
            )));
        }
        if self.k_points < 2 || self.log10_k_max <= self.log10_k_min {
            return Err(CovError::config("precision: the k grid needs >= 2 increasing points."));
        }
        if self.log_panels == 0 || self.quadrature_order == 0 || !(self.oversample > 0.0) {
            return Err(CovError::config("precision: log_panels, quadrature_order and oversample must be > 0."));
        }
        if self.nz_steps < 2 || self.spectra_ell_points < 2 || self.coarse_ell_points < 2 {
            return Err(CovError::config("precision: nz_steps and ell point counts must be >= 2."));
        }
        if !(self.tri_delta_z > 0.0) {
            return Err(CovError::config("precision.tri_delta_z must be > 0."));
        }
        if self.integration_steps < 3 || self.integration_steps % 2 == 0 || self.integration_intervals == 0 {
            return Err(CovError::config(
                "precision: integration_steps must be odd and >= 3, integration_intervals >= 1.",
            ));
        }
        Ok(())
    }
}

/// Survey-geometry correction of the Gaussian term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixingConfig {
    pub enabled: bool,
    pub catalog: Option<PathBuf>,
    pub columns: CatalogColumns,
    /// `xipxip` and/or `ximxim`.
    pub combinations: Vec<String>,
    pub geometry: Geometry,
    pub patch_size_deg: f64,
    pub nmax: usize,
    pub nbins_phi: usize,
    pub dpix_min_arcmin: f64,
    pub do_overlap: bool,
    pub do_ec: bool,
    pub nbins_fine: usize,
}

impl Default for MixingConfig {
    fn default() -> Self {
        let s = MixingSettings::default();
        Self {
            enabled: false,
            catalog: None,
            columns: CatalogColumns::default(),
            combinations: vec!["xipxip".to_string(), "ximxim".to_string()],
            geometry: s.geometry,
            patch_size_deg: s.patch_size_deg,
            nmax: s.nmax,
            nbins_phi: s.nbins_phi,
            dpix_min_arcmin: s.dpix_min_arcmin,
            do_overlap: s.do_overlap,
            do_ec: s.do_ec,
            nbins_fine: s.nbins_fine,
        }
    }
}

impl MixingConfig {
    pub fn settings(&self) -> MixingSettings {
        MixingSettings {
            geometry: self.geometry,
            patch_size_deg: self.patch_size_deg,
            nmax: self.nmax,
            nbins_phi: self.nbins_phi,
            dpix_min_arcmin: self.dpix_min_arcmin,
            do_overlap: self.do_overlap,
            do_ec: self.do_ec,
            nbins_fine: self.nbins_fine,
        }
    }

    pub fn combinations(&self) -> Result<Vec<MixingCombination>, CovError> {
        let mut out = self
            .combinations
            .iter()
            .map(|c| MixingCombination::parse(c))
            .collect::<Result<Vec<_>, _>>()?;
        out.sort();
        out.dedup();
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub correlation: bool,
    /// Also write the angular spectra.
    pub cells: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
            correlation: true,
            cells: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Compute eigenvalues and report negative ones.
    pub check_psd: bool,
}

fn default_cores() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Complete description of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub terms: TermSelection,
    pub observables: ObservablesConfig,
    pub statistics: StatisticsConfig,
    pub samples: SamplesConfig,
    pub survey: SurveyConfig,
    pub cosmology: Cosmology,
    pub halo_model: HaloModelSpec,
    pub hod: HodSpec,
    pub precision: PrecisionConfig,
    pub mixing: MixingConfig,
    pub output: OutputConfig,
    pub num_cores: usize,
    pub diagnostics: DiagnosticsConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            terms: TermSelection::default(),
            observables: ObservablesConfig::default(),
            statistics: StatisticsConfig::default(),
            samples: SamplesConfig::default(),
            survey: SurveyConfig::default(),
            cosmology: Cosmology::default(),
            halo_model: HaloModelSpec::default(),
            hod: HodSpec::default(),
            precision: PrecisionConfig::default(),
            mixing: MixingConfig::default(),
            output: OutputConfig::default(),
            num_cores: default_cores(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

/// Read `path`, apply environment overrides and validate.
pub fn load(path: &Path) -> Result<RunConfig, CovError> {
    let file = File::open(path).map_err(|e| CovError::io(format!("Failed to open config '{}': {e}", path.display())))?;
    let mut config: RunConfig = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| CovError::config(format!("Invalid config '{}': {e}", path.display())))?;
    dotenvy::dotenv().ok();
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

impl RunConfig {
    pub fn from_json(text: &str) -> Result<Self, CovError> {
        serde_json::from_str(text).map_err(|e| CovError::config(format!("Invalid config: {e}")))
    }

    /// Override fields from `LSSCOV_*` variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), CovError> {
        if let Some(v) = lookup(ENV_NUM_CORES) {
            self.num_cores = v
                .trim()
                .parse()
                .map_err(|e| CovError::config(format!("{ENV_NUM_CORES}=`{v}` is not a core count: {e}")))?;
        }
        if let Some(v) = lookup(ENV_OUTPUT_DIR) {
            if !v.trim().is_empty() {
                self.output.dir = PathBuf::from(v.trim());
            }
        }
        Ok(())
    }

    pub fn active_observables(&self) -> Vec<ObservableKind> {
        self.observables.active()
    }

    pub fn spectra_options(&self, ell_min: f64, ell_max: f64) -> SpectraOptions {
        SpectraOptions {
            unbiased_clustering: self.observables.unbiased_clustering,
            clustering_photo_z: self.observables.clustering_photo_z,
            nz_steps: self.precision.nz_steps,
            ell_points: self.precision.spectra_ell_points,
            ell_min,
            ell_max,
        }
    }

    /// Everything that can fail without computing physics.
    pub fn validate(&self) -> Result<(), CovError> {
        if self.num_cores == 0 {
            return Err(CovError::config("num_cores must be >= 1."));
        }
        let active = self.active_observables();
        if active.is_empty() {
            return Err(CovError::config("At least one observable must be enabled."));
        }
        self.cosmology.validate()?;
        self.halo_model.validate()?;
        self.hod.validate()?;
        self.precision.validate()?;

        let photo_z = self.observables.clustering_photo_z;
        let lens_bins = self.samples.lensing.bins();
        let clustering_bins = if photo_z { lens_bins } else { self.samples.clustering.bins() };
        for kind in &active {
            let needs_sources = matches!(kind, ObservableKind::CosmicShear | ObservableKind::Ggl);
            let needs_lenses = matches!(kind, ObservableKind::Ggl | ObservableKind::Clustering);
            if needs_sources && lens_bins == 0 {
                return Err(CovError::config(format!("{} needs a lensing sample.", kind.display_name())));
            }
            if needs_lenses && clustering_bins == 0 {
                return Err(CovError::config(format!("{} needs a clustering sample.", kind.display_name())));
            }
            let area = self.survey.area_sr(*kind);
            if !(area.is_finite() && area > 0.0) {
                return Err(CovError::config(format!("Survey area for {} must be > 0.", kind.display_name())));
            }
            self.statistics.scheme(*kind)?;
        }
        if self.terms.split_gauss && !self.terms.gauss {
            return Err(CovError::config("terms.split_gauss needs terms.gauss."));
        }

        if self.mixing.enabled {
            self.mixing.settings().validate()?;
            if self.mixing.combinations()?.is_empty() {
                return Err(CovError::config("mixing: no combinations requested."));
            }
            if self.mixing.catalog.is_none() {
                return Err(CovError::config("mixing: a point catalog is required."));
            }
            if !self.observables.cosmic_shear
                || !matches!(self.statistics.shear, StatisticKind::Theta | StatisticKind::Cosebi)
            {
                return Err(CovError::config(
                    "mixing: the geometry correction applies to cosmic shear in theta or COSEBI space.",
                ));
            }
            if !self.terms.gauss {
                return Err(CovError::config("mixing: the geometry correction needs terms.gauss."));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> RunConfig {
        RunConfig::from_json(
            r#"{
                "samples": { "lensing": { "mock_means": [0.5, 0.9], "n_eff": [5, 5], "sigma_e": [0.27, 0.27] } },
                "num_cores": 2
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn sections_default_when_absent() {
        let config = minimal();
        config.validate().unwrap();
        assert_eq!(config.terms, TermSelection::default());
        assert_eq!(config.statistics.theta.bins, 9);
        assert_eq!(config.precision.k_points, 200);
        assert_eq!(config.halo_model.mass_bins, 900);
        assert_eq!(config.active_observables(), vec![ObservableKind::CosmicShear]);
        let samples = config.samples.load().unwrap();
        assert_eq!(samples.lensing.len(), 2);
    }

    #[test]
    fn environment_overrides_cores_and_output() {
        let mut config = minimal();
        config
            .apply_env(|key| match key {
                ENV_NUM_CORES => Some("3".to_string()),
                ENV_OUTPUT_DIR => Some("/tmp/cov".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.num_cores, 3);
        assert_eq!(config.output.dir, PathBuf::from("/tmp/cov"));

        let err = config.apply_env(|key| (key == ENV_NUM_CORES).then(|| "many".to_string()));
        assert!(matches!(err, Err(CovError::Configuration(_))));
    }

    #[test]
    fn log_binning_from_zero_is_rejected() {
        let mut config = minimal();
        config.statistics.theta.min = 0.0;
        assert!(matches!(config.validate(), Err(CovError::Configuration(_))));
    }

    #[test]
    fn clustering_without_lenses_is_rejected() {
        let mut config = minimal();
        config.observables.clustering = true;
        assert!(config.validate().is_err());
        config.observables.clustering_photo_z = true;
        config.validate().unwrap();
    }

    #[test]
    fn missing_cosebi_tables_are_fatal() {
        let mut config = minimal();
        config.statistics.shear = StatisticKind::Cosebi;
        config.statistics.cosebi.dir = PathBuf::from("/nonexistent/cosebis");
        assert!(matches!(config.validate(), Err(CovError::MissingTabulatedKernel { mode: 1, .. })));
    }

    #[test]
    fn mixing_needs_a_catalog_and_known_combinations() {
        let mut config = minimal();
        config.mixing.enabled = true;
        assert!(config.validate().is_err());
        config.mixing.catalog = Some(PathBuf::from("catalog.csv"));
        config.validate().unwrap();
        config.mixing.combinations = vec!["xipxim".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn halo_model_options_reach_the_terms() {
        let config = RunConfig::from_json(
            r#"{
                "samples": { "lensing": { "mock_means": [0.5], "n_eff": [5], "sigma_e": [0.27] } },
                "precision": { "small_k_damping": false, "ssc_response": "halo_model" }
            }"#,
        )
        .unwrap();
        assert!(!config.precision.trispectrum().small_k_damping);
        assert_eq!(config.precision.ssc().response, SscResponse::HaloModel);
        assert!(minimal().precision.trispectrum().small_k_damping);
        assert_eq!(minimal().precision.ssc().response, SscResponse::LinearBias);
    }

    #[test]
    fn mistyped_fields_are_configuration_errors() {
        let err = RunConfig::from_json(r#"{ "num_cores": "four" }"#).unwrap_err();
        assert!(matches!(err, CovError::Configuration(_)));
    }
}
