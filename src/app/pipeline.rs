//! The covariance pipeline shared by `lsscov run` and the tests.
//!
//! samples -> physics -> spectra -> segments and kernels -> blocks -> assembly
//!
//! Nothing is written here; the caller exports the [`RunOutput`] only after
//! every step succeeded.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::assembler::{CovarianceAssembler, CovarianceMatrix};
use crate::cancel::CancelToken;
use crate::combinator::geometry::angular_reach;
use crate::combinator::{KernelSet, MixingStage, ObservableCombinator, ObservableSetup, RunOptions, TomographicBins};
use crate::config::RunConfig;
use crate::diagnostics::Diagnostics;
use crate::domain::{Probe, TermKind, Tracer};
use crate::error::CovError;
use crate::io::catalog::read_catalog;
use crate::io::{RunSummary, SegmentSummary};
use crate::mixing::MixingTermEngine;
use crate::physics::{HaloModelBackend, PhysicsContext};
use crate::spectra::{AngularSpectra, LineOfSight};
use crate::terms::{CoarseEll, GaussianTerm, GridSpectra, NonGaussianTerm, SscTerm, SurveyWindow, TermEvaluator};

/// Everything a successful run produced.
#[derive(Debug)]
pub struct RunOutput {
    pub covariance: CovarianceMatrix,
    pub spectra: AngularSpectra,
    pub summary: RunSummary,
}

/// Segment layout of `config`, without touching any physics.
pub fn plan(config: &RunConfig) -> Result<ObservableCombinator, CovError> {
    let observables = config
        .active_observables()
        .into_iter()
        .map(|kind| {
            ObservableSetup::new(
                kind,
                config.statistics.scheme(kind)?,
                config.observables.shear_estimator,
                config.survey.area_sr(kind),
            )
        })
        .collect::<Result<Vec<_>, CovError>>()?;
    let lensing = config.samples.lensing.bins();
    let bins = TomographicBins {
        lensing,
        clustering: if config.observables.clustering_photo_z { lensing } else { config.samples.clustering.bins() },
    };
    ObservableCombinator::new(observables, bins, config.terms)
}

pub fn segment_summaries(combinator: &ObservableCombinator) -> Vec<SegmentSummary> {
    combinator
        .segments()
        .iter()
        .map(|s| SegmentSummary {
            label: s.label(),
            offset: s.offset,
            bins: s.bins,
        })
        .collect()
}

/// Run the whole pipeline for `config`.
pub fn run_covariance(config: &RunConfig) -> Result<RunOutput, CovError> {
    run_covariance_with(config, CancelToken::new())
}

/// Like [`run_covariance`], stopping at the next checkpoint once `cancel` fires.
pub fn run_covariance_with(config: &RunConfig, cancel: CancelToken) -> Result<RunOutput, CovError> {
    config.validate()?;
    let diagnostics = Arc::new(Diagnostics::new());
    let photo_z = config.observables.clustering_photo_z;

    // 1) Galaxy samples.
    let samples = config.samples.load()?;
    let z_max = samples
        .lensing
        .iter()
        .chain(samples.clustering_distributions(photo_z))
        .map(|d| d.z_max())
        .fold(0.0, f64::max);
    info!(
        lensing_bins = samples.lensing.len(),
        clustering_bins = samples.clustering_bins(photo_z),
        z_max,
        "samples loaded"
    );

    // 2) Physics backend.
    let ctx = PhysicsContext {
        cosmology: config.cosmology.clone(),
        halo_model: config.halo_model.clone(),
        hod: config.hod.clone(),
        nonlinear: config.precision.nonlinear,
        k_grid: config.precision.k_grid(),
        z_max,
    };
    let backend = HaloModelBackend::new(ctx, Arc::clone(&diagnostics))?;
    cancel.checkpoint()?;

    // 3) Projection kernels along the line of sight.
    let precision = &config.precision;
    let los_options = config.spectra_options(precision.ell_min, precision.ell_max);
    let los = LineOfSight::new(&backend, &samples, &los_options)?;

    // 4) Observables and their segments.
    let combinator = plan(config)?;
    let bins = TomographicBins {
        lensing: samples.lensing.len(),
        clustering: samples.clustering_bins(photo_z),
    };
    let needs_lens = combinator.observables().iter().any(|o| o.scheme.needs_lens_distance());
    let lens_chi = if needs_lens {
        (0..bins.clustering)
            .map(|b| los.kernels.mean_chi(Tracer::new(Probe::Galaxy, b)))
            .collect::<Result<Vec<_>, CovError>>()?
    } else {
        Vec::new()
    };
    let lens_chi_min = lens_chi.iter().copied().reduce(f64::min);

    // 5) Integration grid, spectra and kernels.
    let grid = combinator.build_grid(&precision.grid_spec(), lens_chi_min)?;
    let spectra_options = config.spectra_options(grid.ell_min(), grid.ell_max());
    let spectra = AngularSpectra::compute(&backend, &los, &samples, &spectra_options)?;
    let grid_spectra = GridSpectra::new(&spectra, &grid);
    let coarse = if config.terms.needs_coarse_ell() {
        Some(CoarseEll::new(&grid, precision.coarse_ell_points)?)
    } else {
        None
    };
    let kernels = KernelSet::build(&combinator, &grid, &lens_chi, coarse.as_ref(), &diagnostics)?;
    cancel.checkpoint()?;

    let gaussian = config
        .terms
        .gauss
        .then(|| GaussianTerm::new(&grid, &grid_spectra, config.terms.split_gauss));
    let nongaussian = match (&coarse, config.terms.nongauss) {
        (Some(coarse), true) => Some(NonGaussianTerm::new(
            &backend,
            &los,
            coarse,
            precision.trispectrum(),
            cancel.clone(),
            &diagnostics,
        )?),
        _ => None,
    };
    let ssc = match (&coarse, config.terms.ssc) {
        (Some(coarse), true) => {
            let window = match config.survey.mask()? {
                Some(cl) => SurveyWindow::Mask(cl),
                None => SurveyWindow::Disc,
            };
            Some(SscTerm::new(&backend, &los, coarse, precision.ssc(), window, cancel.clone())?)
        }
        _ => None,
    };
    let mut evaluators: Vec<&dyn TermEvaluator> = Vec::new();
    if let Some(term) = &gaussian {
        evaluators.push(term);
    }
    if let Some(term) = &nongaussian {
        evaluators.push(term);
    }
    if let Some(term) = &ssc {
        evaluators.push(term);
    }

    // 6) Survey-geometry correction.
    let engine = if config.mixing.enabled {
        let path = config
            .mixing
            .catalog
            .as_deref()
            .ok_or_else(|| CovError::config("mixing: a point catalog is required."))?;
        let catalog = read_catalog(path, &config.mixing.columns, bins.lensing)?;
        if !catalog.row_errors.is_empty() {
            warn!(
                skipped = catalog.row_errors.len(),
                rows = catalog.rows_read,
                "catalog rows skipped"
            );
        }
        let reach = angular_reach(&combinator)
            .ok_or_else(|| CovError::config("mixing: cosmic shear has no angular range."))?;
        Some(MixingTermEngine::new(
            &catalog,
            bins.lensing,
            config.mixing.settings(),
            reach,
            cancel.clone(),
        )?)
    } else {
        None
    };
    let stage = match &engine {
        Some(engine) => Some(MixingStage::new(
            engine,
            config.mixing.combinations()?,
            &combinator,
            &grid,
            &grid_spectra,
        )?),
        None => None,
    };

    // 7) Blocks.
    let options = RunOptions {
        num_cores: config.num_cores,
        cancel: cancel.clone(),
        diagnostics: &diagnostics,
    };
    let blocks = combinator.run(&kernels, &evaluators, stage.as_ref(), &options)?;

    // 8) Assembly and checks.
    let mut columns = config.terms.columns();
    if stage.is_some() {
        columns.push(TermKind::Mixing);
    }
    let mixing_diagonals: Vec<usize> = match &stage {
        Some(stage) => (0..combinator.segments().len())
            .filter(|&s| stage.applies_to(&combinator, s))
            .collect(),
        None => Vec::new(),
    };
    let mut assembler = CovarianceAssembler::new(&combinator, columns, config.diagnostics.check_psd);
    assembler.expect_blocks(&combinator, &mixing_diagonals);
    assembler.extend(blocks)?;
    let covariance = assembler.finish(&diagnostics)?;

    // 9) Summary.
    diagnostics.report();
    let summary = RunSummary {
        tool: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        created: Utc::now(),
        dimension: covariance.dimension(),
        columns: covariance.columns().iter().map(|k| k.column_name().to_string()).collect(),
        segments: segment_summaries(&combinator),
        symmetrized: covariance.was_symmetrized(),
        min_eigenvalue: covariance.eigenvalues().and_then(|e| e.first().copied()),
        num_cores: config.num_cores,
        warnings: diagnostics.summary(),
    };
    info!(
        dimension = summary.dimension,
        columns = summary.columns.len(),
        warnings = summary.warnings.len(),
        "covariance assembled"
    );
    Ok(RunOutput {
        covariance,
        spectra,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ShearEstimator, TermSelection};
    use crate::physics::NonlinearModel;

    /// Cosmic shear with two source bins and a light numerical setup.
    fn shear_config() -> RunConfig {
        let mut config = RunConfig::from_json(
            r#"{
                "samples": { "lensing": { "mock_means": [0.5, 0.9], "n_eff": [5, 5], "sigma_e": [0.27, 0.27] } },
                "survey": { "area_shear_deg2": 1000 },
                "num_cores": 2
            }"#,
        )
        .unwrap();
        config.observables.shear_estimator = ShearEstimator::XiP;
        config.halo_model.mass_bins = 100;
        config.precision.nonlinear = NonlinearModel::Linear;
        config.precision.k_points = 80;
        config.precision.ell_max = 1e4;
        config.precision.log_panels = 60;
        config.precision.oversample = 8.0;
        config.precision.max_nodes = 6000;
        config.precision.nz_steps = 60;
        config.precision.spectra_ell_points = 60;
        config
    }

    #[test]
    fn split_and_fused_gaussian_agree() {
        let mut config = shear_config();
        config.terms.split_gauss = true;
        let split = run_covariance(&config).unwrap();
        config.terms.split_gauss = false;
        let fused = run_covariance(&config).unwrap();

        assert_eq!(split.covariance.dimension(), 27);
        assert_eq!(split.summary.segments.len(), 3);
        assert_eq!(split.covariance.columns(), &[TermKind::GaussSva, TermKind::GaussMix, TermKind::GaussSn]);
        let (a, b) = (split.covariance.total(), fused.covariance.total());
        let scale = b.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        assert!(scale > 0.0);
        assert!((a - b).abs().max() <= 1e-8 * scale);
        for i in 0..27 {
            assert!(b[(i, i)] > 0.0, "diagonal {i}");
        }
    }

    #[test]
    fn runs_are_deterministic_across_core_counts() {
        let mut config = shear_config();
        let first = run_covariance(&config).unwrap();
        config.num_cores = 1;
        let second = run_covariance(&config).unwrap();
        assert_eq!(first.covariance.total(), second.covariance.total());
    }

    #[test]
    fn no_terms_gives_a_zero_matrix_and_a_warning() {
        let mut config = shear_config();
        config.terms = TermSelection {
            gauss: false,
            split_gauss: false,
            nongauss: false,
            ssc: false,
            cross_terms: true,
        };
        let out = run_covariance(&config).unwrap();
        assert_eq!(out.covariance.dimension(), 27);
        assert!(out.covariance.total().iter().all(|v| *v == 0.0));
        assert!(out.summary.columns.is_empty());
        assert!(!out.summary.warnings.is_empty());
    }

    #[test]
    fn disabling_cross_terms_zeroes_off_observable_blocks() {
        let mut config = shear_config();
        config.observables.clustering = true;
        config.observables.clustering_photo_z = true;
        config.observables.unbiased_clustering = true;
        config.terms.cross_terms = false;
        let out = run_covariance(&config).unwrap();
        // 3 shear pairs and 3 clustering pairs, 9 theta bins each.
        assert_eq!(out.covariance.dimension(), 54);
        let total = out.covariance.total();
        assert!(total.view((0, 27), (27, 27)).iter().all(|v| *v == 0.0));
        assert!(total[(30, 30)] > 0.0);
    }

    #[test]
    fn cancelled_runs_stop_with_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = run_covariance_with(&shear_config(), cancel).unwrap_err();
        assert_eq!(err, CovError::Cancelled);
        assert_eq!(err.exit_code(), 5);
    }
}
