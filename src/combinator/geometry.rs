//! Survey-geometry corrections inside a combinator run.
//!
//! [`MixingStage`] feeds the split Gaussian blocks of cosmic-shear
//! tomographic auto-segments through the [`MixingTermEngine`]. Theta-space
//! `ξ+` and `ξ-` segments are corrected directly. COSEBIs are corrected on
//! fine `θ` bins and folded back into modes.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use nalgebra::DMatrix;
use rayon::prelude::*;
use tracing::info;

use crate::binning::theta::top_hat_kernel;
use crate::binning::{BinningScheme, KernelMatrix};
use crate::combinator::{KernelSet, ObservableCombinator};
use crate::domain::{Component, ObservableKind, Probe, TermKind, Tracer};
use crate::error::CovError;
use crate::math::special::bessel_j0;
use crate::math::{BesselOrder, EllGrid, Table1D, log_space};
use crate::mixing::{CosebiFolding, MixingCombination, MixingRequest, MixingTermEngine};
use crate::terms::{BlockRequest, GaussianTerm, GridSpectra, Side, TermEvaluator};

/// Points of the tabulated `ξ+(θ)` per tomographic bin.
const XI_POINTS: usize = 160;

/// Fine `θ` bins standing in for COSEBI modes.
#[derive(Debug, Clone)]
struct FineBins {
    edges_rad: Vec<f64>,
    plus: KernelMatrix,
    minus: KernelMatrix,
    folding: CosebiFolding,
}

pub struct MixingStage<'a> {
    engine: &'a MixingTermEngine,
    combinations: Vec<MixingCombination>,
    gaussian: GaussianTerm<'a>,
    fine: Option<FineBins>,
    xi_plus: BTreeMap<usize, Table1D>,
}

/// Largest angle (radians) a correction will ask the engine for.
pub fn angular_reach(combinator: &ObservableCombinator) -> Option<f64> {
    combinator
        .observables()
        .iter()
        .filter(|o| o.kind == ObservableKind::CosmicShear)
        .find_map(|o| match &o.scheme {
            BinningScheme::Theta(b) => b.edges_rad().last().copied(),
            BinningScheme::Cosebi(c) => Some(c.theta_range_rad().1),
            _ => None,
        })
}

impl<'a> MixingStage<'a> {
    pub fn new(
        engine: &'a MixingTermEngine,
        combinations: Vec<MixingCombination>,
        combinator: &ObservableCombinator,
        grid: &'a EllGrid,
        spectra: &'a GridSpectra,
    ) -> Result<Self, CovError> {
        let shear = combinator
            .observables()
            .iter()
            .find(|o| o.kind == ObservableKind::CosmicShear)
            .ok_or_else(|| CovError::config("mixing: the survey-geometry correction needs cosmic shear."))?;

        let (fine, theta_min, theta_max) = match &shear.scheme {
            BinningScheme::Theta(b) => {
                let edges = b.edges_rad();
                (None, edges[0], edges[edges.len() - 1])
            }
            BinningScheme::Cosebi(modes) => {
                let (lo, hi) = modes.theta_range_rad();
                let edges_rad = log_space(lo, hi, engine.settings().nbins_fine + 1)?;
                let folding = CosebiFolding::new(modes, &edges_rad);
                let fine = FineBins {
                    plus: top_hat_kernel(BesselOrder::J0, grid, &edges_rad),
                    minus: top_hat_kernel(BesselOrder::J4, grid, &edges_rad),
                    folding,
                    edges_rad,
                };
                (Some(fine), lo, hi)
            }
            other => {
                return Err(CovError::config(format!(
                    "mixing: cosmic shear in {} space has no geometry correction.",
                    other.kind().display_name()
                )));
            }
        };

        let mut theta = vec![0.0];
        theta.extend(log_space(1e-2 * theta_min, 2.0 * theta_max, XI_POINTS)?);
        let bins: Vec<usize> = combinator
            .segments()
            .iter()
            .filter(|s| s.kind == ObservableKind::CosmicShear && s.is_tomographic_auto())
            .map(|s| s.tracers.0.bin)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let xi_plus = bins
            .par_iter()
            .map(|&bin| {
                let tracer = Tracer::new(Probe::Shear, bin);
                let signal = spectra.signal(tracer, tracer);
                let values = theta
                    .iter()
                    .map(|&t| match signal {
                        Some(c) => (0..grid.len())
                            .map(|i| {
                                let ell = grid.nodes[i];
                                grid.weights[i] * ell / (2.0 * PI) * bessel_j0(ell * t) * c[i]
                            })
                            .sum(),
                        None => 0.0,
                    })
                    .collect();
                Ok((bin, Table1D::new(theta.clone(), values)?))
            })
            .collect::<Result<BTreeMap<_, _>, CovError>>()?;

        info!(
            combinations = combinations.len(),
            bins = xi_plus.len(),
            fine_bins = fine.as_ref().map_or(0, |f| f.edges_rad.len() - 1),
            "mixing stage prepared"
        );
        Ok(Self {
            engine,
            combinations,
            gaussian: GaussianTerm::new(grid, spectra, true),
            fine,
            xi_plus,
        })
    }

    fn enabled(&self, combination: MixingCombination) -> bool {
        self.combinations.contains(&combination)
    }

    /// Whether segment `s` gets a correction on its diagonal block.
    pub fn applies_to(&self, combinator: &ObservableCombinator, s: usize) -> bool {
        let seg = &combinator.segments()[s];
        if seg.kind != ObservableKind::CosmicShear || !seg.is_tomographic_auto() {
            return false;
        }
        match seg.component {
            Component::XiPlus => self.enabled(MixingCombination::XipXip),
            Component::XiMinus => self.enabled(MixingCombination::XimXim),
            Component::EMode => self.fine.is_some() && !self.combinations.is_empty(),
            _ => false,
        }
    }

    /// Correction block for segment `s`, or `None` when it has none.
    pub fn correction(
        &self,
        combinator: &ObservableCombinator,
        kernels: &KernelSet,
        s: usize,
    ) -> Result<Option<DMatrix<f64>>, CovError> {
        if !self.applies_to(combinator, s) {
            return Ok(None);
        }
        let seg = combinator.segments()[s];
        let setup = &combinator.observables()[seg.observable];
        let bin = seg.tracers.0.bin;

        match (&setup.scheme, &self.fine) {
            (BinningScheme::Theta(b), _) => {
                let combination = match seg.component {
                    Component::XiMinus => MixingCombination::XimXim,
                    _ => MixingCombination::XipXip,
                };
                let side = combinator.side(kernels, s)?;
                self.corrected(side, bin, combination, b.edges_rad()).map(Some)
            }
            (BinningScheme::Cosebi(_), Some(fine)) => {
                let side = |component, kernel| Side {
                    observable: seg.kind,
                    component,
                    tracers: seg.tracers,
                    kernel,
                    moments: None,
                    area: setup.area,
                };
                let plus = if self.enabled(MixingCombination::XipXip) {
                    let side = side(Component::XiPlus, &fine.plus);
                    Some(self.corrected(side, bin, MixingCombination::XipXip, &fine.edges_rad)?)
                } else {
                    None
                };
                let minus = if self.enabled(MixingCombination::XimXim) {
                    let side = side(Component::XiMinus, &fine.minus);
                    Some(self.corrected(side, bin, MixingCombination::XimXim, &fine.edges_rad)?)
                } else {
                    None
                };
                Ok(Some(fine.folding.fold(plus.as_ref(), minus.as_ref())))
            }
            _ => Ok(None),
        }
    }

    fn corrected(
        &self,
        side: Side<'_>,
        bin: usize,
        combination: MixingCombination,
        edges_rad: &[f64],
    ) -> Result<DMatrix<f64>, CovError> {
        let blocks = self.gaussian.compute(&BlockRequest { s: side, t: side })?;
        let pick = |kind: TermKind| {
            blocks
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, m)| m)
                .ok_or_else(|| CovError::AssemblyInconsistency(format!("Split Gaussian term produced no {kind:?} block.")))
        };
        let xi_plus = self.xi_plus.get(&bin).ok_or_else(|| {
            CovError::AssemblyInconsistency(format!("No correlation function tabulated for shear bin {}.", bin + 1))
        })?;
        let request = MixingRequest {
            bin,
            combination,
            edges_rad,
            area: side.area,
            xi_plus,
        };
        self.engine.correction(&request, pick(TermKind::GaussMix)?, pick(TermKind::GaussSn)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::test_support::grid;
    use crate::binning::{ARCMIN_TO_RAD, ThetaBins};
    use crate::cancel::CancelToken;
    use crate::combinator::{ObservableSetup, RunOptions, TomographicBins};
    use crate::diagnostics::{Diagnostics, WarningKind};
    use crate::domain::{ShearEstimator, Spacing, TermSelection};
    use crate::mixing::test_support::lattice;
    use crate::mixing::{Geometry, MixingSettings};
    use crate::terms::test_support::{flat_spectra, shear};

    const DEG: f64 = PI / 180.0;

    #[test]
    fn empty_tomographic_bin_yields_a_zero_block_and_a_warning() {
        let area = (6.0 * DEG) * (6.0 * DEG);
        let scheme = BinningScheme::Theta(ThetaBins::new(20.0, 60.0, 2, Spacing::Log).unwrap());
        let observables = vec![ObservableSetup::new(ObservableKind::CosmicShear, scheme, ShearEstimator::XiPm, area).unwrap()];
        let bins = TomographicBins {
            lensing: 2,
            clustering: 0,
        };
        let c = ObservableCombinator::new(observables, bins, TermSelection::default()).unwrap();

        let g = grid(1.0, 2e4, Some(60.0 * ARCMIN_TO_RAD), &[]);
        let diagnostics = Diagnostics::new();
        let kernels = KernelSet::build(&c, &g, &[], None, &diagnostics).unwrap();
        let spectra = flat_spectra(
            &[((shear(0), shear(0)), 1e-9), ((shear(1), shear(1)), 1e-9)],
            &[(shear(0), 1e-9), (shear(1), 1e-9)],
        );
        let grid_spectra = GridSpectra::new(&spectra, &g);

        // Every point sits in the first tomographic bin.
        let settings = MixingSettings {
            geometry: Geometry::Flat,
            patch_size_deg: 6.0,
            nmax: 6,
            nbins_phi: 32,
            dpix_min_arcmin: 6.0,
            do_overlap: true,
            do_ec: false,
            nbins_fine: 10,
        };
        let engine = MixingTermEngine::new(&lattice(60, 0.1, 0), 2, settings, 1.05 * DEG, CancelToken::new()).unwrap();
        let stage = MixingStage::new(
            &engine,
            vec![MixingCombination::XipXip, MixingCombination::XimXim],
            &c,
            &g,
            &grid_spectra,
        )
        .unwrap();

        let gauss = GaussianTerm::new(&g, &grid_spectra, false);
        let evaluators: Vec<&dyn TermEvaluator> = vec![&gauss];
        let options = RunOptions {
            num_cores: 2,
            cancel: CancelToken::new(),
            diagnostics: &diagnostics,
        };
        let results = c.run(&kernels, &evaluators, Some(&stage), &options).unwrap();
        let mixing: Vec<_> = results.iter().filter(|r| r.term == TermKind::Mixing).collect();
        assert_eq!(mixing.len(), 4);
        for r in &mixing {
            assert_eq!(r.s, r.t);
            let seg = c.segments()[r.s];
            if seg.tracers.0.bin == 1 {
                assert!(r.block.iter().all(|v| *v == 0.0));
            } else {
                assert!(r.block.iter().all(|v| v.is_finite()));
                assert!(r.block.iter().any(|v| *v != 0.0));
            }
        }
        assert_eq!(diagnostics.count(WarningKind::DegenerateGeometry), 2);
    }

    #[test]
    fn reach_follows_the_shear_scheme() {
        let scheme = BinningScheme::Theta(ThetaBins::new(20.0, 60.0, 2, Spacing::Log).unwrap());
        let observables = vec![ObservableSetup::new(ObservableKind::CosmicShear, scheme, ShearEstimator::XiP, 0.01).unwrap()];
        let bins = TomographicBins {
            lensing: 1,
            clustering: 0,
        };
        let c = ObservableCombinator::new(observables, bins, TermSelection::default()).unwrap();
        let reach = angular_reach(&c).unwrap();
        assert!((reach - 60.0 * ARCMIN_TO_RAD).abs() < 1e-15);
    }
}
