//! Observable pairs, segments and block dispatch.
//!
//! A *segment* is one row-block of the covariance: an observable, one of its
//! estimator components and one tomographic pair, spanning that observable's
//! statistic bins. Segments are laid out in global-index order (observable,
//! component, tomographic pair), so a segment's `offset` is its first global
//! row.
//!
//! [`ObservableCombinator::run`] evaluates every `(s <= t) × term` unit on a
//! bounded pool and returns the blocks in a deterministic order.

use std::collections::BTreeMap;

use nalgebra::DMatrix;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::binning::{BinningScheme, KernelMatrix};
use crate::cancel::CancelToken;
use crate::diagnostics::{Diagnostics, WarningKind};
use crate::domain::{Component, ObservableKind, Probe, ShearEstimator, StatisticKind, TermKind, TermSelection, Tracer};
use crate::error::CovError;
use crate::math::{EllGrid, EllGridSpec};
use crate::terms::{BlockRequest, CoarseEll, Side, TermEvaluator};

pub mod geometry;

pub use geometry::MixingStage;

/// One active observable and its statistic space.
#[derive(Debug, Clone)]
pub struct ObservableSetup {
    pub kind: ObservableKind,
    pub scheme: BinningScheme,
    pub components: Vec<Component>,
    /// Survey area, steradians.
    pub area: f64,
}

impl ObservableSetup {
    pub fn new(kind: ObservableKind, scheme: BinningScheme, estimator: ShearEstimator, area: f64) -> Result<Self, CovError> {
        if !(area.is_finite() && area > 0.0) {
            return Err(CovError::config(format!("Survey area for {kind} must be > 0 (got {area}).")));
        }
        if scheme.is_empty() {
            return Err(CovError::config(format!("{kind} has no statistic bins.")));
        }
        let components = components_for(kind, scheme.kind(), estimator);
        Ok(Self {
            kind,
            scheme,
            components,
            area,
        })
    }
}

/// Estimator components of an observable in a statistic space.
pub fn components_for(kind: ObservableKind, statistic: StatisticKind, estimator: ShearEstimator) -> Vec<Component> {
    if statistic != StatisticKind::Theta {
        return vec![Component::EMode];
    }
    match kind {
        ObservableKind::CosmicShear => match estimator {
            ShearEstimator::XiP => vec![Component::XiPlus],
            ShearEstimator::XiM => vec![Component::XiMinus],
            ShearEstimator::XiPm => vec![Component::XiPlus, Component::XiMinus],
        },
        ObservableKind::Ggl => vec![Component::GammaT],
        ObservableKind::Clustering => vec![Component::Wtheta],
    }
}

/// Number of tomographic bins per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TomographicBins {
    pub lensing: usize,
    pub clustering: usize,
}

impl TomographicBins {
    /// Tracer pairs of an observable in index order.
    pub fn pairs(&self, kind: ObservableKind) -> Vec<(Tracer, Tracer)> {
        let (first, second) = kind.probes();
        let count = |probe: Probe| match probe {
            Probe::Shear => self.lensing,
            Probe::Galaxy => self.clustering,
        };
        let mut out = Vec::new();
        for i in 0..count(first) {
            let start = if kind.is_auto() { i } else { 0 };
            for j in start..count(second) {
                out.push((Tracer::new(first, i), Tracer::new(second, j)));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Index into [`ObservableCombinator::observables`].
    pub observable: usize,
    pub kind: ObservableKind,
    pub component: Component,
    pub tracers: (Tracer, Tracer),
    pub offset: usize,
    pub bins: usize,
}

impl Segment {
    pub fn label(&self) -> String {
        format!("{}/{}/{}-{}", self.kind.tag(), self.component.tag(), self.tracers.0, self.tracers.1)
    }

    pub fn is_tomographic_auto(&self) -> bool {
        self.tracers.0 == self.tracers.1
    }
}

/// Kernels are shared by every segment with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelKey {
    pub observable: usize,
    pub component: Component,
    /// Lens bin, for schemes whose kernels depend on the lens distance.
    pub lens_bin: Option<usize>,
}

/// Kernel matrices (and coarse-ℓ moments) of every segment.
#[derive(Debug, Clone, Default)]
pub struct KernelSet {
    kernels: BTreeMap<KernelKey, KernelMatrix>,
    moments: BTreeMap<KernelKey, DMatrix<f64>>,
}

impl KernelSet {
    /// `lens_chi[i]` is the mean comoving distance of lens bin `i`.
    pub fn build(
        combinator: &ObservableCombinator,
        grid: &EllGrid,
        lens_chi: &[f64],
        coarse: Option<&CoarseEll>,
        diagnostics: &Diagnostics,
    ) -> Result<Self, CovError> {
        let mut keys: Vec<KernelKey> = combinator.segments.iter().map(|s| combinator.kernel_key(s)).collect();
        keys.sort();
        keys.dedup();
        let built = keys
            .par_iter()
            .map(|key| {
                let setup = &combinator.observables[key.observable];
                let chi = key.lens_bin.and_then(|b| lens_chi.get(b).copied());
                let order = key.component.bessel_order(setup.kind);
                let kernel = setup.scheme.kernel(order, grid, chi, diagnostics)?;
                let moments = coarse.map(|c| c.moments(&kernel));
                Ok((*key, kernel, moments))
            })
            .collect::<Result<Vec<_>, CovError>>()?;
        let mut set = Self::default();
        for (key, kernel, moments) in built {
            set.kernels.insert(key, kernel);
            if let Some(m) = moments {
                set.moments.insert(key, m);
            }
        }
        debug!(kernels = set.kernels.len(), "kernels tabulated");
        Ok(set)
    }

    pub fn kernel(&self, key: &KernelKey) -> Result<&KernelMatrix, CovError> {
        self.kernels
            .get(key)
            .ok_or_else(|| CovError::AssemblyInconsistency(format!("No kernel prepared for {key:?}.")))
    }

    pub fn moments(&self, key: &KernelKey) -> Option<&DMatrix<f64>> {
        self.moments.get(key)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

/// One computed block between segments `s <= t`.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockResult {
    pub s: usize,
    pub t: usize,
    pub term: TermKind,
    pub block: DMatrix<f64>,
}

pub struct RunOptions<'a> {
    pub num_cores: usize,
    pub cancel: CancelToken,
    pub diagnostics: &'a Diagnostics,
}

#[derive(Debug, Clone)]
pub struct ObservableCombinator {
    observables: Vec<ObservableSetup>,
    segments: Vec<Segment>,
    selection: TermSelection,
}

impl ObservableCombinator {
    pub fn new(
        mut observables: Vec<ObservableSetup>,
        bins: TomographicBins,
        selection: TermSelection,
    ) -> Result<Self, CovError> {
        observables.sort_by_key(|o| o.kind);
        if observables.windows(2).any(|w| w[0].kind == w[1].kind) {
            return Err(CovError::config("Each observable may be configured only once."));
        }
        let mut segments = Vec::new();
        let mut offset = 0;
        for (index, setup) in observables.iter().enumerate() {
            let pairs = bins.pairs(setup.kind);
            if pairs.is_empty() {
                return Err(CovError::config(format!(
                    "{} is active but its samples have no tomographic bins.",
                    setup.kind.display_name()
                )));
            }
            for &component in &setup.components {
                for &tracers in &pairs {
                    let n = setup.scheme.len();
                    segments.push(Segment {
                        observable: index,
                        kind: setup.kind,
                        component,
                        tracers,
                        offset,
                        bins: n,
                    });
                    offset += n;
                }
            }
        }
        Ok(Self {
            observables,
            segments,
            selection,
        })
    }

    pub fn observables(&self) -> &[ObservableSetup] {
        &self.observables
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn selection(&self) -> TermSelection {
        self.selection
    }

    /// Total number of rows of the covariance.
    pub fn dimension(&self) -> usize {
        self.segments.last().map_or(0, |s| s.offset + s.bins)
    }

    pub fn kernel_key(&self, segment: &Segment) -> KernelKey {
        let needs_lens = self.observables[segment.observable].scheme.needs_lens_distance();
        KernelKey {
            observable: segment.observable,
            component: segment.component,
            lens_bin: needs_lens.then_some(segment.tracers.0.bin),
        }
    }

    /// Segment pairs `(s, t)`, `s <= t`, that get computed.
    pub fn blocks(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for s in 0..self.segments.len() {
            for t in s..self.segments.len() {
                if self.selection.cross_terms || self.segments[s].kind == self.segments[t].kind {
                    out.push((s, t));
                }
            }
        }
        out
    }

    /// Shared multipole grid covering every scheme's kernels.
    pub fn build_grid(&self, base: &EllGridSpec, lens_chi_min: Option<f64>) -> Result<EllGrid, CovError> {
        let mut spec = *base;
        let mut breaks = Vec::new();
        let mut theta_max: Option<f64> = None;
        for setup in &self.observables {
            breaks.extend(setup.scheme.multipole_breaks());
            if let Some((lo, hi)) = setup.scheme.multipole_range() {
                if lo > 0.0 {
                    spec.ell_min = spec.ell_min.min(lo);
                }
                spec.ell_max = spec.ell_max.max(hi);
            }
            if let Some(theta) = setup.scheme.widest_angle(lens_chi_min) {
                theta_max = Some(theta_max.map_or(theta, |t| t.max(theta)));
            }
        }
        let grid = EllGrid::build(&spec, theta_max, &breaks)?;
        info!(
            nodes = grid.len(),
            ell_min = grid.ell_min(),
            ell_max = grid.ell_max(),
            "multipole grid built"
        );
        Ok(grid)
    }

    pub fn side<'a>(&'a self, kernels: &'a KernelSet, segment: usize) -> Result<Side<'a>, CovError> {
        let seg = &self.segments[segment];
        let key = self.kernel_key(seg);
        Ok(Side {
            observable: seg.kind,
            component: seg.component,
            tracers: seg.tracers,
            kernel: kernels.kernel(&key)?,
            moments: kernels.moments(&key),
            area: self.observables[seg.observable].area,
        })
    }

    /// Evaluate every unit and return the blocks sorted by `(s, t, term)`.
    pub fn run(
        &self,
        kernels: &KernelSet,
        evaluators: &[&dyn TermEvaluator],
        mixing: Option<&MixingStage<'_>>,
        options: &RunOptions<'_>,
    ) -> Result<Vec<BlockResult>, CovError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.num_cores.max(1))
            .build()
            .map_err(|e| CovError::config(format!("Failed to start worker pool: {e}")))?;

        let blocks = self.blocks();
        let units: Vec<(usize, usize, usize)> = blocks
            .iter()
            .flat_map(|&(s, t)| (0..evaluators.len()).map(move |e| (s, t, e)))
            .collect();
        info!(
            segments = self.segments.len(),
            blocks = blocks.len(),
            units = units.len(),
            cores = options.num_cores.max(1),
            "dispatching covariance units"
        );

        let mut results = pool.install(|| {
            units
                .par_iter()
                .map(|&(s, t, e)| {
                    options.cancel.checkpoint()?;
                    let request = BlockRequest {
                        s: self.side(kernels, s)?,
                        t: self.side(kernels, t)?,
                    };
                    let blocks = evaluators[e].compute(&request)?;
                    let expected = (self.segments[s].bins, self.segments[t].bins);
                    blocks
                        .into_iter()
                        .map(|(term, block)| {
                            if block.shape() != expected {
                                return Err(CovError::AssemblyInconsistency(format!(
                                    "{} block {} x {} has shape {:?}, expected {expected:?}.",
                                    evaluators[e].name(),
                                    self.segments[s].label(),
                                    self.segments[t].label(),
                                    block.shape()
                                )));
                            }
                            Ok(BlockResult { s, t, term, block })
                        })
                        .collect::<Result<Vec<_>, CovError>>()
                })
                .collect::<Result<Vec<_>, CovError>>()
        })?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

        if let Some(stage) = mixing {
            let eligible: Vec<usize> = (0..self.segments.len())
                .filter(|&s| stage.applies_to(self, s))
                .collect();
            let corrections = pool.install(|| {
                eligible
                    .par_iter()
                    .map(|&s| {
                        options.cancel.checkpoint()?;
                        match stage.correction(self, kernels, s) {
                            Ok(block) => Ok(block.map(|block| BlockResult {
                                s,
                                t: s,
                                term: TermKind::Mixing,
                                block,
                            })),
                            Err(err) if err.is_recoverable() => {
                                options.diagnostics.push(
                                    WarningKind::DegenerateGeometry,
                                    format!("{}: {err}", self.segments[s].label()),
                                    None,
                                );
                                let n = self.segments[s].bins;
                                Ok(Some(BlockResult {
                                    s,
                                    t: s,
                                    term: TermKind::Mixing,
                                    block: DMatrix::zeros(n, n),
                                }))
                            }
                            Err(err) => Err(err),
                        }
                    })
                    .collect::<Result<Vec<_>, CovError>>()
            })?;
            results.extend(corrections.into_iter().flatten());
        }

        results.sort_by_key(|r| (r.s, r.t, r.term));
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::ThetaBins;
    use crate::binning::test_support::grid;
    use crate::domain::Spacing;
    use crate::terms::test_support::{flat_spectra, galaxy, shear};
    use crate::terms::{GaussianTerm, GridSpectra};

    fn theta(bins: usize) -> BinningScheme {
        BinningScheme::Theta(ThetaBins::new(10.0, 100.0, bins, Spacing::Log).unwrap())
    }

    fn combinator(selection: TermSelection) -> ObservableCombinator {
        let observables = vec![
            ObservableSetup::new(ObservableKind::Clustering, theta(2), ShearEstimator::XiP, 0.05).unwrap(),
            ObservableSetup::new(ObservableKind::CosmicShear, theta(3), ShearEstimator::XiPm, 0.05).unwrap(),
        ];
        let bins = TomographicBins {
            lensing: 2,
            clustering: 1,
        };
        ObservableCombinator::new(observables, bins, selection).unwrap()
    }

    #[test]
    fn segments_follow_global_index_order() {
        let c = combinator(TermSelection::default());
        let labels: Vec<String> = c.segments().iter().map(Segment::label).collect();
        assert_eq!(
            labels,
            vec![
                "shear/xip/s1-s1",
                "shear/xip/s1-s2",
                "shear/xip/s2-s2",
                "shear/xim/s1-s1",
                "shear/xim/s1-s2",
                "shear/xim/s2-s2",
                "clustering/w/g1-g1",
            ]
        );
        let offsets: Vec<usize> = c.segments().iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 3, 6, 9, 12, 15, 18]);
        assert_eq!(c.dimension(), 20);
    }

    #[test]
    fn ggl_pairs_are_ordered_lens_source() {
        let bins = TomographicBins {
            lensing: 2,
            clustering: 2,
        };
        let pairs = bins.pairs(ObservableKind::Ggl);
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[1], (galaxy(0), shear(1)));
    }

    #[test]
    fn cross_terms_off_keeps_same_observable_blocks() {
        let c = combinator(TermSelection {
            cross_terms: false,
            ..TermSelection::default()
        });
        let blocks = c.blocks();
        assert!(blocks.iter().all(|&(s, t)| c.segments()[s].kind == c.segments()[t].kind));
        // 6 shear segments give 21 pairs, plus the clustering auto block.
        assert_eq!(blocks.len(), 22);
        let all = combinator(TermSelection::default()).blocks();
        assert_eq!(all.len(), 28);
    }

    #[test]
    fn duplicate_observables_are_rejected() {
        let observables = vec![
            ObservableSetup::new(ObservableKind::Clustering, theta(2), ShearEstimator::XiP, 0.05).unwrap(),
            ObservableSetup::new(ObservableKind::Clustering, theta(3), ShearEstimator::XiP, 0.05).unwrap(),
        ];
        let bins = TomographicBins {
            lensing: 0,
            clustering: 1,
        };
        assert!(ObservableCombinator::new(observables, bins, TermSelection::default()).is_err());
    }

    #[test]
    fn run_returns_sorted_blocks_and_honours_cancellation() {
        let c = combinator(TermSelection::default());
        let g = grid(1.0, 2e4, Some(100.0 * crate::binning::ARCMIN_TO_RAD), &[]);
        let diagnostics = Diagnostics::new();
        let kernels = KernelSet::build(&c, &g, &[], None, &diagnostics).unwrap();
        assert_eq!(kernels.len(), 3);
        let spectra = flat_spectra(
            &[((shear(0), shear(0)), 1e-9), ((shear(1), shear(1)), 2e-9), ((galaxy(0), galaxy(0)), 1e-7)],
            &[(shear(0), 1e-9), (shear(1), 1e-9), (galaxy(0), 1e-8)],
        );
        let grid_spectra = GridSpectra::new(&spectra, &g);
        let gauss = GaussianTerm::new(&g, &grid_spectra, false);
        let evaluators: Vec<&dyn TermEvaluator> = vec![&gauss];
        let options = RunOptions {
            num_cores: 2,
            cancel: CancelToken::new(),
            diagnostics: &diagnostics,
        };
        let results = c.run(&kernels, &evaluators, None, &options).unwrap();
        assert_eq!(results.len(), c.blocks().len());
        assert!(results.windows(2).all(|w| (w[0].s, w[0].t) < (w[1].s, w[1].t)));
        assert!(results.iter().all(|r| r.term == TermKind::Gauss));

        let again = c.run(&kernels, &evaluators, None, &options).unwrap();
        assert_eq!(results, again);

        options.cancel.cancel();
        assert_eq!(c.run(&kernels, &evaluators, None, &options), Err(CovError::Cancelled));
    }
}
