//! Survey-geometry correction of the Gaussian term.
//!
//! The analytic Gaussian term assumes an unbounded, uniformly populated
//! field. For shear correlation functions the engine measures how the real
//! footprint departs from that from a point catalog:
//!
//! - pair counts per angular bin give `Q_a = N_ideal / N_eff`
//! - triplet sums `R = Σ_i W_i Σ_n ξ_n G_n^a conj(G_n^b)` give the mixed
//!   term's geometry ratio `R_geo / R_ideal`
//!
//! and the additive correction is
//!
//! ```text
//! ΔC_ab = mix_ab (R_ab Q_a Q_b - 1) + sn_ab (sqrt(Q_a Q_b) - 1)
//! ```
//!
//! COSEBIs get the same correction on fine θ bins, folded with `T±`.

use nalgebra::DMatrix;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::binning::{ARCMIN_TO_RAD, CosebiModes};
use crate::cancel::CancelToken;
use crate::error::CovError;
use crate::io::catalog::PointCatalog;
use crate::math::{Extrapolation, Table1D};

pub mod multipoles;
pub mod patches;

pub use patches::{Geometry, NeighbourIndex, PixelMap};

use multipoles::{Phase, accumulate, contract, correlation_multipoles, spin_four_shift};

/// Bins narrower than this many pixels use exact point pair counts when
/// `do_ec` is on.
const EC_PIXELS: f64 = 4.0;
const EC_CHUNK: usize = 4096;
/// Sample points per fine bin when folding with `T±`.
const FOLD_POINTS: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct MixingSettings {
    pub geometry: Geometry,
    pub patch_size_deg: f64,
    pub nmax: usize,
    pub nbins_phi: usize,
    pub dpix_min_arcmin: f64,
    pub do_overlap: bool,
    pub do_ec: bool,
    /// Fine θ bins used for COSEBIs.
    pub nbins_fine: usize,
}

impl Default for MixingSettings {
    fn default() -> Self {
        Self {
            geometry: Geometry::Spherical,
            patch_size_deg: 5.0,
            nmax: 10,
            nbins_phi: 64,
            dpix_min_arcmin: 1.0,
            do_overlap: true,
            do_ec: false,
            nbins_fine: 50,
        }
    }
}

impl MixingSettings {
    pub fn validate(&self) -> Result<(), CovError> {
        if !(self.patch_size_deg > 0.0 && self.dpix_min_arcmin > 0.0) {
            return Err(CovError::config("mixing: patch_size and dpix_min must be > 0."));
        }
        if self.dpix_min_arcmin / 60.0 > self.patch_size_deg {
            return Err(CovError::config("mixing: dpix_min must not exceed patch_size."));
        }
        if self.nbins_phi < 2 * (self.nmax + 4) + 1 {
            return Err(CovError::config(format!(
                "mixing: nbins_phi = {} cannot resolve multipoles up to nmax + 4 = {}.",
                self.nbins_phi,
                self.nmax + 4
            )));
        }
        if self.nbins_fine < 2 {
            return Err(CovError::config("mixing: nbins_fine must be >= 2."));
        }
        Ok(())
    }
}

/// Which correlation-function block a correction applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MixingCombination {
    XipXip,
    XimXim,
}

impl MixingCombination {
    pub fn parse(tag: &str) -> Result<Self, CovError> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "xipxip" => Ok(Self::XipXip),
            "ximxim" => Ok(Self::XimXim),
            other => Err(CovError::config(format!(
                "mixing: unsupported combination `{other}` (expected xipxip or ximxim)."
            ))),
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::XipXip => "xipxip",
            Self::XimXim => "ximxim",
        }
    }
}

/// One correction request: an auto-correlation bin seen through angular bins.
#[derive(Debug, Clone, Copy)]
pub struct MixingRequest<'a> {
    /// Zero-based tomographic bin.
    pub bin: usize,
    pub combination: MixingCombination,
    pub edges_rad: &'a [f64],
    /// Survey area the analytic term assumed, steradians.
    pub area: f64,
    /// `ξ_+(θ)` of the bin, θ in radians.
    pub xi_plus: &'a Table1D,
}

/// Measured geometry of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryFactors {
    /// `R_geo / R_ideal` per bin pair.
    pub triplet_ratio: DMatrix<f64>,
    /// `Q_a = N_ideal / N_eff` per bin.
    pub pair_ratio: Vec<f64>,
}

impl GeometryFactors {
    /// Additive correction given the analytic mixed and noise blocks.
    pub fn correction(&self, mix: &DMatrix<f64>, sn: &DMatrix<f64>) -> Result<DMatrix<f64>, CovError> {
        let n = self.pair_ratio.len();
        if mix.shape() != (n, n) || sn.shape() != (n, n) {
            return Err(CovError::AssemblyInconsistency(format!(
                "Mixing correction for {n} bins got blocks of shape {:?} and {:?}.",
                mix.shape(),
                sn.shape()
            )));
        }
        Ok(DMatrix::from_fn(n, n, |a, b| {
            let qq = self.pair_ratio[a] * self.pair_ratio[b];
            mix[(a, b)] * (self.triplet_ratio[(a, b)] * qq - 1.0) + sn[(a, b)] * (qq.sqrt() - 1.0)
        }))
    }
}

/// Partial sums of one patch.
#[derive(Debug, Clone)]
struct PatchSums {
    triplets: DMatrix<f64>,
    pairs: Vec<f64>,
    weight: f64,
    weight_sq: f64,
}

impl PatchSums {
    fn zeros(bins: usize) -> Self {
        Self {
            triplets: DMatrix::zeros(bins, bins),
            pairs: vec![0.0; bins],
            weight: 0.0,
            weight_sq: 0.0,
        }
    }

    fn add(mut self, other: &PatchSums) -> Self {
        self.triplets += &other.triplets;
        for (p, q) in self.pairs.iter_mut().zip(&other.pairs) {
            *p += q;
        }
        self.weight += other.weight;
        self.weight_sq += other.weight_sq;
        self
    }
}

pub struct MixingTermEngine {
    settings: MixingSettings,
    map: PixelMap,
    index: NeighbourIndex,
    max_radius: f64,
    cancel: CancelToken,
}

impl std::fmt::Debug for MixingTermEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixingTermEngine")
            .field("geometry", &self.settings.geometry)
            .field("pixels", &self.map.pixels().len())
            .field("patches", &self.map.patches().len())
            .finish()
    }
}

impl MixingTermEngine {
    /// Pixelize `catalog` and index it for separations up to `max_theta_rad`.
    pub fn new(
        catalog: &PointCatalog,
        n_bins: usize,
        settings: MixingSettings,
        max_theta_rad: f64,
        cancel: CancelToken,
    ) -> Result<Self, CovError> {
        settings.validate()?;
        if !(max_theta_rad > 0.0) {
            return Err(CovError::config("mixing: the largest angular scale must be > 0."));
        }
        let map = PixelMap::build(
            settings.geometry,
            &catalog.points,
            n_bins,
            settings.dpix_min_arcmin * ARCMIN_TO_RAD,
            settings.patch_size_deg * 60.0 * ARCMIN_TO_RAD,
        )?;
        let index = NeighbourIndex::new(map.pixels().iter().map(|p| &p.position.vec), max_theta_rad);
        info!(
            points = catalog.points.len(),
            pixels = map.pixels().len(),
            patches = map.patches().len(),
            "mixing catalog pixelized"
        );
        Ok(Self {
            settings,
            map,
            index,
            max_radius: max_theta_rad,
            cancel,
        })
    }

    pub fn settings(&self) -> &MixingSettings {
        &self.settings
    }

    pub fn pixel_map(&self) -> &PixelMap {
        &self.map
    }

    /// Correction block for one auto-correlation bin.
    pub fn correction(
        &self,
        request: &MixingRequest<'_>,
        mix: &DMatrix<f64>,
        sn: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, CovError> {
        self.geometry(request)?.correction(mix, sn)
    }

    /// Pair and triplet ratios of one request.
    pub fn geometry(&self, request: &MixingRequest<'_>) -> Result<GeometryFactors, CovError> {
        let edges = request.edges_rad;
        let bin = request.bin;
        if edges.len() < 2 || edges.windows(2).any(|w| w[1] <= w[0]) || edges[0] < 0.0 {
            return Err(CovError::config("mixing: angular edges must be increasing and non-negative."));
        }
        let nb = edges.len() - 1;
        let theta_max = edges[nb];
        if theta_max > self.max_radius * (1.0 + 1e-12) {
            return Err(CovError::config(format!(
                "mixing: bins reach {theta_max} rad but the catalog was indexed to {} rad.",
                self.max_radius
            )));
        }
        let total = self.map.total_weight(bin);
        if !(total > 0.0) {
            return Err(CovError::DegenerateGeometry {
                bin,
                reason: "no catalog weight in this tomographic bin".to_string(),
            });
        }
        if !(request.area > 0.0) {
            return Err(CovError::DegenerateGeometry {
                bin,
                reason: "survey area is zero".to_string(),
            });
        }

        let geometry = self.settings.geometry;
        let nmax = self.settings.nmax;
        let centers: Vec<f64> = edges
            .windows(2)
            .map(|w| if w[0] > 0.0 { (w[0] * w[1]).sqrt() } else { 0.5 * w[1] })
            .collect();
        let annulus: Vec<f64> = edges
            .windows(2)
            .map(|w| match geometry {
                Geometry::Flat => std::f64::consts::PI * (w[1] * w[1] - w[0] * w[0]),
                Geometry::Spherical => 2.0 * std::f64::consts::PI * (w[0].cos() - w[1].cos()),
            })
            .collect();
        let order = match request.combination {
            MixingCombination::XipXip => nmax,
            MixingCombination::XimXim => nmax + 4,
        };
        let mut coefficients = vec![vec![Vec::new(); nb]; nb];
        for a in 0..nb {
            for b in a..nb {
                let xi_n = correlation_multipoles(request.xi_plus, centers[a], centers[b], order, self.settings.nbins_phi);
                let c = match request.combination {
                    MixingCombination::XipXip => xi_n,
                    MixingCombination::XimXim => spin_four_shift(&xi_n, nmax),
                };
                coefficients[b][a] = c.clone();
                coefficients[a][b] = c;
            }
        }

        let partials = self
            .map
            .patches()
            .par_iter()
            .map(|patch| {
                self.cancel.checkpoint()?;
                Ok(self.patch_sums(patch, bin, edges, &coefficients))
            })
            .collect::<Result<Vec<_>, CovError>>()?;
        let sums = partials.iter().fold(PatchSums::zeros(nb), PatchSums::add);

        let mut pairs = sums.pairs.clone();
        if self.settings.do_ec {
            let limit = EC_PIXELS * self.map.pixel_size();
            let exact_bins = edges[1..].iter().take_while(|e| **e <= limit).count();
            if exact_bins > 0 {
                let exact = self.exact_pair_counts(bin, &edges[..=exact_bins])?;
                pairs[..exact_bins].copy_from_slice(&exact);
            }
        }

        let density = total / request.area;
        let mut pair_ratio = Vec::with_capacity(nb);
        for a in 0..nb {
            if !(pairs[a] > 0.0) {
                return Err(CovError::DegenerateGeometry {
                    bin,
                    reason: format!("no pairs between {:.3e} and {:.3e} rad", edges[a], edges[a + 1]),
                });
            }
            pair_ratio.push(sums.weight * density * annulus[a] / pairs[a]);
        }
        let triplet_ratio = DMatrix::from_fn(nb, nb, |a, b| {
            let ideal = sums.weight_sq * density * density * annulus[a] * annulus[b] * coefficients[a][b][0];
            if ideal == 0.0 { 1.0 } else { sums.triplets[(a, b)] / ideal }
        });
        debug!(
            bin,
            combination = request.combination.tag(),
            bins = nb,
            "mixing geometry measured"
        );
        Ok(GeometryFactors {
            triplet_ratio,
            pair_ratio,
        })
    }

    fn patch_sums(&self, patch: &[usize], bin: usize, edges: &[f64], coefficients: &[Vec<Vec<f64>>]) -> PatchSums {
        let nb = edges.len() - 1;
        let theta_max = edges[nb];
        let geometry = self.settings.geometry;
        let pixels = self.map.pixels();
        let mut sums = PatchSums::zeros(nb);
        let mut g = vec![vec![Phase::default(); self.settings.nmax + 1]; nb];
        for &i in patch {
            let center = &pixels[i];
            let w = center.weight[bin];
            if w == 0.0 {
                continue;
            }
            for row in g.iter_mut() {
                row.fill(Phase::default());
            }
            for j in self.index.candidates(&center.position.vec) {
                let neighbour = &pixels[j];
                let wn = neighbour.weight[bin];
                if j == i || wn == 0.0 || (!self.settings.do_overlap && neighbour.patch != center.patch) {
                    continue;
                }
                let (sep, phi) = center.position.separation_and_angle(geometry, &neighbour.position);
                if sep < edges[0] || sep >= theta_max {
                    continue;
                }
                let a = edges.partition_point(|e| *e <= sep) - 1;
                accumulate(&mut g[a], wn, phi);
            }
            for a in 0..nb {
                sums.pairs[a] += w * g[a][0].re;
                for b in a..nb {
                    let v = center.weight_sq[bin] * contract(&g[a], &g[b], &coefficients[a][b]);
                    sums.triplets[(a, b)] += v;
                    if b != a {
                        sums.triplets[(b, a)] += v;
                    }
                }
            }
            sums.weight += w;
            sums.weight_sq += center.weight_sq[bin];
        }
        sums
    }

    /// Weighted point pairs per bin, counted on the raw catalog.
    fn exact_pair_counts(&self, bin: usize, edges: &[f64]) -> Result<Vec<f64>, CovError> {
        let nb = edges.len() - 1;
        let theta_max = edges[nb];
        let geometry = self.settings.geometry;
        let points = self.map.bin_points(bin);
        let index = NeighbourIndex::new(points.iter().map(|(p, _, _)| &p.vec), theta_max);
        let chunks = (0..points.len())
            .collect::<Vec<_>>()
            .par_chunks(EC_CHUNK)
            .map(|chunk| {
                self.cancel.checkpoint()?;
                let mut counts = vec![0.0; nb];
                for &i in chunk {
                    let (pos, w, patch) = &points[i];
                    for j in index.candidates(&pos.vec) {
                        let (other, wo, other_patch) = &points[j];
                        if j == i || (!self.settings.do_overlap && other_patch != patch) {
                            continue;
                        }
                        let (sep, _) = pos.separation_and_angle(geometry, other);
                        if sep < edges[0] || sep >= theta_max {
                            continue;
                        }
                        counts[edges.partition_point(|e| *e <= sep) - 1] += w * wo;
                    }
                }
                Ok(counts)
            })
            .collect::<Result<Vec<_>, CovError>>()?;
        let mut total = vec![0.0; nb];
        for counts in &chunks {
            for (t, c) in total.iter_mut().zip(counts) {
                *t += c;
            }
        }
        Ok(total)
    }
}

/// Linear maps from fine ξ± bins to COSEBI modes.
///
/// `E_n ≈ Σ_a A+_na ξ+_a + A-_na ξ-_a` with `A±_na = ½ ∫_bin θ T±_n(θ) dθ`.
#[derive(Debug, Clone, PartialEq)]
pub struct CosebiFolding {
    pub plus: DMatrix<f64>,
    pub minus: DMatrix<f64>,
}

impl CosebiFolding {
    pub fn new(modes: &CosebiModes, edges_rad: &[f64]) -> Self {
        let nb = edges_rad.len().saturating_sub(1);
        let fold = |table: &Table1D, a: usize| -> f64 {
            let (lo, hi) = (edges_rad[a], edges_rad[a + 1]);
            let h = (hi - lo) / FOLD_POINTS as f64;
            (0..FOLD_POINTS)
                .map(|k| {
                    let theta = lo + (k as f64 + 0.5) * h;
                    0.5 * theta * table.eval(theta / ARCMIN_TO_RAD, Extrapolation::Zero) * h
                })
                .sum()
        };
        let plus = DMatrix::from_fn(modes.n_modes(), nb, |m, a| fold(modes.t_plus(m), a));
        let minus = DMatrix::from_fn(modes.n_modes(), nb, |m, a| fold(modes.t_minus(m), a));
        Self { plus, minus }
    }

    /// `A+ C+ A+ᵀ + A- C- A-ᵀ` for whichever fine-bin corrections exist.
    pub fn fold(&self, plus: Option<&DMatrix<f64>>, minus: Option<&DMatrix<f64>>) -> DMatrix<f64> {
        let n = self.plus.nrows();
        let mut out = DMatrix::zeros(n, n);
        if let Some(c) = plus {
            out += &self.plus * c * self.plus.transpose();
        }
        if let Some(c) = minus {
            out += &self.minus * c * self.minus.transpose();
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::io::catalog::{CatalogPoint, PointCatalog};

    /// `n × n` points on a square lattice of spacing `step` degrees, one
    /// per pixel when `dpix = step`.
    pub fn lattice(n: usize, step: f64, bin: usize) -> PointCatalog {
        let points = (0..n)
            .flat_map(|i| (0..n).map(move |j| (i, j)))
            .map(|(i, j)| CatalogPoint {
                x: (i as f64 + 0.5) * step,
                y: (j as f64 + 0.5) * step,
                weight: 1.0,
                bin,
            })
            .collect();
        PointCatalog::from_points(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::cosebi::tests::bump_modes;
    use crate::math::quad::trapezoid;

    const DEG: f64 = std::f64::consts::PI / 180.0;

    fn settings(patch_size_deg: f64, do_overlap: bool, do_ec: bool) -> MixingSettings {
        MixingSettings {
            geometry: Geometry::Flat,
            patch_size_deg,
            nmax: 6,
            nbins_phi: 32,
            dpix_min_arcmin: 6.0,
            do_overlap,
            do_ec,
            nbins_fine: 10,
        }
    }

    fn xi_table() -> Table1D {
        let theta: Vec<f64> = (0..200).map(|i| i as f64 * 0.05 * DEG).collect();
        let xi = theta.iter().map(|t| 1e-5 / (1.0 + t / (0.2 * DEG))).collect();
        Table1D::new(theta, xi).unwrap()
    }

    fn measure(engine: &MixingTermEngine, edges_deg: &[f64], combination: MixingCombination) -> GeometryFactors {
        let edges: Vec<f64> = edges_deg.iter().map(|e| e * DEG).collect();
        let xi = xi_table();
        let request = MixingRequest {
            bin: 0,
            combination,
            edges_rad: &edges,
            area: (6.0 * DEG) * (6.0 * DEG),
            xi_plus: &xi,
        };
        engine.geometry(&request).unwrap()
    }

    fn engine(settings: MixingSettings) -> MixingTermEngine {
        let catalog = test_support::lattice(60, 0.1, 0);
        MixingTermEngine::new(&catalog, 1, settings, 1.7 * DEG, CancelToken::new()).unwrap()
    }

    #[test]
    fn edges_reduce_pair_counts_more_at_large_separation() {
        let factors = measure(&engine(settings(10.0, true, false)), &[0.41, 0.81, 1.61], MixingCombination::XipXip);
        let q = &factors.pair_ratio;
        assert!((q[0] - 1.0752).abs() < 1e-3, "{q:?}");
        assert!((q[1] - 1.3724).abs() < 1e-3, "{q:?}");
    }

    #[test]
    fn disjoint_patches_lose_pairs_without_overlap() {
        let edges = [0.41, 0.81, 1.61];
        let with = measure(&engine(settings(3.0, true, false)), &edges, MixingCombination::XipXip);
        let without = measure(&engine(settings(3.0, false, false)), &edges, MixingCombination::XipXip);
        let single = measure(&engine(settings(10.0, true, false)), &edges, MixingCombination::XipXip);
        for a in 0..2 {
            assert!((with.pair_ratio[a] / single.pair_ratio[a] - 1.0).abs() < 1e-12);
            assert!(without.pair_ratio[a] > with.pair_ratio[a] * 1.1, "{:?}", without.pair_ratio);
        }
        assert!((without.pair_ratio[1] - 1.9547).abs() < 1e-3, "{:?}", without.pair_ratio);
    }

    #[test]
    fn exact_counts_match_pixel_counts_with_one_point_per_pixel() {
        let edges = [0.15, 0.31, 0.81];
        let pixel = measure(&engine(settings(10.0, true, false)), &edges, MixingCombination::XipXip);
        let exact = measure(&engine(settings(10.0, true, true)), &edges, MixingCombination::XipXip);
        for a in 0..2 {
            assert!((pixel.pair_ratio[a] / exact.pair_ratio[a] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn triplet_ratio_is_symmetric_and_repeatable() {
        let e = engine(settings(3.0, true, false));
        let first = measure(&e, &[0.41, 0.81, 1.61], MixingCombination::XimXim);
        let second = measure(&e, &[0.41, 0.81, 1.61], MixingCombination::XimXim);
        assert_eq!(first, second);
        let r = &first.triplet_ratio;
        assert!((r[(0, 1)] - r[(1, 0)]).abs() <= 1e-12 * r[(0, 1)].abs());
        let plus = measure(&e, &[0.41, 0.81, 1.61], MixingCombination::XipXip);
        assert!(plus.triplet_ratio.iter().all(|v| v.is_finite() && *v > 0.0));
    }

    #[test]
    fn empty_bin_is_degenerate() {
        let catalog = test_support::lattice(10, 0.1, 0);
        let e = MixingTermEngine::new(&catalog, 2, settings(10.0, true, false), 1.0 * DEG, CancelToken::new()).unwrap();
        let edges = [0.2 * DEG, 0.4 * DEG];
        let xi = xi_table();
        let err = e
            .geometry(&MixingRequest {
                bin: 1,
                combination: MixingCombination::XipXip,
                edges_rad: &edges,
                area: 1e-4,
                xi_plus: &xi,
            })
            .unwrap_err();
        assert!(matches!(err, CovError::DegenerateGeometry { bin: 1, .. }), "{err}");
        assert!(err.is_recoverable());
    }

    #[test]
    fn correction_combines_mixed_and_noise_parts() {
        let factors = GeometryFactors {
            triplet_ratio: DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 2.0]),
            pair_ratio: vec![1.0, 4.0],
        };
        let mix = DMatrix::from_element(2, 2, 1.0);
        let sn = DMatrix::from_diagonal_element(2, 2, 3.0);
        let c = factors.correction(&mix, &sn).unwrap();
        assert_eq!(c[(0, 0)], 0.0);
        assert_eq!(c[(0, 1)], 0.5 * 4.0 - 1.0);
        assert_eq!(c[(1, 1)], (2.0 * 16.0 - 1.0) + 3.0 * 3.0);
        assert!(factors.correction(&DMatrix::zeros(3, 3), &sn).is_err());
    }

    #[test]
    fn unknown_combinations_are_rejected() {
        assert_eq!(MixingCombination::parse("XipXip").unwrap(), MixingCombination::XipXip);
        assert!(matches!(MixingCombination::parse("xipxim"), Err(CovError::Configuration(_))));
    }

    #[test]
    fn coarse_phi_sampling_is_rejected() {
        let mut s = settings(10.0, true, false);
        s.nbins_phi = 12;
        assert!(s.validate().is_err());
    }

    #[test]
    fn folding_integrates_the_filters() {
        let modes = bump_modes(2);
        let (lo, hi) = modes.theta_range_rad();
        let edges: Vec<f64> = (0..=40).map(|i| lo + (hi - lo) * i as f64 / 40.0).collect();
        let folding = CosebiFolding::new(&modes, &edges);
        for m in 0..2 {
            let table = modes.t_plus(m);
            let theta: Vec<f64> = table.x().iter().map(|t| t * ARCMIN_TO_RAD).collect();
            let integrand: Vec<f64> = theta.iter().zip(table.y()).map(|(t, v)| 0.5 * t * v).collect();
            let want = trapezoid(&theta, &integrand);
            let got: f64 = folding.plus.row(m).iter().sum();
            assert!((got - want).abs() < 1e-3 * want.abs().max(1e-12), "mode {m}: {got} vs {want}");
        }
        let ones = DMatrix::from_element(40, 40, 1.0);
        let folded = folding.fold(Some(&ones), None);
        let row: f64 = folding.plus.row(0).iter().sum();
        assert!((folded[(0, 0)] - row * row).abs() < 1e-12 * (row * row).abs().max(1e-300));
    }
}
