//! Synthetic inputs: redshift distributions and point catalogs.
//!
//! Both are deterministic for a given seed so test runs and
//! `lsscov mock-catalog` outputs can be reproduced exactly.

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use crate::domain::RedshiftDistribution;
use crate::error::CovError;
use crate::io::catalog::{CatalogPoint, PointCatalog};
use crate::math::lin_space;
use crate::mixing::Geometry;

const NZ_POINTS: usize = 301;
const MAX_DRAWS_PER_POINT: usize = 1000;

/// Gaussian `n(z)` of the given mean and width, cut at `z = 0` and
/// normalized.
pub fn mock_nz(mean: f64, width: f64, z_max: f64) -> Result<RedshiftDistribution, CovError> {
    if !(mean > 0.0 && width > 0.0 && z_max > mean) {
        return Err(CovError::config(format!(
            "Mock n(z) needs 0 < mean < z_max and width > 0 (got mean={mean}, width={width}, z_max={z_max})."
        )));
    }
    let z = lin_space(0.0, z_max, NZ_POINTS)?;
    let nz = z.iter().map(|z| (-0.5 * ((z - mean) / width).powi(2)).exp()).collect();
    RedshiftDistribution::new(z, nz)
}

/// Footprint and sampling of a mock catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockCatalogSpec {
    pub geometry: Geometry,
    /// Longitude (or x) range, degrees.
    pub x_range: (f64, f64),
    /// Latitude (or y) range, degrees.
    pub y_range: (f64, f64),
    pub points: usize,
    pub bins: usize,
    /// Circular holes cut out of the footprint.
    pub holes: usize,
    pub hole_radius_deg: f64,
    /// Relative scatter of the weights around one.
    pub weight_scatter: f64,
    pub seed: u64,
}

impl Default for MockCatalogSpec {
    fn default() -> Self {
        Self {
            geometry: Geometry::Spherical,
            x_range: (0.0, 10.0),
            y_range: (-5.0, 5.0),
            points: 20_000,
            bins: 2,
            holes: 0,
            hole_radius_deg: 0.5,
            weight_scatter: 0.0,
            seed: 42,
        }
    }
}

/// Uniform points over the footprint, minus the holes.
///
/// On the sphere points are uniform in `sin(dec)`. Every point gets a
/// tomographic bin drawn uniformly from `0..bins`.
pub fn mock_catalog(spec: &MockCatalogSpec) -> Result<PointCatalog, CovError> {
    let (x0, x1) = spec.x_range;
    let (y0, y1) = spec.y_range;
    if !(x1 > x0 && y1 > y0) {
        return Err(CovError::config("Mock catalog ranges must be increasing."));
    }
    if spec.geometry == Geometry::Spherical && !(y0 >= -90.0 && y1 <= 90.0) {
        return Err(CovError::config("Mock catalog declinations must lie in [-90, 90]."));
    }
    if spec.points == 0 || spec.bins == 0 {
        return Err(CovError::config("Mock catalog needs at least one point and one bin."));
    }
    if !(spec.weight_scatter >= 0.0 && spec.hole_radius_deg >= 0.0) {
        return Err(CovError::config("Mock catalog scatter and hole radius must be >= 0."));
    }

    let mut rng = StdRng::seed_from_u64(spec.seed);
    let normal =
        Normal::new(0.0, 1.0).map_err(|e| CovError::numerical(format!("Weight distribution error: {e}")))?;
    let (s0, s1) = (y0.to_radians().sin(), y1.to_radians().sin());
    let draw = |rng: &mut StdRng| -> (f64, f64) {
        let x = rng.gen_range(x0..x1);
        let y = match spec.geometry {
            Geometry::Flat => rng.gen_range(y0..y1),
            Geometry::Spherical => rng.gen_range(s0..s1).asin().to_degrees(),
        };
        (x, y)
    };

    let holes: Vec<(f64, f64)> = (0..spec.holes).map(|_| draw(&mut rng)).collect();
    let in_hole = |x: f64, y: f64| {
        holes.iter().any(|&(hx, hy)| {
            let dx = match spec.geometry {
                Geometry::Flat => x - hx,
                Geometry::Spherical => (x - hx) * (0.5 * (y + hy)).to_radians().cos(),
            };
            dx * dx + (y - hy).powi(2) < spec.hole_radius_deg.powi(2)
        })
    };

    let mut points = Vec::with_capacity(spec.points);
    let mut attempts = 0usize;
    while points.len() < spec.points {
        attempts += 1;
        if attempts > MAX_DRAWS_PER_POINT * spec.points {
            return Err(CovError::config("Mock catalog holes cover (almost) the whole footprint."));
        }
        let (x, y) = draw(&mut rng);
        let bin = rng.gen_range(0..spec.bins);
        let weight = (1.0 + spec.weight_scatter * normal.sample(&mut rng)).max(0.0);
        if in_hole(x, y) {
            continue;
        }
        points.push(CatalogPoint { x, y, weight, bin });
    }
    Ok(PointCatalog::from_points(points))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_nz_is_normalized_and_peaks_at_the_mean() {
        let nz = mock_nz(0.6, 0.1, 2.0).unwrap();
        assert!((nz.mean_z() - 0.6).abs() < 1e-3, "{}", nz.mean_z());
        assert!(nz.eval(0.6) > nz.eval(0.9));
        assert!(mock_nz(0.0, 0.1, 2.0).is_err());
    }

    #[test]
    fn catalogs_are_reproducible_per_seed() {
        let spec = MockCatalogSpec {
            geometry: Geometry::Flat,
            x_range: (0.0, 4.0),
            y_range: (0.0, 4.0),
            points: 2000,
            bins: 3,
            holes: 2,
            hole_radius_deg: 0.5,
            weight_scatter: 0.2,
            seed: 7,
        };
        let a = mock_catalog(&spec).unwrap();
        let b = mock_catalog(&spec).unwrap();
        assert_eq!(a.points, b.points);
        assert_eq!(a.points.len(), 2000);
        for bin in 0..3 {
            assert!(a.bin(bin).count() > 500, "bin {bin}");
        }
        assert!(a.points.iter().all(|p| p.weight >= 0.0));

        let other = mock_catalog(&MockCatalogSpec { seed: 8, ..spec }).unwrap();
        assert_ne!(a.points, other.points);
    }

    #[test]
    fn spherical_points_stay_in_the_band() {
        let spec = MockCatalogSpec {
            points: 500,
            ..MockCatalogSpec::default()
        };
        let c = mock_catalog(&spec).unwrap();
        assert!(c.points.iter().all(|p| (0.0..10.0).contains(&p.x) && (-5.0..=5.0).contains(&p.y)));
    }
}
