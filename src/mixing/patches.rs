//! Pixelization of a point catalog and patch decomposition.
//!
//! Points are binned into pixels of side `dpix`; each pixel keeps the sum of
//! weights and of squared weights per tomographic bin and sits at the
//! weighted mean position of its points. Pixels are grouped into square
//! patches of side `patch_size`; patches are the unit of parallel work.
//!
//! Positions are kept as 3-vectors so the same neighbour search serves both
//! geometries: unit vectors on the sphere, `(x, y, 0)` on the flat sky.

use std::collections::{BTreeMap, HashMap};
use std::f64::consts::{FRAC_PI_2, PI};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::CovError;
use crate::io::catalog::CatalogPoint;

const DEG_TO_RAD: f64 = PI / 180.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Geometry {
    /// `(ra, dec)` on the sphere.
    #[default]
    Spherical,
    /// `(x, y)` on a flat sky.
    Flat,
}

/// A sky position in both angular and Cartesian form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyPosition {
    /// Longitude (ra) or x, radians.
    pub lon: f64,
    /// Latitude (dec) or y, radians.
    pub lat: f64,
    pub vec: [f64; 3],
}

impl SkyPosition {
    pub fn new(geometry: Geometry, x_deg: f64, y_deg: f64) -> Self {
        let (lon, lat) = (x_deg * DEG_TO_RAD, y_deg * DEG_TO_RAD);
        let vec = match geometry {
            Geometry::Spherical => [lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin()],
            Geometry::Flat => [lon, lat, 0.0],
        };
        Self { lon, lat, vec }
    }

    fn from_vec(geometry: Geometry, vec: [f64; 3]) -> Self {
        match geometry {
            Geometry::Spherical => {
                let norm = (vec[0] * vec[0] + vec[1] * vec[1] + vec[2] * vec[2]).sqrt().max(f64::MIN_POSITIVE);
                let v = [vec[0] / norm, vec[1] / norm, vec[2] / norm];
                Self {
                    lon: v[1].atan2(v[0]),
                    lat: v[2].clamp(-1.0, 1.0).asin(),
                    vec: v,
                }
            }
            Geometry::Flat => Self {
                lon: vec[0],
                lat: vec[1],
                vec,
            },
        }
    }

    /// Angular separation and position angle of `other` seen from `self`.
    ///
    /// Only differences of position angles are ever used, so any fixed
    /// reference direction works.
    pub fn separation_and_angle(&self, geometry: Geometry, other: &SkyPosition) -> (f64, f64) {
        match geometry {
            Geometry::Flat => {
                let (dx, dy) = (other.vec[0] - self.vec[0], other.vec[1] - self.vec[1]);
                (dx.hypot(dy), dy.atan2(dx))
            }
            Geometry::Spherical => {
                let (a, b) = (self.vec, other.vec);
                let cross = [
                    a[1] * b[2] - a[2] * b[1],
                    a[2] * b[0] - a[0] * b[2],
                    a[0] * b[1] - a[1] * b[0],
                ];
                let sin = (cross[0] * cross[0] + cross[1] * cross[1] + cross[2] * cross[2]).sqrt();
                let cos = a[0] * b[0] + a[1] * b[1] + a[2] * b[2];
                let east = [-self.lon.sin(), self.lon.cos(), 0.0];
                let north = [
                    -self.lat.sin() * self.lon.cos(),
                    -self.lat.sin() * self.lon.sin(),
                    self.lat.cos(),
                ];
                let e = b[0] * east[0] + b[1] * east[1];
                let n = b[0] * north[0] + b[1] * north[1] + b[2] * north[2];
                (sin.atan2(cos), n.atan2(e))
            }
        }
    }
}

/// Cell index of a position on a grid of side `step` (radians).
fn cell_of(geometry: Geometry, pos: &SkyPosition, step: f64) -> (i64, i64) {
    match geometry {
        Geometry::Flat => ((pos.lon / step).floor() as i64, (pos.lat / step).floor() as i64),
        Geometry::Spherical => {
            let band = ((pos.lat + FRAC_PI_2) / step).floor();
            let band_center = (band + 0.5) * step - FRAC_PI_2;
            let lon = pos.lon.rem_euclid(2.0 * PI);
            let width = step / band_center.cos().abs().max(1e-6);
            ((lon / width).floor() as i64, band as i64)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pixel {
    pub position: SkyPosition,
    /// Per tomographic bin: sum of weights.
    pub weight: Vec<f64>,
    /// Per tomographic bin: sum of squared weights.
    pub weight_sq: Vec<f64>,
    pub patch: usize,
}

/// Pixelized catalog split into patches.
#[derive(Debug, Clone)]
pub struct PixelMap {
    geometry: Geometry,
    pixel_size: f64,
    pixels: Vec<Pixel>,
    /// Pixel indices per patch.
    patches: Vec<Vec<usize>>,
    /// Points per bin with their patch, for exact pair counts.
    points: Vec<Vec<(SkyPosition, f64, usize)>>,
}

impl PixelMap {
    pub fn build(
        geometry: Geometry,
        points: &[CatalogPoint],
        n_bins: usize,
        pixel_size_rad: f64,
        patch_size_rad: f64,
    ) -> Result<Self, CovError> {
        if !(pixel_size_rad > 0.0 && patch_size_rad >= pixel_size_rad) {
            return Err(CovError::config("mixing: need 0 < dpix_min <= patch_size."));
        }

        struct Accum {
            sum: [f64; 3],
            weight: Vec<f64>,
            weight_sq: Vec<f64>,
        }
        let mut cells: BTreeMap<(i64, i64), Accum> = BTreeMap::new();
        let mut per_bin: Vec<Vec<(SkyPosition, f64, usize)>> = vec![Vec::new(); n_bins];
        let mut positions = Vec::with_capacity(points.len());
        for p in points.iter().filter(|p| p.bin < n_bins && p.weight > 0.0) {
            let pos = SkyPosition::new(geometry, p.x, p.y);
            let acc = cells.entry(cell_of(geometry, &pos, pixel_size_rad)).or_insert_with(|| Accum {
                sum: [0.0; 3],
                weight: vec![0.0; n_bins],
                weight_sq: vec![0.0; n_bins],
            });
            for (s, v) in acc.sum.iter_mut().zip(pos.vec) {
                *s += p.weight * v;
            }
            acc.weight[p.bin] += p.weight;
            acc.weight_sq[p.bin] += p.weight * p.weight;
            positions.push((pos, p.weight, p.bin));
        }

        let mut patch_ids: BTreeMap<(i64, i64), usize> = BTreeMap::new();
        let mut pixels = Vec::with_capacity(cells.len());
        for acc in cells.into_values() {
            let total: f64 = acc.weight.iter().sum();
            let mean = acc.sum.map(|s| s / total);
            let position = SkyPosition::from_vec(geometry, mean);
            let next = patch_ids.len();
            let patch = *patch_ids
                .entry(cell_of(geometry, &position, patch_size_rad))
                .or_insert(next);
            pixels.push(Pixel {
                position,
                weight: acc.weight,
                weight_sq: acc.weight_sq,
                patch,
            });
        }
        let mut patches = vec![Vec::new(); patch_ids.len()];
        for (i, px) in pixels.iter().enumerate() {
            patches[px.patch].push(i);
        }
        for (pos, w, bin) in positions {
            let patch = patch_ids
                .get(&cell_of(geometry, &pos, patch_size_rad))
                .copied()
                .unwrap_or(usize::MAX);
            per_bin[bin].push((pos, w, patch));
        }

        Ok(Self {
            geometry,
            pixel_size: pixel_size_rad,
            pixels,
            patches,
            points: per_bin,
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn pixel_size(&self) -> f64 {
        self.pixel_size
    }

    pub fn pixels(&self) -> &[Pixel] {
        &self.pixels
    }

    pub fn patches(&self) -> &[Vec<usize>] {
        &self.patches
    }

    pub fn bin_points(&self, bin: usize) -> &[(SkyPosition, f64, usize)] {
        self.points.get(bin).map_or(&[], Vec::as_slice)
    }

    pub fn total_weight(&self, bin: usize) -> f64 {
        self.pixels.iter().map(|p| p.weight.get(bin).copied().unwrap_or(0.0)).sum()
    }
}

/// Uniform-cell neighbour index over 3-vectors.
#[derive(Debug, Clone)]
pub struct NeighbourIndex {
    cell: f64,
    cells: HashMap<(i64, i64, i64), Vec<usize>>,
}

impl NeighbourIndex {
    /// Index `positions`; queries may use any radius up to `max_radius`.
    pub fn new<'a>(positions: impl Iterator<Item = &'a [f64; 3]>, max_radius: f64) -> Self {
        let cell = max_radius.max(f64::MIN_POSITIVE);
        let mut cells: HashMap<(i64, i64, i64), Vec<usize>> = HashMap::new();
        for (i, v) in positions.enumerate() {
            cells.entry(Self::key(cell, v)).or_default().push(i);
        }
        Self { cell, cells }
    }

    fn key(cell: f64, v: &[f64; 3]) -> (i64, i64, i64) {
        (
            (v[0] / cell).floor() as i64,
            (v[1] / cell).floor() as i64,
            (v[2] / cell).floor() as i64,
        )
    }

    /// Candidate indices near `v`, in a fixed order.
    pub fn candidates<'a>(&'a self, v: &[f64; 3]) -> impl Iterator<Item = usize> + 'a {
        let (x, y, z) = Self::key(self.cell, v);
        (-1..=1).flat_map(move |dx| {
            (-1..=1).flat_map(move |dy| {
                (-1..=1).flat_map(move |dz| {
                    self.cells
                        .get(&(x + dx, y + dy, z + dz))
                        .into_iter()
                        .flat_map(|ids| ids.iter().copied())
                })
            })
        })
    }
}
