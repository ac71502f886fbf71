//! Memoization of tabulated physics quantities.
//!
//! Each `(quantity, model, redshift)` key is filled at most once per run. The
//! map lock is held only long enough to fetch or insert the key's slot;
//! concurrent callers of the same key then block on that slot's `OnceLock`
//! while one of them computes, so an expensive table is never built twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::error::CovError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Quantity {
    LinearPower,
    NonlinearPower,
    MassFunction,
    HaloBias,
    ConcentrationCentral,
    ConcentrationSatellite,
    GalaxyDensity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub quantity: Quantity,
    pub model: &'static str,
    z_bits: u64,
}

impl CacheKey {
    pub fn new(quantity: Quantity, model: &'static str, z: f64) -> Self {
        // +0.0 and -0.0 must share a slot.
        let z = if z == 0.0 { 0.0 } else { z };
        Self {
            quantity,
            model,
            z_bits: z.to_bits(),
        }
    }

    pub fn z(&self) -> f64 {
        f64::from_bits(self.z_bits)
    }
}

type Slot = Arc<OnceLock<Result<Arc<[f64]>, CovError>>>;

#[derive(Debug, Default)]
pub struct PhysicsCache {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    fills: AtomicUsize,
}

impl PhysicsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached table for `key`, computing it with `fill` if this is
    /// the first request. Failures are cached too.
    pub fn get_or_compute<F>(&self, key: CacheKey, fill: F) -> Result<Arc<[f64]>, CovError>
    where
        F: FnOnce() -> Result<Vec<f64>, CovError>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(slots.entry(key).or_default())
        };
        slot.get_or_init(|| {
            self.fills.fetch_add(1, Ordering::Relaxed);
            debug!(quantity = ?key.quantity, model = key.model, z = key.z(), "filling physics table");
            fill().map(Arc::from)
        })
        .clone()
    }

    /// Number of tables actually computed so far.
    pub fn fills(&self) -> usize {
        self.fills.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
