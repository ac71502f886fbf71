//! Run-level warning collection.
//!
//! Worker threads push non-fatal findings here instead of logging them one by
//! one. At the end of a run the pipeline calls [`Diagnostics::report`], which
//! aggregates by kind and emits one `warn!` line per kind.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    NumericalInstability,
    DegenerateGeometry,
    DegenerateConfiguration,
    Symmetrized,
    NonPositiveEigenvalue,
    KernelExtrapolation,
}

impl WarningKind {
    pub fn display_name(self) -> &'static str {
        match self {
            WarningKind::NumericalInstability => "numerical instability",
            WarningKind::DegenerateGeometry => "degenerate geometry",
            WarningKind::DegenerateConfiguration => "degenerate configuration",
            WarningKind::Symmetrized => "symmetrized matrix",
            WarningKind::NonPositiveEigenvalue => "non-positive eigenvalue",
            WarningKind::KernelExtrapolation => "kernel extrapolation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub context: String,
    pub value: Option<f64>,
}

/// One aggregated line of the end-of-run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarningSummary {
    pub kind: WarningKind,
    pub count: usize,
    /// Largest `|value|` seen for this kind, if any warning carried a value.
    pub worst: Option<f64>,
    pub first_context: String,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    inner: Mutex<Vec<Warning>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, kind: WarningKind, context: impl Into<String>, value: Option<f64>) {
        let warning = Warning {
            kind,
            context: context.into(),
            value,
        };
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.push(warning);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).is_empty()
    }

    pub fn count(&self, kind: WarningKind) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|w| w.kind == kind)
            .count()
    }

    /// All warnings, sorted by kind then context so reports are stable across
    /// thread interleavings.
    pub fn warnings(&self) -> Vec<Warning> {
        let mut out = self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone();
        out.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.context.cmp(&b.context)));
        out
    }

    pub fn summary(&self) -> Vec<WarningSummary> {
        let mut by_kind: BTreeMap<WarningKind, WarningSummary> = BTreeMap::new();
        for w in self.warnings() {
            let entry = by_kind.entry(w.kind).or_insert_with(|| WarningSummary {
                kind: w.kind,
                count: 0,
                worst: None,
                first_context: w.context.clone(),
            });
            entry.count += 1;
            if let Some(v) = w.value {
                let v = v.abs();
                entry.worst = Some(entry.worst.map_or(v, |cur| cur.max(v)));
            }
        }
        by_kind.into_values().collect()
    }

    /// Emit the aggregated warnings through `tracing`.
    pub fn report(&self) {
        for s in self.summary() {
            match s.worst {
                Some(worst) => warn!(
                    kind = s.kind.display_name(),
                    count = s.count,
                    worst,
                    first = %s.first_context,
                    "run finished with warnings"
                ),
                None => warn!(
                    kind = s.kind.display_name(),
                    count = s.count,
                    first = %s.first_context,
                    "run finished with warnings"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_aggregates_by_kind() {
        let diag = Diagnostics::new();
        diag.push(WarningKind::Symmetrized, "block b", Some(1e-9));
        diag.push(WarningKind::Symmetrized, "block a", Some(-3e-9));
        diag.push(WarningKind::DegenerateGeometry, "bin 1", None);

        let summary = diag.summary();
        assert_eq!(summary.len(), 2);

        let sym = summary
            .iter()
            .find(|s| s.kind == WarningKind::Symmetrized)
            .unwrap();
        assert_eq!(sym.count, 2);
        assert_eq!(sym.first_context, "block a");
        assert!((sym.worst.unwrap() - 3e-9).abs() < 1e-20);

        let geo = summary
            .iter()
            .find(|s| s.kind == WarningKind::DegenerateGeometry)
            .unwrap();
        assert_eq!(geo.worst, None);
    }

    #[test]
    fn pushes_from_threads_are_all_kept() {
        let diag = Diagnostics::new();
        std::thread::scope(|s| {
            for i in 0..4 {
                let diag = &diag;
                s.spawn(move || diag.push(WarningKind::NumericalInstability, format!("unit {i}"), None));
            }
        });
        assert_eq!(diag.count(WarningKind::NumericalInstability), 4);
    }
}
