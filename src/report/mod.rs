//! Terminal output: covariance layout and run summaries.

use std::path::PathBuf;

use crate::io::{RunSummary, SegmentSummary};

/// One line per segment with its global row range.
pub fn format_layout(segments: &[SegmentSummary], dimension: usize) -> String {
    let width = segments.iter().map(|s| s.label.len()).max().unwrap_or(0).max(7);
    let mut out = String::new();
    out.push_str(&format!("{:<width$}  rows\n", "segment"));
    for s in segments {
        out.push_str(&format!(
            "{:<width$}  {:>5}..{:<5} ({} bins)\n",
            s.label,
            s.offset,
            s.offset + s.bins,
            s.bins
        ));
    }
    out.push_str(&format!("dimension: {dimension}\n"));
    out
}

/// Summary printed after a successful run.
pub fn format_run_summary(summary: &RunSummary, written: &[PathBuf]) -> String {
    let mut out = String::new();
    out.push_str(&format!("=== {} {} ===\n", summary.tool, summary.version));
    out.push_str(&format!("Created: {}\n", summary.created.format("%Y-%m-%d %H:%M:%S UTC")));
    out.push_str(&format!(
        "Covariance: {0}x{0} | terms: {1} | cores: {2}\n",
        summary.dimension,
        if summary.columns.is_empty() { "none".to_string() } else { summary.columns.join(", ") },
        summary.num_cores
    ));
    if summary.symmetrized {
        out.push_str("Symmetrized after assembly.\n");
    }
    if let Some(min) = summary.min_eigenvalue {
        out.push_str(&format!("Smallest eigenvalue: {min:.6e}\n"));
    }

    out.push('\n');
    out.push_str(&format_layout(&summary.segments, summary.dimension));

    if !summary.warnings.is_empty() {
        out.push_str("\nWarnings:\n");
        for w in &summary.warnings {
            match w.worst {
                Some(worst) => out.push_str(&format!(
                    "- {} x{} (worst {worst:.3e}): {}\n",
                    w.kind.display_name(),
                    w.count,
                    w.first_context
                )),
                None => out.push_str(&format!("- {} x{}: {}\n", w.kind.display_name(), w.count, w.first_context)),
            }
        }
    }

    if !written.is_empty() {
        out.push_str("\nWrote:\n");
        for path in written {
            out.push_str(&format!("- {}\n", path.display()));
        }
    }
    out
}
