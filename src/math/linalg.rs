//! Dense-matrix checks used after assembly.

use nalgebra::{DMatrix, SymmetricEigen};

/// Largest relative asymmetry `|a_ij - a_ji| / max(|a_ij|, |a_ji|)`.
///
/// Pairs whose magnitude is below `1e-300` relative to the largest entry are
/// treated as exactly symmetric.
pub fn max_relative_asymmetry(m: &DMatrix<f64>) -> f64 {
    let n = m.nrows();
    let scale = m.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 {
        return 0.0;
    }
    let floor = scale * 1e-300;
    let mut worst = 0.0_f64;
    for i in 0..n {
        for j in (i + 1)..n {
            let a = m[(i, j)];
            let b = m[(j, i)];
            let mag = a.abs().max(b.abs());
            if mag <= floor {
                continue;
            }
            worst = worst.max((a - b).abs() / mag);
        }
    }
    worst
}

/// Replace `m` by `(m + mᵀ) / 2`. The result is bitwise symmetric.
pub fn symmetrize(m: &mut DMatrix<f64>) {
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = avg;
            m[(j, i)] = avg;
        }
    }
}

/// Eigenvalues in ascending order.
pub fn sorted_eigenvalues(m: &DMatrix<f64>) -> Vec<f64> {
    let eig = SymmetricEigen::new(m.clone());
    let mut values: Vec<f64> = eig.eigenvalues.iter().copied().collect();
    values.sort_by(f64::total_cmp);
    values
}

/// Correlation matrix; rows/columns with zero variance are left at zero.
pub fn correlation(m: &DMatrix<f64>) -> DMatrix<f64> {
    let n = m.nrows();
    let sd: Vec<f64> = (0..n).map(|i| m[(i, i)].max(0.0).sqrt()).collect();
    DMatrix::from_fn(n, n, |i, j| {
        if sd[i] > 0.0 && sd[j] > 0.0 {
            m[(i, j)] / (sd[i] * sd[j])
        } else {
            0.0
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetrize_removes_asymmetry() {
        let mut m = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0 + 1e-6, 3.0]);
        assert!(max_relative_asymmetry(&m) > 1e-7);
        symmetrize(&mut m);
        assert_eq!(max_relative_asymmetry(&m), 0.0);
        assert_eq!(m[(0, 1)], m[(1, 0)]);
    }

    #[test]
    fn eigenvalues_detect_indefinite_matrix() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let values = sorted_eigenvalues(&m);
        assert!((values[0] + 1.0).abs() < 1e-12);
        assert!((values[1] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn correlation_has_unit_diagonal() {
        let m = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 9.0, 0.0, 0.0, 0.0, 0.0]);
        let c = correlation(&m);
        assert!((c[(0, 0)] - 1.0).abs() < 1e-15);
        assert!((c[(0, 1)] - 1.0 / 6.0).abs() < 1e-15);
        assert_eq!(c[(2, 2)], 0.0);
    }
}
