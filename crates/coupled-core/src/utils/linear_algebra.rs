//! Linear algebra utilities.

use ndarray::{Array1, Array2, ArrayView2};

/// Result of LU factorization with partial pivoting.
///
/// Stores the combined L/U factors in a single matrix (L below the diagonal
/// with an implicit unit diagonal, U on and above) plus the row permutation.
/// Factor once, then back-solve against any number of right-hand sides.
pub struct LuFactors {
    lu: Array2<f64>,
    /// `perm[i]` is the original row index for factored row `i`.
    perm: Vec<usize>,
    n: usize,
}

/// Factorize an `n x n` matrix via LU decomposition with partial pivoting.
///
/// Returns `None` if the matrix is singular (zero or near-zero pivot) or
/// contains non-finite entries.
pub fn lu_factor(a: &ArrayView2<'_, f64>) -> Option<LuFactors> {
    let n = a.nrows();
    debug_assert_eq!(a.ncols(), n, "LU factorization requires a square matrix");

    let mut lu = a.to_owned();
    let mut perm: Vec<usize> = (0..n).collect();

    if lu.iter().any(|v| !v.is_finite()) {
        return None;
    }

    for col in 0..n {
        // Find pivot
        let mut max_val = lu[[col, col]].abs();
        let mut max_row = col;
        for row in (col + 1)..n {
            let v = lu[[row, col]].abs();
            if v > max_val {
                max_val = v;
                max_row = row;
            }
        }

        if max_val < 1e-12 {
            return None; // Singular
        }

        if max_row != col {
            for j in 0..n {
                lu.swap([col, j], [max_row, j]);
            }
            perm.swap(col, max_row);
        }

        let pivot = lu[[col, col]];

        // Eliminate below, storing L factors in place
        for row in (col + 1)..n {
            let factor = lu[[row, col]] / pivot;
            lu[[row, col]] = factor;
            for j in (col + 1)..n {
                let val = lu[[col, j]];
                lu[[row, j]] -= factor * val;
            }
        }
    }

    Some(LuFactors { lu, perm, n })
}

/// Solve `A x = b` using a pre-computed factorization.
pub fn lu_back_solve(factors: &LuFactors, b: &[f64]) -> Array1<f64> {
    let n = factors.n;
    debug_assert_eq!(b.len(), n);

    // Apply the permutation to b
    let mut y = Array1::zeros(n);
    for i in 0..n {
        y[i] = b[factors.perm[i]];
    }

    // Forward substitution (L has a unit diagonal)
    for i in 1..n {
        for j in 0..i {
            let l_ij = factors.lu[[i, j]];
            let y_j = y[j];
            y[i] -= l_ij * y_j;
        }
    }

    // Back substitution
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        let mut sum = y[i];
        for j in (i + 1)..n {
            sum -= factors.lu[[i, j]] * x[j];
        }
        x[i] = sum / factors.lu[[i, i]];
    }

    x
}

/// Solve `A x = b` via LU factorization with partial pivoting.
///
/// Returns `None` if the matrix is singular.
pub fn lu_solve(a: &ArrayView2<'_, f64>, b: &[f64]) -> Option<Array1<f64>> {
    let factors = lu_factor(a)?;
    Some(lu_back_solve(&factors, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_lu_solve_identity() {
        let a = array![[1.0, 0.0], [0.0, 1.0]];
        let x = lu_solve(&a.view(), &[3.0, 7.0]).unwrap();
        assert!((x[0] - 3.0).abs() < 1e-12);
        assert!((x[1] - 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_lu_solve_2x2() {
        // [2 1] [x0]   [5]
        // [1 3] [x1] = [7]
        // Solution: x0 = 8/5, x1 = 9/5
        let a = array![[2.0, 1.0], [1.0, 3.0]];
        let x = lu_solve(&a.view(), &[5.0, 7.0]).unwrap();
        assert!((x[0] - 1.6).abs() < 1e-12);
        assert!((x[1] - 1.8).abs() < 1e-12);
    }

    #[test]
    fn test_lu_solve_singular() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(lu_solve(&a.view(), &[3.0, 6.0]).is_none());
    }

    #[test]
    fn test_lu_solve_needs_pivoting() {
        // First pivot is zero, requires a row swap
        let a = array![[0.0, 1.0], [1.0, 0.0]];
        let x = lu_solve(&a.view(), &[3.0, 7.0]).unwrap();
        assert!((x[0] - 7.0).abs() < 1e-12);
        assert!((x[1] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_factor_once_solve_many() {
        let a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 0.0]];
        let factors = lu_factor(&a.view()).unwrap();

        for b in [[14.0, 32.0, 23.0], [1.0, 0.0, 0.0], [0.0, 1.0, -1.0]] {
            let x = lu_back_solve(&factors, &b);
            let recomposed = a.dot(&x);
            for i in 0..3 {
                assert!(
                    (recomposed[i] - b[i]).abs() < 1e-10,
                    "row {i}: {} != {}",
                    recomposed[i],
                    b[i]
                );
            }
        }
    }

    #[test]
    fn test_non_finite_matrix_is_rejected() {
        let a = array![[f64::NAN, 0.0], [0.0, 1.0]];
        assert!(lu_factor(&a.view()).is_none());
    }
}
