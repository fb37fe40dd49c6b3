//! Small dense kernels shared by every structured representation: Tikhonov
//! diagonal shifts, damped Cholesky inversion, and the packed
//! lower-triangular storage format used for persistence.

use faer::Side;
use ndarray::{Array1, Array2, ArrayView2};

use crate::error::CurvatureError;
use crate::linalg::faer_ndarray::FaerCholesky;

/// Returns a copy of `m` with `c` added to every diagonal entry.
pub fn add_diagonal(m: &ArrayView2<f64>, c: f64) -> Array2<f64> {
    let mut shifted = m.to_owned();
    if c != 0.0 {
        for i in 0..shifted.nrows().min(shifted.ncols()) {
            shifted[[i, i]] += c;
        }
    }
    shifted
}

/// Inverse of a symmetric positive-definite matrix via LLT.
///
/// Fails with [`CurvatureError::Numerical`] when the factorization does not go
/// through; the caller's damping is the only regularization applied here.
pub fn cholesky_inverse(m: &ArrayView2<f64>) -> Result<Array2<f64>, CurvatureError> {
    let n = m.nrows();
    if m.ncols() != n {
        return Err(CurvatureError::shape("cholesky_inverse", n, m.ncols()));
    }
    let factor = m.cholesky(Side::Lower)?;
    let mut inv = Array2::<f64>::eye(n);
    factor.solve_mat_in_place(&mut inv);
    // The triangular solves leave tiny asymmetry; enforce symmetry explicitly.
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (inv[[i, j]] + inv[[j, i]]);
            inv[[i, j]] = avg;
            inv[[j, i]] = avg;
        }
    }
    Ok(inv)
}

/// Packs a square (symmetric) matrix into its lower triangle, row-major.
///
/// ```text
/// [[1, ., .],
///  [2, 3, .],   ->  [1, 2, 3, 4, 5, 6]
///  [4, 5, 6]]
/// ```
pub fn matrix_to_tril(m: &ArrayView2<f64>) -> Result<Array1<f64>, CurvatureError> {
    let n = m.nrows();
    if m.ncols() != n {
        return Err(CurvatureError::shape("matrix_to_tril", n, m.ncols()));
    }
    let mut packed = Array1::<f64>::zeros(n * (n + 1) / 2);
    let mut k = 0usize;
    for i in 0..n {
        for j in 0..=i {
            packed[k] = m[[i, j]];
            k += 1;
        }
    }
    Ok(packed)
}

/// Recovers the dimension `n` of the square matrix whose lower triangle has
/// `len` entries, i.e. the integer solution of `n(n+1)/2 = len`.
pub fn tril_dim(len: usize) -> Result<usize, CurvatureError> {
    let n = ((2.0 * len as f64 + 0.25).sqrt() - 0.5).floor() as usize;
    if n * (n + 1) / 2 != len {
        return Err(CurvatureError::PackedLength(len));
    }
    Ok(n)
}

/// Expands a packed lower triangle back into the full symmetric matrix.
pub fn tril_to_matrix(packed: &Array1<f64>) -> Result<Array2<f64>, CurvatureError> {
    let n = tril_dim(packed.len())?;
    let mut out = Array2::<f64>::zeros((n, n));
    let mut k = 0usize;
    for i in 0..n {
        for j in 0..=i {
            out[[i, j]] = packed[k];
            out[[j, i]] = packed[k];
            k += 1;
        }
    }
    Ok(out)
}
