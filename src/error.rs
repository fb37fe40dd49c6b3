use thiserror::Error;

use crate::linalg::FaerLinalgError;

/// Crate-wide error taxonomy.
///
/// Every failure is surfaced to the caller immediately: there are no retries
/// and no silent fallbacks (in particular, a Cholesky failure is never papered
/// over with a pseudo-inverse — the damping argument is the caller's only
/// lever).
#[derive(Error, Debug)]
pub enum CurvatureError {
    #[error("{context}: dimension mismatch (expected {expected}, found {found})")]
    Shape {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "packed length {0} is not a triangular number: no n satisfies n(n+1)/2 = {0}, so the \
         original matrix dimension cannot be recovered"
    )]
    PackedLength(usize),

    #[error("factorization failed on a matrix that is not numerically positive-definite: {0}")]
    Numerical(#[from] FaerLinalgError),

    #[error("operation requires state that is not present: {0}")]
    Precondition(&'static str),

    #[error("I/O failure during matrix persistence: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write .npy array: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    #[error("failed to read .npy array: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),
}

impl CurvatureError {
    pub(crate) fn shape(context: &'static str, expected: usize, found: usize) -> Self {
        CurvatureError::Shape {
            context,
            expected,
            found,
        }
    }
}
