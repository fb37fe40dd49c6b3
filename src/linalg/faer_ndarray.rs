//! Zero-copy seam between `ndarray` storage and faer's factorization kernels.
//!
//! All public arrays in this crate are `ndarray` types; faer is reached only
//! through the views and traits below. Views are taken by raw parts with the
//! exact strides ndarray reports; layouts faer cannot traverse safely
//! (non-positive strides) are materialized into a compact owned copy first.

use faer::diag::DiagRef;
use faer::linalg::solvers::{self, Solve};
use faer::{MatMut, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
}

#[inline]
pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let (s0, s1) = (strides[0], strides[1]);
    // SAFETY: pointer, shape and strides come straight from the live ndarray.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

#[inline]
pub fn array1_to_col_mat_mut(array: &mut Array1<f64>) -> MatMut<'_, f64> {
    let len = array.len();
    let stride = array.strides()[0];
    // SAFETY: a 1-D ndarray is a valid single-column matrix view; the column
    // stride is irrelevant for one column.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), len, 1, stride, 0) }
}

pub(crate) fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

pub(crate) fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let col = diag.column_vector().as_mat();
    let mut out = Array1::<f64>::zeros(col.nrows());
    for i in 0..col.nrows() {
        out[i] = col[(i, 0)];
    }
    out
}

/// Borrowed (or, for hostile strides, owned-copy) faer view over an ndarray.
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        // Negative or zero strides can alias or reverse memory traversal,
        // which faer kernels do not account for.
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }
        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (owned.as_ptr(), strides[0], strides[1])
        } else {
            (self.ptr, self.row_stride, self.col_stride)
        };
        // SAFETY: either a live borrow of the source ndarray with positive
        // strides, or the compact copy owned by this wrapper.
        unsafe { MatRef::from_raw_parts(ptr, self.rows, self.cols, row_stride, col_stride) }
    }
}

/// LLT factor of a symmetric positive-definite matrix.
pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_vec_in_place(&self, rhs: &mut Array1<f64>) {
        let mut view = array1_to_col_mat_mut(rhs);
        self.factor.solve_in_place(view.as_mut());
    }

    pub fn solve_mat_in_place(&self, rhs: &mut Array2<f64>) {
        let mut view = array2_to_mat_mut(rhs);
        self.factor.solve_in_place(view.as_mut());
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let view = FaerArrayView::new(self);
        let factor = view.as_ref().llt(side).map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

pub trait FaerEigh {
    /// Eigenvalues and eigenvectors of a symmetric matrix (ascending order,
    /// faer's convention).
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;

    /// Eigenvalues only.
    fn eigvalsh(&self, side: Side) -> Result<Array1<f64>, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        let view = FaerArrayView::new(self);
        let eigen = view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        let vectors = mat_to_array(eigen.U());
        Ok((values, vectors))
    }

    fn eigvalsh(&self, side: Side) -> Result<Array1<f64>, FaerLinalgError> {
        let view = FaerArrayView::new(self);
        let eigen = view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        Ok(diag_to_array(eigen.S()))
    }
}
