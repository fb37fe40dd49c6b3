pub mod faer_ndarray;
pub mod kernels;

pub use faer_ndarray::{
    FaerArrayView, FaerCholesky, FaerCholeskyFactor, FaerEigh, FaerLinalgError,
    array1_to_col_mat_mut, array2_to_mat_mut,
};
pub use kernels::{add_diagonal, cholesky_inverse, matrix_to_tril, tril_dim, tril_to_matrix};
