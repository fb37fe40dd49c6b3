#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

//! Structured curvature matrices and Kronecker-factored BFGS preconditioning.
//!
//! The crate keeps approximate second-order curvature (Fisher-information /
//! Hessian surrogates) for the parameters of a layered model in one of
//! several structured forms ([`SymMatrix`]), and maintains a
//! Kronecker-factored curvature *inverse* across optimization steps with
//! BFGS-style secant updates ([`KronBfgs`]) so gradients can be
//! preconditioned without ever forming or inverting the full matrix.
//! Autodiff, estimator orchestration, distributed reduction and eigen-solvers
//! are external collaborators: they feed statistics in and consume the
//! matrix-vector-product surface.

pub mod error;
pub mod kbfgs;
pub mod linalg;
pub mod matrix;
pub mod secant;

pub use error::CurvatureError;
pub use kbfgs::{
    ApplyStats, EstimateStats, HessianActionPair, KronBfgs, KronBfgsConfig, LayerId, LayerKind,
    LayerSpec, Phase,
};
pub use linalg::{add_diagonal, cholesky_inverse, matrix_to_tril, tril_dim, tril_to_matrix};
pub use matrix::{DiagPaths, DiagRep, Kron, KronPaths, SavedPaths, SymMatrix, UnitWise};
pub use secant::{bfgs_inverse_update, powell_lm_damping};
