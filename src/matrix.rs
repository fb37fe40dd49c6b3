//! Structured symmetric curvature matrices.
//!
//! A [`SymMatrix`] covers one layer's parameters (or the whole model's,
//! flattened) and may hold any subset of four sub-representations at once:
//! a dense matrix, a Kronecker two-factor form `A ⊗ B`, per-element diagonal
//! entries, and a stack of small per-output-unit blocks. Operations apply to
//! whichever representations are populated; an absent representation is a
//! no-op, except for the matrix-vector action and the spectral queries, which
//! need at least one.
//!
//! Cached inverses are invalidated by value-producing combination but
//! deliberately survive [`SymMatrix::accumulate`]: the K-BFGS maintainer
//! blends curvature estimates in place precisely so that the inverse it keeps
//! secant-updating stays attached to the live matrix.

use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, Array3, Axis, s};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use serde::{Deserialize, Serialize};
use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};

use faer::Side;

use crate::error::CurvatureError;
use crate::linalg::{FaerEigh, add_diagonal, cholesky_inverse, matrix_to_tril, tril_to_matrix};

/// Floor on the per-factor damping of a Kronecker pair, preventing a
/// degenerate zero shift when the caller passes damping = 0.
const KRON_DAMPING_FLOOR: f64 = 1e-7;

fn sort_descending(values: Array1<f64>) -> Array1<f64> {
    let mut v = values.to_vec();
    v.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    Array1::from_vec(v)
}

fn symmetric_eigenvalues(m: &Array2<f64>) -> Result<Array1<f64>, CurvatureError> {
    Ok(m.eigvalsh(Side::Lower)?)
}

fn unflatten_into<'a, D, I>(dst: I, v: &Array1<f64>, offset: usize) -> Result<usize, CurvatureError>
where
    D: ndarray::Dimension,
    I: Into<ndarray::ArrayViewMut<'a, f64, D>>,
{
    let mut dst = dst.into();
    let len = dst.len();
    if offset + len > v.len() {
        return Err(CurvatureError::shape(
            "from_vector: source vector too short",
            offset + len,
            v.len(),
        ));
    }
    for (d, src) in dst.iter_mut().zip(v.slice(s![offset..offset + len]).iter()) {
        *d = *src;
    }
    Ok(offset + len)
}

// ---------------------------------------------------------------------------
// Kronecker-factored representation
// ---------------------------------------------------------------------------

/// Two-factor Kronecker approximation `A ⊗ B` with cached factor inverses.
///
/// `A` is sized by the input-feature dimension (plus one when the bias is
/// folded in) and `B` by the output-feature dimension. Factor dimensions are
/// fixed at construction; additions must match them.
#[derive(Debug, Clone)]
pub struct Kron {
    A: Array2<f64>,
    B: Array2<f64>,
    A_inv: Option<Array2<f64>>,
    B_inv: Option<Array2<f64>>,
}

impl Kron {
    pub fn new(A: Array2<f64>, B: Array2<f64>) -> Result<Self, CurvatureError> {
        if A.nrows() != A.ncols() {
            return Err(CurvatureError::shape("Kron A square", A.nrows(), A.ncols()));
        }
        if B.nrows() != B.ncols() {
            return Err(CurvatureError::shape("Kron B square", B.nrows(), B.ncols()));
        }
        Ok(Self {
            A,
            B,
            A_inv: None,
            B_inv: None,
        })
    }

    pub fn A(&self) -> &Array2<f64> {
        &self.A
    }

    pub fn B(&self) -> &Array2<f64> {
        &self.B
    }

    pub fn A_dim(&self) -> usize {
        self.A.nrows()
    }

    pub fn B_dim(&self) -> usize {
        self.B.nrows()
    }

    pub fn A_inv(&self) -> Option<&Array2<f64>> {
        self.A_inv.as_ref()
    }

    pub fn B_inv(&self) -> Option<&Array2<f64>> {
        self.B_inv.as_ref()
    }

    /// Mutable handle on the cached input-side inverse, for secant updates.
    pub fn A_inv_mut(&mut self) -> Option<&mut Array2<f64>> {
        self.A_inv.as_mut()
    }

    /// Mutable handle on the cached output-side inverse, for secant updates.
    pub fn B_inv_mut(&mut self) -> Option<&mut Array2<f64>> {
        self.B_inv.as_mut()
    }

    pub fn set_A_inv(&mut self, inv: Array2<f64>) {
        self.A_inv = Some(inv);
    }

    pub fn set_B_inv(&mut self, inv: Array2<f64>) {
        self.B_inv = Some(inv);
    }

    fn check_matching(&self, other: &Kron) -> Result<(), CurvatureError> {
        if self.A_dim() != other.A_dim() {
            return Err(CurvatureError::shape(
                "Kron combine: A dimension",
                self.A_dim(),
                other.A_dim(),
            ));
        }
        if self.B_dim() != other.B_dim() {
            return Err(CurvatureError::shape(
                "Kron combine: B dimension",
                self.B_dim(),
                other.B_dim(),
            ));
        }
        Ok(())
    }

    fn combined(&self, other: &Kron) -> Result<Kron, CurvatureError> {
        self.check_matching(other)?;
        Kron::new(&self.A + &other.A, &self.B + &other.B)
    }

    fn accumulate(&mut self, other: &Kron) -> Result<(), CurvatureError> {
        self.check_matching(other)?;
        self.A += &other.A;
        self.B += &other.B;
        Ok(())
    }

    fn scale(&mut self, c: f64) {
        self.A *= c;
        self.B *= c;
    }

    fn trace(&self) -> f64 {
        self.A.diag().sum() * self.B.diag().sum()
    }

    /// Eigenvalues of `A ⊗ B` as the outer product of the factor spectra,
    /// never materializing the Kronecker product itself.
    fn eigenvalues(&self) -> Result<Array1<f64>, CurvatureError> {
        let eig_a = symmetric_eigenvalues(&self.A)?;
        let eig_b = symmetric_eigenvalues(&self.B)?;
        let mut outer = Array1::<f64>::zeros(eig_a.len() * eig_b.len());
        let mut k = 0usize;
        for &a in eig_a.iter() {
            for &b in eig_b.iter() {
                outer[k] = a * b;
                k += 1;
            }
        }
        Ok(sort_descending(outer))
    }

    fn top_eigenvalue(&self) -> Result<f64, CurvatureError> {
        let eig_a = symmetric_eigenvalues(&self.A)?;
        let eig_b = symmetric_eigenvalues(&self.B)?;
        let max_a = eig_a.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let max_b = eig_b.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Ok(max_a * max_b)
    }

    /// Refreshes both factor inverses with an asymmetric damping split.
    ///
    /// `pi = sqrt((tr A / dim A) / (tr B / dim B))` equalizes the factors'
    /// effective scales, so one scalar damping behaves consistently however
    /// the curvature mass is split between the input and output side. The
    /// formula is an empirical constant of the method; tests pin it.
    pub fn update_inverse(&mut self, damping: f64) -> Result<(), CurvatureError> {
        let a_eig_mean = self.A.diag().sum() / self.A_dim() as f64;
        let b_eig_mean = self.B.diag().sum() / self.B_dim() as f64;
        let pi = (a_eig_mean / b_eig_mean).sqrt();
        let r = damping.sqrt();
        let damp_a = (r * pi).max(KRON_DAMPING_FLOOR);
        let damp_b = (r / pi).max(KRON_DAMPING_FLOOR);
        log::debug!(
            "kron inverse refresh: pi = {pi:.3e}, A shift = {damp_a:.3e}, B shift = {damp_b:.3e}"
        );
        self.A_inv = Some(cholesky_inverse(
            &add_diagonal(&self.A.view(), damp_a).view(),
        )?);
        self.B_inv = Some(cholesky_inverse(
            &add_diagonal(&self.B.view(), damp_b).view(),
        )?);
        Ok(())
    }

    /// Applies `A ⊗ B` (or its cached inverse) to a weight matrix with the
    /// bias folded in as a trailing column, via the identity
    /// `(A ⊗ B) vec(V) = vec(B V Aᵀ)`.
    pub fn mvp(
        &self,
        weight: &Array2<f64>,
        bias: Option<&Array1<f64>>,
        use_inv: bool,
    ) -> Result<(Array2<f64>, Option<Array1<f64>>), CurvatureError> {
        let (mat_a, mat_b) = if use_inv {
            let a = self.A_inv.as_ref().ok_or(CurvatureError::Precondition(
                "kron input-side inverse has not been computed",
            ))?;
            let b = self.B_inv.as_ref().ok_or(CurvatureError::Precondition(
                "kron output-side inverse has not been computed",
            ))?;
            (a, b)
        } else {
            (&self.A, &self.B)
        };

        let out_dim = self.B_dim();
        if weight.nrows() != out_dim {
            return Err(CurvatureError::shape(
                "kron mvp: weight rows",
                out_dim,
                weight.nrows(),
            ));
        }
        let expected_a = weight.ncols() + usize::from(bias.is_some());
        if self.A_dim() != expected_a {
            return Err(CurvatureError::shape(
                "kron mvp: weight columns (+bias)",
                self.A_dim(),
                expected_a,
            ));
        }

        let result = match bias {
            Some(b) => {
                if b.len() != out_dim {
                    return Err(CurvatureError::shape(
                        "kron mvp: bias length",
                        out_dim,
                        b.len(),
                    ));
                }
                let mut v = Array2::<f64>::zeros((out_dim, expected_a));
                v.slice_mut(s![.., ..expected_a - 1]).assign(weight);
                v.slice_mut(s![.., expected_a - 1]).assign(b);
                let r = mat_b.dot(&v).dot(mat_a);
                let w_out = r.slice(s![.., ..expected_a - 1]).to_owned();
                let b_out = r.slice(s![.., expected_a - 1]).to_owned();
                (w_out, Some(b_out))
            }
            None => (mat_b.dot(weight).dot(mat_a), None),
        };
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Diagonal representation
// ---------------------------------------------------------------------------

/// Per-element diagonal entries, split between the weight and bias tensors,
/// with cached reciprocal vectors.
#[derive(Debug, Clone, Default)]
pub struct DiagRep {
    weight: Option<Array2<f64>>,
    bias: Option<Array1<f64>>,
    weight_inv: Option<Array2<f64>>,
    bias_inv: Option<Array1<f64>>,
}

impl DiagRep {
    pub fn new(weight: Option<Array2<f64>>, bias: Option<Array1<f64>>) -> Self {
        Self {
            weight,
            bias,
            weight_inv: None,
            bias_inv: None,
        }
    }

    pub fn weight(&self) -> Option<&Array2<f64>> {
        self.weight.as_ref()
    }

    pub fn bias(&self) -> Option<&Array1<f64>> {
        self.bias.as_ref()
    }

    fn combined(&self, other: &DiagRep) -> DiagRep {
        let weight = match (&self.weight, &other.weight) {
            (Some(a), Some(b)) => Some(a + b),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        let bias = match (&self.bias, &other.bias) {
            (Some(a), Some(b)) => Some(a + b),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        DiagRep::new(weight, bias)
    }

    fn accumulate(&mut self, other: &DiagRep) {
        match (&mut self.weight, &other.weight) {
            (Some(a), Some(b)) => *a += b,
            (slot @ None, Some(b)) => *slot = Some(b.clone()),
            _ => {}
        }
        match (&mut self.bias, &other.bias) {
            (Some(a), Some(b)) => *a += b,
            (slot @ None, Some(b)) => *slot = Some(b.clone()),
            _ => {}
        }
    }

    fn scale(&mut self, c: f64) {
        if let Some(w) = &mut self.weight {
            *w *= c;
        }
        if let Some(b) = &mut self.bias {
            *b *= c;
        }
    }

    fn trace(&self) -> f64 {
        self.weight.as_ref().map_or(0.0, |w| w.sum())
            + self.bias.as_ref().map_or(0.0, |b| b.sum())
    }

    fn eigenvalues(&self) -> Array1<f64> {
        let mut all = Vec::new();
        if let Some(w) = &self.weight {
            all.extend(w.iter().copied());
        }
        if let Some(b) = &self.bias {
            all.extend(b.iter().copied());
        }
        sort_descending(Array1::from_vec(all))
    }

    fn top_eigenvalue(&self) -> f64 {
        let mut top = f64::NEG_INFINITY;
        if let Some(w) = &self.weight {
            top = w.iter().copied().fold(top, f64::max);
        }
        if let Some(b) = &self.bias {
            top = b.iter().copied().fold(top, f64::max);
        }
        top
    }

    fn update_inverse(&mut self, damping: f64) {
        self.weight_inv = self.weight.as_ref().map(|w| w.mapv(|x| 1.0 / (x + damping)));
        self.bias_inv = self.bias.as_ref().map(|b| b.mapv(|x| 1.0 / (x + damping)));
    }

    fn mvp(
        &self,
        weight: &Array2<f64>,
        bias: Option<&Array1<f64>>,
        use_inv: bool,
    ) -> Result<(Array2<f64>, Option<Array1<f64>>), CurvatureError> {
        let w_entries = if use_inv {
            self.weight_inv.as_ref().ok_or(CurvatureError::Precondition(
                "diagonal weight reciprocals have not been computed",
            ))?
        } else {
            self.weight.as_ref().ok_or(CurvatureError::Precondition(
                "diagonal weight entries are absent",
            ))?
        };
        if w_entries.dim() != weight.dim() {
            return Err(CurvatureError::shape(
                "diag mvp: weight size",
                w_entries.len(),
                weight.len(),
            ));
        }
        let w_out = weight * w_entries;
        let b_out = match bias {
            Some(b) => {
                let b_entries = if use_inv {
                    self.bias_inv.as_ref().ok_or(CurvatureError::Precondition(
                        "diagonal bias reciprocals have not been computed",
                    ))?
                } else {
                    self.bias.as_ref().ok_or(CurvatureError::Precondition(
                        "diagonal bias entries are absent",
                    ))?
                };
                if b_entries.len() != b.len() {
                    return Err(CurvatureError::shape(
                        "diag mvp: bias length",
                        b_entries.len(),
                        b.len(),
                    ));
                }
                Some(b * b_entries)
            }
            None => None,
        };
        Ok((w_out, b_out))
    }
}

// ---------------------------------------------------------------------------
// Per-unit block-diagonal representation
// ---------------------------------------------------------------------------

/// Block-diagonal form with one small dense block per output unit: 2x2 for
/// scale/shift pairs, `(fan_in + 1) x (fan_in + 1)` per output channel
/// otherwise. Blocks are stacked along the first axis.
#[derive(Debug, Clone)]
pub struct UnitWise {
    blocks: Array3<f64>,
    inv: Option<Array3<f64>>,
}

impl UnitWise {
    pub fn new(blocks: Array3<f64>) -> Result<Self, CurvatureError> {
        let (_, rows, cols) = blocks.dim();
        if rows != cols {
            return Err(CurvatureError::shape("UnitWise blocks square", rows, cols));
        }
        Ok(Self { blocks, inv: None })
    }

    pub fn blocks(&self) -> &Array3<f64> {
        &self.blocks
    }

    fn check_matching(&self, other: &UnitWise) -> Result<(), CurvatureError> {
        if self.blocks.dim() != other.blocks.dim() {
            return Err(CurvatureError::shape(
                "UnitWise combine: block count",
                self.blocks.dim().0,
                other.blocks.dim().0,
            ));
        }
        Ok(())
    }

    fn combined(&self, other: &UnitWise) -> Result<UnitWise, CurvatureError> {
        self.check_matching(other)?;
        UnitWise::new(&self.blocks + &other.blocks)
    }

    fn accumulate(&mut self, other: &UnitWise) -> Result<(), CurvatureError> {
        self.check_matching(other)?;
        self.blocks += &other.blocks;
        Ok(())
    }

    fn scale(&mut self, c: f64) {
        self.blocks *= c;
    }

    fn trace(&self) -> f64 {
        self.blocks
            .axis_iter(Axis(0))
            .map(|block| block.diag().sum())
            .sum()
    }

    fn eigenvalues(&self) -> Result<Array1<f64>, CurvatureError> {
        let mut all = Vec::with_capacity(self.blocks.dim().0 * self.blocks.dim().1);
        for block in self.blocks.axis_iter(Axis(0)) {
            let eig = block.eigvalsh(Side::Lower)?;
            all.extend(eig.iter().copied());
        }
        Ok(sort_descending(Array1::from_vec(all)))
    }

    fn top_eigenvalue(&self) -> Result<f64, CurvatureError> {
        let eigs = self.eigenvalues()?;
        Ok(eigs.iter().copied().fold(f64::NEG_INFINITY, f64::max))
    }

    /// Batched damped inversion of every block; parallel over the unit axis.
    fn update_inverse(&mut self, damping: f64) -> Result<(), CurvatureError> {
        let inv_blocks: Result<Vec<Array2<f64>>, CurvatureError> = self
            .blocks
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|block| cholesky_inverse(&add_diagonal(&block, damping).view()))
            .collect();
        let inv_blocks = inv_blocks?;
        let mut inv = Array3::<f64>::zeros(self.blocks.dim());
        for (mut slot, block) in inv.axis_iter_mut(Axis(0)).zip(inv_blocks) {
            slot.assign(&block);
        }
        self.inv = Some(inv);
        Ok(())
    }

    /// Per-unit action `block_u · [w_u | b_u]`, batched over units. The block
    /// layout always carries the bias entry, so a bias vector is required.
    fn mvp(
        &self,
        weight: &Array2<f64>,
        bias: Option<&Array1<f64>>,
        use_inv: bool,
    ) -> Result<(Array2<f64>, Option<Array1<f64>>), CurvatureError> {
        let bias = bias.ok_or(CurvatureError::Precondition(
            "unit-wise action requires a bias vector",
        ))?;
        let mat = if use_inv {
            self.inv.as_ref().ok_or(CurvatureError::Precondition(
                "unit-wise block inverses have not been computed",
            ))?
        } else {
            &self.blocks
        };
        let (units, k, _) = mat.dim();
        if weight.nrows() != units {
            return Err(CurvatureError::shape(
                "unit mvp: weight rows",
                units,
                weight.nrows(),
            ));
        }
        if weight.ncols() + 1 != k {
            return Err(CurvatureError::shape(
                "unit mvp: weight columns",
                k - 1,
                weight.ncols(),
            ));
        }
        if bias.len() != units {
            return Err(CurvatureError::shape(
                "unit mvp: bias length",
                units,
                bias.len(),
            ));
        }

        let mut w_out = Array2::<f64>::zeros(weight.dim());
        let mut b_out = Array1::<f64>::zeros(units);
        for u in 0..units {
            let block = mat.index_axis(Axis(0), u);
            for r in 0..k {
                let mut acc = 0.0;
                for c in 0..k - 1 {
                    acc += block[[r, c]] * weight[[u, c]];
                }
                acc += block[[r, k - 1]] * bias[u];
                if r < k - 1 {
                    w_out[[u, r]] = acc;
                } else {
                    b_out[u] = acc;
                }
            }
        }
        Ok((w_out, Some(b_out)))
    }
}

// ---------------------------------------------------------------------------
// SymMatrix
// ---------------------------------------------------------------------------

/// A symmetric curvature matrix in zero or more structured representations.
#[derive(Debug, Clone, Default)]
pub struct SymMatrix {
    full: Option<Array2<f64>>,
    inv: Option<Array2<f64>>,
    kron: Option<Kron>,
    diag: Option<DiagRep>,
    unit: Option<UnitWise>,
}

impl SymMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_full(full: Array2<f64>) -> Result<Self, CurvatureError> {
        if full.nrows() != full.ncols() {
            return Err(CurvatureError::shape(
                "SymMatrix full square",
                full.nrows(),
                full.ncols(),
            ));
        }
        Ok(Self {
            full: Some(full),
            ..Self::default()
        })
    }

    pub fn from_kron(kron: Kron) -> Self {
        Self {
            kron: Some(kron),
            ..Self::default()
        }
    }

    pub fn from_diag(diag: DiagRep) -> Self {
        Self {
            diag: Some(diag),
            ..Self::default()
        }
    }

    pub fn from_unit(unit: UnitWise) -> Self {
        Self {
            unit: Some(unit),
            ..Self::default()
        }
    }

    pub fn full(&self) -> Option<&Array2<f64>> {
        self.full.as_ref()
    }

    pub fn inv(&self) -> Option<&Array2<f64>> {
        self.inv.as_ref()
    }

    pub fn kron(&self) -> Option<&Kron> {
        self.kron.as_ref()
    }

    pub fn kron_mut(&mut self) -> Option<&mut Kron> {
        self.kron.as_mut()
    }

    pub fn diag(&self) -> Option<&DiagRep> {
        self.diag.as_ref()
    }

    pub fn unit(&self) -> Option<&UnitWise> {
        self.unit.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.full.is_none() && self.kron.is_none() && self.diag.is_none() && self.unit.is_none()
    }

    /// In-place scalar multiply of every populated representation. Cached
    /// inverses are left untouched (they are stale after any data change and
    /// must be refreshed by the caller).
    pub fn scale(&mut self, c: f64) {
        if let Some(full) = &mut self.full {
            *full *= c;
        }
        if let Some(kron) = &mut self.kron {
            kron.scale(c);
        }
        if let Some(diag) = &mut self.diag {
            diag.scale(c);
        }
        if let Some(unit) = &mut self.unit {
            unit.scale(c);
        }
    }

    /// Representation-wise sum returning a new matrix. A representation
    /// missing on one side is taken from the other as-is. No cached inverse
    /// survives: the result is fresh data.
    pub fn combine(&self, other: &SymMatrix) -> Result<SymMatrix, CurvatureError> {
        let full = match (&self.full, &other.full) {
            (Some(a), Some(b)) => {
                if a.dim() != b.dim() {
                    return Err(CurvatureError::shape(
                        "combine: full dimension",
                        a.nrows(),
                        b.nrows(),
                    ));
                }
                Some(a + b)
            }
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        let kron = match (&self.kron, &other.kron) {
            (Some(a), Some(b)) => Some(a.combined(b)?),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        let diag = match (&self.diag, &other.diag) {
            (Some(a), Some(b)) => Some(a.combined(b)),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        let unit = match (&self.unit, &other.unit) {
            (Some(a), Some(b)) => Some(a.combined(b)?),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        Ok(SymMatrix {
            full,
            inv: None,
            kron,
            diag,
            unit,
        })
    }

    /// Representation-wise sum mutating the receiver in place.
    ///
    /// Unlike [`combine`](Self::combine) this preserves the receiver's
    /// identity: cached inverses stay attached (now stale) so a maintainer
    /// holding a handle on them can refresh or secant-update them afterwards.
    pub fn accumulate(&mut self, other: &SymMatrix) -> Result<(), CurvatureError> {
        match (&mut self.full, &other.full) {
            (Some(a), Some(b)) => {
                if a.dim() != b.dim() {
                    return Err(CurvatureError::shape(
                        "accumulate: full dimension",
                        a.nrows(),
                        b.nrows(),
                    ));
                }
                *a += b;
            }
            (slot @ None, Some(b)) => *slot = Some(b.clone()),
            _ => {}
        }
        match (&mut self.kron, &other.kron) {
            (Some(a), Some(b)) => a.accumulate(b)?,
            (slot @ None, Some(b)) => *slot = Some(b.clone()),
            _ => {}
        }
        match (&mut self.diag, &other.diag) {
            (Some(a), Some(b)) => a.accumulate(b),
            (slot @ None, Some(b)) => *slot = Some(b.clone()),
            _ => {}
        }
        match (&mut self.unit, &other.unit) {
            (Some(a), Some(b)) => a.accumulate(b)?,
            (slot @ None, Some(b)) => *slot = Some(b.clone()),
            _ => {}
        }
        Ok(())
    }

    pub fn trace(&self) -> Result<f64, CurvatureError> {
        if let Some(full) = &self.full {
            return Ok(full.diag().sum());
        }
        if let Some(kron) = &self.kron {
            return Ok(kron.trace());
        }
        if let Some(diag) = &self.diag {
            return Ok(diag.trace());
        }
        if let Some(unit) = &self.unit {
            return Ok(unit.trace());
        }
        Err(CurvatureError::Precondition(
            "trace requires at least one populated representation",
        ))
    }

    /// All eigenvalues, sorted descending, from the first populated
    /// representation in the order full, kron, diag, unit.
    pub fn eigenvalues(&self) -> Result<Array1<f64>, CurvatureError> {
        if let Some(full) = &self.full {
            return Ok(sort_descending(symmetric_eigenvalues(full)?));
        }
        if let Some(kron) = &self.kron {
            return kron.eigenvalues();
        }
        if let Some(diag) = &self.diag {
            return Ok(diag.eigenvalues());
        }
        if let Some(unit) = &self.unit {
            return unit.eigenvalues();
        }
        Err(CurvatureError::Precondition(
            "eigenvalues require at least one populated representation",
        ))
    }

    pub fn top_eigenvalue(&self) -> Result<f64, CurvatureError> {
        if let Some(full) = &self.full {
            let eig = symmetric_eigenvalues(full)?;
            return Ok(eig.iter().copied().fold(f64::NEG_INFINITY, f64::max));
        }
        if let Some(kron) = &self.kron {
            return kron.top_eigenvalue();
        }
        if let Some(diag) = &self.diag {
            return Ok(diag.top_eigenvalue());
        }
        if let Some(unit) = &self.unit {
            return unit.top_eigenvalue();
        }
        Err(CurvatureError::Precondition(
            "top eigenvalue requires at least one populated representation",
        ))
    }

    /// Recomputes every populated representation's cached inverse with
    /// Tikhonov damping added before inversion.
    pub fn update_inverse(&mut self, damping: f64) -> Result<(), CurvatureError> {
        if let Some(full) = &self.full {
            self.inv = Some(cholesky_inverse(
                &add_diagonal(&full.view(), damping).view(),
            )?);
        }
        if let Some(kron) = &mut self.kron {
            kron.update_inverse(damping)?;
        }
        if let Some(diag) = &mut self.diag {
            diag.update_inverse(damping);
        }
        if let Some(unit) = &mut self.unit {
            unit.update_inverse(damping)?;
        }
        Ok(())
    }

    /// Dense action on a flat parameter vector, using the `full`
    /// representation (or its cached inverse).
    pub fn mvp_flat(&self, v: &Array1<f64>, use_inv: bool) -> Result<Array1<f64>, CurvatureError> {
        let mat = if use_inv {
            self.inv.as_ref().ok_or(CurvatureError::Precondition(
                "dense inverse has not been computed",
            ))?
        } else {
            self.full.as_ref().ok_or(CurvatureError::Precondition(
                "no dense representation is populated",
            ))?
        };
        if v.len() != mat.ncols() {
            return Err(CurvatureError::shape("mvp_flat", mat.ncols(), v.len()));
        }
        Ok(mat.dot(v))
    }

    /// Matrix-(or inverse-)vector action on a parameter-shaped input,
    /// dispatched to the first populated representation in the order
    /// full, kron, diag, unit.
    pub fn mvp(
        &self,
        weight: &Array2<f64>,
        bias: Option<&Array1<f64>>,
        use_inv: bool,
    ) -> Result<(Array2<f64>, Option<Array1<f64>>), CurvatureError> {
        if self.full.is_some() {
            let w_len = weight.len();
            let mut flat = Vec::with_capacity(w_len + bias.map_or(0, |b| b.len()));
            flat.extend(weight.iter().copied());
            if let Some(b) = bias {
                flat.extend(b.iter().copied());
            }
            let out = self.mvp_flat(&Array1::from_vec(flat), use_inv)?;
            let w_shape = weight.raw_dim();
            let w_out = Array2::from_shape_vec(w_shape, out.slice(s![..w_len]).to_vec())
                .map_err(|_| CurvatureError::shape("mvp: weight reshape", w_len, out.len()))?;
            let b_out = bias.map(|_| out.slice(s![w_len..]).to_owned());
            return Ok((w_out, b_out));
        }
        if let Some(kron) = &self.kron {
            return kron.mvp(weight, bias, use_inv);
        }
        if let Some(diag) = &self.diag {
            return diag.mvp(weight, bias, use_inv);
        }
        if let Some(unit) = &self.unit {
            return unit.mvp(weight, bias, use_inv);
        }
        Err(CurvatureError::Precondition(
            "matrix-vector product requires at least one populated representation",
        ))
    }

    /// In-place variant of [`mvp`](Self::mvp): the caller-supplied gradient
    /// tensors are overwritten with the preconditioned result.
    pub fn mvp_in_place(
        &self,
        weight: &mut Array2<f64>,
        bias: Option<&mut Array1<f64>>,
        use_inv: bool,
    ) -> Result<(), CurvatureError> {
        let (w_out, b_out) = self.mvp(weight, bias.as_deref(), use_inv)?;
        weight.assign(&w_out);
        if let (Some(b), Some(b_out)) = (bias, b_out) {
            b.assign(&b_out);
        }
        Ok(())
    }

    /// Serializes every populated representation's raw storage into one flat
    /// vector, in the fixed order full, kron (A then B), diag (weight then
    /// bias), unit.
    pub fn to_vector(&self) -> Array1<f64> {
        let mut out = Vec::new();
        if let Some(full) = &self.full {
            out.extend(full.iter().copied());
        }
        if let Some(kron) = &self.kron {
            out.extend(kron.A.iter().copied());
            out.extend(kron.B.iter().copied());
        }
        if let Some(diag) = &self.diag {
            if let Some(w) = &diag.weight {
                out.extend(w.iter().copied());
            }
            if let Some(b) = &diag.bias {
                out.extend(b.iter().copied());
            }
        }
        if let Some(unit) = &self.unit {
            out.extend(unit.blocks.iter().copied());
        }
        Array1::from_vec(out)
    }

    /// Deserializes from the flat layout written by
    /// [`to_vector`](Self::to_vector), starting at `offset`; returns the
    /// advanced offset so several matrices can share one global vector.
    pub fn from_vector(
        &mut self,
        v: &Array1<f64>,
        mut offset: usize,
    ) -> Result<usize, CurvatureError> {
        if let Some(full) = &mut self.full {
            offset = unflatten_into(full.view_mut(), v, offset)?;
        }
        if let Some(kron) = &mut self.kron {
            offset = unflatten_into(kron.A.view_mut(), v, offset)?;
            offset = unflatten_into(kron.B.view_mut(), v, offset)?;
        }
        if let Some(diag) = &mut self.diag {
            if let Some(w) = &mut diag.weight {
                offset = unflatten_into(w.view_mut(), v, offset)?;
            }
            if let Some(b) = &mut diag.bias {
                offset = unflatten_into(b.view_mut(), v, offset)?;
            }
        }
        if let Some(unit) = &mut self.unit {
            offset = unflatten_into(unit.blocks.view_mut(), v, offset)?;
        }
        Ok(offset)
    }

    /// Persists every populated representation under `root/relative_dir`.
    ///
    /// Symmetric matrices (`full`, the kron factors) are stored as packed
    /// lower triangles; `diag` and `unit` as raw arrays. Every array is
    /// written as 32-bit floats regardless of in-memory precision, so a
    /// round-trip is exact only up to f32 storage precision. Cached inverses
    /// are not persisted.
    pub fn save(&self, root: &Path, relative_dir: &Path) -> Result<SavedPaths, CurvatureError> {
        let mut paths = SavedPaths::default();
        if let Some(full) = &self.full {
            let rel = relative_dir.join("tril.npy");
            write_npy_f32_1d(&root.join(&rel), &matrix_to_tril(&full.view())?)?;
            paths.tril = Some(rel);
        }
        if let Some(kron) = &self.kron {
            let a_rel = relative_dir.join("kron").join("A_tril.npy");
            let b_rel = relative_dir.join("kron").join("B_tril.npy");
            write_npy_f32_1d(&root.join(&a_rel), &matrix_to_tril(&kron.A.view())?)?;
            write_npy_f32_1d(&root.join(&b_rel), &matrix_to_tril(&kron.B.view())?)?;
            paths.kron = Some(KronPaths {
                A_tril: a_rel,
                B_tril: b_rel,
            });
        }
        if let Some(diag) = &self.diag {
            let mut diag_paths = DiagPaths::default();
            if let Some(w) = &diag.weight {
                let rel = relative_dir.join("diag").join("weight.npy");
                write_npy_f32_2d(&root.join(&rel), w)?;
                diag_paths.weight = Some(rel);
            }
            if let Some(b) = &diag.bias {
                let rel = relative_dir.join("diag").join("bias.npy");
                write_npy_f32_1d(&root.join(&rel), b)?;
                diag_paths.bias = Some(rel);
            }
            paths.diag = Some(diag_paths);
        }
        if let Some(unit) = &self.unit {
            let rel = relative_dir.join("unit_wise.npy");
            write_npy_f32_3d(&root.join(&rel), &unit.blocks)?;
            paths.unit_wise = Some(rel);
        }
        Ok(paths)
    }

    /// Rebuilds a matrix from the files recorded in `paths`, resolved against
    /// `root`. Cached inverses start empty.
    pub fn load(paths: &SavedPaths, root: &Path) -> Result<SymMatrix, CurvatureError> {
        let mut matrix = SymMatrix::new();
        if let Some(rel) = &paths.tril {
            matrix.full = Some(tril_to_matrix(&read_npy_f32_1d(&root.join(rel))?)?);
        }
        if let Some(kron_paths) = &paths.kron {
            let a = tril_to_matrix(&read_npy_f32_1d(&root.join(&kron_paths.A_tril))?)?;
            let b = tril_to_matrix(&read_npy_f32_1d(&root.join(&kron_paths.B_tril))?)?;
            matrix.kron = Some(Kron::new(a, b)?);
        }
        if let Some(diag_paths) = &paths.diag {
            let weight = diag_paths
                .weight
                .as_ref()
                .map(|rel| read_npy_f32_2d(&root.join(rel)))
                .transpose()?;
            let bias = diag_paths
                .bias
                .as_ref()
                .map(|rel| read_npy_f32_1d(&root.join(rel)))
                .transpose()?;
            matrix.diag = Some(DiagRep::new(weight, bias));
        }
        if let Some(rel) = &paths.unit_wise {
            matrix.unit = Some(UnitWise::new(read_npy_f32_3d(&root.join(rel))?)?);
        }
        Ok(matrix)
    }
}

// ---------------------------------------------------------------------------
// Persistence layout
// ---------------------------------------------------------------------------

/// Relative paths of a saved [`SymMatrix`], one entry per populated
/// representation; serializable so a caller can index a directory of layer
/// matrices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedPaths {
    pub tril: Option<PathBuf>,
    pub kron: Option<KronPaths>,
    pub diag: Option<DiagPaths>,
    pub unit_wise: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KronPaths {
    pub A_tril: PathBuf,
    pub B_tril: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagPaths {
    pub weight: Option<PathBuf>,
    pub bias: Option<PathBuf>,
}

fn ensure_parent(path: &Path) -> Result<(), CurvatureError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn write_npy_f32_1d(path: &Path, data: &Array1<f64>) -> Result<(), CurvatureError> {
    ensure_parent(path)?;
    data.mapv(|x| x as f32).write_npy(File::create(path)?)?;
    Ok(())
}

fn write_npy_f32_2d(path: &Path, data: &Array2<f64>) -> Result<(), CurvatureError> {
    ensure_parent(path)?;
    data.mapv(|x| x as f32).write_npy(File::create(path)?)?;
    Ok(())
}

fn write_npy_f32_3d(path: &Path, data: &Array3<f64>) -> Result<(), CurvatureError> {
    ensure_parent(path)?;
    data.mapv(|x| x as f32).write_npy(File::create(path)?)?;
    Ok(())
}

fn read_npy_f32_1d(path: &Path) -> Result<Array1<f64>, CurvatureError> {
    let data = Array1::<f32>::read_npy(File::open(path)?)?;
    Ok(data.mapv(f64::from))
}

fn read_npy_f32_2d(path: &Path) -> Result<Array2<f64>, CurvatureError> {
    let data = Array2::<f32>::read_npy(File::open(path)?)?;
    Ok(data.mapv(f64::from))
}

fn read_npy_f32_3d(path: &Path) -> Result<Array3<f64>, CurvatureError> {
    let data = Array3::<f32>::read_npy(File::open(path)?)?;
    Ok(data.mapv(f64::from))
}
