//! Kronecker-factored BFGS curvature maintenance (K-BFGS).
//!
//! For each eligible layer the maintainer keeps a [`SymMatrix`] in Kronecker
//! form whose factor inverses are kept current across optimizer steps by
//! secant updates instead of repeated re-inversion: the input-side factor `A`
//! is blended by exponential moving average and its inverse updated with a
//! synthetic pair `s = A⁻¹·meanInput`, `y = A·s + d·s` (O(dim²) per step once
//! seeded); the output-side inverse `B⁻¹` is updated from a genuine two-step
//! secant pair measured across the optimizer's parameter update.
//!
//! The forward/backward machinery that produces the raw statistics is an
//! external collaborator. The maintainer only consumes [`EstimateStats`] /
//! [`ApplyStats`] and drives an explicit two-phase state machine: an
//! *estimate* pass records statistics and the minibatch they came from; the
//! *apply* pass, fed a re-evaluation of that same remembered minibatch after
//! the parameter update, turns the observed output shift into the `B`-side
//! secant pair. The two phases must never interleave for one maintainer,
//! which `&mut self` plus the [`Phase`] machine enforces.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::CurvatureError;
use crate::linalg::{add_diagonal, cholesky_inverse};
use crate::matrix::{Kron, SymMatrix};
use crate::secant::{bfgs_inverse_update, powell_lm_damping};

fn default_data_size() -> usize {
    1
}

fn default_damping() -> f64 {
    1e-5
}

fn default_ema_decay() -> f64 {
    0.1
}

fn default_mu1() -> f64 {
    0.2
}

/// Tunables of the K-BFGS maintainer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KronBfgsConfig {
    /// Number of samples the incoming covariance estimates were summed over.
    #[serde(default = "default_data_size")]
    pub data_size: usize,
    /// Tikhonov damping; split asymmetrically between the two factors.
    #[serde(default = "default_damping")]
    pub damping: f64,
    /// Exponential-moving-average decay for the input-side factor.
    #[serde(default = "default_ema_decay")]
    pub ema_decay: f64,
    /// Powell damping threshold for the output-side secant pair.
    #[serde(default = "default_mu1")]
    pub mu1: f64,
    /// Once the input-side inverse exists, maintain it from a curvature-vector
    /// product on the minibatch instead of a fresh covariance estimate.
    #[serde(default)]
    pub minibatch_hessian_action: bool,
}

impl Default for KronBfgsConfig {
    fn default() -> Self {
        Self {
            data_size: default_data_size(),
            damping: default_damping(),
            ema_decay: default_ema_decay(),
            mu1: default_mu1(),
            minibatch_hessian_action: false,
        }
    }
}

/// Layer types eligible for Kronecker-factored treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    Linear,
    Conv2d,
}

/// Static description of one parameter-bearing layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSpec {
    pub kind: LayerKind,
    pub in_features: usize,
    pub out_features: usize,
    pub has_bias: bool,
}

impl LayerSpec {
    /// Input-side factor dimension; the bias folds in as one extra column.
    pub fn a_dim(&self) -> usize {
        self.in_features + usize::from(self.has_bias)
    }
}

/// Stable handle into the maintainer's layer side-table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerId(pub usize);

/// Curvature-vector product pair `(s, A·s)` supplied by the collaborator in
/// minibatch-Hessian-action mode.
#[derive(Debug, Clone)]
pub struct HessianActionPair {
    pub s: Array1<f64>,
    pub As: Array1<f64>,
}

/// Per-layer statistics of one estimate-phase forward/backward pass.
#[derive(Debug, Clone)]
pub struct EstimateStats {
    /// Covariance of mean inputs (the `A`-side estimate). May be absent in
    /// minibatch-Hessian-action mode once the inverse exists.
    pub cov_inputs: Option<Array2<f64>>,
    pub mean_inputs: Option<Array1<f64>>,
    /// Mean (spatially averaged, for convolutions) layer output.
    pub mean_outputs: Array1<f64>,
    /// Mean gradient with respect to the layer output.
    pub mean_outgrads: Array1<f64>,
    /// Output spatial size; convolutions only.
    pub out_spatial_size: Option<usize>,
    pub hessian_action: Option<HessianActionPair>,
}

/// Per-layer statistics of the apply-phase re-evaluation (same minibatch,
/// post-update parameters).
#[derive(Debug, Clone)]
pub struct ApplyStats {
    pub mean_outputs: Array1<f64>,
    pub mean_outgrads: Array1<f64>,
}

/// The maintainer's two-phase state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingEstimate,
    AwaitingApply,
}

struct LayerState {
    spec: LayerSpec,
    bfgs: Option<SymMatrix>,
    last_mean_outputs: Option<Array1<f64>>,
    last_mean_outgrads: Option<Array1<f64>>,
    out_spatial_size: usize,
}

impl LayerState {
    fn new(spec: LayerSpec) -> Self {
        Self {
            spec,
            bfgs: None,
            last_mean_outputs: None,
            last_mean_outgrads: None,
            out_spatial_size: 1,
        }
    }
}

/// Damping for one side of a layer's Kronecker pair. Convolutions aggregate
/// the input side over spatial positions while the output side is not, so the
/// scalar damping is rebalanced by sqrt(spatial size) between the two.
fn side_damping(damping: f64, kind: LayerKind, out_spatial_size: usize, input_side: bool) -> f64 {
    let sqrt_damping = damping.sqrt();
    match kind {
        LayerKind::Linear => sqrt_damping,
        LayerKind::Conv2d => {
            let sqrt_spatial = (out_spatial_size as f64).sqrt();
            if input_side {
                sqrt_damping * sqrt_spatial
            } else {
                sqrt_damping / sqrt_spatial
            }
        }
    }
}

/// K-BFGS driver over a fixed set of layers.
///
/// `I` is the caller's opaque minibatch payload: the maintainer owns the
/// batch remembered between the estimate and apply phases and hands it back
/// through [`pending_batch`](Self::pending_batch) for the re-evaluation.
pub struct KronBfgs<I> {
    config: KronBfgsConfig,
    layers: Vec<LayerState>,
    phase: Phase,
    input_inverse_ready: bool,
    pending_batch: Option<I>,
}

impl<I> KronBfgs<I> {
    pub fn new(config: KronBfgsConfig, specs: Vec<LayerSpec>) -> Self {
        Self {
            config,
            layers: specs.into_iter().map(LayerState::new).collect(),
            phase: Phase::AwaitingEstimate,
            input_inverse_ready: false,
            pending_batch: None,
        }
    }

    pub fn config(&self) -> &KronBfgsConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn input_inverse_ready(&self) -> bool {
        self.input_inverse_ready
    }

    /// The layer's curvature matrix, for external eigen-solvers that treat it
    /// as an opaque linear operator. `None` before the first estimate phase.
    pub fn matrix(&self, layer: LayerId) -> Option<&SymMatrix> {
        self.layers.get(layer.0).and_then(|state| state.bfgs.as_ref())
    }

    /// The minibatch remembered by the last estimate phase, which the caller
    /// must re-evaluate (with post-update parameters) to produce the
    /// [`ApplyStats`] for [`apply`](Self::apply).
    pub fn pending_batch(&self) -> Option<&I> {
        self.pending_batch.as_ref()
    }

    /// Drops all accumulated curvature and returns to the initial phase.
    pub fn reset(&mut self) {
        for state in &mut self.layers {
            state.bfgs = None;
            state.last_mean_outputs = None;
            state.last_mean_outgrads = None;
            state.out_spatial_size = 1;
        }
        self.phase = Phase::AwaitingEstimate;
        self.input_inverse_ready = false;
        self.pending_batch = None;
    }

    fn check_layer_count(&self, found: usize) -> Result<(), CurvatureError> {
        if found != self.layers.len() {
            return Err(CurvatureError::shape(
                "per-layer statistics",
                self.layers.len(),
                found,
            ));
        }
        Ok(())
    }

    /// Estimate phase: fold this pass's statistics into each layer's
    /// input-side factor and its cached inverse, and record the output-side
    /// means the next apply phase will difference against.
    pub fn estimate(&mut self, stats: &[EstimateStats], batch: I) -> Result<(), CurvatureError> {
        if self.phase != Phase::AwaitingEstimate {
            return Err(CurvatureError::Precondition(
                "estimate called while an apply phase is outstanding",
            ));
        }
        self.check_layer_count(stats.len())?;

        let config = &self.config;
        for (state, layer_stats) in self.layers.iter_mut().zip(stats) {
            if layer_stats.mean_outputs.len() != state.spec.out_features
                || layer_stats.mean_outgrads.len() != state.spec.out_features
            {
                return Err(CurvatureError::shape(
                    "estimate: mean output statistics length",
                    state.spec.out_features,
                    layer_stats.mean_outputs.len(),
                ));
            }
            state.out_spatial_size = layer_stats.out_spatial_size.unwrap_or(1);
            let d_a = side_damping(config.damping, state.spec.kind, state.out_spatial_size, true);

            if config.minibatch_hessian_action && self.input_inverse_ready {
                update_input_inverse_from_action(state, layer_stats, d_a)?;
            } else {
                update_input_inverse_from_covariance(state, layer_stats, config, d_a)?;
            }

            state.last_mean_outputs = Some(layer_stats.mean_outputs.clone());
            state.last_mean_outgrads = Some(layer_stats.mean_outgrads.clone());
        }

        self.input_inverse_ready = true;
        self.pending_batch = Some(batch);
        self.phase = Phase::AwaitingApply;
        Ok(())
    }

    /// Apply phase: consume the re-evaluation of the remembered minibatch and
    /// turn the observed output-statistics shift into the output-side secant
    /// pair. This is a true secant condition: it measures how the actual
    /// parameter update moved the layer's outputs.
    pub fn apply(&mut self, stats: &[ApplyStats]) -> Result<(), CurvatureError> {
        if self.phase != Phase::AwaitingApply {
            return Err(CurvatureError::Precondition(
                "apply called before an estimate phase",
            ));
        }
        self.check_layer_count(stats.len())?;

        let config = &self.config;
        for (state, layer_stats) in self.layers.iter_mut().zip(stats) {
            let d_b = side_damping(config.damping, state.spec.kind, state.out_spatial_size, false);
            let last_outputs = state.last_mean_outputs.take().ok_or(
                CurvatureError::Precondition("apply phase found no recorded mean outputs"),
            )?;
            let last_outgrads = state.last_mean_outgrads.take().ok_or(
                CurvatureError::Precondition("apply phase found no recorded mean out-gradients"),
            )?;
            let kron = state
                .bfgs
                .as_mut()
                .and_then(SymMatrix::kron_mut)
                .ok_or(CurvatureError::Precondition(
                    "apply phase found no kron curvature for a layer",
                ))?;

            if layer_stats.mean_outputs.len() != last_outputs.len()
                || layer_stats.mean_outgrads.len() != last_outgrads.len()
            {
                return Err(CurvatureError::shape(
                    "apply: mean output statistics length",
                    last_outputs.len(),
                    layer_stats.mean_outputs.len(),
                ));
            }
            let mut s = &layer_stats.mean_outputs - &last_outputs;
            let mut y = &layer_stats.mean_outgrads - &last_outgrads;

            if kron.B_inv().is_none() {
                kron.set_B_inv(Array2::<f64>::eye(s.len()));
            }
            {
                let h = kron.B_inv().ok_or(CurvatureError::Precondition(
                    "output-side inverse vanished mid-update",
                ))?;
                powell_lm_damping(h, &mut s, &mut y, config.mu1, d_b)?;
            }
            let h = kron.B_inv_mut().ok_or(CurvatureError::Precondition(
                "output-side inverse vanished mid-update",
            ))?;
            bfgs_inverse_update(h, &s, &y)?;
        }

        self.pending_batch = None;
        self.phase = Phase::AwaitingEstimate;
        Ok(())
    }

    /// Transforms a raw gradient into the preconditioned (natural-gradient
    /// like) direction, in place, using the layer's cached factor inverses.
    pub fn precondition(
        &self,
        layer: LayerId,
        weight_grad: &mut Array2<f64>,
        bias_grad: Option<&mut Array1<f64>>,
    ) -> Result<(), CurvatureError> {
        let state = self
            .layers
            .get(layer.0)
            .ok_or(CurvatureError::Precondition("unknown layer id"))?;
        let bfgs = state.bfgs.as_ref().ok_or(CurvatureError::Precondition(
            "precondition called before any estimate phase populated this layer",
        ))?;
        bfgs.mvp_in_place(weight_grad, bias_grad, true)
    }
}

fn update_input_inverse_from_action(
    state: &mut LayerState,
    layer_stats: &EstimateStats,
    d_a: f64,
) -> Result<(), CurvatureError> {
    let pair = layer_stats
        .hessian_action
        .as_ref()
        .ok_or(CurvatureError::Precondition(
            "minibatch-Hessian-action mode requires a curvature-vector pair",
        ))?;
    let kron = state
        .bfgs
        .as_mut()
        .and_then(SymMatrix::kron_mut)
        .ok_or(CurvatureError::Precondition(
            "Hessian-action update requires an existing kron curvature",
        ))?;
    if pair.s.len() != kron.A_dim() || pair.As.len() != kron.A_dim() {
        return Err(CurvatureError::shape(
            "hessian action pair length",
            kron.A_dim(),
            pair.s.len(),
        ));
    }
    let y = &pair.As + &pair.s * d_a;
    let h = kron.A_inv_mut().ok_or(CurvatureError::Precondition(
        "Hessian-action update requires an existing input-side inverse",
    ))?;
    bfgs_inverse_update(h, &pair.s, &y)
}

fn update_input_inverse_from_covariance(
    state: &mut LayerState,
    layer_stats: &EstimateStats,
    config: &KronBfgsConfig,
    d_a: f64,
) -> Result<(), CurvatureError> {
    let cov = layer_stats
        .cov_inputs
        .as_ref()
        .ok_or(CurvatureError::Precondition(
            "estimate phase requires an input covariance",
        ))?;
    let a_dim = state.spec.a_dim();
    if cov.nrows() != a_dim || cov.ncols() != a_dim {
        return Err(CurvatureError::shape(
            "input covariance dimension",
            a_dim,
            cov.nrows(),
        ));
    }

    // The output-side factor is a placeholder identity: B's inverse is
    // maintained purely by the apply-phase secant updates, and the EMA below
    // maps identity to identity.
    let a_fresh = cov.mapv(|x| x / config.data_size as f64);
    let fresh = SymMatrix::from_kron(Kron::new(
        a_fresh,
        Array2::<f64>::eye(state.spec.out_features),
    )?);

    match &mut state.bfgs {
        None => state.bfgs = Some(fresh),
        Some(existing) => {
            let mut fresh = fresh;
            fresh.scale(config.ema_decay);
            existing.scale(1.0 - config.ema_decay);
            // In place, so the cached A_inv stays attached to this matrix.
            existing.accumulate(&fresh)?;
        }
    }

    let kron = state
        .bfgs
        .as_mut()
        .and_then(SymMatrix::kron_mut)
        .ok_or(CurvatureError::Precondition(
            "estimate phase lost its kron curvature",
        ))?;
    if kron.A_inv().is_none() {
        log::debug!("seeding input-side inverse by damped Cholesky (dim {a_dim})");
        let seed = cholesky_inverse(&add_diagonal(&kron.A().view(), d_a).view())?;
        kron.set_A_inv(seed);
    }

    let mean_inputs = layer_stats
        .mean_inputs
        .as_ref()
        .ok_or(CurvatureError::Precondition(
            "estimate phase requires a mean-input vector",
        ))?;
    if mean_inputs.len() != a_dim {
        return Err(CurvatureError::shape(
            "mean inputs length",
            a_dim,
            mean_inputs.len(),
        ));
    }

    let s = kron
        .A_inv()
        .ok_or(CurvatureError::Precondition(
            "input-side inverse vanished mid-update",
        ))?
        .dot(mean_inputs);
    let y = kron.A().dot(&s) + &s * d_a;
    let h = kron.A_inv_mut().ok_or(CurvatureError::Precondition(
        "input-side inverse vanished mid-update",
    ))?;
    bfgs_inverse_update(h, &s, &y)
}
