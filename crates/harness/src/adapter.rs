//! The adapter: five operations binding a training driver to the model's
//! distributed and mixed-precision machinery.
//!
//! One run calls, in order and exactly once: [`convert_model`] →
//! [`create_optimizer`] → [`model_to_fp16`] (iff `fp16`) → [`model_to_ddp`],
//! then [`backward`] once per training iteration. [`setup`] strings the
//! pipeline together; every stage consumes its input and returns a new owned
//! value, so an already-wrapped model cannot be wrapped again.

use anyhow::Result;
use candle_core::{Device, Result as CandleResult, Tensor, Var};

use drivetrain_common::{DdpType, NormKind, TrainConfig};
use drivetrain_core::GptModel;

use crate::comm::ProcessGroup;
use crate::ddp::{ApexDdp, DdpModel, NativeDdp};
use crate::fp16::{Fp16Model, Fp16Optimizer};
use crate::optim::{AdamW, ParamGroup};

// ── Pipeline value types ────────────────────────────────────────────────────

/// The model after the precision stage: full-precision or f16-over-masters.
/// Forward always hands back f32 logits.
pub enum TrainModel {
    Full(GptModel),
    Half(Fp16Model),
}

impl TrainModel {
    pub fn forward(&self, input_ids: &Tensor) -> CandleResult<Tensor> {
        match self {
            Self::Full(model) => model.forward(input_ids),
            Self::Half(model) => model.forward(input_ids),
        }
    }

    pub fn trainable_vars(&self) -> Vec<(String, Var)> {
        match self {
            Self::Full(model) => model.trainable_vars(),
            Self::Half(model) => model.trainable_vars(),
        }
    }

    pub fn device(&self) -> &Device {
        match self {
            Self::Full(model) => model.device(),
            Self::Half(model) => model.inner().device(),
        }
    }
}

/// The optimizer after the precision stage.
pub enum TrainOptimizer {
    Full(AdamW),
    Half(Fp16Optimizer),
}

impl TrainOptimizer {
    pub fn step(&mut self) -> Result<()> {
        match self {
            Self::Full(opt) => opt.step().map_err(Into::into),
            Self::Half(opt) => opt.step(),
        }
    }

    pub fn zero_grad(&mut self) {
        match self {
            Self::Full(opt) => opt.zero_grad(),
            Self::Half(opt) => opt.zero_grad(),
        }
    }

    /// Number of applied updates (overflow-skipped steps do not count).
    pub fn updates(&self) -> usize {
        match self {
            Self::Full(opt) => opt.updates(),
            Self::Half(opt) => opt.updates(),
        }
    }
}

// ── 1. Model converter ──────────────────────────────────────────────────────

/// Replace every block's two normalisation sublayers and the final
/// normalisation layer with LayerNorm instances built from `config`
/// (hidden size, epsilon), restoring all learned parameters from the
/// model's snapshot by strict name matching. A key mismatch in either
/// direction is fatal: it means the model and config disagree.
pub fn convert_model(model: GptModel, config: &TrainConfig) -> Result<GptModel> {
    let snapshot = model.state_dict()?;

    let mut target = model.config().clone();
    target.norm = NormKind::LayerNorm;
    target.hidden_size = config.hidden_size;
    target.layernorm_epsilon = config.layernorm_epsilon;

    let converted = GptModel::new(&target, model.dtype(), model.device())?;
    converted.load_state_dict(&snapshot)?;
    tracing::info!(
        layers = target.num_layers,
        eps = target.layernorm_epsilon,
        "normalisation layers replaced"
    );
    Ok(converted)
}

// ── 2. Optimizer factory ────────────────────────────────────────────────────

/// Grouped AdamW over the model's weight-decay partition: norm parameters
/// and biases at decay 0, everything else at `weight_decay_rate`. An empty
/// group is accepted silently.
pub fn create_optimizer(config: &TrainConfig, model: &GptModel) -> AdamW {
    let (decay, no_decay) = model.weight_decay_partition();
    tracing::info!(
        decay = decay.len(),
        no_decay = no_decay.len(),
        lr = config.learning_rate,
        "optimizer groups built"
    );
    let groups = vec![
        ParamGroup::new("decay", config.weight_decay_rate, decay),
        ParamGroup::new("no_decay", 0.0, no_decay),
    ];
    AdamW::new(groups, config.learning_rate)
}

// ── 3. Precision wrapper ────────────────────────────────────────────────────

/// Wrap model and optimizer for reduced-precision training: the model is
/// rebuilt with f16 parameters, the optimizer keeps the fp32 masters and
/// gains loss scaling.
pub fn model_to_fp16(
    model: GptModel,
    optimizer: AdamW,
    config: &TrainConfig,
) -> Result<(Fp16Model, Fp16Optimizer)> {
    let model = Fp16Model::new(model)?;
    let optimizer = Fp16Optimizer::new(optimizer, &model, config)?;
    tracing::info!(
        scale = config.loss_scale,
        dynamic = config.dynamic_loss_scale,
        "training in reduced precision"
    );
    Ok((model, optimizer))
}

// ── 4. Parallelism wrapper ──────────────────────────────────────────────────

/// Wrap the model for synchronous gradient averaging over an initialized
/// process group. Without a group the model passes through untouched.
/// The mode set is closed at the [`DdpType`] boundary; there is no silent
/// fallback to an unwrapped model.
pub fn model_to_ddp(
    model: TrainModel,
    group: Option<ProcessGroup>,
    config: &TrainConfig,
) -> DdpModel {
    let Some(group) = group else {
        return DdpModel::Single(model);
    };
    match config.ddp_type {
        DdpType::Native => {
            tracing::info!(
                world_size = group.world_size(),
                local_rank = config.local_rank,
                bucket_view = config.use_gradient_as_bucket_view,
                "data parallel: native"
            );
            DdpModel::Native(NativeDdp::new(
                model,
                group,
                config.local_rank,
                config.use_gradient_as_bucket_view,
            ))
        }
        DdpType::Apex => {
            tracing::info!(world_size = group.world_size(), "data parallel: apex");
            DdpModel::Apex(ApexDdp::new(model, group))
        }
    }
}

// ── 5. Step executor ────────────────────────────────────────────────────────

/// One training iteration's backward half. Runs the precision-appropriate
/// backward, then applies the optimizer update and clears the accumulated
/// gradients iff `step` is an exact multiple of
/// `gradient_accumulation_steps`. The caller increments `step` on every
/// call; `gradient_accumulation_steps == 0` is rejected by
/// [`TrainConfig::validate`], not here.
pub fn backward(
    config: &TrainConfig,
    step: usize,
    loss: &Tensor,
    model: &DdpModel,
    optimizer: &mut TrainOptimizer,
) -> Result<()> {
    match optimizer {
        TrainOptimizer::Half(opt) => opt.backward(model, loss)?,
        TrainOptimizer::Full(opt) => {
            let grads = model.backward(loss)?;
            opt.accumulate(&grads)?;
        }
    }

    if step % config.gradient_accumulation_steps == 0 {
        optimizer.step()?;
        optimizer.zero_grad();
    }
    Ok(())
}

// ── Pipeline ────────────────────────────────────────────────────────────────

/// The full setup pipeline, in the only supported order: validate →
/// convert → optimizer → precision → parallelism.
pub fn setup(
    config: &TrainConfig,
    model: GptModel,
    group: Option<ProcessGroup>,
) -> Result<(DdpModel, TrainOptimizer)> {
    config.validate()?;
    let model = convert_model(model, config)?;
    let optimizer = create_optimizer(config, &model);
    let (model, optimizer) = if config.fp16 {
        let (model, optimizer) = model_to_fp16(model, optimizer, config)?;
        (TrainModel::Half(model), TrainOptimizer::Half(optimizer))
    } else {
        (TrainModel::Full(model), TrainOptimizer::Full(optimizer))
    };
    let model = model_to_ddp(model, group, config);
    Ok((model, optimizer))
}

// ── Tests ───────────────────────────────────────────────────────────────────
