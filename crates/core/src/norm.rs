//! Normalisation layers.
//!
//! A model may start life with either kind; the harness's converter rewrites
//! every norm to LayerNorm before training. LayerNorm carries scale **and**
//! shift parameters, RMSNorm scale only; the strict state-dict reload after
//! conversion depends on that difference.

use candle_core::{Result, Tensor};
use candle_nn::{layer_norm, rms_norm, LayerNorm, Module, RmsNorm, VarBuilder};

use drivetrain_common::{NormKind, TrainConfig};

/// Normalisation layer: LayerNorm or RMSNorm.
pub enum NormLayer {
    LayerNorm(LayerNorm),
    RmsNorm(RmsNorm),
}

impl NormLayer {
    /// Construct from config. `vb` should be scoped to the layer prefix
    /// (e.g. `vb.pp("input_ln")`).
    pub fn new(config: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        match config.norm {
            NormKind::LayerNorm => Ok(Self::LayerNorm(layer_norm(
                config.hidden_size,
                config.layernorm_epsilon,
                vb,
            )?)),
            NormKind::RmsNorm => Ok(Self::RmsNorm(rms_norm(
                config.hidden_size,
                config.layernorm_epsilon,
                vb,
            )?)),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::LayerNorm(l) => l.forward(x),
            Self::RmsNorm(r) => r.forward(x),
        }
    }
}
