//! Position-wise feed-forward block: 4× expansion with GELU.

use candle_core::{Result, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};

use drivetrain_common::TrainConfig;

pub struct Mlp {
    fc_in: Linear,
    fc_out: Linear,
}

impl Mlp {
    pub fn new(config: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let fc_in = linear(hidden, 4 * hidden, vb.pp("fc_in"))?;
        let fc_out = linear(4 * hidden, hidden, vb.pp("fc_out"))?;
        Ok(Self { fc_in, fc_out })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.fc_out.forward(&self.fc_in.forward(x)?.gelu()?)
    }
}
