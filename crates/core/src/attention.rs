//! Causal self-attention.
//!
//! Standard GPT-2 attention: fused Q/K/V projection (one linear, 3 × hidden),
//! additive causal mask, softmax over the last dimension, output projection.
//! Positions come from the model's learned position table, so there is no
//! rotary machinery here.

use candle_core::{DType, IndexOp, Result, Tensor};
use candle_nn::ops::softmax_last_dim;
use candle_nn::{linear, Linear, Module, VarBuilder};

use drivetrain_common::TrainConfig;

/// Additive causal mask of shape `(seq_len, seq_len)`: 0 on and below the
/// diagonal, −∞ above it.
fn causal_mask(seq_len: usize, dtype: DType, device: &candle_core::Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_slice(&mask, (seq_len, seq_len), device)?.to_dtype(dtype)
}

/// Multi-head causal self-attention.
pub struct CausalSelfAttention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl CausalSelfAttention {
    pub fn new(config: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let qkv = linear(hidden, 3 * hidden, vb.pp("qkv"))?;
        let proj = linear(hidden, hidden, vb.pp("proj"))?;
        let head_dim = config.head_dim();
        Ok(Self {
            qkv,
            proj,
            num_heads: config.num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, hidden) = x.dims3()?;

        // Fused projection, then split into per-head Q, K, V.
        let qkv = self.qkv.forward(x)?;
        let qkv = qkv.reshape((b, t, 3, self.num_heads, self.head_dim))?;
        let qkv = qkv.permute((0, 2, 3, 1, 4))?; // (b, 3, heads, t, head_dim)
        let q = qkv.i((.., 0))?.contiguous()?;
        let k = qkv.i((.., 1))?.contiguous()?;
        let v = qkv.i((.., 2))?.contiguous()?;

        // Scaled dot-product with the causal mask.
        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let mask = causal_mask(t, scores.dtype(), scores.device())?;
        let att = softmax_last_dim(&scores.broadcast_add(&mask)?)?;

        let y = att.matmul(&v)?; // (b, heads, t, head_dim)
        let y = y.transpose(1, 2)?.contiguous()?.reshape((b, t, hidden))?;
        self.proj.forward(&y)
    }
}
