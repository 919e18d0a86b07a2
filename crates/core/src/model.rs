//! Decoder-only transformer (GPT-style).
//!
//! Pre-norm residual blocks with learned position embeddings and weight
//! tying between the token embedding and the output projection. Each block
//! carries two normalisation sublayers (`input_ln` before attention,
//! `post_attn_ln` before the feed-forward) and the stack ends in `final_ln`:
//! the three sites the harness's converter rewrites.
//!
//! The model owns its [`VarMap`]; [`GptModel::state_dict`] and
//! [`GptModel::load_state_dict`] give wrappers a name-keyed snapshot/restore
//! without touching candle internals.

use std::collections::HashMap;

use candle_core::{bail, DType, Device, Result, Tensor, Var};
use candle_nn::{embedding, Embedding, Module, VarBuilder, VarMap};

use drivetrain_common::TrainConfig;

use crate::attention::CausalSelfAttention;
use crate::mlp::Mlp;
use crate::norm::NormLayer;

/// Name-keyed parameter snapshot.
pub type StateDict = HashMap<String, Tensor>;

/// Scope names of the normalisation sublayers. Parameters under these scopes
/// (and all biases) are excluded from weight decay.
const NORM_SCOPES: [&str; 3] = ["input_ln", "post_attn_ln", "final_ln"];

// ── Decoder block ───────────────────────────────────────────────────────────

/// Single decoder block: pre-norm → attention → residual → pre-norm → FFN →
/// residual.
struct Block {
    input_ln: NormLayer,
    attn: CausalSelfAttention,
    post_attn_ln: NormLayer,
    mlp: Mlp,
}

impl Block {
    fn new(config: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        let input_ln = NormLayer::new(config, vb.pp("input_ln"))?;
        let attn = CausalSelfAttention::new(config, vb.pp("attn"))?;
        let post_attn_ln = NormLayer::new(config, vb.pp("post_attn_ln"))?;
        let mlp = Mlp::new(config, vb.pp("mlp"))?;
        Ok(Self {
            input_ln,
            attn,
            post_attn_ln,
            mlp,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.input_ln.forward(x)?)?)?;
        let x = (&x + self.mlp.forward(&self.post_attn_ln.forward(&x)?)?)?;
        Ok(x)
    }
}

// ── GptModel ────────────────────────────────────────────────────────────────

/// Decoder-only transformer with learned positions and a weight-tied head.
pub struct GptModel {
    varmap: VarMap,
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    final_ln: NormLayer,
    config: TrainConfig,
    device: Device,
    dtype: DType,
}

impl GptModel {
    /// Build a fresh model; parameters are created in `dtype` on `device`
    /// and registered in the model's own [`VarMap`].
    pub fn new(config: &TrainConfig, dtype: DType, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);

        let wte = embedding(config.vocab_size, config.hidden_size, vb.pp("wte"))?;
        let wpe = embedding(config.max_seq_len, config.hidden_size, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            blocks.push(Block::new(config, vb.pp(format!("h.{i}")))?);
        }

        let final_ln = NormLayer::new(config, vb.pp("final_ln"))?;

        Ok(Self {
            varmap,
            wte,
            wpe,
            blocks,
            final_ln,
            config: config.clone(),
            device: device.clone(),
            dtype,
        })
    }

    /// Forward pass: `(batch, seq)` token IDs → `(batch, seq, vocab)` logits
    /// in the model's dtype.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_, t) = input_ids.dims2()?;
        if t > self.config.max_seq_len {
            bail!(
                "sequence length {t} exceeds max_seq_len {}",
                self.config.max_seq_len
            );
        }

        let positions = Tensor::arange(0u32, t as u32, &self.device)?;
        let mut x = self
            .wte
            .forward(input_ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;

        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        let x = self.final_ln.forward(&x)?;

        // Tied head: project with the transposed token embedding.
        x.broadcast_matmul(&self.wte.embeddings().t()?)
    }

    // ── Parameter access ────────────────────────────────────────────────────

    /// Detached copy of every parameter, keyed by dotted name.
    pub fn state_dict(&self) -> Result<StateDict> {
        let data = self.varmap.data().lock().unwrap();
        let mut state = StateDict::with_capacity(data.len());
        for (name, var) in data.iter() {
            state.insert(name.clone(), var.as_tensor().detach().copy()?);
        }
        Ok(state)
    }

    /// Strict restore: every parameter of the model must be present in the
    /// snapshot and vice versa; values are matched by exact name. Tensors are
    /// cast to the model's dtype on the way in.
    pub fn load_state_dict(&self, state: &StateDict) -> Result<()> {
        let data = self.varmap.data().lock().unwrap();
        for (name, var) in data.iter() {
            match state.get(name) {
                Some(src) => var.set(&src.to_dtype(var.dtype())?)?,
                None => bail!("parameter {name} missing from snapshot"),
            }
        }
        for name in state.keys() {
            if !data.contains_key(name) {
                bail!("snapshot parameter {name} has no destination in the model");
            }
        }
        Ok(())
    }

    /// All trainable parameters in deterministic (name) order.
    pub fn trainable_vars(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().unwrap();
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    /// Split parameters into (decay, no-decay) groups: biases and
    /// normalisation parameters never decay. The two groups partition the
    /// full parameter set.
    pub fn weight_decay_partition(&self) -> (Vec<(String, Var)>, Vec<(String, Var)>) {
        let mut decay = Vec::new();
        let mut no_decay = Vec::new();
        for (name, var) in self.trainable_vars() {
            if is_no_decay(&name) {
                no_decay.push((name, var));
            } else {
                decay.push((name, var));
            }
        }
        (decay, no_decay)
    }

    pub fn num_params(&self) -> usize {
        let data = self.varmap.data().lock().unwrap();
        data.values().map(|v| v.as_tensor().elem_count()).sum()
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

fn is_no_decay(name: &str) -> bool {
    let mut segments = name.split('.').rev();
    let leaf = segments.next().unwrap_or("");
    if leaf == "bias" {
        return true;
    }
    let scope = segments.next().unwrap_or("");
    NORM_SCOPES.contains(&scope)
}

// ── Tests ───────────────────────────────────────────────────────────────────
