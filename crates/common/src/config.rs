//! Run configuration for the training harness.
//!
//! Serialised as JSON. Every field has a sensible default so a minimal `{}`
//! JSON produces a working (if small) run. The struct is built once by the
//! driver, validated at the boundary, and passed by shared reference into
//! every component; no component mutates it.

use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

// ── Mode enums ──────────────────────────────────────────────────────────────

/// Data-parallel wrapping mode. Closed set: anything else is a fatal
/// configuration error at parse time, before any wrapping occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DdpType {
    /// Bucketed synchronous gradient averaging bound to the local device.
    Native,
    /// Flat fixed-message reduction, deferred to the end of backward, with
    /// gradients pre-divided by world size.
    Apex,
}

impl FromStr for DdpType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "native" => Ok(Self::Native),
            "apex" => Ok(Self::Apex),
            other => bail!("invalid DDP type {other:?} (expected \"native\" or \"apex\")"),
        }
    }
}

impl std::fmt::Display for DdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Apex => write!(f, "apex"),
        }
    }
}

/// Normalisation kind a model is built with. Conversion rewrites every norm
/// to [`NormKind::LayerNorm`] regardless of the starting kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    LayerNorm,
    RmsNorm,
}

// ── TrainConfig ─────────────────────────────────────────────────────────────

/// Flat, read-only run configuration.
///
/// Backwards-compatible: missing fields fall back to their
/// `#[serde(default)]` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    // ── Model dimensions ────────────────────────────────────────────────────
    /// Vocabulary size. The bundled dataset is byte-level, so 256 covers it.
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    /// Hidden size (model dimension).
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Number of attention heads.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    /// Number of decoder layers.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    /// Maximum sequence length (learned position table size).
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    /// Epsilon for the normalisation layers installed by conversion.
    #[serde(default = "default_layernorm_epsilon")]
    pub layernorm_epsilon: f64,
    /// Normalisation kind the model is initially built with.
    #[serde(default = "default_norm")]
    pub norm: NormKind,

    // ── Optimizer ───────────────────────────────────────────────────────────
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Decay coefficient for the decay parameter group; norm parameters and
    /// biases are always in the zero-decay group.
    #[serde(default = "default_weight_decay_rate")]
    pub weight_decay_rate: f64,

    // ── Mixed precision ─────────────────────────────────────────────────────
    /// Run forward/backward arithmetic in f16 with fp32 master weights.
    #[serde(default)]
    pub fp16: bool,
    /// Loss scale: the fixed scale when `dynamic_loss_scale` is false, the
    /// initial scale otherwise.
    #[serde(default = "default_loss_scale")]
    pub loss_scale: f64,
    #[serde(default = "default_true")]
    pub dynamic_loss_scale: bool,
    /// Consecutive overflow-free steps before the dynamic scale doubles.
    #[serde(default = "default_loss_scale_window")]
    pub loss_scale_window: usize,
    /// Floor the dynamic scale never drops below.
    #[serde(default = "default_min_scale")]
    pub min_scale: f64,
    /// Overflows tolerated before the dynamic scale is actually halved.
    #[serde(default = "default_hysteresis")]
    pub hysteresis: usize,

    // ── Data parallelism ────────────────────────────────────────────────────
    #[serde(default = "default_ddp_type")]
    pub ddp_type: DdpType,
    /// Device slot of this worker within its node.
    #[serde(default)]
    pub local_rank: usize,
    /// Native mode: hand out reduced gradients as views into the flat
    /// bucket instead of copying them back out.
    #[serde(default)]
    pub use_gradient_as_bucket_view: bool,

    // ── Step executor ───────────────────────────────────────────────────────
    /// The optimizer update fires on every step index divisible by this.
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
}

fn default_vocab_size() -> usize {
    256
}
fn default_hidden_size() -> usize {
    256
}
fn default_num_heads() -> usize {
    8
}
fn default_num_layers() -> usize {
    4
}
fn default_max_seq_len() -> usize {
    256
}
fn default_layernorm_epsilon() -> f64 {
    1e-5
}
fn default_norm() -> NormKind {
    NormKind::LayerNorm
}
fn default_learning_rate() -> f64 {
    1.5e-4
}
fn default_weight_decay_rate() -> f64 {
    0.01
}
fn default_loss_scale() -> f64 {
    4_294_967_296.0
}
fn default_true() -> bool {
    true
}
fn default_loss_scale_window() -> usize {
    1000
}
fn default_min_scale() -> f64 {
    1.0
}
fn default_hysteresis() -> usize {
    2
}
fn default_ddp_type() -> DdpType {
    DdpType::Native
}
fn default_gradient_accumulation_steps() -> usize {
    1
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            num_heads: default_num_heads(),
            num_layers: default_num_layers(),
            max_seq_len: default_max_seq_len(),
            layernorm_epsilon: default_layernorm_epsilon(),
            norm: default_norm(),
            learning_rate: default_learning_rate(),
            weight_decay_rate: default_weight_decay_rate(),
            fp16: false,
            loss_scale: default_loss_scale(),
            dynamic_loss_scale: true,
            loss_scale_window: default_loss_scale_window(),
            min_scale: default_min_scale(),
            hysteresis: default_hysteresis(),
            ddp_type: default_ddp_type(),
            local_rank: 0,
            use_gradient_as_bucket_view: false,
            gradient_accumulation_steps: default_gradient_accumulation_steps(),
        }
    }
}

impl TrainConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    /// Save as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("write config {}", path.display()))?;
        Ok(())
    }

    /// Per-head dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Boundary validation. Must pass before any model is built or wrapped;
    /// a failure here is a programming/config error, not a runtime event.
    pub fn validate(&self) -> Result<()> {
        if self.gradient_accumulation_steps == 0 {
            bail!("gradient_accumulation_steps must be >= 1");
        }
        if self.hidden_size == 0 || self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            bail!(
                "hidden_size ({}) must be a positive multiple of num_heads ({})",
                self.hidden_size,
                self.num_heads
            );
        }
        if self.num_layers == 0 {
            bail!("num_layers must be >= 1");
        }
        if self.loss_scale <= 0.0 {
            bail!("loss_scale must be positive, got {}", self.loss_scale);
        }
        if self.min_scale <= 0.0 {
            bail!("min_scale must be positive, got {}", self.min_scale);
        }
        if self.hysteresis == 0 {
            bail!("hysteresis must be >= 1");
        }
        if self.loss_scale_window == 0 {
            bail!("loss_scale_window must be >= 1");
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_json_round_trip() {
        let config = TrainConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: TrainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.hidden_size, loaded.hidden_size);
        assert_eq!(config.num_layers, loaded.num_layers);
        assert_eq!(config.ddp_type, loaded.ddp_type);
        assert_eq!(config.gradient_accumulation_steps, 1);
        assert!(loaded.dynamic_loss_scale);
        assert!(!loaded.fp16);
    }

    #[test]
    fn defaults_are_valid() {
        TrainConfig::default().validate().unwrap();
    }

    #[test]
    fn ddp_type_parses_closed_set() {
        assert_eq!("native".parse::<DdpType>().unwrap(), DdpType::Native);
        assert_eq!("apex".parse::<DdpType>().unwrap(), DdpType::Apex);
        let err = "ring".parse::<DdpType>().unwrap_err().to_string();
        assert!(err.contains("ring"), "diagnostic must name the value: {err}");
    }

    #[test]
    fn ddp_type_rejected_in_json() {
        let json = r#"{ "ddp_type": "horovod" }"#;
        assert!(serde_json::from_str::<TrainConfig>(json).is_err());
    }

    #[test]
    fn zero_accumulation_rejected() {
        let config = TrainConfig {
            gradient_accumulation_steps: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn head_split_rejected() {
        let config = TrainConfig {
            hidden_size: 130,
            num_heads: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
