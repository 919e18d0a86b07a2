//! # drivetrain-core — The Model
//!
//! The trainable GPT-style decoder the harness wraps, plus the parameter
//! machinery the wrapping relies on:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`norm`] | `NormLayer` (LayerNorm / RMSNorm) |
//! | [`attention`] | `CausalSelfAttention` |
//! | [`mlp`] | `Mlp` (4× GELU feed-forward) |
//! | [`model`] | `GptModel`, strict state-dict load, weight-decay partition |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`.
//! 2. **Stable parameter names.** Dotted paths (`h.3.input_ln.weight`) are the
//!    contract the converter, the optimizer grouping, and the fp16 master
//!    pairing all key on.
//! 3. **The model owns its `VarMap`.** Snapshot and strict reload are model
//!    methods, so wrappers can rebuild without reaching into candle internals.

pub mod attention;
pub mod mlp;
pub mod model;
pub mod norm;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use attention::CausalSelfAttention;
pub use mlp::Mlp;
pub use model::{GptModel, StateDict};
pub use norm::NormLayer;
