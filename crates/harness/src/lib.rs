//! # drivetrain-harness — The Training Adapter
//!
//! Binds a training driver to a model's data-parallel and mixed-precision
//! machinery. One ownership pipeline per run:
//!
//! * **[`convert_model`]** — rewrite every normalisation layer from config,
//!   restoring learned parameters by strict name matching.
//! * **[`create_optimizer`]** — grouped AdamW: norm parameters and biases in
//!   the zero-decay group, everything else decaying.
//! * **[`model_to_fp16`]** — f16 compute copies over fp32 masters, with
//!   dynamic loss scaling ([`LossScaler`]).
//! * **[`model_to_ddp`]** — wrap for synchronous gradient averaging over an
//!   initialized [`ProcessGroup`], or pass through untouched without one.
//! * **[`backward`]** — the per-iteration step executor: backward, then
//!   update + clear iff the step index divides the accumulation count.
//!
//! All collective communication is delegated to the [`comm::Collective`]
//! backend; nothing in this crate opens a socket or spawns a worker.

pub mod adapter;
pub mod comm;
pub mod ddp;
pub mod fp16;
pub mod optim;

pub use adapter::{
    backward, convert_model, create_optimizer, model_to_ddp, model_to_fp16, setup, TrainModel,
    TrainOptimizer,
};
pub use comm::{Collective, ProcessGroup};
pub use ddp::DdpModel;
pub use fp16::{Fp16Model, Fp16Optimizer, LossScaler};
pub use optim::{AdamW, ParamGroup};
