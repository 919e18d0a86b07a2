//! # drivetrain-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`TrainConfig`]** — run configuration (serialised as JSON), covering
//!   model dimensions, optimizer rates, mixed-precision knobs, and the
//!   data-parallel mode.
//! * **[`DdpType`]** / **[`NormKind`]** — closed enums for the two
//!   configuration switches that must never fall through silently.
//! * **[`TextDataset`]** — byte-level text loading & batching.
//! * **[`batch_to_tensors`]** — raw batch → Candle tensors.

pub mod config;
pub mod data;

pub use config::{DdpType, NormKind, TrainConfig};
pub use data::{batch_to_tensors, TextDataset};
