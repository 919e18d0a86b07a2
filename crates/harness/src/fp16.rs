//! Reduced-precision training: f16 compute copies over fp32 masters.
//!
//! * **[`LossScaler`]** — static or dynamic loss scale with growth window,
//!   shrink hysteresis, and a hard floor.
//! * **[`Fp16Model`]** — the model rebuilt with f16 parameters (cast from the
//!   fp32 snapshot); forward runs in f16 and hands back f32 logits.
//! * **[`Fp16Optimizer`]** — wraps the grouped [`AdamW`] (which keeps the
//!   fp32 masters): scales the loss before backward, unscales gradients into
//!   fp32, detects overflow, and on a clean step copies the updated masters
//!   back into the f16 parameters.
//!
//! A detected overflow is a recoverable, expected event: the step is skipped
//! and the scale adjusted, never an error.

use anyhow::{bail, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Result as CandleResult, Tensor, Var};

use drivetrain_common::TrainConfig;
use drivetrain_core::GptModel;

use crate::ddp::DdpModel;
use crate::optim::AdamW;

// ── Loss scaler ─────────────────────────────────────────────────────────────

/// Loss scale with the usual dynamic discipline: double after a window of
/// consecutive clean steps, halve only once `hysteresis` overflows have
/// exhausted the delay counter, never below `min_scale`. In static mode the
/// scale is frozen and an overflow only skips the step.
#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f64,
    dynamic: bool,
    growth_factor: f64,
    window: usize,
    min_scale: f64,
    hysteresis: usize,
    hysteresis_left: usize,
    good_steps: usize,
}

impl LossScaler {
    pub fn from_config(config: &TrainConfig) -> Self {
        Self {
            scale: config.loss_scale,
            dynamic: config.dynamic_loss_scale,
            growth_factor: 2.0,
            window: config.loss_scale_window,
            min_scale: config.min_scale,
            hysteresis: config.hysteresis,
            hysteresis_left: config.hysteresis,
            good_steps: 0,
        }
    }

    /// Current loss scale.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Record one step outcome. Returns `true` when the update should be
    /// applied, `false` when it must be skipped.
    pub fn update(&mut self, overflow: bool) -> bool {
        if !self.dynamic {
            return !overflow;
        }
        if overflow {
            self.good_steps = 0;
            if self.hysteresis_left <= 1 {
                self.scale = (self.scale / self.growth_factor).max(self.min_scale);
                self.hysteresis_left = self.hysteresis;
                tracing::debug!(scale = self.scale, "loss scale reduced");
            } else {
                self.hysteresis_left -= 1;
            }
            return false;
        }
        self.good_steps += 1;
        if self.good_steps >= self.window {
            self.scale *= self.growth_factor;
            self.good_steps = 0;
            tracing::debug!(scale = self.scale, "loss scale increased");
        }
        true
    }
}

// ── Fp16Model ───────────────────────────────────────────────────────────────

/// The model rebuilt with f16 parameters. Forward arithmetic runs in f16;
/// the returned logits are cast back to f32 for the loss.
pub struct Fp16Model {
    inner: GptModel,
}

impl Fp16Model {
    /// Consume an fp32 model, rebuild it in f16, and restore its parameter
    /// values (cast on the way in) via the strict snapshot reload.
    pub fn new(model: GptModel) -> Result<Self> {
        let snapshot = model.state_dict()?;
        let inner = GptModel::new(model.config(), DType::F16, model.device())?;
        inner.load_state_dict(&snapshot)?;
        Ok(Self { inner })
    }

    pub fn forward(&self, input_ids: &Tensor) -> CandleResult<Tensor> {
        self.inner.forward(input_ids)?.to_dtype(DType::F32)
    }

    pub fn trainable_vars(&self) -> Vec<(String, Var)> {
        self.inner.trainable_vars()
    }

    pub fn inner(&self) -> &GptModel {
        &self.inner
    }
}

// ── Fp16Optimizer ───────────────────────────────────────────────────────────

/// Wraps the grouped [`AdamW`] for reduced-precision training. The wrapped
/// optimizer's parameters are the fp32 masters; this wrapper pairs them by
/// name with the f16 model parameters the gradients arrive on.
pub struct Fp16Optimizer {
    inner: AdamW,
    model_params: Vec<(String, Var)>,
    scaler: LossScaler,
    overflow: bool,
}

impl Fp16Optimizer {
    pub fn new(inner: AdamW, model: &Fp16Model, config: &TrainConfig) -> Result<Self> {
        let model_params = model.trainable_vars();
        for (name, _) in &model_params {
            if inner.get(name).is_none() {
                bail!("f16 parameter {name} has no fp32 master in the optimizer");
            }
        }
        Ok(Self {
            inner,
            model_params,
            scaler: LossScaler::from_config(config),
            overflow: false,
        })
    }

    /// Specialized backward: scale the loss, run the wrapped model's
    /// backward (including any gradient synchronisation), then unscale and
    /// accumulate into the fp32 masters.
    pub fn backward(&mut self, model: &DdpModel, loss: &Tensor) -> Result<()> {
        let scaled = loss.affine(self.scaler.scale(), 0.0)?;
        let grads = model.backward(&scaled)?;
        self.collect(&grads)
    }

    /// Unscale a backward pass's gradients into fp32 and accumulate them.
    /// A non-finite gradient poisons the whole accumulation window: the
    /// remaining gradients are dropped and the next [`step`](Self::step)
    /// will be skipped.
    pub fn collect(&mut self, grads: &GradStore) -> Result<()> {
        if self.overflow {
            return Ok(());
        }
        let inv_scale = 1.0 / self.scaler.scale();
        for (name, var) in &self.model_params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?.affine(inv_scale, 0.0)?;
            if !all_finite(&grad)? {
                tracing::warn!(param = %name, "non-finite gradient detected");
                self.overflow = true;
                return Ok(());
            }
            self.inner.accumulate_named(name, &grad)?;
        }
        Ok(())
    }

    /// Apply the update, or skip it if the window overflowed. Skipping
    /// adjusts the scale and is not an error.
    pub fn step(&mut self) -> Result<()> {
        let overflow = std::mem::take(&mut self.overflow);
        if !self.scaler.update(overflow) {
            tracing::warn!(
                scale = self.scaler.scale(),
                "gradient overflow: skipping optimizer step"
            );
            return Ok(());
        }
        self.inner.step()?;
        self.sync_model_params()
    }

    pub fn zero_grad(&mut self) {
        self.inner.zero_grad();
    }

    /// Copy the updated fp32 masters back into the f16 model parameters.
    fn sync_model_params(&self) -> Result<()> {
        for (name, var) in &self.model_params {
            let Some(master) = self.inner.get(name) else {
                bail!("fp32 master for {name} disappeared");
            };
            var.set(&master.as_tensor().detach().to_dtype(var.dtype())?)?;
        }
        Ok(())
    }

    pub fn updates(&self) -> usize {
        self.inner.updates()
    }

    pub fn scaler(&self) -> &LossScaler {
        &self.scaler
    }
}

fn all_finite(tensor: &Tensor) -> CandleResult<bool> {
    // NaN and ±∞ both poison the sum.
    let sum = tensor.abs()?.sum_all()?.to_scalar::<f32>()?;
    Ok(sum.is_finite())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scaler(dynamic: bool, window: usize, min_scale: f64, hysteresis: usize) -> LossScaler {
        LossScaler::from_config(&TrainConfig {
            loss_scale: 1024.0,
            dynamic_loss_scale: dynamic,
            loss_scale_window: window,
            min_scale,
            hysteresis,
            ..Default::default()
        })
    }

    #[test]
    fn grows_after_clean_window() {
        let mut s = scaler(true, 3, 1.0, 1);
        for _ in 0..2 {
            assert!(s.update(false));
            assert_eq!(s.scale(), 1024.0);
        }
        assert!(s.update(false));
        assert_eq!(s.scale(), 2048.0);
    }

    #[test]
    fn overflow_shrinks_and_skips() {
        let mut s = scaler(true, 1000, 1.0, 1);
        assert!(!s.update(true));
        assert_eq!(s.scale(), 512.0);
    }

    #[test]
    fn hysteresis_delays_the_shrink() {
        let mut s = scaler(true, 1000, 1.0, 2);
        assert!(!s.update(true));
        assert_eq!(s.scale(), 1024.0, "first overflow only burns hysteresis");
        assert!(!s.update(true));
        assert_eq!(s.scale(), 512.0);
    }

    #[test]
    fn never_below_min_scale() {
        let mut s = scaler(true, 1000, 256.0, 1);
        for _ in 0..20 {
            s.update(true);
            assert!(s.scale() >= 256.0);
        }
        assert_eq!(s.scale(), 256.0);
    }

    #[test]
    fn only_overflow_decreases_the_scale() {
        let mut s = scaler(true, 7, 1.0, 1);
        let mut last = s.scale();
        for i in 0..50 {
            s.update(i % 9 == 0);
            if s.scale() < last {
                assert_eq!(i % 9, 0, "scale dropped on a clean step");
            }
            last = s.scale();
        }
    }

    #[test]
    fn static_scale_is_frozen() {
        let mut s = scaler(false, 1, 1.0, 1);
        assert!(!s.update(true));
        assert!(s.update(false));
        assert_eq!(s.scale(), 1024.0);
    }

    #[test]
    fn clean_step_resets_overflow_count_window() {
        let mut s = scaler(true, 2, 1.0, 1);
        assert!(s.update(false));
        assert!(!s.update(true)); // window restarts
        assert!(s.update(false));
        assert_eq!(s.scale(), 512.0, "growth window must restart after overflow");
        assert!(s.update(false));
        assert_eq!(s.scale(), 1024.0);
    }
}
