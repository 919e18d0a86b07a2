//! Grouped AdamW with decoupled weight decay.
//!
//! candle's stock `AdamW` takes one flat parameter list and one decay rate,
//! but the harness needs the classic two-group split (decaying matrices vs
//! zero-decay norms/biases), so the update is implemented here over named
//! [`ParamGroup`]s.
//!
//! The optimizer also owns the gradient-accumulation buffers: candle's
//! `backward()` returns a fresh `GradStore` per call, so successive
//! micro-batches are summed here via [`AdamW::accumulate`] /
//! [`AdamW::accumulate_named`] until [`AdamW::step`] applies them and
//! [`AdamW::zero_grad`] clears them.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{bail, Result, Tensor, Var};

// ── Parameter groups ────────────────────────────────────────────────────────

/// Named set of parameters sharing one weight-decay coefficient.
pub struct ParamGroup {
    name: String,
    weight_decay: f64,
    params: Vec<(String, Var)>,
}

impl ParamGroup {
    /// An empty group is accepted silently.
    pub fn new(name: &str, weight_decay: f64, params: Vec<(String, Var)>) -> Self {
        Self {
            name: name.to_string(),
            weight_decay,
            params,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight_decay(&self) -> f64 {
        self.weight_decay
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

// ── AdamW ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ParamState {
    m: Option<Tensor>,
    v: Option<Tensor>,
    grad: Option<Tensor>,
}

/// AdamW over named parameter groups.
///
/// β₁ = 0.9, β₂ = 0.999, ε = 1e-8; the decay is decoupled
/// (`θ ← θ·(1 − lr·λ)` before the moment update is applied).
pub struct AdamW {
    groups: Vec<ParamGroup>,
    state: Vec<Vec<ParamState>>,
    index: HashMap<String, (usize, usize)>,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    updates: usize,
}

impl AdamW {
    /// Every trainable parameter must appear in exactly one group; the name
    /// index assumes group membership is disjoint.
    pub fn new(groups: Vec<ParamGroup>, lr: f64) -> Self {
        let mut index = HashMap::new();
        let mut state = Vec::with_capacity(groups.len());
        for (gi, group) in groups.iter().enumerate() {
            let mut group_state = Vec::with_capacity(group.params.len());
            for (pi, (name, _)) in group.params.iter().enumerate() {
                let prev = index.insert(name.clone(), (gi, pi));
                debug_assert!(prev.is_none(), "parameter {name} in more than one group");
                group_state.push(ParamState::default());
            }
            state.push(group_state);
        }
        Self {
            groups,
            state,
            index,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            updates: 0,
        }
    }

    /// Sum a backward pass's gradients into the accumulation buffers,
    /// matching parameters by tensor identity.
    pub fn accumulate(&mut self, grads: &GradStore) -> Result<()> {
        for (gi, group) in self.groups.iter().enumerate() {
            for (pi, (_, var)) in group.params.iter().enumerate() {
                if let Some(grad) = grads.get(var.as_tensor()) {
                    let slot = &mut self.state[gi][pi].grad;
                    *slot = Some(match slot.take() {
                        Some(prev) => (&prev + grad)?,
                        None => grad.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Sum one gradient into a parameter's buffer, matched by name. Used by
    /// the precision wrapper, whose gradients arrive keyed to the f16 model
    /// copies rather than to these master parameters.
    pub fn accumulate_named(&mut self, name: &str, grad: &Tensor) -> Result<()> {
        let Some(&(gi, pi)) = self.index.get(name) else {
            bail!("gradient for unknown parameter {name}");
        };
        let slot = &mut self.state[gi][pi].grad;
        *slot = Some(match slot.take() {
            Some(prev) => (&prev + grad)?,
            None => grad.clone(),
        });
        Ok(())
    }

    /// Apply one update from the accumulated gradients. Parameters with no
    /// buffered gradient are left untouched.
    pub fn step(&mut self) -> Result<()> {
        self.updates += 1;
        let t = self.updates as i32;
        let m_correction = 1.0 / (1.0 - self.beta1.powi(t));
        let v_correction = 1.0 / (1.0 - self.beta2.powi(t));

        let (groups, state) = (&self.groups, &mut self.state);
        for (group, group_state) in groups.iter().zip(state.iter_mut()) {
            let decay = 1.0 - self.lr * group.weight_decay;
            for ((_, var), st) in group.params.iter().zip(group_state.iter_mut()) {
                let Some(grad) = st.grad.as_ref() else {
                    continue;
                };
                let m = match st.m.take() {
                    Some(m) => (m.affine(self.beta1, 0.0)? + grad.affine(1.0 - self.beta1, 0.0)?)?,
                    None => grad.affine(1.0 - self.beta1, 0.0)?,
                };
                let v = match st.v.take() {
                    Some(v) => {
                        (v.affine(self.beta2, 0.0)? + grad.sqr()?.affine(1.0 - self.beta2, 0.0)?)?
                    }
                    None => grad.sqr()?.affine(1.0 - self.beta2, 0.0)?,
                };

                let m_hat = m.affine(m_correction, 0.0)?;
                let v_hat = v.affine(v_correction, 0.0)?;
                let denom = (v_hat.sqrt()? + self.eps)?;
                let delta = (m_hat.affine(self.lr, 0.0)? / denom)?;

                let mut theta = var.as_tensor().detach();
                if group.weight_decay != 0.0 {
                    theta = theta.affine(decay, 0.0)?;
                }
                var.set(&(theta - delta)?)?;

                st.m = Some(m);
                st.v = Some(v);
            }
        }
        Ok(())
    }

    /// Clear the accumulation buffers (moment estimates are kept).
    pub fn zero_grad(&mut self) {
        for group_state in &mut self.state {
            for st in group_state {
                st.grad = None;
            }
        }
    }

    /// Number of applied updates (skipped steps do not count).
    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Look a parameter up by name.
    pub fn get(&self, name: &str) -> Option<&Var> {
        self.index.get(name).map(|&(gi, pi)| &self.groups[gi].params[pi].1)
    }

    /// All `(name, parameter)` pairs across groups.
    pub fn named_params(&self) -> impl Iterator<Item = (&String, &Var)> {
        self.groups
            .iter()
            .flat_map(|g| g.params.iter().map(|(n, v)| (n, v)))
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
