//! Data-parallel model wrappers.
//!
//! [`DdpModel`] is the last stage of the setup pipeline. Without an
//! initialized process group it is the identity on the model. With one, it
//! synchronises gradients after every backward pass, in one of two shapes:
//!
//! * **Native** — gradients are packed into flat buckets capped at
//!   [`NATIVE_BUCKET_CAP_MB`], sum-all-reduced, then divided by world size.
//!   `gradient_as_bucket_view` hands the reduced gradients back as views
//!   into the flat bucket instead of copying them out.
//! * **Apex** — gradients are pre-divided by world size, then reduced in
//!   flat messages of at most [`APEX_MESSAGE_ELEMS`] elements, always after
//!   backward has fully completed.
//!
//! The reduction itself is one blocking call into the external
//! [`Collective`](crate::comm::Collective) backend per bucket/message.

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};

use crate::adapter::TrainModel;
use crate::comm::ProcessGroup;

/// Native-mode bucket cap, in megabytes of gradient payload.
pub const NATIVE_BUCKET_CAP_MB: usize = 100;

/// Apex-mode message size, in elements.
pub const APEX_MESSAGE_ELEMS: usize = 250_000_000;

// ── DdpModel ────────────────────────────────────────────────────────────────

/// The wrapped (or deliberately unwrapped) training model.
pub enum DdpModel {
    /// No process group was initialized: single-process training.
    Single(TrainModel),
    Native(NativeDdp),
    Apex(ApexDdp),
}

impl DdpModel {
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.inner().forward(input_ids)
    }

    /// Backward pass plus the mode's gradient synchronisation. All blocking
    /// happens inside this call.
    pub fn backward(&self, loss: &Tensor) -> Result<GradStore> {
        let mut grads = loss.backward()?;
        match self {
            Self::Single(_) => {}
            Self::Native(ddp) => ddp.reduce(&mut grads)?,
            Self::Apex(ddp) => ddp.reduce(&mut grads)?,
        }
        Ok(grads)
    }

    pub fn inner(&self) -> &TrainModel {
        match self {
            Self::Single(model) => model,
            Self::Native(ddp) => &ddp.inner,
            Self::Apex(ddp) => &ddp.inner,
        }
    }

    pub fn trainable_vars(&self) -> Vec<(String, Var)> {
        self.inner().trainable_vars()
    }
}

// ── Native mode ─────────────────────────────────────────────────────────────

/// Bucketed synchronous gradient averaging bound to one device slot.
pub struct NativeDdp {
    inner: TrainModel,
    group: ProcessGroup,
    local_rank: usize,
    bucket_cap_bytes: usize,
    gradient_as_bucket_view: bool,
}

impl NativeDdp {
    pub fn new(
        inner: TrainModel,
        group: ProcessGroup,
        local_rank: usize,
        gradient_as_bucket_view: bool,
    ) -> Self {
        Self {
            inner,
            group,
            local_rank,
            bucket_cap_bytes: NATIVE_BUCKET_CAP_MB * 1024 * 1024,
            gradient_as_bucket_view,
        }
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    /// Average gradients across the world, bucket by bucket.
    fn reduce(&self, grads: &mut GradStore) -> Result<()> {
        let world = self.group.world_size() as f64;
        let mut buckets = 0usize;
        for bucket in buckets_by_bytes(
            &self.inner.trainable_vars(),
            grads,
            self.bucket_cap_bytes,
        ) {
            let flat = pack(&bucket, grads)?;
            let reduced = self.group.all_reduce_sum(&flat)?.affine(1.0 / world, 0.0)?;
            unpack(&bucket, &reduced, grads, self.gradient_as_bucket_view)?;
            buckets += 1;
        }
        tracing::debug!(buckets, local_rank = self.local_rank, "gradients averaged");
        Ok(())
    }
}

// ── Apex mode ───────────────────────────────────────────────────────────────

/// Flat fixed-message reduction with pre-divided gradients, deferred until
/// backward has completed (which it has by the time [`DdpModel::backward`]
/// reaches the reduce).
pub struct ApexDdp {
    inner: TrainModel,
    group: ProcessGroup,
    message_elems: usize,
}

impl ApexDdp {
    pub fn new(inner: TrainModel, group: ProcessGroup) -> Self {
        Self {
            inner,
            group,
            message_elems: APEX_MESSAGE_ELEMS,
        }
    }

    fn reduce(&self, grads: &mut GradStore) -> Result<()> {
        let world = self.group.world_size() as f64;
        let mut messages = 0usize;
        for bucket in buckets_by_elems(
            &self.inner.trainable_vars(),
            grads,
            self.message_elems,
        ) {
            // Pre-divide so the sum across the world is already the average.
            let flat = pack(&bucket, grads)?.affine(1.0 / world, 0.0)?;
            let reduced = self.group.all_reduce_sum(&flat)?;
            unpack(&bucket, &reduced, grads, false)?;
            messages += 1;
        }
        tracing::debug!(messages, "gradients averaged");
        Ok(())
    }
}

// ── Bucketing helpers ───────────────────────────────────────────────────────

/// Group the vars that actually carry a gradient into buckets whose payload
/// stays under `cap_bytes` (a single oversized gradient still gets its own
/// bucket).
fn buckets_by_bytes(
    vars: &[(String, Var)],
    grads: &GradStore,
    cap_bytes: usize,
) -> Vec<Vec<Var>> {
    let mut buckets: Vec<Vec<Var>> = Vec::new();
    let mut current: Vec<Var> = Vec::new();
    let mut current_bytes = 0usize;
    for (_, var) in vars {
        let Some(grad) = grads.get(var.as_tensor()) else {
            continue;
        };
        let bytes = grad.elem_count() * grad.dtype().size_in_bytes();
        if !current.is_empty() && current_bytes + bytes > cap_bytes {
            buckets.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current.push(var.clone());
        current_bytes += bytes;
    }
    if !current.is_empty() {
        buckets.push(current);
    }
    buckets
}

fn buckets_by_elems(vars: &[(String, Var)], grads: &GradStore, cap_elems: usize) -> Vec<Vec<Var>> {
    let mut buckets: Vec<Vec<Var>> = Vec::new();
    let mut current: Vec<Var> = Vec::new();
    let mut current_elems = 0usize;
    for (_, var) in vars {
        let Some(grad) = grads.get(var.as_tensor()) else {
            continue;
        };
        let elems = grad.elem_count();
        if !current.is_empty() && current_elems + elems > cap_elems {
            buckets.push(std::mem::take(&mut current));
            current_elems = 0;
        }
        current.push(var.clone());
        current_elems += elems;
    }
    if !current.is_empty() {
        buckets.push(current);
    }
    buckets
}

/// Flatten and concatenate one bucket's gradients.
fn pack(bucket: &[Var], grads: &GradStore) -> Result<Tensor> {
    let mut flats = Vec::with_capacity(bucket.len());
    for var in bucket {
        match grads.get(var.as_tensor()) {
            Some(grad) => flats.push(grad.flatten_all()?),
            None => candle_core::bail!("bucketed parameter lost its gradient"),
        }
    }
    Tensor::cat(&flats, 0)
}

/// Slice the reduced flat tensor back into per-parameter gradients.
fn unpack(bucket: &[Var], reduced: &Tensor, grads: &mut GradStore, as_view: bool) -> Result<()> {
    let mut offset = 0usize;
    for var in bucket {
        let n = var.as_tensor().elem_count();
        let slice = reduced.narrow(0, offset, n)?.reshape(var.as_tensor().dims())?;
        let slice = if as_view { slice } else { slice.copy()? };
        grads.insert(var.as_tensor(), slice);
        offset += n;
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use candle_core::{DType, Device};

    use drivetrain_common::TrainConfig;
    use drivetrain_core::GptModel;

    use crate::comm::Collective;

    /// Simulates `world_size` workers that all computed identical gradients:
    /// the sum is `world_size ×` the local bucket.
    struct MirrorWorld {
        world_size: usize,
        calls: AtomicUsize,
    }

    impl Collective for MirrorWorld {
        fn world_size(&self) -> usize {
            self.world_size
        }

        fn rank(&self) -> usize {
            0
        }

        fn all_reduce_sum(&self, bucket: &Tensor) -> Result<Tensor> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            bucket.affine(self.world_size as f64, 0.0)
        }
    }

    fn tiny_model() -> TrainModel {
        let config = TrainConfig {
            vocab_size: 16,
            hidden_size: 8,
            num_heads: 2,
            num_layers: 1,
            max_seq_len: 8,
            ..Default::default()
        };
        TrainModel::Full(GptModel::new(&config, DType::F32, &Device::Cpu).unwrap())
    }

    fn loss_of(model: &TrainModel) -> Tensor {
        let ids = Tensor::zeros((1, 4), DType::U32, &Device::Cpu).unwrap();
        model.forward(&ids).unwrap().sum_all().unwrap()
    }

    fn grad_values(model: &DdpModel, grads: &GradStore) -> Vec<Vec<f32>> {
        model
            .trainable_vars()
            .iter()
            .filter_map(|(_, var)| grads.get(var.as_tensor()))
            .map(|g| g.flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn mirror_world_average_is_identity() {
        // Identical replicas: averaging must reproduce the local gradients.
        let model = tiny_model();
        let baseline = DdpModel::Single(model);
        let plain = baseline.backward(&loss_of(baseline.inner())).unwrap();
        let expected = grad_values(&baseline, &plain);

        let DdpModel::Single(model) = baseline else {
            unreachable!()
        };
        let world = Arc::new(MirrorWorld {
            world_size: 4,
            calls: AtomicUsize::new(0),
        });
        let ddp = DdpModel::Native(NativeDdp::new(
            model,
            ProcessGroup::new(world),
            0,
            false,
        ));
        let reduced = ddp.backward(&loss_of(ddp.inner())).unwrap();
        assert_eq!(grad_values(&ddp, &reduced), expected);
    }

    #[test]
    fn apex_prediv_matches_local_gradients() {
        let world = Arc::new(MirrorWorld {
            world_size: 2,
            calls: AtomicUsize::new(0),
        });
        let ddp = DdpModel::Apex(ApexDdp::new(tiny_model(), ProcessGroup::new(world)));

        // Identical replicas: pre-divide then sum must land back on the
        // local gradients.
        let loss = loss_of(ddp.inner());
        let plain = loss.backward().unwrap();
        let expected: Vec<Vec<f32>> = grad_values(&ddp, &plain);
        let reduced = ddp.backward(&loss).unwrap();
        assert_eq!(grad_values(&ddp, &reduced), expected);
    }

    #[test]
    fn bucket_view_returns_same_values() {
        let world = Arc::new(MirrorWorld {
            world_size: 2,
            calls: AtomicUsize::new(0),
        });
        let ddp = DdpModel::Native(NativeDdp::new(
            tiny_model(),
            ProcessGroup::new(world),
            0,
            true,
        ));
        let loss = loss_of(ddp.inner());
        let plain = loss.backward().unwrap();
        let expected = grad_values(&ddp, &plain);
        let reduced = ddp.backward(&loss).unwrap();
        assert_eq!(grad_values(&ddp, &reduced), expected);
    }

    #[test]
    fn probe_model() {
        for nl in [0usize, 1usize] {
            let config = TrainConfig {
                vocab_size: 16,
                hidden_size: 8,
                num_heads: 2,
                num_layers: nl,
                max_seq_len: 8,
                ..Default::default()
            };
            let m = GptModel::new(&config, DType::F32, &Device::Cpu).unwrap();
            let ids = Tensor::zeros((1, 4), DType::U32, &Device::Cpu).unwrap();
            let logits = m.forward(&ids).unwrap();
            let loss = logits.sum_all().unwrap();
            let g = loss.backward().unwrap();
            for (n, v) in m.trainable_vars() {
                eprintln!("PROBE2 nl={} {} grad={}", nl, n, g.get(v.as_tensor()).is_some());
            }
        }
    }

    #[test]
    fn probe_bmm() {
        let d = Device::Cpu;
        let w = Var::from_tensor(&Tensor::randn(0f32, 1.0, (3, 4), &d).unwrap()).unwrap();
        let x = Var::from_tensor(&Tensor::randn(0f32, 1.0, (2, 5, 3), &d).unwrap()).unwrap();
        let y = x.as_tensor().broadcast_matmul(w.as_tensor()).unwrap();
        let loss = y.sum_all().unwrap();
        let g = loss.backward().unwrap();
        eprintln!("PROBE bmm w={} x={}", g.get(w.as_tensor()).is_some(), g.get(x.as_tensor()).is_some());

        // transposed rhs
        let wt = Var::from_tensor(&Tensor::randn(0f32, 1.0, (4, 3), &d).unwrap()).unwrap();
        let y2 = x.as_tensor().broadcast_matmul(&wt.as_tensor().t().unwrap()).unwrap();
        let g2 = y2.sum_all().unwrap().backward().unwrap();
        eprintln!("PROBE bmmT wt={} x={}", g2.get(wt.as_tensor()).is_some(), g2.get(x.as_tensor()).is_some());

        // chain: x -> relu -> matmul, check x still gets grad through an op
        let y3 = x.as_tensor().relu().unwrap().broadcast_matmul(w.as_tensor()).unwrap();
        let g3 = y3.sum_all().unwrap().backward().unwrap();
        eprintln!("PROBE bmmChain x={}", g3.get(x.as_tensor()).is_some());

        // tied-weight reproduction: E used for index_select AND output matmul,
        // with an intermediate weight W in between.
        use candle_core::IndexOp;
        let e = Var::from_tensor(&Tensor::randn(0f32, 1.0, (8, 4), &d).unwrap()).unwrap();
        let ww = Var::from_tensor(&Tensor::randn(0f32, 1.0, (4, 4), &d).unwrap()).unwrap();
        let ids = Tensor::new(&[0u32, 1u32], &d).unwrap();
        let h = e.as_tensor().index_select(&ids, 0).unwrap(); // (2,4)
        let h2 = h.matmul(ww.as_tensor()).unwrap(); // (2,4)
        let out = h2.matmul(&e.as_tensor().t().unwrap()).unwrap(); // (2,8)
        let gt = out.sum_all().unwrap().backward().unwrap();
        eprintln!("PROBE tied E={} W={}", gt.get(e.as_tensor()).is_some(), gt.get(ww.as_tensor()).is_some());

        // tied E with an intermediate var P (like wpe) added, NO layer norm
        let p = Var::from_tensor(&Tensor::randn(0f32, 1.0, (2, 4), &d).unwrap()).unwrap();
        let xa = (h.clone() + p.as_tensor()).unwrap();
        let outa = xa.matmul(&e.as_tensor().t().unwrap()).unwrap();
        let ga = outa.sum_all().unwrap().backward().unwrap();
        eprintln!("PROBE tiedP E={} P={}", ga.get(e.as_tensor()).is_some(), ga.get(p.as_tensor()).is_some());

        // tied E -> layer_norm -> tied matmul
        use candle_nn::{LayerNorm, Module};
        let lnw = Var::from_tensor(&Tensor::ones((4,), DType::F32, &d).unwrap()).unwrap();
        let lnb = Var::from_tensor(&Tensor::zeros((4,), DType::F32, &d).unwrap()).unwrap();
        let ln = LayerNorm::new(lnw.as_tensor().clone(), lnb.as_tensor().clone(), 1e-5);
        let xc = ln.forward(&xa).unwrap();
        let outc = xc.matmul(&e.as_tensor().t().unwrap()).unwrap();
        let gc = outc.sum_all().unwrap().backward().unwrap();
        eprintln!("PROBE tiedLN E={} P={} lnw={} lnb={}",
            gc.get(e.as_tensor()).is_some(), gc.get(p.as_tensor()).is_some(),
            gc.get(lnw.as_tensor()).is_some(), gc.get(lnb.as_tensor()).is_some());

        // untied: layer_norm then matmul with a SEPARATE output weight
        let wout = Var::from_tensor(&Tensor::randn(0f32, 1.0, (4, 8), &d).unwrap()).unwrap();
        let xd = ln.forward(&xa).unwrap();
        let outd = xd.matmul(wout.as_tensor()).unwrap();
        let gd = outd.sum_all().unwrap().backward().unwrap();
        eprintln!("PROBE untiedLN lnw={} lnb={} wout={}",
            gd.get(lnw.as_tensor()).is_some(), gd.get(lnb.as_tensor()).is_some(),
            gd.get(wout.as_tensor()).is_some());

        // layer_norm alone, loss = sum(ln(xa))
        let xe = ln.forward(&xa).unwrap();
        let ge = xe.sum_all().unwrap().backward().unwrap();
        eprintln!("PROBE lnAlone lnw={} lnb={}",
            ge.get(lnw.as_tensor()).is_some(), ge.get(lnb.as_tensor()).is_some());

        // sanity: a var used in elementwise mul then sum
        let s = Var::from_tensor(&Tensor::ones((4,), DType::F32, &d).unwrap()).unwrap();
        let gs = xa.broadcast_mul(s.as_tensor()).unwrap().sum_all().unwrap().backward().unwrap();
        eprintln!("PROBE mulSum s={}", gs.get(s.as_tensor()).is_some());

        // manual layernorm using primitive ops
        let mean = xa.mean_keepdim(1).unwrap();
        let centered = xa.broadcast_sub(&mean).unwrap();
        let var = centered.sqr().unwrap().mean_keepdim(1).unwrap();
        let normed = centered.broadcast_div(&(var + 1e-5).unwrap().sqrt().unwrap()).unwrap();
        let manual = normed.broadcast_mul(lnw.as_tensor()).unwrap()
            .broadcast_add(lnb.as_tensor()).unwrap();
        let gm = manual.sum_all().unwrap().backward().unwrap();
        eprintln!("PROBE manualLN lnw={} lnb={}",
            gm.get(lnw.as_tensor()).is_some(), gm.get(lnb.as_tensor()).is_some());
    }

    #[test]
    fn small_cap_splits_into_multiple_buckets() {
        let world = Arc::new(MirrorWorld {
            world_size: 2,
            calls: AtomicUsize::new(0),
        });
        let ddp = NativeDdp {
            inner: tiny_model(),
            group: ProcessGroup::new(world.clone()),
            local_rank: 0,
            bucket_cap_bytes: 64,
            gradient_as_bucket_view: false,
        };
        let loss = loss_of(&ddp.inner);
        let mut grads = loss.backward().unwrap();
        ddp.reduce(&mut grads).unwrap();
        assert!(
            world.calls.load(Ordering::SeqCst) > 1,
            "a 64-byte cap must force several buckets"
        );
    }

    #[test]
    fn params_without_grads_are_skipped() {
        let model = tiny_model();
        let vars = model.trainable_vars();
        // A backward over an unrelated variable leaves the model's
        // parameters without gradients.
        let unrelated = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let grads = unrelated
            .as_tensor()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap();
        assert!(buckets_by_bytes(&vars, &grads, 1024).is_empty());
    }
}
