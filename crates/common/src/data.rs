//! Data pipeline: byte-level text loading and batching.
//!
//! The harness trains on raw bytes (vocabulary 256), so no tokeniser file is
//! needed. Batches are `(batch_size, seq_len)` token IDs; labels for
//! next-token prediction are the inputs shifted by one position.
//!
//! * **[`TextDataset`]** — load a text file into memory; call
//!   [`TextDataset::batches`].
//! * **[`batch_to_tensors`]** — raw batch → Candle tensors.

use std::path::Path;

use anyhow::{bail, Context, Result as AnyhowResult};
use candle_core::{DType, Device, Result, Tensor};

// ── TextDataset ─────────────────────────────────────────────────────────────

/// In-memory dataset over a byte stream, sliced into fixed-length sequences.
pub struct TextDataset {
    token_ids: Vec<u32>,
    seq_len: usize,
}

impl TextDataset {
    /// Read a file and treat each byte as one token.
    pub fn from_file(path: &Path, seq_len: usize) -> AnyhowResult<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read dataset {}", path.display()))?;
        let token_ids = bytes.into_iter().map(u32::from).collect();
        Self::from_tokens(token_ids, seq_len)
    }

    /// Wrap an already-tokenised stream.
    pub fn from_tokens(token_ids: Vec<u32>, seq_len: usize) -> AnyhowResult<Self> {
        if seq_len == 0 {
            bail!("seq_len must be >= 1");
        }
        // One extra token is needed for the shifted labels.
        if token_ids.len() < seq_len + 1 {
            bail!(
                "dataset too small: {} tokens for seq_len {}",
                token_ids.len(),
                seq_len
            );
        }
        Ok(Self { token_ids, seq_len })
    }

    /// Number of non-overlapping sequences available.
    pub fn num_sequences(&self) -> usize {
        (self.token_ids.len() - 1) / self.seq_len
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Iterate `(input_ids, labels)` batches, each flat `batch_size × seq_len`.
    /// A trailing partial batch is dropped.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = (Vec<u32>, Vec<u32>)> + '_ {
        let seq_len = self.seq_len;
        let per_batch = batch_size * seq_len;
        let num_batches = if per_batch == 0 {
            0
        } else {
            (self.token_ids.len().saturating_sub(1)) / per_batch
        };
        (0..num_batches).map(move |b| {
            let start = b * per_batch;
            let inputs = self.token_ids[start..start + per_batch].to_vec();
            let labels = self.token_ids[start + 1..start + per_batch + 1].to_vec();
            (inputs, labels)
        })
    }
}

/// Convert one flat batch into `(input_ids, labels)` tensors of shape
/// `(batch_size, seq_len)`.
pub fn batch_to_tensors(
    input_ids: &[u32],
    labels: &[u32],
    batch_size: usize,
    seq_len: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let inputs = Tensor::from_slice(input_ids, (batch_size, seq_len), device)?;
    let labels = Tensor::from_slice(labels, (batch_size, seq_len), device)?.to_dtype(DType::U32)?;
    Ok((inputs, labels))
}

// ── Tests ───────────────────────────────────────────────────────────────────
