//! Byte-level pre-training driver over the adapter pipeline.
//!
//! Stands in for the surrounding training framework: owns the CLI, logging
//! init, and the epoch loop; everything between "model built" and "loss
//! computed" goes through the adapter.

use std::path::PathBuf;

use anyhow::{ensure, Result};
use candle_core::{DType, Device};
use clap::Parser;

use drivetrain_common::{batch_to_tensors, TextDataset, TrainConfig};
use drivetrain_core::GptModel;
use drivetrain_harness::{backward, setup};

#[derive(Parser, Debug)]
#[command(name = "pretrain", about = "Train a byte-level GPT through the drivetrain harness")]
struct Args {
    /// Run configuration (JSON). Created with defaults if absent.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Training text; every byte is one token.
    #[arg(long)]
    data: PathBuf,
    #[arg(long, default_value = "8")]
    batch_size: usize,
    #[arg(long, default_value = "1000")]
    max_steps: usize,
    #[arg(long, default_value = "50")]
    log_every: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = if args.config.exists() {
        TrainConfig::load(&args.config)?
    } else {
        let default = TrainConfig::default();
        default.save(&args.config)?;
        eprintln!("Created default config at {}", args.config.display());
        default
    };
    config.validate()?;

    let device = Device::cuda_if_available(0)?;

    let dataset = TextDataset::from_file(&args.data, config.max_seq_len)?;
    ensure!(
        dataset.num_sequences() >= args.batch_size,
        "dataset too small for batch_size {}",
        args.batch_size
    );
    tracing::info!(sequences = dataset.num_sequences(), "dataset loaded");

    let model = GptModel::new(&config, DType::F32, &device)?;
    tracing::info!(params = model.num_params(), "model built");

    // Single-process run: no launcher initialized a process group.
    let (model, mut optimizer) = setup(&config, model, None)?;

    let mut step = 0usize;
    'training: loop {
        for (inputs, labels) in dataset.batches(args.batch_size) {
            if step >= args.max_steps {
                break 'training;
            }
            step += 1;

            let (input_ids, labels) = batch_to_tensors(
                &inputs,
                &labels,
                args.batch_size,
                config.max_seq_len,
                &device,
            )?;
            let logits = model.forward(&input_ids)?;
            let (b, t, v) = logits.dims3()?;
            let loss = candle_nn::loss::cross_entropy(
                &logits.reshape((b * t, v))?,
                &labels.reshape((b * t,))?,
            )?;

            backward(&config, step, &loss, &model, &mut optimizer)?;

            if step % args.log_every == 0 {
                tracing::info!(
                    step,
                    loss = loss.to_scalar::<f32>()?,
                    updates = optimizer.updates(),
                    "train"
                );
            }
        }
    }

    tracing::info!(steps = step, updates = optimizer.updates(), "training finished");
    Ok(())
}
