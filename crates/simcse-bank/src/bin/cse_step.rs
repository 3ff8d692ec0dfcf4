//! Runs one contrastive step on a synthetic batch.
//!
//! Builds a `LookupEncoder`, a memory bank and a random token batch, then
//! performs one contrastive forward/backward pass and one sentence-embedding
//! pass. No optimizer step is taken.
//!
//! # Usage
//!
//! ```bash
//! cse-step --batch-size 8 --seq-len 32
//! cse-step --config simcse.toml --views 3 --seed 7
//! RUST_LOG=simcse_bank=debug cse-step
//! ```

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use simcse_bank::training::loss::tensor_to_f32;
use simcse_bank::{
    ContrastiveError, ContrastiveModel, ContrastiveResult, Encoder, LookupEncoder,
    LookupEncoderConfig, MaskedTokenPredictor, MemoryBank, ModelArgs, ModelOutput, TokenBatch,
};

const VOCAB_SIZE: usize = 1000;
const MASK_TOKEN_ID: u32 = 103;
const MASK_PROBABILITY: f64 = 0.15;

/// CLI arguments.
struct Args {
    /// Optional TOML file with `ModelArgs`.
    config: Option<PathBuf>,
    batch_size: usize,
    seq_len: usize,
    /// 2 (anchor + positive) or 3 (plus augmented view).
    views: usize,
    seed: u64,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: None,
            batch_size: 4,
            seq_len: 16,
            views: 2,
            seed: 42,
        }
    }
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    result.config = Some(PathBuf::from(&args[i]));
                }
            }
            "--batch-size" | "-b" => {
                i += 1;
                if i < args.len() {
                    result.batch_size = args[i].parse().unwrap_or(4);
                }
            }
            "--seq-len" | "-s" => {
                i += 1;
                if i < args.len() {
                    result.seq_len = args[i].parse().unwrap_or(16);
                }
            }
            "--views" => {
                i += 1;
                if i < args.len() {
                    result.views = args[i].parse().unwrap_or(2);
                }
            }
            "--seed" => {
                i += 1;
                if i < args.len() {
                    result.seed = args[i].parse().unwrap_or(42);
                }
            }
            "--help" | "-h" => {
                println!("cse-step: one contrastive training step on synthetic data");
                println!();
                println!("Usage: cse-step [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <PATH>      ModelArgs TOML file (default: built-in defaults)");
                println!("  -b, --batch-size <N>     Sentences per view (default: 4)");
                println!("  -s, --seq-len <N>        Tokens per sentence (default: 16)");
                println!("      --views <2|3>        Views per example (default: 2)");
                println!("      --seed <N>           Random seed (default: 42)");
                println!("  -h, --help               Show this help");
                println!();
                println!("Environment: SIMCSE_* overrides ModelArgs fields, RUST_LOG sets the log filter.");
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    result
}

/// Random ids with the CLS id at position 0 and right padding on every other row.
fn synthetic_batch(
    cli: &Args,
    cls_token_id: u32,
    rng: &mut StdRng,
    device: &Device,
) -> ContrastiveResult<TokenBatch> {
    let rows = cli.batch_size * cli.views;
    let mut ids = Vec::with_capacity(rows * cli.seq_len);
    let mut mask = Vec::with_capacity(rows * cli.seq_len);
    for row in 0..rows {
        let length = if row % 2 == 0 {
            cli.seq_len
        } else {
            rng.gen_range(1..=cli.seq_len)
        };
        for pos in 0..cli.seq_len {
            let real = pos < length;
            let id = match (pos, real) {
                (0, _) => cls_token_id,
                (_, true) => rng.gen_range(0..VOCAB_SIZE as u32),
                (_, false) => 0,
            };
            ids.push(id);
            mask.push(u32::from(real));
        }
    }
    let shape = (cli.batch_size, cli.views, cli.seq_len);
    let input_ids = Tensor::from_vec(ids, shape, device).map_err(|e| tensor_error("batch ids", e))?;
    let attention_mask =
        Tensor::from_vec(mask, shape, device).map_err(|e| tensor_error("batch mask", e))?;
    TokenBatch::new(input_ids, attention_mask)
}

/// Replace a random 15% of non-CLS real tokens with the mask id.
fn masked_copy(batch: &TokenBatch, rng: &mut StdRng) -> ContrastiveResult<Tensor> {
    let dims = batch.input_ids.dims().to_vec();
    let seq_len = dims.last().copied().unwrap_or(0);
    let ids: Vec<u32> = batch
        .input_ids
        .flatten_all()
        .and_then(|t| t.to_vec1())
        .map_err(|e| tensor_error("mlm ids", e))?;
    let masked: Vec<u32> = ids
        .into_iter()
        .enumerate()
        .map(|(i, id)| {
            if i % seq_len != 0 && id != 0 && rng.gen_bool(MASK_PROBABILITY) {
                MASK_TOKEN_ID
            } else {
                id
            }
        })
        .collect();
    Tensor::from_vec(masked, dims, batch.input_ids.device()).map_err(|e| tensor_error("mlm ids", e))
}

fn tensor_error(op: &str, e: candle_core::Error) -> ContrastiveError {
    ContrastiveError::TensorError {
        message: format!("{}: {}", op, e),
    }
}

fn run(cli: &Args) -> ContrastiveResult<()> {
    let model_args = match &cli.config {
        Some(path) => ModelArgs::from_file(path)?,
        None => ModelArgs::default(),
    }
    .with_env_overrides()?;
    model_args.validate()?;

    if cli.batch_size == 0 || cli.seq_len == 0 || !(2..=3).contains(&cli.views) {
        return Err(ContrastiveError::ConfigError {
            message: format!(
                "need batch_size > 0, seq_len > 0 and 2 or 3 views (got {}, {}, {})",
                cli.batch_size, cli.seq_len, cli.views
            ),
        });
    }

    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(cli.seed);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let encoder = LookupEncoder::new(
        LookupEncoderConfig {
            vocab_size: VOCAB_SIZE,
            hidden_size: model_args.hidden_len,
            max_position_embeddings: cli.seq_len.max(128),
            seed: cli.seed,
            ..LookupEncoderConfig::default()
        },
        vb.pp("encoder"),
    )?;
    let predictor = encoder.predictor();
    let model = ContrastiveModel::new(encoder, model_args.clone(), vb)?;
    let mut bank = MemoryBank::from_args(&model_args, &device)?;

    let batch = synthetic_batch(cli, model_args.cls_token_id, &mut rng, &device)?;
    let mlm_input_ids = if model_args.do_mlm {
        Some(masked_copy(&batch, &mut rng)?)
    } else {
        None
    };

    tracing::info!(
        batch_size = cli.batch_size,
        views = cli.views,
        seq_len = cli.seq_len,
        hidden = model.encoder().hidden_size(),
        vocab = predictor.vocab_size(),
        "Running contrastive step"
    );

    let output = model.cl_forward(
        &batch,
        mlm_input_ids.as_ref(),
        &mut bank,
        mlm_input_ids.as_ref().map(|_| &predictor as &dyn MaskedTokenPredictor),
        Some(true),
    )?;
    let ModelOutput::Contrastive(output) = output else {
        return Err(ContrastiveError::ShapeMismatch {
            context: "contrastive pass returned a tuple".to_string(),
        });
    };

    let loss = tensor_to_f32(&output.loss)?;
    let contrastive = tensor_to_f32(&output.contrastive_loss)?;
    let bank_loss = output.bank_loss.as_ref().map(tensor_to_f32).transpose()?;

    let grads = output
        .loss
        .backward()
        .map_err(|e| tensor_error("backward", e))?;
    let vars = varmap.all_vars();
    let trained = vars.iter().filter(|v| grads.get(v.as_tensor()).is_some()).count();

    println!("loss:             {:.6}", loss);
    println!("contrastive loss: {:.6}", contrastive);
    match bank_loss {
        Some(ld) => println!("bank loss:        {:.6}", ld),
        None => println!("bank loss:        (disabled)"),
    }
    println!("logits:           {:?}", output.logits.dims());
    println!("bank ptr:         {} / {}", bank.ptr(), bank.bank_size());
    println!("vars with grads:  {} / {}", trained, vars.len());

    let single = batch.view(0)?;
    let embeddings = model.embed(&single)?;
    println!("sentence vectors: {:?}", embeddings.dims());

    tracing::info!(loss, bank_ptr = bank.ptr(), "Step complete");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = parse_args();

    println!("=== Contrastive Step ===");
    println!("Batch size: {}", cli.batch_size);
    println!("Seq len:    {}", cli.seq_len);
    println!("Views:      {}", cli.views);
    println!("Seed:       {}", cli.seed);
    println!();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
