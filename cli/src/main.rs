use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use attention::Config as AttentionConfig;
use candle_core::{DType, Device, Tensor, D};
use clap::Parser;
use model::{ForwardOutput, ModelParams, Transformer, XfmrConfig, XfmrWeights};

fn main() {
    if let Err(err) = run() {
        eprintln!("xfmr failed: {:#}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Quantized-attention decoder runner", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Model config file (TOML or JSON); the tiny preset is used when omitted"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_delimiter = ',',
        required = true,
        help = "Comma-separated token ids, e.g. 1,2,3"
    )]
    tokens: Vec<u32>,

    #[arg(
        long,
        value_name = "N",
        help = "Tokens consumed by the first call; the rest are replayed one at a time"
    )]
    prefill: Option<usize>,

    #[arg(long, default_value_t = 0, help = "Seed for the random weights")]
    seed: u64,

    #[arg(long, default_value_t = 1, help = "Number of identical sequences per call")]
    batch: usize,
}

fn run() -> Result<()> {
    let args = Args::parse();
    if args.batch == 0 {
        bail!("--batch must be at least 1");
    }

    let config = match &args.config {
        Some(path) => XfmrConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => XfmrConfig {
            model: ModelParams::tiny(),
            attention: AttentionConfig::from_env(),
        },
    };

    let prefill = args.prefill.unwrap_or(args.tokens.len());
    if prefill == 0 || prefill > args.tokens.len() {
        bail!(
            "--prefill must be between 1 and the number of tokens ({}), got {}",
            args.tokens.len(),
            prefill
        );
    }

    let device = Device::Cpu;
    let weights = XfmrWeights::random(&config.model, args.seed, &device)
        .context("failed to build random weights")?;
    let model = Transformer::new(config.model.clone(), config.attention.clone(), &weights)?;
    let freqs = model.precompute_freqs(&device)?;
    let mut cache = model.new_cache(args.batch, &device)?;

    println!(
        "model: layers={} dim={} heads={}/{} vocab={} max_seq_len={} kernel={:?} causal={:?}",
        config.model.n_layers,
        config.model.dim,
        config.model.n_heads,
        config.model.n_kv_heads,
        config.model.vocab_size,
        config.model.max_seq_len,
        config.attention.kernel,
        config.attention.causal
    );

    let mut cur_pos = 0;
    let mut chunks = vec![&args.tokens[..prefill]];
    chunks.extend(args.tokens[prefill..].chunks(1));
    for (step, chunk) in chunks.into_iter().enumerate() {
        let ids = batch_tokens(chunk, args.batch, &device)?;
        let out = model
            .forward(&ids, cur_pos, &freqs, &mut cache, None)
            .with_context(|| format!("forward failed at position {cur_pos}"))?;
        report(step, cur_pos, &out)?;
        cur_pos += chunk.len();
    }

    Ok(())
}

fn batch_tokens(chunk: &[u32], batch: usize, device: &Device) -> Result<Tensor> {
    let data = chunk.repeat(batch);
    Ok(Tensor::from_vec(data, (batch, chunk.len()), device)?)
}

fn report(step: usize, cur_pos: usize, out: &ForwardOutput) -> Result<()> {
    let (_, seq, _) = out.logits.dims3()?;
    let argmax = out
        .logits
        .narrow(1, seq - 1, 1)?
        .squeeze(1)?
        .to_dtype(DType::F32)?
        .argmax(D::Minus1)?
        .to_vec1::<u32>()?;
    let entropy = out.stats.avg_entropy()?.to_vec1::<f32>()?;
    let varentropy = out.stats.avg_varentropy()?.to_vec1::<f32>()?;
    println!(
        "step {:>3} pos={:<4} logits={:?} argmax={:?} entropy={:.4} varentropy={:.4}",
        step,
        cur_pos,
        out.logits.dims(),
        argmax,
        entropy[0],
        varentropy[0]
    );
    Ok(())
}
