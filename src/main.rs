//! sae-recon-rs CLI: per-batch SAE reconstruction loss

use anyhow::{Context, Result};
use clap::Parser;
use sae_recon_rs::{
    csv_path, json_path, parse_dtype, EvalModel, ExperimentConfig, FeatureCodec,
    ReconstructionExperiment, ResultTable, RuntimeConfig, Sae,
};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sae-recon-rs")]
#[command(about = "Evaluate SAE reconstruction loss against clean and zero-ablated runs")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace` or a local directory
    #[arg(short, long, default_value = "meta-llama/Llama-3.2-1B")]
    model: String,

    /// SAE checkpoint directory (cfg.json + sae_weights.safetensors) or `HuggingFace` repo
    #[arg(short, long)]
    sae: String,

    /// Subfolder of the SAE repository holding the checkpoint
    #[arg(long)]
    sae_subfolder: Option<String>,

    /// Path to corpus JSON or JSON-lines file
    #[arg(short, long, default_value = "corpus/pile-10k.jsonl")]
    corpus: PathBuf,

    /// Number of texts evaluated after shuffling
    #[arg(long, default_value_t = 400)]
    sample_size: usize,

    /// Shuffle seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Tokens per sequence
    #[arg(long, default_value_t = 128)]
    max_length: usize,

    /// Sequences per forward pass
    #[arg(short, long, default_value_t = 8)]
    batch_size: usize,

    /// Output directory for results
    #[arg(short, long, default_value = "figures")]
    output: PathBuf,

    /// Prefix of the output file (defaults to the SAE architecture)
    #[arg(long)]
    run_id: Option<String>,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,

    /// Model dtype: f32, f16 or bf16 (default: bf16 on GPU, f32 on CPU)
    #[arg(long)]
    dtype: Option<String>,

    /// Exclude padding targets from the loss
    #[arg(long)]
    mask_padding: bool,

    /// Log progress every N batches
    #[arg(long, default_value_t = 10)]
    log_every: usize,

    /// Also write the table as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!("=== sae-recon-rs: SAE reconstruction loss ===");
    println!("Model:  {}", cli.model);
    println!("SAE:    {}", cli.sae);
    println!("Corpus: {}", cli.corpus.display());
    println!("Output: {}", cli.output.display());
    if cli.cpu {
        println!("Mode:   CPU (forced)");
    }

    let dtype = cli.dtype.as_deref().map(parse_dtype).transpose()?;
    let runtime = RuntimeConfig::select(cli.cpu, dtype)?;

    // Load model and SAE
    let model = EvalModel::from_pretrained(&cli.model, &runtime)?;
    info!("Model: {} layers, {} hidden", model.n_layers(), model.d_model());
    let sae = Sae::open(&cli.sae, cli.sae_subfolder.as_deref(), &runtime.device)?;
    info!(
        "Loaded SAE with d_in={}, d_sae={}, hook={}",
        sae.input_width(),
        sae.code_width(),
        sae.hook_name()
    );

    let config = ExperimentConfig {
        corpus_path: cli.corpus.clone(),
        sample_size: cli.sample_size,
        seed: cli.seed,
        max_length: cli.max_length,
        batch_size: cli.batch_size,
        mask_padding: cli.mask_padding,
        log_every: cli.log_every,
    };
    let pad_id = model
        .eos_token_id()
        .context("Tokenizer has no EOS token to pad with")?;
    let corpus = config.load_corpus(model.tokenizer(), pad_id)?;

    // Run experiment; whatever was collected is saved even on failure
    let experiment = ReconstructionExperiment::new(model.backend(), &sae, &runtime, config);
    let mut table = ResultTable::new();
    let outcome = experiment.run(&corpus, &mut table);
    if outcome.is_err() {
        error!("Run aborted after {} batches", table.len());
    }

    let run_id = cli
        .run_id
        .clone()
        .unwrap_or_else(|| sae.architecture().to_string());
    let results_path = csv_path(&cli.output, &run_id);
    let results = table.save_run(&results_path, outcome)?;
    info!("{} rows saved to {}", table.len(), results_path.display());
    if cli.json {
        let path = json_path(&cli.output, &run_id);
        table.write_json(&path)?;
        info!("JSON saved to {}", path.display());
    }

    // Print results
    println!("\n=== Results ===");
    println!("Batches:          {}", results.n_batches);
    println!("Mean orig loss:   {:.4}", results.mean_orig_loss);
    println!("Mean reconstr:    {:.4}", results.mean_reconstr_loss);
    println!("Mean zero-abl:    {:.4}", results.mean_zero_loss);
    println!("Peak batch bytes: {}", results.peak_working_set_bytes);

    Ok(())
}
