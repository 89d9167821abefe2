use anyhow::Result;
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

use hermes_lstm::config::{EvalConfig, ModelConfig, TrainingConfig};
use hermes_lstm::data::{ClozeSet, Corpus, Vocabulary, WindowAlignment};
use hermes_lstm::evaluate::{ClozeEvaluator, EvalReport};
use hermes_lstm::metrics::display_metric;
use hermes_lstm::training::Trainer;

#[derive(Parser)]
#[command(name = "hermes-lstm")]
#[command(version, about = "Train an LSTM word language model and score it on cloze tests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ModelArgs {
    /// Number of unrolled steps before backprop
    #[arg(long, default_value = "1")]
    num_steps: usize,

    /// Size of the embeddings
    #[arg(long, default_value = "50")]
    embedding_size: usize,

    /// Size of the LSTM layer
    #[arg(long, default_value = "256")]
    hidden_size: usize,

    /// Batch size
    #[arg(short, long, default_value = "20")]
    batch_size: usize,
}

impl ModelArgs {
    /// Loads `config` when given, otherwise builds the config from the flags.
    fn resolve(self, config: Option<&Path>, vocab_size: usize) -> Result<ModelConfig> {
        let Some(path) = config else {
            return Ok(self.into_config(vocab_size));
        };
        let config = ModelConfig::from_json(path)?;
        if config.vocab_size != vocab_size {
            anyhow::bail!(
                "{} expects {} tokens but the vocabulary has {}",
                path.display(),
                config.vocab_size,
                vocab_size
            );
        }
        Ok(config)
    }

    fn into_config(self, vocab_size: usize) -> ModelConfig {
        ModelConfig {
            vocab_size,
            embedding_size: self.embedding_size,
            hidden_size: self.hidden_size,
            num_steps: self.num_steps,
            batch_size: self.batch_size,
        }
    }
}

#[derive(Args)]
struct EvalArgs {
    /// Path to cloze cases (JSONL)
    #[arg(long)]
    clozes: PathBuf,

    /// Evaluate only the first N cloze cases
    #[arg(long)]
    max_clozes: Option<usize>,

    /// Window alignment over cloze passages
    #[arg(long, value_enum, default_value = "full")]
    alignment: Alignment,

    /// Where to write per-blank diagnostics (.gz / .zst to compress)
    #[arg(long, default_value = "error_analysis.json")]
    diagnostics: String,
}

impl EvalArgs {
    fn config(&self) -> EvalConfig {
        EvalConfig {
            max_clozes: self.max_clozes,
            alignment: self.alignment.into(),
            diagnostics_path: self.diagnostics.clone(),
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Alignment {
    Full,
    Strict,
}

impl From<Alignment> for WindowAlignment {
    fn from(a: Alignment) -> Self {
        match a {
            Alignment::Full => WindowAlignment::Full,
            Alignment::Strict => WindowAlignment::Strict,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Train on a corpus, then evaluate on cloze cases
    Train {
        /// Path to the training corpus (JSON array of token ids)
        #[arg(long)]
        corpus: PathBuf,

        /// Path to the vocabulary (JSON object of token -> id)
        #[arg(long)]
        vocab: PathBuf,

        #[command(flatten)]
        eval: EvalArgs,

        #[command(flatten)]
        model: ModelArgs,

        /// Model config JSON; replaces the model flags when given
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of training epochs
        #[arg(short, long, default_value = "1")]
        epochs: usize,

        /// Learning rate for Adam
        #[arg(long, default_value = "1e-4")]
        lr: f64,

        /// Adam beta1
        #[arg(long, default_value = "0.9")]
        beta1: f64,

        /// Adam beta2
        #[arg(long, default_value = "0.999")]
        beta2: f64,

        /// Adam epsilon
        #[arg(long, default_value = "1e-8")]
        eps: f64,

        /// Keep probability for dropout
        #[arg(long, default_value = "0.5")]
        dropout_prob: f64,

        /// Print statistics every N words
        #[arg(long, default_value = "10000")]
        eval_every: usize,

        /// Stop each epoch once this word position is reached (0 disables)
        #[arg(long, default_value = "20000")]
        max_train_position: usize,

        /// Window alignment over the training corpus
        #[arg(long, value_enum, default_value = "full")]
        train_alignment: Alignment,

        /// Seed for the device RNG (GPU only; ignored with a warning on CPU)
        #[arg(long)]
        seed: Option<u64>,

        /// Directory for checkpoints and the model config
        #[arg(long, alias = "output")]
        checkpoint: Option<PathBuf>,

        /// Use GPU (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long, default_value = "false")]
        gpu: bool,
    },

    /// Evaluate a saved checkpoint on cloze cases
    Evaluate {
        /// Path to model checkpoint (.safetensors)
        #[arg(short, long)]
        checkpoint: PathBuf,

        /// Path to model config
        #[arg(long)]
        config: PathBuf,

        /// Path to the vocabulary (JSON object of token -> id)
        #[arg(long)]
        vocab: PathBuf,

        #[command(flatten)]
        eval: EvalArgs,

        /// Use GPU (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long, default_value = "false")]
        gpu: bool,
    },

    /// Show model size
    Info {
        /// Vocabulary size
        #[arg(long, default_value = "10000")]
        vocab_size: usize,

        #[command(flatten)]
        model: ModelArgs,
    },
}

#[allow(unused_variables)]
fn get_device(use_gpu: bool, gpu_id: usize) -> Result<Device> {
    if use_gpu {
        #[cfg(feature = "metal")]
        {
            return Ok(Device::new_metal(gpu_id)?);
        }
        #[cfg(feature = "cuda")]
        {
            return Ok(Device::new_cuda(gpu_id)?);
        }
        #[cfg(not(any(feature = "metal", feature = "cuda")))]
        {
            tracing::warn!(
                "No GPU feature enabled, using CPU. Build with --features metal or --features cuda"
            );
            return Ok(Device::Cpu);
        }
    }
    Ok(Device::Cpu)
}

fn run_evaluation(trainer: &Trainer, vocab: &Vocabulary, eval: &EvalArgs) -> Result<()> {
    let eval_config = eval.config();
    let clozes = ClozeSet::from_file(&eval.clozes, vocab.len())?;
    let evaluator = ClozeEvaluator::new(trainer.model(), vocab.blank_id(), &eval_config);
    let report = evaluator.evaluate(&clozes)?;
    write_report(&report, Path::new(&eval_config.diagnostics_path))
}

fn write_report(report: &EvalReport, diagnostics: &Path) -> Result<()> {
    report.save_diagnostics(diagnostics)?;
    info!(
        "Saved {} blank records to {}",
        report.records.len(),
        diagnostics.display()
    );

    println!("Test Perplexity: {}", display_metric(report.perplexity()));
    println!("Blank Accuracy: {}", display_metric(report.accuracy()));
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hermes_lstm=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            corpus,
            vocab,
            eval,
            model,
            config,
            epochs,
            lr,
            beta1,
            beta2,
            eps,
            dropout_prob,
            eval_every,
            max_train_position,
            train_alignment,
            seed,
            checkpoint,
            gpu,
        } => {
            let device = get_device(gpu, 0)?;
            info!("Using device: {:?}", device);

            let vocab = Vocabulary::from_file(&vocab)?;
            let corpus = Corpus::from_file(&corpus)?;

            let config = model.resolve(config.as_deref(), vocab.len())?;
            info!("Model config: {:?}", config);

            let training_config = TrainingConfig {
                learning_rate: lr,
                beta1,
                beta2,
                eps,
                num_epochs: epochs,
                dropout_prob,
                eval_every,
                max_train_position: (max_train_position > 0).then_some(max_train_position),
                alignment: train_alignment.into(),
                seed,
                ..Default::default()
            };

            let mut trainer = Trainer::new(config.clone(), training_config, device)?;

            if let Some(dir) = &checkpoint {
                std::fs::create_dir_all(dir)?;
                let path = dir.join("config.json");
                config.save_json(&path)?;
                info!("Saved config to {}", path.display());
            }

            trainer.train(&corpus, checkpoint.as_deref())?;
            info!("Training complete!");

            run_evaluation(&trainer, &vocab, &eval)?;
        }

        Commands::Evaluate {
            checkpoint,
            config,
            vocab,
            eval,
            gpu,
        } => {
            let device = get_device(gpu, 0)?;
            info!("Using device: {:?}", device);

            let vocab = Vocabulary::from_file(&vocab)?;
            let config = ModelConfig::from_json(&config)?;
            if config.vocab_size != vocab.len() {
                anyhow::bail!(
                    "checkpoint vocabulary has {} tokens but {} were loaded",
                    config.vocab_size,
                    vocab.len()
                );
            }

            let mut trainer = Trainer::new(config, TrainingConfig::default(), device)?;
            trainer.load_checkpoint(&checkpoint)?;
            info!("Loaded model from {}", checkpoint.display());

            run_evaluation(&trainer, &vocab, &eval)?;
        }

        Commands::Info { vocab_size, model } => {
            let config = model.into_config(vocab_size);
            println!("Model: embedding -> LSTM -> softmax");
            println!("  Vocab size: {}", config.vocab_size);
            println!("  Embedding size: {}", config.embedding_size);
            println!("  Hidden size: {}", config.hidden_size);
            println!("  Num steps: {}", config.num_steps);
            println!("  Batch size: {}", config.batch_size);
            println!("  Window: {} words", config.window());
            let total = config.num_parameters();
            println!(
                "  Parameters: {} ({:.2}M)",
                total,
                total as f64 / 1_000_000.0
            );
        }
    }

    Ok(())
}
