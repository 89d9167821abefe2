use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::data::WindowAlignment;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size
    pub vocab_size: usize,
    /// Embedding dimension
    pub embedding_size: usize,
    /// Width of the LSTM hidden and cell state
    pub hidden_size: usize,
    /// Number of unrolled steps before backprop
    pub num_steps: usize,
    /// Number of parallel sequences per window
    pub batch_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 0,
            embedding_size: 50,
            hidden_size: 256,
            num_steps: 1,
            batch_size: 20,
        }
    }
}

impl ModelConfig {
    /// Small configuration for tests and smoke runs
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            embedding_size: 8,
            hidden_size: 16,
            num_steps: 2,
            batch_size: 2,
        }
    }

    /// Number of (input, target) pairs consumed per step.
    pub fn window(&self) -> usize {
        self.batch_size * self.num_steps
    }

    /// Parameter count: embedding, LSTM gates (two weight matrices plus two
    /// bias vectors per gate), and the output projection.
    pub fn num_parameters(&self) -> usize {
        let embed = self.vocab_size * self.embedding_size;
        let gates = 4 * self.hidden_size;
        let lstm = gates * self.embedding_size + gates * self.hidden_size + 2 * gates;
        let softmax = self.hidden_size * self.vocab_size + self.vocab_size;
        embed + lstm + softmax
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Config("vocab_size must be positive".into()));
        }
        for (name, value) in [
            ("embedding_size", self.embedding_size),
            ("hidden_size", self.hidden_size),
            ("num_steps", self.num_steps),
            ("batch_size", self.batch_size),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = crate::io::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = crate::io::create_file(path)?;
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Learning rate for Adam
    pub learning_rate: f64,
    /// Adam beta1
    pub beta1: f64,
    /// Adam beta2
    pub beta2: f64,
    /// Adam epsilon
    pub eps: f64,
    /// Number of training epochs
    pub num_epochs: usize,
    /// Keep probability for embedding dropout
    pub dropout_prob: f64,
    /// Report perplexity whenever the window start is a multiple of this many words
    pub eval_every: usize,
    /// Stop an epoch once the window start reaches this position
    pub max_train_position: Option<usize>,
    /// How training windows are laid over the corpus
    pub alignment: WindowAlignment,
    /// Seed for the device RNG (dropout, initialization). GPU devices only;
    /// the CPU backend cannot be seeded and logs a warning instead.
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            num_epochs: 1,
            dropout_prob: 0.5,
            eval_every: 10000,
            max_train_position: Some(20000),
            alignment: WindowAlignment::Full,
            seed: None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.dropout_prob.is_nan() || self.dropout_prob <= 0.0 || self.dropout_prob > 1.0 {
            return Err(Error::Config(format!(
                "dropout_prob is a keep probability in (0, 1], got {}",
                self.dropout_prob
            )));
        }
        if self.eval_every == 0 {
            return Err(Error::Config("eval_every must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Evaluate at most this many cloze cases
    pub max_clozes: Option<usize>,
    /// How windows are laid over each cloze passage
    pub alignment: WindowAlignment,
    /// Where per-blank diagnostics are written
    pub diagnostics_path: String,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            max_clozes: None,
            alignment: WindowAlignment::Full,
            diagnostics_path: "error_analysis.json".to_string(),
        }
    }
}
