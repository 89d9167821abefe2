pub mod config;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod io;
pub mod metrics;
pub mod model;
pub mod training;

pub use config::{EvalConfig, ModelConfig, TrainingConfig};
pub use data::{ClozeCase, ClozeSet, Corpus, Vocabulary, WindowAlignment};
pub use error::{Error, Result};
pub use evaluate::{BlankRecord, ClozeEvaluator, EvalReport};
pub use model::{LstmLanguageModel, Mode, RecurrentState, StepOutput};
pub use training::Trainer;
