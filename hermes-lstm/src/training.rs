use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::{ModelConfig, TrainingConfig};
use crate::data::{Corpus, windows, window_tensors};
use crate::error::{Error, Result};
use crate::metrics::{LossAccumulator, display_metric};
use crate::model::{LstmLanguageModel, Mode, RecurrentState};

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ppl: {msg}")
    {
        pb.set_style(style.progress_chars("##-"));
    }
    pb
}

/// One periodic perplexity report within an epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub epoch: usize,
    pub start: usize,
    pub end: usize,
    pub perplexity: Option<f64>,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Windows trained on, including the one that hit the position cap
    pub windows: usize,
    pub perplexity: Option<f64>,
    pub reports: Vec<ProgressReport>,
}

pub struct Trainer {
    model: LstmLanguageModel,
    optimizer: AdamW,
    var_map: VarMap,
    config: ModelConfig,
    training_config: TrainingConfig,
    device: Device,
    global_step: usize,
}

impl Trainer {
    pub fn new(config: ModelConfig, training_config: TrainingConfig, device: Device) -> Result<Self> {
        config.validate()?;
        training_config.validate()?;

        if let Some(seed) = training_config.seed
            && let Err(e) = device.set_seed(seed)
        {
            warn!("Could not seed {:?}: {}", device, e);
        }

        let var_map = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let model = LstmLanguageModel::new(&config, vb)?;

        let params = ParamsAdamW {
            lr: training_config.learning_rate,
            beta1: training_config.beta1,
            beta2: training_config.beta2,
            eps: training_config.eps,
            weight_decay: 0.0,
        };
        let optimizer = AdamW::new(var_map.all_vars(), params)?;

        info!(
            "Initialized model with {} parameters",
            config.num_parameters()
        );

        Ok(Self {
            model,
            optimizer,
            var_map,
            config,
            training_config,
            device,
            global_step: 0,
        })
    }

    /// Forward pass with dropout, loss, and one Adam update. Returns the
    /// window loss and the detached state for the next window.
    pub fn train_step(
        &mut self,
        inputs: &Tensor,
        targets: &Tensor,
        state: &RecurrentState,
        position: usize,
    ) -> Result<(f64, RecurrentState)> {
        let mode = Mode::Train {
            keep_prob: self.training_config.dropout_prob,
        };
        let out = self.model.step(inputs, targets, state, mode)?;

        let loss = out.loss.to_scalar::<f32>()? as f64;
        if !loss.is_finite() {
            return Err(Error::NonFiniteLoss { position });
        }

        self.optimizer.backward_step(&out.loss)?;
        self.global_step += 1;

        Ok((loss, out.state.detach()))
    }

    pub fn train_epoch(&mut self, epoch: usize, corpus: &Corpus) -> Result<EpochSummary> {
        let (batch_size, num_steps) = (self.config.batch_size, self.config.num_steps);
        let window = self.config.window();
        let alignment = self.training_config.alignment;
        let num_windows = windows(corpus.num_pairs(), window, alignment).count();

        let pb = progress_bar(num_windows);
        let start_time = Instant::now();
        let mut state = self.model.zero_state()?;
        let mut running = LossAccumulator::default();
        let mut total = LossAccumulator::default();
        let mut reports = Vec::new();
        let mut trained = 0;

        for w in windows(corpus.num_pairs(), window, alignment) {
            let (inputs, targets) =
                window_tensors(corpus.tokens(), w, batch_size, num_steps, &self.device)?;
            let (loss, next) = self.train_step(&inputs, &targets, &state, w.start)?;
            state = next;

            running.add(loss, num_steps);
            total.add(loss, num_steps);
            trained += 1;
            pb.inc(1);

            if let Some(limit) = self.training_config.max_train_position
                && w.start >= limit
            {
                pb.suspend(|| info!("Epoch {} stopped at position {}", epoch, w.start));
                break;
            }

            if w.start % self.training_config.eval_every == 0 {
                let report = ProgressReport {
                    epoch,
                    start: w.start,
                    end: w.end,
                    perplexity: running.perplexity(),
                    elapsed_secs: start_time.elapsed().as_secs_f64(),
                };
                pb.suspend(|| {
                    info!(
                        "Epoch {} Words {}>{} Perplexity: {}. {:.2} seconds",
                        report.epoch,
                        report.start,
                        report.end,
                        display_metric(report.perplexity),
                        report.elapsed_secs
                    )
                });
                pb.set_message(display_metric(report.perplexity));
                reports.push(report);
                running.reset();
            }
        }

        pb.finish_with_message("done");

        Ok(EpochSummary {
            epoch,
            windows: trained,
            perplexity: total.perplexity(),
            reports,
        })
    }

    /// Trains for the configured number of epochs, saving a checkpoint after
    /// each one when `checkpoint_dir` is given.
    pub fn train(
        &mut self,
        corpus: &Corpus,
        checkpoint_dir: Option<&Path>,
    ) -> Result<Vec<EpochSummary>> {
        corpus.validate(self.config.vocab_size)?;
        let window = self.config.window();
        if windows(corpus.num_pairs(), window, self.training_config.alignment)
            .next()
            .is_none()
        {
            return Err(Error::Config(format!(
                "corpus of {} tokens does not fill a single window of {} (batch_size * num_steps)",
                corpus.tokens().len(),
                window
            )));
        }

        info!(
            "Starting training for {} epochs",
            self.training_config.num_epochs
        );

        let mut summaries = Vec::with_capacity(self.training_config.num_epochs);
        for epoch in 0..self.training_config.num_epochs {
            let summary = self.train_epoch(epoch, corpus)?;
            info!(
                "Epoch {} train perplexity: {}",
                epoch,
                display_metric(summary.perplexity)
            );

            if let Some(dir) = checkpoint_dir {
                let path = dir.join(format!("checkpoint_epoch_{}.safetensors", epoch + 1));
                self.save_checkpoint(&path)?;
                info!("Saved checkpoint to {}", path.display());
            }
            summaries.push(summary);
        }

        Ok(summaries)
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.var_map.save(path)?;
        Ok(())
    }

    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.var_map.load(path)?;
        Ok(())
    }

    pub fn model(&self) -> &LstmLanguageModel {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }
}
