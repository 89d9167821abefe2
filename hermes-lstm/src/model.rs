use candle_core::{D, DType, Device, Module, Result, Tensor};
use candle_nn::rnn::{LSTM, LSTMConfig, LSTMState, RNN, lstm};
use candle_nn::{Embedding, Init, VarBuilder};

use crate::config::ModelConfig;

const INIT_STDEV: f64 = 0.1;

fn normal_init() -> Init {
    Init::Randn {
        mean: 0.0,
        stdev: INIT_STDEV,
    }
}

/// Gate order in the candle LSTM bias is input, forget, cell, output.
const FORGET_GATE: usize = 1;
const FORGET_BIAS: f64 = 1.0;

/// Starts the forget gate open by writing `FORGET_BIAS` into its slice of the
/// input bias. The other gate biases stay at zero.
fn init_forget_bias(hidden_size: usize, vb: &VarBuilder) -> Result<()> {
    let bias = vb.get_with_hints(4 * hidden_size, "bias_ih_l0", Init::Const(0.0))?;
    let forget = Tensor::full(FORGET_BIAS as f32, hidden_size, vb.device())?;
    bias.slice_set(&forget, 0, FORGET_GATE * hidden_size)
}

/// LSTM cell and hidden state, each `(batch_size, hidden_size)`.
#[derive(Debug, Clone)]
pub struct RecurrentState {
    pub cell: Tensor,
    pub hidden: Tensor,
}

impl RecurrentState {
    pub fn zeros(batch_size: usize, hidden_size: usize, device: &Device) -> Result<Self> {
        let zeros = Tensor::zeros((batch_size, hidden_size), DType::F32, device)?;
        Ok(Self {
            cell: zeros.clone(),
            hidden: zeros,
        })
    }

    /// Cuts the autodiff graph so the next window backpropagates only through
    /// its own steps.
    pub fn detach(&self) -> Self {
        Self {
            cell: self.cell.detach(),
            hidden: self.hidden.detach(),
        }
    }

    fn to_lstm(&self) -> LSTMState {
        LSTMState::new(self.hidden.clone(), self.cell.clone())
    }

    fn from_lstm(state: &LSTMState) -> Self {
        Self {
            cell: state.c().clone(),
            hidden: state.h().clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    /// Dropout active with the given keep probability
    Train { keep_prob: f64 },
    /// Dropout disabled
    Eval,
}

impl Mode {
    pub fn keep_prob(&self) -> f64 {
        match self {
            Mode::Train { keep_prob } => *keep_prob,
            Mode::Eval => 1.0,
        }
    }
}

pub struct StepOutput {
    /// Scalar window loss, see [`sequence_loss`]
    pub loss: Tensor,
    /// `(batch_size * num_steps, vocab_size)`, row-major over (batch, step)
    pub logits: Tensor,
    /// State after the last step of the window
    pub state: RecurrentState,
}

/// Inverted dropout on `xs`. At keep probability 1 the input is returned
/// untouched.
pub fn embedding_dropout(xs: &Tensor, keep_prob: f64) -> Result<Tensor> {
    if keep_prob >= 1.0 {
        return Ok(xs.clone());
    }
    candle_nn::ops::dropout(xs, (1.0 - keep_prob) as f32)
}

/// Cross-entropy of every position against its target, summed over all
/// positions and divided by the batch size: the mean per-sequence loss.
pub fn sequence_loss(logits: &Tensor, targets: &Tensor, batch_size: usize) -> Result<Tensor> {
    let targets = targets.flatten_all()?.unsqueeze(1)?;
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let picked = log_probs.gather(&targets, 1)?;
    picked
        .sum_all()?
        .neg()?
        .affine(1.0 / batch_size as f64, 0.0)
}

/// Embedding, dropout, a single LSTM layer and a softmax projection.
pub struct LstmLanguageModel {
    embedding: Embedding,
    cell: LSTM,
    softmax_w: Tensor,
    softmax_b: Tensor,
    config: ModelConfig,
    device: Device,
}

impl LstmLanguageModel {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = vb.get_with_hints(
            (config.vocab_size, config.embedding_size),
            "embedding",
            normal_init(),
        )?;
        let embedding = Embedding::new(embeddings, config.embedding_size);
        let cell = lstm(
            config.embedding_size,
            config.hidden_size,
            LSTMConfig::default(),
            vb.pp("lstm"),
        )?;
        init_forget_bias(config.hidden_size, &vb.pp("lstm"))?;
        let softmax_w = vb.get_with_hints(
            (config.hidden_size, config.vocab_size),
            "softmax_weight",
            normal_init(),
        )?;
        let softmax_b = vb.get_with_hints(config.vocab_size, "softmax_bias", normal_init())?;
        Ok(Self {
            embedding,
            cell,
            softmax_w,
            softmax_b,
            config: config.clone(),
            device: vb.device().clone(),
        })
    }

    pub fn zero_state(&self) -> Result<RecurrentState> {
        RecurrentState::zeros(self.config.batch_size, self.config.hidden_size, &self.device)
    }

    /// Runs a `(batch, steps)` window of token ids starting from `state`.
    /// Returns `(batch * steps, vocab)` logits and the state after the last step.
    pub fn forward(
        &self,
        inputs: &Tensor,
        state: &RecurrentState,
        keep_prob: f64,
    ) -> Result<(Tensor, RecurrentState)> {
        let (batch_size, num_steps) = inputs.dims2()?;

        let emb = self.embedding.forward(inputs)?;
        let emb = embedding_dropout(&emb, keep_prob)?;

        let states = self.cell.seq_init(&emb, &state.to_lstm())?;
        let Some(last) = states.last() else {
            candle_core::bail!("empty window")
        };
        let next = RecurrentState::from_lstm(last);

        let outputs = self
            .cell
            .states_to_tensor(&states)?
            .reshape((batch_size * num_steps, self.config.hidden_size))?;
        let logits = outputs
            .matmul(&self.softmax_w)?
            .broadcast_add(&self.softmax_b)?;
        Ok((logits, next))
    }

    pub fn step(
        &self,
        inputs: &Tensor,
        targets: &Tensor,
        state: &RecurrentState,
        mode: Mode,
    ) -> Result<StepOutput> {
        let batch_size = inputs.dim(0)?;
        let (logits, state) = self.forward(inputs, state, mode.keep_prob())?;
        let loss = sequence_loss(&logits, targets, batch_size)?;
        Ok(StepOutput {
            loss,
            logits,
            state,
        })
    }

    /// Forward pass and loss with dropout disabled, detached from the graph.
    pub fn evaluate_step(
        &self,
        inputs: &Tensor,
        targets: &Tensor,
        state: &RecurrentState,
    ) -> Result<StepOutput> {
        let out = self.step(inputs, targets, state, Mode::Eval)?;
        Ok(StepOutput {
            loss: out.loss.detach(),
            logits: out.logits.detach(),
            state: out.state.detach(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn build(config: &ModelConfig) -> (VarMap, LstmLanguageModel) {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let model = LstmLanguageModel::new(config, vb).unwrap();
        (var_map, model)
    }

    fn ids(data: &[u32], batch: usize, steps: usize) -> Tensor {
        Tensor::from_vec(data.to_vec(), (batch, steps), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_shapes() {
        let config = ModelConfig::tiny(11);
        let (var_map, model) = build(&config);
        assert_eq!(var_map.all_vars().len(), 3 + 4);

        let state = model.zero_state().unwrap();
        let (logits, next) = model.forward(&ids(&[1, 2, 3, 4], 2, 2), &state, 1.0).unwrap();
        assert_eq!(logits.dims(), &[4, 11]);
        assert_eq!(next.cell.dims(), &[2, 16]);
        assert_eq!(next.hidden.dims(), &[2, 16]);
    }

    #[test]
    fn test_forget_gate_bias_starts_at_one() {
        let config = ModelConfig::tiny(11);
        let (var_map, _model) = build(&config);
        let h = config.hidden_size;

        let vars = var_map.data().lock().unwrap();
        let bias: Vec<f32> = vars["lstm.bias_ih_l0"].as_tensor().to_vec1().unwrap();
        assert_eq!(bias.len(), 4 * h);
        assert!(bias[h..2 * h].iter().all(|&b| b == 1.0));
        assert!(bias[..h].iter().chain(&bias[2 * h..]).all(|&b| b == 0.0));

        let hh: Vec<f32> = vars["lstm.bias_hh_l0"].as_tensor().to_vec1().unwrap();
        assert!(hh.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_dropout_identity_at_full_keep() {
        let xs = Tensor::randn(0f32, 1.0, (4, 8), &Device::Cpu).unwrap();
        let out = embedding_dropout(&xs, 1.0).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            xs.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_dropout_masks_and_rescales() {
        let xs = Tensor::ones((1000,), DType::F32, &Device::Cpu).unwrap();
        let out: Vec<f32> = embedding_dropout(&xs, 0.5).unwrap().to_vec1().unwrap();
        assert!(out.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
        assert!(out.contains(&0.0));
        assert!(out.iter().any(|&v| v > 1.0));
    }

    #[test]
    fn test_eval_forward_is_deterministic() {
        let config = ModelConfig::tiny(11);
        let (_var_map, model) = build(&config);
        let x = ids(&[5, 6, 7, 8], 2, 2);
        let y = ids(&[6, 7, 8, 9], 2, 2);
        let state = model.zero_state().unwrap();

        let a = model.evaluate_step(&x, &y, &state).unwrap();
        let b = model.evaluate_step(&x, &y, &state).unwrap();
        assert_eq!(
            a.logits.to_vec2::<f32>().unwrap(),
            b.logits.to_vec2::<f32>().unwrap()
        );
        assert_eq!(
            a.loss.to_scalar::<f32>().unwrap(),
            b.loss.to_scalar::<f32>().unwrap()
        );
    }

    #[test]
    fn test_loss_is_summed_over_steps_and_averaged_over_batch() {
        let vocab = 7usize;
        let (batch, steps) = (2usize, 3usize);
        let logits = Tensor::zeros((batch * steps, vocab), DType::F32, &Device::Cpu).unwrap();
        let targets = ids(&[0, 1, 2, 3, 4, 5], batch, steps);

        let loss: f32 = sequence_loss(&logits, &targets, batch)
            .unwrap()
            .to_scalar()
            .unwrap();
        let expected = steps as f32 * (vocab as f32).ln();
        assert!((loss - expected).abs() < 1e-5, "{loss} vs {expected}");

        let logits = Tensor::randn(0f32, 2.0, (batch * steps, vocab), &Device::Cpu).unwrap();
        let loss: f32 = sequence_loss(&logits, &targets, batch)
            .unwrap()
            .to_scalar()
            .unwrap();
        let mean: f32 = candle_nn::loss::cross_entropy(&logits, &targets.flatten_all().unwrap())
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((loss - mean * steps as f32).abs() < 1e-4);
    }

    #[test]
    fn test_loss_is_non_negative() {
        let config = ModelConfig::tiny(11);
        let (_var_map, model) = build(&config);
        let out = model
            .evaluate_step(
                &ids(&[1, 2, 3, 4], 2, 2),
                &ids(&[2, 3, 4, 5], 2, 2),
                &model.zero_state().unwrap(),
            )
            .unwrap();
        let loss: f32 = out.loss.to_scalar().unwrap();
        assert!(loss >= 0.0);
        let ppl = crate::metrics::perplexity(loss as f64, 2).unwrap();
        assert!(ppl >= 1.0);
    }

    #[test]
    fn test_carried_state_matches_longer_window() {
        let config = ModelConfig {
            batch_size: 1,
            ..ModelConfig::tiny(11)
        };
        let (_var_map, model) = build(&config);
        let zero = model.zero_state().unwrap();

        let (whole, whole_state) = model.forward(&ids(&[3, 9], 1, 2), &zero, 1.0).unwrap();
        let (first, carried) = model.forward(&ids(&[3], 1, 1), &zero, 1.0).unwrap();
        let (second, split_state) = model.forward(&ids(&[9], 1, 1), &carried, 1.0).unwrap();
        let (reset, _) = model.forward(&ids(&[9], 1, 1), &zero, 1.0).unwrap();

        let whole = whole.to_vec2::<f32>().unwrap();
        let split = [
            first.to_vec2::<f32>().unwrap()[0].clone(),
            second.to_vec2::<f32>().unwrap()[0].clone(),
        ];
        for (a, b) in whole.iter().flatten().zip(split.iter().flatten()) {
            assert!((a - b).abs() < 1e-5);
        }
        let a = whole_state.hidden.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = split_state.hidden.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in a.iter().zip(&b) {
            assert!((a - b).abs() < 1e-5);
        }

        // starting the second step from zeros instead gives different logits
        let reset = reset.to_vec2::<f32>().unwrap();
        let diff: f32 = reset[0]
            .iter()
            .zip(&split[1])
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(diff > 1e-6);
    }
}
