//! Cloze evaluation: held-out perplexity plus multiple-choice blank accuracy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::EvalConfig;
use crate::data::{ClozeCase, ClozeSet, windows, window_tensors};
use crate::error::{Error, Result};
use crate::io as file_io;
use crate::metrics::{BlankTally, LossAccumulator, display_metric};
use crate::model::LstmLanguageModel;

/// Diagnostics for one answered blank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlankRecord {
    pub case: usize,
    pub blank: usize,
    /// Full vocabulary logits at the position predicting the blank
    pub logits: Vec<f32>,
    /// Logits restricted to the blank's candidates
    pub choices: BTreeMap<u32, f32>,
    pub key: u32,
    pub predicted: u32,
    pub correct: bool,
}

/// Outcome of restricting a logit vector to a candidate set.
#[derive(Debug, Clone, PartialEq)]
pub struct BlankScore {
    pub choices: BTreeMap<u32, f32>,
    pub predicted: u32,
    pub correct: bool,
}

/// Picks the highest-scoring candidate. The key counts as correct whenever
/// its score equals the candidate maximum, so ties go to the key.
pub fn score_blank(logits: &[f32], candidates: &[u32], key: u32) -> Result<BlankScore> {
    let mut choices = BTreeMap::new();
    for &id in candidates {
        let score = logits.get(id as usize).copied().ok_or_else(|| {
            Error::Data(format!(
                "candidate {id} out of range for {} logits",
                logits.len()
            ))
        })?;
        choices.insert(id, score);
    }

    let key_score = *choices
        .get(&key)
        .ok_or_else(|| Error::Data(format!("key {key} is not among the candidates")))?;
    let max = choices.values().copied().fold(f32::NEG_INFINITY, f32::max);

    let correct = key_score == max;
    let predicted = if correct {
        key
    } else {
        choices
            .iter()
            .find(|&(_, &score)| score == max)
            .map(|(&id, _)| id)
            .unwrap_or(key)
    };

    Ok(BlankScore {
        choices,
        predicted,
        correct,
    })
}

#[derive(Debug, Clone, Default)]
pub struct EvalReport {
    pub loss: LossAccumulator,
    pub tally: BlankTally,
    pub records: Vec<BlankRecord>,
}

impl EvalReport {
    pub fn perplexity(&self) -> Option<f64> {
        self.loss.perplexity()
    }

    pub fn accuracy(&self) -> Option<f64> {
        self.tally.accuracy()
    }

    /// Writes the per-blank records as a JSON array.
    pub fn save_diagnostics<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = file_io::create_file(path)?;
        serde_json::to_writer(&mut writer, &self.records)?;
        writer.finish()
    }

    pub fn load_diagnostics<P: AsRef<Path>>(path: P) -> Result<Vec<BlankRecord>> {
        let reader = file_io::open_file(path)?;
        Ok(serde_json::from_reader(reader)?)
    }
}

pub struct ClozeEvaluator<'a> {
    model: &'a LstmLanguageModel,
    blank_id: u32,
    config: &'a EvalConfig,
}

impl<'a> ClozeEvaluator<'a> {
    pub fn new(model: &'a LstmLanguageModel, blank_id: u32, config: &'a EvalConfig) -> Self {
        Self {
            model,
            blank_id,
            config,
        }
    }

    pub fn evaluate(&self, clozes: &ClozeSet) -> Result<EvalReport> {
        let limit = self.config.max_clozes.unwrap_or(usize::MAX);
        let mut report = EvalReport::default();

        for (index, case) in clozes.cases().iter().take(limit).enumerate() {
            self.evaluate_case(index, case, &mut report)?;
        }

        info!(
            "Evaluated {} blanks: test perplexity {}, blank accuracy {}",
            report.tally.total,
            display_metric(report.perplexity()),
            display_metric(report.accuracy())
        );
        Ok(report)
    }

    /// Replays one passage from a zero state, answering blanks in document order.
    pub fn evaluate_case(
        &self,
        index: usize,
        case: &ClozeCase,
        report: &mut EvalReport,
    ) -> Result<()> {
        let config = self.model.config();
        let (batch_size, num_steps) = (config.batch_size, config.num_steps);
        let device = self.model.device();

        let mut state = self.model.zero_state()?;
        let mut blank = 0;

        for w in windows(case.num_pairs(), config.window(), self.config.alignment) {
            let (inputs, targets) =
                window_tensors(&case.tokens, w, batch_size, num_steps, device)?;
            let out = self.model.evaluate_step(&inputs, &targets, &state)?;
            state = out.state;

            let loss = out.loss.to_scalar::<f32>()? as f64;
            if !loss.is_finite() {
                return Err(Error::NonFiniteLoss { position: w.start });
            }

            let window_targets = &case.tokens[w.start + 1..w.end + 1];
            if window_targets.contains(&self.blank_id) {
                let logits = out.logits.to_vec2::<f32>()?;
                for (row, _) in window_targets
                    .iter()
                    .enumerate()
                    .filter(|&(_, &t)| t == self.blank_id)
                {
                    let (candidates, key) = case
                        .choices
                        .get(blank)
                        .zip(case.keys.get(blank))
                        .ok_or_else(|| {
                            Error::Data(format!(
                                "cloze {index}: blank {blank} has no choices or key"
                            ))
                        })?;
                    let score = score_blank(&logits[row], candidates, *key)?;
                    debug!(
                        "cloze {} blank {}: predicted {} key {} correct {}",
                        index, blank, score.predicted, key, score.correct
                    );

                    report.tally.record(score.correct);
                    report.records.push(BlankRecord {
                        case: index,
                        blank,
                        logits: logits[row].clone(),
                        choices: score.choices,
                        key: *key,
                        predicted: score.predicted,
                        correct: score.correct,
                    });
                    blank += 1;
                }
            }

            report.loss.add(loss, num_steps);
        }

        if blank < case.keys.len() {
            warn!(
                "cloze {}: {} of {} blanks fell outside the evaluated windows",
                index,
                case.keys.len() - blank,
                case.keys.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::data::WindowAlignment;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    const BLANK: u32 = 1;

    fn build(batch_size: usize, num_steps: usize) -> (VarMap, LstmLanguageModel) {
        let config = ModelConfig {
            batch_size,
            num_steps,
            ..ModelConfig::tiny(10)
        };
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let model = LstmLanguageModel::new(&config, vb).unwrap();
        (var_map, model)
    }

    fn case(tokens: Vec<u32>, choices: Vec<Vec<u32>>, keys: Vec<u32>) -> ClozeCase {
        ClozeCase {
            tokens,
            choices,
            keys,
        }
    }

    #[test]
    fn test_restricted_argmax_ignores_other_tokens() {
        let mut logits = vec![0.0f32; 10];
        logits[9] = 50.0;
        logits[3] = 1.0;
        logits[4] = 2.0;
        logits[5] = 1.5;

        let score = score_blank(&logits, &[3, 4, 5], 4).unwrap();
        assert!(score.correct);
        assert_eq!(score.predicted, 4);
        assert_eq!(score.choices.len(), 3);
        assert_eq!(score.choices[&5], 1.5);

        let score = score_blank(&logits, &[3, 4, 5], 3).unwrap();
        assert!(!score.correct);
        assert_eq!(score.predicted, 4);
    }

    #[test]
    fn test_ties_favor_key() {
        let logits = vec![1.0f32, 1.0, 1.0];
        let score = score_blank(&logits, &[0, 1, 2], 2).unwrap();
        assert!(score.correct);
        assert_eq!(score.predicted, 2);
    }

    #[test]
    fn test_bad_candidates() {
        let logits = vec![0.0f32; 4];
        assert!(matches!(
            score_blank(&logits, &[1, 7], 1),
            Err(Error::Data(_))
        ));
        assert!(matches!(score_blank(&logits, &[1, 2], 3), Err(Error::Data(_))));
    }

    #[test]
    fn test_single_blank_case() {
        let (_var_map, model) = build(1, 1);
        let config = EvalConfig::default();
        let evaluator = ClozeEvaluator::new(&model, BLANK, &config);
        let clozes = ClozeSet::new(vec![case(vec![7, BLANK, 9], vec![vec![3, 4, 5]], vec![4])]);

        let report = evaluator.evaluate(&clozes).unwrap();
        assert_eq!(report.tally.total, 1);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.loss.tokens, 2);
        assert!(report.perplexity().unwrap() >= 1.0);

        let record = &report.records[0];
        assert_eq!((record.case, record.blank, record.key), (0, 0, 4));
        assert_eq!(record.logits.len(), 10);
        assert_eq!(record.choices.keys().copied().collect::<Vec<_>>(), vec![3, 4, 5]);

        let best = record.choices.values().copied().fold(f32::NEG_INFINITY, f32::max);
        assert_eq!(record.correct, record.choices[&4] == best);
        assert_eq!(report.tally.correct, usize::from(record.correct));
    }

    #[test]
    fn test_state_carries_across_windows() {
        let (_var_map, model) = build(1, 1);
        let config = EvalConfig::default();
        let evaluator = ClozeEvaluator::new(&model, BLANK, &config);
        let tokens = vec![2, 3, BLANK, 4, 5];
        let clozes = ClozeSet::new(vec![case(tokens.clone(), vec![vec![6, 7]], vec![7])]);
        let report = evaluator.evaluate(&clozes).unwrap();

        // the same passage in one long window
        let inputs = Tensor::from_vec(tokens[..4].to_vec(), (1, 4), &Device::Cpu).unwrap();
        let zero = crate::model::RecurrentState::zeros(1, 16, &Device::Cpu).unwrap();
        let (logits, _) = model.forward(&inputs, &zero, 1.0).unwrap();
        let expected = &logits.to_vec2::<f32>().unwrap()[1];

        for (a, b) in report.records[0].logits.iter().zip(expected) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_state_resets_between_cases() {
        let (_var_map, model) = build(1, 1);
        let config = EvalConfig::default();
        let evaluator = ClozeEvaluator::new(&model, BLANK, &config);
        let first = case(vec![8, 9, 2, BLANK, 3], vec![vec![4, 5]], vec![5]);
        let second = case(vec![2, BLANK, 6, 7], vec![vec![6, 7]], vec![6]);

        let both = evaluator
            .evaluate(&ClozeSet::new(vec![first.clone(), second.clone()]))
            .unwrap();
        let alone = evaluator.evaluate(&ClozeSet::new(vec![second])).unwrap();
        let first_only = evaluator.evaluate(&ClozeSet::new(vec![first])).unwrap();

        assert_eq!(both.records.len(), 2);
        assert_eq!(both.records[1].case, 1);
        for (a, b) in both.records[1].logits.iter().zip(&alone.records[0].logits) {
            assert!((a - b).abs() < 1e-5);
        }
        assert_eq!(both.records[1].predicted, alone.records[0].predicted);

        let second_loss = both.loss.loss - first_only.loss.loss;
        assert!((second_loss - alone.loss.loss).abs() < 1e-4);
        assert_eq!(both.loss.tokens, first_only.loss.tokens + alone.loss.tokens);
    }

    #[test]
    fn test_blanks_in_document_order() {
        let (_var_map, model) = build(2, 2);
        let config = EvalConfig::default();
        let evaluator = ClozeEvaluator::new(&model, BLANK, &config);
        // 8 pairs, window 4; blanks are targets of pairs 1, 4 and 6
        let tokens = vec![2, 3, BLANK, 4, 5, BLANK, 6, BLANK, 8];
        let clozes = ClozeSet::new(vec![case(
            tokens,
            vec![vec![2, 3], vec![4, 5], vec![6, 7]],
            vec![3, 5, 7],
        )]);

        let report = evaluator.evaluate(&clozes).unwrap();
        let blanks: Vec<(usize, u32)> = report.records.iter().map(|r| (r.blank, r.key)).collect();
        assert_eq!(blanks, vec![(0, 3), (1, 5), (2, 7)]);
        assert_eq!(report.tally.total, 3);
        assert_eq!(report.loss.tokens, 4);
    }

    #[test]
    fn test_no_blanks_accuracy_undefined() {
        let (_var_map, model) = build(1, 1);
        let config = EvalConfig::default();
        let evaluator = ClozeEvaluator::new(&model, BLANK, &config);
        let clozes = ClozeSet::new(vec![case(vec![2, 3, 4], vec![], vec![])]);

        let report = evaluator.evaluate(&clozes).unwrap();
        assert_eq!(report.accuracy(), None);
        assert!(report.perplexity().is_some());

        let empty = evaluator.evaluate(&ClozeSet::default()).unwrap();
        assert_eq!(empty.perplexity(), None);
        assert_eq!(empty.accuracy(), None);
    }

    #[test]
    fn test_missing_choices_is_an_error() {
        let (_var_map, model) = build(1, 1);
        let config = EvalConfig::default();
        let evaluator = ClozeEvaluator::new(&model, BLANK, &config);
        let clozes = ClozeSet::new(vec![case(vec![2, BLANK, 3, BLANK], vec![vec![2]], vec![2])]);
        assert!(matches!(evaluator.evaluate(&clozes), Err(Error::Data(_))));
    }

    #[test]
    fn test_max_clozes() {
        let (_var_map, model) = build(1, 1);
        let config = EvalConfig {
            max_clozes: Some(1),
            ..Default::default()
        };
        let evaluator = ClozeEvaluator::new(&model, BLANK, &config);
        let clozes = ClozeSet::new(vec![
            case(vec![2, BLANK, 3], vec![vec![2, 3]], vec![3]),
            case(vec![4, BLANK, 5], vec![vec![4, 5]], vec![5]),
        ]);
        let report = evaluator.evaluate(&clozes).unwrap();
        assert_eq!(report.tally.total, 1);
        assert!(report.records.iter().all(|r| r.case == 0));
    }

    #[test]
    fn test_alignment_changes_last_window() {
        let (_var_map, model) = build(1, 1);
        // the only blank is the target of the final pair
        let clozes = ClozeSet::new(vec![case(vec![7, 8, BLANK], vec![vec![2, 3]], vec![3])]);

        let full = EvalConfig::default();
        let report = ClozeEvaluator::new(&model, BLANK, &full)
            .evaluate(&clozes)
            .unwrap();
        assert_eq!(report.tally.total, 1);
        assert_eq!(report.loss.tokens, 2);

        let strict = EvalConfig {
            alignment: WindowAlignment::Strict,
            ..Default::default()
        };
        let report = ClozeEvaluator::new(&model, BLANK, &strict)
            .evaluate(&clozes)
            .unwrap();
        assert_eq!(report.tally.total, 0);
        assert_eq!(report.loss.tokens, 1);
    }

    #[test]
    fn test_diagnostics_roundtrip() {
        let (_var_map, model) = build(1, 1);
        let config = EvalConfig::default();
        let clozes = ClozeSet::new(vec![case(vec![7, BLANK, 9], vec![vec![3, 4, 5]], vec![4])]);
        let report = ClozeEvaluator::new(&model, BLANK, &config)
            .evaluate(&clozes)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("error_analysis.json.gz");
        report.save_diagnostics(&path).unwrap();
        let loaded = EvalReport::load_diagnostics(&path).unwrap();
        assert_eq!(loaded, report.records);
    }
}
