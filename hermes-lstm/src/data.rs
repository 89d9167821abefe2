use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use tracing::info;

use crate::error::{Error, Result};
use crate::io as file_io;

/// Token that marks a cloze blank.
pub const BLANK_TOKEN: &str = "BLANK";

/// Token string to id mapping, as produced by the external preprocessing step.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    ids: HashMap<String, u32>,
    blank_id: u32,
}

impl Vocabulary {
    /// Ids must be dense: every id is below the vocabulary size and used once.
    pub fn new(ids: HashMap<String, u32>) -> Result<Self> {
        let mut seen = vec![false; ids.len()];
        for (token, &id) in &ids {
            match seen.get_mut(id as usize) {
                Some(slot) if !*slot => *slot = true,
                Some(_) => {
                    return Err(Error::Data(format!(
                        "vocabulary id {id} is assigned to more than one token ({token:?} among them)"
                    )));
                }
                None => {
                    return Err(Error::Data(format!(
                        "vocabulary token {token:?} has id {id}, out of range for {} entries",
                        ids.len()
                    )));
                }
            }
        }

        let blank_id = *ids
            .get(BLANK_TOKEN)
            .ok_or_else(|| Error::Data(format!("vocabulary has no {BLANK_TOKEN} entry")))?;
        Ok(Self { ids, blank_id })
    }

    /// Load from a JSON object of `{"token": id}`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = file_io::open_file(path)?;
        let ids: HashMap<String, u32> = serde_json::from_reader(reader)?;
        let vocab = Self::new(ids)?;
        info!("Loaded vocabulary of {} tokens", vocab.len());
        Ok(vocab)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn blank_id(&self) -> u32 {
        self.blank_id
    }

    pub fn id(&self, token: &str) -> Option<u32> {
        self.ids.get(token).copied()
    }
}

fn check_ids(ids: &[u32], vocab_size: usize, what: &str) -> Result<()> {
    match ids.iter().find(|&&id| id as usize >= vocab_size) {
        Some(id) => Err(Error::Data(format!(
            "{what}: token id {id} out of range for vocabulary of {vocab_size}"
        ))),
        None => Ok(()),
    }
}

/// How fixed-size windows are laid over a sequence of (input, target) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowAlignment {
    /// Every full window: `floor(pairs / window)` of them.
    #[default]
    Full,
    /// Only windows whose end lies strictly before the last pair boundary,
    /// so a window ending exactly at `pairs` is dropped.
    Strict,
}

/// Half-open range `[start, end)` of pair positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub end: usize,
}

/// Non-overlapping windows of width `window` over `pairs` positions.
/// Trailing pairs that do not fill a window are never produced.
pub fn windows(
    pairs: usize,
    window: usize,
    alignment: WindowAlignment,
) -> impl Iterator<Item = Window> {
    let count = match (window, alignment) {
        (0, _) => 0,
        (w, WindowAlignment::Full) => pairs / w,
        (w, WindowAlignment::Strict) => pairs.saturating_sub(1) / w,
    };
    (0..count).map(move |k| Window {
        start: k * window,
        end: (k + 1) * window,
    })
}

/// Builds `(inputs, targets)` tensors of shape `(batch_size, num_steps)` for
/// one window of `tokens`, where the target of position `i` is `tokens[i + 1]`.
pub fn window_tensors(
    tokens: &[u32],
    window: Window,
    batch_size: usize,
    num_steps: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let inputs = tokens[window.start..window.end].to_vec();
    let targets = tokens[window.start + 1..window.end + 1].to_vec();
    let inputs = Tensor::from_vec(inputs, (batch_size, num_steps), device)?;
    let targets = Tensor::from_vec(targets, (batch_size, num_steps), device)?;
    Ok((inputs, targets))
}

/// Integer-encoded training text.
#[derive(Debug, Clone)]
pub struct Corpus {
    tokens: Vec<u32>,
}

impl Corpus {
    pub fn new(tokens: Vec<u32>) -> Self {
        Self { tokens }
    }

    /// Load from a JSON array of token ids.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = file_io::open_file(path)?;
        let tokens: Vec<u32> = serde_json::from_reader(reader)?;
        info!("Loaded corpus of {} tokens", tokens.len());
        Ok(Self::new(tokens))
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Number of (input, target) pairs.
    pub fn num_pairs(&self) -> usize {
        self.tokens.len().saturating_sub(1)
    }

    pub fn validate(&self, vocab_size: usize) -> Result<()> {
        check_ids(&self.tokens, vocab_size, "corpus")
    }
}

/// One passage with blanks, the candidates per blank and the answer per blank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClozeCase {
    pub tokens: Vec<u32>,
    pub choices: Vec<Vec<u32>>,
    pub keys: Vec<u32>,
}

impl ClozeCase {
    pub fn num_pairs(&self) -> usize {
        self.tokens.len().saturating_sub(1)
    }

    pub fn validate(&self, vocab_size: usize) -> Result<()> {
        if self.choices.len() != self.keys.len() {
            return Err(Error::Data(format!(
                "{} choice sets but {} keys",
                self.choices.len(),
                self.keys.len()
            )));
        }
        check_ids(&self.tokens, vocab_size, "passage")?;
        check_ids(&self.keys, vocab_size, "keys")?;
        for (blank, (choices, key)) in self.choices.iter().zip(&self.keys).enumerate() {
            check_ids(choices, vocab_size, "choices")?;
            if !choices.contains(key) {
                return Err(Error::Data(format!(
                    "blank {blank}: key {key} is not among its choices"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClozeSet {
    cases: Vec<ClozeCase>,
}

impl ClozeSet {
    pub fn new(cases: Vec<ClozeCase>) -> Self {
        Self { cases }
    }

    /// Load from JSONL, one case per line. Blank lines are skipped.
    pub fn from_file<P: AsRef<Path>>(path: P, vocab_size: usize) -> Result<Self> {
        let reader = file_io::open_file(path)?;
        let mut cases = Vec::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let case: ClozeCase = serde_json::from_str(&line)?;
            case.validate(vocab_size)
                .map_err(|e| Error::Data(format!("cloze on line {}: {}", line_no + 1, e)))?;
            cases.push(case);
        }

        info!("Loaded {} cloze cases", cases.len());
        Ok(Self::new(cases))
    }

    pub fn cases(&self) -> &[ClozeCase] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}
