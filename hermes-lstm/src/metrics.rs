//! Running loss and accuracy counters.

/// `exp(loss / tokens)`, or `None` when nothing has been counted.
pub fn perplexity(loss: f64, tokens: usize) -> Option<f64> {
    if tokens == 0 {
        None
    } else {
        Some((loss / tokens as f64).exp())
    }
}

/// Accumulates per-window losses and the number of steps they cover.
///
/// Window losses are summed over the steps of each sequence and averaged over
/// the batch, so dividing by the step count yields per-token cross-entropy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossAccumulator {
    pub loss: f64,
    pub tokens: usize,
}

impl LossAccumulator {
    pub fn add(&mut self, loss: f64, steps: usize) {
        self.loss += loss;
        self.tokens += steps;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn perplexity(&self) -> Option<f64> {
        perplexity(self.loss, self.tokens)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlankTally {
    pub correct: usize,
    pub total: usize,
}

impl BlankTally {
    pub fn record(&mut self, correct: bool) {
        self.total += 1;
        if correct {
            self.correct += 1;
        }
    }

    /// Fraction of blanks answered correctly; undefined with no blanks.
    pub fn accuracy(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.correct as f64 / self.total as f64)
        }
    }
}

/// Formats an optional metric, printing `undefined` for `None`.
pub fn display_metric(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v}"),
        None => "undefined".to_string(),
    }
}
