//! Decaying averages used to predict pause costs and survival rates.

use std::collections::VecDeque;

/// Default weight of the newest sample in the decaying average.
const DEFAULT_ALPHA: f64 = 0.7;
const TRUNCATED_SEQ_LENGTH: usize = 10;

/// Sequence of samples keeping a decaying average and variance plus the last few
/// raw values.
#[derive(Clone, Debug)]
pub struct TruncatedSeq {
    alpha: f64,
    davg: f64,
    dvariance: f64,
    num: usize,
    last: VecDeque<f64>,
}

impl TruncatedSeq {
    pub fn new() -> Self {
        Self::with_alpha(DEFAULT_ALPHA)
    }

    pub fn with_alpha(alpha: f64) -> Self {
        Self {
            alpha,
            davg: 0.0,
            dvariance: 0.0,
            num: 0,
            last: VecDeque::with_capacity(TRUNCATED_SEQ_LENGTH),
        }
    }

    pub fn add(&mut self, value: f64) {
        if self.num == 0 {
            self.davg = value;
            self.dvariance = 0.0;
        } else {
            self.davg = (1.0 - self.alpha) * self.davg + self.alpha * value;
            let diff = value - self.davg;
            self.dvariance = (1.0 - self.alpha) * self.dvariance + self.alpha * diff * diff;
        }
        self.num += 1;
        if self.last.len() == TRUNCATED_SEQ_LENGTH {
            self.last.pop_front();
        }
        self.last.push_back(value);
    }

    pub fn num(&self) -> usize {
        self.num
    }

    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    pub fn davg(&self) -> f64 {
        self.davg
    }

    pub fn dsd(&self) -> f64 {
        self.dvariance.sqrt()
    }

    pub fn last(&self) -> Option<f64> {
        self.last.back().copied()
    }

    pub fn maximum(&self) -> f64 {
        self.last.iter().copied().fold(0.0, f64::max)
    }

    /// Average plus `confidence` standard deviations, never below the average.
    pub fn predict(&self, confidence: f64) -> f64 {
        self.davg + confidence * self.dsd()
    }
}

impl Default for TruncatedSeq {
    fn default() -> Self {
        Self::new()
    }
}

/// Survival rates of young regions indexed by their allocation order within a
/// mutator phase.
///
/// The first region allocated after a pause gets index 0, the next one 1, and so
/// on. Regions allocated early have had more time for their objects to die, so the
/// rate usually drops with the index.
#[derive(Debug)]
pub struct SurvRateGroup {
    name: &'static str,
    next_index: usize,
    surv_rate_pred: Vec<TruncatedSeq>,
    /// Rate assumed for indices that have no samples yet.
    initial_rate: f64,
}

impl SurvRateGroup {
    pub fn new(name: &'static str, initial_rate: f64) -> Self {
        Self {
            name,
            next_index: 0,
            surv_rate_pred: Vec::new(),
            initial_rate,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Starts a new mutator phase.
    pub fn start_adding_regions(&mut self) {
        self.next_index = 0;
    }

    /// Index to stamp on the next young region.
    pub fn next_age_index(&mut self) -> i32 {
        let index = self.next_index;
        self.next_index += 1;
        index as i32
    }

    pub fn region_num(&self) -> usize {
        self.next_index
    }

    pub fn record_surviving_words(&mut self, age_index: i32, used_words: usize, surviving_words: usize) {
        if age_index < 0 || used_words == 0 {
            return;
        }
        let index = age_index as usize;
        while self.surv_rate_pred.len() <= index {
            self.surv_rate_pred.push(TruncatedSeq::new());
        }
        let rate = (surviving_words as f64 / used_words as f64).min(1.0);
        self.surv_rate_pred[index].add(rate);
    }

    pub fn surv_rate_pred(&self, age_index: usize, confidence: f64) -> f64 {
        let seq = self
            .surv_rate_pred
            .get(age_index)
            .or_else(|| self.surv_rate_pred.last());
        match seq {
            Some(seq) if !seq.is_empty() => seq.predict(confidence).clamp(0.0, 1.0),
            _ => self.initial_rate,
        }
    }

    /// Predicted survival rate summed over the first `regions` indices.
    pub fn accum_surv_rate_pred(&self, regions: usize, confidence: f64) -> f64 {
        (0..regions).map(|i| self.surv_rate_pred(i, confidence)).sum()
    }
}
