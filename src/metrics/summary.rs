//! Scalar summaries recorded during training.
//!
//! Recorded values are kept with the global step they belong to, up to a
//! fixed number of entries per metric (oldest dropped first). The running
//! mean and the best value cover every value ever recorded.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Online mean of a stream of values.
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    mean: f64,
    count: usize,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
    }

    pub fn compute(&self) -> f64 {
        self.mean
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.mean = 0.0;
        self.count = 0;
    }
}

/// One recorded value of a scalar metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalarSummary {
    pub step: u64,
    pub value: f32,
}

/// History of named scalar metrics (`loss`, `rmse`, ...).
#[derive(Debug, Clone)]
pub struct SummaryRecorder {
    history: HashMap<String, Vec<ScalarSummary>>,
    best: HashMap<String, ScalarSummary>,
    running: HashMap<String, RunningMean>,
    max_history: usize,
}

impl Default for SummaryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl SummaryRecorder {
    /// Entries kept per metric unless configured otherwise.
    pub const DEFAULT_MAX_HISTORY: usize = 10_000;

    pub fn new() -> Self {
        Self::with_max_history(Self::DEFAULT_MAX_HISTORY)
    }

    /// Keeps at most `max_history` entries per metric (at least one).
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            history: HashMap::new(),
            best: HashMap::new(),
            running: HashMap::new(),
            max_history: max_history.max(1),
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Records `value` for `name` at `step`.
    ///
    /// Non-finite values are kept in the history but left out of the
    /// running mean.
    pub fn record(&mut self, name: &str, step: u64, value: f32) {
        log::info!("step {}: {} = {:.6}", step, name, value);
        let summary = ScalarSummary { step, value };
        let history = self.history.entry(name.to_string()).or_default();
        history.push(summary);
        if history.len() > self.max_history {
            let excess = history.len() - self.max_history;
            history.drain(..excess);
        }
        if value.is_finite() {
            self.running
                .entry(name.to_string())
                .or_default()
                .update(value as f64);
            let best = self.best.entry(name.to_string()).or_insert(summary);
            if value < best.value {
                *best = summary;
            }
        }
    }

    pub fn history(&self, name: &str) -> Option<&[ScalarSummary]> {
        self.history.get(name).map(Vec::as_slice)
    }

    pub fn last(&self, name: &str) -> Option<ScalarSummary> {
        self.history.get(name).and_then(|h| h.last().copied())
    }

    /// Lowest finite value recorded for `name`, including trimmed entries.
    pub fn best(&self, name: &str) -> Option<ScalarSummary> {
        self.best.get(name).copied()
    }

    pub fn running_mean(&self, name: &str) -> Option<f64> {
        self.running.get(name).map(RunningMean::compute)
    }

    /// Metric names in alphabetical order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.history.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.best.clear();
        self.running.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_mean() {
        let mut mean = RunningMean::new();
        for v in [1.0, 2.0, 3.0, 4.0] {
            mean.update(v);
        }
        assert!((mean.compute() - 2.5).abs() < 1e-10);
        assert_eq!(mean.count(), 4);
        mean.reset();
        assert_eq!(mean.count(), 0);
    }

    #[test]
    fn test_recorder_history_and_best() {
        let mut summaries = SummaryRecorder::new();
        summaries.record("loss", 1, 0.9);
        summaries.record("loss", 2, 0.4);
        summaries.record("loss", 3, f32::NAN);
        summaries.record("rmse", 1, 0.3);

        assert_eq!(summaries.names(), vec!["loss", "rmse"]);
        assert_eq!(summaries.history("loss").unwrap().len(), 3);
        assert_eq!(summaries.last("loss").unwrap().step, 3);
        assert_eq!(summaries.best("loss"), Some(ScalarSummary { step: 2, value: 0.4 }));
        assert!((summaries.running_mean("loss").unwrap() - 0.65).abs() < 1e-6);
        assert!(summaries.history("psnr").is_none());

        summaries.clear();
        assert!(summaries.names().is_empty());
    }

    #[test]
    fn test_history_is_capped_but_aggregates_are_not() {
        let mut summaries = SummaryRecorder::with_max_history(3);
        for (step, value) in [(1, 0.2), (2, 0.8), (3, 0.6), (4, 0.5), (5, 0.4)] {
            summaries.record("loss", step, value);
        }

        let steps: Vec<u64> = summaries.history("loss").unwrap().iter().map(|s| s.step).collect();
        assert_eq!(steps, vec![3, 4, 5]);
        assert_eq!(summaries.best("loss"), Some(ScalarSummary { step: 1, value: 0.2 }));
        assert!((summaries.running_mean("loss").unwrap() - 0.5).abs() < 1e-6);
        assert_eq!(SummaryRecorder::with_max_history(0).max_history(), 1);
        assert_eq!(SummaryRecorder::new().max_history(), SummaryRecorder::DEFAULT_MAX_HISTORY);
    }
}
