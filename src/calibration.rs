//! Calibration engine
//!
//! Collects a short window of scores at session start and derives the
//! personalized decision threshold and movement gate. The buffer is owned by
//! whoever drives the session; it is never shared with the relay.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FocusError, FocusResult};
use crate::types::CalibrationThreshold;

/// Default calibration window in seconds
pub const DEFAULT_WINDOW_SECS: f64 = 10.0;

/// Minimum scores needed for a personalized threshold
pub const DEFAULT_MIN_SAMPLES: usize = 10;

/// Statistic used to turn the collected scores into a decision threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdStatistic {
    Median,
    Mean,
    /// Percentile in [0, 100]
    Percentile(f64),
}

impl ThresholdStatistic {
    fn apply(&self, values: &[f64]) -> f64 {
        match self {
            ThresholdStatistic::Mean => values.iter().sum::<f64>() / values.len() as f64,
            ThresholdStatistic::Median => percentile(values, 50.0),
            ThresholdStatistic::Percentile(p) => percentile(values, *p),
        }
    }
}

/// Linear-interpolated percentile of an unsorted, non-empty slice
fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// Calibration parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Window length in seconds
    pub window_secs: f64,
    /// Optional early completion after this many scores
    pub max_samples: Option<usize>,
    pub min_samples: usize,
    pub statistic: ThresholdStatistic,
    /// Gate = decision threshold - offset
    pub gate_offset: f64,
    pub fallback_threshold: f64,
    pub fallback_gate: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_WINDOW_SECS,
            max_samples: None,
            min_samples: DEFAULT_MIN_SAMPLES,
            statistic: ThresholdStatistic::Median,
            gate_offset: 0.05,
            fallback_threshold: 0.80,
            fallback_gate: 0.75,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> FocusResult<()> {
        if !(self.window_secs > 0.0) {
            return Err(FocusError::InvalidConfig(format!(
                "calibration window must be > 0 s (got {})",
                self.window_secs
            )));
        }
        if self.min_samples == 0 {
            return Err(FocusError::InvalidConfig(
                "calibration min_samples must be at least 1".into(),
            ));
        }
        if let ThresholdStatistic::Percentile(p) = self.statistic {
            if !(0.0..=100.0).contains(&p) {
                return Err(FocusError::InvalidConfig(format!(
                    "calibration percentile must be in [0, 100] (got {p})"
                )));
            }
        }
        for (name, value) in [
            ("gate_offset", self.gate_offset),
            ("fallback_threshold", self.fallback_threshold),
            ("fallback_gate", self.fallback_gate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FocusError::InvalidConfig(format!(
                    "calibration {name} must be in [0, 1] (got {value})"
                )));
            }
        }
        if self.fallback_gate > self.fallback_threshold {
            return Err(FocusError::InvalidConfig(
                "fallback gate must not exceed the fallback threshold".into(),
            ));
        }
        Ok(())
    }

    /// Thresholds used when calibration could not complete
    pub fn fallback(&self) -> CalibrationThreshold {
        CalibrationThreshold {
            decision_threshold: self.fallback_threshold,
            movement_gate: self.fallback_gate,
            sample_count: 0,
        }
    }
}

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationState {
    Idle,
    Collecting,
    Ready,
}

/// Result of a closed calibration window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOutcome {
    pub threshold: CalibrationThreshold,
    /// False when the fallback thresholds were used
    pub calibrated: bool,
}

/// Idle -> Collecting -> Ready -> Idle
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    config: CalibrationConfig,
    state: CalibrationState,
    started_at: f64,
    scores: Vec<f64>,
    outcome: Option<CalibrationOutcome>,
}

impl Default for CalibrationEngine {
    fn default() -> Self {
        Self::new(CalibrationConfig::default())
    }
}

impl CalibrationEngine {
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            state: CalibrationState::Idle,
            started_at: 0.0,
            scores: Vec::new(),
            outcome: None,
        }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    /// Scores collected so far in the current window
    pub fn collected(&self) -> usize {
        self.scores.len()
    }

    /// Seconds left in the window, 0 when not collecting
    pub fn remaining(&self, now: f64) -> f64 {
        match self.state {
            CalibrationState::Collecting => {
                (self.config.window_secs - (now - self.started_at)).max(0.0)
            }
            _ => 0.0,
        }
    }

    pub fn outcome(&self) -> Option<CalibrationOutcome> {
        self.outcome
    }

    /// Begin a new collection window; discards any previous result
    pub fn start(&mut self, now: f64) {
        self.scores.clear();
        self.outcome = None;
        self.started_at = now;
        self.state = CalibrationState::Collecting;
        debug!(window_secs = self.config.window_secs, "calibration started");
    }

    /// Buffer one score. Returns the outcome if this score closed the window.
    ///
    /// Scores pushed while not collecting are ignored.
    pub fn push(&mut self, score: f64, now: f64) -> Option<CalibrationOutcome> {
        if self.state != CalibrationState::Collecting {
            return None;
        }
        if score.is_finite() {
            self.scores.push(score.clamp(0.0, 1.0));
        }

        let full = self
            .config
            .max_samples
            .map(|max| self.scores.len() >= max)
            .unwrap_or(false);
        if full {
            return Some(self.close());
        }
        self.poll(now)
    }

    /// Close the window if its duration has elapsed
    pub fn poll(&mut self, now: f64) -> Option<CalibrationOutcome> {
        if self.state == CalibrationState::Collecting
            && now - self.started_at >= self.config.window_secs
        {
            return Some(self.close());
        }
        None
    }

    /// Compute the thresholds from what has been collected.
    ///
    /// Fails with `InsufficientSamples` below the configured minimum.
    pub fn finish(&self) -> FocusResult<CalibrationThreshold> {
        // no statistic exists over an empty window, whatever min_samples says
        let required = self.config.min_samples.max(1);
        if self.scores.len() < required {
            return Err(FocusError::InsufficientSamples {
                collected: self.scores.len(),
                required,
            });
        }

        let decision = self.config.statistic.apply(&self.scores).clamp(0.0, 1.0);
        let gate = (decision - self.config.gate_offset).clamp(0.0, 1.0);
        Ok(CalibrationThreshold {
            decision_threshold: decision,
            movement_gate: gate,
            sample_count: self.scores.len(),
        })
    }

    /// Close the window now, falling back to defaults on too few samples
    pub fn close(&mut self) -> CalibrationOutcome {
        let outcome = match self.finish() {
            Ok(threshold) => {
                debug!(
                    decision = threshold.decision_threshold,
                    gate = threshold.movement_gate,
                    samples = threshold.sample_count,
                    "calibration complete"
                );
                CalibrationOutcome {
                    threshold,
                    calibrated: true,
                }
            }
            Err(err) => {
                warn!(error = %err, "calibration fell back to default threshold");
                CalibrationOutcome {
                    threshold: self.config.fallback(),
                    calibrated: false,
                }
            }
        };
        self.scores.clear();
        self.state = CalibrationState::Ready;
        self.outcome = Some(outcome);
        outcome
    }

    pub fn reset(&mut self) {
        self.scores.clear();
        self.outcome = None;
        self.state = CalibrationState::Idle;
    }
}
