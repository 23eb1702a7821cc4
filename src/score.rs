//! Score transform
//!
//! Converts raw band power into a normalized attention score in [0, 1]:
//! - the power ceiling is `threshold * 3.5`
//! - the ratio to the ceiling is square-rooted
//! - values above 0.75 are compressed by a penalty factor so that near-maximum
//!   focus is hard to sustain
//!
//! The transform itself is pure. Smoothing and downsampling are separate,
//! explicitly stateful stages so that every consumer that re-derives a score
//! from the same power and threshold gets the identical value.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::{FocusError, FocusResult};
use crate::types::Sample;

/// Ceiling = threshold * this
pub const CEILING_MULTIPLIER: f64 = 3.5;

/// Scores above this knee are compressed
pub const PENALTY_KNEE: f64 = 0.75;

/// Slope applied above the knee
pub const DEFAULT_PENALTY_FACTOR: f64 = 0.5;

/// Score raw band power against a threshold using the default penalty factor.
///
/// Fails with `InvalidConfig` when `threshold <= 0` and with `InvalidSample`
/// when the power is not a finite, non-negative number.
pub fn score(raw_power: f64, threshold: f64) -> FocusResult<f64> {
    score_with_penalty(raw_power, threshold, DEFAULT_PENALTY_FACTOR)
}

/// Score raw band power with an explicit penalty factor
pub fn score_with_penalty(raw_power: f64, threshold: f64, penalty_factor: f64) -> FocusResult<f64> {
    if !(threshold > 0.0) || !threshold.is_finite() {
        return Err(FocusError::InvalidConfig(format!(
            "threshold must be > 0 (got {threshold})"
        )));
    }
    if !raw_power.is_finite() {
        return Err(FocusError::InvalidSample(format!(
            "non-finite band power {raw_power}"
        )));
    }
    if raw_power < 0.0 {
        return Err(FocusError::InvalidSample(format!(
            "negative band power {raw_power}"
        )));
    }

    let ceiling = threshold * CEILING_MULTIPLIER;
    let ratio = (raw_power / ceiling).max(0.0);
    let mut value = ratio.sqrt();

    if value > PENALTY_KNEE {
        value = PENALTY_KNEE + (value - PENALTY_KNEE) * penalty_factor;
    }

    Ok(value.clamp(0.0, 1.0))
}

/// A scorer turns band power into a normalized score.
///
/// The formula scorer is the default; a model-based classifier can be plugged
/// in behind the same interface without touching the relay.
pub trait Scorer: Send {
    fn score(&self, raw_power: f64) -> FocusResult<f64>;

    /// Short name for logs and diagnostics
    fn name(&self) -> &'static str;
}

/// Square-root ceiling scorer with a high-end penalty
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FormulaScorer {
    /// Threshold in raw power units
    pub threshold: f64,
    pub penalty_factor: f64,
}

impl FormulaScorer {
    /// Create a scorer, rejecting unusable parameters up front
    pub fn new(threshold: f64, penalty_factor: f64) -> FocusResult<Self> {
        if !(threshold > 0.0) || !threshold.is_finite() {
            return Err(FocusError::InvalidConfig(format!(
                "threshold must be > 0 (got {threshold})"
            )));
        }
        if !(penalty_factor > 0.0 && penalty_factor < 1.0) {
            return Err(FocusError::InvalidConfig(format!(
                "penalty factor must be in (0, 1) (got {penalty_factor})"
            )));
        }
        Ok(Self {
            threshold,
            penalty_factor,
        })
    }
}

impl Scorer for FormulaScorer {
    fn score(&self, raw_power: f64) -> FocusResult<f64> {
        score_with_penalty(raw_power, self.threshold, self.penalty_factor)
    }

    fn name(&self) -> &'static str {
        "formula"
    }
}

/// Smoothing parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    /// EMA weight of the newest score; 1.0 disables smoothing
    pub alpha: f64,
    /// A score this far above the recent mean counts as a spike
    pub spike_margin: f64,
    /// Spikes are capped at recent mean + this
    pub spike_step: f64,
    /// Number of recent scores the spike detector looks at
    pub window: usize,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            alpha: 0.25,
            spike_margin: 0.4,
            spike_step: 0.2,
            window: 10,
        }
    }
}

/// Spike limiter followed by an exponential moving average
#[derive(Debug, Clone)]
pub struct Smoother {
    config: SmoothingConfig,
    recent: VecDeque<f64>,
    smoothed: Option<f64>,
}

impl Smoother {
    pub fn new(config: SmoothingConfig) -> Self {
        Self {
            recent: VecDeque::with_capacity(config.window.max(1)),
            smoothed: None,
            config,
        }
    }

    /// Feed one score and return the smoothed value
    pub fn apply(&mut self, score: f64) -> f64 {
        let mut value = score;

        if !self.recent.is_empty() {
            let mean = self.recent.iter().sum::<f64>() / self.recent.len() as f64;
            if value > mean + self.config.spike_margin {
                value = (mean + self.config.spike_step).min(1.0);
            }
        }

        self.recent.push_back(value);
        while self.recent.len() > self.config.window.max(1) {
            self.recent.pop_front();
        }

        let alpha = self.config.alpha;
        let next = match self.smoothed {
            None => value,
            Some(prev) => alpha * value + (1.0 - alpha) * prev,
        };
        self.smoothed = Some(next);
        next.clamp(0.0, 1.0)
    }

    pub fn reset(&mut self) {
        self.recent.clear();
        self.smoothed = None;
    }
}

/// Averages raw samples over fixed intervals of sample time.
///
/// The upstream rate (e.g. 250 Hz) is much higher than the scoring rate; one
/// averaged sample is emitted each time sample time crosses the end of the
/// current `interval`-second window. Windows are laid on a fixed grid from the
/// first sample so rounding does not accumulate.
#[derive(Debug, Clone)]
pub struct Downsampler {
    interval: f64,
    window_end: Option<f64>,
    sum: f64,
    count: usize,
}

/// Slack for timestamps that land on a window edge
const EDGE_EPSILON: f64 = 1e-9;

impl Downsampler {
    pub fn new(interval_secs: f64) -> Self {
        Self {
            interval: interval_secs.max(0.0),
            window_end: None,
            sum: 0.0,
            count: 0,
        }
    }

    /// Add a sample; returns the averaged sample when a window completes
    pub fn push(&mut self, sample: Sample) -> Option<Sample> {
        if self.interval == 0.0 {
            return Some(sample);
        }

        let end = *self
            .window_end
            .get_or_insert(sample.timestamp + self.interval);
        self.sum += sample.band_power;
        self.count += 1;

        if sample.timestamp < end - EDGE_EPSILON {
            return None;
        }

        let averaged = Sample::new(self.sum / self.count as f64, sample.timestamp);
        self.sum = 0.0;
        self.count = 0;
        // after a gap, restart the grid instead of emitting a burst
        let next = end + self.interval;
        self.window_end = Some(if sample.timestamp >= next {
            sample.timestamp + self.interval
        } else {
            next
        });
        Some(averaged)
    }

    /// Number of samples waiting in the current window
    pub fn pending(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.window_end = None;
        self.sum = 0.0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_power_scores_zero() {
        for threshold in [0.5, 20.0, 70.0, 1e6] {
            assert_eq!(score(0.0, threshold).unwrap(), 0.0);
        }
    }

    #[test]
    fn test_ratio_one_hits_penalty_region() {
        // ceiling = 20 * 3.5 = 70, ratio = 1, sqrt = 1, 0.75 + 0.25 * 0.5
        let value = score(70.0, 20.0).unwrap();
        assert!((value - 0.875).abs() < 1e-12);
    }

    #[test]
    fn test_below_knee_is_plain_sqrt() {
        // ratio 0.25 -> sqrt 0.5, below the knee
        let value = score(17.5, 20.0).unwrap();
        assert!((value - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_saturates_at_one() {
        assert_eq!(score(1e9, 20.0).unwrap(), 1.0);
        // value' = 1 exactly when sqrt(ratio) = 1.25
        let at_edge = score(70.0 * 1.5625, 20.0).unwrap();
        assert!((at_edge - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_monotone_and_bounded() {
        for threshold in [1.0, 20.0, 70.0, 150.0] {
            let mut previous = 0.0;
            for step in 0..2000 {
                let power = step as f64 * threshold / 100.0;
                let value = score(power, threshold).unwrap();
                assert!((0.0..=1.0).contains(&value));
                assert!(value >= previous, "score decreased at power {power}");
                previous = value;
            }
        }
    }

    #[test]
    fn test_invalid_threshold() {
        assert!(matches!(
            score(10.0, 0.0),
            Err(FocusError::InvalidConfig(_))
        ));
        assert!(matches!(
            score(10.0, -5.0),
            Err(FocusError::InvalidConfig(_))
        ));
        assert!(matches!(
            score(10.0, f64::NAN),
            Err(FocusError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invalid_sample() {
        assert!(matches!(
            score(f64::NAN, 20.0),
            Err(FocusError::InvalidSample(_))
        ));
        assert!(matches!(
            score(f64::INFINITY, 20.0),
            Err(FocusError::InvalidSample(_))
        ));
        assert!(matches!(
            score(-0.5, 20.0),
            Err(FocusError::InvalidSample(_))
        ));
    }

    #[test]
    fn test_formula_scorer_matches_free_function() {
        let scorer = FormulaScorer::new(70.0, DEFAULT_PENALTY_FACTOR).unwrap();
        for power in [0.0, 10.0, 100.0, 245.0, 400.0] {
            assert_eq!(scorer.score(power).unwrap(), score(power, 70.0).unwrap());
        }
        assert!(FormulaScorer::new(70.0, 1.0).is_err());
        assert!(FormulaScorer::new(0.0, 0.5).is_err());
    }

    #[test]
    fn test_smoother_limits_spikes() {
        let mut smoother = Smoother::new(SmoothingConfig {
            alpha: 1.0,
            ..SmoothingConfig::default()
        });
        assert_eq!(smoother.apply(0.2), 0.2);
        // 0.9 is more than 0.4 above the mean 0.2, capped to 0.4
        assert!((smoother.apply(0.9) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_smoother_ema() {
        let mut smoother = Smoother::new(SmoothingConfig {
            alpha: 0.5,
            spike_margin: 1.0,
            ..SmoothingConfig::default()
        });
        assert_eq!(smoother.apply(0.4), 0.4);
        assert!((smoother.apply(0.6) - 0.5).abs() < 1e-12);
        smoother.reset();
        assert_eq!(smoother.apply(0.8), 0.8);
    }

    #[test]
    fn test_downsampler_averages_window() {
        let mut ds = Downsampler::new(0.1);
        let mut emitted = Vec::new();
        // 250 Hz for 0.5 s
        for i in 0..125 {
            let t = i as f64 / 250.0;
            if let Some(s) = ds.push(Sample::new(if i % 2 == 0 { 10.0 } else { 20.0 }, t)) {
                emitted.push(s);
            }
        }
        assert_eq!(emitted.len(), 4);
        for s in &emitted {
            assert!((s.band_power - 15.0).abs() < 0.5);
        }
    }

    #[test]
    fn test_downsampler_restarts_after_gap() {
        let mut ds = Downsampler::new(0.1);
        assert!(ds.push(Sample::new(1.0, 0.0)).is_none());
        assert_eq!(ds.push(Sample::new(3.0, 0.1)), Some(Sample::new(2.0, 0.1)));
        // five seconds of silence produce one snapshot, not fifty
        assert_eq!(ds.push(Sample::new(5.0, 5.0)), Some(Sample::new(5.0, 5.0)));
        assert!(ds.push(Sample::new(5.0, 5.05)).is_none());
        assert_eq!(ds.pending(), 1);
    }

    #[test]
    fn test_downsampler_passthrough() {
        let mut ds = Downsampler::new(0.0);
        let sample = Sample::new(3.0, 1.0);
        assert_eq!(ds.push(sample), Some(sample));
        assert_eq!(ds.pending(), 0);
    }
}
