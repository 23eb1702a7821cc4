//! Synthetic band-power generator
//!
//! Simulates a beta-band signal whose amplitude follows a focus level made of
//! a slow and a fast oscillation, plus amplitude noise. The band power of a
//! sinusoid with amplitude `a` is `a^2 / 2`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};

use super::{Source, SourceEvent};
use crate::error::{FocusError, FocusResult};
use crate::types::Sample;

/// Simulated focus level at `t` seconds, in [0.2, 1.0]
pub fn focus_level(t: f64) -> f64 {
    let level = 0.5 + 0.3 * (t / 5.0).sin() + 0.2 * t.sin();
    level.clamp(0.2, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub rate_hz: f64,
    /// Beta amplitude at full focus
    pub amplitude: f64,
    /// Uniform amplitude noise in +/- this range
    pub noise: f64,
    /// Fixed seed for reproducible streams
    pub seed: Option<u64>,
    /// Pace samples to the wall clock; off produces samples as fast as pulled
    pub realtime: bool,
    /// Stop with end-of-stream after this many seconds of sample time
    pub duration_secs: Option<f64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            rate_hz: 250.0,
            amplitude: 15.0,
            noise: 2.0,
            seed: None,
            realtime: true,
            duration_secs: None,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    rng: StdRng,
    index: u64,
    started: Instant,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> FocusResult<Self> {
        if !(config.rate_hz > 0.0) || !config.rate_hz.is_finite() {
            return Err(FocusError::SourceInit(format!(
                "synthetic rate must be > 0 Hz (got {})",
                config.rate_hz
            )));
        }
        if config.amplitude < 0.0 || config.noise < 0.0 {
            return Err(FocusError::SourceInit(
                "synthetic amplitude and noise must be >= 0".into(),
            ));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            rng,
            index: 0,
            started: Instant::now(),
        })
    }

    fn sample_at(&mut self, t: f64) -> Sample {
        let jitter = if self.config.noise > 0.0 {
            self.rng.gen_range(-self.config.noise..=self.config.noise)
        } else {
            0.0
        };
        let amplitude = (focus_level(t) * self.config.amplitude + jitter).max(0.0);
        Sample::new(0.5 * amplitude * amplitude, t)
    }
}

impl Source for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn next_sample(&mut self, timeout: Duration) -> FocusResult<SourceEvent> {
        let t = self.index as f64 / self.config.rate_hz;
        if let Some(limit) = self.config.duration_secs {
            if t >= limit {
                return Ok(SourceEvent::EndOfStream);
            }
        }

        if self.config.realtime {
            let due = self.started + Duration::from_secs_f64(t);
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    thread::sleep(timeout);
                    return Ok(SourceEvent::Timeout);
                }
                thread::sleep(wait);
            }
        }

        self.index += 1;
        Ok(SourceEvent::Sample(self.sample_at(t)))
    }

    fn reconnect(&mut self) -> FocusResult<()> {
        self.index = 0;
        self.started = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(seed: u64) -> SyntheticConfig {
        SyntheticConfig {
            seed: Some(seed),
            realtime: false,
            ..SyntheticConfig::default()
        }
    }

    fn drain(source: &mut SyntheticSource, n: usize) -> Vec<Sample> {
        (0..n)
            .filter_map(|_| match source.next_sample(Duration::from_millis(10)).unwrap() {
                SourceEvent::Sample(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_focus_level_bounds() {
        for i in 0..10_000 {
            let level = focus_level(i as f64 * 0.01);
            assert!((0.2..=1.0).contains(&level));
        }
    }

    #[test]
    fn test_seeded_stream_is_reproducible() {
        let a = drain(&mut SyntheticSource::new(fast(42)).unwrap(), 500);
        let b = drain(&mut SyntheticSource::new(fast(42)).unwrap(), 500);
        assert_eq!(a, b);
        assert_eq!(a.len(), 500);
    }

    #[test]
    fn test_samples_are_valid_and_timed() {
        let samples = drain(&mut SyntheticSource::new(fast(1)).unwrap(), 1000);
        for (i, sample) in samples.iter().enumerate() {
            sample.validate().unwrap();
            assert!((sample.timestamp - i as f64 / 250.0).abs() < 1e-9);
            // amplitude <= 15 + 2
            assert!(sample.band_power <= 0.5 * 17.0 * 17.0);
        }
    }

    #[test]
    fn test_duration_ends_stream() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            rate_hz: 10.0,
            duration_secs: Some(1.0),
            ..fast(3)
        })
        .unwrap();
        assert_eq!(drain(&mut source, 50).len(), 10);
        assert_eq!(
            source.next_sample(Duration::from_millis(1)).unwrap(),
            SourceEvent::EndOfStream
        );
    }

    #[test]
    fn test_rejects_bad_rate() {
        let err = SyntheticSource::new(SyntheticConfig {
            rate_hz: 0.0,
            ..SyntheticConfig::default()
        })
        .err()
        .unwrap();
        assert!(err.is_fatal());
    }
}
