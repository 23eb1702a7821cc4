//! Session state machine
//!
//! Turns the live score stream plus calibration output into discrete game
//! events. One `SessionMachine` is one race; it is an explicit object owned by
//! the consumer and passed by reference, never ambient state.
//!
//! All `now` arguments are seconds on the consumer's local monotonic clock.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::calibration::{CalibrationConfig, CalibrationEngine, CalibrationOutcome};
use crate::error::{FocusError, FocusResult};
use crate::types::{
    CalibrationThreshold, FinishRecord, Phase, Score, SessionState, SessionSummary,
    DEFAULT_HISTORY_LEN,
};

/// Session parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Identifies the racer in finish records
    pub player_id: String,
    pub history_len: usize,
    pub calibration: CalibrationConfig,
    /// Largest progress advance a single score can produce
    pub progress_step: f64,
    /// Fraction of `progress_step` granted just above the gate
    pub crawl_fraction: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            player_id: "player".to_string(),
            history_len: DEFAULT_HISTORY_LEN,
            calibration: CalibrationConfig::default(),
            progress_step: 0.005,
            crawl_fraction: 0.15,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> FocusResult<()> {
        self.calibration.validate()?;
        if !(self.progress_step > 0.0 && self.progress_step <= 1.0) {
            return Err(FocusError::InvalidConfig(format!(
                "progress_step must be in (0, 1] (got {})",
                self.progress_step
            )));
        }
        if !(0.0..=1.0).contains(&self.crawl_fraction) {
            return Err(FocusError::InvalidConfig(format!(
                "crawl_fraction must be in [0, 1] (got {})",
                self.crawl_fraction
            )));
        }
        if self.history_len == 0 {
            return Err(FocusError::InvalidConfig(
                "history_len must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Something observable happened to the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    CalibrationStarted,
    Calibrated(CalibrationOutcome),
    /// Progress moved forward by `advance`
    Moved { progress: f64, advance: f64 },
    ReadyChanged(bool),
    Finished(FinishRecord),
}

/// Progress gained by one racing score
pub fn progress_advance(score: f64, gate: f64, step: f64, crawl: f64) -> f64 {
    if score < gate {
        return 0.0;
    }
    let span = 1.0 - gate;
    let effort = if span > 0.0 {
        ((score - gate) / span).clamp(0.0, 1.0)
    } else {
        1.0
    };
    step * (crawl + (1.0 - crawl) * effort)
}

/// Idle -> Calibrating -> Racing -> Finished -> Idle
#[derive(Debug, Clone)]
pub struct SessionMachine {
    config: SessionConfig,
    state: SessionState,
    calibration: CalibrationEngine,
    threshold: Option<CalibrationThreshold>,
    race_started_at: Option<f64>,
    racing_score_sum: f64,
    racing_scores: u64,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionMachine {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            state: SessionState::new(config.history_len),
            calibration: CalibrationEngine::new(config.calibration),
            threshold: None,
            race_started_at: None,
            racing_score_sum: 0.0,
            racing_scores: 0,
            config,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn threshold(&self) -> Option<CalibrationThreshold> {
        self.threshold
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_player(&mut self, player_id: impl Into<String>) {
        self.config.player_id = player_id.into();
    }

    /// Seconds left in the calibration window
    pub fn calibration_remaining(&self, now: f64) -> f64 {
        self.calibration.remaining(now)
    }

    /// Idle -> Calibrating. Returns no events when a session is already active.
    pub fn start(&mut self, now: f64) -> Vec<SessionEvent> {
        if self.state.phase != Phase::Idle {
            debug!(phase = self.state.phase.as_str(), "start ignored");
            return Vec::new();
        }
        self.calibration.start(now);
        self.state.phase = Phase::Calibrating;
        info!(player = %self.config.player_id, "session calibrating");
        vec![SessionEvent::CalibrationStarted]
    }

    /// Feed one score from the live stream
    pub fn on_score(&mut self, score: Score, now: f64) -> Vec<SessionEvent> {
        let value = score.value.clamp(0.0, 1.0);
        self.state.current_score = value;
        self.state.history.push(score.timestamp, value);

        let mut events = Vec::new();
        match self.state.phase {
            Phase::Idle | Phase::Finished => {}
            Phase::Calibrating => {
                if let Some(outcome) = self.calibration.push(value, now) {
                    self.begin_race(outcome, now, &mut events);
                }
            }
            Phase::Racing => self.race_step(value, now, &mut events),
        }
        events
    }

    /// Advance time without a score: closes an expired calibration window and
    /// keeps the race clock current.
    pub fn tick(&mut self, now: f64) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        match self.state.phase {
            Phase::Calibrating => {
                if let Some(outcome) = self.calibration.poll(now) {
                    self.begin_race(outcome, now, &mut events);
                }
            }
            Phase::Racing => self.update_elapsed(now),
            Phase::Idle | Phase::Finished => {}
        }
        events
    }

    /// Finished -> Idle. A fresh calibration is required afterwards.
    pub fn play_again(&mut self) -> bool {
        if self.state.phase != Phase::Finished {
            return false;
        }
        self.reset();
        true
    }

    /// Discard everything and return to Idle from any phase
    pub fn reset(&mut self) {
        self.state = SessionState::new(self.config.history_len);
        self.calibration.reset();
        self.threshold = None;
        self.race_started_at = None;
        self.racing_score_sum = 0.0;
        self.racing_scores = 0;
    }

    /// Summary of the current session for finish records and displays
    pub fn summary(&self) -> SessionSummary {
        let threshold = self
            .threshold
            .unwrap_or_else(|| self.config.calibration.fallback());
        SessionSummary {
            calibrated: self.state.calibrated,
            decision_threshold: threshold.decision_threshold,
            movement_gate: threshold.movement_gate,
            max_focus_streak: self.state.max_focus_streak,
            mean_score: if self.racing_scores > 0 {
                self.racing_score_sum / self.racing_scores as f64
            } else {
                0.0
            },
            scores_seen: self.racing_scores,
        }
    }

    fn begin_race(&mut self, outcome: CalibrationOutcome, now: f64, events: &mut Vec<SessionEvent>) {
        self.threshold = Some(outcome.threshold);
        self.state.calibrated = outcome.calibrated;
        self.state.phase = Phase::Racing;
        self.state.elapsed_secs = 0.0;
        self.state.progress = 0.0;
        self.race_started_at = Some(now);
        info!(
            decision = outcome.threshold.decision_threshold,
            gate = outcome.threshold.movement_gate,
            calibrated = outcome.calibrated,
            "race started"
        );
        events.push(SessionEvent::Calibrated(outcome));
    }

    fn update_elapsed(&mut self, now: f64) {
        if let Some(started) = self.race_started_at {
            let elapsed = (now - started).max(0.0);
            if elapsed > self.state.elapsed_secs {
                self.state.elapsed_secs = elapsed;
            }
        }
    }

    fn race_step(&mut self, value: f64, now: f64, events: &mut Vec<SessionEvent>) {
        let Some(threshold) = self.threshold else {
            return;
        };
        self.update_elapsed(now);
        self.racing_score_sum += value;
        self.racing_scores += 1;

        let ready = value > threshold.decision_threshold;
        if ready != self.state.ready_flag {
            self.state.ready_flag = ready;
            events.push(SessionEvent::ReadyChanged(ready));
        }
        if ready {
            self.state.focus_streak += 1;
            self.state.max_focus_streak = self.state.max_focus_streak.max(self.state.focus_streak);
        } else {
            self.state.focus_streak = 0;
        }

        let advance = progress_advance(
            value,
            threshold.movement_gate,
            self.config.progress_step,
            self.config.crawl_fraction,
        );
        if advance > 0.0 {
            self.state.progress = (self.state.progress + advance).min(1.0);
            events.push(SessionEvent::Moved {
                progress: self.state.progress,
                advance,
            });
        }

        if self.state.progress >= 1.0 {
            self.state.phase = Phase::Finished;
            let record = FinishRecord {
                player_id: self.config.player_id.clone(),
                finish_time: self.state.elapsed_secs,
                session_summary: self.summary(),
                recorded_at: Utc::now(),
            };
            info!(
                player = %record.player_id,
                finish_time = record.finish_time,
                "race finished"
            );
            events.push(SessionEvent::Finished(record));
        }
    }
}
