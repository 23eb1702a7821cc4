//! Core types for the Focus Drive pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: raw band-power samples, normalized scores, calibration output,
//! per-session game state and the endpoints the relay delivers to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Instant;

use crate::error::{FocusError, FocusResult};

/// Default number of points kept in a score history ring buffer
pub const DEFAULT_HISTORY_LEN: usize = 300;

/// One band-power reading from the upstream source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Aggregate band power (raw units, >= 0)
    pub band_power: f64,
    /// Monotonic timestamp in seconds
    pub timestamp: f64,
}

impl Sample {
    pub fn new(band_power: f64, timestamp: f64) -> Self {
        Self {
            band_power,
            timestamp,
        }
    }

    /// Reject non-finite or negative readings
    pub fn validate(&self) -> FocusResult<()> {
        if !self.band_power.is_finite() {
            return Err(FocusError::InvalidSample(format!(
                "non-finite band power {}",
                self.band_power
            )));
        }
        if self.band_power < 0.0 {
            return Err(FocusError::InvalidSample(format!(
                "negative band power {}",
                self.band_power
            )));
        }
        if !self.timestamp.is_finite() {
            return Err(FocusError::InvalidSample(format!(
                "non-finite timestamp {}",
                self.timestamp
            )));
        }
        Ok(())
    }
}

/// Normalized attention score in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub value: f64,
    pub timestamp: f64,
}

impl Score {
    pub fn new(value: f64, timestamp: f64) -> Self {
        Self { value, timestamp }
    }
}

/// Personalized thresholds produced once per session by calibration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationThreshold {
    /// Score above which the user counts as attending
    pub decision_threshold: f64,
    /// Score above which game progress advances
    pub movement_gate: f64,
    /// Number of scores the thresholds were derived from (0 for fallbacks)
    pub sample_count: usize,
}

/// Session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Calibrating,
    Racing,
    Finished,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Calibrating => "calibrating",
            Phase::Racing => "racing",
            Phase::Finished => "finished",
        }
    }
}

/// Consumer category; decides which message variant and port an endpoint gets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Game,
    Dashboard,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Game => "game",
            Role::Dashboard => "dashboard",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = FocusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "game" => Ok(Role::Game),
            "dashboard" => Ok(Role::Dashboard),
            other => Err(FocusError::InvalidConfig(format!("unknown role '{other}'"))),
        }
    }
}

/// Which message kinds the relay produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    Game,
    Dashboard,
    Both,
}

impl RelayMode {
    /// Whether messages for `role` are produced in this mode
    pub fn serves(&self, role: Role) -> bool {
        matches!(
            (self, role),
            (RelayMode::Both, _)
                | (RelayMode::Game, Role::Game)
                | (RelayMode::Dashboard, Role::Dashboard)
        )
    }

    pub fn roles(&self) -> &'static [Role] {
        match self {
            RelayMode::Game => &[Role::Game],
            RelayMode::Dashboard => &[Role::Dashboard],
            RelayMode::Both => &[Role::Game, Role::Dashboard],
        }
    }
}

impl FromStr for RelayMode {
    type Err = FocusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "game" => Ok(RelayMode::Game),
            "dashboard" => Ok(RelayMode::Dashboard),
            "both" => Ok(RelayMode::Both),
            other => Err(FocusError::InvalidConfig(format!("unknown mode '{other}'"))),
        }
    }
}

/// Upstream health as reported by the relay inside every message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// Samples are arriving normally
    Live,
    /// No sample within the connection timeout; the score is not current
    Disconnected,
}

impl Default for StreamStatus {
    fn default() -> Self {
        Self::Live
    }
}

/// Link health as seen from a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkHealth {
    /// Nothing received yet
    Waiting,
    /// Fresh messages with a live upstream
    Live,
    /// The relay reports its upstream source as lost
    UpstreamLost,
    /// No message from the relay within the staleness window
    Stale,
}

/// One point of score history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: f64,
    pub score: f64,
}

/// Bounded, ordered (timestamp, score) history used for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreHistory {
    points: VecDeque<HistoryPoint>,
    capacity: usize,
}

impl Default for ScoreHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

impl ScoreHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, timestamp: f64, score: f64) {
        self.points.push_back(HistoryPoint { timestamp, score });
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<HistoryPoint> {
        self.points.back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryPoint> {
        self.points.iter()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

/// Observable state of one race session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: Phase,
    /// Race time in seconds; only advances while racing
    pub elapsed_secs: f64,
    /// Race progress in [0, 1]; never decreases while racing
    pub progress: f64,
    /// Most recent score exceeded the decision threshold
    pub ready_flag: bool,
    /// False when calibration fell back to defaults
    pub calibrated: bool,
    pub current_score: f64,
    pub focus_streak: u32,
    pub max_focus_streak: u32,
    pub history: ScoreHistory,
}

impl SessionState {
    pub fn new(history_len: usize) -> Self {
        Self {
            phase: Phase::Idle,
            elapsed_secs: 0.0,
            progress: 0.0,
            ready_flag: false,
            calibrated: false,
            current_score: 0.0,
            focus_streak: 0,
            max_focus_streak: 0,
            history: ScoreHistory::new(history_len),
        }
    }
}

/// A downstream consumer known to the relay
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerEndpoint {
    pub role: Role,
    pub address: SocketAddr,
    pub last_seen: Instant,
}

/// Summary of a finished session handed to the leaderboard collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub calibrated: bool,
    pub decision_threshold: f64,
    pub movement_gate: f64,
    pub max_focus_streak: u32,
    pub mean_score: f64,
    pub scores_seen: u64,
}

/// Emitted once when a race finishes; consumed by external leaderboard storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishRecord {
    pub player_id: String,
    /// Race time in seconds (lower is better)
    pub finish_time: f64,
    pub session_summary: SessionSummary,
    pub recorded_at: DateTime<Utc>,
}
