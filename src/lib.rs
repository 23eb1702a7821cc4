//! Focus Drive - attention scores from biosignal band power, fanned out over UDP
//!
//! A relay reads band-power samples from a source, turns each into a bounded
//! attention score and pushes a snapshot to every registered consumer:
//! source → score transform → (calibration) → relay → consumer adapter → session.
//!
//! ## Modules
//!
//! - **Relay**: ingestion loop, endpoint registry and non-blocking fan-out
//! - **Consumer**: sequence filtering plus game (session) and dashboard sinks
//! - **Session**: calibration and race state machine driven by consumer scores

pub mod calibration;
pub mod config;
pub mod consumer;
pub mod error;
pub mod pipeline;
pub mod relay;
pub mod score;
pub mod session;
pub mod source;
pub mod types;
pub mod wire;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use calibration::{CalibrationConfig, CalibrationEngine, CalibrationOutcome};
pub use config::{ConsumerConfig, RelayConfig};
pub use consumer::{run_consumer, ConsumerAdapter, DashboardSink, GameSink, ScoreSink};
pub use error::{FocusError, FocusResult};
pub use pipeline::{run_ingest, ScoreStage};
pub use relay::Relay;
pub use score::{score, FormulaScorer, Scorer};
pub use session::{SessionConfig, SessionEvent, SessionMachine};
pub use source::{create_source, Source, SourceSpec};
pub use wire::{WireMessage, WIRE_VERSION};

/// Crate version, reported by `focusd doctor`
pub const FOCUS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name used in diagnostics
pub const PRODUCER_NAME: &str = "focus-drive";
