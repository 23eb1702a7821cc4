//! Pipeline orchestration
//!
//! Stages, in order:
//! 1. Downsampler - average raw samples over the update interval
//! 2. Scorer - band power to a [0, 1] score
//! 3. Smoother - spike limiter and EMA
//! 4. ReadyTracker - relay-side "attending" flag
//! 5. CalibrationEngine - optional relay-side calibration window
//!
//! `ScoreStage` runs the stages for one sample. `run_ingest` is the relay's
//! ingestion loop: it pulls from the source with a bounded timeout, feeds the
//! relay, detects upstream loss and reconnects with backoff.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::calibration::{CalibrationEngine, CalibrationOutcome, CalibrationState};
use crate::config::RelayConfig;
use crate::error::{FocusError, FocusResult};
use crate::relay::Relay;
use crate::score::{Downsampler, FormulaScorer, Scorer, Smoother};
use crate::source::{Source, SourceEvent};
use crate::types::{Phase, Sample, Score};

/// Relay-side ready flag: score above a threshold for at least `hold` seconds
#[derive(Debug, Clone)]
pub struct ReadyTracker {
    threshold: f64,
    hold: f64,
    above_since: Option<f64>,
}

impl ReadyTracker {
    pub fn new(threshold: f64, hold: f64) -> Self {
        Self {
            threshold,
            hold: hold.max(0.0),
            above_since: None,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        self.threshold = threshold;
        self.above_since = None;
    }

    pub fn update(&mut self, score: f64, timestamp: f64) -> bool {
        if score > self.threshold {
            let since = *self.above_since.get_or_insert(timestamp);
            timestamp - since >= self.hold
        } else {
            self.above_since = None;
            false
        }
    }

    pub fn reset(&mut self) {
        self.above_since = None;
    }
}

/// One scored snapshot, before it is encoded per role
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    /// Downsampled band power the score came from
    pub raw_power: f64,
    pub score: Score,
    pub ready: bool,
    pub phase: Option<Phase>,
    pub calibration_remaining: Option<f64>,
}

impl Default for Scored {
    fn default() -> Self {
        Self {
            raw_power: 0.0,
            score: Score::new(0.0, 0.0),
            ready: false,
            phase: None,
            calibration_remaining: None,
        }
    }
}

/// Sample -> snapshot transform owned by the relay
pub struct ScoreStage {
    scorer: Box<dyn Scorer>,
    raw_threshold: f64,
    downsampler: Downsampler,
    smoother: Smoother,
    ready: ReadyTracker,
    calibration: Option<CalibrationEngine>,
}

impl ScoreStage {
    /// Formula scorer with the configured threshold
    pub fn new(config: &RelayConfig) -> FocusResult<Self> {
        let scorer = FormulaScorer::new(config.threshold, config.penalty_factor)?;
        Ok(Self::with_scorer(Box::new(scorer), config))
    }

    /// Any scorer behind the same stages
    pub fn with_scorer(scorer: Box<dyn Scorer>, config: &RelayConfig) -> Self {
        debug!(scorer = scorer.name(), threshold = config.threshold, "score stage ready");
        Self {
            scorer,
            raw_threshold: config.threshold,
            downsampler: Downsampler::new(config.update_interval),
            smoother: Smoother::new(config.smoothing),
            ready: ReadyTracker::new(config.ready_threshold, config.ready_hold),
            calibration: config
                .calibrate
                .then(|| CalibrationEngine::new(config.calibration)),
        }
    }

    pub fn raw_threshold(&self) -> f64 {
        self.raw_threshold
    }

    pub fn calibration_outcome(&self) -> Option<CalibrationOutcome> {
        self.calibration.as_ref().and_then(|c| c.outcome())
    }

    /// Run one sample through the stages.
    ///
    /// `Ok(None)` while the current interval is still filling.
    pub fn process(&mut self, sample: Sample) -> FocusResult<Option<Scored>> {
        sample.validate()?;
        let Some(averaged) = self.downsampler.push(sample) else {
            return Ok(None);
        };

        let value = self.smoother.apply(self.scorer.score(averaged.band_power)?);
        let timestamp = averaged.timestamp;

        let mut phase = None;
        let mut calibration_remaining = None;
        if let Some(engine) = self.calibration.as_mut() {
            if engine.state() == CalibrationState::Idle {
                engine.start(timestamp);
            }
            if engine.state() == CalibrationState::Collecting {
                match engine.push(value, timestamp) {
                    Some(outcome) => {
                        info!(
                            decision = outcome.threshold.decision_threshold,
                            calibrated = outcome.calibrated,
                            "relay calibration complete"
                        );
                        self.ready.set_threshold(outcome.threshold.decision_threshold);
                    }
                    None => {
                        phase = Some(Phase::Calibrating);
                        calibration_remaining = Some(engine.remaining(timestamp));
                    }
                }
            }
        }

        Ok(Some(Scored {
            raw_power: averaged.band_power,
            score: Score::new(value, timestamp),
            ready: self.ready.update(value, timestamp),
            phase,
            calibration_remaining,
        }))
    }

    /// Drop any partially filled interval and ready hold, e.g. after a gap
    pub fn reset_interval(&mut self) {
        self.downsampler.reset();
        self.ready.reset();
    }
}

/// Exponential reconnect backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

/// Counters reported when the ingestion loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub samples: u64,
    pub invalid: u64,
    pub published: u64,
    pub dropped: u64,
    pub disconnects: u64,
}

/// Longest single blocking pull, so shutdown stays responsive
const MAX_PULL: Duration = Duration::from_millis(250);

/// How often the disconnected status is re-sent while upstream is down
const DISCONNECTED_HEARTBEAT: Duration = Duration::from_secs(1);

/// How long end of stream waits for the final status to leave the outboxes
const END_OF_STREAM_FLUSH: Duration = Duration::from_millis(500);

/// Drive the relay from `source` until end of stream or shutdown
pub fn run_ingest(
    source: &mut dyn Source,
    relay: &mut Relay,
    config: &RelayConfig,
    shutdown: &AtomicBool,
) -> FocusResult<IngestStats> {
    let connection_timeout = config.connection_timeout();
    let prune_every = (config.liveness_window() / 2).max(Duration::from_millis(100));
    let pull = connection_timeout.min(MAX_PULL);

    let mut stats = IngestStats::default();
    let mut backoff = Backoff::default();
    let mut last_sample = Instant::now();
    let mut last_prune = Instant::now();
    let mut disconnected = false;
    let mut next_reconnect = Instant::now();
    let mut last_status_broadcast = Instant::now();

    info!(source = source.name(), mode = ?relay.mode(), "ingestion started");

    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now.duration_since(last_prune) >= prune_every {
            relay.registry().prune(now);
            last_prune = now;
        }

        let event = match source.next_sample(pull) {
            Ok(event) => event,
            Err(FocusError::InvalidSample(reason)) => {
                stats.invalid += 1;
                if stats.invalid == 1 || stats.invalid % 100 == 0 {
                    warn!(invalid = stats.invalid, %reason, "dropping invalid sample");
                }
                continue;
            }
            Err(FocusError::UpstreamDisconnected(reason)) => {
                debug!(%reason, "upstream read failed");
                SourceEvent::Timeout
            }
            Err(err) => return Err(err),
        };

        let now = Instant::now();
        match event {
            SourceEvent::Sample(sample) => {
                stats.samples += 1;
                last_sample = now;
                if disconnected {
                    disconnected = false;
                    backoff.reset();
                }
                match relay.ingest(sample) {
                    Ok(Some(report)) => {
                        stats.published += 1;
                        stats.dropped += report.dropped as u64;
                    }
                    Ok(None) => {}
                    Err(FocusError::InvalidSample(reason)) => {
                        stats.invalid += 1;
                        if stats.invalid == 1 || stats.invalid % 100 == 0 {
                            warn!(invalid = stats.invalid, %reason, "dropping invalid sample");
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
            SourceEvent::Timeout => {
                if !disconnected && now.duration_since(last_sample) >= connection_timeout {
                    disconnected = true;
                    stats.disconnects += 1;
                    warn!(
                        silent_secs = now.duration_since(last_sample).as_secs_f64(),
                        "upstream disconnected"
                    );
                    relay.mark_disconnected()?;
                    last_status_broadcast = now;
                    next_reconnect = now + backoff.next_delay();
                }
                if disconnected {
                    if now.duration_since(last_status_broadcast) >= DISCONNECTED_HEARTBEAT {
                        relay.mark_disconnected()?;
                        last_status_broadcast = now;
                    }
                    if now >= next_reconnect {
                        match source.reconnect() {
                            Ok(()) => debug!("reconnect attempted"),
                            Err(e) => debug!(error = %e, "reconnect failed"),
                        }
                        next_reconnect = now + backoff.next_delay();
                    }
                }
            }
            SourceEvent::EndOfStream => {
                info!("upstream ended");
                if !disconnected {
                    relay.mark_disconnected()?;
                }
                if !relay.registry().flush(END_OF_STREAM_FLUSH) {
                    debug!("final status still queued at exit");
                }
                break;
            }
        }
    }

    info!(
        samples = stats.samples,
        published = stats.published,
        invalid = stats.invalid,
        disconnects = stats.disconnects,
        "ingestion stopped"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{EndpointRegistry, MemoryTransport};
    use crate::source::{SyntheticConfig, SyntheticSource};
    use crate::types::{Role, StreamStatus};
    use crate::wire;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn config(update_interval: f64) -> RelayConfig {
        RelayConfig {
            update_interval,
            ..RelayConfig::default()
        }
    }

    #[test]
    fn test_stage_downsamples() {
        let mut stage = ScoreStage::new(&config(0.1)).unwrap();
        let produced = (0..250)
            .filter_map(|i| stage.process(Sample::new(50.0, i as f64 / 250.0)).unwrap())
            .count();
        // one second at 250 Hz, one snapshot per 0.1 s
        assert!((9..=10).contains(&produced));
    }

    #[test]
    fn test_stage_rejects_invalid() {
        let mut stage = ScoreStage::new(&config(0.0)).unwrap();
        assert!(matches!(
            stage.process(Sample::new(-1.0, 0.0)),
            Err(FocusError::InvalidSample(_))
        ));
    }

    #[test]
    fn test_ready_hold() {
        let mut tracker = ReadyTracker::new(0.7, 3.0);
        assert!(!tracker.update(0.9, 0.0));
        assert!(!tracker.update(0.9, 2.9));
        assert!(tracker.update(0.9, 3.0));
        assert!(!tracker.update(0.5, 3.1));
        assert!(!tracker.update(0.9, 3.2));

        let mut instant = ReadyTracker::new(0.7, 0.0);
        assert!(instant.update(0.71, 0.0));
        assert!(!instant.update(0.7, 0.1));
    }

    #[test]
    fn test_relay_calibration_phase() {
        let mut relay_config = config(0.0);
        relay_config.calibrate = true;
        relay_config.calibration.window_secs = 1.0;
        relay_config.calibration.min_samples = 5;
        let mut stage = ScoreStage::new(&relay_config).unwrap();

        let first = stage.process(Sample::new(40.0, 0.0)).unwrap().unwrap();
        assert_eq!(first.phase, Some(Phase::Calibrating));
        assert_eq!(first.calibration_remaining, Some(1.0));

        let mut t = 0.0;
        let mut last = first;
        while last.phase.is_some() {
            t += 0.1;
            last = stage.process(Sample::new(40.0, t)).unwrap().unwrap();
        }
        let outcome = stage.calibration_outcome().unwrap();
        assert!(outcome.calibrated);
        assert!(last.calibration_remaining.is_none());
    }

    #[test]
    fn test_backoff_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    /// Plays back a script of events, then ends
    struct ScriptedSource {
        events: VecDeque<FocusResult<SourceEvent>>,
        reconnects: usize,
    }

    impl Source for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        fn next_sample(&mut self, timeout: Duration) -> FocusResult<SourceEvent> {
            match self.events.pop_front() {
                Some(Ok(SourceEvent::Timeout)) => {
                    std::thread::sleep(timeout);
                    Ok(SourceEvent::Timeout)
                }
                Some(event) => event,
                None => Ok(SourceEvent::EndOfStream),
            }
        }

        fn reconnect(&mut self) -> FocusResult<()> {
            self.reconnects += 1;
            Ok(())
        }
    }

    fn harness(config: &RelayConfig) -> (Relay, Arc<MemoryTransport>, SocketAddr) {
        let transport = Arc::new(MemoryTransport::default());
        let registry = Arc::new(EndpointRegistry::new(
            transport.clone(),
            256,
            config.liveness_window(),
        ));
        let relay = Relay::new(config.mode, ScoreStage::new(config).unwrap(), registry);
        let target = SocketAddr::from(([127, 0, 0, 1], 9100));
        relay.register_endpoint(Role::Game, target).unwrap();
        (relay, transport, target)
    }

    #[test]
    fn test_loop_skips_bad_samples_and_detects_loss() {
        let mut relay_config = config(0.0);
        relay_config.connection_timeout = 0.05;
        let (mut relay, transport, target) = harness(&relay_config);

        let mut source = ScriptedSource {
            events: VecDeque::from(vec![
                Ok(SourceEvent::Sample(Sample::new(30.0, 0.0))),
                Err(FocusError::InvalidSample("NaN".into())),
                Ok(SourceEvent::Sample(Sample::new(f64::INFINITY, 0.1))),
                Ok(SourceEvent::Sample(Sample::new(30.0, 0.2))),
                Ok(SourceEvent::Timeout),
                Ok(SourceEvent::Timeout),
                Ok(SourceEvent::Timeout),
                Ok(SourceEvent::Sample(Sample::new(30.0, 1.0))),
            ]),
            reconnects: 0,
        };

        let shutdown = AtomicBool::new(false);
        let stats = run_ingest(&mut source, &mut relay, &relay_config, &shutdown).unwrap();

        assert_eq!(stats.samples, 4);
        assert_eq!(stats.invalid, 2);
        assert_eq!(stats.published, 3);
        assert_eq!(stats.disconnects, 1);
        assert!(source.reconnects >= 1);
        // end of stream leaves the relay disconnected
        assert_eq!(relay.status(), StreamStatus::Disconnected);

        let statuses: Vec<StreamStatus> = transport
            .sent_to(target)
            .iter()
            .map(|p| wire::decode(p).unwrap().status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                StreamStatus::Live,
                StreamStatus::Live,
                StreamStatus::Disconnected,
                StreamStatus::Live,
                StreamStatus::Disconnected,
            ]
        );
    }

    #[test]
    fn test_end_of_stream_is_broadcast_as_disconnected() {
        let relay_config = config(0.0);
        let (mut relay, transport, target) = harness(&relay_config);
        let mut source = ScriptedSource {
            events: VecDeque::from(vec![Ok(SourceEvent::Sample(Sample::new(400.0, 0.0)))]),
            reconnects: 0,
        };

        let shutdown = AtomicBool::new(false);
        let stats = run_ingest(&mut source, &mut relay, &relay_config, &shutdown).unwrap();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.disconnects, 0);

        // flushed before run_ingest returned
        let messages: Vec<_> = transport
            .sent_to(target)
            .iter()
            .map(|p| wire::decode(p).unwrap())
            .collect();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].status, StreamStatus::Live);
        assert!(messages[0].ready);
        assert_eq!(messages[1].status, StreamStatus::Disconnected);
        assert!(!messages[1].ready);
        assert_eq!(messages[1].score, messages[0].score);
    }

    /// Rejects every frame, slowly, until its deadline passes
    struct GarbageSource {
        until: Instant,
    }

    impl Source for GarbageSource {
        fn name(&self) -> &str {
            "garbage"
        }

        fn next_sample(&mut self, _timeout: Duration) -> FocusResult<SourceEvent> {
            if Instant::now() >= self.until {
                return Ok(SourceEvent::EndOfStream);
            }
            std::thread::sleep(Duration::from_millis(10));
            Err(FocusError::InvalidSample("unparseable frame".into()))
        }

        fn reconnect(&mut self) -> FocusResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_invalid_frames_do_not_stall_pruning() {
        let mut relay_config = config(0.0);
        relay_config.liveness_window = 0.1;
        let (mut relay, _transport, target) = harness(&relay_config);
        assert!(relay.registry().contains(Role::Game, target));

        let mut source = GarbageSource {
            until: Instant::now() + Duration::from_millis(400),
        };
        let shutdown = AtomicBool::new(false);
        let stats = run_ingest(&mut source, &mut relay, &relay_config, &shutdown).unwrap();

        assert!(stats.invalid > 0);
        assert_eq!(stats.samples, 0);
        assert!(!relay.registry().contains(Role::Game, target));
    }

    #[test]
    fn test_loop_honours_shutdown() {
        let relay_config = config(0.1);
        let (mut relay, _transport, _) = harness(&relay_config);
        let mut source = SyntheticSource::new(SyntheticConfig {
            seed: Some(9),
            realtime: false,
            ..SyntheticConfig::default()
        })
        .unwrap();

        let shutdown = AtomicBool::new(true);
        let stats = run_ingest(&mut source, &mut relay, &relay_config, &shutdown).unwrap();
        assert_eq!(stats, IngestStats::default());
    }

    #[test]
    fn test_synthetic_stream_until_end() {
        let relay_config = config(0.1);
        let (mut relay, transport, target) = harness(&relay_config);
        let mut source = SyntheticSource::new(SyntheticConfig {
            seed: Some(11),
            realtime: false,
            duration_secs: Some(2.0),
            ..SyntheticConfig::default()
        })
        .unwrap();

        let shutdown = AtomicBool::new(false);
        let stats = run_ingest(&mut source, &mut relay, &relay_config, &shutdown).unwrap();
        assert_eq!(stats.samples, 500);
        assert!((19..=20).contains(&stats.published));

        assert!(transport.wait_for(target, stats.published as usize, Duration::from_secs(2)));
        let seqs: Vec<u64> = transport
            .sent_to(target)
            .iter()
            .filter_map(|p| wire::decode(p).unwrap().seq)
            .collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }
}
