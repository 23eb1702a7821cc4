//! Consumer adapter
//!
//! Receives snapshots from the relay, discards duplicates and late arrivals by
//! sequence number, and feeds the rest to a sink: a `GameSink` driving a local
//! session, or a display-only `DashboardSink`. Malformed datagrams are counted
//! and dropped; nothing here ever stops the receive loop.

use serde::Serialize;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConsumerConfig;
use crate::error::FocusResult;
use crate::session::{SessionEvent, SessionMachine};
use crate::types::{
    FinishRecord, LinkHealth, Role, Score, ScoreHistory, SessionState, StreamStatus,
};
use crate::wire::{self, Control, WireMessage, MAX_DATAGRAM};

/// Receiver of accepted snapshots
pub trait ScoreSink {
    /// One fresh snapshot; `now` is the consumer's monotonic clock in seconds
    fn accept(&mut self, message: &WireMessage, now: f64);

    /// Time passed without a message
    fn tick(&mut self, _now: f64) {}

    /// Link health changed
    fn health_changed(&mut self, _health: LinkHealth) {}
}

/// Replaced relay instances remembered so their late datagrams stay stale
const RETIRED_INSTANCES: usize = 8;

/// What the adapter did with one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// Sequence not newer than the last accepted one, or from a replaced relay
    Stale,
    Malformed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdapterStats {
    pub received: u64,
    pub accepted: u64,
    pub stale: u64,
    pub decode_errors: u64,
    pub relay_restarts: u64,
}

pub struct ConsumerAdapter<S> {
    role: Role,
    sink: S,
    origin: Instant,
    instance: Option<Uuid>,
    retired: VecDeque<Uuid>,
    last_seq: Option<u64>,
    last_message_at: Option<f64>,
    health: LinkHealth,
    stats: AdapterStats,
}

impl<S: ScoreSink> ConsumerAdapter<S> {
    pub fn new(role: Role, sink: S) -> Self {
        Self {
            role,
            sink,
            origin: Instant::now(),
            instance: None,
            retired: VecDeque::with_capacity(RETIRED_INSTANCES),
            last_seq: None,
            last_message_at: None,
            health: LinkHealth::Waiting,
            stats: AdapterStats::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn health(&self) -> LinkHealth {
        self.health
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_seq
    }

    /// Seconds since the adapter was created
    pub fn elapsed(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Decode and handle one datagram
    pub fn handle_datagram(&mut self, bytes: &[u8], now: f64) -> Delivery {
        self.stats.received += 1;
        match wire::decode(bytes) {
            Ok(message) => self.handle_message(message, now),
            Err(e) => {
                self.stats.decode_errors += 1;
                if self.stats.decode_errors == 1 || self.stats.decode_errors % 100 == 0 {
                    warn!(errors = self.stats.decode_errors, error = %e, "dropping malformed datagram");
                }
                Delivery::Malformed
            }
        }
    }

    /// Handle an already decoded snapshot
    pub fn handle_message(&mut self, message: WireMessage, now: f64) -> Delivery {
        if let Some(instance) = message.instance {
            if self.retired.contains(&instance) {
                self.stats.stale += 1;
                debug!(%instance, seq = ?message.seq, "discarding snapshot from a replaced relay");
                return Delivery::Stale;
            }
            if self.instance != Some(instance) {
                if let Some(previous) = self.instance.replace(instance) {
                    info!(%instance, %previous, "relay restarted, resetting sequence");
                    self.stats.relay_restarts += 1;
                    if self.retired.len() == RETIRED_INSTANCES {
                        self.retired.pop_front();
                    }
                    self.retired.push_back(previous);
                }
                self.last_seq = None;
            }
        }

        if let Some(seq) = message.seq {
            if let Some(last) = self.last_seq {
                if seq <= last {
                    self.stats.stale += 1;
                    debug!(seq, last, "discarding stale snapshot");
                    return Delivery::Stale;
                }
            }
            self.last_seq = Some(seq);
        }

        self.stats.accepted += 1;
        self.last_message_at = Some(now);
        self.set_health(if message.is_live() {
            LinkHealth::Live
        } else {
            LinkHealth::UpstreamLost
        });
        self.sink.accept(&message, now);
        Delivery::Accepted
    }

    /// Advance local time; marks the link stale after `stale_after` seconds of silence
    pub fn tick(&mut self, now: f64, stale_after: f64) {
        if let Some(last) = self.last_message_at {
            if now - last > stale_after && self.health != LinkHealth::Stale {
                warn!(silent_secs = now - last, "relay link stale");
                self.set_health(LinkHealth::Stale);
            }
        }
        self.sink.tick(now);
    }

    fn set_health(&mut self, health: LinkHealth) {
        if health != self.health {
            self.health = health;
            self.sink.health_changed(health);
        }
    }
}

/// Game role: feeds live scores into a local session
pub struct GameSink {
    session: SessionMachine,
    auto_start: bool,
    events: Vec<SessionEvent>,
    health: LinkHealth,
}

impl GameSink {
    pub fn new(session: SessionMachine, auto_start: bool) -> Self {
        Self {
            session,
            auto_start,
            events: Vec::new(),
            health: LinkHealth::Waiting,
        }
    }

    pub fn session(&self) -> &SessionMachine {
        &self.session
    }

    pub fn state(&self) -> &SessionState {
        self.session.state()
    }

    pub fn health(&self) -> LinkHealth {
        self.health
    }

    pub fn start(&mut self, now: f64) {
        let events = self.session.start(now);
        self.events.extend(events);
    }

    /// Finished -> Idle; returns false in any other phase
    pub fn play_again(&mut self) -> bool {
        self.session.play_again()
    }

    /// Events produced since the last drain
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Finish records among the pending events, leaving the rest queued
    pub fn take_finished(&mut self) -> Vec<FinishRecord> {
        let mut finished = Vec::new();
        self.events.retain(|event| match event {
            SessionEvent::Finished(record) => {
                finished.push(record.clone());
                false
            }
            _ => true,
        });
        finished
    }

    /// Serializable view for embedding hosts
    pub fn view(&self) -> GameView<'_> {
        GameView {
            health: self.health,
            state: self.session.state(),
            threshold: self.session.threshold(),
        }
    }
}

#[derive(Serialize)]
pub struct GameView<'a> {
    pub health: LinkHealth,
    pub state: &'a SessionState,
    pub threshold: Option<crate::types::CalibrationThreshold>,
}

impl ScoreSink for GameSink {
    fn accept(&mut self, message: &WireMessage, now: f64) {
        // a re-sent last value while upstream is down must not move the car
        if !message.is_live() {
            return;
        }
        if self.auto_start && self.session.phase() == crate::types::Phase::Idle {
            self.start(now);
        }
        let events = self.session.on_score(Score::new(message.score, now), now);
        self.events.extend(events);
    }

    fn tick(&mut self, now: f64) {
        let events = self.session.tick(now);
        self.events.extend(events);
    }

    fn health_changed(&mut self, health: LinkHealth) {
        self.health = health;
    }
}

/// A completed stretch of the ready flag being raised
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReadyWindow {
    pub started_at: f64,
    pub duration: f64,
}

/// Bound on the ready-window log
const READY_LOG_LEN: usize = 100;

/// Dashboard role: display state only, no gameplay
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSink {
    history: ScoreHistory,
    ready_history: VecDeque<(f64, bool)>,
    ready_since: Option<f64>,
    ready_log: VecDeque<ReadyWindow>,
    latest: Option<WireMessage>,
    status: StreamStatus,
    health: LinkHealth,
}

impl DashboardSink {
    pub fn new(history_len: usize) -> Self {
        let history = ScoreHistory::new(history_len);
        Self {
            ready_history: VecDeque::with_capacity(history.capacity()),
            history,
            ready_since: None,
            ready_log: VecDeque::new(),
            latest: None,
            status: StreamStatus::Live,
            health: LinkHealth::Waiting,
        }
    }

    pub fn history(&self) -> &ScoreHistory {
        &self.history
    }

    pub fn ready_history(&self) -> impl Iterator<Item = &(f64, bool)> {
        self.ready_history.iter()
    }

    pub fn ready_log(&self) -> impl Iterator<Item = &ReadyWindow> {
        self.ready_log.iter()
    }

    pub fn latest(&self) -> Option<&WireMessage> {
        self.latest.as_ref()
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    pub fn health(&self) -> LinkHealth {
        self.health
    }

    /// Whether the operator should see "ready" right now
    pub fn is_ready(&self) -> bool {
        self.ready_since.is_some()
    }

    fn close_ready_window(&mut self, now: f64) {
        if let Some(started_at) = self.ready_since.take() {
            self.ready_log.push_back(ReadyWindow {
                started_at,
                duration: now - started_at,
            });
            while self.ready_log.len() > READY_LOG_LEN {
                self.ready_log.pop_front();
            }
        }
    }
}

impl ScoreSink for DashboardSink {
    fn accept(&mut self, message: &WireMessage, now: f64) {
        self.status = message.status;
        self.history.push(now, message.score);
        self.ready_history.push_back((now, message.ready));
        while self.ready_history.len() > self.history.capacity() {
            self.ready_history.pop_front();
        }

        match (message.ready, self.ready_since) {
            (true, None) => self.ready_since = Some(now),
            (false, Some(_)) => self.close_ready_window(now),
            _ => {}
        }
        self.latest = Some(message.clone());
    }

    fn health_changed(&mut self, health: LinkHealth) {
        self.health = health;
        if health == LinkHealth::Stale {
            // a silent relay cannot vouch for attention
            if let Some(last) = self.history.latest() {
                self.close_ready_window(last.timestamp);
            }
        }
    }
}

/// Send a hello for `role` from `socket` to the relay's registration port
pub fn send_hello(socket: &UdpSocket, role: Role, relay: SocketAddr) -> FocusResult<()> {
    socket.send_to(&Control::hello(role).encode()?, relay)?;
    Ok(())
}

/// Event-driven receive loop.
///
/// Blocks on the next datagram or the tick timer, whichever comes first,
/// updates the adapter and calls `on_update`. Sends a hello every heartbeat
/// when a relay address is configured. Returns when `shutdown` is raised.
pub fn run_consumer<S, F>(
    socket: &UdpSocket,
    adapter: &mut ConsumerAdapter<S>,
    config: &ConsumerConfig,
    shutdown: &AtomicBool,
    mut on_update: F,
) -> FocusResult<()>
where
    S: ScoreSink,
    F: FnMut(&mut ConsumerAdapter<S>) -> FocusResult<()>,
{
    socket.set_read_timeout(Some(config.tick().max(Duration::from_millis(1))))?;
    let stale_after = config.stale_after_secs;
    let heartbeat = config.heartbeat();
    let mut last_hello: Option<Instant> = None;
    let mut buffer = [0u8; MAX_DATAGRAM];

    info!(role = %adapter.role(), local = ?socket.local_addr().ok(), "consumer listening");

    while !shutdown.load(Ordering::Relaxed) {
        if let Some(relay) = config.relay {
            if last_hello.map(|t| t.elapsed() >= heartbeat).unwrap_or(true) {
                if let Err(e) = send_hello(socket, adapter.role(), relay) {
                    debug!(error = %e, relay = %relay, "hello failed");
                }
                last_hello = Some(Instant::now());
            }
        }

        match socket.recv_from(&mut buffer) {
            Ok((len, _peer)) => {
                let now = adapter.elapsed();
                adapter.handle_datagram(&buffer[..len], now);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock
                        | ErrorKind::TimedOut
                        | ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionRefused
                ) => {}
            Err(e) => return Err(e.into()),
        }

        let now = adapter.elapsed();
        adapter.tick(now, stale_after);
        on_update(adapter)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationConfig;
    use crate::session::SessionConfig;
    use crate::types::Phase;
    use crate::wire::WIRE_VERSION;
    use pretty_assertions::assert_eq;

    fn message(instance: Uuid, seq: u64, score: f64) -> WireMessage {
        WireMessage {
            v: WIRE_VERSION,
            kind: Role::Game,
            instance: Some(instance),
            seq: Some(seq),
            ts: seq as f64 * 0.1,
            score,
            ready: false,
            phase: None,
            status: StreamStatus::Live,
            summary: None,
        }
    }

    fn game_adapter() -> ConsumerAdapter<GameSink> {
        let session = SessionMachine::new(SessionConfig {
            calibration: CalibrationConfig {
                window_secs: 1.0,
                min_samples: 3,
                ..CalibrationConfig::default()
            },
            ..SessionConfig::default()
        });
        ConsumerAdapter::new(Role::Game, GameSink::new(session, true))
    }

    #[test]
    fn test_stale_sequence_leaves_state_untouched() {
        let relay = Uuid::new_v4();
        let mut adapter = game_adapter();

        let mut t = 0.0;
        for seq in 1..=20 {
            t += 0.1;
            assert_eq!(
                adapter.handle_message(message(relay, seq, 0.6), t),
                Delivery::Accepted
            );
        }
        assert_eq!(adapter.sink().state().phase, Phase::Racing);
        let before = serde_json::to_string(adapter.sink().state()).unwrap();

        t += 0.1;
        assert_eq!(
            adapter.handle_message(message(relay, 15, 1.0), t),
            Delivery::Stale
        );
        assert_eq!(
            adapter.handle_message(message(relay, 20, 1.0), t),
            Delivery::Stale
        );
        let after = serde_json::to_string(adapter.sink().state()).unwrap();
        assert_eq!(before, after);
        assert_eq!(adapter.stats().stale, 2);
        assert_eq!(adapter.last_sequence(), Some(20));
    }

    #[test]
    fn test_relay_restart_resets_sequence() {
        let mut adapter = game_adapter();
        adapter.handle_message(message(Uuid::new_v4(), 500, 0.5), 0.1);
        let restarted = Uuid::new_v4();
        assert_eq!(
            adapter.handle_message(message(restarted, 1, 0.5), 0.2),
            Delivery::Accepted
        );
        assert_eq!(adapter.stats().relay_restarts, 1);
        assert_eq!(adapter.last_sequence(), Some(1));
    }

    #[test]
    fn test_late_datagram_from_replaced_relay_is_stale() {
        let old_relay = Uuid::new_v4();
        let new_relay = Uuid::new_v4();
        let mut adapter = game_adapter();

        let mut t = 0.0;
        for seq in 1..=30 {
            t += 0.1;
            adapter.handle_message(message(old_relay, seq, 0.6), t);
        }
        for seq in 1..=5 {
            t += 0.1;
            adapter.handle_message(message(new_relay, seq, 0.6), t);
        }
        assert_eq!(adapter.sink().state().phase, Phase::Racing);
        let before = serde_json::to_string(adapter.sink().state()).unwrap();

        t += 0.1;
        assert_eq!(
            adapter.handle_message(message(old_relay, 29, 1.0), t),
            Delivery::Stale
        );
        assert_eq!(
            serde_json::to_string(adapter.sink().state()).unwrap(),
            before
        );

        // the current relay carries on where it left off
        assert_eq!(
            adapter.handle_message(message(new_relay, 6, 0.6), t),
            Delivery::Accepted
        );
        assert_eq!(adapter.stats().relay_restarts, 1);
        assert_eq!(adapter.stats().stale, 1);
        assert_eq!(adapter.last_sequence(), Some(6));
    }

    #[test]
    fn test_retired_instances_are_bounded() {
        let mut adapter = game_adapter();
        let relays: Vec<Uuid> = (0..RETIRED_INSTANCES + 2).map(|_| Uuid::new_v4()).collect();
        for (i, relay) in relays.iter().enumerate() {
            adapter.handle_message(message(*relay, 1, 0.5), i as f64);
        }
        assert_eq!(adapter.retired.len(), RETIRED_INSTANCES);
        // the oldest one was forgotten and reads as a fresh restart
        assert_eq!(
            adapter.handle_message(message(relays[0], 2, 0.5), 20.0),
            Delivery::Accepted
        );
        assert_eq!(
            adapter.handle_message(message(relays[2], 2, 0.5), 20.0),
            Delivery::Stale
        );
    }

    #[test]
    fn test_malformed_datagrams_are_counted() {
        let mut adapter = game_adapter();
        assert_eq!(adapter.handle_datagram(b"\x00\x01junk", 0.0), Delivery::Malformed);
        assert_eq!(adapter.handle_datagram(b"{\"v\":1", 0.0), Delivery::Malformed);
        assert_eq!(adapter.handle_datagram(b"0.5", 0.1), Delivery::Accepted);
        // legacy text has no sequence and is never stale
        assert_eq!(adapter.handle_datagram(b"0.5", 0.2), Delivery::Accepted);

        let stats = adapter.stats();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.decode_errors, 2);
        assert_eq!(stats.accepted, 2);
    }

    #[test]
    fn test_upstream_loss_freezes_game() {
        let relay = Uuid::new_v4();
        let mut adapter = game_adapter();
        let mut t = 0.0;
        for seq in 1..=20 {
            t += 0.1;
            adapter.handle_message(message(relay, seq, 0.9), t);
        }
        let progress = adapter.sink().state().progress;

        let mut lost = message(relay, 21, 0.9);
        lost.status = StreamStatus::Disconnected;
        adapter.handle_message(lost, t + 0.1);
        assert_eq!(adapter.health(), LinkHealth::UpstreamLost);
        assert_eq!(adapter.sink().health(), LinkHealth::UpstreamLost);
        assert_eq!(adapter.sink().state().progress, progress);
    }

    #[test]
    fn test_stale_link_detection() {
        let mut adapter = game_adapter();
        adapter.tick(100.0, 2.0);
        assert_eq!(adapter.health(), LinkHealth::Waiting);

        adapter.handle_message(message(Uuid::new_v4(), 1, 0.5), 1.0);
        assert_eq!(adapter.health(), LinkHealth::Live);
        adapter.tick(2.5, 2.0);
        assert_eq!(adapter.health(), LinkHealth::Live);
        adapter.tick(3.5, 2.0);
        assert_eq!(adapter.health(), LinkHealth::Stale);
    }

    #[test]
    fn test_game_finish_records() {
        let relay = Uuid::new_v4();
        let mut adapter = game_adapter();
        let mut t = 0.0;
        let mut seq = 0;
        while adapter.sink().state().phase != Phase::Finished && seq < 5000 {
            seq += 1;
            t += 0.1;
            adapter.handle_message(message(relay, seq, 1.0), t);
        }
        let records = adapter.sink_mut().take_finished();
        assert_eq!(records.len(), 1);
        assert!(records[0].finish_time > 0.0);
        assert!(adapter
            .sink_mut()
            .drain_events()
            .iter()
            .all(|e| !matches!(e, SessionEvent::Finished(_))));

        assert!(adapter.sink_mut().play_again());
        assert_eq!(adapter.sink().state().phase, Phase::Idle);
    }

    #[test]
    fn test_dashboard_ready_windows() {
        let relay = Uuid::new_v4();
        let mut adapter = ConsumerAdapter::new(Role::Dashboard, DashboardSink::new(3));
        let flags = [false, true, true, true, false, true];
        for (i, ready) in flags.iter().enumerate() {
            let mut msg = message(relay, i as u64 + 1, 0.5);
            msg.kind = Role::Dashboard;
            msg.ready = *ready;
            adapter.handle_message(msg, i as f64);
        }

        let sink = adapter.sink();
        assert_eq!(sink.history().len(), 3);
        assert_eq!(sink.ready_history().count(), 3);
        let log: Vec<ReadyWindow> = sink.ready_log().copied().collect();
        assert_eq!(
            log,
            vec![ReadyWindow {
                started_at: 1.0,
                duration: 3.0
            }]
        );
        assert!(sink.is_ready());
        assert_eq!(sink.latest().and_then(|m| m.seq), Some(6));
    }

    #[test]
    fn test_run_consumer_over_loopback() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = socket.local_addr().unwrap();
        let relay_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        relay_socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let config = ConsumerConfig {
            role: Role::Dashboard,
            relay: Some(relay_socket.local_addr().unwrap()),
            tick_secs: 0.01,
            ..ConsumerConfig::default()
        };

        // the consumer announces itself first
        let sender = std::thread::spawn(move || {
            let mut buf = [0u8; 256];
            let (len, from) = relay_socket.recv_from(&mut buf).unwrap();
            assert_eq!(
                Control::decode(&buf[..len]).unwrap(),
                Control::hello(Role::Dashboard)
            );
            assert_eq!(from, target);
            relay_socket.send_to(b"0.8000,1", target).unwrap();
        });

        let mut adapter = ConsumerAdapter::new(Role::Dashboard, DashboardSink::new(10));
        let shutdown = AtomicBool::new(false);
        let started = Instant::now();
        run_consumer(&socket, &mut adapter, &config, &shutdown, |adapter| {
            if adapter.stats().accepted > 0 || started.elapsed() > Duration::from_secs(3) {
                shutdown.store(true, Ordering::Relaxed);
            }
            Ok(())
        })
        .unwrap();
        sender.join().unwrap();

        assert_eq!(adapter.stats().accepted, 1);
        assert!(adapter.sink().is_ready());
    }
}
