//! Distribution relay
//!
//! Turns upstream samples into snapshots and fans each snapshot out to every
//! registered endpoint of the matching role. Delivery is best effort: one
//! datagram per endpoint per snapshot, no acknowledgment, no retransmission.
//! Every snapshot carries the relay instance id and a sequence number so
//! consumers can discard stale or duplicated arrivals.

mod listener;
mod outbox;
mod registry;
mod transport;

pub use listener::spawn_listener;
pub use outbox::{DeliveryStats, Offer, OutboxHandle};
pub use registry::{EndpointRegistry, EndpointStatus, DEFAULT_MAX_ENDPOINTS};
pub use transport::{Transport, UdpTransport};

#[cfg(test)]
pub(crate) use transport::MemoryTransport;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::FocusResult;
use crate::pipeline::{ScoreStage, Scored};
use crate::types::{RelayMode, Role, Sample, StreamStatus};
use crate::wire::{DashboardSummary, WireMessage, WIRE_VERSION};

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub seq: u64,
    /// Datagrams handed to endpoint outboxes
    pub queued: usize,
    /// Datagrams discarded because an outbox was full
    pub dropped: usize,
}

pub struct Relay {
    mode: RelayMode,
    instance: Uuid,
    seq: u64,
    stage: ScoreStage,
    registry: Arc<EndpointRegistry>,
    status: StreamStatus,
    last: Option<Scored>,
}

impl Relay {
    pub fn new(mode: RelayMode, stage: ScoreStage, registry: Arc<EndpointRegistry>) -> Self {
        let instance = Uuid::new_v4();
        info!(%instance, mode = ?mode, "relay created");
        Self {
            mode,
            instance,
            seq: 0,
            stage,
            registry,
            status: StreamStatus::Live,
            last: None,
        }
    }

    /// Build a relay from configuration and pin the configured targets
    pub fn from_config(config: &RelayConfig, transport: Arc<dyn Transport>) -> FocusResult<Self> {
        config.validate()?;
        let registry = Arc::new(EndpointRegistry::new(
            transport,
            config.outbox_capacity,
            config.liveness_window(),
        )
        .with_max_endpoints(config.max_endpoints));
        for (role, address) in config.targets()? {
            registry.register(role, address, true)?;
        }
        Ok(Self::new(config.mode, ScoreStage::new(config)?, registry))
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    pub fn last_sequence(&self) -> u64 {
        self.seq
    }

    /// Register or refresh an endpoint seen on the wire.
    ///
    /// Roles the current mode does not serve are ignored.
    pub fn register_endpoint(&self, role: Role, address: SocketAddr) -> FocusResult<bool> {
        if !self.mode.serves(role) {
            debug!(role = %role, endpoint = %address, "role not served in this mode");
            return Ok(false);
        }
        self.registry.register(role, address, false)
    }

    /// Score one sample and fan the resulting snapshot out.
    ///
    /// Returns `None` while the sample is only accumulating toward the next
    /// scoring interval. Invalid samples fail with `InvalidSample` and leave
    /// the relay untouched.
    pub fn ingest(&mut self, sample: Sample) -> FocusResult<Option<PublishReport>> {
        let Some(scored) = self.stage.process(sample)? else {
            return Ok(None);
        };
        if self.status != StreamStatus::Live {
            info!("upstream recovered");
            self.status = StreamStatus::Live;
        }
        self.last = Some(scored);
        self.publish().map(Some)
    }

    /// Tell every consumer the upstream is gone.
    ///
    /// The last snapshot is re-sent with `status: disconnected` and the ready
    /// flag cleared so no UI keeps showing a frozen value as live.
    pub fn mark_disconnected(&mut self) -> FocusResult<PublishReport> {
        self.status = StreamStatus::Disconnected;
        self.stage.reset_interval();
        self.publish()
    }

    /// Snapshot message for `role` as it would be sent now
    pub fn message(&self, role: Role) -> WireMessage {
        let scored = self.last.clone().unwrap_or_default();
        let live = self.status == StreamStatus::Live;
        let summary = match role {
            Role::Game => None,
            Role::Dashboard => {
                let outcome = self.stage.calibration_outcome();
                Some(DashboardSummary {
                    raw_threshold: self.stage.raw_threshold(),
                    raw_power: scored.raw_power,
                    calibrated: outcome.map(|o| o.calibrated).unwrap_or(false),
                    decision_threshold: outcome.map(|o| o.threshold.decision_threshold),
                    movement_gate: outcome.map(|o| o.threshold.movement_gate),
                    calibration_remaining: scored.calibration_remaining,
                })
            }
        };
        WireMessage {
            v: WIRE_VERSION,
            kind: role,
            instance: Some(self.instance),
            seq: Some(self.seq),
            ts: scored.score.timestamp,
            score: scored.score.value,
            ready: live && scored.ready,
            phase: scored.phase,
            status: self.status,
            summary,
        }
    }

    fn publish(&mut self) -> FocusResult<PublishReport> {
        self.seq += 1;
        let mut report = PublishReport {
            seq: self.seq,
            ..PublishReport::default()
        };

        for role in self.mode.roles() {
            let targets = self.registry.targets(*role);
            if targets.is_empty() {
                continue;
            }
            let payload: Arc<[u8]> = Arc::from(self.message(*role).encode()?);
            for target in targets {
                match target.offer(Arc::clone(&payload)) {
                    Offer::Queued => report.queued += 1,
                    Offer::Dropped => report.dropped += 1,
                    Offer::Closed => {}
                }
            }
        }
        Ok(report)
    }
}
