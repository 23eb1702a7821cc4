//! Endpoint registry
//!
//! The set of downstream consumers, keyed by (role, address). Shared between
//! the ingestion loop (snapshots for fan-out) and the registration listener
//! (inserts and refreshes). One mutex guards the map and is only held for the
//! map operation itself: outboxes are created before taking the lock, and
//! removed outboxes are dropped after releasing it.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::outbox::{DeliveryStats, Outbox, OutboxHandle};
use super::transport::Transport;
use crate::error::FocusResult;
use crate::types::{ConsumerEndpoint, Role};

struct Entry {
    endpoint: ConsumerEndpoint,
    /// Configured explicitly; never pruned
    pinned: bool,
    outbox: Outbox,
}

/// Point-in-time view of one endpoint for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub role: Role,
    pub address: SocketAddr,
    pub pinned: bool,
    pub idle_secs: f64,
    pub delivery: DeliveryStats,
}

/// Default cap on registered endpoints; each one owns a sender thread
pub const DEFAULT_MAX_ENDPOINTS: usize = 64;

pub struct EndpointRegistry {
    entries: Mutex<HashMap<(Role, SocketAddr), Entry>>,
    transport: Arc<dyn Transport>,
    outbox_capacity: usize,
    liveness: Duration,
    max_endpoints: usize,
}

impl EndpointRegistry {
    pub fn new(transport: Arc<dyn Transport>, outbox_capacity: usize, liveness: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            transport,
            outbox_capacity,
            liveness,
            max_endpoints: DEFAULT_MAX_ENDPOINTS,
        }
    }

    /// Cap implicit registrations; pinned endpoints are always admitted
    pub fn with_max_endpoints(mut self, max_endpoints: usize) -> Self {
        self.max_endpoints = max_endpoints.max(1);
        self
    }

    pub fn liveness(&self) -> Duration {
        self.liveness
    }

    /// Register or refresh an endpoint. Returns true if it was new.
    pub fn register(&self, role: Role, address: SocketAddr, pinned: bool) -> FocusResult<bool> {
        self.register_at(role, address, pinned, Instant::now())
    }

    /// `register` with an explicit clock
    pub fn register_at(
        &self,
        role: Role,
        address: SocketAddr,
        pinned: bool,
        now: Instant,
    ) -> FocusResult<bool> {
        if self.refresh(role, address, pinned, now) {
            return Ok(false);
        }
        if !pinned && self.len() >= self.max_endpoints {
            warn!(role = %role, endpoint = %address, max = self.max_endpoints, "endpoint limit reached, ignoring registration");
            return Ok(false);
        }

        let outbox = Outbox::spawn(role, address, Arc::clone(&self.transport), self.outbox_capacity)?;
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&(role, address)) {
            // lost a race with another registration; ours is dropped below
            entry.endpoint.last_seen = now;
            entry.pinned |= pinned;
            return Ok(false);
        }
        entries.insert(
            (role, address),
            Entry {
                endpoint: ConsumerEndpoint {
                    role,
                    address,
                    last_seen: now,
                },
                pinned,
                outbox,
            },
        );
        drop(entries);

        info!(role = %role, endpoint = %address, pinned, "endpoint registered");
        Ok(true)
    }

    fn refresh(&self, role: Role, address: SocketAddr, pinned: bool, now: Instant) -> bool {
        match self.entries.lock().get_mut(&(role, address)) {
            Some(entry) => {
                entry.endpoint.last_seen = now;
                entry.pinned |= pinned;
                true
            }
            None => false,
        }
    }

    /// Remove implicit endpoints not seen within the liveness window
    pub fn prune(&self, now: Instant) -> Vec<ConsumerEndpoint> {
        let liveness = self.liveness;
        let removed: Vec<Entry> = {
            let mut entries = self.entries.lock();
            let stale: Vec<(Role, SocketAddr)> = entries
                .iter()
                .filter(|(_, e)| !e.pinned && now.saturating_duration_since(e.endpoint.last_seen) > liveness)
                .map(|(key, _)| *key)
                .collect();
            stale.iter().filter_map(|key| entries.remove(key)).collect()
        };

        removed
            .into_iter()
            .map(|entry| {
                info!(role = %entry.endpoint.role, endpoint = %entry.endpoint.address, "endpoint pruned");
                entry.endpoint
            })
            .collect()
    }

    /// Wait up to `deadline` for every outbox to hand its queue to the transport.
    ///
    /// Returns false if datagrams were still in flight when time ran out.
    pub fn flush(&self, deadline: Duration) -> bool {
        let started = Instant::now();
        loop {
            let in_flight: u64 = self
                .entries
                .lock()
                .values()
                .map(|e| e.outbox.stats().in_flight())
                .sum();
            if in_flight == 0 {
                return true;
            }
            if started.elapsed() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Outbox handles of every endpoint with `role`
    pub fn targets(&self, role: Role) -> Vec<OutboxHandle> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.endpoint.role == role)
            .map(|e| e.outbox.handle())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, role: Role, address: SocketAddr) -> bool {
        self.entries.lock().contains_key(&(role, address))
    }

    pub fn endpoints(&self) -> Vec<ConsumerEndpoint> {
        self.entries.lock().values().map(|e| e.endpoint.clone()).collect()
    }

    pub fn status(&self, now: Instant) -> Vec<EndpointStatus> {
        let mut status: Vec<EndpointStatus> = self
            .entries
            .lock()
            .values()
            .map(|e| EndpointStatus {
                role: e.endpoint.role,
                address: e.endpoint.address,
                pinned: e.pinned,
                idle_secs: now.saturating_duration_since(e.endpoint.last_seen).as_secs_f64(),
                delivery: e.outbox.stats(),
            })
            .collect();
        status.sort_by_key(|s| (s.role.as_str(), s.address));
        status
    }
}
