//! Per-endpoint outbox
//!
//! Each endpoint gets a bounded queue drained by its own sender thread, so a
//! slow or unreachable host only ever stalls its own thread. The ingestion
//! loop enqueues with `try_send`; when the queue is full the datagram is
//! dropped and counted, since a stale snapshot is worth less than a fresh one.

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

use super::transport::Transport;
use crate::error::FocusResult;
use crate::types::Role;

/// Log the first failure and then every Nth
const FAILURE_LOG_EVERY: u64 = 100;

pub type Payload = Arc<[u8]>;

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Delivery counters for one endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub queued: u64,
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl DeliveryStats {
    /// Queued datagrams the sender thread has not finished with yet
    pub fn in_flight(&self) -> u64 {
        self.queued.saturating_sub(self.sent + self.failed)
    }
}

/// What happened to one offered datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Queue full; datagram discarded
    Dropped,
    /// Sender thread is gone
    Closed,
}

/// Cheap handle used to enqueue outside the registry lock
#[derive(Clone)]
pub struct OutboxHandle {
    pub address: SocketAddr,
    pub role: Role,
    tx: SyncSender<Payload>,
    counters: Arc<Counters>,
}

impl OutboxHandle {
    /// Enqueue without blocking
    pub fn offer(&self, payload: Payload) -> Offer {
        match self.tx.try_send(payload) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Offer::Queued
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % FAILURE_LOG_EVERY == 0 {
                    debug!(endpoint = %self.address, role = %self.role, dropped, "outbox full, dropping");
                }
                Offer::Dropped
            }
            Err(TrySendError::Disconnected(_)) => Offer::Closed,
        }
    }
}

/// Owns the queue of one endpoint; dropping it stops the sender thread
pub struct Outbox {
    handle: OutboxHandle,
}

impl Outbox {
    pub fn spawn(
        role: Role,
        address: SocketAddr,
        transport: Arc<dyn Transport>,
        capacity: usize,
    ) -> FocusResult<Self> {
        let (tx, rx) = mpsc::sync_channel::<Payload>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let thread_counters = Arc::clone(&counters);

        thread::Builder::new()
            .name(format!("send-{role}-{address}"))
            .spawn(move || {
                for payload in rx {
                    match transport.send_to(&payload, address) {
                        Ok(()) => {
                            thread_counters.sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            let failed = thread_counters.failed.fetch_add(1, Ordering::Relaxed) + 1;
                            if failed == 1 || failed % FAILURE_LOG_EVERY == 0 {
                                warn!(endpoint = %address, role = %role, failed, error = %err, "send failed");
                            }
                        }
                    }
                }
                debug!(endpoint = %address, role = %role, "sender stopped");
            })?;

        Ok(Self {
            handle: OutboxHandle {
                address,
                role,
                tx,
                counters,
            },
        })
    }

    pub fn handle(&self) -> OutboxHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> DeliveryStats {
        let counters = &self.handle.counters;
        DeliveryStats {
            queued: counters.queued.load(Ordering::Relaxed),
            sent: counters.sent.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
        }
    }
}
