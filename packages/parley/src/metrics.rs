//! Server metrics for observability
//!
//! Relaxed atomic counters; `snapshot()` is what `/api/metrics` serves.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::fanout::FanoutReport;
use crate::ws::AgentRoute;

#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open duplex connections
    pub active_connections: AtomicU64,
    /// Duplex connections accepted since start
    pub total_connections: AtomicU64,
    /// Currently open push (SSE) streams
    pub active_push_streams: AtomicU64,

    // Envelope metrics
    pub envelopes_received: AtomicU64,
    pub decode_errors: AtomicU64,

    // Fan-out metrics
    /// Successful per-subscriber writes
    pub fanout_writes: AtomicU64,
    /// Writes that failed or timed out (subscriber dropped)
    pub write_failures: AtomicU64,
    /// Push events dropped on a full subscriber queue
    pub push_drops: AtomicU64,

    // Agent routing
    pub agent_delivered: AtomicU64,
    pub agent_dropped: AtomicU64,

    // Sync
    pub messages_synced: AtomicU64,
    pub sync_conflicts: AtomicU64,

    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn push_stream_opened(&self) {
        self.active_push_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_stream_closed(&self) {
        self.active_push_streams.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn envelope_received(&self) {
        self.envelopes_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_failed(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a duplex fan-out result into the counters.
    pub fn record_fanout(&self, report: &FanoutReport) {
        self.fanout_writes
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.write_failures
            .fetch_add(report.removed.len() as u64, Ordering::Relaxed);
    }

    /// Fold a push fan-out result into the counters.
    pub fn record_push(&self, report: &FanoutReport) {
        self.fanout_writes
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.push_drops
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
    }

    pub fn record_agent_route(&self, route: AgentRoute) {
        match route {
            AgentRoute::Delivered => self.agent_delivered.fetch_add(1, Ordering::Relaxed),
            AgentRoute::NoAgent | AgentRoute::Failed => {
                self.agent_dropped.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    pub fn record_sync(&self, synced: usize, conflicts: usize) {
        self.messages_synced
            .fetch_add(synced as u64, Ordering::Relaxed);
        self.sync_conflicts
            .fetch_add(conflicts as u64, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                push_streams: self.active_push_streams.load(Ordering::Relaxed),
            },
            envelopes: EnvelopeMetrics {
                received: self.envelopes_received.load(Ordering::Relaxed),
                decode_errors: self.decode_errors.load(Ordering::Relaxed),
            },
            fanout: FanoutMetrics {
                writes: self.fanout_writes.load(Ordering::Relaxed),
                write_failures: self.write_failures.load(Ordering::Relaxed),
                push_drops: self.push_drops.load(Ordering::Relaxed),
            },
            agent: AgentMetrics {
                delivered: self.agent_delivered.load(Ordering::Relaxed),
                dropped: self.agent_dropped.load(Ordering::Relaxed),
            },
            sync: SyncMetrics {
                synced: self.messages_synced.load(Ordering::Relaxed),
                conflicts: self.sync_conflicts.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub envelopes: EnvelopeMetrics,
    pub fanout: FanoutMetrics,
    pub agent: AgentMetrics,
    pub sync: SyncMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub push_streams: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMetrics {
    pub received: u64,
    pub decode_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutMetrics {
    pub writes: u64,
    pub write_failures: u64,
    pub push_drops: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub synced: u64,
    pub conflicts: u64,
}
