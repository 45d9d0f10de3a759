//! Server counters and the periodic stats stream.

use crate::broadcast::BroadcastHub;
use crate::canvas::Canvases;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{trace, warn};

/// Connection counters shared by the acceptor and its workers.
#[derive(Debug, Default)]
pub struct ServerStats {
    active_connections: AtomicU64,
    total_connections: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a connection until the returned guard is dropped.
    pub fn track_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }
}

/// Decrements the active connection count on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    stats: Arc<ServerStats>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GridStats {
    pub id: u8,
    pub width: u16,
    pub height: u16,
    pub mutations: u64,
    pub last_modified: DateTime<Utc>,
}

/// One line of the stats stream.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub connections: u64,
    pub total_connections: u64,
    pub grids: Vec<GridStats>,
}

impl StatsSnapshot {
    pub fn capture(stats: &ServerStats, canvases: &Canvases) -> Self {
        Self {
            connections: stats.active_connections(),
            total_connections: stats.total_connections(),
            grids: canvases
                .iter()
                .map(|grid| GridStats {
                    id: grid.id(),
                    width: grid.width(),
                    height: grid.height(),
                    mutations: grid.mutations(),
                    last_modified: grid.last_modified(),
                })
                .collect(),
        }
    }

    /// Compact JSON, one record per stats message.
    pub fn to_json(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Push a snapshot into `hub` every `period` while anyone is listening.
pub async fn stats_loop(
    stats: Arc<ServerStats>,
    canvases: Arc<Canvases>,
    hub: Arc<BroadcastHub>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if hub.is_empty() {
            continue;
        }

        match StatsSnapshot::capture(&stats, &canvases).to_json() {
            Ok(line) => {
                let delivered = hub.push(line);
                trace!(delivered, "Pushed stats");
            }
            Err(e) => warn!(error = %e, "Failed to encode stats"),
        }
    }
}
