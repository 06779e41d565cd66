//! Periodic eviction of connections that stopped talking.
//!
//! This is the only path that reclaims peers which vanished without a clean
//! close (network partition, suspended device). Every inbound frame refreshes
//! a connection's `last_seen`, so any client that pings more often than the
//! idle threshold is never reaped.

use std::sync::Arc;
use std::time::Duration;

use sonar_core::ConnectionId;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::registry::Registry;

/// One sweep: close and unregister every connection idle longer than `idle_timeout`.
pub fn reap_idle(registry: &Registry, idle_timeout: Duration) -> Vec<ConnectionId> {
    let stale = registry.idle_connections(idle_timeout);
    let mut evicted = Vec::with_capacity(stale.len());
    for id in stale {
        // A concurrent close may have removed it already; only count our own removals.
        if let Some(channel) = registry.unregister(&id) {
            channel.close();
            info!(conn_id = %id, "evicted idle connection");
            evicted.push(id);
        }
    }
    evicted
}

/// Spawn the recurring reaper. Runs until `cancel` fires.
pub fn start_reaper(
    registry: Arc<Registry>,
    interval: Duration,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = reap_idle(&registry, idle_timeout);
                    if !evicted.is_empty() {
                        info!(evicted = evicted.len(), remaining = registry.len(), "idle sweep");
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}
