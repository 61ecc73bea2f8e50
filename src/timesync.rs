//! Clock Synchronization
//!
//! Berkeley-style averaging driven by the coordinator. Each node keeps a
//! logical clock of wall time plus a random startup skew plus whatever
//! corrections it has received. The coordinator periodically reads every
//! reachable peer's clock, averages, and pushes each node its own delta.
//! Corrections may move a clock backward.

use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::WolfCoordConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, SyncEvent};
use crate::state::ClusterMembership;
use crate::time::WallClock;
use crate::transport::{ClockAdjustment, ClockReading, CoordinatorTime, PeerTransport};

/// Clock sync settings
#[derive(Debug, Clone)]
pub struct ClockSettings {
    /// Timeout for clock reads and pushes
    pub rpc_timeout: Duration,
    /// Startup skew is drawn from `-initial_skew_ms..=initial_skew_ms`
    pub initial_skew_ms: i64,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_millis(3000),
            initial_skew_ms: 4000,
        }
    }
}

impl From<&WolfCoordConfig> for ClockSettings {
    fn from(config: &WolfCoordConfig) -> Self {
        Self {
            rpc_timeout: config.rpc_timeout(),
            initial_skew_ms: config.clock.initial_skew_ms,
        }
    }
}

/// What a sync request did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Ran a Berkeley round as coordinator
    Round { mean: f64, participants: usize },
    /// Jumped to the last broadcast coordinator time
    Aligned { delta: i64 },
    /// Not coordinator and no coordinator time seen yet
    Skipped,
}

/// Clock status for display
#[derive(Debug, Clone, Serialize)]
pub struct ClockStatus {
    pub node_id: String,
    pub logical_time: i64,
    pub cumulative_offset: i64,
    pub is_coordinator: bool,
    pub known_peers: Vec<String>,
    pub last_sync: Option<i64>,
    pub last_coordinator_time: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedCoordinatorTime {
    coordinator_id: String,
    coordinator_time: i64,
    /// Local wall time when it arrived
    received_at: i64,
}

#[derive(Debug)]
struct ClockState {
    base_skew: i64,
    cumulative_offset: i64,
    is_coordinator: bool,
    last_sync: Option<i64>,
    coordinator_time: Option<CachedCoordinatorTime>,
    round_id: u64,
}

/// Mean of the readings and each node's correction toward it.
///
/// Corrections are whole milliseconds that always sum to zero: every node
/// targets the floored mean and the first `sum % n` nodes get one more.
pub fn berkeley_adjustments(readings: &[(String, i64)]) -> (f64, Vec<(String, i64)>) {
    if readings.is_empty() {
        return (0.0, Vec::new());
    }

    let n = readings.len() as i128;
    let sum: i128 = readings.iter().map(|(_, t)| *t as i128).sum();
    let floor = sum.div_euclid(n);
    let remainder = sum.rem_euclid(n) as usize;

    let deltas = readings
        .iter()
        .enumerate()
        .map(|(i, (id, t))| {
            let target = if i < remainder { floor + 1 } else { floor };
            (id.clone(), (target - *t as i128) as i64)
        })
        .collect();
    (sum as f64 / n as f64, deltas)
}

/// Berkeley clock synchronization for this node
pub struct ClockSync {
    node_id: String,
    settings: ClockSettings,
    cluster: Arc<ClusterMembership>,
    transport: Arc<dyn PeerTransport>,
    wall: Arc<dyn WallClock>,
    events: EventBus,
    state: RwLock<ClockState>,
}

impl ClockSync {
    /// Create a clock seeded with a random skew
    pub fn new(
        cluster: Arc<ClusterMembership>,
        transport: Arc<dyn PeerTransport>,
        wall: Arc<dyn WallClock>,
        settings: ClockSettings,
        events: EventBus,
    ) -> Self {
        let bound = settings.initial_skew_ms.abs();
        let base_skew = if bound > 0 {
            rand::thread_rng().gen_range(-bound..=bound)
        } else {
            0
        };
        tracing::debug!("Logical clock starts with {}ms skew", base_skew);

        Self {
            node_id: cluster.node_id().to_string(),
            settings,
            cluster,
            transport,
            wall,
            events,
            state: RwLock::new(ClockState {
                base_skew,
                cumulative_offset: 0,
                is_coordinator: false,
                last_sync: None,
                coordinator_time: None,
                round_id: 0,
            }),
        }
    }

    /// Replace the random startup skew
    pub fn with_skew(mut self, skew: i64) -> Self {
        self.state.get_mut().base_skew = skew;
        self
    }

    fn logical_at(&self, state: &ClockState) -> i64 {
        self.wall.now_millis() + state.base_skew + state.cumulative_offset
    }

    /// Current logical time in milliseconds
    pub async fn logical_time(&self) -> i64 {
        let state = self.state.read().await;
        self.logical_at(&state)
    }

    /// This node's reading for `GET /cluster/clock`
    pub async fn reading(&self) -> ClockReading {
        ClockReading {
            node_id: self.node_id.clone(),
            logical_time: self.logical_time().await,
        }
    }

    pub async fn is_coordinator(&self) -> bool {
        self.state.read().await.is_coordinator
    }

    /// Mirror the election result
    pub async fn set_coordinator(&self, is_coordinator: bool) {
        let mut state = self.state.write().await;
        if state.is_coordinator != is_coordinator {
            tracing::info!("Time sync coordinator status changed: {}", is_coordinator);
        }
        state.is_coordinator = is_coordinator;
    }

    /// Apply a correction; returns the new logical time
    pub async fn apply_delta(&self, delta: i64) -> i64 {
        let logical_time = {
            let mut state = self.state.write().await;
            state.cumulative_offset += delta;
            state.last_sync = Some(self.wall.now_millis());
            self.logical_at(&state)
        };
        tracing::info!("Applied clock adjustment of {}ms", delta);
        self.events.sync(SyncEvent::Adjusted {
            delta,
            logical_time,
        });
        logical_time
    }

    /// Apply a correction pushed by the coordinator
    pub async fn handle_adjustment(&self, adjustment: &ClockAdjustment) -> i64 {
        tracing::debug!(
            "Clock adjustment from {} (round {})",
            adjustment.from,
            adjustment.round_id
        );
        self.apply_delta(adjustment.delta).await
    }

    /// Run one Berkeley round. Only the coordinator may do this.
    pub async fn run_round(&self) -> Result<SyncOutcome> {
        let round_id = {
            let mut state = self.state.write().await;
            if !state.is_coordinator {
                return Err(Error::NotCoordinator(
                    state.coordinator_time.as_ref().map(|c| c.coordinator_id.clone()),
                ));
            }
            state.round_id += 1;
            state.round_id
        };

        tracing::info!("Starting Berkeley time synchronization (round {})", round_id);
        let peers = self.cluster.peers().await;
        let reads = peers.iter().map(|peer| async move {
            let sent = Instant::now();
            let result = self.transport.read_clock(peer, self.settings.rpc_timeout).await;
            let rtt = sent.elapsed();
            (peer, result.map(|r| (r, rtt)))
        });

        // Offsets from our own clock at the moment each reading arrived,
        // with the reading advanced by half the round trip
        let mut offsets = Vec::new();
        for (peer, result) in join_all(reads).await {
            match result {
                Ok((reading, rtt)) => {
                    let estimated = reading.logical_time + (rtt.as_millis() / 2) as i64;
                    offsets.push((peer.id.clone(), estimated - self.logical_time().await));
                    self.cluster.record_seen(&peer.id).await;
                }
                Err(e) => {
                    tracing::warn!("Excluding {} from sync round: {}", peer.id, e);
                    self.cluster.mark_unreachable(&peer.id).await;
                }
            }
        }

        let reference = self.logical_time().await;
        let mut readings = vec![(self.node_id.clone(), reference)];
        readings.extend(offsets.into_iter().map(|(id, off)| (id, reference + off)));

        let (mean, adjustments) = berkeley_adjustments(&readings);
        let own_delta = adjustments
            .iter()
            .find(|(id, _)| *id == self.node_id)
            .map(|(_, d)| *d)
            .unwrap_or(0);
        {
            let mut state = self.state.write().await;
            state.cumulative_offset += own_delta;
            state.last_sync = Some(self.wall.now_millis());
        }

        tracing::info!(
            "Berkeley sync completed: {} nodes, own adjustment {}ms",
            readings.len(),
            own_delta
        );
        self.events.sync(SyncEvent::RoundCompleted {
            mean,
            adjustments: adjustments.clone(),
        });

        let pushes = adjustments
            .iter()
            .filter(|(id, _)| *id != self.node_id)
            .filter_map(|(id, delta)| {
                peers.iter().find(|p| p.id == *id).map(|peer| (peer, *delta))
            })
            .map(|(peer, delta)| async move {
                let adjustment = ClockAdjustment {
                    from: self.node_id.clone(),
                    round_id,
                    delta,
                };
                let result = self
                    .transport
                    .adjust_clock(peer, &adjustment, self.settings.rpc_timeout)
                    .await;
                (peer, result)
            });
        for (peer, result) in join_all(pushes).await {
            if let Err(e) = result {
                tracing::warn!("Failed to push clock adjustment to {}: {}", peer.id, e);
            }
        }

        Ok(SyncOutcome::Round {
            mean,
            participants: readings.len(),
        })
    }

    /// Publish the coordinator's logical time to every peer. Returns the
    /// number of peers reached.
    pub async fn broadcast_time(&self) -> usize {
        if !self.is_coordinator().await {
            return 0;
        }

        let time = CoordinatorTime {
            coordinator_id: self.node_id.clone(),
            coordinator_time: self.logical_time().await,
        };
        self.events.sync(SyncEvent::CoordinatorTime {
            coordinator_id: time.coordinator_id.clone(),
            coordinator_time: time.coordinator_time,
        });

        let peers = self.cluster.peers().await;
        let calls = peers.iter().map(|peer| {
            let time = &time;
            async move {
                let result = self
                    .transport
                    .publish_coordinator_time(peer, time, self.settings.rpc_timeout)
                    .await;
                (peer, result)
            }
        });

        let mut delivered = 0;
        for (peer, result) in join_all(calls).await {
            match result {
                Ok(_) => delivered += 1,
                Err(e) => tracing::debug!("Coordinator time to {} failed: {}", peer.id, e),
            }
        }
        delivered
    }

    /// Remember the coordinator's broadcast time
    pub async fn on_coordinator_time(&self, time: &CoordinatorTime) {
        if time.coordinator_id == self.node_id {
            return;
        }
        self.state.write().await.coordinator_time = Some(CachedCoordinatorTime {
            coordinator_id: time.coordinator_id.clone(),
            coordinator_time: time.coordinator_time,
            received_at: self.wall.now_millis(),
        });
        tracing::trace!(
            "Coordinator {} time {}",
            time.coordinator_id,
            time.coordinator_time
        );
        self.events.sync(SyncEvent::CoordinatorTime {
            coordinator_id: time.coordinator_id.clone(),
            coordinator_time: time.coordinator_time,
        });
    }

    /// Manual sync: a coordinator runs a round; anyone else aligns to the
    /// last coordinator time it saw, advanced by the time since it arrived.
    pub async fn request_sync(&self) -> Result<SyncOutcome> {
        let (is_coordinator, cached) = {
            let state = self.state.read().await;
            (state.is_coordinator, state.coordinator_time.clone())
        };

        if is_coordinator {
            return self.run_round().await;
        }

        let Some(cached) = cached else {
            tracing::info!("No coordinator time seen yet, nothing to align to");
            return Ok(SyncOutcome::Skipped);
        };

        let (delta, logical_time) = {
            let mut state = self.state.write().await;
            let now = self.wall.now_millis();
            let target = cached.coordinator_time + (now - cached.received_at);
            let delta = target - self.logical_at(&state);
            state.cumulative_offset += delta;
            state.last_sync = Some(now);
            (delta, self.logical_at(&state))
        };

        tracing::info!(
            "Aligned to coordinator {} time on manual sync ({}ms)",
            cached.coordinator_id,
            delta
        );
        self.events.sync(SyncEvent::Aligned {
            delta,
            logical_time,
        });
        Ok(SyncOutcome::Aligned { delta })
    }

    /// Get clock status
    pub async fn status(&self) -> ClockStatus {
        let known_peers = self
            .cluster
            .peers()
            .await
            .into_iter()
            .map(|p| p.id)
            .collect();
        let state = self.state.read().await;
        ClockStatus {
            node_id: self.node_id.clone(),
            logical_time: self.logical_at(&state),
            cumulative_offset: state.cumulative_offset,
            is_coordinator: state.is_coordinator,
            known_peers,
            last_sync: state.last_sync,
            last_coordinator_time: state.coordinator_time.as_ref().map(|c| c.coordinator_time),
        }
    }
}
