use crate::config::HeartbeatConfig;
use crate::metrics;
use crate::raft::{raft_error_to_rpc, RaftHandle};
use crate::state::fsm::{UpdateNodeStatusEntry, UpsertEvalsEntry};
use crate::state::{StateSnapshot, StateStore};
use caravel_common::model::{
    ClientStatus, DesiredStatus, Evaluation, JobId, Namespace, NodeEvent, NodeId, NodeStatus,
    RpcError, TriggeredBy,
};
use caravel_common::wire::MessageType;
use chrono::Utc;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Message recorded on a node when its heartbeat window lapses.
pub const HEARTBEAT_MISSED_EVENT: &str = "Node heartbeat missed";

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Tracks per-node liveness TTLs on the leader and synthesizes rescheduling
/// evaluations when a node misses its window.
pub struct HeartbeatTracker {
    config: HeartbeatConfig,
    state: Arc<StateStore>,
    raft: OnceLock<Arc<RaftHandle>>,
    /// Deadline per node: granted TTL plus the grace window.
    timers: Mutex<HashMap<NodeId, Instant>>,
    bucket: Mutex<TokenBucket>,
    enabled: AtomicBool,
}

impl HeartbeatTracker {
    pub fn new(config: HeartbeatConfig, state: Arc<StateStore>) -> Arc<HeartbeatTracker> {
        Arc::new(HeartbeatTracker {
            config,
            state,
            raft: OnceLock::new(),
            timers: Mutex::new(HashMap::new()),
            bucket: Mutex::new(TokenBucket {
                tokens: 1.0,
                last_refill: Instant::now(),
            }),
            enabled: AtomicBool::new(false),
        })
    }

    /// Wires the raft handle after bootstrap (the tracker is constructed
    /// before the log so the FSM can exist first).
    pub fn set_raft(&self, raft: Arc<RaftHandle>) {
        let _ = self.raft.set(raft);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.timers.lock().expect("heartbeat lock poisoned").clear();
        }
    }

    /// Grants a TTL uniformly in `[min, 2·min]` and schedules invalidation at
    /// `now + ttl + grace`. Globally rate-limited so a mass reconnect cannot
    /// stampede the leader.
    pub async fn reset_heartbeat_timer(&self, node_id: NodeId) -> Duration {
        let min = self.config.min_heartbeat_ttl;
        let spread_millis = min.as_millis() as u64;
        let extra = if spread_millis == 0 {
            0
        } else {
            rand::rng().random_range(0..=spread_millis)
        };
        let ttl = min + Duration::from_millis(extra);

        self.throttle().await;

        if self.enabled.load(Ordering::SeqCst) {
            let deadline = Instant::now() + ttl + self.config.heartbeat_grace;
            self.timers
                .lock()
                .expect("heartbeat lock poisoned")
                .insert(node_id, deadline);
        }
        ttl
    }

    async fn throttle(&self) {
        let wait = {
            let mut bucket = self.bucket.lock().expect("heartbeat lock poisoned");
            let rate = self.config.max_heartbeats_per_second;
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * rate).min(rate.max(1.0));
            bucket.last_refill = now;
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                None
            } else {
                Some(Duration::from_secs_f64((1.0 - bucket.tokens) / rate))
            }
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
    }

    pub fn clear_heartbeat_timer(&self, node_id: &NodeId) {
        self.timers
            .lock()
            .expect("heartbeat lock poisoned")
            .remove(node_id);
    }

    /// Walks all non-terminal nodes on leadership gain and arms each timer.
    pub async fn initialize_heartbeat_timers(&self) {
        let snapshot = self.state.snapshot();
        let node_ids: Vec<NodeId> = snapshot
            .nodes()
            .filter(|node| !node.terminal_status())
            .map(|node| node.id)
            .collect();
        let count = node_ids.len();
        for node_id in node_ids {
            self.reset_heartbeat_timer(node_id).await;
        }
        info!(count, "initialized heartbeat timers");
    }

    /// The invalidation loop: periodically collects expired timers and
    /// invalidates each node exactly once.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.failover_check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => {
                    debug!("heartbeat invalidation loop stopped");
                    return;
                }
            }
            if !self.enabled.load(Ordering::SeqCst) {
                continue;
            }
            let now = Instant::now();
            let expired: Vec<NodeId> = {
                let mut timers = self.timers.lock().expect("heartbeat lock poisoned");
                let ids: Vec<NodeId> = timers
                    .iter()
                    .filter(|(_, deadline)| **deadline < now)
                    .map(|(id, _)| *id)
                    .collect();
                for id in &ids {
                    timers.remove(id);
                }
                ids
            };
            for node_id in expired {
                metrics::HEARTBEATS_EXPIRED.inc();
                if let Err(err) = self.invalidate_heartbeat(node_id).await {
                    warn!(node_id = %node_id, %err, "failed to invalidate heartbeat");
                }
            }
        }
    }

    /// Marks a node that missed its window as disconnected (when any
    /// allocation still has disconnect tolerance) or down, then creates the
    /// rescheduling evals.
    async fn invalidate_heartbeat(&self, node_id: NodeId) -> Result<(), RpcError> {
        let raft = self.raft.get().ok_or(RpcError::NoLeader)?.clone();
        let snapshot = self.state.snapshot();
        let Some(node) = snapshot.node(&node_id) else {
            return Ok(());
        };
        if node.terminal_status() {
            return Ok(());
        }

        let now = Utc::now();
        let target_status = if tolerates_disconnect(&snapshot, &node_id, now) {
            NodeStatus::Disconnected
        } else {
            NodeStatus::Down
        };
        info!(node_id = %node_id, status = %target_status, "node missed heartbeat");

        let entry = UpdateNodeStatusEntry {
            node_id,
            status: target_status,
            status_description: "Node heartbeat missed".to_string(),
            node_event: Some(NodeEvent::cluster(HEARTBEAT_MISSED_EVENT)),
            timestamp: now,
        };
        let (index, outcome) = raft
            .apply(MessageType::UpdateNodeStatus, &entry)
            .await
            .map_err(raft_error_to_rpc)?;
        outcome?;

        let evals =
            create_node_evals(&self.state.snapshot(), &node_id, index, TriggeredBy::NodeUpdate);
        if !evals.is_empty() {
            let (_, outcome) = raft
                .apply(MessageType::UpsertEvals, &UpsertEvalsEntry { evals })
                .await
                .map_err(raft_error_to_rpc)?;
            outcome?;
        }
        Ok(())
    }
}

/// A node tolerates a disconnect when any of its live allocations declares a
/// disconnect window that has not yet elapsed.
fn tolerates_disconnect(
    snapshot: &StateSnapshot,
    node_id: &NodeId,
    now: chrono::DateTime<Utc>,
) -> bool {
    snapshot.allocs_for_node(node_id).iter().any(|alloc| {
        alloc.desired_status == DesiredStatus::Run
            && matches!(
                alloc.client_status,
                ClientStatus::Pending | ClientStatus::Running | ClientStatus::Unknown
            )
            && alloc
                .job
                .lookup_task_group(&alloc.task_group)
                .and_then(|tg| tg.max_client_disconnect)
                .is_some()
            && alloc.within_disconnect_window(now)
    })
}

/// One eval per job with an allocation on the node, plus one per system job
/// (which may need the node even without a current allocation).
pub fn create_node_evals(
    snapshot: &StateSnapshot,
    node_id: &NodeId,
    node_modify_index: u64,
    triggered_by: TriggeredBy,
) -> Vec<Evaluation> {
    let mut seen: HashSet<(Namespace, JobId)> = HashSet::new();
    let mut evals = Vec::new();

    for alloc in snapshot.allocs_for_node(node_id) {
        let key = (alloc.namespace.clone(), alloc.job_id.clone());
        if !seen.insert(key) {
            continue;
        }
        let Some(job) = snapshot.job(&alloc.namespace, &alloc.job_id) else {
            continue;
        };
        let mut eval = Evaluation::new(job, triggered_by);
        eval.node_id = Some(*node_id);
        eval.node_modify_index = Some(node_modify_index);
        evals.push(eval);
    }

    let node_dc = snapshot.node(node_id).map(|n| n.datacenter.clone());
    for job in snapshot.jobs() {
        if !job.job_type.is_system() || job.stop {
            continue;
        }
        if let Some(dc) = &node_dc {
            if !job.datacenters.iter().any(|d| d == dc) {
                continue;
            }
        }
        let key = (job.namespace.clone(), job.id.clone());
        if !seen.insert(key) {
            continue;
        }
        let mut eval = Evaluation::new(job, triggered_by);
        eval.node_id = Some(*node_id);
        eval.node_modify_index = Some(node_modify_index);
        evals.push(eval);
    }

    evals
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::config::HeartbeatConfig;

    #[test]
    async fn granted_ttl_is_within_bounds() {
        let config = HeartbeatConfig {
            min_heartbeat_ttl: Duration::from_millis(100),
            heartbeat_grace: Duration::from_millis(10),
            max_heartbeats_per_second: 1000.0,
            failover_check_interval: Duration::from_millis(10),
        };
        let tracker = HeartbeatTracker::new(config, Arc::new(StateStore::new()));
        tracker.set_enabled(true);
        for _ in 0..50 {
            let ttl = tracker.reset_heartbeat_timer(NodeId::new_v4()).await;
            assert!(ttl >= Duration::from_millis(100), "ttl {ttl:?} below min");
            assert!(ttl <= Duration::from_millis(200), "ttl {ttl:?} above 2x min");
        }
    }

    #[test]
    async fn disabled_tracker_holds_no_timers() {
        let tracker =
            HeartbeatTracker::new(HeartbeatConfig::default(), Arc::new(StateStore::new()));
        let node_id = NodeId::new_v4();
        tracker.reset_heartbeat_timer(node_id).await;
        assert!(tracker.timers.lock().unwrap().is_empty());

        tracker.set_enabled(true);
        tracker.reset_heartbeat_timer(node_id).await;
        assert_eq!(tracker.timers.lock().unwrap().len(), 1);

        tracker.set_enabled(false);
        assert!(tracker.timers.lock().unwrap().is_empty());
    }
}
