use crate::config::ServerConfig;
use crate::raft::RaftHandle;
use crate::state::fsm::UpsertEvalsEntry;
use crate::state::StateStore;
use caravel_common::model::{EvalStatus, Evaluation, TriggeredBy};
use caravel_common::wire::MessageType;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod blocked;
pub mod broker;
pub mod heartbeat;
pub mod periodic;
pub mod plan_apply;

use blocked::BlockedEvals;
use broker::EvalBroker;
use heartbeat::HeartbeatTracker;
use periodic::PeriodicDispatcher;
use plan_apply::PlanQueue;

/// How often the reaper persists broker failures and blocked-eval
/// cancellations.
const REAP_INTERVAL: Duration = Duration::from_millis(500);
/// Zero-demand class counters older than this are pruned.
const PRUNE_CUTOFF: Duration = Duration::from_secs(60 * 60);

/// The leader-only singletons and their lifecycle. Each is enabled on
/// leadership acquisition (restoring its in-memory view from state) and
/// drained on loss.
pub struct LeaderComponents {
    pub config: ServerConfig,
    pub state: Arc<StateStore>,
    pub raft: Arc<RaftHandle>,
    pub broker: Arc<EvalBroker>,
    pub blocked: Arc<BlockedEvals>,
    pub periodic: Arc<PeriodicDispatcher>,
    pub heartbeats: Arc<HeartbeatTracker>,
    pub plan_queue: Arc<PlanQueue>,
}

/// Watches the leadership signal and transitions the leader-only machinery.
/// Returns when `shutdown` fires.
pub async fn run_leadership(components: Arc<LeaderComponents>, shutdown: CancellationToken) {
    let mut leadership = components.raft.leadership();
    let mut leader_cancel: Option<CancellationToken> = None;

    loop {
        let is_leader = *leadership.borrow();
        match (is_leader, leader_cancel.is_some()) {
            (true, false) => {
                let cancel = shutdown.child_token();
                establish_leadership(&components, &cancel).await;
                leader_cancel = Some(cancel);
            }
            (false, true) => {
                if let Some(cancel) = leader_cancel.take() {
                    cancel.cancel();
                }
                revoke_leadership(&components);
            }
            _ => {}
        }

        tokio::select! {
            changed = leadership.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    if let Some(cancel) = leader_cancel.take() {
        cancel.cancel();
    }
    revoke_leadership(&components);
}

async fn establish_leadership(components: &Arc<LeaderComponents>, cancel: &CancellationToken) {
    info!("establishing leadership");

    components.broker.set_enabled(true);
    components.blocked.set_enabled(true);

    // Rebuild the broker and blocked tracker from persisted evals.
    let snapshot = components.state.snapshot();
    let mut enqueued = 0usize;
    let mut blocked = 0usize;
    for eval in snapshot.evals() {
        if eval.should_enqueue() {
            components.broker.enqueue(eval.clone());
            enqueued += 1;
        } else if eval.should_block() {
            components.blocked.block(eval.clone());
            blocked += 1;
        }
    }
    info!(enqueued, blocked, "restored evaluation backlog");

    components.periodic.set_enabled(true);
    components.periodic.restore();
    {
        let periodic = components.periodic.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { periodic.run(cancel).await });
    }

    components.heartbeats.set_enabled(true);
    components.heartbeats.initialize_heartbeat_timers().await;
    {
        let heartbeats = components.heartbeats.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { heartbeats.run(cancel).await });
    }

    let (plan_tx, plan_rx) = mpsc::channel(64);
    components.plan_queue.install(plan_tx);
    {
        let raft = components.raft.clone();
        let state = components.state.clone();
        let broker = components.broker.clone();
        let pool_size = components.config.scheduler.evaluate_pool_size;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            plan_apply::run_plan_apply(plan_rx, raft, state, broker, pool_size, cancel).await;
        });
    }

    {
        let components = components.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { run_reaper(components, cancel).await });
    }
}

fn revoke_leadership(components: &Arc<LeaderComponents>) {
    info!("revoking leadership");
    components.plan_queue.clear();
    components.heartbeats.set_enabled(false);
    components.periodic.set_enabled(false);
    components.blocked.set_enabled(false);
    components.broker.set_enabled(false);
}

/// Persists what the in-memory trackers concluded: evals past the delivery
/// limit become `failed` with a jittered follow-up; superseded blocked evals
/// are canceled; stale demand counters are pruned.
async fn run_reaper(components: Arc<LeaderComponents>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => return,
        }

        for eval in components.broker.drain_failed() {
            let now = Utc::now();
            let mut failed = eval.clone();
            failed.status = EvalStatus::Failed;
            failed.status_description =
                "evaluation reached delivery limit".to_string();
            failed.modify_time = now;

            let mut followup = Evaluation {
                id: caravel_common::model::EvalId::new_v4(),
                triggered_by: TriggeredBy::FailedFollowUp,
                status: EvalStatus::Pending,
                status_description: String::new(),
                previous_eval: Some(eval.id),
                wait_until: Some(now + chrono::Duration::from_std(
                    components.broker.followup_delay(),
                ).unwrap_or_default()),
                create_time: now,
                modify_time: now,
                create_index: 0,
                modify_index: 0,
                ..eval.clone()
            };
            followup.blocked_eval = None;
            followup.snapshot_index = None;

            let entry = UpsertEvalsEntry {
                evals: vec![failed, followup],
            };
            if let Err(err) = components.raft.apply(MessageType::UpsertEvals, &entry).await {
                warn!(%err, "failed to persist failed evaluation");
            }
        }

        let duplicates = components.blocked.drain_duplicates();
        if !duplicates.is_empty() {
            let now = Utc::now();
            let evals: Vec<Evaluation> = duplicates
                .into_iter()
                .map(|mut eval| {
                    eval.status = EvalStatus::Canceled;
                    eval.status_description =
                        "canceled in favor of newer blocked evaluation".to_string();
                    eval.modify_time = now;
                    eval
                })
                .collect();
            let entry = UpsertEvalsEntry { evals };
            if let Err(err) = components.raft.apply(MessageType::UpsertEvals, &entry).await {
                warn!(%err, "failed to cancel duplicate blocked evaluations");
            }
        }

        if let Some(cutoff) = Instant::now().checked_sub(PRUNE_CUTOFF) {
            components.blocked.prune(cutoff);
        }

        crate::metrics::EVALS_BLOCKED.set(components.blocked.stats().total_blocked as i64);
    }
}
