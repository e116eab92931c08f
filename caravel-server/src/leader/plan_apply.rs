use super::broker::EvalBroker;
use crate::metrics;
use crate::raft::{raft_error_to_rpc, RaftHandle};
use crate::scheduler::feasibility::node_current_usage;
use crate::state::{StateSnapshot, StateStore};
use caravel_common::model::{
    AllocId, ApplyPlanResultsRequest, LogIndex, NodeId, Plan, PlanResult, Resources, RpcError,
};
use caravel_common::wire::MessageType;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct PlanRequest {
    pub plan: Plan,
    pub reply: oneshot::Sender<Result<PlanResult, RpcError>>,
}

/// Submission side of the plan-apply pipeline. A sender is installed while
/// this server is the leader; otherwise submissions fail fast with
/// `NoLeader`.
pub struct PlanQueue {
    tx: StdMutex<Option<mpsc::Sender<PlanRequest>>>,
}

impl PlanQueue {
    pub fn new() -> Arc<PlanQueue> {
        Arc::new(PlanQueue {
            tx: StdMutex::new(None),
        })
    }

    pub fn install(&self, tx: mpsc::Sender<PlanRequest>) {
        *self.tx.lock().expect("plan queue lock poisoned") = Some(tx);
    }

    pub fn clear(&self) {
        *self.tx.lock().expect("plan queue lock poisoned") = None;
    }

    pub async fn submit(&self, plan: Plan) -> Result<PlanResult, RpcError> {
        let tx = self
            .tx
            .lock()
            .expect("plan queue lock poisoned")
            .clone()
            .ok_or(RpcError::NoLeader)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PlanRequest {
            plan,
            reply: reply_tx,
        })
        .await
        .map_err(|_| RpcError::NoLeader)?;
        reply_rx.await.map_err(|_| RpcError::NoLeader)?
    }
}

/// Runs the single-threaded planner until leadership is lost. All submitted
/// plans serialize through this loop; commit is linearizable because this is
/// the only writer of `ApplyPlanResults` entries.
pub async fn run_plan_apply(
    mut rx: mpsc::Receiver<PlanRequest>,
    raft: Arc<RaftHandle>,
    state: Arc<StateStore>,
    broker: Arc<EvalBroker>,
    pool_size: usize,
    cancel: CancellationToken,
) {
    let pool = EvaluatePool::new(pool_size.max(1));
    info!(pool_size, "plan-apply pipeline started");
    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else { break };
                let timer = metrics::PLAN_APPLY_SECONDS.start_timer();
                let result = apply_plan(&raft, &state, &broker, &pool, request.plan).await;
                timer.observe_duration();
                let _ = request.reply.send(result);
            }
            _ = cancel.cancelled() => break,
        }
    }
    pool.shutdown().await;
    info!("plan-apply pipeline stopped");
}

async fn apply_plan(
    raft: &RaftHandle,
    state: &StateStore,
    broker: &EvalBroker,
    pool: &EvaluatePool,
    plan: Plan,
) -> Result<PlanResult, RpcError> {
    // The eval must still be outstanding and the submitter must hold the
    // current dequeue token; anything else is a stale scheduler.
    match broker.outstanding_token(&plan.eval_id) {
        None => return Err(RpcError::EvalNotOutstanding),
        Some(token) if token != plan.eval_token => return Err(RpcError::EvalTokenMismatch),
        Some(_) => {}
    }

    // Feasibility runs against a snapshot fresher than the scheduler's.
    let snapshot = state.snapshot();
    let plan = Arc::new(plan);

    let mut nodes: BTreeSet<NodeId> = BTreeSet::new();
    nodes.extend(plan.node_allocation.keys().copied());
    nodes.extend(plan.node_update.keys().copied());
    nodes.extend(plan.node_preemptions.keys().copied());

    let verdicts = pool
        .evaluate(snapshot.clone(), plan.clone(), nodes.iter().copied().collect())
        .await;

    let mut rejected: Vec<NodeId> = Vec::new();
    let mut refresh_index: LogIndex = 0;
    for (node_id, verdict) in &verdicts {
        if let Err(reason) = verdict {
            metrics::PLAN_NODE_REJECTIONS.inc();
            warn!(node_id = %node_id, reason, eval_id = %plan.eval_id, "plan rejected for node");
            rejected.push(*node_id);
            let node_index = snapshot
                .node(node_id)
                .map(|n| n.modify_index)
                .unwrap_or(snapshot.index);
            refresh_index = refresh_index.max(node_index);
        }
    }

    if plan.all_at_once && !rejected.is_empty() {
        return Ok(PlanResult {
            refresh_index,
            ..PlanResult::default()
        });
    }

    let rejected_set: HashSet<NodeId> = rejected.iter().copied().collect();
    let mut result = PlanResult {
        refresh_index,
        ..PlanResult::default()
    };
    for (node_id, allocs) in &plan.node_allocation {
        if !rejected_set.contains(node_id) {
            result.node_allocation.insert(*node_id, allocs.clone());
        }
    }
    for (node_id, diffs) in &plan.node_update {
        if !rejected_set.contains(node_id) {
            result.node_update.insert(*node_id, diffs.clone());
        }
    }
    for (node_id, diffs) in &plan.node_preemptions {
        if !rejected_set.contains(node_id) {
            result.node_preemptions.insert(*node_id, diffs.clone());
        }
    }
    result.deployment = plan.deployment.clone();
    result.deployment_updates = plan.deployment_updates.clone();

    if result.node_allocation.is_empty()
        && result.node_update.is_empty()
        && result.node_preemptions.is_empty()
        && result.deployment.is_none()
        && result.deployment_updates.is_empty()
    {
        // Nothing survived (or the plan was a no-op); no log entry needed.
        return Ok(result);
    }

    let mut allocs_updated: Vec<_> = result
        .node_allocation
        .values()
        .flatten()
        .cloned()
        .collect();
    let mut allocs_stopped: Vec<_> = result.node_update.values().flatten().cloned().collect();
    let mut allocs_preempted: Vec<_> =
        result.node_preemptions.values().flatten().cloned().collect();
    // Sorted so every replica materializes diffs in identical order.
    allocs_updated.sort_by_key(|a| a.id);
    allocs_stopped.sort_by_key(|d| d.id);
    allocs_preempted.sort_by_key(|d| d.id);

    let request = ApplyPlanResultsRequest {
        eval_id: plan.eval_id,
        job: plan.job.clone(),
        allocs_updated,
        allocs_stopped,
        allocs_preempted,
        deployment: result.deployment.clone(),
        deployment_updates: result.deployment_updates.clone(),
        snapshot_index: plan.snapshot_index,
    };
    let (index, outcome) = raft
        .apply(MessageType::ApplyPlanResults, &request)
        .await
        .map_err(raft_error_to_rpc)?;
    outcome?;
    metrics::PLANS_COMMITTED.inc();
    debug!(eval_id = %plan.eval_id, index, rejected = rejected.len(), "plan committed");

    result.alloc_index = index;
    Ok(result)
}

/// Verifies one node of a plan against a fresh snapshot: existence,
/// readiness for new placements, and capacity after the plan's own stops.
fn evaluate_node(snapshot: &StateSnapshot, plan: &Plan, node_id: &NodeId) -> Result<(), String> {
    let Some(node) = snapshot.node(node_id) else {
        return Err("node does not exist".to_string());
    };

    let empty = Vec::new();
    let proposed = plan.node_allocation.get(node_id).unwrap_or(&empty);
    let has_new_placement = proposed
        .iter()
        .any(|alloc| snapshot.alloc(&alloc.id).is_none());
    if has_new_placement && !node.ready() {
        if node.drain.is_some() {
            return Err("node is draining".to_string());
        }
        return Err(format!("node status is {}", node.status));
    }

    let mut exclude: HashSet<AllocId> = proposed.iter().map(|a| a.id).collect();
    if let Some(diffs) = plan.node_update.get(node_id) {
        exclude.extend(diffs.iter().map(|d| d.id));
    }
    if let Some(diffs) = plan.node_preemptions.get(node_id) {
        exclude.extend(diffs.iter().map(|d| d.id));
    }

    let used = node_current_usage(snapshot, node, &exclude);
    let mut ask = Resources::default();
    for alloc in proposed {
        if alloc.desired_status == caravel_common::model::DesiredStatus::Run
            && !alloc.client_status.terminal()
        {
            ask.add(&alloc.resources);
        }
    }
    used.fits_with(&ask, &node.available_resources())
        .map_err(|dimension| format!("{dimension} on node {node_id}"))
}

struct EvaluateRequest {
    snapshot: Arc<StateSnapshot>,
    plan: Arc<Plan>,
    node_id: NodeId,
    reply: oneshot::Sender<(NodeId, Result<(), String>)>,
}

/// Bounded fan-out worker pool for per-node feasibility checks. Workers pull
/// requests from a shared channel; shutdown closes the channel and the
/// workers drain out.
pub struct EvaluatePool {
    tx: mpsc::Sender<EvaluateRequest>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl EvaluatePool {
    pub fn new(size: usize) -> EvaluatePool {
        let (tx, rx) = mpsc::channel::<EvaluateRequest>(size * 2);
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let request = { rx.lock().await.recv().await };
                    let Some(request) = request else { break };
                    let verdict =
                        evaluate_node(&request.snapshot, &request.plan, &request.node_id);
                    let _ = request.reply.send((request.node_id, verdict));
                }
            }));
        }
        EvaluatePool { tx, workers }
    }

    pub async fn evaluate(
        &self,
        snapshot: Arc<StateSnapshot>,
        plan: Arc<Plan>,
        nodes: Vec<NodeId>,
    ) -> Vec<(NodeId, Result<(), String>)> {
        let mut replies = Vec::with_capacity(nodes.len());
        for node_id in nodes {
            let (reply_tx, reply_rx) = oneshot::channel();
            let request = EvaluateRequest {
                snapshot: snapshot.clone(),
                plan: plan.clone(),
                node_id,
                reply: reply_tx,
            };
            if self.tx.send(request).await.is_err() {
                break;
            }
            replies.push(reply_rx);
        }
        let mut verdicts = Vec::with_capacity(replies.len());
        for reply in replies {
            if let Ok(verdict) = reply.await {
                verdicts.push(verdict);
            }
        }
        verdicts
    }

    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
