use super::store::StateStore;
use crate::leader::blocked::BlockedEvals;
use crate::leader::broker::EvalBroker;
use crate::leader::periodic::PeriodicDispatcher;
use caravel_common::model::{
    AclToken, Allocation, ApplyPlanResultsRequest, ClientStatus, DesiredStatus, DrainStrategy,
    EvalId, Evaluation, Job, JobId, JobStatus, JobType, LogIndex, Namespace, Node, NodeEvent,
    NodeId, NodePool, NodeStatus, PeriodicLaunch, RpcError, ServiceRegistration, Variable,
};
use caravel_common::wire::{decode_frame, decode_payload, MessageType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

// Log entry payloads. RPC handlers stamp all times and derived fields before
// appending so the apply is a pure function of the entry.

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterJobEntry {
    pub job: Job,
    /// Atomically created alongside the job; absent for periodic parents.
    pub eval: Option<Evaluation>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeregisterJobEntry {
    pub namespace: Namespace,
    pub job_id: JobId,
    pub purge: bool,
    pub eval: Option<Evaluation>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpsertNodeEntry {
    pub node: Node,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeregisterNodeEntry {
    pub node_id: NodeId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateNodeStatusEntry {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub status_description: String,
    pub node_event: Option<NodeEvent>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateNodeDrainEntry {
    pub node_id: NodeId,
    pub drain: Option<DrainStrategy>,
    pub mark_eligible: bool,
    pub node_event: Option<NodeEvent>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpsertAllocsEntry {
    pub allocs: Vec<Allocation>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateAllocsFromClientEntry {
    pub allocs: Vec<Allocation>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpsertEvalsEntry {
    pub evals: Vec<Evaluation>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteEvalsEntry {
    pub eval_ids: Vec<EvalId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpsertPeriodicLaunchEntry {
    pub launch: PeriodicLaunch,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpsertNodePoolsEntry {
    pub pools: Vec<NodePool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteNodePoolsEntry {
    pub names: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpsertServiceRegistrationsEntry {
    pub services: Vec<ServiceRegistration>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteServiceRegistrationEntry {
    pub namespace: Namespace,
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpsertAclTokensEntry {
    pub tokens: Vec<AclToken>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpsertVariableEntry {
    pub variable: Variable,
    /// `Some(0)` requires the path to be absent; any other value must match
    /// the stored modify index.
    pub check_index: Option<LogIndex>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteVariableEntry {
    pub namespace: Namespace,
    pub path: String,
    pub check_index: Option<LogIndex>,
}

/// The deterministic state machine: an ordered stream of framed entries in,
/// an indexed database out. Replaying the same log yields identical tables
/// regardless of snapshot cadence.
///
/// The FSM also feeds the leader-side reconcilers (broker, blocked tracker,
/// periodic dispatcher); those are no-ops while disabled on followers.
pub struct Fsm {
    state: Arc<StateStore>,
    broker: Arc<EvalBroker>,
    blocked: Arc<BlockedEvals>,
    periodic: Arc<PeriodicDispatcher>,
}

impl Fsm {
    pub fn new(
        state: Arc<StateStore>,
        broker: Arc<EvalBroker>,
        blocked: Arc<BlockedEvals>,
        periodic: Arc<PeriodicDispatcher>,
    ) -> Fsm {
        Fsm {
            state,
            broker,
            blocked,
            periodic,
        }
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// Applies one framed log entry at `index`. A business-logic rejection is
    /// a deterministic outcome of the entry (returned as `Err`), not a replay
    /// divergence: the entry stays durable either way.
    pub fn apply(&self, index: LogIndex, frame: &[u8]) -> Result<(), RpcError> {
        let (raw_type, payload) = decode_frame(frame)
            .map_err(|err| RpcError::StateWrite(format!("bad log frame at {index}: {err}")))?;
        let Some(message_type) = MessageType::from_u8(raw_type) else {
            // Entries written by newer servers; tolerated for forward
            // compatibility.
            warn!(index, raw_type, "ignoring unknown log entry type");
            return Ok(());
        };
        debug!(index, ?message_type, "applying log entry");
        match message_type {
            MessageType::RegisterJob => self.apply_register_job(index, decode(payload)?),
            MessageType::DeregisterJob => self.apply_deregister_job(index, decode(payload)?),
            MessageType::UpsertNode => self.apply_upsert_node(index, decode(payload)?),
            MessageType::DeregisterNode => self.apply_deregister_node(index, decode(payload)?),
            MessageType::UpdateNodeStatus => self.apply_update_node_status(index, decode(payload)?),
            MessageType::UpdateNodeDrain => self.apply_update_node_drain(index, decode(payload)?),
            MessageType::UpsertAllocs => self.apply_upsert_allocs(index, decode(payload)?),
            MessageType::UpdateAllocsFromClient => {
                self.apply_update_allocs_from_client(index, decode(payload)?)
            }
            MessageType::UpsertEvals => self.apply_upsert_evals(index, decode(payload)?),
            MessageType::UpdateEval => {
                let entry: UpsertEvalsEntry = decode(payload)?;
                self.apply_upsert_evals(index, entry)
            }
            MessageType::DeleteEval => self.apply_delete_evals(index, decode(payload)?),
            MessageType::ApplyPlanResults => self.apply_plan_results(index, decode(payload)?),
            MessageType::UpsertPeriodicLaunch => {
                self.apply_upsert_periodic_launch(index, decode(payload)?)
            }
            MessageType::UpsertNodePools => self.apply_upsert_node_pools(index, decode(payload)?),
            MessageType::DeleteNodePools => self.apply_delete_node_pools(index, decode(payload)?),
            MessageType::UpsertServiceRegistrations => {
                self.apply_upsert_services(index, decode(payload)?)
            }
            MessageType::DeleteServiceRegistration => {
                self.apply_delete_service(index, decode(payload)?)
            }
            MessageType::UpsertAclTokens => self.apply_upsert_acl_tokens(index, decode(payload)?),
            MessageType::UpsertVariable => self.apply_upsert_variable(index, decode(payload)?),
            MessageType::DeleteVariable => self.apply_delete_variable(index, decode(payload)?),
        }
    }

    fn apply_register_job(&self, index: LogIndex, entry: RegisterJobEntry) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        let mut job = entry.job;
        if let Some(existing) = txn.snapshot().job(&job.namespace, &job.id) {
            job.create_index = existing.create_index;
        } else {
            job.create_index = index;
        }
        job.modify_index = index;

        if job.is_periodic() {
            self.periodic.add(&job);
        } else if job.parent_id.is_none() {
            // A previously periodic job re-registered without a periodic
            // spec must stop launching.
            self.periodic.remove(&job.namespace, &job.id);
        }

        txn.upsert_job(job.clone());
        if let Some(mut eval) = entry.eval {
            eval.create_index = index;
            eval.modify_index = index;
            txn.upsert_eval(eval.clone());
            self.state.commit(txn, index);
            if eval.should_enqueue() {
                self.broker.enqueue(eval);
            }
        } else {
            self.state.commit(txn, index);
        }
        Ok(())
    }

    fn apply_deregister_job(
        &self,
        index: LogIndex,
        entry: DeregisterJobEntry,
    ) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        let Some(existing) = txn.snapshot().job(&entry.namespace, &entry.job_id).cloned() else {
            return Err(RpcError::not_found(format!(
                "job '{}' not found in namespace '{}'",
                entry.job_id, entry.namespace
            )));
        };

        self.periodic.remove(&entry.namespace, &entry.job_id);

        if entry.purge {
            txn.delete_job(&entry.namespace, &entry.job_id);
        } else {
            let mut job = existing;
            job.stop = true;
            job.modify_index = index;
            txn.upsert_job(job);
        }

        if let Some(mut eval) = entry.eval {
            eval.create_index = index;
            eval.modify_index = index;
            txn.upsert_eval(eval.clone());
            self.state.commit(txn, index);
            if eval.should_enqueue() {
                self.broker.enqueue(eval);
            }
        } else {
            self.state.commit(txn, index);
        }
        Ok(())
    }

    fn apply_upsert_node(&self, index: LogIndex, entry: UpsertNodeEntry) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        let mut node = entry.node;
        if let Some(existing) = txn.snapshot().node(&node.id) {
            node.create_index = existing.create_index;
            // Register is idempotent; the first secret wins so a replayed
            // register cannot rotate identity.
            node.secret_id = existing.secret_id;
            // Keep the richer event log.
            if node.events.is_empty() {
                node.events = existing.events.clone();
            }
        } else {
            node.create_index = index;
        }
        node.modify_index = index;
        let computed_class = node.computed_class();
        txn.upsert_node(node);
        self.state.commit(txn, index);

        // New capacity may unblock evals waiting on this class.
        self.blocked.unblock(&computed_class, index);
        Ok(())
    }

    fn apply_deregister_node(
        &self,
        index: LogIndex,
        entry: DeregisterNodeEntry,
    ) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        if txn.snapshot().node(&entry.node_id).is_none() {
            return Err(RpcError::not_found(format!(
                "node '{}' not found",
                entry.node_id
            )));
        }
        txn.delete_node(&entry.node_id);
        self.state.commit(txn, index);
        Ok(())
    }

    fn apply_update_node_status(
        &self,
        index: LogIndex,
        entry: UpdateNodeStatusEntry,
    ) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        let Some(mut node) = txn.snapshot().node(&entry.node_id).cloned() else {
            return Err(RpcError::not_found(format!(
                "node '{}' not found",
                entry.node_id
            )));
        };
        node.status = entry.status;
        node.status_description = entry.status_description;
        node.status_updated_at = entry.timestamp;
        node.modify_index = index;
        if let Some(event) = entry.node_event {
            node.push_event(event);
        }
        let computed_class = node.computed_class();
        let node_id = node.id;
        txn.upsert_node(node);

        // A node losing contact takes its allocations to `unknown` in the
        // same entry, so readers never see a disconnected node with
        // apparently-healthy allocations.
        if entry.status == NodeStatus::Disconnected {
            let allocs: Vec<Allocation> = txn
                .snapshot()
                .allocs_for_node(&node_id)
                .into_iter()
                .filter(|alloc| {
                    alloc.desired_status == DesiredStatus::Run
                        && matches!(
                            alloc.client_status,
                            ClientStatus::Pending | ClientStatus::Running
                        )
                })
                .cloned()
                .collect();
            for mut alloc in allocs {
                alloc.client_status = ClientStatus::Unknown;
                alloc.push_state(ClientStatus::Unknown, entry.timestamp);
                alloc.modify_index = index;
                alloc.modify_time = entry.timestamp;
                txn.upsert_alloc(alloc);
            }
        }
        self.state.commit(txn, index);

        if entry.status == NodeStatus::Ready {
            self.blocked.unblock(&computed_class, index);
        }
        Ok(())
    }

    fn apply_update_node_drain(
        &self,
        index: LogIndex,
        entry: UpdateNodeDrainEntry,
    ) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        let Some(mut node) = txn.snapshot().node(&entry.node_id).cloned() else {
            return Err(RpcError::not_found(format!(
                "node '{}' not found",
                entry.node_id
            )));
        };
        node.drain = entry.drain;
        if node.drain.is_some() {
            node.scheduling_eligibility =
                caravel_common::model::SchedulingEligibility::Ineligible;
        } else if entry.mark_eligible {
            node.scheduling_eligibility = caravel_common::model::SchedulingEligibility::Eligible;
        }
        node.modify_index = index;
        if let Some(event) = entry.node_event {
            node.push_event(event);
        }
        let computed_class = node.computed_class();
        let drained = node.drain.is_none();
        txn.upsert_node(node);
        self.state.commit(txn, index);

        // Releasing a drain returns capacity to the pool.
        if drained {
            self.blocked.unblock(&computed_class, index);
        }
        Ok(())
    }

    fn apply_upsert_allocs(
        &self,
        index: LogIndex,
        entry: UpsertAllocsEntry,
    ) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        for mut alloc in entry.allocs {
            if let Some(existing) = txn.snapshot().alloc(&alloc.id) {
                alloc.create_index = existing.create_index;
            } else {
                alloc.create_index = index;
            }
            alloc.modify_index = index;
            txn.upsert_alloc(alloc);
        }
        self.state.commit(txn, index);
        Ok(())
    }

    fn apply_update_allocs_from_client(
        &self,
        index: LogIndex,
        entry: UpdateAllocsFromClientEntry,
    ) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        for reported in entry.allocs {
            let Some(mut alloc) = txn.snapshot().alloc(&reported.id).cloned() else {
                return Err(RpcError::not_found(format!(
                    "allocation '{}' not found",
                    reported.id
                )));
            };
            if alloc.client_status != reported.client_status {
                alloc.push_state(reported.client_status, entry.timestamp);
            }
            alloc.client_status = reported.client_status;
            alloc.client_description = reported.client_description;
            alloc.task_states = reported.task_states;
            alloc.modify_time = entry.timestamp;
            alloc.modify_index = index;
            let job_key = (alloc.namespace.clone(), alloc.job_id.clone());
            txn.upsert_alloc(alloc);
            refresh_job_status(&mut txn, &job_key.0, &job_key.1, index);
        }
        self.state.commit(txn, index);
        Ok(())
    }

    fn apply_upsert_evals(&self, index: LogIndex, entry: UpsertEvalsEntry) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        let mut to_enqueue = Vec::new();
        let mut to_block = Vec::new();
        for mut eval in entry.evals {
            if let Some(existing) = txn.snapshot().eval(&eval.id) {
                eval.create_index = existing.create_index;
            } else {
                eval.create_index = index;
            }
            eval.modify_index = index;
            if eval.should_enqueue() {
                to_enqueue.push(eval.clone());
            } else if eval.should_block() {
                to_block.push(eval.clone());
            }
            txn.upsert_eval(eval);
        }
        self.state.commit(txn, index);

        for eval in to_enqueue {
            self.broker.enqueue(eval);
        }
        for eval in to_block {
            self.blocked.block(eval);
        }
        Ok(())
    }

    fn apply_delete_evals(&self, index: LogIndex, entry: DeleteEvalsEntry) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        for eval_id in &entry.eval_ids {
            txn.delete_eval(eval_id);
        }
        self.state.commit(txn, index);
        for eval_id in &entry.eval_ids {
            self.blocked.untrack(eval_id);
        }
        Ok(())
    }

    fn apply_plan_results(
        &self,
        index: LogIndex,
        entry: ApplyPlanResultsRequest,
    ) -> Result<(), RpcError> {
        let mut txn = self.state.begin();

        let mut touched_jobs: std::collections::BTreeSet<(Namespace, JobId)> =
            std::collections::BTreeSet::new();
        for alloc in &entry.allocs_updated {
            touched_jobs.insert((alloc.namespace.clone(), alloc.job_id.clone()));
        }
        for diff in entry.allocs_stopped.iter().chain(entry.allocs_preempted.iter()) {
            if let Some(alloc) = txn.snapshot().alloc(&diff.id) {
                touched_jobs.insert((alloc.namespace.clone(), alloc.job_id.clone()));
            }
        }

        for mut alloc in entry.allocs_updated {
            if let Some(existing) = txn.snapshot().alloc(&alloc.id) {
                alloc.create_index = existing.create_index;
            } else {
                alloc.create_index = index;
            }
            alloc.modify_index = index;
            txn.upsert_alloc(alloc);
        }

        // Stops and preemptions arrive as diffs; materialize them against
        // the allocation currently in state.
        for diff in entry.allocs_stopped.iter().chain(entry.allocs_preempted.iter()) {
            let Some(mut alloc) = txn.snapshot().alloc(&diff.id).cloned() else {
                warn!(alloc_id = %diff.id, "plan result stops unknown allocation");
                continue;
            };
            alloc.apply_diff(diff);
            if let Some(client_status) = diff.client_status {
                if alloc.client_status != client_status {
                    alloc.push_state(client_status, diff.modify_time);
                }
                alloc.client_status = client_status;
            }
            alloc.modify_index = index;
            txn.upsert_alloc(alloc);
        }

        if let Some(mut deployment) = entry.deployment {
            if let Some(existing) = txn.snapshot().deployment(&deployment.id) {
                deployment.create_index = existing.create_index;
            } else {
                deployment.create_index = index;
            }
            deployment.modify_index = index;
            txn.upsert_deployment(deployment);
        }
        for update in entry.deployment_updates {
            if let Some(mut deployment) = txn.snapshot().deployment(&update.deployment_id).cloned()
            {
                deployment.status = update.status;
                deployment.status_description = update.status_description;
                deployment.modify_index = index;
                txn.upsert_deployment(deployment);
            }
        }

        for (namespace, job_id) in touched_jobs {
            refresh_job_status(&mut txn, &namespace, &job_id, index);
        }

        self.state.commit(txn, index);
        Ok(())
    }

    fn apply_upsert_periodic_launch(
        &self,
        index: LogIndex,
        entry: UpsertPeriodicLaunchEntry,
    ) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        let mut launch = entry.launch;
        if let Some(existing) = txn
            .snapshot()
            .periodic_launch(&launch.namespace, &launch.job_id)
        {
            launch.create_index = existing.create_index;
        } else {
            launch.create_index = index;
        }
        launch.modify_index = index;
        txn.upsert_periodic_launch(launch);
        self.state.commit(txn, index);
        Ok(())
    }

    fn apply_upsert_node_pools(
        &self,
        index: LogIndex,
        entry: UpsertNodePoolsEntry,
    ) -> Result<(), RpcError> {
        // Built-in pool writes are deterministic rejections: durable in the
        // log, refused by every replica identically.
        for pool in &entry.pools {
            if NodePool::is_built_in(&pool.name) {
                return Err(RpcError::validation(format!(
                    "node pool '{}' is built-in and cannot be modified",
                    pool.name
                )));
            }
        }
        let mut txn = self.state.begin();
        for mut pool in entry.pools {
            if let Some(existing) = txn.snapshot().node_pool(&pool.name) {
                pool.create_index = existing.create_index;
            } else {
                pool.create_index = index;
            }
            pool.modify_index = index;
            txn.upsert_node_pool(pool);
        }
        self.state.commit(txn, index);
        Ok(())
    }

    fn apply_delete_node_pools(
        &self,
        index: LogIndex,
        entry: DeleteNodePoolsEntry,
    ) -> Result<(), RpcError> {
        let snapshot = self.state.snapshot();
        for name in &entry.names {
            if NodePool::is_built_in(name) {
                return Err(RpcError::validation(format!(
                    "node pool '{name}' is built-in and cannot be deleted"
                )));
            }
            if snapshot.nodes().any(|n| &n.node_pool == name)
                || snapshot.jobs().any(|j| &j.node_pool == name)
            {
                return Err(RpcError::validation(format!(
                    "node pool '{name}' is in use"
                )));
            }
        }
        let mut txn = self.state.begin();
        for name in &entry.names {
            txn.delete_node_pool(name);
        }
        self.state.commit(txn, index);
        Ok(())
    }

    fn apply_upsert_services(
        &self,
        index: LogIndex,
        entry: UpsertServiceRegistrationsEntry,
    ) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        for mut service in entry.services {
            if let Some(existing) = txn.snapshot().service(&service.namespace, &service.id) {
                service.create_index = existing.create_index;
            } else {
                service.create_index = index;
            }
            service.modify_index = index;
            txn.upsert_service(service);
        }
        self.state.commit(txn, index);
        Ok(())
    }

    fn apply_delete_service(
        &self,
        index: LogIndex,
        entry: DeleteServiceRegistrationEntry,
    ) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        if txn.snapshot().service(&entry.namespace, &entry.id).is_none() {
            return Err(RpcError::not_found(format!(
                "service registration '{}' not found",
                entry.id
            )));
        }
        txn.delete_service(&entry.namespace, &entry.id);
        self.state.commit(txn, index);
        Ok(())
    }

    fn apply_upsert_acl_tokens(
        &self,
        index: LogIndex,
        entry: UpsertAclTokensEntry,
    ) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        for mut token in entry.tokens {
            if let Some(existing) = txn
                .snapshot()
                .acl_token_by_secret(&token.secret_id)
            {
                token.create_index = existing.create_index;
            } else {
                token.create_index = index;
            }
            token.modify_index = index;
            txn.upsert_acl_token(token);
        }
        self.state.commit(txn, index);
        Ok(())
    }
}

/// Derives a job's coarse status from its allocations. Batch jobs whose
/// allocations have all reached a terminal client state are dead, which is
/// what the periodic overlap probe keys on.
fn refresh_job_status(
    txn: &mut crate::state::StateTxn,
    namespace: &Namespace,
    job_id: &JobId,
    index: LogIndex,
) {
    let Some(mut job) = txn.snapshot().job(namespace, job_id).cloned() else {
        return;
    };
    let statuses: Vec<(DesiredStatus, ClientStatus)> = txn
        .snapshot()
        .allocs_for_job(namespace, job_id)
        .into_iter()
        .map(|alloc| (alloc.desired_status, alloc.client_status))
        .collect();

    let any_non_terminal = statuses.iter().any(|(desired, client)| {
        *desired == DesiredStatus::Run && !client.terminal()
    });
    let is_batch = matches!(job.job_type, JobType::Batch | JobType::SysBatch);

    let new_status = if statuses.is_empty() {
        if job.stop {
            JobStatus::Dead
        } else {
            JobStatus::Pending
        }
    } else if any_non_terminal {
        JobStatus::Running
    } else if job.stop || is_batch {
        JobStatus::Dead
    } else {
        JobStatus::Pending
    };

    if new_status != job.status {
        job.status = new_status;
        job.modify_index = index;
        txn.upsert_job(job);
    }
}

impl Fsm {
    fn apply_upsert_variable(
        &self,
        index: LogIndex,
        entry: UpsertVariableEntry,
    ) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        let mut variable = entry.variable;
        let current = txn
            .snapshot()
            .variable(&variable.namespace, &variable.path)
            .cloned();
        check_variable_cas(entry.check_index, current.as_ref(), &variable.path)?;
        match current {
            Some(existing) => variable.create_index = existing.create_index,
            None => variable.create_index = index,
        }
        variable.modify_index = index;
        txn.upsert_variable(variable);
        self.state.commit(txn, index);
        Ok(())
    }

    fn apply_delete_variable(
        &self,
        index: LogIndex,
        entry: DeleteVariableEntry,
    ) -> Result<(), RpcError> {
        let mut txn = self.state.begin();
        let current = txn.snapshot().variable(&entry.namespace, &entry.path).cloned();
        if current.is_none() {
            return Err(RpcError::not_found(format!(
                "variable '{}' not found",
                entry.path
            )));
        }
        check_variable_cas(entry.check_index, current.as_ref(), &entry.path)?;
        txn.delete_variable(&entry.namespace, &entry.path);
        self.state.commit(txn, index);
        Ok(())
    }
}

/// Compare-and-set check shared by variable upsert and delete; mismatches
/// are deterministic rejections.
fn check_variable_cas(
    check_index: Option<LogIndex>,
    current: Option<&Variable>,
    path: &str,
) -> Result<(), RpcError> {
    let Some(expected) = check_index else {
        return Ok(());
    };
    let actual = current.map(|v| v.modify_index).unwrap_or(0);
    if expected != actual {
        return Err(RpcError::validation(format!(
            "cas conflict on variable '{path}': expected index {expected}, found {actual}"
        )));
    }
    Ok(())
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, RpcError> {
    decode_payload(payload).map_err(|err| RpcError::StateWrite(format!("bad log payload: {err}")))
}
