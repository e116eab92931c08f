use crate::state::StateSnapshot;
use caravel_common::model::{
    AllocId, Allocation, AllocationDiff, ClientStatus, DesiredStatus, EvalToken, Evaluation, Job,
    JobType, NodeId, Plan, Resources, RpcError, TaskGroup,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};

pub mod feasibility;
pub mod generic;
pub mod rank;
pub mod reconcile;
pub mod system;
pub mod worker;

/// One task-group placement the scheduler could not satisfy, with the
/// capacity digest the blocked-evals tracker keys on.
#[derive(Clone, Debug)]
pub struct FailedPlacement {
    pub task_group: String,
    pub reason: String,
    pub class_eligibility: BTreeMap<String, bool>,
    pub escaped: bool,
}

#[derive(Debug)]
pub struct SchedulerOutcome {
    pub plan: Plan,
    pub followup_evals: Vec<Evaluation>,
    pub failed: Vec<FailedPlacement>,
}

/// A type-specific scheduler: pure function from (eval, snapshot) to a
/// proposed plan. Instantiated per eval and discarded with it.
pub trait Scheduler: Send + Sync {
    fn process(
        &self,
        eval: &Evaluation,
        snapshot: &StateSnapshot,
    ) -> Result<SchedulerOutcome, RpcError>;
}

pub fn scheduler_for(job_type: JobType) -> Box<dyn Scheduler> {
    match job_type {
        JobType::Service | JobType::Batch => Box::new(generic::GenericScheduler),
        JobType::System | JobType::SysBatch => Box::new(system::SystemScheduler),
    }
}

/// Accumulates a plan while tracking intra-plan capacity consumption, so two
/// placements in the same plan cannot both claim the last slot of a node.
pub(crate) struct PlanBuilder<'a> {
    snapshot: &'a StateSnapshot,
    eval: &'a Evaluation,
    now: DateTime<Utc>,
    plan: Plan,
    /// Resources claimed by placements made in this plan, per node.
    usage_delta: HashMap<NodeId, Resources>,
    /// Allocations this plan stops, whose capacity is released.
    released: HashSet<AllocId>,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(
        snapshot: &'a StateSnapshot,
        eval: &'a Evaluation,
        token: EvalToken,
        job: Option<Job>,
        now: DateTime<Utc>,
    ) -> PlanBuilder<'a> {
        PlanBuilder {
            snapshot,
            eval,
            now,
            plan: Plan {
                eval_id: eval.id,
                eval_token: token,
                priority: eval.priority,
                all_at_once: false,
                job,
                node_allocation: BTreeMap::new(),
                node_update: BTreeMap::new(),
                node_preemptions: BTreeMap::new(),
                deployment: None,
                deployment_updates: Vec::new(),
                snapshot_index: snapshot.index,
            },
            usage_delta: HashMap::new(),
            released: HashSet::new(),
        }
    }

    pub fn stop(
        &mut self,
        alloc: &Allocation,
        description: &str,
        client_status: Option<ClientStatus>,
    ) {
        self.released.insert(alloc.id);
        self.plan
            .node_update
            .entry(alloc.node_id)
            .or_default()
            .push(AllocationDiff {
                id: alloc.id,
                desired_status: DesiredStatus::Stop,
                desired_description: description.to_string(),
                client_status,
                next_allocation: None,
                followup_eval_id: None,
                modify_time: self.now,
            });
    }

    /// Re-upserts an existing allocation with modified server-side fields
    /// (follow-up eval link, chain pointers). Not a new placement; capacity
    /// accounting treats it as already on the node.
    pub fn update_in_place(&mut self, alloc: Allocation) {
        self.plan
            .node_allocation
            .entry(alloc.node_id)
            .or_default()
            .push(alloc);
    }

    /// Creates a new allocation of `tg` on `node_id`.
    pub fn place(
        &mut self,
        job: &Job,
        tg: &TaskGroup,
        node_id: NodeId,
        previous: Option<AllocId>,
    ) -> AllocId {
        let resources = tg.combined_resources();
        let alloc = Allocation {
            id: AllocId::new_v4(),
            eval_id: self.eval.id,
            namespace: job.namespace.clone(),
            job_id: job.id.clone(),
            job: job.clone(),
            task_group: tg.name.clone(),
            node_id,
            resources: resources.clone(),
            desired_status: DesiredStatus::Run,
            desired_description: String::new(),
            client_status: ClientStatus::Pending,
            client_description: String::new(),
            task_states: BTreeMap::new(),
            alloc_states: Vec::new(),
            previous_allocation: previous,
            next_allocation: None,
            followup_eval_id: None,
            deployment_id: None,
            create_time: self.now,
            modify_time: self.now,
            create_index: 0,
            modify_index: 0,
        };
        let id = alloc.id;
        self.usage_delta
            .entry(node_id)
            .or_default()
            .add(&resources);
        self.plan
            .node_allocation
            .entry(node_id)
            .or_default()
            .push(alloc);
        if let Some(previous) = previous {
            self.link_previous(previous, id);
        }
        id
    }

    /// Records the forward pointer of a rescheduling chain on the
    /// predecessor, wherever that predecessor currently lives in the plan.
    fn link_previous(&mut self, previous: AllocId, next: AllocId) {
        for allocs in self.plan.node_allocation.values_mut() {
            if let Some(entry) = allocs.iter_mut().find(|a| a.id == previous) {
                entry.next_allocation = Some(next);
                return;
            }
        }
        for diffs in self.plan.node_update.values_mut() {
            if let Some(diff) = diffs.iter_mut().find(|d| d.id == previous) {
                diff.next_allocation = Some(next);
                return;
            }
        }
        // Predecessor untouched by this plan (e.g. already failed): carry
        // the pointer as an in-place update.
        if let Some(existing) = self.snapshot.alloc(&previous) {
            let mut updated = existing.clone();
            updated.next_allocation = Some(next);
            updated.modify_time = self.now;
            self.update_in_place(updated);
        }
    }

    /// Usage on `node` as this plan sees it: committed usage minus what the
    /// plan stops, plus what the plan already placed.
    pub fn projected_usage(&self, node_id: &NodeId) -> Resources {
        let node = match self.snapshot.node(node_id) {
            Some(node) => node,
            None => return Resources::default(),
        };
        let mut used = feasibility::node_current_usage(self.snapshot, node, &self.released);
        if let Some(delta) = self.usage_delta.get(node_id) {
            used.add(delta);
        }
        used
    }

    pub fn finish(self) -> Plan {
        self.plan
    }
}
