use crate::state::StateSnapshot;
use caravel_common::model::{
    AllocId, Allocation, ClientStatus, DesiredStatus, Job, JobType, NodeStatus, TaskGroup,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Upper bound on reschedule-chain traversal. Beyond this the chain is
/// treated as exhausted and the allocation is placed fresh without a
/// `previous_allocation` link.
pub const RESCHEDULE_CHAIN_LIMIT: usize = 8;

#[derive(Clone, Debug)]
pub struct PlacementRequest {
    /// Rescheduling chain link for replacements of failed/lost/migrated
    /// allocations.
    pub previous: Option<AllocId>,
}

#[derive(Clone, Debug)]
pub struct StopAction {
    pub alloc: Allocation,
    pub description: String,
    /// Set when the server concludes the client state itself (`lost`).
    pub client_status: Option<ClientStatus>,
}

/// Classified outcome for one task group: what to place, stop, keep and
/// watch.
#[derive(Clone, Debug, Default)]
pub struct Reconciliation {
    pub place: Vec<PlacementRequest>,
    pub stop: Vec<StopAction>,
    /// Allocations on disconnected nodes still inside their disconnect
    /// window: kept as `unknown`, given a follow-up timeout eval, and
    /// replaced in the meantime.
    pub disconnecting: Vec<Allocation>,
    /// Allocations back on a ready node after a disconnect; surplus
    /// replacements are stopped in favor of these.
    pub reconnecting: Vec<Allocation>,
    pub ignored: usize,
}

impl Reconciliation {
    pub fn is_no_op(&self) -> bool {
        self.place.is_empty()
            && self.stop.is_empty()
            && self.disconnecting.is_empty()
            && self.reconnecting.is_empty()
    }
}

/// Diffs one task group's desired state against its current allocations.
pub fn reconcile_task_group(
    snapshot: &StateSnapshot,
    job: &Job,
    tg: &TaskGroup,
    existing: &[&Allocation],
    now: DateTime<Utc>,
) -> Reconciliation {
    let mut result = Reconciliation::default();
    let desired = if job.stop { 0 } else { tg.count as usize };
    let is_batch = matches!(job.job_type, JobType::Batch | JobType::SysBatch);

    let mut healthy: Vec<&Allocation> = Vec::new();
    let mut completed = 0usize;
    let mut replacements_planned: HashSet<AllocId> = HashSet::new();
    for alloc in existing {
        if let Some(previous) = alloc.previous_allocation {
            if !alloc.terminal_status() {
                replacements_planned.insert(previous);
            }
        }
    }

    for alloc in existing {
        if alloc.desired_status != DesiredStatus::Run {
            continue;
        }
        match alloc.client_status {
            ClientStatus::Complete => {
                if is_batch {
                    completed += 1;
                } else if !replacements_planned.contains(&alloc.id) {
                    result.place.push(PlacementRequest { previous: None });
                }
                continue;
            }
            ClientStatus::Failed => {
                if replacements_planned.contains(&alloc.id) || alloc.next_allocation.is_some() {
                    continue;
                }
                if reschedule_allowed(snapshot, alloc) {
                    result.place.push(PlacementRequest {
                        previous: Some(alloc.id),
                    });
                }
                continue;
            }
            ClientStatus::Lost => {
                if !replacements_planned.contains(&alloc.id) && alloc.next_allocation.is_none() {
                    result.place.push(PlacementRequest {
                        previous: Some(alloc.id),
                    });
                }
                continue;
            }
            ClientStatus::Pending | ClientStatus::Running | ClientStatus::Unknown => {}
        }

        let node = snapshot.node(&alloc.node_id);
        match node {
            None => {
                result.stop.push(StopAction {
                    alloc: (*alloc).clone(),
                    description: "alloc lost since node was deregistered".to_string(),
                    client_status: Some(ClientStatus::Lost),
                });
                result.place.push(PlacementRequest {
                    previous: Some(alloc.id),
                });
            }
            Some(node) if node.status == NodeStatus::Down => {
                result.stop.push(StopAction {
                    alloc: (*alloc).clone(),
                    description: "alloc lost since node is down".to_string(),
                    client_status: Some(ClientStatus::Lost),
                });
                result.place.push(PlacementRequest {
                    previous: Some(alloc.id),
                });
            }
            Some(node) if node.status == NodeStatus::Disconnected => {
                if alloc.within_disconnect_window(now) {
                    result.disconnecting.push((*alloc).clone());
                    if !replacements_planned.contains(&alloc.id) {
                        result.place.push(PlacementRequest {
                            previous: Some(alloc.id),
                        });
                    }
                } else {
                    result.stop.push(StopAction {
                        alloc: (*alloc).clone(),
                        description: "alloc not reconnected within the disconnect window"
                            .to_string(),
                        client_status: Some(ClientStatus::Lost),
                    });
                    if !replacements_planned.contains(&alloc.id) {
                        result.place.push(PlacementRequest {
                            previous: Some(alloc.id),
                        });
                    }
                }
            }
            Some(node) if node.drain.is_some() => {
                result.stop.push(StopAction {
                    alloc: (*alloc).clone(),
                    description: "alloc migrated off draining node".to_string(),
                    client_status: None,
                });
                result.place.push(PlacementRequest {
                    previous: Some(alloc.id),
                });
            }
            Some(_) => {
                if alloc.client_status == ClientStatus::Unknown {
                    // Node is back; keep the original and let the surplus
                    // trimming below retire its replacement.
                    result.reconnecting.push((*alloc).clone());
                    healthy.push(alloc);
                } else if alloc.job.version != job.version {
                    result.stop.push(StopAction {
                        alloc: (*alloc).clone(),
                        description: "alloc superseded by newer job version".to_string(),
                        client_status: None,
                    });
                    result.place.push(PlacementRequest {
                        previous: Some(alloc.id),
                    });
                } else {
                    healthy.push(alloc);
                    result.ignored += 1;
                }
            }
        }
    }

    let target = desired.saturating_sub(completed);
    let planned = healthy.len() + result.place.len();
    if planned < target {
        for _ in 0..(target - planned) {
            result.place.push(PlacementRequest { previous: None });
        }
    } else if planned > target {
        let mut surplus = planned - target;

        // Trim proposed placements before touching running allocations.
        while surplus > 0 && !result.place.is_empty() {
            result.place.pop();
            surplus -= 1;
        }

        // Prefer stopping replacements of reconnecting allocations, then the
        // newest allocations.
        let reconnecting_ids: HashSet<AllocId> =
            result.reconnecting.iter().map(|a| a.id).collect();
        let mut stoppable: Vec<&Allocation> = healthy
            .iter()
            .copied()
            .filter(|a| !reconnecting_ids.contains(&a.id))
            .collect();
        stoppable.sort_by_key(|a| {
            let replacement_of_reconnecting = a
                .previous_allocation
                .map(|prev| reconnecting_ids.contains(&prev))
                .unwrap_or(false);
            (std::cmp::Reverse(replacement_of_reconnecting), std::cmp::Reverse(a.create_index))
        });
        for alloc in stoppable.into_iter().take(surplus) {
            result.stop.push(StopAction {
                alloc: alloc.clone(),
                description: "alloc not needed due to job update".to_string(),
                client_status: None,
            });
        }
    }

    result
}

/// Whether a failed allocation may be rescheduled under its group's policy,
/// bounded by the chain traversal limit.
fn reschedule_allowed(snapshot: &StateSnapshot, alloc: &Allocation) -> bool {
    let Some(tg) = alloc.job.lookup_task_group(&alloc.task_group) else {
        return false;
    };
    let policy = &tg.reschedule_policy;
    if policy.unlimited {
        return true;
    }
    if policy.attempts == 0 {
        return false;
    }
    // Walk the chain of predecessors to count prior attempts.
    let mut attempts = 0usize;
    let mut cursor = alloc.previous_allocation;
    while let Some(prev_id) = cursor {
        if attempts >= RESCHEDULE_CHAIN_LIMIT {
            return false;
        }
        attempts += 1;
        cursor = snapshot.alloc(&prev_id).and_then(|a| a.previous_allocation);
    }
    attempts < policy.attempts as usize
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::state::StateStore;
    use caravel_common::model::{
        EvalId, JobId, JobStatus, Meta, Namespace, Node, NodeId, Resources, SchedulingEligibility,
        Task,
    };
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn test_job(count: u32) -> Job {
        Job {
            id: JobId::new("web"),
            namespace: Namespace::default(),
            name: "web".to_string(),
            job_type: JobType::Service,
            priority: 50,
            datacenters: vec!["dc1".to_string()],
            node_pool: "default".to_string(),
            constraints: vec![],
            task_groups: vec![TaskGroup {
                name: "main".to_string(),
                count,
                tasks: vec![Task {
                    name: "server".to_string(),
                    driver: "exec".to_string(),
                    resources: Resources::new(100, 128),
                    env: Meta::new(),
                }],
                constraints: vec![],
                affinities: vec![],
                spreads: vec![],
                networks: vec![],
                restart_policy: Default::default(),
                reschedule_policy: Default::default(),
                max_client_disconnect: Some(std::time::Duration::from_secs(30)),
            }],
            periodic: None,
            parent_id: None,
            stop: false,
            status: JobStatus::Running,
            version: 0,
            submit_time: Utc::now(),
            create_index: 1,
            modify_index: 1,
            meta: Meta::new(),
        }
    }

    fn test_node(status: NodeStatus) -> Node {
        Node {
            id: NodeId::new_v4(),
            name: "node".to_string(),
            datacenter: "dc1".to_string(),
            node_pool: "default".to_string(),
            node_class: String::new(),
            status,
            status_description: String::new(),
            status_updated_at: Utc::now(),
            scheduling_eligibility: SchedulingEligibility::Eligible,
            drain: None,
            resources: Resources::new(1000, 1024),
            reserved: Resources::default(),
            attributes: Meta::new(),
            secret_id: Uuid::new_v4(),
            events: vec![],
            create_index: 1,
            modify_index: 1,
        }
    }

    fn test_alloc(job: &Job, node: &Node, client_status: ClientStatus) -> Allocation {
        let now = Utc::now();
        Allocation {
            id: AllocId::new_v4(),
            eval_id: EvalId::new_v4(),
            namespace: job.namespace.clone(),
            job_id: job.id.clone(),
            job: job.clone(),
            task_group: "main".to_string(),
            node_id: node.id,
            resources: Resources::new(100, 128),
            desired_status: DesiredStatus::Run,
            desired_description: String::new(),
            client_status,
            client_description: String::new(),
            task_states: Default::default(),
            alloc_states: vec![],
            previous_allocation: None,
            next_allocation: None,
            followup_eval_id: None,
            deployment_id: None,
            create_time: now,
            modify_time: now,
            create_index: 2,
            modify_index: 2,
        }
    }

    fn store_with(nodes: &[&Node], allocs: &[&Allocation]) -> StateStore {
        let store = StateStore::new();
        let mut txn = store.begin();
        for node in nodes {
            txn.upsert_node((*node).clone());
        }
        for alloc in allocs {
            txn.upsert_alloc((*alloc).clone());
        }
        store.commit(txn, 10);
        store
    }

    #[test]
    fn steady_state_is_a_no_op() {
        let job = test_job(1);
        let node = test_node(NodeStatus::Ready);
        let alloc = test_alloc(&job, &node, ClientStatus::Running);
        let store = store_with(&[&node], &[&alloc]);
        let snapshot = store.snapshot();

        let result = reconcile_task_group(
            &snapshot,
            &job,
            &job.task_groups[0],
            &[&alloc],
            Utc::now(),
        );
        assert!(result.is_no_op(), "{result:?}");
        assert_eq!(result.ignored, 1);
    }

    #[test]
    fn missing_allocs_are_placed() {
        let job = test_job(3);
        let node = test_node(NodeStatus::Ready);
        let alloc = test_alloc(&job, &node, ClientStatus::Running);
        let store = store_with(&[&node], &[&alloc]);
        let snapshot = store.snapshot();

        let result = reconcile_task_group(
            &snapshot,
            &job,
            &job.task_groups[0],
            &[&alloc],
            Utc::now(),
        );
        assert_eq!(result.place.len(), 2);
    }

    #[test]
    fn down_node_allocs_become_lost_and_replaced() {
        let job = test_job(1);
        let node = test_node(NodeStatus::Down);
        let alloc = test_alloc(&job, &node, ClientStatus::Running);
        let store = store_with(&[&node], &[&alloc]);
        let snapshot = store.snapshot();

        let result = reconcile_task_group(
            &snapshot,
            &job,
            &job.task_groups[0],
            &[&alloc],
            Utc::now(),
        );
        assert_eq!(result.stop.len(), 1);
        assert_eq!(result.stop[0].client_status, Some(ClientStatus::Lost));
        assert_eq!(result.place.len(), 1);
        assert_eq!(result.place[0].previous, Some(alloc.id));
    }

    #[test]
    fn disconnected_alloc_in_window_keeps_and_replaces() {
        let job = test_job(1);
        let node = test_node(NodeStatus::Disconnected);
        let mut alloc = test_alloc(&job, &node, ClientStatus::Unknown);
        alloc.push_state(ClientStatus::Unknown, Utc::now());
        let store = store_with(&[&node], &[&alloc]);
        let snapshot = store.snapshot();

        let result = reconcile_task_group(
            &snapshot,
            &job,
            &job.task_groups[0],
            &[&alloc],
            Utc::now(),
        );
        assert_eq!(result.disconnecting.len(), 1);
        assert_eq!(result.place.len(), 1);
        assert!(result.stop.is_empty());
    }

    #[test]
    fn disconnect_window_expiry_marks_lost() {
        let job = test_job(1);
        let node = test_node(NodeStatus::Disconnected);
        let mut alloc = test_alloc(&job, &node, ClientStatus::Unknown);
        alloc.push_state(
            ClientStatus::Unknown,
            Utc::now() - ChronoDuration::seconds(60),
        );
        let store = store_with(&[&node], &[&alloc]);
        let snapshot = store.snapshot();

        let result = reconcile_task_group(
            &snapshot,
            &job,
            &job.task_groups[0],
            &[&alloc],
            Utc::now(),
        );
        assert_eq!(result.stop.len(), 1);
        assert_eq!(result.stop[0].client_status, Some(ClientStatus::Lost));
    }

    #[test]
    fn reconnect_stops_replacement() {
        let job = test_job(1);
        let node = test_node(NodeStatus::Ready);
        let node2 = test_node(NodeStatus::Ready);
        let mut original = test_alloc(&job, &node, ClientStatus::Unknown);
        original.push_state(ClientStatus::Unknown, Utc::now());
        let mut replacement = test_alloc(&job, &node2, ClientStatus::Running);
        replacement.previous_allocation = Some(original.id);
        replacement.create_index = 5;
        let store = store_with(&[&node, &node2], &[&original, &replacement]);
        let snapshot = store.snapshot();

        let result = reconcile_task_group(
            &snapshot,
            &job,
            &job.task_groups[0],
            &[&original, &replacement],
            Utc::now(),
        );
        assert_eq!(result.reconnecting.len(), 1);
        assert_eq!(result.stop.len(), 1);
        assert_eq!(result.stop[0].alloc.id, replacement.id);
        assert!(result.place.is_empty());
    }

    #[test]
    fn completed_batch_allocs_are_not_replaced() {
        let mut job = test_job(1);
        job.job_type = JobType::Batch;
        let node = test_node(NodeStatus::Ready);
        let mut alloc = test_alloc(&job, &node, ClientStatus::Complete);
        alloc.job.job_type = JobType::Batch;
        let store = store_with(&[&node], &[&alloc]);
        let snapshot = store.snapshot();

        let result = reconcile_task_group(
            &snapshot,
            &job,
            &job.task_groups[0],
            &[&alloc],
            Utc::now(),
        );
        assert!(result.is_no_op(), "{result:?}");
    }

    #[test]
    fn failed_alloc_reschedules_until_attempts_exhausted() {
        let job = test_job(1);
        let node = test_node(NodeStatus::Ready);
        let failed = test_alloc(&job, &node, ClientStatus::Failed);
        let store = store_with(&[&node], &[&failed]);
        let snapshot = store.snapshot();

        let result = reconcile_task_group(
            &snapshot,
            &job,
            &job.task_groups[0],
            &[&failed],
            Utc::now(),
        );
        assert_eq!(result.place.len(), 1);
        assert_eq!(result.place[0].previous, Some(failed.id));

        // Build a chain at the policy limit (default 2 attempts).
        let mut first = test_alloc(&job, &node, ClientStatus::Failed);
        let mut second = test_alloc(&job, &node, ClientStatus::Failed);
        second.previous_allocation = Some(first.id);
        let mut third = test_alloc(&job, &node, ClientStatus::Failed);
        third.previous_allocation = Some(second.id);
        first.next_allocation = Some(second.id);
        second.next_allocation = Some(third.id);
        let store = store_with(&[&node], &[&first, &second, &third]);
        let snapshot = store.snapshot();

        let result = reconcile_task_group(
            &snapshot,
            &job,
            &job.task_groups[0],
            &[&third],
            Utc::now(),
        );
        // Two prior attempts exhaust the policy; only the count-repair
        // placement (no chain link) remains.
        assert!(result.place.iter().all(|p| p.previous.is_none()));
    }
}
