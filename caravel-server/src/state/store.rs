use super::watch::{Table, WatchBroadcast, WatchSet};
use caravel_common::model::{
    AclToken, AllocId, Allocation, Deployment, DeploymentId, EvalId, Evaluation, Job, JobId,
    LogIndex, Namespace, Node, NodeId, NodePool, PeriodicLaunch, RpcError, ServiceRegistration,
    TokenId, Variable, NODE_POOL_ALL, NODE_POOL_DEFAULT,
};
use im::{OrdMap, OrdSet};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

type JobKey = (Namespace, JobId);
type ServiceKey = (Namespace, String);

/// Immutable view of the entire database at one log index. Cloning is O(1);
/// iterators taken from a snapshot are stable against later commits.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub index: LogIndex,
    jobs: OrdMap<JobKey, Job>,
    nodes: OrdMap<NodeId, Node>,
    allocs: OrdMap<AllocId, Allocation>,
    allocs_by_node: OrdMap<NodeId, OrdSet<AllocId>>,
    allocs_by_job: OrdMap<JobKey, OrdSet<AllocId>>,
    allocs_by_eval: OrdMap<EvalId, OrdSet<AllocId>>,
    evals: OrdMap<EvalId, Evaluation>,
    evals_by_job: OrdMap<JobKey, OrdSet<EvalId>>,
    deployments: OrdMap<DeploymentId, Deployment>,
    periodic_launches: OrdMap<JobKey, PeriodicLaunch>,
    node_pools: OrdMap<String, NodePool>,
    services: OrdMap<ServiceKey, ServiceRegistration>,
    acl_tokens: OrdMap<TokenId, AclToken>,
    acl_by_secret: OrdMap<Uuid, TokenId>,
    variables: OrdMap<ServiceKey, Variable>,
    table_index: OrdMap<String, LogIndex>,
}

impl StateSnapshot {
    /// Genesis state: empty tables plus the immutable built-in node pools.
    pub fn genesis() -> StateSnapshot {
        let mut snapshot = StateSnapshot::default();
        for name in [NODE_POOL_ALL, NODE_POOL_DEFAULT] {
            let pool = NodePool::built_in(name);
            snapshot.node_pools.insert(pool.name.clone(), pool);
        }
        snapshot
            .table_index
            .insert(Table::NodePools.name().to_string(), 1);
        snapshot
    }

    /// Last index that mutated `table`, floored at 1 so empty reads never
    /// return the reserved index 0.
    pub fn table_index(&self, table: Table) -> LogIndex {
        self.table_index.get(table.name()).copied().unwrap_or(0).max(1)
    }

    // --- jobs ---

    pub fn job(&self, namespace: &Namespace, id: &JobId) -> Option<&Job> {
        self.jobs.get(&(namespace.clone(), id.clone()))
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn jobs_in_namespace<'a>(&'a self, namespace: &'a Namespace) -> impl Iterator<Item = &'a Job> {
        self.jobs
            .values()
            .filter(move |job| &job.namespace == namespace)
    }

    /// Non-terminal derived children of a periodic parent, matched by ID
    /// prefix plus parent equality.
    pub fn active_periodic_children<'a>(
        &'a self,
        namespace: &'a Namespace,
        parent: &'a JobId,
    ) -> impl Iterator<Item = &'a Job> {
        let prefix = format!("{}{}", parent, caravel_common::model::PERIODIC_LAUNCH_SUFFIX);
        self.jobs_in_namespace(namespace).filter(move |job| {
            job.id.as_str().starts_with(&prefix)
                && job.parent_id.as_ref() == Some(parent)
                && job.status != caravel_common::model::JobStatus::Dead
        })
    }

    // --- nodes ---

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    // --- allocations ---

    pub fn alloc(&self, id: &AllocId) -> Option<&Allocation> {
        self.allocs.get(id)
    }

    pub fn allocs_for_node(&self, node_id: &NodeId) -> Vec<&Allocation> {
        self.allocs_by_node
            .get(node_id)
            .map(|ids| ids.iter().filter_map(|id| self.allocs.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn allocs_for_job(&self, namespace: &Namespace, job_id: &JobId) -> Vec<&Allocation> {
        self.allocs_by_job
            .get(&(namespace.clone(), job_id.clone()))
            .map(|ids| ids.iter().filter_map(|id| self.allocs.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn allocs(&self) -> impl Iterator<Item = &Allocation> {
        self.allocs.values()
    }

    /// Resolves a full UUID or an unambiguous prefix of at least two hex
    /// characters.
    pub fn alloc_by_prefix(&self, prefix: &str) -> Result<Option<&Allocation>, RpcError> {
        resolve_prefix(prefix, self.allocs.values(), |alloc| alloc.id.0)
    }

    // --- evaluations ---

    pub fn eval(&self, id: &EvalId) -> Option<&Evaluation> {
        self.evals.get(id)
    }

    pub fn evals(&self) -> impl Iterator<Item = &Evaluation> {
        self.evals.values()
    }

    pub fn evals_for_job(&self, namespace: &Namespace, job_id: &JobId) -> Vec<&Evaluation> {
        self.evals_by_job
            .get(&(namespace.clone(), job_id.clone()))
            .map(|ids| ids.iter().filter_map(|id| self.evals.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn eval_by_prefix(&self, prefix: &str) -> Result<Option<&Evaluation>, RpcError> {
        resolve_prefix(prefix, self.evals.values(), |eval| eval.id.0)
    }

    // --- deployments ---

    pub fn deployment(&self, id: &DeploymentId) -> Option<&Deployment> {
        self.deployments.get(id)
    }

    // --- periodic launches ---

    pub fn periodic_launch(&self, namespace: &Namespace, job_id: &JobId) -> Option<&PeriodicLaunch> {
        self.periodic_launches.get(&(namespace.clone(), job_id.clone()))
    }

    // --- node pools ---

    pub fn node_pool(&self, name: &str) -> Option<&NodePool> {
        self.node_pools.get(name)
    }

    pub fn node_pools(&self) -> impl Iterator<Item = &NodePool> {
        self.node_pools.values()
    }

    // --- service registrations ---

    pub fn service(&self, namespace: &Namespace, id: &str) -> Option<&ServiceRegistration> {
        self.services.get(&(namespace.clone(), id.to_string()))
    }

    pub fn services_in_namespace<'a>(
        &'a self,
        namespace: &'a Namespace,
    ) -> impl Iterator<Item = &'a ServiceRegistration> {
        self.services
            .values()
            .filter(move |s| &s.namespace == namespace)
    }

    pub fn services_by_name<'a>(
        &'a self,
        namespace: &'a Namespace,
        service_name: &'a str,
    ) -> Vec<&'a ServiceRegistration> {
        self.services_in_namespace(namespace)
            .filter(|s| s.service_name == service_name)
            .collect()
    }

    // --- variables ---

    pub fn variable(&self, namespace: &Namespace, path: &str) -> Option<&Variable> {
        self.variables.get(&(namespace.clone(), path.to_string()))
    }

    pub fn variables_in_namespace<'a>(
        &'a self,
        namespace: &'a Namespace,
    ) -> impl Iterator<Item = &'a Variable> {
        self.variables
            .values()
            .filter(move |v| &v.namespace == namespace)
    }

    // --- ACL tokens ---

    pub fn acl_token_by_secret(&self, secret: &Uuid) -> Option<&AclToken> {
        self.acl_by_secret
            .get(secret)
            .and_then(|accessor| self.acl_tokens.get(accessor))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<StateSnapshot, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

fn resolve_prefix<'a, T, F>(
    prefix: &str,
    items: impl Iterator<Item = &'a T>,
    id_of: F,
) -> Result<Option<&'a T>, RpcError>
where
    F: Fn(&T) -> Uuid,
{
    let needle = prefix.to_ascii_lowercase();
    if let Ok(exact) = Uuid::parse_str(&needle) {
        let mut found = None;
        for item in items {
            if id_of(item) == exact {
                found = Some(item);
                break;
            }
        }
        return Ok(found);
    }
    if needle.len() < 2 {
        return Err(RpcError::validation(format!(
            "identifier '{prefix}' must be at least 2 characters"
        )));
    }
    let mut matches = Vec::new();
    for item in items {
        if id_of(item).to_string().starts_with(&needle) {
            matches.push(item);
        }
    }
    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches.remove(0))),
        _ => Err(RpcError::AmbiguousIdentifier {
            prefix: prefix.to_string(),
            matches: matches.iter().map(|m| id_of(m).to_string()).collect(),
        }),
    }
}

/// An in-progress multi-table write built by the FSM. All mutations land in
/// one commit so readers never observe a torn entry.
pub struct StateTxn {
    next: StateSnapshot,
    touched: Vec<Table>,
}

impl StateTxn {
    fn touch(&mut self, table: Table) {
        if !self.touched.contains(&table) {
            self.touched.push(table);
        }
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.next
    }

    pub fn upsert_job(&mut self, job: Job) {
        self.next
            .jobs
            .insert((job.namespace.clone(), job.id.clone()), job);
        self.touch(Table::Jobs);
    }

    pub fn delete_job(&mut self, namespace: &Namespace, id: &JobId) {
        let key = (namespace.clone(), id.clone());
        self.next.jobs.remove(&key);
        self.next.periodic_launches.remove(&key);
        self.touch(Table::Jobs);
        self.touch(Table::PeriodicLaunches);
    }

    pub fn upsert_node(&mut self, node: Node) {
        self.next.nodes.insert(node.id, node);
        self.touch(Table::Nodes);
    }

    pub fn delete_node(&mut self, id: &NodeId) {
        self.next.nodes.remove(id);
        self.touch(Table::Nodes);
    }

    pub fn upsert_alloc(&mut self, alloc: Allocation) {
        let id = alloc.id;
        let job_key = (alloc.namespace.clone(), alloc.job_id.clone());

        let mut node_set = self
            .next
            .allocs_by_node
            .get(&alloc.node_id)
            .cloned()
            .unwrap_or_default();
        node_set.insert(id);
        self.next.allocs_by_node.insert(alloc.node_id, node_set);

        let mut job_set = self
            .next
            .allocs_by_job
            .get(&job_key)
            .cloned()
            .unwrap_or_default();
        job_set.insert(id);
        self.next.allocs_by_job.insert(job_key, job_set);

        let mut eval_set = self
            .next
            .allocs_by_eval
            .get(&alloc.eval_id)
            .cloned()
            .unwrap_or_default();
        eval_set.insert(id);
        self.next.allocs_by_eval.insert(alloc.eval_id, eval_set);

        self.next.allocs.insert(id, alloc);
        self.touch(Table::Allocs);
    }

    pub fn upsert_eval(&mut self, eval: Evaluation) {
        let job_key = (eval.namespace.clone(), eval.job_id.clone());
        let mut set = self
            .next
            .evals_by_job
            .get(&job_key)
            .cloned()
            .unwrap_or_default();
        set.insert(eval.id);
        self.next.evals_by_job.insert(job_key, set);
        self.next.evals.insert(eval.id, eval);
        self.touch(Table::Evals);
    }

    pub fn delete_eval(&mut self, id: &EvalId) {
        if let Some(eval) = self.next.evals.remove(id) {
            let job_key = (eval.namespace.clone(), eval.job_id.clone());
            if let Some(set) = self.next.evals_by_job.get(&job_key) {
                let mut set = set.clone();
                set.remove(id);
                if set.is_empty() {
                    self.next.evals_by_job.remove(&job_key);
                } else {
                    self.next.evals_by_job.insert(job_key, set);
                }
            }
        }
        self.touch(Table::Evals);
    }

    pub fn upsert_deployment(&mut self, deployment: Deployment) {
        self.next.deployments.insert(deployment.id, deployment);
        self.touch(Table::Deployments);
    }

    pub fn upsert_periodic_launch(&mut self, launch: PeriodicLaunch) {
        self.next
            .periodic_launches
            .insert((launch.namespace.clone(), launch.job_id.clone()), launch);
        self.touch(Table::PeriodicLaunches);
    }

    pub fn upsert_node_pool(&mut self, pool: NodePool) {
        self.next.node_pools.insert(pool.name.clone(), pool);
        self.touch(Table::NodePools);
    }

    pub fn delete_node_pool(&mut self, name: &str) {
        self.next.node_pools.remove(name);
        self.touch(Table::NodePools);
    }

    pub fn upsert_service(&mut self, service: ServiceRegistration) {
        self.next
            .services
            .insert((service.namespace.clone(), service.id.clone()), service);
        self.touch(Table::Services);
    }

    pub fn delete_service(&mut self, namespace: &Namespace, id: &str) {
        self.next
            .services
            .remove(&(namespace.clone(), id.to_string()));
        self.touch(Table::Services);
    }

    pub fn upsert_variable(&mut self, variable: Variable) {
        self.next
            .variables
            .insert((variable.namespace.clone(), variable.path.clone()), variable);
        self.touch(Table::Variables);
    }

    pub fn delete_variable(&mut self, namespace: &Namespace, path: &str) {
        self.next
            .variables
            .remove(&(namespace.clone(), path.to_string()));
        self.touch(Table::Variables);
    }

    pub fn upsert_acl_token(&mut self, token: AclToken) {
        self.next.acl_by_secret.insert(token.secret_id, token.accessor_id);
        self.next.acl_tokens.insert(token.accessor_id, token);
        self.touch(Table::AclTokens);
    }
}

/// The single-writer, multi-reader state store. Readers take immutable
/// snapshots; the FSM is the only writer.
pub struct StateStore {
    current: RwLock<Arc<StateSnapshot>>,
    watch: WatchBroadcast,
}

impl StateStore {
    pub fn new() -> Self {
        StateStore {
            current: RwLock::new(Arc::new(StateSnapshot::genesis())),
            watch: WatchBroadcast::new(),
        }
    }

    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        self.current.read().expect("state lock poisoned").clone()
    }

    pub fn begin(&self) -> StateTxn {
        StateTxn {
            next: (*self.snapshot()).clone(),
            touched: Vec::new(),
        }
    }

    /// Publishes a transaction at `index`: the snapshot swap is atomic, so a
    /// reader sees either the whole entry or none of it.
    pub fn commit(&self, mut txn: StateTxn, index: LogIndex) {
        txn.next.index = index;
        for table in &txn.touched {
            txn.next.table_index.insert(table.name().to_string(), index);
        }
        let touched = txn.touched;
        {
            let mut current = self.current.write().expect("state lock poisoned");
            *current = Arc::new(txn.next);
        }
        self.watch.notify(&touched, index);
    }

    /// Replaces the whole database, used when restoring from a persisted
    /// snapshot.
    pub fn restore(&self, snapshot: StateSnapshot) {
        let index = snapshot.index;
        {
            let mut current = self.current.write().expect("state lock poisoned");
            *current = Arc::new(snapshot);
        }
        self.watch.notify(&Table::ALL, index);
    }

    pub fn watch(&self, tables: &[Table]) -> WatchSet {
        self.watch.subscribe(tables)
    }

    pub fn last_index(&self) -> LogIndex {
        self.snapshot().index
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
