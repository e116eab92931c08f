use super::{
    AllocListStub, Allocation, DrainStrategy, EvalId, EvalToken, Evaluation, Job,
    JobDeregisterOptions, JobId, JobListStub, JobType, LogIndex, Namespace, Node, NodeEvent,
    NodeId, NodeListStub, NodePool, NodeStatus, Plan, PlanResult, ServiceRegistration, Variable,
    VariableMetadata,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_REGION: &str = "global";

/// Options carried by every read RPC. A `min_query_index > 0` turns the read
/// into a blocking query bounded by `max_query_time`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryOptions {
    pub region: String,
    pub namespace: Namespace,
    pub min_query_index: LogIndex,
    #[serde(default, with = "humantime_serde::option")]
    pub max_query_time: Option<Duration>,
    pub allow_stale: bool,
    pub auth_token: Option<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            region: DEFAULT_REGION.to_string(),
            namespace: Namespace::default(),
            min_query_index: 0,
            max_query_time: None,
            allow_stale: false,
            auth_token: None,
        }
    }
}

/// Options carried by every write RPC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteRequest {
    pub region: String,
    pub namespace: Namespace,
    pub auth_token: Option<String>,
}

impl Default for WriteRequest {
    fn default() -> Self {
        WriteRequest {
            region: DEFAULT_REGION.to_string(),
            namespace: Namespace::default(),
            auth_token: None,
        }
    }
}

/// Metadata on every read reply. `index` is never 0 and never decreases for
/// a given client across successful responses.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryMeta {
    pub index: LogIndex,
    pub known_leader: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenericWriteResponse {
    pub index: LogIndex,
}

// --- Node ---

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRegisterRequest {
    pub node: Node,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeUpdateResponse {
    pub eval_ids: Vec<EvalId>,
    #[serde(default, with = "humantime_serde::option")]
    pub heartbeat_ttl: Option<Duration>,
    pub index: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeDeregisterRequest {
    pub node_id: NodeId,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeUpdateStatusRequest {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub node_event: Option<NodeEvent>,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeUpdateDrainRequest {
    pub node_id: NodeId,
    pub drain_strategy: Option<DrainStrategy>,
    /// Restore scheduling eligibility when the drain is lifted.
    pub mark_eligible: bool,
    pub node_event: Option<NodeEvent>,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeUpdateAllocRequest {
    /// Client status reports; servers require exactly one allocation per
    /// request.
    pub allocs: Vec<Allocation>,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSpecificRequest {
    pub node_id: NodeId,
    pub secret_id: Option<uuid::Uuid>,
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeAllocsResponse {
    pub allocs: Vec<Allocation>,
    pub meta: QueryMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SingleNodeResponse {
    pub node: Option<Node>,
    pub meta: QueryMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeListRequest {
    pub prefix: Option<String>,
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeListResponse {
    pub nodes: Vec<NodeListStub>,
    pub meta: QueryMeta,
}

// --- Job ---

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRegisterRequest {
    pub job: Job,
    /// Compare-and-set: reject unless the stored job's modify index matches.
    pub enforce_index: Option<LogIndex>,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobRegisterResponse {
    /// Absent for periodic parents, which launch through the dispatcher.
    pub eval_id: Option<EvalId>,
    pub job_modify_index: LogIndex,
    pub warnings: String,
    pub index: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobDeregisterRequest {
    pub job_id: JobId,
    pub options: JobDeregisterOptions,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobDeregisterResponse {
    pub eval_id: Option<EvalId>,
    pub index: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSpecificRequest {
    pub job_id: JobId,
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SingleJobResponse {
    pub job: Option<Job>,
    pub meta: QueryMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobListRequest {
    pub prefix: Option<String>,
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobListStub>,
    pub meta: QueryMeta,
}

// --- Eval ---

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvalDequeueRequest {
    /// Scheduler types this worker can process.
    pub schedulers: Vec<JobType>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EvalDequeueResponse {
    pub eval: Option<Evaluation>,
    pub token: Option<EvalToken>,
    pub meta: QueryMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvalAckRequest {
    pub eval_id: EvalId,
    pub token: EvalToken,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvalSpecificRequest {
    pub eval_id: String,
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SingleEvalResponse {
    pub eval: Option<Evaluation>,
    pub meta: QueryMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvalListRequest {
    pub prefix: Option<String>,
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvalListResponse {
    pub evals: Vec<Evaluation>,
    pub meta: QueryMeta,
}

// --- Alloc ---

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocSpecificRequest {
    /// Full UUID or an unambiguous prefix of at least two hex characters.
    pub alloc_id: String,
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SingleAllocResponse {
    pub alloc: Option<Allocation>,
    pub meta: QueryMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocListRequest {
    pub prefix: Option<String>,
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocListResponse {
    pub allocations: Vec<AllocListStub>,
    pub meta: QueryMeta,
}

// --- Plan ---

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanSubmitRequest {
    pub plan: Plan,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanSubmitResponse {
    pub result: PlanResult,
    pub index: LogIndex,
}

// --- Node pools ---

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodePoolListRequest {
    pub prefix: Option<String>,
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodePoolListResponse {
    pub pools: Vec<NodePool>,
    pub meta: QueryMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodePoolSpecificRequest {
    pub name: String,
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SingleNodePoolResponse {
    pub pool: Option<NodePool>,
    pub meta: QueryMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodePoolUpsertRequest {
    pub pools: Vec<NodePool>,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodePoolDeleteRequest {
    pub names: Vec<String>,
    pub write: WriteRequest,
}

// --- Service registrations ---

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceRegistrationUpsertRequest {
    pub services: Vec<ServiceRegistration>,
    /// Node identity proof; service upserts are client-only.
    pub node_secret: uuid::Uuid,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceRegistrationDeleteRequest {
    pub id: String,
    pub node_secret: uuid::Uuid,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceRegistrationListRequest {
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceRegistrationListResponse {
    pub services: Vec<ServiceRegistration>,
    pub meta: QueryMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceRegistrationGetRequest {
    pub service_name: String,
    /// `"n|key"` — return the `n` instances owning `key` under rendezvous
    /// hashing, so distinct keys spread over distinct subsets.
    pub choose: Option<String>,
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceRegistrationGetResponse {
    pub services: Vec<ServiceRegistration>,
    pub meta: QueryMeta,
}

// --- Variables ---

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariableUpsertRequest {
    pub variable: Variable,
    /// Compare-and-set: `Some(0)` requires the path to be absent; any other
    /// value must match the stored modify index.
    pub check_index: Option<LogIndex>,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariableDeleteRequest {
    pub path: String,
    pub check_index: Option<LogIndex>,
    pub write: WriteRequest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariableReadRequest {
    pub path: String,
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SingleVariableResponse {
    pub variable: Option<Variable>,
    pub meta: QueryMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariableListRequest {
    pub path_prefix: Option<String>,
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariableListResponse {
    pub variables: Vec<VariableMetadata>,
    pub meta: QueryMeta,
}

// --- Cluster search ---

pub const SEARCH_TRUNCATION_LIMIT: usize = 20;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SearchContext {
    Jobs,
    Evals,
    Allocs,
    Nodes,
    NodePools,
    All,
}

impl SearchContext {
    pub const SEARCHABLE: [SearchContext; 5] = [
        SearchContext::Jobs,
        SearchContext::Evals,
        SearchContext::Allocs,
        SearchContext::Nodes,
        SearchContext::NodePools,
    ];
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchRequest {
    pub prefix: String,
    pub context: SearchContext,
    pub query: QueryOptions,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub matches: BTreeMap<SearchContext, Vec<String>>,
    pub truncations: BTreeMap<SearchContext, bool>,
    pub meta: QueryMeta,
}
