use caravel_common::model::{
    ClientStatus, Job, JobId, JobStatus, JobType, Meta, Namespace, Node, NodeRegisterRequest,
    NodeStatus, NodeUpdateAllocRequest, NodeUpdateStatusRequest, ReschedulePolicy, Resources,
    RestartPolicy, SchedulingEligibility, Task, TaskGroup, WriteRequest,
    DEFAULT_JOB_PRIORITY,
};
use caravel_server::bootstrap::Server;
use caravel_server::config::ServerConfig;
use caravel_server::state::StateSnapshot;
use chrono::Utc;
use std::time::Duration;
use uuid::Uuid;

/// Server tuned for fast tests: in-memory log, short broker backoffs, and
/// heartbeat windows long enough that test nodes never expire by accident.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.tracing = caravel_common::tracing::TracingConfig::test("caravel-server-test");
    config.data_dir = None;
    config.heartbeat.min_heartbeat_ttl = Duration::from_secs(60);
    config.heartbeat.heartbeat_grace = Duration::from_secs(60);
    config.heartbeat.max_heartbeats_per_second = 1000.0;
    config.heartbeat.failover_check_interval = Duration::from_millis(50);
    config.scheduler.num_schedulers = 2;
    config.broker.nack_initial_backoff = Duration::from_millis(20);
    config.broker.nack_max_backoff = Duration::from_millis(100);
    config.broker.failed_followup_baseline = Duration::from_millis(200);
    config.broker.failed_followup_jitter = Duration::from_millis(100);
    config
}

/// Variant with a sub-second heartbeat window for partition tests; nodes
/// that should stay alive need a keepalive (see [`spawn_keepalive`]).
pub fn short_heartbeat_config() -> ServerConfig {
    let mut config = test_config();
    config.heartbeat.min_heartbeat_ttl = Duration::from_millis(300);
    config.heartbeat.heartbeat_grace = Duration::from_millis(200);
    config
}

pub async fn start_server(config: ServerConfig) -> Server {
    Server::start(config).await.expect("server should start")
}

pub fn test_node(name: &str, cpu: u64, memory: u64) -> Node {
    Node {
        id: caravel_common::model::NodeId::new_v4(),
        name: name.to_string(),
        datacenter: "dc1".to_string(),
        node_pool: "default".to_string(),
        node_class: String::new(),
        status: NodeStatus::Ready,
        status_description: String::new(),
        status_updated_at: Utc::now(),
        scheduling_eligibility: SchedulingEligibility::Eligible,
        drain: None,
        resources: Resources::new(cpu, memory),
        reserved: Resources::default(),
        attributes: Meta::new(),
        secret_id: Uuid::new_v4(),
        events: vec![],
        create_index: 0,
        modify_index: 0,
    }
}

pub fn job(id: &str, job_type: JobType, count: u32, cpu: u64, memory: u64) -> Job {
    Job {
        id: JobId::new(id),
        namespace: Namespace::default(),
        name: id.to_string(),
        job_type,
        priority: DEFAULT_JOB_PRIORITY,
        datacenters: vec!["dc1".to_string()],
        node_pool: "default".to_string(),
        constraints: vec![],
        task_groups: vec![TaskGroup {
            name: "main".to_string(),
            count,
            tasks: vec![Task {
                name: "task".to_string(),
                driver: "exec".to_string(),
                resources: Resources::new(cpu, memory),
                env: Meta::new(),
            }],
            constraints: vec![],
            affinities: vec![],
            spreads: vec![],
            networks: vec![],
            restart_policy: RestartPolicy::default(),
            reschedule_policy: ReschedulePolicy::default(),
            max_client_disconnect: None,
        }],
        periodic: None,
        parent_id: None,
        stop: false,
        status: JobStatus::Pending,
        version: 0,
        submit_time: Utc::now(),
        create_index: 0,
        modify_index: 0,
        meta: Meta::new(),
    }
}

pub async fn register_node(server: &Server, node: Node) {
    server
        .rpc
        .node_register(NodeRegisterRequest {
            node,
            write: WriteRequest::default(),
        })
        .await
        .expect("node registration should succeed");
}

/// Simulates the client agent reporting a status for one allocation.
pub async fn report_alloc(server: &Server, alloc_id: caravel_common::model::AllocId, status: ClientStatus) {
    let snapshot = server.rpc.state.snapshot();
    let mut alloc = snapshot
        .alloc(&alloc_id)
        .expect("allocation should exist")
        .clone();
    alloc.client_status = status;
    server
        .rpc
        .node_update_alloc(NodeUpdateAllocRequest {
            allocs: vec![alloc],
            write: WriteRequest::default(),
        })
        .await
        .expect("alloc update should succeed");
}

/// Keeps a node's heartbeat fresh until the returned handle is aborted.
pub fn spawn_keepalive(
    server: &Server,
    node_id: caravel_common::model::NodeId,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    let rpc = server.rpc.clone();
    tokio::spawn(async move {
        loop {
            let _ = rpc
                .node_update_status(NodeUpdateStatusRequest {
                    node_id,
                    status: NodeStatus::Ready,
                    node_event: None,
                    write: WriteRequest::default(),
                })
                .await;
            tokio::time::sleep(every).await;
        }
    })
}

/// Polls the state store until `predicate` passes or the timeout lapses.
pub async fn wait_for<F>(server: &Server, timeout: Duration, description: &str, predicate: F)
where
    F: Fn(&StateSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = server.rpc.state.snapshot();
        if predicate(&snapshot) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {description}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
