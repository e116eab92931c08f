use crate::common::*;
use assert2::check;
use caravel_common::model::{
    ClientStatus, DesiredStatus, JobRegisterRequest, JobType, NodeStatus, TriggeredBy,
    WriteRequest,
};
use std::time::Duration;
use test_r::{test, timeout};

/// Shared setup for the partition scenarios: three single-slot nodes, a
/// count-2 service job with a disconnect window, both allocations running.
/// Returns the victim allocation (whose node will stop heartbeating) and the
/// keepalive handles by node.
async fn partition_fixture(
    server: &caravel_server::bootstrap::Server,
    window: Duration,
) -> (
    caravel_common::model::AllocId,
    caravel_common::model::NodeId,
    std::collections::HashMap<caravel_common::model::NodeId, tokio::task::JoinHandle<()>>,
) {
    let mut keepalives = std::collections::HashMap::new();
    for name in ["n1", "n2", "n3"] {
        let node = test_node(name, 500, 256);
        let node_id = node.id;
        register_node(server, node).await;
        keepalives.insert(node_id, spawn_keepalive(server, node_id, Duration::from_millis(100)));
    }

    let mut spec = job("web", JobType::Service, 2, 500, 256);
    spec.task_groups[0].max_client_disconnect = Some(window);
    server
        .rpc
        .job_register(JobRegisterRequest {
            job: spec,
            enforce_index: None,
            write: WriteRequest::default(),
        })
        .await
        .unwrap();

    wait_for(server, Duration::from_secs(10), "both allocs placed", |s| {
        s.allocs().filter(|a| a.job_id.as_str() == "web").count() == 2
    })
    .await;
    let snapshot = server.rpc.state.snapshot();
    let allocs: Vec<_> = snapshot
        .allocs()
        .filter(|a| a.job_id.as_str() == "web")
        .cloned()
        .collect();
    check!(allocs[0].node_id != allocs[1].node_id, "single-slot nodes");
    for alloc in &allocs {
        report_alloc(server, alloc.id, ClientStatus::Running).await;
    }

    let victim = allocs[0].clone();
    (victim.id, victim.node_id, keepalives)
}

#[test]
#[timeout(60000)]
async fn disconnected_node_recovers_before_window_expires() {
    let server = start_server(short_heartbeat_config()).await;
    let window = Duration::from_secs(6);
    let (victim_alloc, victim_node, mut keepalives) = partition_fixture(&server, window).await;

    // Partition: the victim's heartbeats stop.
    keepalives.remove(&victim_node).unwrap().abort();

    wait_for(&server, Duration::from_secs(5), "node disconnected", |s| {
        s.node(&victim_node)
            .map(|n| n.status == NodeStatus::Disconnected)
            .unwrap_or(false)
    })
    .await;
    wait_for(&server, Duration::from_secs(5), "alloc unknown", |s| {
        s.alloc(&victim_alloc)
            .map(|a| a.client_status == ClientStatus::Unknown)
            .unwrap_or(false)
    })
    .await;
    wait_for(&server, Duration::from_secs(5), "replacement placed", |s| {
        s.allocs()
            .any(|a| a.previous_allocation == Some(victim_alloc))
    })
    .await;

    let snapshot = server.rpc.state.snapshot();
    let replacement = snapshot
        .allocs()
        .find(|a| a.previous_allocation == Some(victim_alloc))
        .unwrap()
        .clone();
    check!(replacement.node_id != victim_node);
    report_alloc(&server, replacement.id, ClientStatus::Running).await;

    // The original carries the timeout follow-up link.
    let original = snapshot.alloc(&victim_alloc).unwrap();
    check!(original.followup_eval_id.is_some());

    // Reconnect inside the window: heartbeats resume and the client
    // re-reports its still-running task.
    keepalives.insert(
        victim_node,
        spawn_keepalive(&server, victim_node, Duration::from_millis(100)),
    );
    wait_for(&server, Duration::from_secs(5), "node ready again", |s| {
        s.node(&victim_node)
            .map(|n| n.status == NodeStatus::Ready)
            .unwrap_or(false)
    })
    .await;
    wait_for(&server, Duration::from_secs(5), "reconnect eval ran", |s| {
        s.evals()
            .any(|e| e.triggered_by == TriggeredBy::Reconnect)
    })
    .await;
    report_alloc(&server, victim_alloc, ClientStatus::Running).await;

    wait_for(&server, Duration::from_secs(10), "replacement retired", |s| {
        s.alloc(&replacement.id)
            .map(|a| a.desired_status == DesiredStatus::Stop)
            .unwrap_or(false)
    })
    .await;
    let snapshot = server.rpc.state.snapshot();
    let original = snapshot.alloc(&victim_alloc).unwrap();
    check!(original.desired_status == DesiredStatus::Run);
    check!(original.client_status == ClientStatus::Running);

    for (_, handle) in keepalives {
        handle.abort();
    }
    server.shutdown().await;
}

#[test]
#[timeout(60000)]
async fn disconnect_window_expiry_marks_original_lost() {
    let server = start_server(short_heartbeat_config()).await;
    let window = Duration::from_secs(3);
    let (victim_alloc, victim_node, mut keepalives) = partition_fixture(&server, window).await;

    keepalives.remove(&victim_node).unwrap().abort();

    wait_for(&server, Duration::from_secs(5), "replacement placed", |s| {
        s.allocs()
            .any(|a| a.previous_allocation == Some(victim_alloc))
    })
    .await;
    let snapshot = server.rpc.state.snapshot();
    let replacement = snapshot
        .allocs()
        .find(|a| a.previous_allocation == Some(victim_alloc))
        .unwrap()
        .clone();
    report_alloc(&server, replacement.id, ClientStatus::Running).await;

    // No reconnect: the window elapses and the timeout eval fires.
    wait_for(&server, window + Duration::from_secs(8), "original lost", |s| {
        s.alloc(&victim_alloc)
            .map(|a| a.client_status == ClientStatus::Lost)
            .unwrap_or(false)
    })
    .await;

    let snapshot = server.rpc.state.snapshot();
    check!(snapshot
        .evals()
        .any(|e| e.triggered_by == TriggeredBy::MaxDisconnectTimeout));
    let replacement = snapshot.alloc(&replacement.id).unwrap();
    check!(replacement.desired_status == DesiredStatus::Run);
    check!(replacement.client_status == ClientStatus::Running);

    for (_, handle) in keepalives {
        handle.abort();
    }
    server.shutdown().await;
}
