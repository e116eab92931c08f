use crate::common::*;
use assert2::check;
use caravel_common::model::{
    ClientStatus, Job, JobRegisterRequest, JobType, PeriodicSpec, WriteRequest,
};
use std::time::Duration;
use test_r::{test, timeout};

fn count_children(snapshot: &caravel_server::state::StateSnapshot, parent: &str) -> usize {
    snapshot
        .jobs()
        .filter(|j| j.parent_id.as_ref().map(|p| p.as_str()) == Some(parent))
        .count()
}

#[test]
#[timeout(60000)]
async fn overlap_prohibited_launches_skip_while_child_runs() {
    let server = start_server(test_config()).await;
    register_node(&server, test_node("n1", 1000, 1024)).await;

    let mut spec = job("report", JobType::Batch, 1, 100, 64);
    // Seconds-granular schedule keeps the test fast; operator specs use the
    // five-field form, which is also accepted.
    spec.periodic = Some(PeriodicSpec {
        cron: "*/2 * * * * *".to_string(),
        timezone: None,
        prohibit_overlap: true,
        enabled: true,
    });
    let response = server
        .rpc
        .job_register(JobRegisterRequest {
            job: spec,
            enforce_index: None,
            write: WriteRequest::default(),
        })
        .await
        .unwrap();
    check!(
        response.eval_id.is_none(),
        "periodic parents launch via the dispatcher, not a direct eval"
    );

    // First launch materializes a child whose ID encodes the launch time.
    wait_for(&server, Duration::from_secs(10), "first child", |s| {
        count_children(s, "report") == 1
    })
    .await;
    let snapshot = server.rpc.state.snapshot();
    let child = snapshot
        .jobs()
        .find(|j| j.parent_id.is_some())
        .unwrap()
        .clone();
    check!(Job::periodic_launch_time(&child.id).is_some());
    check!(child.periodic.is_none());

    wait_for(&server, Duration::from_secs(10), "child alloc placed", |s| {
        s.allocs().any(|a| a.job_id == child.id)
    })
    .await;
    let snapshot = server.rpc.state.snapshot();
    let child_alloc = snapshot.allocs().find(|a| a.job_id == child.id).unwrap().clone();

    // While the instance runs, subsequent ticks must skip.
    report_alloc(&server, child_alloc.id, ClientStatus::Running).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    let snapshot = server.rpc.state.snapshot();
    check!(
        count_children(&snapshot, "report") == 1,
        "overlapping launch must be skipped"
    );

    // Completion kills the child job and the next tick launches again.
    report_alloc(&server, child_alloc.id, ClientStatus::Complete).await;
    wait_for(&server, Duration::from_secs(10), "second child", |s| {
        count_children(s, "report") == 2
    })
    .await;

    // Launch bookkeeping is persisted for recovery after failover.
    let snapshot = server.rpc.state.snapshot();
    check!(snapshot
        .periodic_launch(&Default::default(), &caravel_common::model::JobId::new("report"))
        .is_some());

    server.shutdown().await;
}

#[test]
#[timeout(60000)]
async fn deregistering_a_periodic_parent_stops_launches() {
    let server = start_server(test_config()).await;
    register_node(&server, test_node("n1", 1000, 1024)).await;

    let mut spec = job("cleanup", JobType::Batch, 1, 100, 64);
    spec.periodic = Some(PeriodicSpec {
        cron: "*/2 * * * * *".to_string(),
        timezone: None,
        prohibit_overlap: false,
        enabled: true,
    });
    server
        .rpc
        .job_register(JobRegisterRequest {
            job: spec,
            enforce_index: None,
            write: WriteRequest::default(),
        })
        .await
        .unwrap();

    wait_for(&server, Duration::from_secs(10), "first child", |s| {
        count_children(s, "cleanup") >= 1
    })
    .await;

    server
        .rpc
        .job_deregister(caravel_common::model::JobDeregisterRequest {
            job_id: caravel_common::model::JobId::new("cleanup"),
            options: Default::default(),
            write: WriteRequest::default(),
        })
        .await
        .unwrap();

    let before = count_children(&server.rpc.state.snapshot(), "cleanup");
    tokio::time::sleep(Duration::from_secs(5)).await;
    let after = count_children(&server.rpc.state.snapshot(), "cleanup");
    check!(after == before, "no launches after deregistration");

    server.shutdown().await;
}
