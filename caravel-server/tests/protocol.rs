use crate::common::*;
use assert2::check;
use caravel_common::model::{
    EvalAckRequest, EvalDequeueRequest, EvalToken, JobRegisterRequest, JobType, Meta,
    NodePool, NodePoolDeleteRequest, NodePoolSpecificRequest, NodePoolUpsertRequest,
    QueryOptions, RpcError, WriteRequest,
};
use std::time::Duration;
use test_r::{test, timeout};

/// No in-process workers: the test drives the scheduler-broker protocol.
fn external_scheduler_config() -> caravel_server::config::ServerConfig {
    let mut config = test_config();
    config.scheduler.num_schedulers = 0;
    config
}

#[test]
#[timeout(30000)]
async fn dequeue_ack_protocol_enforces_tokens() {
    let server = start_server(external_scheduler_config()).await;
    register_node(&server, test_node("n1", 1000, 1024)).await;
    server
        .rpc
        .job_register(JobRegisterRequest {
            job: job("manual", JobType::Batch, 1, 100, 64),
            enforce_index: None,
            write: WriteRequest::default(),
        })
        .await
        .unwrap();

    let response = server
        .rpc
        .eval_dequeue(EvalDequeueRequest {
            schedulers: vec![JobType::Batch],
            timeout: Duration::from_secs(5),
            write: WriteRequest::default(),
        })
        .await
        .unwrap();
    let eval = response.eval.expect("eval should be available");
    let token = response.token.expect("token accompanies the eval");
    check!(eval.job_id.as_str() == "manual");
    check!(eval.snapshot_index.is_some());

    // Wrong token: rejected; right token: accepted; double ack: rejected.
    let wrong = server
        .rpc
        .eval_ack(EvalAckRequest {
            eval_id: eval.id,
            token: EvalToken::new_v4(),
            write: WriteRequest::default(),
        })
        .await;
    check!(matches!(wrong, Err(RpcError::EvalTokenMismatch)));

    server
        .rpc
        .eval_ack(EvalAckRequest {
            eval_id: eval.id,
            token,
            write: WriteRequest::default(),
        })
        .await
        .unwrap();

    let again = server
        .rpc
        .eval_ack(EvalAckRequest {
            eval_id: eval.id,
            token,
            write: WriteRequest::default(),
        })
        .await;
    check!(matches!(again, Err(RpcError::EvalNotOutstanding)));

    server.shutdown().await;
}

#[test]
#[timeout(30000)]
async fn dequeue_blocks_until_timeout_or_enqueue() {
    let server = start_server(external_scheduler_config()).await;
    register_node(&server, test_node("n1", 1000, 1024)).await;

    // Nothing pending: the dequeue long-polls for the full timeout.
    let started = tokio::time::Instant::now();
    let empty = server
        .rpc
        .eval_dequeue(EvalDequeueRequest {
            schedulers: vec![JobType::Batch],
            timeout: Duration::from_millis(300),
            write: WriteRequest::default(),
        })
        .await
        .unwrap();
    check!(empty.eval.is_none());
    check!(started.elapsed() >= Duration::from_millis(300));

    // A matching enqueue wakes a parked dequeue early.
    let rpc = server.rpc.clone();
    let waiter = tokio::spawn(async move {
        rpc.eval_dequeue(EvalDequeueRequest {
            schedulers: vec![JobType::Batch],
            timeout: Duration::from_secs(10),
            write: WriteRequest::default(),
        })
        .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    server
        .rpc
        .job_register(JobRegisterRequest {
            job: job("wakeup", JobType::Batch, 1, 100, 64),
            enforce_index: None,
            write: WriteRequest::default(),
        })
        .await
        .unwrap();
    let woken = waiter.await.unwrap().unwrap();
    check!(woken.eval.is_some());

    server.shutdown().await;
}

#[test]
#[timeout(30000)]
async fn built_in_node_pools_are_immutable() {
    let server = start_server(test_config()).await;

    let mutate = server
        .rpc
        .node_pool_upsert(NodePoolUpsertRequest {
            pools: vec![NodePool {
                name: "default".to_string(),
                description: "hijacked".to_string(),
                meta: Meta::new(),
                scheduler_config: None,
                create_index: 0,
                modify_index: 0,
            }],
            write: WriteRequest::default(),
        })
        .await;
    check!(matches!(mutate, Err(RpcError::Validation(_))));

    let delete = server
        .rpc
        .node_pool_delete(NodePoolDeleteRequest {
            names: vec!["all".to_string()],
            write: WriteRequest::default(),
        })
        .await;
    check!(matches!(delete, Err(RpcError::Validation(_))));

    // Custom pools round-trip normally.
    server
        .rpc
        .node_pool_upsert(NodePoolUpsertRequest {
            pools: vec![NodePool {
                name: "gpu".to_string(),
                description: "accelerated nodes".to_string(),
                meta: Meta::new(),
                scheduler_config: None,
                create_index: 0,
                modify_index: 0,
            }],
            write: WriteRequest::default(),
        })
        .await
        .unwrap();
    let fetched = server
        .rpc
        .node_pool_get(NodePoolSpecificRequest {
            name: "gpu".to_string(),
            query: QueryOptions::default(),
        })
        .await
        .unwrap();
    check!(fetched.pool.is_some());

    server
        .rpc
        .node_pool_delete(NodePoolDeleteRequest {
            names: vec!["gpu".to_string()],
            write: WriteRequest::default(),
        })
        .await
        .unwrap();

    server.shutdown().await;
}

#[test]
#[timeout(30000)]
async fn requests_for_other_regions_have_no_path() {
    let server = start_server(test_config()).await;

    let response = server
        .rpc
        .job_register(JobRegisterRequest {
            job: job("elsewhere", JobType::Service, 1, 100, 64),
            enforce_index: None,
            write: WriteRequest {
                region: "europe".to_string(),
                ..WriteRequest::default()
            },
        })
        .await;
    check!(matches!(response, Err(RpcError::NoRegionPath(region)) if region == "europe"));

    server.shutdown().await;
}

#[test]
#[timeout(30000)]
async fn update_alloc_requires_exactly_one_allocation() {
    let server = start_server(test_config()).await;

    let response = server
        .rpc
        .node_update_alloc(caravel_common::model::NodeUpdateAllocRequest {
            allocs: vec![],
            write: WriteRequest::default(),
        })
        .await;
    check!(matches!(response, Err(RpcError::Validation(_))));

    server.shutdown().await;
}

#[test]
#[timeout(30000)]
async fn workload_claims_authenticate_while_alloc_is_live() {
    use caravel_common::model::{ClientStatus, JobSpecificRequest, WorkloadClaims};
    use caravel_server::rpc::auth::AuthIdentity;
    use jsonwebtoken::{encode, EncodingKey, Header};

    let leader_token = uuid::Uuid::new_v4();
    let mut config = test_config();
    config.acl.enabled = true;
    config.acl.leader_token = Some(leader_token);
    config.acl.claims_hmac_secret = Some("keyring-secret".to_string());
    let server = start_server(config).await;

    let management = WriteRequest {
        auth_token: Some(leader_token.to_string()),
        ..WriteRequest::default()
    };
    register_node(&server, test_node("n1", 1000, 1024)).await;
    server
        .rpc
        .job_register(JobRegisterRequest {
            job: job("claimed", JobType::Service, 1, 100, 64),
            enforce_index: None,
            write: management.clone(),
        })
        .await
        .unwrap();
    wait_for(&server, Duration::from_secs(10), "alloc placed", |s| {
        s.allocs().any(|a| a.job_id.as_str() == "claimed")
    })
    .await;
    let alloc = server
        .rpc
        .state
        .snapshot()
        .allocs()
        .find(|a| a.job_id.as_str() == "claimed")
        .unwrap()
        .clone();

    let now = chrono::Utc::now().timestamp();
    let claims = WorkloadClaims {
        alloc_id: alloc.id,
        job_id: alloc.job_id.clone(),
        namespace: alloc.namespace.clone(),
        task: "task".to_string(),
        node_id: Some(alloc.node_id),
        exp: now + 600,
        iat: now,
        sub: format!("claimed/{}", alloc.id),
    };
    let jwt = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"keyring-secret"),
    )
    .unwrap();

    // The claim authenticates and can drive reads.
    let identity = server.rpc.auth.authenticate(Some(&jwt)).unwrap();
    check!(matches!(identity, AuthIdentity::Claims(c) if c.alloc_id == alloc.id));
    let read = server
        .rpc
        .job_get(JobSpecificRequest {
            job_id: alloc.job_id.clone(),
            query: caravel_common::model::QueryOptions {
                auth_token: Some(jwt.clone()),
                ..Default::default()
            },
        })
        .await
        .unwrap();
    check!(read.job.is_some());

    // Claims die with their allocation.
    let mut terminal = alloc.clone();
    terminal.client_status = ClientStatus::Failed;
    server
        .rpc
        .node_update_alloc(caravel_common::model::NodeUpdateAllocRequest {
            allocs: vec![terminal],
            write: management.clone(),
        })
        .await
        .unwrap_err(); // node secret required under ACLs
    // Report through the node identity instead.
    let node_secret = server
        .rpc
        .state
        .snapshot()
        .node(&alloc.node_id)
        .unwrap()
        .secret_id;
    let mut terminal = alloc.clone();
    terminal.client_status = ClientStatus::Failed;
    server
        .rpc
        .node_update_alloc(caravel_common::model::NodeUpdateAllocRequest {
            allocs: vec![terminal],
            write: WriteRequest {
                auth_token: Some(node_secret.to_string()),
                ..WriteRequest::default()
            },
        })
        .await
        .unwrap();
    wait_for(&server, Duration::from_secs(10), "alloc terminal", |s| {
        s.alloc(&alloc.id)
            .map(|a| a.client_status == ClientStatus::Failed)
            .unwrap_or(false)
    })
    .await;

    let rejected = server.rpc.auth.authenticate(Some(&jwt));
    check!(matches!(rejected, Err(RpcError::TokenInvalid(_))));

    server.shutdown().await;
}

#[test]
#[timeout(30000)]
async fn variables_enforce_compare_and_set() {
    use caravel_common::model::{
        Meta, Variable, VariableDeleteRequest, VariableListRequest, VariableReadRequest,
        VariableUpsertRequest,
    };

    let server = start_server(test_config()).await;

    let variable = Variable {
        namespace: Default::default(),
        path: "webapp/prod/db".to_string(),
        items: Meta::from([("password".to_string(), "hunter2".to_string())]),
        create_index: 0,
        modify_index: 0,
    };

    // check_index 0 means "must not exist yet".
    let first = server
        .rpc
        .variable_upsert(VariableUpsertRequest {
            variable: variable.clone(),
            check_index: Some(0),
            write: WriteRequest::default(),
        })
        .await
        .unwrap();

    // Re-creating with the same guard conflicts.
    let conflict = server
        .rpc
        .variable_upsert(VariableUpsertRequest {
            variable: variable.clone(),
            check_index: Some(0),
            write: WriteRequest::default(),
        })
        .await;
    check!(matches!(conflict, Err(RpcError::Validation(message)) if message.contains("cas")));

    // Updating against the current index succeeds.
    let mut updated = variable.clone();
    updated
        .items
        .insert("password".to_string(), "correct-horse".to_string());
    server
        .rpc
        .variable_upsert(VariableUpsertRequest {
            variable: updated,
            check_index: Some(first.index),
            write: WriteRequest::default(),
        })
        .await
        .unwrap();

    let read = server
        .rpc
        .variable_read(VariableReadRequest {
            path: "webapp/prod/db".to_string(),
            query: QueryOptions::default(),
        })
        .await
        .unwrap();
    let stored = read.variable.unwrap();
    check!(stored.items["password"] == "correct-horse");
    check!(stored.create_index == first.index);
    check!(stored.modify_index > first.index);

    // Listings return metadata only, filtered by path prefix.
    let listed = server
        .rpc
        .variable_list(VariableListRequest {
            path_prefix: Some("webapp/".to_string()),
            query: QueryOptions::default(),
        })
        .await
        .unwrap();
    check!(listed.variables.len() == 1);
    let missed = server
        .rpc
        .variable_list(VariableListRequest {
            path_prefix: Some("other/".to_string()),
            query: QueryOptions::default(),
        })
        .await
        .unwrap();
    check!(missed.variables.is_empty());

    // Stale delete guard conflicts; the right one removes the variable.
    let stale = server
        .rpc
        .variable_delete(VariableDeleteRequest {
            path: "webapp/prod/db".to_string(),
            check_index: Some(first.index),
            write: WriteRequest::default(),
        })
        .await;
    check!(matches!(stale, Err(RpcError::Validation(_))));
    server
        .rpc
        .variable_delete(VariableDeleteRequest {
            path: "webapp/prod/db".to_string(),
            check_index: Some(stored.modify_index),
            write: WriteRequest::default(),
        })
        .await
        .unwrap();
    let gone = server
        .rpc
        .variable_read(VariableReadRequest {
            path: "webapp/prod/db".to_string(),
            query: QueryOptions::default(),
        })
        .await
        .unwrap();
    check!(gone.variable.is_none());

    server.shutdown().await;
}
