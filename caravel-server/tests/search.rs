use crate::common::*;
use assert2::check;
use caravel_common::model::{
    JobRegisterRequest, JobType, QueryOptions, SearchContext, SearchRequest, WriteRequest,
};
use test_r::{test, timeout};

async fn register_named_job(server: &caravel_server::bootstrap::Server, id: &str) {
    server
        .rpc
        .job_register(JobRegisterRequest {
            job: job(id, JobType::Service, 1, 10, 16),
            enforce_index: None,
            write: WriteRequest::default(),
        })
        .await
        .unwrap();
}

#[test]
#[timeout(30000)]
async fn prefix_search_matches_and_truncates() {
    let server = start_server(test_config()).await;
    register_node(&server, test_node("n1", 10_000, 16_384)).await;

    register_named_job(&server, "aaaaaaaa-e8f7-fd38-c855-ab94ceb89700").await;

    let response = server
        .rpc
        .cluster_search(SearchRequest {
            prefix: "aaaaaaaa".to_string(),
            context: SearchContext::Jobs,
            query: QueryOptions::default(),
        })
        .await
        .unwrap();
    check!(response.matches[&SearchContext::Jobs].len() == 1);
    check!(!response.truncations[&SearchContext::Jobs]);

    // 24 more jobs under the same prefix: results cap at 20 and the
    // truncation flag is raised.
    for i in 0..24 {
        register_named_job(&server, &format!("aaaaaaaa-e8f7-fd38-c855-ab94ceb89{i:03}")).await;
    }
    let response = server
        .rpc
        .cluster_search(SearchRequest {
            prefix: "aaaaaaaa".to_string(),
            context: SearchContext::Jobs,
            query: QueryOptions::default(),
        })
        .await
        .unwrap();
    check!(response.matches[&SearchContext::Jobs].len() == 20);
    check!(response.truncations[&SearchContext::Jobs]);

    server.shutdown().await;
}

#[test]
#[timeout(30000)]
async fn odd_length_prefixes_round_down() {
    let server = start_server(test_config()).await;
    register_node(&server, test_node("n1", 1000, 1024)).await;
    register_named_job(&server, "abcdef-job").await;

    // "abcde" rounds down to "abcd" and still matches.
    let response = server
        .rpc
        .cluster_search(SearchRequest {
            prefix: "abcde".to_string(),
            context: SearchContext::Jobs,
            query: QueryOptions::default(),
        })
        .await
        .unwrap();
    check!(response.matches[&SearchContext::Jobs].len() == 1);

    server.shutdown().await;
}

#[test]
#[timeout(30000)]
async fn all_context_searches_every_table() {
    let server = start_server(test_config()).await;
    let node = test_node("n1", 1000, 1024);
    register_node(&server, node).await;
    register_named_job(&server, "searched").await;

    wait_for(
        &server,
        std::time::Duration::from_secs(10),
        "alloc placed",
        |s| s.allocs().next().is_some(),
    )
    .await;

    let response = server
        .rpc
        .cluster_search(SearchRequest {
            prefix: String::new(),
            context: SearchContext::All,
            query: QueryOptions::default(),
        })
        .await
        .unwrap();
    check!(response.matches[&SearchContext::Jobs].contains(&"searched".to_string()));
    check!(!response.matches[&SearchContext::Nodes].is_empty());
    check!(!response.matches[&SearchContext::Evals].is_empty());
    check!(!response.matches[&SearchContext::Allocs].is_empty());
    check!(response.matches[&SearchContext::NodePools].contains(&"default".to_string()));

    server.shutdown().await;
}
