use super::RpcServer;
use crate::state::{StateSnapshot, Table, WatchOutcome};
use caravel_common::model::{LogIndex, QueryMeta, QueryOptions, RpcError};
use tokio::time::Instant;

/// Serves a read that may long-poll. The handler runs against an immutable
/// snapshot and returns its value plus the index the result is current at;
/// when that index has not passed `min_query_index`, the request subscribes
/// to the touched tables and re-runs on wake.
///
/// The reply index is floored at 1 (index 0 is reserved and would make a
/// client block forever) and, because it derives from the log, never moves
/// backwards for a given client.
pub async fn blocking_query<T, F>(
    server: &RpcServer,
    query: &QueryOptions,
    tables: &[Table],
    run: F,
) -> Result<(T, QueryMeta), RpcError>
where
    F: Fn(&StateSnapshot) -> Result<(T, LogIndex), RpcError>,
{
    let config = &server.config.blocking_queries;
    let timeout = query
        .max_query_time
        .unwrap_or(config.default_query_time)
        .min(config.max_query_time);
    let deadline = Instant::now() + timeout;

    loop {
        // Subscribe before snapshotting: a write landing in between is
        // already visible on the watch channel, so no wakeup is lost.
        let mut watch_set = server.state.watch(tables);
        let snapshot = server.state.snapshot();
        let (value, raw_index) = run(&snapshot)?;
        let index = raw_index.max(1);

        if query.min_query_index == 0 || index > query.min_query_index {
            return Ok((value, server.query_meta(index)));
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok((value, server.query_meta(index)));
        }
        let outcome = watch_set
            .wait(query.min_query_index, deadline - now, &server.shutdown)
            .await;
        match outcome {
            WatchOutcome::Changed => continue,
            WatchOutcome::Deadline | WatchOutcome::Cancelled => {
                return Ok((value, server.query_meta(index)));
            }
        }
    }
}
