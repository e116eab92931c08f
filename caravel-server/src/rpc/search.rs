use super::blocking::blocking_query;
use super::RpcServer;
use crate::state::{StateSnapshot, Table};
use caravel_common::model::{
    RpcError, SearchContext, SearchRequest, SearchResponse, SEARCH_TRUNCATION_LIMIT,
};
use std::collections::BTreeMap;

impl RpcServer {
    /// `ClusterSearch.List`: prefix match over the named tables. Results per
    /// context are truncated at 20; odd-length prefixes are rounded down one
    /// character (partial UUID segments match nothing otherwise).
    pub async fn cluster_search(&self, req: SearchRequest) -> Result<SearchResponse, RpcError> {
        self.ensure_read(&req.query)?;

        let mut prefix = req.prefix.trim().to_ascii_lowercase();
        if prefix.len() % 2 == 1 {
            prefix.pop();
        }
        let contexts: Vec<SearchContext> = match req.context {
            SearchContext::All => SearchContext::SEARCHABLE.to_vec(),
            single => vec![single],
        };
        let namespace = req.query.namespace.clone();

        let tables: Vec<Table> = contexts.iter().map(context_table).collect();
        let (response, meta) = blocking_query(self, &req.query, &tables, move |snapshot| {
            let mut matches: BTreeMap<SearchContext, Vec<String>> = BTreeMap::new();
            let mut truncations: BTreeMap<SearchContext, bool> = BTreeMap::new();
            for context in &contexts {
                let mut ids = context_ids(snapshot, *context, &namespace, &prefix);
                ids.sort();
                let truncated = ids.len() > SEARCH_TRUNCATION_LIMIT;
                ids.truncate(SEARCH_TRUNCATION_LIMIT);
                matches.insert(*context, ids);
                truncations.insert(*context, truncated);
            }
            let index = contexts
                .iter()
                .map(|c| snapshot.table_index(context_table(c)))
                .max()
                .unwrap_or(1);
            Ok((
                SearchResponse {
                    matches,
                    truncations,
                    meta: Default::default(),
                },
                index,
            ))
        })
        .await?;
        Ok(SearchResponse { meta, ..response })
    }
}

fn context_table(context: &SearchContext) -> Table {
    match context {
        SearchContext::Jobs => Table::Jobs,
        SearchContext::Evals => Table::Evals,
        SearchContext::Allocs => Table::Allocs,
        SearchContext::Nodes => Table::Nodes,
        SearchContext::NodePools => Table::NodePools,
        SearchContext::All => Table::Jobs,
    }
}

fn context_ids(
    snapshot: &StateSnapshot,
    context: SearchContext,
    namespace: &caravel_common::model::Namespace,
    prefix: &str,
) -> Vec<String> {
    match context {
        SearchContext::Jobs => snapshot
            .jobs_in_namespace(namespace)
            .filter(|job| job.id.as_str().starts_with(prefix))
            .map(|job| job.id.to_string())
            .collect(),
        SearchContext::Evals => snapshot
            .evals()
            .filter(|eval| eval.namespace == *namespace)
            .filter(|eval| eval.id.to_string().starts_with(prefix))
            .map(|eval| eval.id.to_string())
            .collect(),
        SearchContext::Allocs => snapshot
            .allocs()
            .filter(|alloc| alloc.namespace == *namespace)
            .filter(|alloc| alloc.id.to_string().starts_with(prefix))
            .map(|alloc| alloc.id.to_string())
            .collect(),
        SearchContext::Nodes => snapshot
            .nodes()
            .filter(|node| node.id.to_string().starts_with(prefix))
            .map(|node| node.id.to_string())
            .collect(),
        SearchContext::NodePools => snapshot
            .node_pools()
            .filter(|pool| pool.name.starts_with(prefix))
            .map(|pool| pool.name.clone())
            .collect(),
        SearchContext::All => Vec::new(),
    }
}
