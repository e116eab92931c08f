use caravel_common::model::LogIndex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Logical tables of the state store. Watch interest and last-modified
/// indices are tracked per table; fine-grained filtering happens in the
/// blocking query handler after wake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Jobs,
    Nodes,
    Allocs,
    Evals,
    Deployments,
    PeriodicLaunches,
    NodePools,
    Services,
    AclTokens,
    Variables,
}

impl Table {
    pub const ALL: [Table; 10] = [
        Table::Jobs,
        Table::Nodes,
        Table::Allocs,
        Table::Evals,
        Table::Deployments,
        Table::PeriodicLaunches,
        Table::NodePools,
        Table::Services,
        Table::AclTokens,
        Table::Variables,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Jobs => "jobs",
            Table::Nodes => "nodes",
            Table::Allocs => "allocs",
            Table::Evals => "evals",
            Table::Deployments => "deployments",
            Table::PeriodicLaunches => "periodic_launch",
            Table::NodePools => "node_pools",
            Table::Services => "service_registrations",
            Table::AclTokens => "acl_tokens",
            Table::Variables => "variables",
        }
    }
}

/// One watch channel per table, fired with the commit index after every
/// write that touched the table. Table-scoped channels keep the cost of a
/// write independent of the number of subscribers' keys.
pub struct WatchBroadcast {
    senders: HashMap<Table, watch::Sender<LogIndex>>,
}

impl WatchBroadcast {
    pub fn new() -> Self {
        let mut senders = HashMap::new();
        for table in Table::ALL {
            let (tx, _) = watch::channel(0);
            senders.insert(table, tx);
        }
        WatchBroadcast { senders }
    }

    pub fn notify(&self, touched: &[Table], index: LogIndex) {
        for table in touched {
            if let Some(tx) = self.senders.get(table) {
                tx.send_replace(index);
            }
        }
    }

    pub fn subscribe(&self, tables: &[Table]) -> WatchSet {
        let receivers = tables
            .iter()
            .filter_map(|table| self.senders.get(table).map(|tx| tx.subscribe()))
            .collect();
        WatchSet { receivers }
    }
}

impl Default for WatchBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Some watched table advanced past the floor index.
    Changed,
    Deadline,
    Cancelled,
}

/// A reader's declared interest in a set of tables, plus a deadline and a
/// cancellation token (leadership loss / shutdown).
pub struct WatchSet {
    receivers: Vec<watch::Receiver<LogIndex>>,
}

impl WatchSet {
    /// Waits until any watched table reports an index greater than
    /// `min_index`, the timeout elapses, or `cancel` fires.
    pub async fn wait(
        &mut self,
        min_index: LogIndex,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WatchOutcome {
        let changed = async {
            let waits = self
                .receivers
                .iter_mut()
                .map(|rx| Box::pin(rx.wait_for(move |index| *index > min_index)))
                .collect::<Vec<_>>();
            if waits.is_empty() {
                std::future::pending::<()>().await;
            } else {
                let _ = futures::future::select_all(waits).await;
            }
        };
        tokio::select! {
            _ = changed => WatchOutcome::Changed,
            _ = tokio::time::sleep(timeout) => WatchOutcome::Deadline,
            _ = cancel.cancelled() => WatchOutcome::Cancelled,
        }
    }
}
