use super::{AllocId, JobId, LogIndex, Namespace, NodeId};
use serde::{Deserialize, Serialize};

/// A service instance advertised by a running allocation. Upserted only over
/// the node identity paths; the catalog itself is a plain namespaced table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub id: String,
    pub service_name: String,
    pub namespace: Namespace,
    pub node_id: NodeId,
    pub datacenter: String,
    pub job_id: JobId,
    pub alloc_id: AllocId,
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
    pub create_index: LogIndex,
    pub modify_index: LogIndex,
}

impl ServiceRegistration {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("service registration ID must not be empty".to_string());
        }
        if self.service_name.is_empty() {
            return Err("service name must not be empty".to_string());
        }
        if self.address.is_empty() {
            return Err("service address must not be empty".to_string());
        }
        Ok(())
    }
}
