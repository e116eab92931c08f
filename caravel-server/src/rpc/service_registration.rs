use super::blocking::blocking_query;
use super::RpcServer;
use crate::state::fsm::{DeleteServiceRegistrationEntry, UpsertServiceRegistrationsEntry};
use crate::state::Table;
use caravel_common::model::{
    GenericWriteResponse, RpcError, ServiceRegistration, ServiceRegistrationDeleteRequest,
    ServiceRegistrationGetRequest, ServiceRegistrationGetResponse, ServiceRegistrationListRequest,
    ServiceRegistrationListResponse, ServiceRegistrationUpsertRequest,
};
use caravel_common::wire::MessageType;
use sha2::{Digest, Sha256};

impl RpcServer {
    /// `ServiceRegistration.Upsert`: client-only path, proven by the node
    /// secret of the registering node.
    pub async fn service_registration_upsert(
        &self,
        req: ServiceRegistrationUpsertRequest,
    ) -> Result<GenericWriteResponse, RpcError> {
        self.check_region(&req.write.region)?;
        self.ensure_leader()?;
        if req.services.is_empty() {
            return Err(RpcError::validation("no service registrations given"));
        }
        for service in &req.services {
            service.validate().map_err(RpcError::Validation)?;
            self.auth
                .authenticate_node(&service.node_id, &req.node_secret)?;
        }
        let index = self
            .raft_apply(
                MessageType::UpsertServiceRegistrations,
                &UpsertServiceRegistrationsEntry {
                    services: req.services,
                },
            )
            .await?;
        Ok(GenericWriteResponse { index })
    }

    /// `ServiceRegistration.DeleteByID`.
    pub async fn service_registration_delete(
        &self,
        req: ServiceRegistrationDeleteRequest,
    ) -> Result<GenericWriteResponse, RpcError> {
        self.check_region(&req.write.region)?;
        self.ensure_leader()?;
        let namespace = req.write.namespace.clone();
        let snapshot = self.state.snapshot();
        let Some(service) = snapshot.service(&namespace, &req.id) else {
            return Err(RpcError::not_found(format!(
                "service registration '{}' not found",
                req.id
            )));
        };
        self.auth
            .authenticate_node(&service.node_id, &req.node_secret)?;
        let index = self
            .raft_apply(
                MessageType::DeleteServiceRegistration,
                &DeleteServiceRegistrationEntry {
                    namespace,
                    id: req.id,
                },
            )
            .await?;
        Ok(GenericWriteResponse { index })
    }

    /// `ServiceRegistration.List`: blocking namespace listing.
    pub async fn service_registration_list(
        &self,
        req: ServiceRegistrationListRequest,
    ) -> Result<ServiceRegistrationListResponse, RpcError> {
        self.ensure_read(&req.query)?;
        let namespace = req.query.namespace.clone();
        let (services, meta) =
            blocking_query(self, &req.query, &[Table::Services], move |snapshot| {
                let services: Vec<_> = snapshot
                    .services_in_namespace(&namespace)
                    .cloned()
                    .collect();
                let index = snapshot.table_index(Table::Services);
                Ok((services, index))
            })
            .await?;
        Ok(ServiceRegistrationListResponse { services, meta })
    }

    /// `ServiceRegistration.GetService`: blocking lookup of a service's
    /// instances, optionally narrowed with `choose = "n|key"` rendezvous
    /// selection so a given key consistently lands on the same subset.
    pub async fn service_registration_get(
        &self,
        req: ServiceRegistrationGetRequest,
    ) -> Result<ServiceRegistrationGetResponse, RpcError> {
        self.ensure_read(&req.query)?;
        let namespace = req.query.namespace.clone();
        let service_name = req.service_name.clone();
        let choose = match req.choose.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(parse_choose(raw)?),
        };
        let (services, meta) =
            blocking_query(self, &req.query, &[Table::Services], move |snapshot| {
                let mut services: Vec<ServiceRegistration> = snapshot
                    .services_by_name(&namespace, &service_name)
                    .into_iter()
                    .cloned()
                    .collect();
                if let Some((count, key)) = &choose {
                    services = rendezvous_choose(services, *count, key);
                }
                let index = services
                    .iter()
                    .map(|s| s.modify_index)
                    .max()
                    .unwrap_or_else(|| snapshot.table_index(Table::Services));
                Ok((services, index))
            })
            .await?;
        Ok(ServiceRegistrationGetResponse { services, meta })
    }
}

fn parse_choose(raw: &str) -> Result<(usize, String), RpcError> {
    let (count, key) = raw
        .split_once('|')
        .ok_or_else(|| RpcError::validation(format!("malformed choose parameter '{raw}'")))?;
    let count: usize = count
        .parse()
        .map_err(|_| RpcError::validation(format!("malformed choose count '{count}'")))?;
    if count == 0 || key.is_empty() {
        return Err(RpcError::validation(format!(
            "malformed choose parameter '{raw}'"
        )));
    }
    Ok((count, key.to_string()))
}

/// Highest-random-weight selection: every (instance, key) pair hashes to a
/// stable weight, so distinct keys spread over distinct subsets without any
/// shared state.
fn rendezvous_choose(
    mut services: Vec<ServiceRegistration>,
    count: usize,
    key: &str,
) -> Vec<ServiceRegistration> {
    services.sort_by_cached_key(|service| {
        let mut hasher = Sha256::new();
        hasher.update(service.id.as_bytes());
        hasher.update(b"|");
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let weight = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
        std::cmp::Reverse(weight)
    });
    services.truncate(count);
    services
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use caravel_common::model::{AllocId, JobId, Namespace, NodeId};

    fn service(id: &str) -> ServiceRegistration {
        ServiceRegistration {
            id: id.to_string(),
            service_name: "redis".to_string(),
            namespace: Namespace::default(),
            node_id: NodeId::new_v4(),
            datacenter: "dc1".to_string(),
            job_id: JobId::new("cache"),
            alloc_id: AllocId::new_v4(),
            tags: vec![],
            address: "10.0.0.1".to_string(),
            port: 6379,
            create_index: 1,
            modify_index: 1,
        }
    }

    #[test]
    fn choose_parsing_rejects_malformed_input() {
        assert!(parse_choose("2|abc").is_ok());
        assert!(parse_choose("abc").is_err());
        assert!(parse_choose("x|abc").is_err());
        assert!(parse_choose("0|abc").is_err());
        assert!(parse_choose("2|").is_err());
    }

    #[test]
    fn rendezvous_selection_is_stable_and_key_dependent() {
        let services: Vec<_> = (0..8).map(|i| service(&format!("svc-{i}"))).collect();

        let a1 = rendezvous_choose(services.clone(), 2, "key-a");
        let a2 = rendezvous_choose(services.clone(), 2, "key-a");
        assert_eq!(
            a1.iter().map(|s| &s.id).collect::<Vec<_>>(),
            a2.iter().map(|s| &s.id).collect::<Vec<_>>(),
        );
        assert_eq!(a1.len(), 2);

        // A superset request with the same key keeps the same leaders.
        let a3 = rendezvous_choose(services.clone(), 3, "key-a");
        assert_eq!(a3[0].id, a1[0].id);
        assert_eq!(a3[1].id, a1[1].id);
    }
}
