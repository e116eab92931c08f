use caravel_common::config::ConfigLoader;
use caravel_common::model::rpc::DEFAULT_REGION;
use caravel_common::tracing::TracingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub tracing: TracingConfig,
    pub region: String,
    pub datacenter: String,
    /// Raft log, snapshots and other durable server state live here. Empty
    /// selects the in-memory backend (development only).
    pub data_dir: Option<PathBuf>,
    /// Number of voting servers expected before bootstrapping the cluster.
    pub bootstrap_expect: u32,
    pub rpc_bind_addr: String,
    pub rpc_advertise_addr: Option<String>,
    pub tls: TlsConfig,
    pub acl: AclConfig,
    pub heartbeat: HeartbeatConfig,
    pub scheduler: SchedulerConfig,
    pub broker: BrokerConfig,
    pub blocking_queries: BlockingQueryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("caravel-server"),
            region: DEFAULT_REGION.to_string(),
            datacenter: "dc1".to_string(),
            data_dir: None,
            bootstrap_expect: 1,
            rpc_bind_addr: "0.0.0.0:4647".to_string(),
            rpc_advertise_addr: None,
            tls: TlsConfig::default(),
            acl: AclConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            scheduler: SchedulerConfig::default(),
            broker: BrokerConfig::default(),
            blocking_queries: BlockingQueryConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.region.is_empty() {
            return Err("region must not be empty".to_string());
        }
        if self.bootstrap_expect == 0 {
            return Err("bootstrap_expect must be at least 1".to_string());
        }
        if self.bootstrap_expect > 1 {
            // Multi-server consensus transport is wired in by the deployment
            // layer; the core only bootstraps single-voter clusters itself.
            return Err(
                "bootstrap_expect > 1 requires an external consensus transport".to_string(),
            );
        }
        if self.heartbeat.max_heartbeats_per_second <= 0.0 {
            return Err("max_heartbeats_per_second must be positive".to_string());
        }
        Ok(())
    }
}

/// TLS material is an input consumed by the transport layer; the core only
/// carries the paths.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub verify_server_hostname: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AclConfig {
    pub enabled: bool,
    /// Secret granting management rights to the leader's own internal RPCs.
    pub leader_token: Option<uuid::Uuid>,
    /// Keys for verifying workload identity claims.
    pub claims_hmac_secret: Option<String>,
    pub token_cache_size: usize,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            leader_token: None,
            claims_hmac_secret: None,
            token_cache_size: 512,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Lower bound of the per-node TTL; the granted TTL is uniformly random
    /// in [min, 2·min].
    #[serde(with = "humantime_serde")]
    pub min_heartbeat_ttl: Duration,
    /// Extra slack past the TTL before a node is invalidated.
    #[serde(with = "humantime_serde")]
    pub heartbeat_grace: Duration,
    pub max_heartbeats_per_second: f64,
    /// How often the invalidation loop scans for expired nodes.
    #[serde(with = "humantime_serde")]
    pub failover_check_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            min_heartbeat_ttl: Duration::from_secs(10),
            heartbeat_grace: Duration::from_secs(10),
            max_heartbeats_per_second: 50.0,
            failover_check_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// In-process scheduler workers; 0 leaves dequeueing to external
    /// workers driving `Eval.Dequeue`.
    pub num_schedulers: usize,
    /// Bounded fan-out used by plan-apply for per-node feasibility checks.
    pub evaluate_pool_size: usize,
    /// Plan submissions retried with a fresher snapshot after a refresh
    /// result, before the eval is blocked.
    pub max_plan_refresh_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_schedulers: 4,
            evaluate_pool_size: 8,
            max_plan_refresh_retries: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Deliveries (initial + re-deliveries after nack) before an eval is
    /// marked failed and a follow-up is scheduled.
    pub delivery_limit: u32,
    #[serde(with = "humantime_serde")]
    pub nack_initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub nack_max_backoff: Duration,
    /// Window over which failed-follow-up evals are jittered into the future.
    #[serde(with = "humantime_serde")]
    pub failed_followup_baseline: Duration,
    #[serde(with = "humantime_serde")]
    pub failed_followup_jitter: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            delivery_limit: 3,
            nack_initial_backoff: Duration::from_secs(1),
            nack_max_backoff: Duration::from_secs(30),
            failed_followup_baseline: Duration::from_secs(60),
            failed_followup_jitter: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockingQueryConfig {
    /// Hard cap applied to caller-supplied `max_query_time`.
    #[serde(with = "humantime_serde")]
    pub max_query_time: Duration,
    /// Used when the caller enables blocking without a bound.
    #[serde(with = "humantime_serde")]
    pub default_query_time: Duration,
}

impl Default for BlockingQueryConfig {
    fn default() -> Self {
        Self {
            max_query_time: Duration::from_secs(300),
            default_query_time: Duration::from_secs(300),
        }
    }
}

pub fn make_config_loader() -> ConfigLoader<ServerConfig> {
    ConfigLoader::new(&PathBuf::from("config/caravel-server.toml"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use crate::config::make_config_loader;

    #[test]
    pub fn config_is_loadable() {
        make_config_loader().load().expect("Failed to load config");
    }

    #[test]
    pub fn default_config_is_valid() {
        super::ServerConfig::default().validate().expect("valid");
    }
}
