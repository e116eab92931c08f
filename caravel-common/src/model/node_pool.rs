use super::{LogIndex, Meta};
use serde::{Deserialize, Serialize};

pub const NODE_POOL_ALL: &str = "all";
pub const NODE_POOL_DEFAULT: &str = "default";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerAlgorithm {
    #[default]
    Binpack,
    Spread,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePoolSchedulerConfig {
    pub scheduler_algorithm: SchedulerAlgorithm,
    pub memory_oversubscription_enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    pub description: String,
    pub meta: Meta,
    pub scheduler_config: Option<NodePoolSchedulerConfig>,
    pub create_index: LogIndex,
    pub modify_index: LogIndex,
}

impl NodePool {
    /// The `all` and `default` pools exist from bootstrap and cannot be
    /// modified or deleted.
    pub fn is_built_in(name: &str) -> bool {
        name == NODE_POOL_ALL || name == NODE_POOL_DEFAULT
    }

    pub fn built_in(name: &str) -> NodePool {
        NodePool {
            name: name.to_string(),
            description: match name {
                NODE_POOL_ALL => "Node pool with all nodes".to_string(),
                NODE_POOL_DEFAULT => "Default node pool".to_string(),
                other => format!("Built-in node pool {other}"),
            },
            meta: Meta::new(),
            scheduler_config: None,
            create_index: 1,
            modify_index: 1,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("node pool name must not be empty".to_string());
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!("invalid node pool name '{}'", self.name));
        }
        Ok(())
    }
}
