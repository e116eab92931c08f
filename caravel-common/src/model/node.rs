use super::{LogIndex, Meta, NodeId, Resources};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on the per-node lifecycle event log.
pub const MAX_NODE_EVENTS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Init,
    Ready,
    Down,
    Disconnected,
}

impl NodeStatus {
    pub fn is_valid_transition_target(&self) -> bool {
        // Init is only ever the registration state.
        !matches!(self, NodeStatus::Init)
    }
}

impl Display for NodeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Init => write!(f, "initializing"),
            NodeStatus::Ready => write!(f, "ready"),
            NodeStatus::Down => write!(f, "down"),
            NodeStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(NodeStatus::Init),
            "ready" => Ok(NodeStatus::Ready),
            "down" => Ok(NodeStatus::Down),
            "disconnected" => Ok(NodeStatus::Disconnected),
            other => Err(format!("Invalid node status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingEligibility {
    #[default]
    Eligible,
    Ineligible,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainStrategy {
    /// Time the drain is allowed to take before remaining allocations are
    /// force-stopped. `None` waits indefinitely.
    #[serde(default, with = "humantime_serde::option")]
    pub deadline: Option<Duration>,
    pub ignore_system_jobs: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub message: String,
    pub subsystem: String,
    pub timestamp: DateTime<Utc>,
    pub details: Meta,
}

impl NodeEvent {
    pub fn cluster(message: impl Into<String>) -> Self {
        NodeEvent {
            message: message.into(),
            subsystem: "Cluster".to_string(),
            timestamp: Utc::now(),
            details: Meta::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub datacenter: String,
    pub node_pool: String,
    pub node_class: String,
    pub status: NodeStatus,
    pub status_description: String,
    pub status_updated_at: DateTime<Utc>,
    pub scheduling_eligibility: SchedulingEligibility,
    pub drain: Option<DrainStrategy>,
    pub resources: Resources,
    pub reserved: Resources,
    /// Fingerprinted attributes, e.g. `kernel.name`, `cpu.arch`, `version`.
    pub attributes: Meta,
    pub secret_id: Uuid,
    pub events: Vec<NodeEvent>,
    pub create_index: LogIndex,
    pub modify_index: LogIndex,
}

impl Node {
    pub fn ready(&self) -> bool {
        self.status == NodeStatus::Ready
            && self.drain.is_none()
            && self.scheduling_eligibility == SchedulingEligibility::Eligible
    }

    pub fn terminal_status(&self) -> bool {
        self.status == NodeStatus::Down
    }

    /// Resources available to new placements before subtracting live
    /// allocations.
    pub fn available_resources(&self) -> Resources {
        self.resources.saturating_sub(&self.reserved)
    }

    /// Digest of the placement-relevant coarse identity of this node. Evals
    /// blocked on capacity record which computed classes were exhausted;
    /// nodes sharing a digest are interchangeable for that bookkeeping.
    pub fn computed_class(&self) -> String {
        format!(
            "v1:{}:{}:{}",
            self.datacenter, self.node_pool, self.node_class
        )
    }

    pub fn push_event(&mut self, event: NodeEvent) {
        self.events.push(event);
        if self.events.len() > MAX_NODE_EVENTS {
            let excess = self.events.len() - MAX_NODE_EVENTS;
            self.events.drain(0..excess);
        }
    }
}

/// Listing row for `Node.List`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeListStub {
    pub id: NodeId,
    pub name: String,
    pub datacenter: String,
    pub node_pool: String,
    pub node_class: String,
    pub status: NodeStatus,
    pub scheduling_eligibility: SchedulingEligibility,
    pub drain: bool,
    pub create_index: LogIndex,
    pub modify_index: LogIndex,
}

impl From<&Node> for NodeListStub {
    fn from(node: &Node) -> Self {
        NodeListStub {
            id: node.id,
            name: node.name.clone(),
            datacenter: node.datacenter.clone(),
            node_pool: node.node_pool.clone(),
            node_class: node.node_class.clone(),
            status: node.status,
            scheduling_eligibility: node.scheduling_eligibility,
            drain: node.drain.is_some(),
            create_index: node.create_index,
            modify_index: node.modify_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn node_event_log_is_capped() {
        let mut node = Node {
            id: NodeId::new_v4(),
            name: "n1".to_string(),
            datacenter: "dc1".to_string(),
            node_pool: "default".to_string(),
            node_class: "".to_string(),
            status: NodeStatus::Ready,
            status_description: "".to_string(),
            status_updated_at: Utc::now(),
            scheduling_eligibility: SchedulingEligibility::Eligible,
            drain: None,
            resources: Resources::new(1000, 1000),
            reserved: Resources::default(),
            attributes: Meta::new(),
            secret_id: Uuid::new_v4(),
            events: vec![],
            create_index: 0,
            modify_index: 0,
        };
        for i in 0..(MAX_NODE_EVENTS + 5) {
            node.push_event(NodeEvent::cluster(format!("event {i}")));
        }
        assert_eq!(node.events.len(), MAX_NODE_EVENTS);
        assert_eq!(node.events[0].message, "event 5");
    }
}
