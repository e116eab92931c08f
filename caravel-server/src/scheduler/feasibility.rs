use caravel_common::model::{
    AllocId, Constraint, ConstraintOperand, Job, Node, Resources, TaskGroup, NODE_POOL_ALL,
};
use crate::state::StateSnapshot;
use std::collections::HashSet;

/// Checks whether `node` can host task group `tg` of `job`, ignoring
/// capacity. Returns the first failing check as an operator-readable reason.
pub fn check_node(job: &Job, tg: &TaskGroup, node: &Node) -> Result<(), String> {
    if !node.ready() {
        if node.drain.is_some() {
            return Err("node is draining".to_string());
        }
        return Err(format!("node status is {}", node.status));
    }
    if job.node_pool != NODE_POOL_ALL && node.node_pool != job.node_pool {
        return Err(format!(
            "node not in pool '{}' (node pool '{}')",
            job.node_pool, node.node_pool
        ));
    }
    if !job.datacenters.iter().any(|dc| dc == &node.datacenter) {
        return Err(format!(
            "node datacenter '{}' not in job datacenters",
            node.datacenter
        ));
    }
    for constraint in job.constraints.iter().chain(tg.constraints.iter()) {
        check_constraint(constraint, node)?;
    }
    Ok(())
}

/// Capacity check: current committed usage on the node plus `ask` must fit
/// in what the node offers beyond its reservation. `exclude` carries
/// allocations the caller is stopping or replacing in the same plan.
pub fn node_capacity_fits(
    snapshot: &StateSnapshot,
    node: &Node,
    ask: &Resources,
    exclude: &HashSet<AllocId>,
) -> Result<(), String> {
    let used = node_current_usage(snapshot, node, exclude);
    used.fits_with(ask, &node.available_resources())
        .map_err(|dimension| format!("{dimension} on node {}", node.id))
}

pub fn node_current_usage(
    snapshot: &StateSnapshot,
    node: &Node,
    exclude: &HashSet<AllocId>,
) -> Resources {
    let mut used = Resources::default();
    for alloc in snapshot.allocs_for_node(&node.id) {
        if exclude.contains(&alloc.id) {
            continue;
        }
        if alloc.terminal_status() {
            continue;
        }
        used.add(&alloc.resources);
    }
    used
}

/// A task group escapes the computed-class digest when any of its constraints
/// reference fingerprinted attributes; such evals must be retried on every
/// node change, not just matching-class changes.
pub fn escapes_computed_class(job: &Job, tg: &TaskGroup) -> bool {
    job.constraints
        .iter()
        .chain(tg.constraints.iter())
        .any(|c| is_attribute_target(&c.l_target))
}

fn is_attribute_target(target: &str) -> bool {
    target.starts_with("attr.") || target.starts_with("node.attr.")
}

fn check_constraint(constraint: &Constraint, node: &Node) -> Result<(), String> {
    let Some(value) = resolve_target(&constraint.l_target, node) else {
        return Err(format!(
            "constraint target '{}' not present on node",
            constraint.l_target
        ));
    };
    let expected = constraint.r_target.as_str();
    let ok = match constraint.operand {
        ConstraintOperand::Eq => value == expected,
        ConstraintOperand::Ne => value != expected,
        ConstraintOperand::Regex => match regex::Regex::new(expected) {
            Ok(re) => re.is_match(&value),
            Err(_) => return Err(format!("invalid constraint regex '{expected}'")),
        },
        ConstraintOperand::Version => check_version(&value, expected)?,
        ConstraintOperand::SetContains => value
            .split(',')
            .map(str::trim)
            .any(|member| member == expected),
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "constraint '{} {:?} {}' failed (node value '{}')",
            constraint.l_target, constraint.operand, constraint.r_target, value
        ))
    }
}

fn resolve_target(target: &str, node: &Node) -> Option<String> {
    match target {
        "node.datacenter" => Some(node.datacenter.clone()),
        "node.class" => Some(node.node_class.clone()),
        "node.pool" => Some(node.node_pool.clone()),
        "node.name" => Some(node.name.clone()),
        "node.id" => Some(node.id.to_string()),
        other => {
            let key = other
                .strip_prefix("node.attr.")
                .or_else(|| other.strip_prefix("attr."))?;
            node.attributes.get(key).cloned()
        }
    }
}

/// Version constraint: `expected` is an optional comparison operator
/// (`>=`, `<=`, `>`, `<`, `=`) followed by a dotted numeric version.
fn check_version(value: &str, expected: &str) -> Result<bool, String> {
    let expected = expected.trim();
    let (op, rhs) = if let Some(rest) = expected.strip_prefix(">=") {
        (">=", rest)
    } else if let Some(rest) = expected.strip_prefix("<=") {
        ("<=", rest)
    } else if let Some(rest) = expected.strip_prefix('>') {
        (">", rest)
    } else if let Some(rest) = expected.strip_prefix('<') {
        ("<", rest)
    } else if let Some(rest) = expected.strip_prefix('=') {
        ("=", rest)
    } else {
        ("=", expected)
    };
    let lhs = parse_version(value)
        .ok_or_else(|| format!("node value '{value}' is not a version"))?;
    let rhs = parse_version(rhs.trim())
        .ok_or_else(|| format!("constraint value '{rhs}' is not a version"))?;
    Ok(match op {
        ">=" => lhs >= rhs,
        "<=" => lhs <= rhs,
        ">" => lhs > rhs,
        "<" => lhs < rhs,
        _ => lhs == rhs,
    })
}

fn parse_version(s: &str) -> Option<Vec<u64>> {
    let parts: Vec<u64> = s
        .split('.')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<u64>>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use caravel_common::model::{
        JobId, JobStatus, JobType, Meta, Namespace, NodeId, NodeStatus, SchedulingEligibility,
    };
    use chrono::Utc;
    use uuid::Uuid;

    fn node(dc: &str, class: &str) -> Node {
        Node {
            id: NodeId::new_v4(),
            name: "node".to_string(),
            datacenter: dc.to_string(),
            node_pool: "default".to_string(),
            node_class: class.to_string(),
            status: NodeStatus::Ready,
            status_description: String::new(),
            status_updated_at: Utc::now(),
            scheduling_eligibility: SchedulingEligibility::Eligible,
            drain: None,
            resources: Resources::new(1000, 1024),
            reserved: Resources::default(),
            attributes: Meta::from([
                ("kernel.name".to_string(), "linux".to_string()),
                ("version".to_string(), "1.7.2".to_string()),
            ]),
            secret_id: Uuid::new_v4(),
            events: vec![],
            create_index: 1,
            modify_index: 1,
        }
    }

    fn job_with_constraints(constraints: Vec<Constraint>) -> (Job, TaskGroup) {
        let tg = TaskGroup {
            name: "main".to_string(),
            count: 1,
            tasks: vec![],
            constraints: vec![],
            affinities: vec![],
            spreads: vec![],
            networks: vec![],
            restart_policy: Default::default(),
            reschedule_policy: Default::default(),
            max_client_disconnect: None,
        };
        let job = Job {
            id: JobId::new("job"),
            namespace: Namespace::default(),
            name: "job".to_string(),
            job_type: JobType::Service,
            priority: 50,
            datacenters: vec!["dc1".to_string()],
            node_pool: "default".to_string(),
            constraints,
            task_groups: vec![tg.clone()],
            periodic: None,
            parent_id: None,
            stop: false,
            status: JobStatus::Pending,
            version: 0,
            submit_time: Utc::now(),
            create_index: 1,
            modify_index: 1,
            meta: Meta::new(),
        };
        (job, tg)
    }

    #[test]
    fn datacenter_mismatch_is_infeasible() {
        let (job, tg) = job_with_constraints(vec![]);
        let node = node("dc2", "");
        let err = check_node(&job, &tg, &node).unwrap_err();
        assert!(err.contains("datacenter"), "{err}");
    }

    #[test]
    fn attribute_constraints_match() {
        let (job, tg) = job_with_constraints(vec![Constraint {
            l_target: "attr.kernel.name".to_string(),
            r_target: "linux".to_string(),
            operand: ConstraintOperand::Eq,
        }]);
        assert!(check_node(&job, &tg, &node("dc1", "")).is_ok());

        let (job, tg) = job_with_constraints(vec![Constraint {
            l_target: "attr.kernel.name".to_string(),
            r_target: "windows".to_string(),
            operand: ConstraintOperand::Eq,
        }]);
        assert!(check_node(&job, &tg, &node("dc1", "")).is_err());
    }

    #[test]
    fn version_constraints_compare_numerically() {
        let (job, tg) = job_with_constraints(vec![Constraint {
            l_target: "attr.version".to_string(),
            r_target: ">= 1.7".to_string(),
            operand: ConstraintOperand::Version,
        }]);
        assert!(check_node(&job, &tg, &node("dc1", "")).is_ok());

        let (job, tg) = job_with_constraints(vec![Constraint {
            l_target: "attr.version".to_string(),
            r_target: "> 1.10".to_string(),
            operand: ConstraintOperand::Version,
        }]);
        assert!(check_node(&job, &tg, &node("dc1", "")).is_err());
    }

    #[test]
    fn attribute_constraints_escape_the_class_digest() {
        let (job, tg) = job_with_constraints(vec![Constraint {
            l_target: "attr.kernel.name".to_string(),
            r_target: "linux".to_string(),
            operand: ConstraintOperand::Eq,
        }]);
        assert!(escapes_computed_class(&job, &tg));

        let (job, tg) = job_with_constraints(vec![Constraint {
            l_target: "node.datacenter".to_string(),
            r_target: "dc1".to_string(),
            operand: ConstraintOperand::Eq,
        }]);
        assert!(!escapes_computed_class(&job, &tg));
    }
}
