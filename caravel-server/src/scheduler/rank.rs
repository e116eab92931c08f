use caravel_common::model::{Affinity, ConstraintOperand, Node, Resources, SchedulerAlgorithm};

/// A feasible node with its usage at ranking time (state usage plus any
/// placements already made by the in-progress plan).
pub struct RankedNode<'a> {
    pub node: &'a Node,
    pub score: f64,
}

/// Orders feasible candidates for one placement. Binpack prefers filling
/// already-busy nodes to leave large holes elsewhere; spread prefers the
/// emptiest node. Affinities shift the score by weight/100 per match.
pub fn rank_nodes<'a>(
    candidates: Vec<(&'a Node, Resources)>,
    ask: &Resources,
    algorithm: SchedulerAlgorithm,
    affinities: &[Affinity],
) -> Vec<RankedNode<'a>> {
    let mut ranked: Vec<RankedNode<'a>> = candidates
        .into_iter()
        .map(|(node, used)| {
            let fill = fill_fraction(node, &used, ask);
            let base = match algorithm {
                SchedulerAlgorithm::Binpack => fill,
                SchedulerAlgorithm::Spread => 1.0 - fill,
            };
            let score = base + affinity_bonus(node, affinities);
            RankedNode { node, score }
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            // Deterministic tie-break keeps plans reproducible across runs.
            .then_with(|| a.node.id.cmp(&b.node.id))
    });
    ranked
}

/// Fraction of the node consumed after the placement, averaged over cpu and
/// memory.
fn fill_fraction(node: &Node, used: &Resources, ask: &Resources) -> f64 {
    let available = node.available_resources();
    let cpu = ratio(used.cpu_mhz + ask.cpu_mhz, available.cpu_mhz);
    let memory = ratio(used.memory_mb + ask.memory_mb, available.memory_mb);
    (cpu + memory) / 2.0
}

fn ratio(used: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        1.0
    } else {
        used as f64 / capacity as f64
    }
}

fn affinity_bonus(node: &Node, affinities: &[Affinity]) -> f64 {
    let mut bonus = 0.0;
    for affinity in affinities {
        let value = match affinity.l_target.as_str() {
            "node.datacenter" => Some(node.datacenter.clone()),
            "node.class" => Some(node.node_class.clone()),
            "node.pool" => Some(node.node_pool.clone()),
            other => other
                .strip_prefix("node.attr.")
                .or_else(|| other.strip_prefix("attr."))
                .and_then(|key| node.attributes.get(key).cloned()),
        };
        let Some(value) = value else { continue };
        let matched = match affinity.operand {
            ConstraintOperand::Eq => value == affinity.r_target,
            ConstraintOperand::Ne => value != affinity.r_target,
            ConstraintOperand::SetContains => value
                .split(',')
                .map(str::trim)
                .any(|member| member == affinity.r_target),
            // Regex/version affinities are uncommon; treat a parseable match
            // like equality and ignore otherwise.
            ConstraintOperand::Regex => regex::Regex::new(&affinity.r_target)
                .map(|re| re.is_match(&value))
                .unwrap_or(false),
            ConstraintOperand::Version => false,
        };
        if matched {
            bonus += affinity.weight as f64 / 100.0;
        }
    }
    bonus
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use caravel_common::model::{Meta, NodeId, NodeStatus, SchedulingEligibility};
    use chrono::Utc;
    use uuid::Uuid;

    fn node(cpu: u64, memory: u64) -> Node {
        Node {
            id: NodeId::new_v4(),
            name: "node".to_string(),
            datacenter: "dc1".to_string(),
            node_pool: "default".to_string(),
            node_class: String::new(),
            status: NodeStatus::Ready,
            status_description: String::new(),
            status_updated_at: Utc::now(),
            scheduling_eligibility: SchedulingEligibility::Eligible,
            drain: None,
            resources: Resources::new(cpu, memory),
            reserved: Resources::default(),
            attributes: Meta::new(),
            secret_id: Uuid::new_v4(),
            events: vec![],
            create_index: 1,
            modify_index: 1,
        }
    }

    #[test]
    fn binpack_prefers_fuller_node() {
        let empty = node(1000, 1000);
        let busy = node(1000, 1000);
        let ask = Resources::new(100, 100);
        let ranked = rank_nodes(
            vec![
                (&empty, Resources::default()),
                (&busy, Resources::new(500, 500)),
            ],
            &ask,
            SchedulerAlgorithm::Binpack,
            &[],
        );
        assert_eq!(ranked[0].node.id, busy.id);
    }

    #[test]
    fn spread_prefers_emptier_node() {
        let empty = node(1000, 1000);
        let busy = node(1000, 1000);
        let ask = Resources::new(100, 100);
        let ranked = rank_nodes(
            vec![
                (&empty, Resources::default()),
                (&busy, Resources::new(500, 500)),
            ],
            &ask,
            SchedulerAlgorithm::Spread,
            &[],
        );
        assert_eq!(ranked[0].node.id, empty.id);
    }

    #[test]
    fn affinity_shifts_ranking() {
        let mut preferred = node(1000, 1000);
        preferred.node_class = "gpu".to_string();
        let other = node(1000, 1000);
        let ask = Resources::new(100, 100);
        let ranked = rank_nodes(
            vec![
                (&other, Resources::default()),
                (&preferred, Resources::default()),
            ],
            &ask,
            SchedulerAlgorithm::Binpack,
            &[Affinity {
                l_target: "node.class".to_string(),
                r_target: "gpu".to_string(),
                operand: ConstraintOperand::Eq,
                weight: 50,
            }],
        );
        assert_eq!(ranked[0].node.id, preferred.id);
    }
}
