use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use voyage_core::types::{Edge, Journey, Node, NodeKind};
use voyage_core::{EngineError, EngineResult};

/// Upper bound on a single delay node's hold. Anything longer is a
/// definition mistake, and bounding it keeps wake-time arithmetic inside
/// chrono's representable range.
pub const MAX_DELAY_SECS: u64 = 60 * 60 * 24 * 365 * 5;

/// An immutable, validated snapshot of a journey's graph. Built once per
/// processing attempt; live edits to the journey never mutate a snapshot a
/// processor is using.
#[derive(Debug, Clone)]
pub struct JourneyGraph {
    journey_id: Uuid,
    nodes: HashMap<Uuid, Node>,
    /// Outgoing edges per node, in declaration order.
    outgoing: HashMap<Uuid, Vec<Edge>>,
    entry_id: Uuid,
}

impl JourneyGraph {
    /// Validates the journey's node/edge set and builds the snapshot.
    /// Fails with `MalformedGraph` on any structural defect.
    pub fn build(journey: &Journey) -> EngineResult<Self> {
        let mut nodes: HashMap<Uuid, Node> = HashMap::with_capacity(journey.nodes.len());
        for node in &journey.nodes {
            if nodes.insert(node.id, node.clone()).is_some() {
                return Err(EngineError::MalformedGraph(format!(
                    "duplicate node id {} in journey {}",
                    node.id, journey.id
                )));
            }
        }

        let entry_id = {
            let mut entries = journey
                .nodes
                .iter()
                .filter(|n| matches!(n.kind, NodeKind::Entry));
            let first = entries.next().ok_or_else(|| {
                EngineError::MalformedGraph(format!("journey {} has no entry node", journey.id))
            })?;
            if entries.next().is_some() {
                return Err(EngineError::MalformedGraph(format!(
                    "journey {} has more than one entry node",
                    journey.id
                )));
            }
            first.id
        };

        let mut outgoing: HashMap<Uuid, Vec<Edge>> = HashMap::new();
        for edge in &journey.edges {
            if !nodes.contains_key(&edge.from) || !nodes.contains_key(&edge.to) {
                return Err(EngineError::MalformedGraph(format!(
                    "edge {} -> {} references a missing node",
                    edge.from, edge.to
                )));
            }
            outgoing.entry(edge.from).or_default().push(edge.clone());
        }

        for node in nodes.values() {
            let edges = outgoing.get(&node.id).map(Vec::as_slice).unwrap_or(&[]);
            match &node.kind {
                NodeKind::Exit => {
                    if !edges.is_empty() {
                        return Err(EngineError::MalformedGraph(format!(
                            "exit node {} has outgoing edges",
                            node.id
                        )));
                    }
                }
                NodeKind::Branch { branches } => {
                    if branches.is_empty() {
                        return Err(EngineError::MalformedGraph(format!(
                            "branch node {} declares no arms",
                            node.id
                        )));
                    }
                    for arm in branches {
                        let has_edge = edges
                            .iter()
                            .any(|e| e.branch_key.as_deref() == Some(arm.key.as_str()));
                        if !has_edge {
                            return Err(EngineError::MalformedGraph(format!(
                                "branch node {} arm {:?} has no matching edge",
                                node.id, arm.key
                            )));
                        }
                    }
                    for edge in edges {
                        let key = edge.branch_key.as_deref().ok_or_else(|| {
                            EngineError::MalformedGraph(format!(
                                "branch node {} has an unkeyed outgoing edge",
                                node.id
                            ))
                        })?;
                        if !branches.iter().any(|a| a.key == key) {
                            return Err(EngineError::MalformedGraph(format!(
                                "branch node {} edge key {:?} matches no arm",
                                node.id, key
                            )));
                        }
                    }
                }
                NodeKind::Delay { duration_secs } => {
                    if *duration_secs > MAX_DELAY_SECS {
                        return Err(EngineError::MalformedGraph(format!(
                            "delay node {} holds for {}s, above the {}s maximum",
                            node.id, duration_secs, MAX_DELAY_SECS
                        )));
                    }
                    if edges.is_empty() {
                        return Err(EngineError::MalformedGraph(format!(
                            "non-exit node {} has no outgoing edge",
                            node.id
                        )));
                    }
                }
                _ => {
                    if edges.is_empty() {
                        return Err(EngineError::MalformedGraph(format!(
                            "non-exit node {} has no outgoing edge",
                            node.id
                        )));
                    }
                }
            }
        }

        // Every node must be reachable from the entry; loop-back cycles are
        // permitted and terminated at runtime via exit conditions.
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut frontier = VecDeque::from([entry_id]);
        while let Some(id) = frontier.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(edges) = outgoing.get(&id) {
                for edge in edges {
                    frontier.push_back(edge.to);
                }
            }
        }
        if seen.len() != nodes.len() {
            let orphaned: Vec<_> = nodes.keys().filter(|id| !seen.contains(id)).collect();
            return Err(EngineError::MalformedGraph(format!(
                "journey {} has nodes unreachable from the entry: {:?}",
                journey.id, orphaned
            )));
        }

        Ok(Self {
            journey_id: journey.id,
            nodes,
            outgoing,
            entry_id,
        })
    }

    pub fn journey_id(&self) -> Uuid {
        self.journey_id
    }

    pub fn node(&self, id: Uuid) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Like `node`, but a missing id is a structural defect.
    pub fn require_node(&self, id: Uuid) -> EngineResult<&Node> {
        self.nodes.get(&id).ok_or_else(|| {
            EngineError::MalformedGraph(format!(
                "node {} not present in journey {}",
                id, self.journey_id
            ))
        })
    }

    pub fn entry_node(&self) -> &Node {
        // Validated at build time.
        &self.nodes[&self.entry_id]
    }

    /// All successor node ids, in edge declaration order.
    pub fn next_nodes(&self, id: Uuid) -> Vec<Uuid> {
        self.outgoing
            .get(&id)
            .map(|edges| edges.iter().map(|e| e.to).collect())
            .unwrap_or_default()
    }

    /// The single successor of a linear node (first declared edge).
    pub fn next_linear(&self, id: Uuid) -> Option<Uuid> {
        self.outgoing
            .get(&id)
            .and_then(|edges| edges.first())
            .map(|e| e.to)
    }

    /// The successor selected by a branch key.
    pub fn next_for_branch(&self, id: Uuid, key: &str) -> Option<Uuid> {
        self.outgoing.get(&id).and_then(|edges| {
            edges
                .iter()
                .find(|e| e.branch_key.as_deref() == Some(key))
                .map(|e| e.to)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use voyage_core::types::{
        BranchArm, Channel, Criteria, EntrySettings, JourneyStatus,
    };

    fn journey_with(nodes: Vec<Node>, edges: Vec<Edge>) -> Journey {
        let now = Utc::now();
        Journey {
            id: Uuid::new_v4(),
            name: "test".into(),
            workspace_id: Uuid::new_v4(),
            nodes,
            edges,
            is_dynamic: true,
            inclusion_criteria: Criteria::AllCustomers,
            entry_settings: EntrySettings::default(),
            status: JourneyStatus::Active,
            status_version: 1,
            created_at: now,
            started_at: Some(now),
            latest_pause: None,
            stopped_at: None,
            deleted_at: None,
            latest_save: now,
            latest_changer: None,
        }
    }

    fn node(kind: NodeKind) -> Node {
        Node {
            id: Uuid::new_v4(),
            name: "n".into(),
            kind,
        }
    }

    fn edge(from: &Node, to: &Node) -> Edge {
        Edge {
            from: from.id,
            to: to.id,
            branch_key: None,
        }
    }

    #[test]
    fn test_linear_graph_builds_and_traverses() {
        let entry = node(NodeKind::Entry);
        let send = node(NodeKind::Send {
            channel: Channel::Email,
            template_id: "tpl".into(),
        });
        let exit = node(NodeKind::Exit);
        let journey = journey_with(
            vec![entry.clone(), send.clone(), exit.clone()],
            vec![edge(&entry, &send), edge(&send, &exit)],
        );

        let graph = JourneyGraph::build(&journey).unwrap();
        assert_eq!(graph.entry_node().id, entry.id);
        assert_eq!(graph.next_linear(entry.id), Some(send.id));
        assert_eq!(graph.next_linear(send.id), Some(exit.id));
        assert_eq!(graph.next_linear(exit.id), None);
        assert_eq!(graph.next_nodes(entry.id), vec![send.id]);
    }

    #[test]
    fn test_edge_to_missing_node_is_malformed() {
        let entry = node(NodeKind::Entry);
        let exit = node(NodeKind::Exit);
        let mut bad = edge(&entry, &exit);
        bad.to = Uuid::new_v4();
        let journey = journey_with(vec![entry, exit], vec![bad]);
        assert!(matches!(
            JourneyGraph::build(&journey),
            Err(EngineError::MalformedGraph(_))
        ));
    }

    #[test]
    fn test_missing_entry_is_malformed() {
        let exit = node(NodeKind::Exit);
        let journey = journey_with(vec![exit], vec![]);
        assert!(matches!(
            JourneyGraph::build(&journey),
            Err(EngineError::MalformedGraph(_))
        ));
    }

    #[test]
    fn test_dangling_non_exit_node_is_malformed() {
        let entry = node(NodeKind::Entry);
        let send = node(NodeKind::Send {
            channel: Channel::Sms,
            template_id: "tpl".into(),
        });
        let journey = journey_with(vec![entry.clone(), send.clone()], vec![edge(&entry, &send)]);
        // `send` has no outgoing edge and is not an exit.
        assert!(matches!(
            JourneyGraph::build(&journey),
            Err(EngineError::MalformedGraph(_))
        ));
    }

    #[test]
    fn test_unreachable_node_is_malformed() {
        let entry = node(NodeKind::Entry);
        let exit = node(NodeKind::Exit);
        let island = node(NodeKind::Exit);
        let journey = journey_with(
            vec![entry.clone(), exit.clone(), island],
            vec![edge(&entry, &exit)],
        );
        assert!(matches!(
            JourneyGraph::build(&journey),
            Err(EngineError::MalformedGraph(_))
        ));
    }

    #[test]
    fn test_branch_edges_resolve_by_key() {
        let entry = node(NodeKind::Entry);
        let branch = node(NodeKind::Branch {
            branches: vec![
                BranchArm {
                    key: "yes".into(),
                    condition: Criteria::AllCustomers,
                },
                BranchArm {
                    key: "no".into(),
                    condition: Criteria::AllCustomers,
                },
            ],
        });
        let yes_exit = node(NodeKind::Exit);
        let no_exit = node(NodeKind::Exit);
        let journey = journey_with(
            vec![entry.clone(), branch.clone(), yes_exit.clone(), no_exit.clone()],
            vec![
                edge(&entry, &branch),
                Edge {
                    from: branch.id,
                    to: yes_exit.id,
                    branch_key: Some("yes".into()),
                },
                Edge {
                    from: branch.id,
                    to: no_exit.id,
                    branch_key: Some("no".into()),
                },
            ],
        );

        let graph = JourneyGraph::build(&journey).unwrap();
        assert_eq!(graph.next_for_branch(branch.id, "yes"), Some(yes_exit.id));
        assert_eq!(graph.next_for_branch(branch.id, "no"), Some(no_exit.id));
        assert_eq!(graph.next_for_branch(branch.id, "maybe"), None);
    }

    #[test]
    fn test_branch_arm_without_edge_is_malformed() {
        let entry = node(NodeKind::Entry);
        let branch = node(NodeKind::Branch {
            branches: vec![
                BranchArm {
                    key: "yes".into(),
                    condition: Criteria::AllCustomers,
                },
                BranchArm {
                    key: "no".into(),
                    condition: Criteria::AllCustomers,
                },
            ],
        });
        let yes_exit = node(NodeKind::Exit);
        let journey = journey_with(
            vec![entry.clone(), branch.clone(), yes_exit.clone()],
            vec![
                edge(&entry, &branch),
                Edge {
                    from: branch.id,
                    to: yes_exit.id,
                    branch_key: Some("yes".into()),
                },
            ],
        );
        assert!(matches!(
            JourneyGraph::build(&journey),
            Err(EngineError::MalformedGraph(_))
        ));
    }

    #[test]
    fn test_overlong_delay_is_malformed() {
        let entry = node(NodeKind::Entry);
        let wait = node(NodeKind::Delay {
            duration_secs: MAX_DELAY_SECS + 1,
        });
        let exit = node(NodeKind::Exit);
        let journey = journey_with(
            vec![entry.clone(), wait.clone(), exit.clone()],
            vec![edge(&entry, &wait), edge(&wait, &exit)],
        );
        assert!(matches!(
            JourneyGraph::build(&journey),
            Err(EngineError::MalformedGraph(_))
        ));
    }

    #[test]
    fn test_loop_back_edges_are_permitted() {
        let entry = node(NodeKind::Entry);
        let delay = node(NodeKind::Delay { duration_secs: 60 });
        let branch = node(NodeKind::Branch {
            branches: vec![
                BranchArm {
                    key: "again".into(),
                    condition: Criteria::AllCustomers,
                },
                BranchArm {
                    key: "done".into(),
                    condition: Criteria::AllCustomers,
                },
            ],
        });
        let exit = node(NodeKind::Exit);
        let journey = journey_with(
            vec![entry.clone(), delay.clone(), branch.clone(), exit.clone()],
            vec![
                edge(&entry, &delay),
                edge(&delay, &branch),
                Edge {
                    from: branch.id,
                    to: delay.id,
                    branch_key: Some("again".into()),
                },
                Edge {
                    from: branch.id,
                    to: exit.id,
                    branch_key: Some("done".into()),
                },
            ],
        );
        assert!(JourneyGraph::build(&journey).is_ok());
    }
}
