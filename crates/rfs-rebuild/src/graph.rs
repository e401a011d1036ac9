//! The node graph: every discovered node, linked by keypointers.

use asupersync::Cx;
use rfs_error::{Result, RfsError};
use rfs_ondisk::{Node, NodeBody};
use rfs_types::{Generation, Key, LogicalAddr, TreeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// One vertex: the identity and key coverage of a discovered node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub level: u8,
    pub generation: Generation,
    pub owner: TreeId,
    pub num_items: u32,
    pub min_item: Key,
    pub max_item: Key,
    /// Item keys, in slot order; populated for leaves only.
    pub item_keys: Vec<Key>,
}

/// One edge: a keypointer from an internal node to its child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub from_node: LogicalAddr,
    pub from_slot: usize,
    pub to_node: LogicalAddr,
    pub to_level: u8,
    pub to_key: Key,
    pub to_generation: Generation,
}

/// What [`Graph::final_check`] found that was tolerable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalCheckReport {
    /// Keypointers whose target was never discovered and does not read.
    pub dead_ends: usize,
    /// Keypointers whose target reads fine but was not in the scan.
    pub unscanned_targets: usize,
}

/// Directed graph over all discovered nodes. Populated once during the
/// scan and immutable afterwards.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: BTreeMap<LogicalAddr, GraphNode>,
    edges_from: HashMap<LogicalAddr, Vec<Arc<GraphEdge>>>,
    edges_to: HashMap<LogicalAddr, Vec<Arc<GraphEdge>>>,
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one scanned node, keyed by its claimed logical address.
    pub fn insert_node(&mut self, node: &Node) {
        let laddr = node.head.addr;
        let item_keys = match &node.body {
            NodeBody::Leaf(items) => items.iter().map(|i| i.key).collect(),
            NodeBody::Internal(_) => Vec::new(),
        };
        self.nodes.insert(
            laddr,
            GraphNode {
                level: node.head.level,
                generation: node.head.generation,
                owner: node.head.owner,
                num_items: node.head.num_items,
                min_item: node.min_item_key().unwrap_or(Key::MAX),
                max_item: node.max_item_key().unwrap_or(Key::MIN),
                item_keys,
            },
        );

        for (slot, kp) in node.key_pointers().iter().enumerate() {
            let edge = Arc::new(GraphEdge {
                from_node: laddr,
                from_slot: slot,
                to_node: kp.target,
                to_level: node.head.level - 1,
                to_key: kp.key,
                to_generation: kp.generation,
            });
            self.edges_from
                .entry(laddr)
                .or_default()
                .push(Arc::clone(&edge));
            self.edges_to.entry(kp.target).or_default().push(edge);
        }
    }

    #[must_use]
    pub fn node(&self, laddr: LogicalAddr) -> Option<&GraphNode> {
        self.nodes.get(&laddr)
    }

    #[must_use]
    pub fn nodes(&self) -> impl Iterator<Item = (LogicalAddr, &GraphNode)> {
        self.nodes.iter().map(|(addr, node)| (*addr, node))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Edges out of an internal node, in slot order.
    #[must_use]
    pub fn edges_from(&self, laddr: LogicalAddr) -> &[Arc<GraphEdge>] {
        self.edges_from.get(&laddr).map_or(&[], Vec::as_slice)
    }

    /// Edges pointing at a node (its potential parents).
    #[must_use]
    pub fn edges_to(&self, laddr: LogicalAddr) -> &[Arc<GraphEdge>] {
        self.edges_to.get(&laddr).map_or(&[], Vec::as_slice)
    }

    /// Post-scan verification.
    ///
    /// Dead-end keypointers (missing targets) are classified by probing
    /// the reader and reported, not fatal. Level mismatches between an
    /// edge and its target, and any directed cycle, are fatal: the graph
    /// would misdirect the rebuild.
    pub fn final_check(
        &self,
        cx: &Cx,
        probe: &dyn Fn(&Cx, LogicalAddr) -> Result<()>,
    ) -> Result<FinalCheckReport> {
        let mut report = FinalCheckReport::default();

        info!(target: "rfs::rebuild", nodes = self.nodes.len(), "checking keypointers");
        for edges in self.edges_from.values() {
            for edge in edges {
                cx.checkpoint().map_err(|_| RfsError::Cancelled)?;
                match self.nodes.get(&edge.to_node) {
                    Some(target) => {
                        if target.level != edge.to_level {
                            return Err(RfsError::NodeExpectation {
                                field: "level",
                                expected: edge.to_level.to_string(),
                                actual: target.level.to_string(),
                                laddr: edge.to_node,
                            });
                        }
                    }
                    None => match probe(cx, edge.to_node) {
                        Ok(()) => {
                            warn!(
                                target: "rfs::rebuild",
                                from = %edge.from_node,
                                to = %edge.to_node,
                                "keypointer target reads but was not scanned"
                            );
                            report.unscanned_targets += 1;
                        }
                        Err(err) => {
                            warn!(
                                target: "rfs::rebuild",
                                from = %edge.from_node,
                                to = %edge.to_node,
                                %err,
                                "dead-end keypointer"
                            );
                            report.dead_ends += 1;
                        }
                    },
                }
            }
        }

        self.check_acyclic(cx)?;
        info!(
            target: "rfs::rebuild",
            dead_ends = report.dead_ends,
            unscanned = report.unscanned_targets,
            "keypointer check done"
        );
        Ok(report)
    }

    /// Iterative three-color DFS over the whole graph.
    fn check_acyclic(&self, cx: &Cx) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            Visiting,
            Done,
        }
        let mut colors: HashMap<LogicalAddr, Color> = HashMap::with_capacity(self.nodes.len());

        for &start in self.nodes.keys() {
            if colors.contains_key(&start) {
                continue;
            }
            cx.checkpoint().map_err(|_| RfsError::Cancelled)?;

            // (node, next-edge-index) stack.
            let mut stack: Vec<(LogicalAddr, usize)> = vec![(start, 0)];
            colors.insert(start, Color::Visiting);
            while let Some((node, edge_idx)) = stack.pop() {
                let edges = self.edges_from(node);
                if edge_idx >= edges.len() {
                    colors.insert(node, Color::Done);
                    continue;
                }
                stack.push((node, edge_idx + 1));
                let next = edges[edge_idx].to_node;
                match colors.get(&next) {
                    Some(Color::Visiting) => {
                        let path: Vec<TreeId> = stack
                            .iter()
                            .map(|(addr, _)| rfs_types::ObjectId(addr.0 as u64))
                            .collect();
                        return Err(RfsError::TreeLoop { path });
                    }
                    Some(Color::Done) => {}
                    None => {
                        if self.nodes.contains_key(&next) {
                            colors.insert(next, Color::Visiting);
                            stack.push((next, 0));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// In-memory node constructors shared by this crate's tests.
#[cfg(test)]
pub(crate) mod testutil {
    use super::{Generation, Key, LogicalAddr, Node, NodeBody};
    use rfs_ondisk::{ItemBody, KeyPointer, LeafItem, NodeHeader};
    use rfs_types::{ObjectId, Uuid};

    pub(crate) fn leaf_node(laddr: i64, owner: ObjectId, gen: u64, keys: &[Key]) -> Node {
        Node {
            head: NodeHeader {
                csum: [0; 32],
                metadata_uuid: Uuid::ZERO,
                addr: LogicalAddr(laddr),
                flags: 0,
                backref_rev: 1,
                chunk_tree_uuid: Uuid::ZERO,
                generation: Generation(gen),
                owner,
                num_items: keys.len() as u32,
                level: 0,
            },
            body: NodeBody::Leaf(
                keys.iter()
                    .map(|&key| LeafItem {
                        key,
                        data_size: 0,
                        body: ItemBody::Opaque(Vec::new()),
                    })
                    .collect(),
            ),
        }
    }

    pub(crate) fn internal_node(
        laddr: i64,
        owner: ObjectId,
        gen: u64,
        level: u8,
        children: &[(Key, i64, u64)],
    ) -> Node {
        Node {
            head: NodeHeader {
                csum: [0; 32],
                metadata_uuid: Uuid::ZERO,
                addr: LogicalAddr(laddr),
                flags: 0,
                backref_rev: 1,
                chunk_tree_uuid: Uuid::ZERO,
                generation: Generation(gen),
                owner,
                num_items: children.len() as u32,
                level,
            },
            body: NodeBody::Internal(
                children
                    .iter()
                    .map(|&(key, target, child_gen)| KeyPointer {
                        key,
                        target: LogicalAddr(target),
                        generation: Generation(child_gen),
                    })
                    .collect(),
            ),
        }
    }
}
