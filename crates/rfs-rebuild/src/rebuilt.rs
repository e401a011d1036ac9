//! The rebuilt-tree engine.
//!
//! A rebuilt tree is a mutable view over the node graph: a set of
//! accepted root nodes, the leaves reachable from them along owner-OK
//! edges, and a derived key→item index with COW-distance tie-breaking.
//! Trees are registered by id; parents are looked up through the
//! registry rather than held as direct references, and ancestor walks
//! carry a visited set so pathological parent cycles cannot hang them.

use crate::graph::Graph;
use crate::scan::ItemPtr;
use asupersync::Cx;
use parking_lot::Mutex;
use rfs_error::{Result, RfsError};
use rfs_index::OldRebuiltForrest;
use rfs_ondisk::{ItemBody, RootItem};
use rfs_tree::{NodeExpectations, TreeFs};
use rfs_types::{Generation, Key, LogicalAddr, TreeId, Uuid};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// How the engine reaches the outside world: item announcements for the
/// consistency checker, and root/uuid lookups for ancestry resolution.
pub trait RebuildCallbacks: Send + Sync {
    fn added_item(&self, cx: &Cx, tree: TreeId, key: Key);

    fn added_root(&self, cx: &Cx, tree: TreeId, root: LogicalAddr);

    /// The ROOT_ITEM for a tree: `(key offset, body)`.
    fn lookup_root(&self, cx: &Cx, tree: TreeId) -> Result<(Generation, RootItem)>;

    /// Resolve a subvolume UUID to its tree id.
    fn lookup_uuid(&self, cx: &Cx, uuid: Uuid) -> Result<TreeId>;
}

/// Production callbacks: resolve roots and UUIDs through the
/// old-rebuilt indexes.
pub struct IndexRebuildCallbacks {
    pub index: Arc<OldRebuiltForrest>,
}

impl RebuildCallbacks for IndexRebuildCallbacks {
    fn added_item(&self, _cx: &Cx, tree: TreeId, key: Key) {
        trace!(target: "rfs::rebuild", %tree, %key, "item attached");
    }

    fn added_root(&self, _cx: &Cx, tree: TreeId, root: LogicalAddr) {
        debug!(target: "rfs::rebuild", %tree, %root, "root attached");
    }

    fn lookup_root(&self, cx: &Cx, tree: TreeId) -> Result<(Generation, RootItem)> {
        self.index.lookup_root_item(cx, tree)
    }

    fn lookup_uuid(&self, cx: &Cx, uuid: Uuid) -> Result<TreeId> {
        self.index.lookup_uuid(cx, uuid)
    }
}

#[derive(Debug, Default)]
struct TreeState {
    roots: BTreeSet<LogicalAddr>,
    leafs: BTreeSet<LogicalAddr>,
}

/// One logical tree being rebuilt.
#[derive(Debug)]
pub struct RebuiltTree {
    pub id: TreeId,
    pub uuid: Uuid,
    /// Parent snapshot, by id into the registry.
    pub parent: Option<TreeId>,
    /// The generation this tree was snapshotted off its parent.
    pub parent_gen: Generation,
    /// The ancestor walk found a cycle (lax mode only).
    pub ancestor_loop: bool,
    /// Where the ancestor walk was cut: the farthest ancestor retained
    /// before an id repeated.
    pub ancestor_root: Option<TreeId>,
    state: Mutex<TreeState>,
}

impl RebuiltTree {
    #[must_use]
    pub fn roots(&self) -> BTreeSet<LogicalAddr> {
        self.state.lock().roots.clone()
    }

    #[must_use]
    pub fn leafs(&self) -> BTreeSet<LogicalAddr> {
        self.state.lock().leafs.clone()
    }
}

/// leaf laddr → the roots that reach it along owner-OK edges.
pub type LeafMap = BTreeMap<LogicalAddr, BTreeSet<LogicalAddr>>;

#[derive(Default)]
struct ItemIndex {
    seen: BTreeSet<LogicalAddr>,
    map: BTreeMap<Key, ItemPtr>,
    dups: usize,
}

/// One id's ancestry, resolved through the lookup callbacks.
#[derive(Clone)]
struct Ancestry {
    /// Ids from the tree upward; lookups for each retained link.
    chain: Vec<(TreeId, Generation, RootItem)>,
    /// Set when the walk stopped because this id would repeat.
    loop_at: Option<TreeId>,
}

/// Registry of rebuilt trees over one node graph.
pub struct RebuiltForrest {
    fs: Option<Arc<TreeFs>>,
    graph: Arc<Graph>,
    cbs: Arc<dyn RebuildCallbacks>,
    lax: bool,
    /// `None` marks a tree that failed to resolve; the error is
    /// recomputed from the (deterministic) lookups on each request.
    trees: Mutex<HashMap<TreeId, Option<Arc<RebuiltTree>>>>,
    leaf_maps: Mutex<HashMap<TreeId, Arc<LeafMap>>>,
    inc_items: Mutex<HashMap<TreeId, ItemIndex>>,
    all_items: Mutex<HashMap<TreeId, ItemIndex>>,
}

impl RebuiltForrest {
    #[must_use]
    pub fn new(
        fs: Option<Arc<TreeFs>>,
        graph: Arc<Graph>,
        cbs: Arc<dyn RebuildCallbacks>,
        lax: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            fs,
            graph,
            cbs,
            lax,
            trees: Mutex::new(HashMap::new()),
            leaf_maps: Mutex::new(HashMap::new()),
            inc_items: Mutex::new(HashMap::new()),
            all_items: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    #[must_use]
    pub fn is_lax(&self) -> bool {
        self.lax
    }

    /// The rebuilt tree for `tree_id`, resolving its ancestor chain.
    ///
    /// In strict mode an ancestor cycle fails every tree on the cycle
    /// with `TreeLoop`; in lax mode each tree is built with
    /// `ancestor_loop` set and its chain truncated at the first repeat.
    pub fn rebuilt_tree(&self, cx: &Cx, tree_id: TreeId) -> Result<Arc<RebuiltTree>> {
        if let Some(entry) = self.trees.lock().get(&tree_id) {
            if let Some(tree) = entry {
                return Ok(Arc::clone(tree));
            }
            // Known-failed: fall through and recompute the error below.
        }

        let ancestry = match self.analyze_ancestry(cx, tree_id) {
            Ok(ancestry) => ancestry,
            Err(err) => {
                let mut trees = self.trees.lock();
                trees.entry(tree_id).or_insert(None);
                if let RfsError::TreeLoop { path } = &err {
                    for id in path {
                        trees.entry(*id).or_insert(None);
                    }
                }
                return Err(err);
            }
        };

        // Build every uncached member of the chain, each from its *own*
        // ancestry walk, so per-tree loop flags come out right no matter
        // which tree was requested first.
        for &(member, _, _) in ancestry.chain.iter().rev() {
            if matches!(self.trees.lock().get(&member), Some(Some(_))) {
                continue;
            }
            let own = if member == tree_id {
                ancestry.clone()
            } else {
                match self.analyze_ancestry(cx, member) {
                    Ok(own) => own,
                    Err(err) => {
                        debug!(target: "rfs::rebuild", tree = %member, %err, "ancestor analysis failed");
                        continue;
                    }
                }
            };
            self.install_tree(member, &own);
        }

        match self.trees.lock().get(&tree_id) {
            Some(Some(tree)) => Ok(Arc::clone(tree)),
            _ => Err(RfsError::TreeMissing { tree: tree_id }),
        }
    }

    fn install_tree(&self, id: TreeId, ancestry: &Ancestry) {
        let (_, parent_gen, root) = &ancestry.chain[0];
        let parent = match ancestry.chain.get(1) {
            Some(&(id, _, _)) => Some(id),
            None => ancestry.loop_at,
        };
        let ancestor_root = ancestry
            .loop_at
            .is_some()
            .then(|| ancestry.chain.last().map(|&(id, _, _)| id))
            .flatten();
        let tree = Arc::new(RebuiltTree {
            id,
            uuid: root.uuid,
            parent,
            parent_gen: *parent_gen,
            ancestor_loop: ancestry.loop_at.is_some(),
            ancestor_root,
            state: Mutex::new(TreeState::default()),
        });
        info!(
            target: "rfs::rebuild",
            tree = %id,
            parent = ?tree.parent,
            ancestor_loop = tree.ancestor_loop,
            "tree registered"
        );
        self.trees.lock().insert(id, Some(tree));
    }

    /// Walk the parent chain from `tree_id`, via the lookup callbacks.
    fn analyze_ancestry(&self, cx: &Cx, tree_id: TreeId) -> Result<Ancestry> {
        let mut chain: Vec<(TreeId, Generation, RootItem)> = Vec::new();
        let mut cur = tree_id;
        loop {
            let (parent_gen, root) = match self.cbs.lookup_root(cx, cur) {
                Ok(found) => found,
                Err(err) if cur == tree_id => {
                    return Err(if err.is_not_found() {
                        RfsError::TreeMissing { tree: tree_id }
                    } else {
                        err
                    });
                }
                Err(err) => {
                    if self.lax {
                        // Best effort: the child becomes parentless.
                        return Ok(Ancestry {
                            chain,
                            loop_at: None,
                        });
                    }
                    return Err(if err.is_not_found() {
                        RfsError::TreeMissing { tree: cur }
                    } else {
                        err
                    });
                }
            };
            let parent_uuid = root.parent_uuid;
            chain.push((cur, parent_gen, root));
            if parent_uuid.is_zero() {
                return Ok(Ancestry {
                    chain,
                    loop_at: None,
                });
            }

            let parent = match self.cbs.lookup_uuid(cx, parent_uuid) {
                Ok(parent) => parent,
                Err(err) => {
                    if self.lax {
                        return Ok(Ancestry {
                            chain,
                            loop_at: None,
                        });
                    }
                    return Err(err);
                }
            };
            if chain.iter().any(|&(id, _, _)| id == parent) {
                if self.lax {
                    return Ok(Ancestry {
                        chain,
                        loop_at: Some(parent),
                    });
                }
                let mut path: Vec<TreeId> = chain.iter().map(|&(id, _, _)| id).collect();
                path.push(parent);
                return Err(RfsError::TreeLoop { path });
            }
            cur = parent;
        }
    }

    /// Whether a node claiming `(owner, gen)` may live in `tree`.
    ///
    /// The owner must be the tree itself, or an ancestor from which the
    /// tree was snapshotted no earlier than `gen`.
    pub fn is_owner_ok(
        &self,
        cx: &Cx,
        tree: &Arc<RebuiltTree>,
        owner: TreeId,
        gen: Generation,
    ) -> bool {
        let mut visited = BTreeSet::new();
        let mut cur = Arc::clone(tree);
        loop {
            if owner == cur.id {
                return true;
            }
            let Some(parent_id) = cur.parent else {
                return false;
            };
            if gen >= cur.parent_gen {
                return false;
            }
            if !visited.insert(cur.id) {
                return false;
            }
            cur = match self.rebuilt_tree(cx, parent_id) {
                Ok(parent) => parent,
                Err(_) => return false,
            };
        }
    }

    /// COW hops from `tree` up to `ancestor_id`; `None` if unrelated.
    #[must_use]
    pub fn cow_distance(
        &self,
        cx: &Cx,
        tree: &Arc<RebuiltTree>,
        ancestor_id: TreeId,
    ) -> Option<usize> {
        let mut visited = BTreeSet::new();
        let mut cur = Arc::clone(tree);
        let mut dist = 0;
        loop {
            if cur.id == ancestor_id {
                return Some(dist);
            }
            if !visited.insert(cur.id) {
                return None;
            }
            let parent_id = cur.parent?;
            cur = self.rebuilt_tree(cx, parent_id).ok()?;
            dist += 1;
        }
    }

    /// For every leaf in the graph that is ancestry-compatible with
    /// `tree`, the set of roots that reach it. Memoized per tree.
    pub fn leaf_to_roots(&self, cx: &Cx, tree: &Arc<RebuiltTree>) -> Arc<LeafMap> {
        if let Some(cached) = self.leaf_maps.lock().get(&tree.id) {
            return Arc::clone(cached);
        }

        info!(target: "rfs::rebuild", tree = %tree.id, "indexing nodes for tree");
        let mut index: HashMap<LogicalAddr, BTreeSet<LogicalAddr>> =
            HashMap::with_capacity(self.graph.len());
        for (addr, _) in self.graph.nodes() {
            self.index_node(cx, tree, addr, &mut index, &mut Vec::new());
        }

        let mut leaf_map = LeafMap::new();
        for (addr, roots) in index {
            let node = self.graph.node(addr).unwrap_or_else(|| {
                unreachable!("indexed a node that is not in the graph")
            });
            if node.level == 0 && !roots.is_empty() {
                leaf_map.insert(addr, roots);
            }
        }
        let leaf_map = Arc::new(leaf_map);
        self.leaf_maps
            .lock()
            .insert(tree.id, Arc::clone(&leaf_map));
        leaf_map
    }

    fn index_node(
        &self,
        cx: &Cx,
        tree: &Arc<RebuiltTree>,
        addr: LogicalAddr,
        index: &mut HashMap<LogicalAddr, BTreeSet<LogicalAddr>>,
        stack: &mut Vec<LogicalAddr>,
    ) {
        if index.contains_key(&addr) {
            return;
        }
        // The graph was checked for cycles; revisiting on the stack
        // means that check is broken.
        assert!(
            !stack.contains(&addr),
            "should not happen: node graph loop at {addr}"
        );
        let node = self.graph.node(addr).unwrap_or_else(|| {
            unreachable!("edge endpoints always have vertices")
        });
        if !self.is_owner_ok(cx, tree, node.owner, node.generation) {
            index.insert(addr, BTreeSet::new());
            return;
        }

        stack.push(addr);
        let mut roots = BTreeSet::new();
        let mut reached_from_above = false;
        for edge in self.graph.edges_to(addr) {
            let Some(from) = self.graph.node(edge.from_node) else {
                continue;
            };
            if !self.is_owner_ok(cx, tree, from.owner, from.generation) {
                continue;
            }
            self.index_node(cx, tree, edge.from_node, index, stack);
            if let Some(from_roots) = index.get(&edge.from_node) {
                if !from_roots.is_empty() {
                    roots.extend(from_roots.iter().copied());
                    reached_from_above = true;
                }
            }
        }
        stack.pop();

        if !reached_from_above {
            // Nothing owner-OK points here: the node roots itself.
            roots.insert(addr);
        }
        index.insert(addr, roots);
    }

    /// Accept `root` into `tree`, attaching every leaf it reaches and
    /// announcing each newly visible item key.
    ///
    /// Cancellation is checked while scanning the leaves; a cancelled
    /// call applies nothing, so completed `add_root`s stay consistent.
    pub fn add_root(&self, cx: &Cx, tree: &Arc<RebuiltTree>, root: LogicalAddr) -> Result<()> {
        let leaf_map = self.leaf_to_roots(cx, tree);

        let mut st = tree.state.lock();
        let mut new_leafs = Vec::new();
        for (leaf, roots) in leaf_map.iter() {
            cx.checkpoint().map_err(|_| RfsError::Cancelled)?;
            if st.leafs.contains(leaf) || !roots.contains(&root) {
                continue;
            }
            new_leafs.push(*leaf);
        }

        st.roots.insert(root);
        let mut added_items = 0_usize;
        for leaf in &new_leafs {
            st.leafs.insert(*leaf);
            let node = self.graph.node(*leaf).unwrap_or_else(|| {
                unreachable!("leaf map entries are graph vertices")
            });
            for &key in &node.item_keys {
                self.cbs.added_item(cx, tree.id, key);
                added_items += 1;
            }
        }
        drop(st);

        info!(
            target: "rfs::rebuild",
            tree = %tree.id,
            %root,
            added_leafs = new_leafs.len(),
            added_items,
            "root added"
        );
        self.cbs.added_root(cx, tree.id, root);
        Ok(())
    }

    /// The key→item index over the tree's *attached* leaves.
    ///
    /// Key conflicts keep the entry whose leaf is COW-closest to the
    /// tree, breaking ties by higher generation.
    pub fn items(&self, cx: &Cx, tree: &Arc<RebuiltTree>) -> BTreeMap<Key, ItemPtr> {
        let leaves: Vec<LogicalAddr> = tree.state.lock().leafs.iter().copied().collect();
        self.extend_items(cx, &self.inc_items, tree, &leaves)
    }

    /// The key→item index over *every* ancestry-compatible leaf:
    /// what the tree could see after further `add_root` calls.
    pub fn potential_items(&self, cx: &Cx, tree: &Arc<RebuiltTree>) -> BTreeMap<Key, ItemPtr> {
        let leaves: Vec<LogicalAddr> =
            self.leaf_to_roots(cx, tree).keys().copied().collect();
        self.extend_items(cx, &self.all_items, tree, &leaves)
    }

    fn extend_items(
        &self,
        cx: &Cx,
        cache: &Mutex<HashMap<TreeId, ItemIndex>>,
        tree: &Arc<RebuiltTree>,
        leaves: &[LogicalAddr],
    ) -> BTreeMap<Key, ItemPtr> {
        let mut indexes = cache.lock();
        let index = indexes.entry(tree.id).or_default();
        for &leaf in leaves {
            if !index.seen.insert(leaf) {
                continue;
            }
            let node = self.graph.node(leaf).unwrap_or_else(|| {
                unreachable!("leaf lists only contain graph vertices")
            });
            for (slot, &key) in node.item_keys.iter().enumerate() {
                let new_ptr = ItemPtr { node: leaf, slot };
                match index.map.get(&key) {
                    None => {
                        index.map.insert(key, new_ptr);
                    }
                    Some(old_ptr) => {
                        index.dups += 1;
                        if self.should_replace(cx, tree, old_ptr.node, leaf) {
                            index.map.insert(key, new_ptr);
                        }
                    }
                }
            }
        }
        index.map.clone()
    }

    fn should_replace(
        &self,
        cx: &Cx,
        tree: &Arc<RebuiltTree>,
        old_node: LogicalAddr,
        new_node: LogicalAddr,
    ) -> bool {
        let node = |addr: LogicalAddr| {
            self.graph.node(addr).unwrap_or_else(|| {
                unreachable!("dup resolution only sees graph vertices")
            })
        };
        let old_dist = self.cow_distance(cx, tree, node(old_node).owner).unwrap_or(0);
        let new_dist = self.cow_distance(cx, tree, node(new_node).owner).unwrap_or(0);
        match new_dist.cmp(&old_dist) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => {
                let old_gen = node(old_node).generation;
                let new_gen = node(new_node).generation;
                match new_gen.cmp(&old_gen) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => panic!(
                        "should not happen: dup nodes in tree={}: old={old_node} new={new_node}",
                        tree.id
                    ),
                }
            }
        }
    }

    /// Read the current body of the item at `key`, through the node
    /// cache.
    #[must_use]
    pub fn read_item(&self, cx: &Cx, tree: &Arc<RebuiltTree>, key: Key) -> Option<ItemBody> {
        let ptr = *self.items(cx, tree).get(&key)?;
        let fs = self
            .fs
            .as_ref()
            .unwrap_or_else(|| panic!("should not happen: read_item without a node source"));
        let node = fs
            .acquire_node(cx, ptr.node, &NodeExpectations::at(ptr.node))
            .ok()?;
        node.leaf_items().get(ptr.slot).map(|item| item.body.clone())
    }

    /// The roots whose addition would attach `leaf`; empty if none
    /// would help.
    #[must_use]
    pub fn leaf_to_roots_for(
        &self,
        cx: &Cx,
        tree: &Arc<RebuiltTree>,
        leaf: LogicalAddr,
    ) -> BTreeSet<LogicalAddr> {
        let node = self.graph.node(leaf).unwrap_or_else(|| {
            panic!("should not happen: leaf {leaf} is not in the graph")
        });
        assert!(
            node.level == 0,
            "should not happen: leaf_to_roots_for on non-leaf {leaf}"
        );

        let leaf_map = self.leaf_to_roots(cx, tree);
        let st = tree.state.lock();
        let mut out = BTreeSet::new();
        if let Some(roots) = leaf_map.get(&leaf) {
            for root in roots {
                assert!(
                    !st.roots.contains(root),
                    "should not happen: tree {} contains root {root} but not leaf {leaf}",
                    tree.id
                );
                out.insert(*root);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testutil::{internal_node, leaf_node};
    use rfs_types::{ItemType, ObjectId};

    fn uuid(n: u8) -> Uuid {
        let mut bytes = [0_u8; 16];
        bytes[15] = n;
        Uuid(bytes)
    }

    fn ik(obj: u64) -> Key {
        Key::new(ObjectId(obj), ItemType::INODE_ITEM, 0)
    }

    struct MockRoot {
        id: TreeId,
        uuid: Uuid,
        parent_uuid: Uuid,
        parent_gen: u64,
    }

    struct MockCbs {
        roots: Vec<MockRoot>,
        fail_root: Option<TreeId>,
        added_items: Mutex<Vec<(TreeId, Key)>>,
        added_roots: Mutex<Vec<(TreeId, LogicalAddr)>>,
    }

    impl MockCbs {
        fn new(roots: Vec<MockRoot>) -> Arc<Self> {
            Arc::new(Self {
                roots,
                fail_root: None,
                added_items: Mutex::new(Vec::new()),
                added_roots: Mutex::new(Vec::new()),
            })
        }
    }

    impl RebuildCallbacks for MockCbs {
        fn added_item(&self, _cx: &Cx, tree: TreeId, key: Key) {
            self.added_items.lock().push((tree, key));
        }

        fn added_root(&self, _cx: &Cx, tree: TreeId, root: LogicalAddr) {
            self.added_roots.lock().push((tree, root));
        }

        fn lookup_root(&self, _cx: &Cx, tree: TreeId) -> Result<(Generation, RootItem)> {
            if self.fail_root == Some(tree) {
                return Err(RfsError::TreeMissing { tree });
            }
            self.roots
                .iter()
                .find(|r| r.id == tree)
                .map(|r| {
                    (
                        Generation(r.parent_gen),
                        RootItem {
                            generation: Generation(2000),
                            uuid: r.uuid,
                            parent_uuid: r.parent_uuid,
                            ..RootItem::default()
                        },
                    )
                })
                .ok_or(RfsError::TreeMissing { tree })
        }

        fn lookup_uuid(&self, _cx: &Cx, uuid: Uuid) -> Result<TreeId> {
            self.roots
                .iter()
                .find(|r| r.uuid == uuid)
                .map(|r| r.id)
                .ok_or(RfsError::ItemMissing {
                    tree: ObjectId::UUID_TREE,
                    key: uuid.key_for_subvol(),
                })
        }
    }

    /// 303 → 305 → 304 → 303: a parent cycle under 306.
    fn cycle_cbs() -> Arc<MockCbs> {
        MockCbs::new(vec![
            MockRoot {
                id: ObjectId(306),
                uuid: uuid(6),
                parent_uuid: uuid(5),
                parent_gen: 1005,
            },
            MockRoot {
                id: ObjectId(305),
                uuid: uuid(5),
                parent_uuid: uuid(4),
                parent_gen: 1004,
            },
            MockRoot {
                id: ObjectId(304),
                uuid: uuid(4),
                parent_uuid: uuid(3),
                parent_gen: 1003,
            },
            MockRoot {
                id: ObjectId(303),
                uuid: uuid(3),
                parent_uuid: uuid(5),
                parent_gen: 1002,
            },
        ])
    }

    fn ids(path: &[u64]) -> Vec<TreeId> {
        path.iter().map(|&id| ObjectId(id)).collect()
    }

    #[test]
    fn strict_mode_fails_every_tree_on_the_cycle() {
        let cx = Cx::for_testing();
        let forrest = RebuiltForrest::new(None, Arc::new(Graph::new()), cycle_cbs(), false);

        let err = forrest.rebuilt_tree(&cx, ObjectId(306)).unwrap_err();
        assert!(
            matches!(&err, RfsError::TreeLoop { path } if *path == ids(&[306, 305, 304, 303, 305])),
            "got: {err}"
        );

        for (id, want_path) in [
            (305_u64, &[305, 304, 303, 305][..]),
            (304, &[304, 303, 305, 304]),
            (303, &[303, 305, 304, 303]),
        ] {
            let err = forrest.rebuilt_tree(&cx, ObjectId(id)).unwrap_err();
            assert!(
                matches!(&err, RfsError::TreeLoop { path } if *path == ids(want_path)),
                "tree {id}: got {err}"
            );
        }
    }

    #[test]
    fn lax_mode_truncates_the_ancestor_chain() {
        let cx = Cx::for_testing();
        let forrest = RebuiltForrest::new(None, Arc::new(Graph::new()), cycle_cbs(), true);

        let tree = forrest.rebuilt_tree(&cx, ObjectId(306)).expect("lax build");
        assert!(tree.ancestor_loop);
        assert_eq!(tree.ancestor_root, Some(ObjectId(303)));
        assert_eq!(tree.parent, Some(ObjectId(305)));

        for (id, want_root) in [(305_u64, 303_u64), (304, 305), (303, 304)] {
            let tree = forrest.rebuilt_tree(&cx, ObjectId(id)).expect("lax build");
            assert!(tree.ancestor_loop, "tree {id}");
            assert_eq!(tree.ancestor_root, Some(ObjectId(want_root)), "tree {id}");
        }
    }

    #[test]
    fn missing_parent_fails_strict_but_not_lax() {
        let make_cbs = |fail: Option<TreeId>| {
            let mut cbs = MockCbs::new(vec![
                MockRoot {
                    id: ObjectId(305),
                    uuid: uuid(5),
                    parent_uuid: uuid(4),
                    parent_gen: 1004,
                },
                MockRoot {
                    id: ObjectId(304),
                    uuid: uuid(4),
                    parent_uuid: Uuid::ZERO,
                    parent_gen: 0,
                },
            ]);
            Arc::get_mut(&mut cbs).expect("sole owner").fail_root = fail;
            cbs
        };

        let cx = Cx::for_testing();
        let strict = RebuiltForrest::new(
            None,
            Arc::new(Graph::new()),
            make_cbs(Some(ObjectId(304))),
            false,
        );
        let err = strict.rebuilt_tree(&cx, ObjectId(305)).unwrap_err();
        assert!(matches!(err, RfsError::TreeMissing { tree } if tree == ObjectId(304)));

        let lax = RebuiltForrest::new(
            None,
            Arc::new(Graph::new()),
            make_cbs(Some(ObjectId(304))),
            true,
        );
        let tree = lax.rebuilt_tree(&cx, ObjectId(305)).expect("lax build");
        assert_eq!(tree.parent, None);
        assert!(!tree.ancestor_loop);
    }

    /// R(internal, owner 5) → A(leaf); B an orphan leaf of tree 5;
    /// C a leaf owned by a stranger tree.
    fn engine_graph() -> Arc<Graph> {
        let mut graph = Graph::new();
        graph.insert_node(&leaf_node(0x1000, ObjectId(5), 7, &[ik(1), ik(2)]));
        graph.insert_node(&internal_node(
            0x2000,
            ObjectId(5),
            7,
            1,
            &[(ik(1), 0x1000, 7)],
        ));
        graph.insert_node(&leaf_node(0x3000, ObjectId(5), 7, &[ik(3)]));
        graph.insert_node(&leaf_node(0x4000, ObjectId(42), 7, &[ik(4)]));
        Arc::new(graph)
    }

    fn solo_tree_cbs() -> Arc<MockCbs> {
        MockCbs::new(vec![MockRoot {
            id: ObjectId(5),
            uuid: uuid(50),
            parent_uuid: Uuid::ZERO,
            parent_gen: 0,
        }])
    }

    #[test]
    fn add_root_attaches_reachable_leaves_and_announces_items() {
        let cx = Cx::for_testing();
        let cbs = solo_tree_cbs();
        let forrest = RebuiltForrest::new(None, engine_graph(), Arc::clone(&cbs) as _, false);
        let tree = forrest.rebuilt_tree(&cx, ObjectId(5)).expect("tree 5");

        let leaf_map = forrest.leaf_to_roots(&cx, &tree);
        assert_eq!(
            leaf_map.get(&LogicalAddr(0x1000)),
            Some(&BTreeSet::from([LogicalAddr(0x2000)]))
        );
        assert_eq!(
            leaf_map.get(&LogicalAddr(0x3000)),
            Some(&BTreeSet::from([LogicalAddr(0x3000)]))
        );
        assert!(
            !leaf_map.contains_key(&LogicalAddr(0x4000)),
            "stranger-owned leaves are not ancestry-compatible"
        );

        forrest.add_root(&cx, &tree, LogicalAddr(0x2000)).expect("add root");
        assert_eq!(tree.roots(), BTreeSet::from([LogicalAddr(0x2000)]));
        assert_eq!(tree.leafs(), BTreeSet::from([LogicalAddr(0x1000)]));
        assert_eq!(
            *cbs.added_items.lock(),
            vec![(ObjectId(5), ik(1)), (ObjectId(5), ik(2))]
        );
        assert_eq!(
            *cbs.added_roots.lock(),
            vec![(ObjectId(5), LogicalAddr(0x2000))]
        );

        let items = forrest.items(&cx, &tree);
        assert_eq!(items.len(), 2);
        assert_eq!(
            items.get(&ik(1)),
            Some(&ItemPtr {
                node: LogicalAddr(0x1000),
                slot: 0
            })
        );

        // Every attached item appears among the potential items with
        // the same pointer.
        let potential = forrest.potential_items(&cx, &tree);
        for (key, ptr) in &items {
            assert_eq!(potential.get(key), Some(ptr));
        }
        assert!(potential.contains_key(&ik(3)));
        assert!(!potential.contains_key(&ik(4)));

        // The orphan leaf roots itself; adding it attaches its items.
        let candidates = forrest.leaf_to_roots_for(&cx, &tree, LogicalAddr(0x3000));
        assert_eq!(candidates, BTreeSet::from([LogicalAddr(0x3000)]));
        forrest.add_root(&cx, &tree, LogicalAddr(0x3000)).expect("add root");
        assert!(forrest.items(&cx, &tree).contains_key(&ik(3)));
        assert_eq!(
            tree.leafs(),
            BTreeSet::from([LogicalAddr(0x1000), LogicalAddr(0x3000)])
        );
    }

    #[test]
    fn duplicate_keys_resolve_to_the_higher_generation() {
        let cx = Cx::for_testing();
        let mut graph = Graph::new();
        graph.insert_node(&leaf_node(0x1000, ObjectId(5), 7, &[ik(1)]));
        graph.insert_node(&leaf_node(0x5000, ObjectId(5), 9, &[ik(1)]));
        let forrest =
            RebuiltForrest::new(None, Arc::new(graph), solo_tree_cbs() as _, false);
        let tree = forrest.rebuilt_tree(&cx, ObjectId(5)).expect("tree 5");

        forrest.add_root(&cx, &tree, LogicalAddr(0x1000)).expect("add root");
        forrest.add_root(&cx, &tree, LogicalAddr(0x5000)).expect("add root");

        let items = forrest.items(&cx, &tree);
        assert_eq!(
            items.get(&ik(1)),
            Some(&ItemPtr {
                node: LogicalAddr(0x5000),
                slot: 0
            })
        );
    }

    #[test]
    #[should_panic(expected = "should not happen: dup nodes")]
    fn equal_distance_equal_generation_duplicates_panic() {
        let cx = Cx::for_testing();
        let mut graph = Graph::new();
        graph.insert_node(&leaf_node(0x1000, ObjectId(5), 7, &[ik(1)]));
        graph.insert_node(&leaf_node(0x5000, ObjectId(5), 7, &[ik(1)]));
        let forrest =
            RebuiltForrest::new(None, Arc::new(graph), solo_tree_cbs() as _, false);
        let tree = forrest.rebuilt_tree(&cx, ObjectId(5)).expect("tree 5");

        forrest.add_root(&cx, &tree, LogicalAddr(0x1000)).expect("add root");
        forrest.add_root(&cx, &tree, LogicalAddr(0x5000)).expect("add root");
        let _ = forrest.items(&cx, &tree);
    }

    #[test]
    fn owner_ok_respects_snapshot_generations() {
        let cx = Cx::for_testing();
        // Tree 256 was snapshotted off tree 5 at generation 1000.
        let cbs = MockCbs::new(vec![
            MockRoot {
                id: ObjectId(5),
                uuid: uuid(50),
                parent_uuid: Uuid::ZERO,
                parent_gen: 0,
            },
            MockRoot {
                id: ObjectId(256),
                uuid: uuid(60),
                parent_uuid: uuid(50),
                parent_gen: 1000,
            },
        ]);
        let forrest = RebuiltForrest::new(None, Arc::new(Graph::new()), cbs as _, false);
        let snap = forrest.rebuilt_tree(&cx, ObjectId(256)).expect("snapshot");

        // Own id: always fine.
        assert!(forrest.is_owner_ok(&cx, &snap, ObjectId(256), Generation(5000)));
        // Parent-owned nodes written before the snapshot: fine.
        assert!(forrest.is_owner_ok(&cx, &snap, ObjectId(5), Generation(999)));
        // Parent-owned nodes written at/after the snapshot: rejected.
        assert!(!forrest.is_owner_ok(&cx, &snap, ObjectId(5), Generation(1000)));
        // Strangers: rejected.
        assert!(!forrest.is_owner_ok(&cx, &snap, ObjectId(7), Generation(1)));

        assert_eq!(forrest.cow_distance(&cx, &snap, ObjectId(256)), Some(0));
        assert_eq!(forrest.cow_distance(&cx, &snap, ObjectId(5)), Some(1));
        assert_eq!(forrest.cow_distance(&cx, &snap, ObjectId(9)), None);
    }
}
