#![forbid(unsafe_code)]
//! The old-rebuilt forrest.
//!
//! When the on-disk structure is partially broken, descent-based lookups
//! miss items that a full walk can still reach. This crate walks each
//! tree once on first access, indexing every item by key and every
//! unreadable subtree by the key interval it was expected to cover, and
//! then serves lookups from the index. Queries overlapping a recorded
//! bad interval report those errors alongside their results, so callers
//! can tell "absent" from "unreadable".

use asupersync::Cx;
use parking_lot::Mutex;
use rfs_container::IntervalMap;
use rfs_error::{Result, RfsError};
use rfs_ondisk::{ItemBody, LeafItem, Node, RootItem, KeyPointer};
use rfs_tree::{
    lookup_tree_root, Item, NodeExpectations, OwnerCheck, RawTree, Searcher, TreeFs, TreeRoot,
    WalkHandler, WalkPath,
};
use rfs_types::{Generation, Key, LogicalAddr, ObjectId, TreeId, Uuid};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Identity of the leaf a value was indexed from; enough to re-acquire
/// the node with exact expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedNode {
    pub laddr: LogicalAddr,
    pub level: u8,
    pub generation: Generation,
    pub owner: TreeId,
    pub min_item: Key,
    pub max_item: Key,
}

/// One indexed item: its key and where its body lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexValue {
    pub key: Key,
    pub item_size: u32,
    pub node: IndexedNode,
    pub slot: usize,
}

/// An unreadable subtree, remembered under its expected key interval.
#[derive(Debug, Clone)]
pub struct IndexError {
    pub min: Key,
    pub max: Key,
    pub err: RfsError,
}

/// One tree's immutable index, built by a single full walk.
pub struct OldRebuiltTree {
    fs: Arc<TreeFs>,
    pub id: TreeId,
    pub parent_uuid: Uuid,
    pub parent_gen: Generation,
    root_err: Option<RfsError>,
    /// Sorted by key; binary-searched with searcher predicates.
    items: Vec<IndexValue>,
    errors: IntervalMap<Key, IndexError>,
}

impl OldRebuiltTree {
    /// The root-resolution failure, if the tree could not be indexed.
    #[must_use]
    pub fn root_err(&self) -> Option<&RfsError> {
        self.root_err.as_ref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Indexed values matching `searcher`, in key order (no bodies read).
    #[must_use]
    pub fn matching_values(&self, searcher: &Searcher) -> &[IndexValue] {
        let beg = self
            .items
            .partition_point(|v| searcher.cmp(v.key, v.item_size) == Ordering::Greater);
        let len = self.items[beg..]
            .iter()
            .take_while(|v| searcher.cmp(v.key, v.item_size) == Ordering::Equal)
            .count();
        &self.items[beg..beg + len]
    }

    /// Errors whose recorded interval overlaps the searcher's range.
    fn overlapping_errors(&self, searcher: &Searcher) -> Vec<RfsError> {
        self.errors
            .iter()
            .filter(|(min, max, _)| {
                searcher.cmp(*min, 0) != Ordering::Less
                    && searcher.cmp(*max, 0) != Ordering::Greater
            })
            .map(|(_, _, e)| e.err.clone())
            .collect()
    }

    /// Read one item's current body back through the node cache.
    ///
    /// Panics if the node that was readable during indexing no longer
    /// satisfies its recorded identity; that means the cache and the
    /// index disagree, which is a bug.
    #[must_use]
    pub fn read_value(&self, cx: &Cx, value: &IndexValue) -> Item {
        let node = self.acquire_indexed(cx, &value.node);
        let item = &node.leaf_items()[value.slot];
        Item {
            key: item.key,
            data_size: item.data_size,
            body: item.body.clone(),
        }
    }

    fn acquire_indexed<'a>(
        &'a self,
        cx: &Cx,
        summary: &IndexedNode,
    ) -> rfs_tree::NodeGuard<'a> {
        let exp = NodeExpectations {
            laddr: Some(summary.laddr),
            level: Some(summary.level),
            generation: Some(summary.generation),
            owner: Some(OwnerCheck::Exact(summary.owner, summary.generation)),
            min_item: Some(summary.min_item),
            max_item: Some(summary.max_item),
        };
        match self.fs.acquire_node(cx, summary.laddr, &exp) {
            Ok(node) => node,
            Err(err) => panic!(
                "should not happen: indexed node at {} no longer reads: {err}",
                summary.laddr
            ),
        }
    }

    /// Point lookup: the unique item matching `searcher`.
    ///
    /// A miss carries every recorded bad interval overlapping the search
    /// range, so "unreadable" is distinguishable from "absent".
    pub fn search(&self, cx: &Cx, searcher: &Searcher) -> Result<Item> {
        if let Some(err) = &self.root_err {
            return Err(err.clone());
        }
        match self.matching_values(searcher).first() {
            Some(value) => Ok(self.read_value(cx, value)),
            None => {
                let miss = RfsError::ItemMissing {
                    tree: self.id,
                    key: searcher.representative(),
                };
                RfsError::aggregate(self.overlapping_errors(searcher), Some(miss))
                    .map(|()| unreachable!("miss error is always present"))
            }
        }
    }

    pub fn lookup(&self, cx: &Cx, key: Key) -> Result<Item> {
        self.search(cx, &Searcher::exact_key(key))
    }

    /// Range lookup: every matching item, plus any overlapping interval
    /// errors as an out-of-band composite error.
    pub fn search_all(&self, cx: &Cx, searcher: &Searcher) -> (Vec<Item>, Option<RfsError>) {
        if let Some(err) = &self.root_err {
            return (Vec::new(), Some(err.clone()));
        }
        let values = self.matching_values(searcher);

        let mut out = Vec::with_capacity(values.len());
        let mut guard: Option<(LogicalAddr, rfs_tree::NodeGuard<'_>)> = None;
        for value in values {
            let reuse = matches!(&guard, Some((laddr, _)) if *laddr == value.node.laddr);
            if !reuse {
                guard = Some((value.node.laddr, self.acquire_indexed(cx, &value.node)));
            }
            let (_, node) = guard.as_ref().unwrap_or_else(|| {
                unreachable!("guard was just installed")
            });
            let item = &node.leaf_items()[value.slot];
            out.push(Item {
                key: item.key,
                data_size: item.data_size,
                body: item.body.clone(),
            });
        }

        let mut errs = self.overlapping_errors(searcher);
        if out.is_empty() {
            errs.push(RfsError::ItemMissing {
                tree: self.id,
                key: searcher.representative(),
            });
        }
        (out, RfsError::aggregate(errs, None).err())
    }

    /// Visit every indexed item in key order, acquiring each leaf once.
    ///
    /// The visitor returns `false` to stop.
    pub fn walk_items(
        &self,
        cx: &Cx,
        visit: &mut dyn FnMut(&IndexValue, Item) -> bool,
    ) -> Result<()> {
        if let Some(err) = &self.root_err {
            return Err(err.clone());
        }
        let mut guard: Option<(LogicalAddr, rfs_tree::NodeGuard<'_>)> = None;
        for value in &self.items {
            cx.checkpoint().map_err(|_| RfsError::Cancelled)?;
            let reuse = matches!(&guard, Some((laddr, _)) if *laddr == value.node.laddr);
            if !reuse {
                guard = Some((value.node.laddr, self.acquire_indexed(cx, &value.node)));
            }
            let (_, node) = guard.as_ref().unwrap_or_else(|| {
                unreachable!("guard was just installed")
            });
            let item = &node.leaf_items()[value.slot];
            let keep_going = visit(
                value,
                Item {
                    key: item.key,
                    data_size: item.data_size,
                    body: item.body.clone(),
                },
            );
            if !keep_going {
                break;
            }
        }
        Ok(())
    }
}

/// Walk handler that fills one tree's index.
struct Indexer {
    tree_id: TreeId,
    cur: Option<IndexedNode>,
    items: BTreeMap<Key, IndexValue>,
    errors: IntervalMap<Key, IndexError>,
}

impl WalkHandler for Indexer {
    fn node(&mut self, _path: &WalkPath, node: &Node) {
        self.cur = Some(IndexedNode {
            laddr: node.head.addr,
            level: node.head.level,
            generation: node.head.generation,
            owner: node.head.owner,
            min_item: node.min_item_key().unwrap_or(Key::MIN),
            max_item: node.max_item_key().unwrap_or(Key::MAX),
        });
    }

    fn bad_node(&mut self, path: &WalkPath, err: &RfsError) {
        let (min, max) = path.expected_key_range();
        debug!(target: "rfs::index", tree = %self.tree_id, %min, %max, %err, "bad node");
        self.errors.insert(
            min,
            max,
            IndexError {
                min,
                max,
                err: err.clone(),
            },
        );
    }

    fn key_pointer(&mut self, _path: &WalkPath, _kp: &KeyPointer) -> bool {
        true
    }

    fn item(&mut self, _path: &WalkPath, slot: usize, item: &LeafItem) {
        let node = self.cur.unwrap_or_else(|| {
            unreachable!("item events always follow a node event")
        });
        let value = IndexValue {
            key: item.key,
            item_size: item.data_size,
            node,
            slot,
        };
        // A duplicate key within one tree means the index itself is
        // broken, not the data; crash loudly.
        assert!(
            self.items.insert(item.key, value).is_none(),
            "should not happen: dup key={} in tree={}",
            item.key,
            self.tree_id,
        );
    }

    fn bad_item(&mut self, path: &WalkPath, slot: usize, item: &LeafItem) {
        // Undecodable bodies are still indexed; readers see the Error
        // body and decide.
        self.item(path, slot, item);
    }
}

/// Caches one [`OldRebuiltTree`] per tree id; the ROOT tree has a
/// dedicated slot because indexing any other tree consults it.
pub struct OldRebuiltForrest {
    fs: Arc<TreeFs>,
    root_tree: Mutex<Option<Arc<OldRebuiltTree>>>,
    trees: Mutex<HashMap<TreeId, Arc<OldRebuiltTree>>>,
}

impl OldRebuiltForrest {
    #[must_use]
    pub fn new(fs: Arc<TreeFs>) -> Arc<Self> {
        Arc::new(Self {
            fs,
            root_tree: Mutex::new(None),
            trees: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn fs(&self) -> &Arc<TreeFs> {
        &self.fs
    }

    /// The (possibly failed) index for `tree_id`, building it on first
    /// access. Terminal states are cached either way.
    pub fn tree(&self, cx: &Cx, tree_id: TreeId) -> Arc<OldRebuiltTree> {
        if tree_id == ObjectId::ROOT_TREE {
            let mut slot = self.root_tree.lock();
            if let Some(tree) = slot.as_ref() {
                return Arc::clone(tree);
            }
            let tree = Arc::new(self.index_tree(cx, tree_id));
            *slot = Some(Arc::clone(&tree));
            tree
        } else {
            let mut trees = self.trees.lock();
            if let Some(tree) = trees.get(&tree_id) {
                return Arc::clone(tree);
            }
            let tree = Arc::new(self.index_tree(cx, tree_id));
            trees.insert(tree_id, Arc::clone(&tree));
            tree
        }
    }

    fn index_tree(&self, cx: &Cx, tree_id: TreeId) -> OldRebuiltTree {
        info!(target: "rfs::index", tree = %tree_id, "indexing tree");
        let mut tree = OldRebuiltTree {
            fs: Arc::clone(&self.fs),
            id: tree_id,
            parent_uuid: Uuid::ZERO,
            parent_gen: Generation(0),
            root_err: None,
            items: Vec::new(),
            errors: IntervalMap::new(),
        };

        let root = match self.lookup_root(cx, tree_id) {
            Ok(root) => root,
            Err(err) => {
                tree.root_err = Some(err);
                return tree;
            }
        };
        tree.parent_uuid = root.parent_uuid;
        tree.parent_gen = root.parent_gen;

        let mut indexer = Indexer {
            tree_id,
            cur: None,
            items: BTreeMap::new(),
            errors: IntervalMap::new(),
        };
        let raw = RawTree::from_root(&self.fs, root);
        if let Err(err) = raw.walk(cx, &mut indexer) {
            tree.root_err = Some(err);
            return tree;
        }

        tree.items = indexer.items.into_values().collect();
        tree.errors = indexer.errors;
        info!(
            target: "rfs::index",
            tree = %tree_id,
            items = tree.items.len(),
            errors = tree.errors.len(),
            "done indexing tree"
        );
        tree
    }

    /// Root lookup that goes through the *indexed* ROOT tree, so broken
    /// ROOT trees still resolve whatever a full walk can reach.
    fn lookup_root(&self, cx: &Cx, tree_id: TreeId) -> Result<TreeRoot> {
        if tree_id.is_well_known_tree() {
            return lookup_tree_root(cx, &self.fs, tree_id);
        }
        let (parent_gen, root) = self.lookup_root_item(cx, tree_id)?;
        Ok(TreeRoot {
            id: tree_id,
            root_node: root.bytenr,
            level: root.level,
            generation: root.generation,
            root_dir_id: root.root_dirid,
            uuid: root.uuid,
            parent_uuid: root.parent_uuid,
            parent_gen,
        })
    }

    /// The ROOT_ITEM for `tree_id` out of the indexed ROOT tree, with
    /// the parent generation recorded in the item's key offset.
    pub fn lookup_root_item(&self, cx: &Cx, tree_id: TreeId) -> Result<(Generation, RootItem)> {
        let root_tree = self.tree(cx, ObjectId::ROOT_TREE);
        let item = match root_tree.search(cx, &Searcher::root_item(tree_id)) {
            Ok(item) => item,
            Err(err) if err.is_not_found() => {
                return Err(RfsError::TreeMissing { tree: tree_id })
            }
            Err(err) => return Err(err),
        };
        match item.body {
            ItemBody::Root(root) => Ok((Generation(item.key.offset), root)),
            ItemBody::Error(_) => Err(RfsError::TreeMissing { tree: tree_id }),
            _ => unreachable!("should not happen: ROOT_ITEM decoded to a non-root body"),
        }
    }

    /// Map a subvolume UUID to its tree id via the indexed UUID tree.
    pub fn lookup_uuid(&self, cx: &Cx, uuid: Uuid) -> Result<TreeId> {
        let uuid_tree = self.tree(cx, ObjectId::UUID_TREE);
        let item = uuid_tree.search(cx, &Searcher::exact_key(uuid.key_for_subvol()))?;
        match item.body {
            ItemBody::UuidMap(map) => map.subvol_ids.first().copied().ok_or_else(|| {
                RfsError::ItemMissing {
                    tree: ObjectId::UUID_TREE,
                    key: uuid.key_for_subvol(),
                }
            }),
            _ => Err(RfsError::ItemMissing {
                tree: ObjectId::UUID_TREE,
                key: uuid.key_for_subvol(),
            }),
        }
    }

    /// Decide whether a node claiming `(owner, gen)` is acceptable in
    /// `tree_id`, walking the parent-UUID chain.
    ///
    /// `fail_open` suppresses "cannot determine" failures for
    /// best-effort mounts; a genuinely wrong owner still fails.
    pub fn check_owner(
        &self,
        cx: &Cx,
        tree_id: TreeId,
        fail_open: bool,
        owner: TreeId,
        gen: Generation,
        laddr: LogicalAddr,
    ) -> Result<()> {
        let mut tree = self.tree(cx, tree_id);
        loop {
            if owner == tree.id {
                return Ok(());
            }
            if tree.parent_uuid.is_zero() {
                return Err(RfsError::NodeExpectation {
                    field: "owner",
                    expected: format!("an ancestor of tree {tree_id}"),
                    actual: owner.to_string(),
                    laddr,
                });
            }
            if gen > tree.parent_gen {
                return Err(RfsError::NodeExpectation {
                    field: "owner",
                    expected: format!(
                        "owner={owner} with generation<={}",
                        tree.parent_gen
                    ),
                    actual: format!("owner={owner} generation={gen}"),
                    laddr,
                });
            }

            let uuid_tree = self.tree(cx, ObjectId::UUID_TREE);
            if uuid_tree.root_err().is_some() {
                // No UUID tree at all: nothing to check against.
                return Ok(());
            }
            let parent_id = match self.lookup_uuid(cx, tree.parent_uuid) {
                Ok(id) => id,
                Err(_) if fail_open => return Ok(()),
                Err(err) => return Err(err),
            };
            let parent = self.tree(cx, parent_id);
            if let Some(err) = parent.root_err() {
                if fail_open {
                    return Ok(());
                }
                return Err(err.clone());
            }
            tree = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfs_tree::synth::{
        inode_item_body, key, root_item_body, test_cx, uuid_map_body, SynthFs,
    };
    use rfs_types::ItemType;

    const GEN: Generation = Generation(100);

    /// A ROOT tree with FS-tree and UUID-tree roots; the FS tree has a
    /// mis-ordered sibling layout a plain descent would misnavigate,
    /// plus an optional corrupt leaf.
    fn build(corrupt_leaf: bool) -> (Arc<TreeFs>, Arc<OldRebuiltForrest>) {
        let mut synth = SynthFs::new(4096);
        let fs_uuid = Uuid([0x05; 16]);

        synth.leaf(
            LogicalAddr(0x1_0000),
            ObjectId::ROOT_TREE,
            GEN,
            &[
                (
                    key(5, ItemType::ROOT_ITEM, 0),
                    root_item_body(
                        LogicalAddr(0x3_0000),
                        1,
                        GEN,
                        ObjectId(256),
                        fs_uuid,
                        Uuid::ZERO,
                    ),
                ),
                (
                    key(9, ItemType::ROOT_ITEM, 0),
                    root_item_body(
                        LogicalAddr(0x6_0000),
                        0,
                        GEN,
                        ObjectId(0),
                        Uuid([0x09; 16]),
                        Uuid::ZERO,
                    ),
                ),
            ],
        );

        // FS tree: a one-level tree over two leaves.
        synth.internal(
            LogicalAddr(0x3_0000),
            ObjectId::FS_TREE,
            GEN,
            1,
            &[
                (key(256, ItemType::INODE_ITEM, 0), LogicalAddr(0x4_0000), GEN),
                (key(270, ItemType::INODE_ITEM, 0), LogicalAddr(0x5_0000), GEN),
            ],
        );
        synth.leaf(
            LogicalAddr(0x4_0000),
            ObjectId::FS_TREE,
            GEN,
            &[(key(256, ItemType::INODE_ITEM, 0), inode_item_body(0))],
        );
        synth.leaf(
            LogicalAddr(0x5_0000),
            ObjectId::FS_TREE,
            GEN,
            &[
                (key(270, ItemType::INODE_ITEM, 0), inode_item_body(0)),
                (key(280, ItemType::INODE_ITEM, 0), inode_item_body(0)),
            ],
        );

        // UUID tree maps the FS tree's uuid back to id 5.
        synth.leaf(
            LogicalAddr(0x6_0000),
            ObjectId::UUID_TREE,
            GEN,
            &[(
                fs_uuid.key_for_subvol(),
                uuid_map_body(ObjectId::FS_TREE),
            )],
        );

        if corrupt_leaf {
            synth.corrupt_block(LogicalAddr(0x5_0000));
        }
        let fs = synth.build(LogicalAddr(0x1_0000), 0);
        let forrest = OldRebuiltForrest::new(Arc::clone(&fs));
        (fs, forrest)
    }

    #[test]
    fn index_serves_point_lookups() {
        let cx = test_cx();
        let (_fs, forrest) = build(false);
        let tree = forrest.tree(&cx, ObjectId::FS_TREE);
        assert!(tree.root_err().is_none());
        assert_eq!(tree.len(), 3);

        let item = tree
            .lookup(&cx, key(280, ItemType::INODE_ITEM, 0))
            .expect("indexed item");
        assert!(matches!(item.body, ItemBody::Inode(_)));

        let miss = tree.lookup(&cx, key(999, ItemType::INODE_ITEM, 0)).unwrap_err();
        assert!(miss.is_not_found());
    }

    #[test]
    fn bad_intervals_surface_on_overlapping_queries() {
        let cx = test_cx();
        let (_fs, forrest) = build(true);
        let tree = forrest.tree(&cx, ObjectId::FS_TREE);
        assert!(tree.root_err().is_none());
        assert_eq!(tree.len(), 1, "only the healthy leaf is indexed");

        // A query inside the dead interval: miss, with the interval error
        // attached so the caller can tell it was unreadable.
        let err = tree.lookup(&cx, key(270, ItemType::INODE_ITEM, 0)).unwrap_err();
        assert!(!err.is_not_found(), "unreadable is not plain absence: {err}");

        // A query fully before the dead interval is a clean miss.
        let err = tree.lookup(&cx, key(100, ItemType::INODE_ITEM, 0)).unwrap_err();
        assert!(err.is_not_found());

        // search_all inside the interval returns the composite error.
        let (items, err) = tree.search_all(&cx, &Searcher::object(ObjectId(270)));
        assert!(items.is_empty());
        assert!(err.expect("composite error").to_string().contains("checksum"));
    }

    #[test]
    fn walk_items_iterates_in_key_order_across_leaves() {
        let cx = test_cx();
        let (_fs, forrest) = build(false);
        let tree = forrest.tree(&cx, ObjectId::FS_TREE);

        let mut keys = Vec::new();
        tree.walk_items(&cx, &mut |value, item| {
            assert_eq!(value.key, item.key);
            keys.push(item.key);
            true
        })
        .expect("walk");
        assert_eq!(
            keys,
            vec![
                key(256, ItemType::INODE_ITEM, 0),
                key(270, ItemType::INODE_ITEM, 0),
                key(280, ItemType::INODE_ITEM, 0),
            ]
        );
    }

    #[test]
    fn missing_tree_is_cached_as_failed() {
        let cx = test_cx();
        let (_fs, forrest) = build(false);
        let tree = forrest.tree(&cx, ObjectId(777));
        assert!(matches!(
            tree.root_err(),
            Some(RfsError::TreeMissing { tree }) if *tree == ObjectId(777)
        ));
        // Cached: same Arc on re-access.
        let again = forrest.tree(&cx, ObjectId(777));
        assert!(Arc::ptr_eq(&tree, &again));
    }

    #[test]
    fn check_owner_accepts_self_and_rejects_strangers() {
        let cx = test_cx();
        let (_fs, forrest) = build(false);

        forrest
            .check_owner(
                &cx,
                ObjectId::FS_TREE,
                false,
                ObjectId::FS_TREE,
                GEN,
                LogicalAddr(0x4_0000),
            )
            .expect("own id is always acceptable");

        let err = forrest
            .check_owner(
                &cx,
                ObjectId::FS_TREE,
                false,
                ObjectId(42),
                GEN,
                LogicalAddr(0x4_0000),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            RfsError::NodeExpectation { field: "owner", .. }
        ));

        // Fail-open mode still rejects a definitively wrong owner.
        let err = forrest
            .check_owner(
                &cx,
                ObjectId::FS_TREE,
                true,
                ObjectId(42),
                GEN,
                LogicalAddr(0x4_0000),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            RfsError::NodeExpectation { field: "owner", .. }
        ));
    }
}
