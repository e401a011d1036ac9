//! Tree roots and navigation over well-formed trees.

use crate::path::{key_before, PathElem, WalkPath};
use crate::read::TreeFs;
use crate::search::{Item, Searcher};
use asupersync::Cx;
use rfs_error::{Result, RfsError};
use rfs_ondisk::{ItemBody, LeafItem, Node, NodeBody, KeyPointer};
use rfs_types::{Generation, Key, LogicalAddr, ObjectId, ParseError, TreeId, Uuid};
use std::cmp::Ordering;
use tracing::debug;

/// Where a tree is rooted, and how it relates to its parent snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRoot {
    pub id: TreeId,
    pub root_node: LogicalAddr,
    pub level: u8,
    pub generation: Generation,
    /// Only meaningful for subvolume trees.
    pub root_dir_id: ObjectId,
    pub uuid: Uuid,
    pub parent_uuid: Uuid,
    /// The ROOT_ITEM key offset: the generation at which this tree was
    /// snapshotted off its parent.
    pub parent_gen: Generation,
}

/// Resolve where `tree_id` is rooted.
///
/// The four well-known trees come straight from the superblock; all
/// others are looked up by ROOT_ITEM in the ROOT tree. The ROOT tree
/// itself is well-known, which breaks the recursion.
pub fn lookup_tree_root(cx: &Cx, fs: &TreeFs, tree_id: TreeId) -> Result<TreeRoot> {
    let sb = fs.superblock();
    let well_known = |root_node, level, generation| TreeRoot {
        id: tree_id,
        root_node,
        level,
        generation,
        root_dir_id: ObjectId(0),
        uuid: Uuid::ZERO,
        parent_uuid: Uuid::ZERO,
        parent_gen: Generation(0),
    };
    match tree_id {
        ObjectId::ROOT_TREE => Ok(well_known(sb.root_tree, sb.root_level, sb.generation)),
        ObjectId::CHUNK_TREE => Ok(well_known(
            sb.chunk_tree,
            sb.chunk_root_level,
            sb.chunk_root_generation,
        )),
        ObjectId::LOG_TREE => Ok(well_known(sb.log_tree, sb.log_root_level, sb.generation)),
        ObjectId::BLOCK_GROUP_TREE => Ok(well_known(
            sb.block_group_root,
            sb.block_group_root_level,
            sb.block_group_root_generation,
        )),
        _ => {
            let root_tree = RawTree::open(cx, fs, ObjectId::ROOT_TREE)?;
            let item = match root_tree.search(cx, &Searcher::root_item(tree_id)) {
                Ok(item) => item,
                Err(err) if err.is_not_found() => {
                    return Err(RfsError::TreeMissing { tree: tree_id })
                }
                Err(err) => return Err(err),
            };
            match item.body {
                ItemBody::Root(root) => Ok(TreeRoot {
                    id: tree_id,
                    root_node: root.bytenr,
                    level: root.level,
                    generation: root.generation,
                    root_dir_id: root.root_dirid,
                    uuid: root.uuid,
                    parent_uuid: root.parent_uuid,
                    parent_gen: Generation(item.key.offset),
                }),
                ItemBody::Error(err) => {
                    debug!(target: "rfs::tree", tree = %tree_id, reason = %err.reason, "malformed ROOT_ITEM");
                    Err(RfsError::Parse(ParseError::InvalidField {
                        field: "root_item",
                        reason: "malformed ROOT_ITEM body",
                    }))
                }
                _ => unreachable!("should not happen: ROOT_ITEM decoded to a non-root body"),
            }
        }
    }
}

/// Callbacks for [`RawTree::walk`]. Events arrive in on-disk order; a
/// node that fails its expectations is reported to `bad_node` and its
/// subtree skipped, while siblings continue.
pub trait WalkHandler {
    fn node(&mut self, _path: &WalkPath, _node: &Node) {}

    fn bad_node(&mut self, _path: &WalkPath, _err: &RfsError) {}

    /// Return `false` to skip the pointed-to subtree.
    fn key_pointer(&mut self, _path: &WalkPath, _kp: &KeyPointer) -> bool {
        true
    }

    fn item(&mut self, _path: &WalkPath, _slot: usize, _item: &LeafItem) {}

    fn bad_item(&mut self, _path: &WalkPath, _slot: usize, _item: &LeafItem) {}
}

/// Navigation over one well-formed tree.
pub struct RawTree<'fs> {
    fs: &'fs TreeFs,
    pub root: TreeRoot,
}

impl<'fs> RawTree<'fs> {
    pub fn open(cx: &Cx, fs: &'fs TreeFs, tree_id: TreeId) -> Result<Self> {
        let root = lookup_tree_root(cx, fs, tree_id)?;
        Ok(Self { fs, root })
    }

    #[must_use]
    pub fn from_root(fs: &'fs TreeFs, root: TreeRoot) -> Self {
        Self { fs, root }
    }

    fn root_path(&self) -> WalkPath {
        WalkPath::root(
            self.root.id,
            self.root.root_node,
            self.root.generation,
            self.root.level,
        )
    }

    fn child_elem(
        &self,
        node: &Node,
        path: &WalkPath,
        slot: usize,
    ) -> PathElem {
        let ptrs = node.key_pointers();
        let kp = &ptrs[slot];
        let (_, parent_max) = path.expected_key_range();
        PathElem {
            from_tree: node.head.owner,
            from_slot: Some(slot),
            to_addr: kp.target,
            to_generation: kp.generation,
            to_level: node.head.level - 1,
            to_key: kp.key,
            to_max_key: ptrs
                .get(slot + 1)
                .map_or(parent_max, |next| key_before(next.key)),
        }
    }

    /// Descend to the unique item matched by `searcher`.
    pub fn search(&self, cx: &Cx, searcher: &Searcher) -> Result<Item> {
        let miss = || RfsError::ItemMissing {
            tree: self.root.id,
            key: searcher.representative(),
        };

        let mut path = self.root_path();
        loop {
            cx.checkpoint().map_err(|_| RfsError::Cancelled)?;
            let Some(elem) = path.last().copied() else {
                return Err(miss());
            };
            let node = self
                .fs
                .acquire_node(cx, elem.to_addr, &path.node_expectations())?;
            let next_elem;
            match &node.body {
                NodeBody::Internal(ptrs) => {
                    // The last keypointer whose key is at or before the
                    // wanted range; its subtree is the only candidate.
                    let mut chosen = None;
                    for (slot, kp) in ptrs.iter().enumerate() {
                        if searcher.cmp(kp.key, u32::MAX) == Ordering::Less {
                            break;
                        }
                        chosen = Some(slot);
                    }
                    let Some(slot) = chosen else {
                        return Err(miss());
                    };
                    next_elem = self.child_elem(&node, &path, slot);
                }
                NodeBody::Leaf(items) => {
                    for item in items {
                        if searcher.cmp(item.key, item.data_size) == Ordering::Equal {
                            return Ok(Item {
                                key: item.key,
                                data_size: item.data_size,
                                body: item.body.clone(),
                            });
                        }
                    }
                    return Err(miss());
                }
            }
            drop(node);
            path = path.push(next_elem);
        }
    }

    /// Collect every item matched by `searcher`, in key order.
    pub fn search_all(&self, cx: &Cx, searcher: &Searcher) -> Result<Vec<Item>> {
        let mut out = Vec::new();
        self.search_all_in(cx, searcher, &self.root_path(), &mut out)?;
        if out.is_empty() {
            return Err(RfsError::ItemMissing {
                tree: self.root.id,
                key: searcher.representative(),
            });
        }
        Ok(out)
    }

    fn search_all_in(
        &self,
        cx: &Cx,
        searcher: &Searcher,
        path: &WalkPath,
        out: &mut Vec<Item>,
    ) -> Result<()> {
        cx.checkpoint().map_err(|_| RfsError::Cancelled)?;
        let elem = path.last().copied().unwrap_or_else(|| {
            unreachable!("search path always has a root element")
        });
        let node = self
            .fs
            .acquire_node(cx, elem.to_addr, &path.node_expectations())?;
        match &node.body {
            NodeBody::Internal(ptrs) => {
                for slot in 0..ptrs.len() {
                    // A child may hold matches unless it starts after the
                    // range or the next child starts before it.
                    if searcher.cmp(ptrs[slot].key, u32::MAX) == Ordering::Less {
                        break;
                    }
                    if let Some(next) = ptrs.get(slot + 1) {
                        if searcher.cmp(next.key, u32::MAX) == Ordering::Greater {
                            continue;
                        }
                    }
                    let elem = self.child_elem(&node, path, slot);
                    self.search_all_in(cx, searcher, &path.push(elem), out)?;
                }
            }
            NodeBody::Leaf(items) => {
                for item in items {
                    if searcher.cmp(item.key, item.data_size) == Ordering::Equal {
                        out.push(Item {
                            key: item.key,
                            data_size: item.data_size,
                            body: item.body.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Depth-first walk in on-disk order.
    ///
    /// Unreadable or expectation-violating nodes go to
    /// [`WalkHandler::bad_node`] and their subtrees are skipped; the walk
    /// continues on siblings. Only cancellation aborts the whole walk.
    pub fn walk(&self, cx: &Cx, handler: &mut dyn WalkHandler) -> Result<()> {
        self.walk_in(cx, handler, &self.root_path())
    }

    fn walk_in(
        &self,
        cx: &Cx,
        handler: &mut dyn WalkHandler,
        path: &WalkPath,
    ) -> Result<()> {
        cx.checkpoint().map_err(|_| RfsError::Cancelled)?;
        let elem = path.last().copied().unwrap_or_else(|| {
            unreachable!("walk path always has a root element")
        });
        let node = match self
            .fs
            .acquire_node(cx, elem.to_addr, &path.node_expectations())
        {
            Ok(node) => node,
            Err(RfsError::Cancelled) => return Err(RfsError::Cancelled),
            Err(err) => {
                handler.bad_node(path, &err);
                return Ok(());
            }
        };
        handler.node(path, &node);

        match &node.body {
            NodeBody::Internal(ptrs) => {
                for slot in 0..ptrs.len() {
                    if !handler.key_pointer(path, &ptrs[slot]) {
                        continue;
                    }
                    let child = self.child_elem(&node, path, slot);
                    self.walk_in(cx, handler, &path.push(child))?;
                }
            }
            NodeBody::Leaf(items) => {
                for (slot, item) in items.iter().enumerate() {
                    if item.body.is_error() {
                        handler.bad_item(path, slot, item);
                    } else {
                        handler.item(path, slot, item);
                    }
                }
            }
        }
        Ok(())
    }
}
