//! The want/augment loop.
//!
//! A consistency checker observes items through the rebuilt trees and
//! raises "wants" for items that must exist. Each handler checks the
//! attached items first, then the potential items, and records the
//! candidate roots whose addition would make the missing item visible.
//! Range wants maintain a gap tree: covered spans are subtracted, and
//! remaining gaps are filled greedily from the potential items; a gap
//! nothing can fill is recorded as an empty augment, for diagnostics.

use crate::rebuilt::{RebuildCallbacks, RebuiltForrest, RebuiltTree};
use crate::scan::{ItemPtr, ScanResult};
use asupersync::Cx;
use parking_lot::Mutex;
use rfs_container::{RangeExt, RangeMap};
use rfs_tree::TreeFs;
use rfs_types::{
    round_down, round_up, ItemType, Key, LogicalAddr, ObjectId, TreeId, CSUM_BLOCK_SIZE,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Which offsets of `(object id, item type)` a want covers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum WantOffset {
    Any,
    Exact(u64),
    Range { beg: u64, end: u64 },
    Name(Vec<u8>),
}

/// One wanted item (or run of items) within a tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WantKey {
    pub object_id: ObjectId,
    pub item_type: ItemType,
    pub offset: WantOffset,
}

impl fmt::Display for WantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.offset {
            WantOffset::Any => write!(f, "{{{} {} ?}}", self.object_id, self.item_type),
            WantOffset::Exact(off) => {
                write!(f, "{{{} {} {off}}}", self.object_id, self.item_type)
            }
            WantOffset::Range { beg, end } => {
                write!(f, "{{{} {} {beg}-{end}}}", self.object_id, self.item_type)
            }
            WantOffset::Name(name) => write!(
                f,
                "{{{} {} name={:?}}}",
                self.object_id,
                self.item_type,
                String::from_utf8_lossy(name)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WantWithTree {
    pub tree: TreeId,
    pub key: WantKey,
}

impl fmt::Display for WantWithTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tree={} key={}", self.tree, self.key)
    }
}

/// A span still missing from a range want.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Gap {
    beg: u64,
    end: u64,
}

impl RangeExt for Gap {
    type Pos = u64;
    fn range_beg(&self) -> u64 {
        self.beg
    }
    fn range_end(&self) -> u64 {
        self.end
    }
}

/// Drives wants against the rebuilt forrest, producing augmentation
/// candidates. Choosing a minimum set cover and applying `add_root` is
/// the caller's job.
pub struct Rebuilder {
    forrest: Arc<RebuiltForrest>,
    flags: HashMap<ItemPtr, Result<bool, String>>,
    names: HashMap<ItemPtr, Vec<u8>>,
    sizes: HashMap<ItemPtr, Result<u64, String>>,
    augments: Mutex<BTreeMap<WantWithTree, Vec<BTreeSet<LogicalAddr>>>>,
    retries: Mutex<BTreeSet<TreeId>>,
    fs_errs: Mutex<Vec<String>>,
}

impl Rebuilder {
    #[must_use]
    pub fn new(
        fs: Option<Arc<TreeFs>>,
        scan: ScanResult,
        cbs: Arc<dyn RebuildCallbacks>,
        lax: bool,
    ) -> Self {
        let ScanResult {
            graph,
            flags,
            names,
            sizes,
            found_nodes: _,
        } = scan;
        Self {
            forrest: RebuiltForrest::new(fs, Arc::new(graph), cbs, lax),
            flags,
            names,
            sizes,
            augments: Mutex::new(BTreeMap::new()),
            retries: Mutex::new(BTreeSet::new()),
            fs_errs: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn forrest(&self) -> &Arc<RebuiltForrest> {
        &self.forrest
    }

    /// Report a filesystem inconsistency that is not itself a want.
    pub fn fs_err(&self, _cx: &Cx, msg: String) {
        error!(target: "rfs::rebuild", "filesystem error: {msg}");
        self.fs_errs.lock().push(msg);
    }

    /// Trees whose wants must be replayed once the tree appears.
    #[must_use]
    pub fn pending_retries(&self) -> BTreeSet<TreeId> {
        self.retries.lock().clone()
    }

    /// Drain the collected augmentation candidates.
    #[must_use]
    pub fn take_augments(&self) -> BTreeMap<WantWithTree, Vec<BTreeSet<LogicalAddr>>> {
        std::mem::take(&mut self.augments.lock())
    }

    #[must_use]
    pub fn fs_errors(&self) -> Vec<String> {
        self.fs_errs.lock().clone()
    }

    /// Want any item `(object_id, item_type, *)` in `tree_id`.
    pub fn want(
        &self,
        cx: &Cx,
        reason: &str,
        tree_id: TreeId,
        object_id: ObjectId,
        item_type: ItemType,
    ) {
        let Some(tree) = self.tree_or_retry(cx, tree_id) else {
            return;
        };
        let want = WantWithTree {
            tree: tree_id,
            key: WantKey {
                object_id,
                item_type,
                offset: WantOffset::Any,
            },
        };

        let lo = Key::new(object_id, item_type, 0);
        let hi = Key::new(object_id, item_type, u64::MAX);
        if self
            .forrest
            .items(cx, &tree)
            .range(lo..=hi)
            .next()
            .is_some()
        {
            return;
        }

        if self.has_augment(&want) {
            return;
        }
        let mut wants = BTreeSet::new();
        for (_, ptr) in self.forrest.potential_items(cx, &tree).range(lo..=hi) {
            wants.extend(self.forrest.leaf_to_roots_for(cx, &tree, ptr.node));
        }
        self.want_augment(cx, reason, want, wants);
    }

    /// Want exactly `(object_id, item_type, off)`; true if present.
    pub fn want_off(
        &self,
        cx: &Cx,
        reason: &str,
        tree_id: TreeId,
        object_id: ObjectId,
        item_type: ItemType,
        off: u64,
    ) -> bool {
        let Some(tree) = self.tree_or_retry(cx, tree_id) else {
            return false;
        };
        let want = WantWithTree {
            tree: tree_id,
            key: WantKey {
                object_id,
                item_type,
                offset: WantOffset::Exact(off),
            },
        };

        let target = Key::new(object_id, item_type, off);
        if self.forrest.items(cx, &tree).contains_key(&target) {
            return true;
        }

        if self.has_augment(&want) {
            return false;
        }
        let mut wants = BTreeSet::new();
        if let Some(ptr) = self.forrest.potential_items(cx, &tree).get(&target) {
            wants.extend(self.forrest.leaf_to_roots_for(cx, &tree, ptr.node));
        }
        self.want_augment(cx, reason, want, wants);
        false
    }

    /// Want a DIR_INDEX of `object_id` whose entry name is `name`.
    pub fn want_dir_index(
        &self,
        cx: &Cx,
        reason: &str,
        tree_id: TreeId,
        object_id: ObjectId,
        name: &[u8],
    ) {
        let Some(tree) = self.tree_or_retry(cx, tree_id) else {
            return;
        };
        let want = WantWithTree {
            tree: tree_id,
            key: WantKey {
                object_id,
                item_type: ItemType::DIR_INDEX,
                offset: WantOffset::Name(name.to_vec()),
            },
        };

        let lo = Key::new(object_id, ItemType::DIR_INDEX, 0);
        let hi = Key::new(object_id, ItemType::DIR_INDEX, u64::MAX);
        let found = self
            .forrest
            .items(cx, &tree)
            .range(lo..=hi)
            .any(|(_, ptr)| self.names.get(ptr).is_some_and(|n| n == name));
        if found {
            return;
        }

        if self.has_augment(&want) {
            return;
        }
        let mut wants = BTreeSet::new();
        for (_, ptr) in self.forrest.potential_items(cx, &tree).range(lo..=hi) {
            if self.names.get(ptr).is_some_and(|n| n == name) {
                wants.extend(self.forrest.leaf_to_roots_for(cx, &tree, ptr.node));
            }
        }
        self.want_augment(cx, reason, want, wants);
    }

    /// Want every CSUM item covering `[beg, end)` of a file's data,
    /// after verifying the inode exists and checksums its data.
    pub fn want_csum(
        &self,
        cx: &Cx,
        reason: &str,
        inode_tree: TreeId,
        inode: ObjectId,
        beg: u64,
        end: u64,
    ) {
        if !self.want_off(cx, reason, inode_tree, inode, ItemType::INODE_ITEM, 0) {
            self.enqueue_retry(inode_tree);
            return;
        }
        let Some(tree) = self.tree_or_retry(cx, inode_tree) else {
            return;
        };

        let inode_key = Key::new(inode, ItemType::INODE_ITEM, 0);
        let ptr = *self
            .forrest
            .items(cx, &tree)
            .get(&inode_key)
            .unwrap_or_else(|| {
                panic!("should not happen: could not reload inode {inode_key}")
            });
        let no_data_sum = match self.flags.get(&ptr) {
            None => panic!("should not happen: INODE_ITEM without recorded flags"),
            Some(Err(reason)) => {
                self.fs_err(cx, format!("inode {inode} flags: {reason}"));
                return;
            }
            Some(Ok(no_data_sum)) => *no_data_sum,
        };
        if no_data_sum {
            return;
        }

        self.want_range(
            cx,
            reason,
            ObjectId::CSUM_TREE,
            ObjectId::EXTENT_CSUM,
            ItemType::EXTENT_CSUM,
            round_down(beg, CSUM_BLOCK_SIZE),
            round_up(end, CSUM_BLOCK_SIZE),
        );
    }

    /// Want every FILE_EXTENT covering `[0, size)` of an inode.
    pub fn want_file_ext(
        &self,
        cx: &Cx,
        reason: &str,
        tree_id: TreeId,
        inode: ObjectId,
        size: u64,
    ) {
        self.want_range(cx, reason, tree_id, inode, ItemType::EXTENT_DATA, 0, size);
    }

    fn want_range(
        &self,
        cx: &Cx,
        reason: &str,
        tree_id: TreeId,
        object_id: ObjectId,
        item_type: ItemType,
        beg: u64,
        end: u64,
    ) {
        if beg >= end {
            return;
        }
        let Some(tree) = self.tree_or_retry(cx, tree_id) else {
            return;
        };
        let want_for = |beg: u64, end: u64| WantWithTree {
            tree: tree_id,
            key: WantKey {
                object_id,
                item_type,
                offset: WantOffset::Range { beg, end },
            },
        };

        // Step 1: start from one gap covering the whole interval and
        // subtract every attached covering run.
        let mut gaps: RangeMap<Gap> = RangeMap::new();
        gaps.insert(Gap { beg, end })
            .unwrap_or_else(|_| unreachable!("first insert into an empty map"));
        let items = self.forrest.items(cx, &tree);
        self.walk_range(cx, &items, object_id, item_type, beg, end, &mut |_,
                                                                          _,
                                                                          run_beg,
                                                                          run_end| {
            let overlapping = gaps.overlapping(run_beg, run_end);
            let (Some(first), Some(last)) = (overlapping.first(), overlapping.last()) else {
                return;
            };
            let (gaps_beg, gaps_end) = (first.beg, last.end);
            for gap in &overlapping {
                gaps.remove_at(gap.beg);
            }
            if gaps_beg < run_beg {
                let _ = gaps.insert(Gap {
                    beg: gaps_beg,
                    end: run_beg,
                });
            }
            if gaps_end > run_end {
                let _ = gaps.insert(Gap {
                    beg: run_end,
                    end: gaps_end,
                });
            }
        });

        // Step 2: fill each remaining gap greedily from the potential
        // items; anything no candidate covers becomes an empty augment.
        if gaps.is_empty() {
            return;
        }
        let potential = self.forrest.potential_items(cx, &tree);
        let gap_list: Vec<Gap> = gaps.iter().cloned().collect();
        for gap in gap_list {
            let mut last = gap.beg;
            self.walk_range(
                cx,
                &potential,
                object_id,
                item_type,
                gap.beg,
                gap.end,
                &mut |_, ptr, run_beg, run_end| {
                    if last < run_beg {
                        self.want_augment(cx, reason, want_for(last, run_beg), BTreeSet::new());
                    }
                    self.want_augment(
                        cx,
                        reason,
                        want_for(gap.beg, gap.end),
                        self.forrest.leaf_to_roots_for(cx, &tree, ptr.node),
                    );
                    last = run_end;
                },
            );
            if last < gap.end {
                self.want_augment(cx, reason, want_for(last, gap.end), BTreeSet::new());
            }
        }
    }

    /// Visit every `(object_id, item_type)` run overlapping `[beg, end)`
    /// in `map`, with each run's extent from the scan's size harvest.
    fn walk_range(
        &self,
        cx: &Cx,
        map: &BTreeMap<Key, ItemPtr>,
        object_id: ObjectId,
        item_type: ItemType,
        beg: u64,
        end: u64,
        visit: &mut dyn FnMut(Key, ItemPtr, u64, u64),
    ) {
        let lo = Key::new(object_id, item_type, 0);
        let hi = Key::new(object_id, item_type, end - 1);
        for (key, ptr) in map.range(lo..=hi) {
            let size = match self.sizes.get(ptr) {
                None => panic!("should not happen: {key} ({ptr:?}) has no size recorded"),
                Some(Err(reason)) => {
                    self.fs_err(cx, format!("get size: {key}: {reason}"));
                    continue;
                }
                Some(Ok(size)) => *size,
            };
            if size == 0 {
                continue;
            }
            let run_beg = key.offset;
            let run_end = run_beg.saturating_add(size);
            if run_end <= beg {
                continue;
            }
            visit(*key, *ptr, run_beg, run_end);
        }
    }

    fn tree_or_retry(&self, cx: &Cx, tree_id: TreeId) -> Option<Arc<RebuiltTree>> {
        match self.forrest.rebuilt_tree(cx, tree_id) {
            Ok(tree) => Some(tree),
            Err(err) => {
                info!(target: "rfs::rebuild", tree = %tree_id, %err, "tree unavailable, queueing retry");
                self.enqueue_retry(tree_id);
                None
            }
        }
    }

    fn enqueue_retry(&self, tree_id: TreeId) {
        self.retries.lock().insert(tree_id);
    }

    fn has_augment(&self, want: &WantWithTree) -> bool {
        self.augments.lock().contains_key(want)
    }

    fn want_augment(
        &self,
        _cx: &Cx,
        reason: &str,
        want: WantWithTree,
        roots: BTreeSet<LogicalAddr>,
    ) {
        if roots.is_empty() {
            warn!(target: "rfs::rebuild", %want, reason, "want is unfillable");
        } else {
            info!(
                target: "rfs::rebuild",
                %want,
                reason,
                candidates = roots.len(),
                "augment candidates found"
            );
        }
        self.augments.lock().entry(want).or_default().push(roots);
    }
}
