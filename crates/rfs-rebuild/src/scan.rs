//! Device scan: find every plausible tree node and harvest the item
//! facts the want engine needs.

use crate::graph::{FinalCheckReport, Graph};
use asupersync::Cx;
use rfs_error::{Result, RfsError};
use rfs_ondisk::{verify_node_checksum, ItemBody, Node};
use rfs_tree::{NodeExpectations, TreeFs};
use rfs_types::{DeviceId, ItemType, LogicalAddr, PhysicalAddr};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// A `(leaf node, slot)` pointer into the graph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ItemPtr {
    pub node: LogicalAddr,
    pub slot: usize,
}

/// Everything the scan learned: the node graph plus per-item harvests
/// consumed by the want engine.
#[derive(Default)]
pub struct ScanResult {
    pub graph: Graph,
    /// INODE_ITEM → does the inode set the no-data-sum flag (or why the
    /// body would not decode).
    pub flags: HashMap<ItemPtr, Result<bool, String>>,
    /// DIR_INDEX → entry name.
    pub names: HashMap<ItemPtr, Vec<u8>>,
    /// EXTENT_CSUM / EXTENT_DATA → bytes covered (or the decode failure).
    pub sizes: HashMap<ItemPtr, Result<u64, String>>,
    /// Node addresses discovered per device, in physical order.
    pub found_nodes: BTreeMap<DeviceId, Vec<LogicalAddr>>,
}

impl ScanResult {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one node into the graph and the harvests.
    ///
    /// `csum_digest_len` is the per-block digest width of the
    /// filesystem's checksum type, needed to size EXTENT_CSUM runs.
    pub fn insert_node(&mut self, node: &Node, csum_digest_len: usize) {
        self.graph.insert_node(node);

        for (slot, item) in node.leaf_items().iter().enumerate() {
            let ptr = ItemPtr {
                node: node.head.addr,
                slot,
            };
            match &item.body {
                ItemBody::Inode(inode) => {
                    self.flags.insert(ptr, Ok(inode.has_no_data_sum()));
                }
                ItemBody::DirEntries(entries) if item.key.item_type == ItemType::DIR_INDEX => {
                    if let Some(entry) = entries.first() {
                        self.names.insert(ptr, entry.name.clone());
                    }
                }
                ItemBody::ExtentCsum(run) => {
                    self.sizes.insert(ptr, Ok(run.run_len(csum_digest_len)));
                }
                ItemBody::FileExtent(extent) => {
                    self.sizes.insert(ptr, Ok(extent.size()));
                }
                ItemBody::Error(err) => match item.key.item_type {
                    ItemType::INODE_ITEM => {
                        self.flags.insert(ptr, Err(err.reason.clone()));
                    }
                    ItemType::EXTENT_CSUM | ItemType::EXTENT_DATA => {
                        self.sizes.insert(ptr, Err(err.reason.clone()));
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }
}

/// Walk every registered device in node-size steps, keep each block
/// that looks like a node of this filesystem (matching metadata UUID,
/// valid checksum, parseable), and run the graph's final check.
pub fn scan_devices(cx: &Cx, fs: &TreeFs) -> Result<(ScanResult, FinalCheckReport)> {
    let sb = fs.superblock();
    let node_size = sb.node_size as usize;
    let digest_len = sb.csum_type.digest_len();
    let metadata_uuid = sb.effective_metadata_uuid();

    let mut out = ScanResult::new();
    for dev_id in fs.volume().devices() {
        let dev = fs
            .volume()
            .device(dev_id)
            .ok_or(RfsError::DeviceMissing { dev: dev_id })?;
        let len = dev.len_bytes().0;
        info!(target: "rfs::rebuild", dev = %dev_id, len, "scanning device for nodes");

        let mut block = vec![0_u8; node_size];
        let mut offset = 0_i64;
        let mut found = 0_usize;
        while offset + node_size as i64 <= len {
            cx.checkpoint().map_err(|_| RfsError::Cancelled)?;
            if dev
                .read_exact_at(cx, PhysicalAddr(offset), &mut block)
                .is_err()
            {
                offset += node_size as i64;
                continue;
            }
            if let Some(node) = probe_block(&block, metadata_uuid, sb.csum_type) {
                out.found_nodes.entry(dev_id).or_default().push(node.head.addr);
                out.insert_node(&node, digest_len);
                found += 1;
            }
            offset += node_size as i64;
        }
        info!(target: "rfs::rebuild", dev = %dev_id, found, "device scan done");
    }

    let probe = |cx: &Cx, laddr: LogicalAddr| -> Result<()> {
        fs.acquire_node(cx, laddr, &NodeExpectations::at(laddr))
            .map(|_| ())
    };
    let report = out.graph.final_check(cx, &probe)?;
    Ok((out, report))
}

fn probe_block(
    block: &[u8],
    metadata_uuid: rfs_types::Uuid,
    csum_type: rfs_ondisk::ChecksumType,
) -> Option<Node> {
    // Cheap identity check before the checksum.
    if block.get(0x20..0x30)? != &metadata_uuid.0[..] {
        return None;
    }
    if !verify_node_checksum(block, csum_type).ok()? {
        debug!(target: "rfs::rebuild", "block with matching uuid fails checksum");
        return None;
    }
    Node::parse(block).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfs_tree::synth::{
        csum_run_body, dir_entry_body, file_extent_body, inode_item_body, key, SynthFs,
    };
    use rfs_types::{Generation, ObjectId, INODE_NODATASUM};

    #[test]
    fn scan_finds_nodes_and_harvests_items() {
        let cx = Cx::for_testing();
        let mut synth = SynthFs::new(4096);
        let gen = Generation(100);

        synth.leaf(
            LogicalAddr(0x1_0000),
            ObjectId::FS_TREE,
            gen,
            &[
                (
                    key(256, ItemType::DIR_INDEX, 2),
                    dir_entry_body(key(257, ItemType::INODE_ITEM, 0), 1, b"notes"),
                ),
                (key(257, ItemType::INODE_ITEM, 0), inode_item_body(INODE_NODATASUM)),
                (
                    key(257, ItemType::EXTENT_DATA, 0),
                    file_extent_body(LogicalAddr(0x9_0000), 0x3000),
                ),
            ],
        );
        synth.leaf(
            LogicalAddr(0x2_0000),
            ObjectId::CSUM_TREE,
            gen,
            &[(
                key(ObjectId::EXTENT_CSUM.0, ItemType::EXTENT_CSUM, 0x1000),
                csum_run_body(2, 4),
            )],
        );
        let fs = synth.build(LogicalAddr(0x1_0000), 0);

        let (scan, report) = scan_devices(&cx, &fs).expect("scan");
        assert_eq!(report, FinalCheckReport::default());
        assert_eq!(scan.graph.len(), 2);
        assert_eq!(scan.found_nodes[&DeviceId(1)].len(), 2);

        // Inode flag harvest.
        let inode_ptr = ItemPtr {
            node: LogicalAddr(0x1_0000),
            slot: 1, // items sorted: DIR_INDEX(256) first, INODE(257) second
        };
        assert_eq!(scan.flags.get(&inode_ptr), Some(&Ok(true)));

        // Name harvest.
        let name_ptr = ItemPtr {
            node: LogicalAddr(0x1_0000),
            slot: 0,
        };
        assert_eq!(scan.names.get(&name_ptr).map(Vec::as_slice), Some(&b"notes"[..]));

        // Size harvests: 2 csum blocks of 4 KiB, and a 0x3000-byte extent.
        let csum_ptr = ItemPtr {
            node: LogicalAddr(0x2_0000),
            slot: 0,
        };
        assert_eq!(scan.sizes.get(&csum_ptr), Some(&Ok(0x2000)));
        let ext_ptr = ItemPtr {
            node: LogicalAddr(0x1_0000),
            slot: 2,
        };
        assert_eq!(scan.sizes.get(&ext_ptr), Some(&Ok(0x3000)));
    }
}
