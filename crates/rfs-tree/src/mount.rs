//! Chunk-map population: make the whole logical address space readable.
//!
//! The superblock's embedded `sys_chunk_array` bootstraps enough of the
//! mapping to read the chunk tree; walking the chunk tree then maps
//! everything else. Conflicting chunk items are reported and skipped;
//! on a damaged filesystem the rebuild layers supply the rest.

use crate::forrest::RawTree;
use crate::read::TreeFs;
use crate::search::Searcher;
use asupersync::Cx;
use rfs_error::Result;
use rfs_ondisk::ItemBody;
use rfs_types::{ItemType, LogicalAddr, ObjectId};
use tracing::{info, warn};

/// Seed the sys-chunk bootstrap mappings, then register every
/// CHUNK_ITEM in the chunk tree.
#[allow(clippy::cast_possible_wrap)] // chunk-key offsets are logical addresses
pub fn populate_chunk_maps(cx: &Cx, fs: &TreeFs) -> Result<()> {
    let vol = fs.volume();
    vol.add_sys_chunks(fs.superblock())?;

    let chunk_tree = RawTree::open(cx, fs, ObjectId::CHUNK_TREE)?;
    let items = match chunk_tree.search_all(
        cx,
        &Searcher::key_prefix(ObjectId::FIRST_CHUNK_TREE, ItemType::CHUNK_ITEM),
    ) {
        Ok(items) => items,
        Err(err) if err.is_not_found() => Vec::new(),
        Err(err) => return Err(err),
    };

    let mut mapped = 0_usize;
    for item in items {
        match item.body {
            ItemBody::Chunk(chunk) => {
                let laddr = LogicalAddr(item.key.offset as i64);
                match vol.add_chunk_item(laddr, &chunk) {
                    Ok(()) => mapped += 1,
                    Err(err) => {
                        warn!(target: "rfs::tree", %laddr, %err, "skipping conflicting chunk item");
                    }
                }
            }
            ItemBody::Error(err) => {
                warn!(target: "rfs::tree", key = %item.key, reason = %err.reason, "undecodable chunk item");
            }
            _ => unreachable!("should not happen: CHUNK_ITEM decoded to a non-chunk body"),
        }
    }
    info!(target: "rfs::tree", mapped, "chunk maps populated");
    Ok(())
}
