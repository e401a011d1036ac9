//! Synthetic filesystem images.
//!
//! Builds checksummed node blocks on an in-memory device with an
//! identity logical↔physical mapping. Used by tests across the
//! workspace and by demos; nothing here touches real devices.

use crate::read::TreeFs;
use asupersync::Cx;
use rfs_ondisk::{ChecksumType, ChunkItem, DevItem, Superblock};
use rfs_types::{
    Generation, ItemType, Key, LogicalAddr, ObjectId, TreeId, Uuid, KEY_PTR_SIZE, KEY_SIZE,
    LEAF_ITEM_SIZE, NODE_HEADER_SIZE,
};
use rfs_volume::{LogicalVolume, Mapping, MemoryDevice};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builder for a single-device image whose logical addresses equal its
/// physical offsets.
pub struct SynthFs {
    node_size: u32,
    fsid: Uuid,
    generation: Generation,
    blocks: BTreeMap<i64, Vec<u8>>,
}

impl SynthFs {
    #[must_use]
    pub fn new(node_size: u32) -> Self {
        Self {
            node_size,
            fsid: Uuid([0x42; 16]),
            generation: Generation(100),
            blocks: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn fsid(&self) -> Uuid {
        self.fsid
    }

    fn header(&self, block: &mut [u8], addr: LogicalAddr, owner: TreeId, gen: Generation, num_items: u32, level: u8) {
        block[0x20..0x30].copy_from_slice(&self.fsid.0);
        block[0x30..0x38].copy_from_slice(&addr.0.to_le_bytes());
        block[0x50..0x58].copy_from_slice(&gen.0.to_le_bytes());
        block[0x58..0x60].copy_from_slice(&owner.0.to_le_bytes());
        block[0x60..0x64].copy_from_slice(&num_items.to_le_bytes());
        block[0x64] = level;
    }

    fn seal(&mut self, addr: LogicalAddr, mut block: Vec<u8>) {
        let sum = ChecksumType::Crc32c.sum(&block[0x20..]);
        block[..32].copy_from_slice(&sum.0);
        self.blocks.insert(addr.0, block);
    }

    /// Add a leaf node holding `items` (keys must already be sorted).
    pub fn leaf(
        &mut self,
        addr: LogicalAddr,
        owner: TreeId,
        gen: Generation,
        items: &[(Key, Vec<u8>)],
    ) {
        let node_size = self.node_size as usize;
        let mut block = vec![0_u8; node_size];
        let table = items.len() * LEAF_ITEM_SIZE;
        let bodies: usize = items.iter().map(|(_, b)| b.len()).sum();
        assert!(
            NODE_HEADER_SIZE + table + bodies <= node_size,
            "synthetic leaf overflows the node size"
        );
        self.header(&mut block, addr, owner, gen, items.len() as u32, 0);

        let mut data_end = node_size;
        for (slot, (key, body)) in items.iter().enumerate() {
            let beg = data_end - body.len();
            block[beg..data_end].copy_from_slice(body);

            let base = NODE_HEADER_SIZE + slot * LEAF_ITEM_SIZE;
            block[base..base + 8].copy_from_slice(&key.object_id.0.to_le_bytes());
            block[base + 8] = key.item_type.0;
            block[base + 9..base + KEY_SIZE].copy_from_slice(&key.offset.to_le_bytes());
            block[base + 17..base + 21]
                .copy_from_slice(&((beg - NODE_HEADER_SIZE) as u32).to_le_bytes());
            block[base + 21..base + 25].copy_from_slice(&(body.len() as u32).to_le_bytes());
            data_end = beg;
        }
        self.seal(addr, block);
    }

    /// Add an internal node pointing at `children` (keys sorted).
    pub fn internal(
        &mut self,
        addr: LogicalAddr,
        owner: TreeId,
        gen: Generation,
        level: u8,
        children: &[(Key, LogicalAddr, Generation)],
    ) {
        assert!(level > 0, "internal nodes have level > 0");
        let node_size = self.node_size as usize;
        let mut block = vec![0_u8; node_size];
        assert!(NODE_HEADER_SIZE + children.len() * KEY_PTR_SIZE <= node_size);
        self.header(&mut block, addr, owner, gen, children.len() as u32, level);

        for (slot, (key, target, child_gen)) in children.iter().enumerate() {
            let base = NODE_HEADER_SIZE + slot * KEY_PTR_SIZE;
            block[base..base + 8].copy_from_slice(&key.object_id.0.to_le_bytes());
            block[base + 8] = key.item_type.0;
            block[base + 9..base + KEY_SIZE].copy_from_slice(&key.offset.to_le_bytes());
            block[base + 17..base + 25].copy_from_slice(&target.0.to_le_bytes());
            block[base + 25..base + 33].copy_from_slice(&child_gen.0.to_le_bytes());
        }
        self.seal(addr, block);
    }

    /// Flip a payload byte so the block fails checksum verification.
    pub fn corrupt_block(&mut self, addr: LogicalAddr) {
        let block = self
            .blocks
            .get_mut(&addr.0)
            .expect("corrupt_block: no block at that address");
        block[0x70] ^= 0xFF;
    }

    /// Assemble the device, volume, and `TreeFs` with the given tree
    /// root wired into the superblock.
    #[must_use]
    pub fn build(self, root_tree: LogicalAddr, root_level: u8) -> Arc<TreeFs> {
        self.build_with(|sb| {
            sb.root_tree = root_tree;
            sb.root_level = root_level;
        })
    }

    /// Assemble with full control over the superblock fields.
    #[must_use]
    pub fn build_with(self, tweak: impl FnOnce(&mut Superblock)) -> Arc<TreeFs> {
        let node_size = self.node_size;
        let end = self
            .blocks
            .last_key_value()
            .map_or(i64::from(node_size), |(addr, _)| addr + i64::from(node_size));

        let mut image = vec![0_u8; usize::try_from(end).expect("image size")];
        for (addr, block) in &self.blocks {
            let beg = usize::try_from(*addr).expect("block address");
            image[beg..beg + block.len()].copy_from_slice(block);
        }

        let lv = Arc::new(LogicalVolume::new());
        lv.add_physical_volume(rfs_types::DeviceId(1), Arc::new(MemoryDevice::from_vec(image)))
            .expect("register synthetic device");
        lv.add_mapping(Mapping {
            laddr: LogicalAddr::ZERO,
            paddr: rfs_types::QualifiedPhysicalAddr::new(
                rfs_types::DeviceId(1),
                rfs_types::PhysicalAddr(0),
            ),
            size: rfs_types::AddrDelta(end),
            size_locked: false,
            flags: None,
        })
        .expect("identity mapping");

        let mut sb = Superblock {
            csum: [0; 32],
            fsid: self.fsid,
            bytenr: 0x1_0000,
            flags: 0,
            generation: self.generation,
            root_tree: LogicalAddr::ZERO,
            chunk_tree: LogicalAddr::ZERO,
            log_tree: LogicalAddr::ZERO,
            total_bytes: end as u64,
            bytes_used: 0,
            root_dir_objectid: ObjectId::ROOT_TREE_DIR,
            num_devices: 1,
            sector_size: 4096,
            node_size,
            sys_chunk_array_size: 0,
            chunk_root_generation: Generation(0),
            compat_flags: 0,
            compat_ro_flags: 0,
            incompat_flags: 0,
            csum_type: ChecksumType::Crc32c,
            root_level: 0,
            chunk_root_level: 0,
            log_root_level: 0,
            dev_item: DevItem {
                device_id: ObjectId(1),
                num_bytes: end as u64,
                num_bytes_used: 0,
                generation: self.generation,
                dev_uuid: Uuid([0x11; 16]),
                fs_uuid: self.fsid,
            },
            label: "synth".to_owned(),
            metadata_uuid: Uuid::ZERO,
            block_group_root: LogicalAddr::ZERO,
            block_group_root_generation: Generation(0),
            block_group_root_level: 0,
            sys_chunk_array: Vec::new(),
        };
        tweak(&mut sb);
        TreeFs::new(lv, sb)
    }
}

// ── Item-body encoders ──────────────────────────────────────────────────────

/// Encode a v2 ROOT_ITEM body.
#[must_use]
pub fn root_item_body(
    bytenr: LogicalAddr,
    level: u8,
    generation: Generation,
    root_dirid: ObjectId,
    uuid: Uuid,
    parent_uuid: Uuid,
) -> Vec<u8> {
    let mut raw = vec![0_u8; 439];
    raw[160..168].copy_from_slice(&generation.0.to_le_bytes());
    raw[168..176].copy_from_slice(&root_dirid.0.to_le_bytes());
    raw[176..184].copy_from_slice(&bytenr.0.to_le_bytes());
    raw[238] = level;
    raw[247..263].copy_from_slice(&uuid.0);
    raw[263..279].copy_from_slice(&parent_uuid.0);
    raw
}

/// Encode an INODE_ITEM body with the given flags.
#[must_use]
pub fn inode_item_body(flags: u64) -> Vec<u8> {
    let mut raw = vec![0_u8; 160];
    raw[0..8].copy_from_slice(&1_u64.to_le_bytes()); // generation
    raw[40..44].copy_from_slice(&1_u32.to_le_bytes()); // nlink
    raw[52..56].copy_from_slice(&0o100_644_u32.to_le_bytes()); // mode
    raw[64..72].copy_from_slice(&flags.to_le_bytes());
    raw
}

/// Encode a single directory entry body (DIR_ITEM / DIR_INDEX).
#[must_use]
pub fn dir_entry_body(location: Key, entry_type: u8, name: &[u8]) -> Vec<u8> {
    let mut raw = vec![0_u8; 30];
    raw[0..8].copy_from_slice(&location.object_id.0.to_le_bytes());
    raw[8] = location.item_type.0;
    raw[9..17].copy_from_slice(&location.offset.to_le_bytes());
    raw[27..29].copy_from_slice(&(name.len() as u16).to_le_bytes());
    raw[29] = entry_type;
    raw.extend_from_slice(name);
    raw
}

/// Encode a UUID_SUBVOL body mapping to one subvolume id.
#[must_use]
pub fn uuid_map_body(subvol: ObjectId) -> Vec<u8> {
    subvol.0.to_le_bytes().to_vec()
}

/// Encode an EXTENT_CSUM run of `blocks` zeroed digests.
#[must_use]
pub fn csum_run_body(blocks: usize, digest_len: usize) -> Vec<u8> {
    vec![0_u8; blocks * digest_len]
}

/// Encode a regular (non-inline) EXTENT_DATA body.
#[must_use]
pub fn file_extent_body(disk_bytenr: LogicalAddr, num_bytes: u64) -> Vec<u8> {
    let mut raw = vec![0_u8; 53];
    raw[20] = 1; // regular
    raw[21..29].copy_from_slice(&disk_bytenr.0.to_le_bytes());
    raw[29..37].copy_from_slice(&num_bytes.to_le_bytes());
    raw[45..53].copy_from_slice(&num_bytes.to_le_bytes());
    raw
}

/// Encode a CHUNK_ITEM body with single-device stripes.
#[must_use]
pub fn chunk_item_body(size: u64, stripes: &[(u64, u64)], flags: u64) -> Vec<u8> {
    let mut raw = vec![0_u8; ChunkItem::FIXED_SIZE + stripes.len() * ChunkItem::STRIPE_SIZE];
    raw[0..8].copy_from_slice(&size.to_le_bytes());
    raw[8..16].copy_from_slice(&ObjectId::EXTENT_TREE.0.to_le_bytes());
    raw[16..24].copy_from_slice(&0x1_0000_u64.to_le_bytes()); // stripe_len
    raw[24..32].copy_from_slice(&flags.to_le_bytes());
    raw[44..46].copy_from_slice(&(stripes.len() as u16).to_le_bytes());
    for (i, (devid, offset)) in stripes.iter().enumerate() {
        let base = ChunkItem::FIXED_SIZE + i * ChunkItem::STRIPE_SIZE;
        raw[base..base + 8].copy_from_slice(&devid.to_le_bytes());
        raw[base + 8..base + 16].copy_from_slice(&offset.to_le_bytes());
    }
    raw
}

/// A `Cx` plus the usual key shorthand, re-exported for tests.
#[must_use]
pub fn test_cx() -> Cx {
    Cx::for_testing()
}

/// Shorthand for building keys in tests.
#[must_use]
pub fn key(object_id: u64, item_type: ItemType, offset: u64) -> Key {
    Key::new(ObjectId(object_id), item_type, offset)
}
