//! Superblock codec.
//!
//! The superblock lives at fixed mirror offsets on every device. Besides
//! the tree roots it embeds `sys_chunk_array`, a bootstrap list of
//! `(key, chunk)` pairs that makes the chunk tree readable before the
//! chunk tree itself can be mapped.

use crate::csum::{csum_type_of_region, ChecksumType};
use crate::item::{ChunkItem, DevItem};
use rfs_types::{
    read_fixed, read_key, read_le_u16, read_le_u32, read_le_u64, trim_nul_padded, Generation,
    ItemType, Key, LogicalAddr, ObjectId, ParseError, Uuid, INCOMPAT_METADATA_UUID, KEY_SIZE,
    MAGIC, MAX_LEVEL, SUPERBLOCK_SIZE, SYS_CHUNK_ARRAY_MAX,
};
use serde::{Deserialize, Serialize};

const LABEL_OFFSET: usize = 0x12B;
const LABEL_LEN: usize = 256;
const SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;
const MAX_BLOCK_SIZE: u32 = 256 * 1024;

/// One bootstrap entry from `sys_chunk_array`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysChunk {
    pub key: Key,
    pub chunk: ChunkItem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub csum: [u8; 32],
    pub fsid: Uuid,
    /// Physical address this copy was written at (differs per mirror).
    pub bytenr: u64,
    pub flags: u64,
    pub generation: Generation,
    pub root_tree: LogicalAddr,
    pub chunk_tree: LogicalAddr,
    pub log_tree: LogicalAddr,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub root_dir_objectid: ObjectId,
    pub num_devices: u64,
    pub sector_size: u32,
    pub node_size: u32,
    pub sys_chunk_array_size: u32,
    pub chunk_root_generation: Generation,
    pub compat_flags: u64,
    pub compat_ro_flags: u64,
    pub incompat_flags: u64,
    pub csum_type: ChecksumType,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    /// The DEV_ITEM for the device this copy was read from.
    pub dev_item: DevItem,
    pub label: String,
    pub metadata_uuid: Uuid,
    pub block_group_root: LogicalAddr,
    pub block_group_root_generation: Generation,
    pub block_group_root_level: u8,
    pub sys_chunk_array: Vec<u8>,
}

impl Superblock {
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u64(region, 0x40)?;
        if magic != MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: MAGIC,
                actual: magic,
            });
        }

        let sector_size = read_le_u32(region, 0x90)?;
        let node_size = read_le_u32(region, 0x94)?;
        if sector_size == 0 || !sector_size.is_power_of_two() || sector_size > MAX_BLOCK_SIZE {
            return Err(ParseError::InvalidField {
                field: "sector_size",
                reason: "must be a power of two within bounds",
            });
        }
        if node_size == 0 || !node_size.is_power_of_two() || node_size > MAX_BLOCK_SIZE {
            return Err(ParseError::InvalidField {
                field: "node_size",
                reason: "must be a power of two within bounds",
            });
        }

        let root_level = region[0xC6];
        let chunk_root_level = region[0xC7];
        let log_root_level = region[0xC8];
        if root_level > MAX_LEVEL || chunk_root_level > MAX_LEVEL || log_root_level > MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "root_level",
                reason: "exceeds maximum tree depth",
            });
        }

        let sys_chunk_array_size = read_le_u32(region, 0xA0)?;
        let sys_len = usize::try_from(sys_chunk_array_size).map_err(|_| {
            ParseError::IntegerConversion {
                field: "sys_chunk_array_size",
            }
        })?;
        if sys_len > SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                reason: "exceeds the 2048-byte embedded array",
            });
        }
        let sys_chunk_array =
            rfs_types::ensure_slice(region, SYS_CHUNK_ARRAY_OFFSET, sys_len)?.to_vec();

        Ok(Self {
            csum: read_fixed::<32>(region, 0x00)?,
            fsid: Uuid(read_fixed::<16>(region, 0x20)?),
            bytenr: read_le_u64(region, 0x30)?,
            flags: read_le_u64(region, 0x38)?,
            generation: Generation(read_le_u64(region, 0x48)?),
            root_tree: LogicalAddr(rfs_types::read_le_i64(region, 0x50)?),
            chunk_tree: LogicalAddr(rfs_types::read_le_i64(region, 0x58)?),
            log_tree: LogicalAddr(rfs_types::read_le_i64(region, 0x60)?),
            total_bytes: read_le_u64(region, 0x70)?,
            bytes_used: read_le_u64(region, 0x78)?,
            root_dir_objectid: ObjectId(read_le_u64(region, 0x80)?),
            num_devices: read_le_u64(region, 0x88)?,
            sector_size,
            node_size,
            sys_chunk_array_size,
            chunk_root_generation: Generation(read_le_u64(region, 0xA4)?),
            compat_flags: read_le_u64(region, 0xAC)?,
            compat_ro_flags: read_le_u64(region, 0xB4)?,
            incompat_flags: read_le_u64(region, 0xBC)?,
            csum_type: ChecksumType::from_tag(read_le_u16(region, 0xC4)?)?,
            root_level,
            chunk_root_level,
            log_root_level,
            dev_item: DevItem::parse(&region[0xC9..0xC9 + DevItem::DISK_SIZE])?,
            label: trim_nul_padded(&read_fixed::<LABEL_LEN>(region, LABEL_OFFSET)?),
            metadata_uuid: Uuid(read_fixed::<16>(region, 0x23B)?),
            block_group_root: LogicalAddr(rfs_types::read_le_i64(region, 0x253)?),
            block_group_root_generation: Generation(read_le_u64(region, 0x25B)?),
            block_group_root_level: region[0x263],
            sys_chunk_array,
        })
    }

    /// Verify the stored checksum over `region[0x20..]`, using the
    /// algorithm tag embedded in the region itself.
    pub fn verify_checksum(region: &[u8]) -> Result<(), ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }
        let typ = csum_type_of_region(region)?;
        if typ.verify(&region[0x20..SUPERBLOCK_SIZE], &region[..0x20]) {
            Ok(())
        } else {
            Err(ParseError::InvalidField {
                field: "superblock_csum",
                reason: "checksum mismatch",
            })
        }
    }

    /// The UUID stamped on metadata blocks: `metadata_uuid` when the
    /// incompat flag selects it, the filesystem UUID otherwise.
    #[must_use]
    pub fn effective_metadata_uuid(&self) -> Uuid {
        if self.incompat_flags & INCOMPAT_METADATA_UUID != 0 && !self.metadata_uuid.is_zero() {
            self.metadata_uuid
        } else {
            self.fsid
        }
    }

    /// Decode the embedded bootstrap chunks.
    pub fn sys_chunks(&self) -> Result<Vec<SysChunk>, ParseError> {
        let data = &self.sys_chunk_array;
        let mut out = Vec::new();
        let mut cur = 0_usize;
        while cur < data.len() {
            let key = read_key(data, cur)?;
            if key.item_type != ItemType::CHUNK_ITEM {
                return Err(ParseError::InvalidField {
                    field: "sys_chunk_array",
                    reason: "entry key is not a CHUNK_ITEM",
                });
            }
            cur += KEY_SIZE;
            let (chunk, used) = ChunkItem::parse_embedded(data, cur)?;
            cur += used;
            out.push(SysChunk { key, chunk });
        }
        Ok(out)
    }
}
