//! The closed union of leaf-item bodies.
//!
//! Decoding dispatches on the key's item-type code. A body that fails to
//! decode becomes `ItemBody::Error` carrying the raw bytes and the reason;
//! a malformed item never fails the containing node.

use rfs_types::{
    read_fixed, read_key, read_le_u16, read_le_u32, read_le_u64, AddrDelta, BlockGroupFlags,
    Generation, ItemType, Key, LogicalAddr, ObjectId, ParseError, Uuid, CSUM_BLOCK_SIZE,
    INODE_NODATASUM, KEY_SIZE,
};
use serde::{Deserialize, Serialize};

const EXTENT_FLAG_TREE_BLOCK: u64 = 1 << 1;

/// Inline file-extent payloads cannot exceed the sector size.
const FILE_EXTENT_INLINE_HEADER: usize = 21;
const FILE_EXTENT_REG_SIZE: usize = 53;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

fn read_timespec(data: &[u8], offset: usize) -> Result<Timespec, ParseError> {
    Ok(Timespec {
        sec: rfs_types::read_le_i64(data, offset)?,
        nsec: read_le_u32(data, offset + 8)?,
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeItem {
    pub generation: Generation,
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub flags: u64,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
    pub otime: Timespec,
}

impl InodeItem {
    pub const DISK_SIZE: usize = 160;

    /// True when file data carries no checksums.
    #[must_use]
    pub fn has_no_data_sum(&self) -> bool {
        self.flags & INODE_NODATASUM != 0
    }

    fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            generation: Generation(read_le_u64(data, 0)?),
            transid: read_le_u64(data, 8)?,
            size: read_le_u64(data, 16)?,
            nbytes: read_le_u64(data, 24)?,
            nlink: read_le_u32(data, 40)?,
            uid: read_le_u32(data, 44)?,
            gid: read_le_u32(data, 48)?,
            mode: read_le_u32(data, 52)?,
            flags: read_le_u64(data, 64)?,
            atime: read_timespec(data, 112)?,
            ctime: read_timespec(data, 124)?,
            mtime: read_timespec(data, 136)?,
            otime: read_timespec(data, 148)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRef {
    pub index: u64,
    pub name: Vec<u8>,
}

fn parse_inode_refs(data: &[u8]) -> Result<Vec<InodeRef>, ParseError> {
    let mut refs = Vec::new();
    let mut cur = 0_usize;
    while cur < data.len() {
        let index = read_le_u64(data, cur)?;
        let name_len = usize::from(read_le_u16(data, cur + 8)?);
        let name = rfs_types::ensure_slice(data, cur + 10, name_len)?.to_vec();
        refs.push(InodeRef { index, name });
        cur += 10 + name_len;
    }
    Ok(refs)
}

/// A directory entry, shared by DIR_ITEM, DIR_INDEX, and XATTR_ITEM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub location: Key,
    pub transid: u64,
    pub entry_type: u8,
    pub name: Vec<u8>,
    pub data: Vec<u8>,
}

fn parse_dir_entries(data: &[u8]) -> Result<Vec<DirEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut cur = 0_usize;
    while cur < data.len() {
        let location = read_key(data, cur)?;
        let transid = read_le_u64(data, cur + KEY_SIZE)?;
        let data_len = usize::from(read_le_u16(data, cur + 25)?);
        let name_len = usize::from(read_le_u16(data, cur + 27)?);
        let entry_type = *rfs_types::ensure_slice(data, cur + 29, 1)?
            .first()
            .ok_or(ParseError::InvalidField {
                field: "entry_type",
                reason: "missing byte",
            })?;
        let name = rfs_types::ensure_slice(data, cur + 30, name_len)?.to_vec();
        let body = rfs_types::ensure_slice(data, cur + 30 + name_len, data_len)?.to_vec();
        entries.push(DirEntry {
            location,
            transid,
            entry_type,
            name,
            data: body,
        });
        cur += 30 + name_len + data_len;
    }
    Ok(entries)
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootItem {
    pub inode: InodeItem,
    pub generation: Generation,
    pub root_dirid: ObjectId,
    pub bytenr: LogicalAddr,
    pub last_snapshot: u64,
    pub flags: u64,
    pub refs: u32,
    pub level: u8,
    pub uuid: Uuid,
    pub parent_uuid: Uuid,
    pub received_uuid: Uuid,
    pub ctransid: u64,
}

impl RootItem {
    const V0_SIZE: usize = 239;
    const V2_SIZE: usize = 439;

    fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let inode = InodeItem::parse(data)?;
        let mut item = Self {
            inode,
            generation: Generation(read_le_u64(data, 160)?),
            root_dirid: ObjectId(read_le_u64(data, 168)?),
            bytenr: LogicalAddr(rfs_types::read_le_i64(data, 176)?),
            last_snapshot: read_le_u64(data, 200)?,
            flags: read_le_u64(data, 208)?,
            refs: read_le_u32(data, 216)?,
            level: *rfs_types::ensure_slice(data, 238, 1)?.first().ok_or(
                ParseError::InvalidField {
                    field: "level",
                    reason: "missing byte",
                },
            )?,
            uuid: Uuid::ZERO,
            parent_uuid: Uuid::ZERO,
            received_uuid: Uuid::ZERO,
            ctransid: 0,
        };
        // The v2 tail (uuid, parent uuid, transids, timestamps) is absent
        // on filesystems older than the root_item expansion.
        if data.len() >= Self::V2_SIZE {
            item.uuid = Uuid(read_fixed::<16>(data, 247)?);
            item.parent_uuid = Uuid(read_fixed::<16>(data, 263)?);
            item.received_uuid = Uuid(read_fixed::<16>(data, 279)?);
            item.ctransid = read_le_u64(data, 295)?;
        }
        Ok(item)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRef {
    pub dirid: ObjectId,
    pub sequence: u64,
    pub name: Vec<u8>,
}

impl RootRef {
    fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let name_len = usize::from(read_le_u16(data, 16)?);
        Ok(Self {
            dirid: ObjectId(read_le_u64(data, 0)?),
            sequence: read_le_u64(data, 8)?,
            name: rfs_types::ensure_slice(data, 18, name_len)?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileExtentKind {
    Inline,
    Regular,
    Prealloc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtent {
    pub generation: Generation,
    pub ram_bytes: u64,
    pub compression: u8,
    pub kind: FileExtentKind,
    /// Inline payload; empty for regular/prealloc extents.
    pub inline_data: Vec<u8>,
    pub disk_bytenr: LogicalAddr,
    pub disk_num_bytes: u64,
    pub offset: u64,
    pub num_bytes: u64,
}

impl FileExtent {
    /// Bytes of the file covered by this extent.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self.kind {
            FileExtentKind::Inline => {
                if self.compression != 0 {
                    self.ram_bytes
                } else {
                    self.inline_data.len() as u64
                }
            }
            FileExtentKind::Regular | FileExtentKind::Prealloc => self.num_bytes,
        }
    }

    fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let generation = Generation(read_le_u64(data, 0)?);
        let ram_bytes = read_le_u64(data, 8)?;
        let compression = *rfs_types::ensure_slice(data, 16, 1)?.first().ok_or(
            ParseError::InvalidField {
                field: "compression",
                reason: "missing byte",
            },
        )?;
        let kind_raw = *rfs_types::ensure_slice(data, 20, 1)?.first().ok_or(
            ParseError::InvalidField {
                field: "extent_kind",
                reason: "missing byte",
            },
        )?;
        match kind_raw {
            0 => Ok(Self {
                generation,
                ram_bytes,
                compression,
                kind: FileExtentKind::Inline,
                inline_data: data[FILE_EXTENT_INLINE_HEADER..].to_vec(),
                disk_bytenr: LogicalAddr::ZERO,
                disk_num_bytes: 0,
                offset: 0,
                num_bytes: 0,
            }),
            1 | 2 => {
                if data.len() < FILE_EXTENT_REG_SIZE {
                    return Err(ParseError::InsufficientData {
                        needed: FILE_EXTENT_REG_SIZE,
                        offset: 0,
                        actual: data.len(),
                    });
                }
                Ok(Self {
                    generation,
                    ram_bytes,
                    compression,
                    kind: if kind_raw == 1 {
                        FileExtentKind::Regular
                    } else {
                        FileExtentKind::Prealloc
                    },
                    inline_data: Vec::new(),
                    disk_bytenr: LogicalAddr(rfs_types::read_le_i64(data, 21)?),
                    disk_num_bytes: read_le_u64(data, 29)?,
                    offset: read_le_u64(data, 37)?,
                    num_bytes: read_le_u64(data, 45)?,
                })
            }
            _ => Err(ParseError::InvalidField {
                field: "extent_kind",
                reason: "unknown file-extent type",
            }),
        }
    }
}

/// A run of per-4KiB data checksums starting at the key's offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentCsum {
    pub sums: Vec<u8>,
}

impl ExtentCsum {
    /// Logical bytes covered by this run, given the per-block digest width.
    #[must_use]
    pub fn run_len(&self, digest_len: usize) -> u64 {
        if digest_len == 0 {
            return 0;
        }
        (self.sums.len() / digest_len) as u64 * CSUM_BLOCK_SIZE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentDataRef {
    pub root: ObjectId,
    pub object_id: ObjectId,
    pub offset: u64,
    pub count: u32,
}

impl ExtentDataRef {
    const DISK_SIZE: usize = 28;

    fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            root: ObjectId(read_le_u64(data, offset)?),
            object_id: ObjectId(read_le_u64(data, offset + 8)?),
            offset: read_le_u64(data, offset + 16)?,
            count: read_le_u32(data, offset + 24)?,
        })
    }
}

/// An inline backref inside an EXTENT_ITEM or METADATA_ITEM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InlineRef {
    TreeBlock { offset: u64 },
    SharedBlock { offset: u64 },
    Data(ExtentDataRef),
    SharedData { offset: u64, count: u32 },
}

fn parse_inline_refs(data: &[u8], mut cur: usize) -> Result<Vec<InlineRef>, ParseError> {
    let mut refs = Vec::new();
    while cur < data.len() {
        let typ = ItemType(data[cur]);
        cur += 1;
        match typ {
            ItemType::TREE_BLOCK_REF => {
                refs.push(InlineRef::TreeBlock {
                    offset: read_le_u64(data, cur)?,
                });
                cur += 8;
            }
            ItemType::SHARED_BLOCK_REF => {
                refs.push(InlineRef::SharedBlock {
                    offset: read_le_u64(data, cur)?,
                });
                cur += 8;
            }
            ItemType::EXTENT_DATA_REF => {
                refs.push(InlineRef::Data(ExtentDataRef::parse(data, cur)?));
                cur += ExtentDataRef::DISK_SIZE;
            }
            ItemType::SHARED_DATA_REF => {
                refs.push(InlineRef::SharedData {
                    offset: read_le_u64(data, cur)?,
                    count: read_le_u32(data, cur + 8)?,
                });
                cur += 12;
            }
            _ => {
                return Err(ParseError::InvalidField {
                    field: "inline_ref",
                    reason: "unexpected inline backref type",
                })
            }
        }
    }
    Ok(refs)
}

fn data_backref_roots(refs: &[InlineRef]) -> Vec<ObjectId> {
    refs.iter()
        .filter_map(|r| match r {
            InlineRef::Data(dref) => Some(dref.root),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentItem {
    pub refs: u64,
    pub generation: Generation,
    pub flags: u64,
    pub inline_refs: Vec<InlineRef>,
}

impl ExtentItem {
    /// Roots referenced by inline EXTENT_DATA_REF entries.
    #[must_use]
    pub fn data_backref_roots(&self) -> Vec<ObjectId> {
        data_backref_roots(&self.inline_refs)
    }

    fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let refs = read_le_u64(data, 0)?;
        let generation = Generation(read_le_u64(data, 8)?);
        let flags = read_le_u64(data, 16)?;
        let mut cur = 24;
        if flags & EXTENT_FLAG_TREE_BLOCK != 0 {
            // Skip the tree-block info (a key plus a level byte).
            cur += KEY_SIZE + 1;
        }
        Ok(Self {
            refs,
            generation,
            flags,
            inline_refs: parse_inline_refs(data, cur)?,
        })
    }
}

/// Same as `ExtentItem` but without the tree-block info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub refs: u64,
    pub generation: Generation,
    pub flags: u64,
    pub inline_refs: Vec<InlineRef>,
}

impl MetadataItem {
    #[must_use]
    pub fn data_backref_roots(&self) -> Vec<ObjectId> {
        data_backref_roots(&self.inline_refs)
    }

    fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            refs: read_le_u64(data, 0)?,
            generation: Generation(read_le_u64(data, 8)?),
            flags: read_le_u64(data, 16)?,
            inline_refs: parse_inline_refs(data, 24)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGroupItem {
    pub used: u64,
    pub chunk_objectid: ObjectId,
    pub flags: BlockGroupFlags,
}

impl BlockGroupItem {
    fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            used: read_le_u64(data, 0)?,
            chunk_objectid: ObjectId(read_le_u64(data, 8)?),
            flags: BlockGroupFlags(read_le_u64(data, 16)?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevExtentItem {
    pub chunk_tree: ObjectId,
    pub chunk_objectid: ObjectId,
    pub chunk_offset: LogicalAddr,
    pub length: AddrDelta,
}

impl DevExtentItem {
    fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            chunk_tree: ObjectId(read_le_u64(data, 0)?),
            chunk_objectid: ObjectId(read_le_u64(data, 8)?),
            chunk_offset: LogicalAddr(rfs_types::read_le_i64(data, 16)?),
            length: AddrDelta(rfs_types::read_le_i64(data, 24)?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevItem {
    pub device_id: ObjectId,
    pub num_bytes: u64,
    pub num_bytes_used: u64,
    pub generation: Generation,
    pub dev_uuid: Uuid,
    pub fs_uuid: Uuid,
}

impl DevItem {
    pub const DISK_SIZE: usize = 98;

    pub(crate) fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            device_id: ObjectId(read_le_u64(data, 0)?),
            num_bytes: read_le_u64(data, 8)?,
            num_bytes_used: read_le_u64(data, 16)?,
            generation: Generation(read_le_u64(data, 44)?),
            dev_uuid: Uuid(read_fixed::<16>(data, 66)?),
            fs_uuid: Uuid(read_fixed::<16>(data, 82)?),
        })
    }
}

/// One stripe of a chunk: a replica location on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStripe {
    pub device_id: ObjectId,
    pub offset: u64,
    pub dev_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkItem {
    pub size: AddrDelta,
    pub owner: ObjectId,
    pub stripe_len: u64,
    pub flags: BlockGroupFlags,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<ChunkStripe>,
}

impl ChunkItem {
    pub const FIXED_SIZE: usize = 48;
    pub const STRIPE_SIZE: usize = 32;

    /// Parse a chunk at `offset`, returning the item and its encoded size.
    pub(crate) fn parse_embedded(
        data: &[u8],
        offset: usize,
    ) -> Result<(Self, usize), ParseError> {
        let num_stripes = read_le_u16(data, offset + 44)?;
        if num_stripes == 0 {
            return Err(ParseError::InvalidField {
                field: "num_stripes",
                reason: "chunk must have at least one stripe",
            });
        }
        let mut stripes = Vec::with_capacity(usize::from(num_stripes));
        let mut cur = offset + Self::FIXED_SIZE;
        for _ in 0..num_stripes {
            stripes.push(ChunkStripe {
                device_id: ObjectId(read_le_u64(data, cur)?),
                offset: read_le_u64(data, cur + 8)?,
                dev_uuid: Uuid(read_fixed::<16>(data, cur + 16)?),
            });
            cur += Self::STRIPE_SIZE;
        }
        Ok((
            Self {
                size: AddrDelta(rfs_types::read_le_i64(data, offset)?),
                owner: ObjectId(read_le_u64(data, offset + 8)?),
                stripe_len: read_le_u64(data, offset + 16)?,
                flags: BlockGroupFlags(read_le_u64(data, offset + 24)?),
                num_stripes,
                sub_stripes: read_le_u16(data, offset + 46)?,
                stripes,
            },
            cur - offset,
        ))
    }

    fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let (chunk, _) = Self::parse_embedded(data, 0)?;
        Ok(chunk)
    }
}

/// UUID-tree body: the subvolume ids a UUID maps to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidMapItem {
    pub subvol_ids: Vec<ObjectId>,
}

impl UuidMapItem {
    fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() % 8 != 0 {
            return Err(ParseError::InvalidField {
                field: "uuid_map",
                reason: "body length is not a multiple of 8",
            });
        }
        let mut subvol_ids = Vec::with_capacity(data.len() / 8);
        for off in (0..data.len()).step_by(8) {
            subvol_ids.push(ObjectId(read_le_u64(data, off)?));
        }
        Ok(Self { subvol_ids })
    }
}

/// A body that failed to decode; the walk and index layers pass it through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub bytes: Vec<u8>,
    pub reason: String,
}

/// The closed union of item bodies, dispatched on the key's type code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemBody {
    Inode(InodeItem),
    InodeRefs(Vec<InodeRef>),
    DirEntries(Vec<DirEntry>),
    Root(RootItem),
    RootRef(RootRef),
    FileExtent(FileExtent),
    ExtentCsum(ExtentCsum),
    Extent(ExtentItem),
    Metadata(MetadataItem),
    ExtentDataRef(ExtentDataRef),
    BlockGroup(BlockGroupItem),
    DevExtent(DevExtentItem),
    Dev(DevItem),
    Chunk(ChunkItem),
    UuidMap(UuidMapItem),
    /// Bodies the core carries but does not interpret (orphan items,
    /// qgroup relations, persistent items, …).
    Opaque(Vec<u8>),
    Error(ItemError),
}

impl ItemBody {
    /// Decode the body for `key` from `data`. Never fails: a decode
    /// problem yields `ItemBody::Error`.
    #[must_use]
    pub fn parse(key: Key, data: &[u8]) -> Self {
        let result = match key.item_type {
            ItemType::INODE_ITEM => InodeItem::parse(data).map(Self::Inode),
            ItemType::INODE_REF => parse_inode_refs(data).map(Self::InodeRefs),
            ItemType::DIR_ITEM | ItemType::DIR_INDEX | ItemType::XATTR_ITEM => {
                parse_dir_entries(data).map(Self::DirEntries)
            }
            ItemType::ROOT_ITEM => RootItem::parse(data).map(Self::Root),
            ItemType::ROOT_REF | ItemType::ROOT_BACKREF => RootRef::parse(data).map(Self::RootRef),
            ItemType::EXTENT_DATA => FileExtent::parse(data).map(Self::FileExtent),
            ItemType::EXTENT_CSUM => Ok(Self::ExtentCsum(ExtentCsum {
                sums: data.to_vec(),
            })),
            ItemType::EXTENT_ITEM => ExtentItem::parse(data).map(Self::Extent),
            ItemType::METADATA_ITEM => MetadataItem::parse(data).map(Self::Metadata),
            ItemType::EXTENT_DATA_REF => {
                ExtentDataRef::parse(data, 0).map(Self::ExtentDataRef)
            }
            ItemType::BLOCK_GROUP_ITEM => BlockGroupItem::parse(data).map(Self::BlockGroup),
            ItemType::DEV_EXTENT => DevExtentItem::parse(data).map(Self::DevExtent),
            ItemType::DEV_ITEM => DevItem::parse(data).map(Self::Dev),
            ItemType::CHUNK_ITEM => ChunkItem::parse(data).map(Self::Chunk),
            ItemType::UUID_SUBVOL | ItemType::UUID_RECEIVED_SUBVOL => {
                UuidMapItem::parse(data).map(Self::UuidMap)
            }
            ItemType::ORPHAN_ITEM
            | ItemType::QGROUP_RELATION
            | ItemType::PERSISTENT_ITEM
            | ItemType::TREE_BLOCK_REF
            | ItemType::SHARED_BLOCK_REF
            | ItemType::SHARED_DATA_REF => Ok(Self::Opaque(data.to_vec())),
            _ => Err(ParseError::InvalidField {
                field: "item_type",
                reason: "unknown item type",
            }),
        };
        match result {
            Ok(body) => body,
            Err(err) => Self::Error(ItemError {
                bytes: data.to_vec(),
                reason: err.to_string(),
            }),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn inode_bytes(flags: u64) -> Vec<u8> {
        let mut raw = vec![0_u8; InodeItem::DISK_SIZE];
        raw[0..8].copy_from_slice(&7_u64.to_le_bytes()); // generation
        raw[16..24].copy_from_slice(&4096_u64.to_le_bytes()); // size
        raw[40..44].copy_from_slice(&1_u32.to_le_bytes()); // nlink
        raw[52..56].copy_from_slice(&0o100_644_u32.to_le_bytes()); // mode
        raw[64..72].copy_from_slice(&flags.to_le_bytes());
        raw
    }

    #[test]
    fn inode_item_round_trip() {
        let key = Key::new(ObjectId(257), ItemType::INODE_ITEM, 0);
        let ItemBody::Inode(inode) = ItemBody::parse(key, &inode_bytes(INODE_NODATASUM)) else {
            panic!("expected inode body");
        };
        assert_eq!(inode.generation, Generation(7));
        assert_eq!(inode.size, 4096);
        assert!(inode.has_no_data_sum());

        let ItemBody::Inode(inode) = ItemBody::parse(key, &inode_bytes(0)) else {
            panic!("expected inode body");
        };
        assert!(!inode.has_no_data_sum());
    }

    #[test]
    fn truncated_inode_becomes_error_item() {
        let key = Key::new(ObjectId(257), ItemType::INODE_ITEM, 0);
        let body = ItemBody::parse(key, &[0_u8; 10]);
        assert!(body.is_error());
    }

    #[test]
    fn dir_entries_parse_packed_sequence() {
        let mut raw = Vec::new();
        for (name, child) in [(&b"alpha"[..], 100_u64), (&b"beta"[..], 101)] {
            let mut entry = vec![0_u8; 30];
            entry[0..8].copy_from_slice(&child.to_le_bytes());
            entry[8] = ItemType::INODE_ITEM.0;
            entry[27..29].copy_from_slice(&(name.len() as u16).to_le_bytes());
            entry[29] = 1; // regular file
            raw.extend_from_slice(&entry);
            raw.extend_from_slice(name);
        }

        let key = Key::new(ObjectId(256), ItemType::DIR_INDEX, 2);
        let ItemBody::DirEntries(entries) = ItemBody::parse(key, &raw) else {
            panic!("expected dir entries");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b"alpha");
        assert_eq!(entries[0].location.object_id, ObjectId(100));
        assert_eq!(entries[1].name, b"beta");
    }

    #[test]
    fn root_item_with_and_without_v2_tail() {
        let mut raw = vec![0_u8; RootItem::V0_SIZE];
        raw[160..168].copy_from_slice(&9_u64.to_le_bytes()); // generation
        raw[168..176].copy_from_slice(&256_u64.to_le_bytes()); // root_dirid
        raw[176..184].copy_from_slice(&0x4000_u64.to_le_bytes()); // bytenr
        raw[238] = 1; // level

        let key = Key::new(ObjectId(5), ItemType::ROOT_ITEM, 0);
        let ItemBody::Root(root) = ItemBody::parse(key, &raw) else {
            panic!("expected root body");
        };
        assert_eq!(root.bytenr, LogicalAddr(0x4000));
        assert_eq!(root.level, 1);
        assert!(root.parent_uuid.is_zero());

        raw.resize(439, 0);
        raw[263] = 0xAB; // first byte of parent uuid
        let ItemBody::Root(root) = ItemBody::parse(key, &raw) else {
            panic!("expected root body");
        };
        assert_eq!(root.parent_uuid.0[0], 0xAB);
    }

    #[test]
    fn file_extent_sizes() {
        // Inline, uncompressed.
        let mut raw = vec![0_u8; FILE_EXTENT_INLINE_HEADER];
        raw[20] = 0;
        raw.extend_from_slice(b"hello world");
        let key = Key::new(ObjectId(257), ItemType::EXTENT_DATA, 0);
        let ItemBody::FileExtent(fe) = ItemBody::parse(key, &raw) else {
            panic!("expected file extent");
        };
        assert_eq!(fe.kind, FileExtentKind::Inline);
        assert_eq!(fe.size(), 11);

        // Regular.
        let mut raw = vec![0_u8; FILE_EXTENT_REG_SIZE];
        raw[20] = 1;
        raw[21..29].copy_from_slice(&0x10_0000_u64.to_le_bytes());
        raw[45..53].copy_from_slice(&0x2000_u64.to_le_bytes());
        let ItemBody::FileExtent(fe) = ItemBody::parse(key, &raw) else {
            panic!("expected file extent");
        };
        assert_eq!(fe.kind, FileExtentKind::Regular);
        assert_eq!(fe.disk_bytenr, LogicalAddr(0x10_0000));
        assert_eq!(fe.size(), 0x2000);

        // Unknown kind byte.
        let mut raw = vec![0_u8; FILE_EXTENT_REG_SIZE];
        raw[20] = 9;
        assert!(ItemBody::parse(key, &raw).is_error());
    }

    #[test]
    fn extent_csum_run_length() {
        let key = Key::new(ObjectId::EXTENT_CSUM, ItemType::EXTENT_CSUM, 0x1000);
        let ItemBody::ExtentCsum(run) = ItemBody::parse(key, &[0_u8; 16]) else {
            panic!("expected csum run");
        };
        assert_eq!(run.run_len(4), 4 * CSUM_BLOCK_SIZE);
        assert_eq!(run.run_len(8), 2 * CSUM_BLOCK_SIZE);
        assert_eq!(run.run_len(0), 0);
    }

    #[test]
    fn extent_item_harvests_data_backrefs() {
        let mut raw = vec![0_u8; 24];
        raw[0..8].copy_from_slice(&2_u64.to_le_bytes()); // refs
        raw[16..24].copy_from_slice(&1_u64.to_le_bytes()); // DATA flag
        // Inline EXTENT_DATA_REF for root 5.
        raw.push(ItemType::EXTENT_DATA_REF.0);
        let mut dref = vec![0_u8; 28];
        dref[0..8].copy_from_slice(&5_u64.to_le_bytes());
        dref[24..28].copy_from_slice(&1_u32.to_le_bytes());
        raw.extend_from_slice(&dref);
        // Inline SHARED_BLOCK_REF (no root).
        raw.push(ItemType::SHARED_BLOCK_REF.0);
        raw.extend_from_slice(&0xBEEF_u64.to_le_bytes());

        let key = Key::new(ObjectId(0x10_0000), ItemType::EXTENT_ITEM, 0x1000);
        let ItemBody::Extent(extent) = ItemBody::parse(key, &raw) else {
            panic!("expected extent item");
        };
        assert_eq!(extent.refs, 2);
        assert_eq!(extent.data_backref_roots(), vec![ObjectId(5)]);
    }

    #[test]
    fn chunk_item_parses_stripes() {
        let mut raw = vec![0_u8; ChunkItem::FIXED_SIZE + 2 * ChunkItem::STRIPE_SIZE];
        raw[0..8].copy_from_slice(&0x10000_u64.to_le_bytes()); // size
        raw[24..32].copy_from_slice(&BlockGroupFlags::RAID1.0.to_le_bytes());
        raw[44..46].copy_from_slice(&2_u16.to_le_bytes()); // num_stripes
        raw[48..56].copy_from_slice(&1_u64.to_le_bytes()); // stripe 0 devid
        raw[56..64].copy_from_slice(&0x8000_u64.to_le_bytes());
        raw[80..88].copy_from_slice(&2_u64.to_le_bytes()); // stripe 1 devid
        raw[88..96].copy_from_slice(&0x9000_u64.to_le_bytes());

        let key = Key::new(ObjectId::FIRST_CHUNK_TREE, ItemType::CHUNK_ITEM, 0x100000);
        let ItemBody::Chunk(chunk) = ItemBody::parse(key, &raw) else {
            panic!("expected chunk item");
        };
        assert_eq!(chunk.size, AddrDelta(0x10000));
        assert!(chunk.flags.has(BlockGroupFlags::RAID1));
        assert_eq!(chunk.stripes.len(), 2);
        assert_eq!(chunk.stripes[1].offset, 0x9000);

        // Zero stripes is malformed.
        let raw = vec![0_u8; ChunkItem::FIXED_SIZE];
        assert!(ItemBody::parse(key, &raw).is_error());
    }

    #[test]
    fn uuid_map_item() {
        let key = Key::new(ObjectId(0x1234), ItemType::UUID_SUBVOL, 0x5678);
        let ItemBody::UuidMap(map) = ItemBody::parse(key, &258_u64.to_le_bytes()) else {
            panic!("expected uuid map");
        };
        assert_eq!(map.subvol_ids, vec![ObjectId(258)]);
        assert!(ItemBody::parse(key, &[0_u8; 7]).is_error());
    }

    #[test]
    fn unknown_type_is_error_item() {
        let key = Key::new(ObjectId(1), ItemType(200), 0);
        let body = ItemBody::parse(key, b"junk");
        let ItemBody::Error(err) = body else {
            panic!("expected error item");
        };
        assert_eq!(err.bytes, b"junk");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn item_body_parse_never_panics(
            typ in any::<u8>(),
            data in proptest::collection::vec(any::<u8>(), 0..=512),
        ) {
            let key = Key::new(ObjectId(1), ItemType(typ), 0);
            let _ = ItemBody::parse(key, &data);
        }
    }
}
