//! Tree-node codec.
//!
//! A node is a 101-byte header followed by either keypointers (internal
//! nodes) or an item table plus bodies packed from the end of the block
//! (leaves). Structural damage to the header or item table fails the
//! parse; damage inside one item body only poisons that item.

use crate::csum::ChecksumType;
use crate::item::ItemBody;
use rfs_types::{
    read_fixed, read_key, read_le_u32, read_le_u64, Generation, Key, LogicalAddr, ObjectId,
    ParseError, TreeId, Uuid, KEY_PTR_SIZE, KEY_SIZE, LEAF_ITEM_SIZE, MAX_LEVEL,
    NODE_HEADER_SIZE,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeader {
    pub csum: [u8; 32],
    pub metadata_uuid: Uuid,
    /// The node's own logical address.
    pub addr: LogicalAddr,
    /// 7 flag bytes, zero-extended.
    pub flags: u64,
    pub backref_rev: u8,
    pub chunk_tree_uuid: Uuid,
    pub generation: Generation,
    pub owner: TreeId,
    pub num_items: u32,
    /// 0 for leaves.
    pub level: u8,
}

impl NodeHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < NODE_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: NODE_HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        let flag_bytes = read_fixed::<7>(block, 0x38)?;
        let mut flags = [0_u8; 8];
        flags[..7].copy_from_slice(&flag_bytes);

        Ok(Self {
            csum: read_fixed::<32>(block, 0x00)?,
            metadata_uuid: Uuid(read_fixed::<16>(block, 0x20)?),
            addr: LogicalAddr(rfs_types::read_le_i64(block, 0x30)?),
            flags: u64::from_le_bytes(flags),
            backref_rev: block[0x3F],
            chunk_tree_uuid: Uuid(read_fixed::<16>(block, 0x40)?),
            generation: Generation(read_le_u64(block, 0x50)?),
            owner: ObjectId(read_le_u64(block, 0x58)?),
            num_items: read_le_u32(block, 0x60)?,
            level: block[0x64],
        })
    }

    /// Structural sanity: level bound and item count vs block capacity.
    pub fn validate(&self, node_size: usize) -> Result<(), ParseError> {
        if self.level > MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree depth",
            });
        }
        let payload = node_size.saturating_sub(NODE_HEADER_SIZE);
        let record = if self.level == 0 {
            LEAF_ITEM_SIZE
        } else {
            KEY_PTR_SIZE
        };
        let nritems = usize::try_from(self.num_items)
            .map_err(|_| ParseError::IntegerConversion { field: "num_items" })?;
        if nritems > payload / record {
            return Err(ParseError::InvalidField {
                field: "num_items",
                reason: "item count exceeds node capacity",
            });
        }
        Ok(())
    }
}

/// An internal node's child pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPointer {
    pub key: Key,
    pub target: LogicalAddr,
    pub generation: Generation,
}

/// One decoded leaf item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafItem {
    pub key: Key,
    /// On-disk body size, used by searcher callbacks.
    pub data_size: u32,
    pub body: ItemBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeBody {
    Internal(Vec<KeyPointer>),
    Leaf(Vec<LeafItem>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub head: NodeHeader,
    pub body: NodeBody,
}

impl Node {
    /// Parse a whole node block (header plus body).
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let head = NodeHeader::parse(block)?;
        head.validate(block.len())?;
        let nritems = usize::try_from(head.num_items)
            .map_err(|_| ParseError::IntegerConversion { field: "num_items" })?;

        let body = if head.level == 0 {
            let mut items = Vec::with_capacity(nritems);
            for idx in 0..nritems {
                let base = NODE_HEADER_SIZE + idx * LEAF_ITEM_SIZE;
                let key = read_key(block, base)?;
                let data_offset = read_le_u32(block, base + KEY_SIZE)?;
                let data_size = read_le_u32(block, base + KEY_SIZE + 4)?;

                // Bodies are packed from the end of the node; offsets are
                // relative to the end of the header.
                let body = match body_slice(block, data_offset, data_size) {
                    Ok(data) => ItemBody::parse(key, data),
                    Err(err) => ItemBody::Error(crate::item::ItemError {
                        bytes: Vec::new(),
                        reason: err.to_string(),
                    }),
                };
                items.push(LeafItem {
                    key,
                    data_size,
                    body,
                });
            }
            NodeBody::Leaf(items)
        } else {
            let mut ptrs = Vec::with_capacity(nritems);
            for idx in 0..nritems {
                let base = NODE_HEADER_SIZE + idx * KEY_PTR_SIZE;
                let key = read_key(block, base)?;
                let target = LogicalAddr(rfs_types::read_le_i64(block, base + KEY_SIZE)?);
                let generation = Generation(read_le_u64(block, base + KEY_SIZE + 8)?);
                if target == LogicalAddr::ZERO {
                    return Err(ParseError::InvalidField {
                        field: "keypointer",
                        reason: "child pointer is zero",
                    });
                }
                ptrs.push(KeyPointer {
                    key,
                    target,
                    generation,
                });
            }
            NodeBody::Internal(ptrs)
        };

        Ok(Self { head, body })
    }

    /// First key in the node (item key for leaves, keypointer for internals).
    #[must_use]
    pub fn min_item_key(&self) -> Option<Key> {
        match &self.body {
            NodeBody::Leaf(items) => items.first().map(|i| i.key),
            NodeBody::Internal(ptrs) => ptrs.first().map(|p| p.key),
        }
    }

    /// Last key in the node.
    #[must_use]
    pub fn max_item_key(&self) -> Option<Key> {
        match &self.body {
            NodeBody::Leaf(items) => items.last().map(|i| i.key),
            NodeBody::Internal(ptrs) => ptrs.last().map(|p| p.key),
        }
    }

    #[must_use]
    pub fn leaf_items(&self) -> &[LeafItem] {
        match &self.body {
            NodeBody::Leaf(items) => items,
            NodeBody::Internal(_) => &[],
        }
    }

    #[must_use]
    pub fn key_pointers(&self) -> &[KeyPointer] {
        match &self.body {
            NodeBody::Internal(ptrs) => ptrs,
            NodeBody::Leaf(_) => &[],
        }
    }
}

fn body_slice(block: &[u8], data_offset: u32, data_size: u32) -> Result<&[u8], ParseError> {
    let beg = NODE_HEADER_SIZE
        .checked_add(usize::try_from(data_offset).map_err(|_| {
            ParseError::IntegerConversion {
                field: "data_offset",
            }
        })?)
        .ok_or(ParseError::InvalidField {
            field: "data_offset",
            reason: "overflow",
        })?;
    let len = usize::try_from(data_size)
        .map_err(|_| ParseError::IntegerConversion { field: "data_size" })?;
    rfs_types::ensure_slice(block, beg, len)
}

/// Verify the stored node checksum over everything after the csum field.
///
/// Returns `Ok(false)` on mismatch; errors only when the block is too
/// short to carry a header.
pub fn verify_node_checksum(block: &[u8], csum_type: ChecksumType) -> Result<bool, ParseError> {
    if block.len() < NODE_HEADER_SIZE {
        return Err(ParseError::InsufficientData {
            needed: NODE_HEADER_SIZE,
            offset: 0,
            actual: block.len(),
        });
    }
    Ok(csum_type.verify(&block[0x20..], &block[..0x20]))
}
