//! Chunk and dev-extent mappings and their merge-on-insert unions.

use rfs_container::RangeExt;
use rfs_error::{ConflictKind, Result, RfsError};
use rfs_types::{
    AddrDelta, BlockGroupFlags, LogicalAddr, PhysicalAddr, QualifiedPhysicalAddr,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// logical → [physical]: one contiguous logical range and its replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMapping {
    pub laddr: LogicalAddr,
    /// Canonically ordered; more than one stripe means DUP/RAID
    /// replication of identical content.
    pub paddrs: Vec<QualifiedPhysicalAddr>,
    pub size: AddrDelta,
    pub size_locked: bool,
    pub flags: Option<BlockGroupFlags>,
}

impl RangeExt for ChunkMapping {
    type Pos = i64;
    fn range_beg(&self) -> i64 {
        self.laddr.0
    }
    fn range_end(&self) -> i64 {
        self.laddr.0 + self.size.0
    }
}

impl ChunkMapping {
    pub fn end(&self) -> LogicalAddr {
        self.laddr + self.size
    }

    /// Merge `self` with overlapping chunks into one covering chunk.
    ///
    /// The union's logical range is the bounding range; stripes are
    /// back-projected to the union start and deduplicated; any
    /// size-locked member must already span the union.
    pub fn union(&self, others: &[ChunkMapping]) -> Result<ChunkMapping> {
        let mut beg = self.laddr;
        let mut end = self.end();
        for chunk in others {
            beg = beg.min(chunk.laddr);
            end = end.max(chunk.end());
        }
        let mut ret = ChunkMapping {
            laddr: beg,
            paddrs: Vec::new(),
            size: end - beg,
            size_locked: false,
            flags: None,
        };

        let mut paddrs = BTreeSet::new();
        for chunk in std::iter::once(self).chain(others) {
            if chunk.size_locked {
                ret.size_locked = true;
                if ret.size != chunk.size {
                    return Err(RfsError::MappingConflict {
                        kind: ConflictKind::SizeLocked,
                        detail: format!(
                            "member chunk at {} has locked size={}, but the union would have size={}",
                            chunk.laddr, chunk.size, ret.size
                        ),
                    });
                }
            }
            let offset_within_ret = chunk.laddr - ret.laddr;
            for stripe in &chunk.paddrs {
                paddrs.insert(stripe.add(-offset_within_ret));
            }
            ret.flags = merge_flags(ret.flags, chunk.flags)?;
        }
        ret.paddrs = paddrs.into_iter().collect();
        Ok(ret)
    }
}

/// physical → logical: the per-device inverse of a chunk stripe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevExtMapping {
    pub paddr: PhysicalAddr,
    pub laddr: LogicalAddr,
    pub size: AddrDelta,
    pub size_locked: bool,
    pub flags: Option<BlockGroupFlags>,
}

impl RangeExt for DevExtMapping {
    type Pos = i64;
    fn range_beg(&self) -> i64 {
        self.paddr.0
    }
    fn range_end(&self) -> i64 {
        self.paddr.0 + self.size.0
    }
}

impl DevExtMapping {
    pub fn end(&self) -> PhysicalAddr {
        self.paddr + self.size
    }

    /// Merge `self` with overlapping dev-extents on the same device.
    ///
    /// On top of the chunk rules, every member's logical address must
    /// back-project to the same union logical address exactly.
    pub fn union(&self, others: &[DevExtMapping]) -> Result<DevExtMapping> {
        let mut beg = self.paddr;
        let mut end = self.end();
        for ext in others {
            beg = beg.min(ext.paddr);
            end = end.max(ext.end());
        }
        let mut ret = DevExtMapping {
            paddr: beg,
            laddr: LogicalAddr::ZERO,
            size: end - beg,
            size_locked: false,
            flags: None,
        };

        let mut first = true;
        for ext in std::iter::once(self).chain(others) {
            if ext.size_locked {
                ret.size_locked = true;
                if ret.size != ext.size {
                    return Err(RfsError::MappingConflict {
                        kind: ConflictKind::SizeLocked,
                        detail: format!(
                            "member dev-extent at {} has locked size={}, but the union would have size={}",
                            ext.paddr, ext.size, ret.size
                        ),
                    });
                }
            }
            let offset_within_ret = ext.paddr - ret.paddr;
            let laddr = ext.laddr + -offset_within_ret;
            if first {
                ret.laddr = laddr;
                first = false;
            } else if laddr != ret.laddr {
                return Err(RfsError::MappingConflict {
                    kind: ConflictKind::DevExt,
                    detail: format!(
                        "dev-extents disagree on the logical address: {} != {}",
                        ret.laddr, laddr
                    ),
                });
            }
            ret.flags = merge_flags(ret.flags, ext.flags)?;
        }
        Ok(ret)
    }
}

/// First non-empty wins; differing non-empty flags are a conflict.
fn merge_flags(
    acc: Option<BlockGroupFlags>,
    next: Option<BlockGroupFlags>,
) -> Result<Option<BlockGroupFlags>> {
    match (acc, next) {
        (None, next) => Ok(next),
        (acc, None) => Ok(acc),
        (Some(a), Some(b)) if a == b => Ok(Some(a)),
        (Some(a), Some(b)) => Err(RfsError::MappingConflict {
            kind: ConflictKind::Flags,
            detail: format!("mismatched flags: {a} != {b}"),
        }),
    }
}
