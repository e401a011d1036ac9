//! The logical volume: two range trees kept in lockstep.

use crate::device::BlockDevice;
use crate::mapping::{ChunkMapping, DevExtMapping};
use asupersync::Cx;
use parking_lot::Mutex;
use rfs_container::{RangeExt, RangeMap};
use rfs_error::{ConflictKind, Result, RfsError};
use rfs_ondisk::{ChunkItem, Superblock};
use rfs_types::{
    AddrDelta, BlockGroupFlags, DeviceId, LogicalAddr, PhysicalAddr, QualifiedPhysicalAddr,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// The flat record accepted by [`LogicalVolume::add_mapping`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub laddr: LogicalAddr,
    pub paddr: QualifiedPhysicalAddr,
    pub size: AddrDelta,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub size_locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<BlockGroupFlags>,
}

#[derive(Default)]
struct Index {
    logical2physical: RangeMap<ChunkMapping>,
    physical2logical: BTreeMap<DeviceId, RangeMap<DevExtMapping>>,
}

/// An in-memory bidirectional index between the logical address space
/// and the physical device pool.
#[derive(Default)]
pub struct LogicalVolume {
    devices: Mutex<BTreeMap<DeviceId, Arc<dyn BlockDevice>>>,
    index: Mutex<Index>,
}

impl LogicalVolume {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device; refuses a duplicate id.
    pub fn add_physical_volume(&self, id: DeviceId, dev: Arc<dyn BlockDevice>) -> Result<()> {
        let mut devices = self.devices.lock();
        if devices.contains_key(&id) {
            return Err(RfsError::MappingConflict {
                kind: ConflictKind::DevExt,
                detail: format!("already have a physical volume with id={id}"),
            });
        }
        devices.insert(id, dev);
        self.index
            .lock()
            .physical2logical
            .entry(id)
            .or_default();
        debug!(target: "rfs::volume", dev = %id, "registered physical volume");
        Ok(())
    }

    #[must_use]
    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.lock().keys().copied().collect()
    }

    #[must_use]
    pub fn device(&self, id: DeviceId) -> Option<Arc<dyn BlockDevice>> {
        self.devices.lock().get(&id).cloned()
    }

    /// One byte past the last mapped logical address.
    #[must_use]
    pub fn size(&self) -> LogicalAddr {
        self.index
            .lock()
            .logical2physical
            .last()
            .map_or(LogicalAddr::ZERO, ChunkMapping::end)
    }

    /// Drop every mapping (used before a fresh re-scan). Devices stay
    /// registered.
    pub fn clear_mappings(&self) {
        let mut index = self.index.lock();
        index.logical2physical.clear();
        for tree in index.physical2logical.values_mut() {
            tree.clear();
        }
    }

    /// Dry-run variant of [`add_mapping`](Self::add_mapping).
    #[must_use]
    pub fn could_add_mapping(&self, mapping: &Mapping) -> bool {
        self.add_mapping_inner(mapping, true).is_ok()
    }

    /// Insert a mapping, merging it with everything it overlaps.
    ///
    /// On any conflict the candidate is not applied and no existing
    /// mapping is mutated.
    pub fn add_mapping(&self, mapping: Mapping) -> Result<()> {
        self.add_mapping_inner(&mapping, false)
    }

    fn add_mapping_inner(&self, m: &Mapping, dry_run: bool) -> Result<()> {
        if !self.devices.lock().contains_key(&m.paddr.dev) {
            return Err(RfsError::DeviceMissing { dev: m.paddr.dev });
        }

        let mut index = self.index.lock();

        // logical → physical
        let new_chunk = ChunkMapping {
            laddr: m.laddr,
            paddrs: vec![m.paddr],
            size: m.size,
            size_locked: m.size_locked,
            flags: m.flags,
        };
        let logical_overlaps = index
            .logical2physical
            .overlapping(new_chunk.range_beg(), new_chunk.range_end());
        let overlapping_stripes: usize =
            logical_overlaps.iter().map(|c| c.paddrs.len()).sum();
        let new_chunk = new_chunk.union(&logical_overlaps)?;

        // physical → logical
        let new_ext = DevExtMapping {
            paddr: m.paddr.addr,
            laddr: m.laddr,
            size: m.size,
            size_locked: m.size_locked,
            flags: m.flags,
        };
        let physical_overlaps = index
            .physical2logical
            .get(&m.paddr.dev)
            .map(|tree| tree.overlapping(new_ext.range_beg(), new_ext.range_end()))
            .unwrap_or_default();
        let new_ext = new_ext.union(&physical_overlaps)?;

        // The two unions must come out of lockstep state in lockstep.
        assert!(
            new_chunk.flags == new_ext.flags,
            "should not happen: chunk flags {:?} != dev-extent flags {:?}",
            new_chunk.flags,
            new_ext.flags,
        );
        if physical_overlaps.len() < overlapping_stripes {
            // Fewer dev-extents on this device than stripes overall means
            // the chunk is replicated across devices; the flags must
            // admit that.
            if let Some(flags) = new_chunk.flags {
                if !flags.allows_replication() {
                    return Err(RfsError::MappingConflict {
                        kind: ConflictKind::Flags,
                        detail: format!(
                            "multiple stripes, but flags={flags} does not allow replication"
                        ),
                    });
                }
            }
        } else {
            assert!(
                physical_overlaps.len() <= overlapping_stripes,
                "should not happen: {} dev-extent overlaps but only {} chunk stripes",
                physical_overlaps.len(),
                overlapping_stripes,
            );
        }

        if dry_run {
            return Ok(());
        }

        // Nothing to rewrite when the union reproduces the sole overlap.
        if logical_overlaps.len() == 1
            && new_chunk == logical_overlaps[0]
            && physical_overlaps.len() == 1
            && new_ext == physical_overlaps[0]
        {
            return Ok(());
        }

        trace!(
            target: "rfs::volume",
            laddr = %new_chunk.laddr,
            size = %new_chunk.size,
            stripes = new_chunk.paddrs.len(),
            "applying mapping union"
        );

        for chunk in &logical_overlaps {
            index.logical2physical.remove_at(chunk.range_beg());
        }
        index
            .logical2physical
            .insert(new_chunk)
            .unwrap_or_else(|_| unreachable!("union overlaps were deleted"));

        let dev_tree = index.physical2logical.entry(m.paddr.dev).or_default();
        for ext in &physical_overlaps {
            dev_tree.remove_at(ext.range_beg());
        }
        dev_tree
            .insert(new_ext)
            .unwrap_or_else(|_| unreachable!("union overlaps were deleted"));

        #[cfg(debug_assertions)]
        Self::fsck_index(&index).unwrap_or_else(|err| {
            panic!("should not happen: mapping index skew after insert: {err}")
        });

        Ok(())
    }

    /// All stripes covering `laddr` and the contiguous length to the end
    /// of the containing chunk.
    #[must_use]
    pub fn resolve(&self, laddr: LogicalAddr) -> (BTreeSet<QualifiedPhysicalAddr>, AddrDelta) {
        let index = self.index.lock();
        let Some(chunk) = index.logical2physical.find(laddr.0) else {
            return (BTreeSet::new(), AddrDelta::ZERO);
        };
        let offset = laddr - chunk.laddr;
        let paddrs = chunk.paddrs.iter().map(|s| s.add(offset)).collect();
        (paddrs, chunk.size - offset)
    }

    /// The first chunk overlapping `[laddr, laddr+size)`, as
    /// `(chunk start, first replica)`.
    #[must_use]
    pub fn resolve_any(
        &self,
        laddr: LogicalAddr,
        size: AddrDelta,
    ) -> Option<(LogicalAddr, QualifiedPhysicalAddr)> {
        let index = self.index.lock();
        let mut found = None;
        index
            .logical2physical
            .for_overlapping(laddr.0, laddr.0 + size.0, |chunk| {
                found = Some((chunk.laddr, chunk.paddrs[0]));
                false
            });
        found
    }

    /// Map a physical location back to its logical address.
    #[must_use]
    pub fn unresolve(&self, paddr: QualifiedPhysicalAddr) -> Option<LogicalAddr> {
        let index = self.index.lock();
        let ext = index.physical2logical.get(&paddr.dev)?.find(paddr.addr.0)?;
        Some(ext.laddr + (paddr.addr - ext.paddr))
    }

    /// Flat mapping records, one per stripe, in logical order.
    #[must_use]
    pub fn mappings(&self) -> Vec<Mapping> {
        let index = self.index.lock();
        let mut out = Vec::new();
        for chunk in index.logical2physical.iter() {
            for stripe in &chunk.paddrs {
                out.push(Mapping {
                    laddr: chunk.laddr,
                    paddr: *stripe,
                    size: chunk.size,
                    size_locked: chunk.size_locked,
                    flags: chunk.flags,
                });
            }
        }
        out
    }

    /// Read `buf.len()` bytes at `laddr`, verifying replicated stripes
    /// against each other.
    pub fn read_at(&self, cx: &Cx, laddr: LogicalAddr, buf: &mut [u8]) -> Result<()> {
        let mut done = 0_usize;
        while done < buf.len() {
            let n = self.short_read_at(cx, laddr + AddrDelta(done as i64), &mut buf[done..])?;
            done += n;
        }
        Ok(())
    }

    fn short_read_at(&self, cx: &Cx, laddr: LogicalAddr, buf: &mut [u8]) -> Result<usize> {
        let (paddrs, max_len) = self.resolve(laddr);
        if paddrs.is_empty() {
            return Err(RfsError::NotMapped { laddr });
        }
        let len = buf.len().min(usize::try_from(max_len.0).unwrap_or(0));
        let buf = &mut buf[..len];

        let mut scratch: Option<Vec<u8>> = None;
        for (i, paddr) in paddrs.iter().enumerate() {
            let dev = self
                .device(paddr.dev)
                .ok_or(RfsError::DeviceMissing { dev: paddr.dev })?;
            if i == 0 {
                dev.read_exact_at(cx, paddr.addr, buf)?;
            } else {
                let tmp = scratch.get_or_insert_with(|| vec![0_u8; len]);
                dev.read_exact_at(cx, paddr.addr, tmp)?;
                if tmp.as_slice() != &*buf {
                    return Err(RfsError::InconsistentStripes { laddr, len });
                }
            }
        }
        Ok(len)
    }

    /// Write `buf` at `laddr` to *all* stripes.
    pub fn write_at(&self, cx: &Cx, laddr: LogicalAddr, buf: &[u8]) -> Result<()> {
        let mut done = 0_usize;
        while done < buf.len() {
            let n = self.short_write_at(cx, laddr + AddrDelta(done as i64), &buf[done..])?;
            done += n;
        }
        Ok(())
    }

    fn short_write_at(&self, cx: &Cx, laddr: LogicalAddr, buf: &[u8]) -> Result<usize> {
        let (paddrs, max_len) = self.resolve(laddr);
        if paddrs.is_empty() {
            return Err(RfsError::NotMapped { laddr });
        }
        let len = buf.len().min(usize::try_from(max_len.0).unwrap_or(0));
        for paddr in &paddrs {
            let dev = self
                .device(paddr.dev)
                .ok_or(RfsError::DeviceMissing { dev: paddr.dev })?;
            dev.write_all_at(cx, paddr.addr, &buf[..len])?;
        }
        Ok(len)
    }

    /// Register the mappings implied by one CHUNK_ITEM: one per stripe,
    /// flagged with the chunk's type.
    #[allow(clippy::cast_possible_wrap)] // on-disk stripe offsets are u64
    pub fn add_chunk_item(&self, laddr: LogicalAddr, chunk: &ChunkItem) -> Result<()> {
        for stripe in &chunk.stripes {
            self.add_mapping(Mapping {
                laddr,
                paddr: QualifiedPhysicalAddr::new(
                    DeviceId(stripe.device_id.0),
                    PhysicalAddr(stripe.offset as i64),
                ),
                size: chunk.size,
                size_locked: false,
                flags: Some(chunk.flags),
            })?;
        }
        Ok(())
    }

    /// Seed the bootstrap mappings embedded in the superblock's
    /// `sys_chunk_array`, which make the chunk tree itself readable.
    #[allow(clippy::cast_possible_wrap)] // chunk-key offsets are logical addresses
    pub fn add_sys_chunks(&self, sb: &Superblock) -> Result<()> {
        for sys in sb.sys_chunks()? {
            self.add_chunk_item(LogicalAddr(sys.key.offset as i64), &sys.chunk)?;
        }
        Ok(())
    }

    /// Verify the lockstep invariant: rebuilding the dev-extent index
    /// from the chunk index reproduces it exactly.
    pub fn fsck(&self) -> Result<()> {
        Self::fsck_index(&self.index.lock())
    }

    fn fsck_index(index: &Index) -> Result<()> {
        let mut rebuilt: BTreeMap<DeviceId, RangeMap<DevExtMapping>> = BTreeMap::new();
        for chunk in index.logical2physical.iter() {
            for stripe in &chunk.paddrs {
                let tree = rebuilt.entry(stripe.dev).or_default();
                tree.insert(DevExtMapping {
                    paddr: stripe.addr,
                    laddr: chunk.laddr,
                    size: chunk.size,
                    size_locked: chunk.size_locked,
                    flags: chunk.flags,
                })
                .map_err(|overlap| RfsError::MappingConflict {
                    kind: ConflictKind::DevExt,
                    detail: format!(
                        "chunk stripes overlap on device {}: {:?}",
                        stripe.dev, overlap.0
                    ),
                })?;
            }
        }

        for (dev, tree) in &index.physical2logical {
            let rebuilt_tree = rebuilt.remove(dev).unwrap_or_default();
            let stored: Vec<_> = tree.iter().collect();
            let derived: Vec<_> = rebuilt_tree.iter().collect();
            if stored != derived {
                return Err(RfsError::MappingConflict {
                    kind: ConflictKind::DevExt,
                    detail: format!("skew between chunk tree and dev-extent tree on device {dev}"),
                });
            }
        }
        if let Some((dev, _)) = rebuilt.into_iter().next() {
            return Err(RfsError::MappingConflict {
                kind: ConflictKind::DevExt,
                detail: format!("chunk references unindexed device {dev}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn lv_with_devices(n: u64) -> LogicalVolume {
        let lv = LogicalVolume::new();
        for id in 1..=n {
            lv.add_physical_volume(DeviceId(id), Arc::new(MemoryDevice::zeroed(0x10_0000)))
                .expect("register device");
        }
        lv
    }

    fn qp(dev: u64, addr: i64) -> QualifiedPhysicalAddr {
        QualifiedPhysicalAddr::new(DeviceId(dev), rfs_types::PhysicalAddr(addr))
    }

    fn mapping(laddr: i64, dev: u64, paddr: i64, size: i64) -> Mapping {
        Mapping {
            laddr: LogicalAddr(laddr),
            paddr: qp(dev, paddr),
            size: AddrDelta(size),
            size_locked: false,
            flags: None,
        }
    }

    #[test]
    fn overlapping_mappings_merge_into_one_chunk() {
        let lv = lv_with_devices(1);
        lv.add_mapping(mapping(0x0, 1, 0x0, 0x4000)).expect("first");
        lv.add_mapping(mapping(0x2000, 1, 0x2000, 0x4000)).expect("second");

        let mappings = lv.mappings();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].laddr, LogicalAddr(0));
        assert_eq!(mappings[0].size, AddrDelta(0x6000));
        assert_eq!(mappings[0].paddr, qp(1, 0));
        assert_eq!(lv.size(), LogicalAddr(0x6000));
        lv.fsck().expect("lockstep holds");
    }

    #[test]
    fn touching_mappings_do_not_merge() {
        let lv = lv_with_devices(1);
        lv.add_mapping(mapping(0x0, 1, 0x0, 0x1000)).expect("first");
        lv.add_mapping(mapping(0x1000, 1, 0x1000, 0x1000)).expect("second");
        assert_eq!(lv.mappings().len(), 2);
    }

    #[test]
    fn add_mapping_is_idempotent() {
        let lv = lv_with_devices(1);
        let m = mapping(0x0, 1, 0x0, 0x1000);
        lv.add_mapping(m.clone()).expect("first");
        lv.add_mapping(m.clone()).expect("again");
        assert_eq!(lv.mappings(), vec![m]);
    }

    #[test]
    fn replication_is_detected_and_verified() {
        let cx = Cx::for_testing();
        let lv = lv_with_devices(2);
        let flags = Some(BlockGroupFlags::RAID1);
        lv.add_mapping(Mapping {
            flags,
            ..mapping(0, 1, 0, 0x1000)
        })
        .expect("stripe 1");
        lv.add_mapping(Mapping {
            flags,
            ..mapping(0, 2, 0, 0x1000)
        })
        .expect("stripe 2");

        let (paddrs, max_len) = lv.resolve(LogicalAddr(0));
        assert_eq!(
            paddrs.iter().copied().collect::<Vec<_>>(),
            vec![qp(1, 0), qp(2, 0)]
        );
        assert_eq!(max_len, AddrDelta(0x1000));

        // Matching replicas read fine.
        let mut buf = vec![0_u8; 0x1000];
        lv.read_at(&cx, LogicalAddr(0), &mut buf).expect("read");

        // Desynchronize one replica: the read must fail.
        lv.device(DeviceId(2))
            .expect("device")
            .write_all_at(&cx, rfs_types::PhysicalAddr(0), &[0xFF])
            .expect("poke");
        let err = lv.read_at(&cx, LogicalAddr(0), &mut buf).unwrap_err();
        assert!(matches!(err, RfsError::InconsistentStripes { .. }));
    }

    #[test]
    fn replication_without_raid_flags_is_rejected() {
        let lv = lv_with_devices(2);
        let flags = Some(BlockGroupFlags::DATA);
        lv.add_mapping(Mapping {
            flags,
            ..mapping(0, 1, 0, 0x1000)
        })
        .expect("stripe 1");
        let err = lv
            .add_mapping(Mapping {
                flags,
                ..mapping(0, 2, 0, 0x1000)
            })
            .unwrap_err();
        assert!(matches!(
            err,
            RfsError::MappingConflict {
                kind: ConflictKind::Flags,
                ..
            }
        ));
    }

    #[test]
    fn size_locked_conflict_mutates_nothing() {
        let lv = lv_with_devices(1);
        let first = Mapping {
            size_locked: true,
            ..mapping(0, 1, 0, 0x1000)
        };
        lv.add_mapping(first.clone()).expect("first");

        let second = Mapping {
            size_locked: true,
            ..mapping(0x800, 1, 0x800, 0x1000)
        };
        assert!(!lv.could_add_mapping(&second));
        let err = lv.add_mapping(second).unwrap_err();
        assert!(matches!(
            err,
            RfsError::MappingConflict {
                kind: ConflictKind::SizeLocked,
                ..
            }
        ));
        assert_eq!(lv.mappings(), vec![first]);
        lv.fsck().expect("untouched index is consistent");
    }

    #[test]
    fn resolve_and_unresolve_round_trip() {
        let lv = lv_with_devices(1);
        lv.add_mapping(mapping(0x10_000, 1, 0x5000, 0x2000)).expect("map");

        for laddr in [0x10_000_i64, 0x10_800, 0x11_FFF] {
            let (paddrs, _) = lv.resolve(LogicalAddr(laddr));
            for paddr in paddrs {
                assert_eq!(lv.unresolve(paddr), Some(LogicalAddr(laddr)));
            }
        }

        // Last byte of the chunk resolves with max_len = 1.
        let (paddrs, max_len) = lv.resolve(LogicalAddr(0x11_FFF));
        assert_eq!(paddrs.len(), 1);
        assert_eq!(max_len, AddrDelta(1));

        // One past the end resolves to nothing.
        let (paddrs, _) = lv.resolve(LogicalAddr(0x12_000));
        assert!(paddrs.is_empty());
        assert_eq!(lv.unresolve(qp(1, 0x4FFF)), None);
    }

    #[test]
    fn resolve_any_returns_first_overlap() {
        let lv = lv_with_devices(1);
        lv.add_mapping(mapping(0x4000, 1, 0x0, 0x1000)).expect("map");
        let hit = lv.resolve_any(LogicalAddr(0x3000), AddrDelta(0x2000));
        assert_eq!(hit, Some((LogicalAddr(0x4000), qp(1, 0))));
        assert_eq!(lv.resolve_any(LogicalAddr(0), AddrDelta(0x1000)), None);
    }

    #[test]
    fn write_then_read_round_trips() {
        let cx = Cx::for_testing();
        let lv = lv_with_devices(2);
        let flags = Some(BlockGroupFlags::DUP);
        lv.add_mapping(Mapping {
            flags,
            ..mapping(0, 1, 0x1000, 0x1000)
        })
        .expect("stripe 1");
        lv.add_mapping(Mapping {
            flags,
            ..mapping(0, 2, 0x8000, 0x1000)
        })
        .expect("stripe 2");

        let payload = vec![0xA5_u8; 0x1000];
        lv.write_at(&cx, LogicalAddr(0), &payload).expect("write");
        let mut readback = vec![0_u8; 0x1000];
        lv.read_at(&cx, LogicalAddr(0), &mut readback).expect("read");
        assert_eq!(readback, payload);

        let err = lv
            .read_at(&cx, LogicalAddr(0x1000), &mut readback)
            .unwrap_err();
        assert!(matches!(err, RfsError::NotMapped { laddr } if laddr == LogicalAddr(0x1000)));
    }

    #[test]
    fn clear_mappings_keeps_devices() {
        let lv = lv_with_devices(1);
        lv.add_mapping(mapping(0, 1, 0, 0x1000)).expect("map");
        lv.clear_mappings();
        assert!(lv.mappings().is_empty());
        assert_eq!(lv.size(), LogicalAddr::ZERO);
        assert_eq!(lv.devices(), vec![DeviceId(1)]);
        lv.add_mapping(mapping(0, 1, 0, 0x1000)).expect("remap after clear");
    }

    #[test]
    fn unknown_device_is_rejected() {
        let lv = lv_with_devices(1);
        let err = lv.add_mapping(mapping(0, 9, 0, 0x1000)).unwrap_err();
        assert!(matches!(err, RfsError::DeviceMissing { dev } if dev == DeviceId(9)));
    }

    #[test]
    fn chunk_items_map_all_stripes() {
        use rfs_ondisk::ChunkStripe;
        use rfs_types::ObjectId;

        let lv = lv_with_devices(2);
        let chunk = ChunkItem {
            size: AddrDelta(0x1000),
            owner: ObjectId::EXTENT_TREE,
            stripe_len: 0x1_0000,
            flags: BlockGroupFlags::METADATA.union(BlockGroupFlags::RAID1),
            num_stripes: 2,
            sub_stripes: 0,
            stripes: vec![
                ChunkStripe {
                    device_id: ObjectId(1),
                    offset: 0x8000,
                    dev_uuid: rfs_types::Uuid::ZERO,
                },
                ChunkStripe {
                    device_id: ObjectId(2),
                    offset: 0x9000,
                    dev_uuid: rfs_types::Uuid::ZERO,
                },
            ],
        };
        lv.add_chunk_item(LogicalAddr(0x100_0000), &chunk).expect("chunk item");

        let (paddrs, max_len) = lv.resolve(LogicalAddr(0x100_0000));
        assert_eq!(
            paddrs.into_iter().collect::<Vec<_>>(),
            vec![qp(1, 0x8000), qp(2, 0x9000)]
        );
        assert_eq!(max_len, AddrDelta(0x1000));
        lv.fsck().expect("lockstep holds");
    }
}
