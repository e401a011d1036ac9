#![forbid(unsafe_code)]
//! The logical-volume layer of RescueFS.
//!
//! Maintains the bidirectional index between the logical address space
//! and `(device, physical offset)` stripes, with merge-on-insert
//! semantics, replication awareness, and stripe-verifying reads.

mod device;
mod lvm;
mod mapping;

pub use device::{read_superblock, BlockDevice, FileDevice, MemoryDevice};
pub use lvm::{LogicalVolume, Mapping};
pub use mapping::{ChunkMapping, DevExtMapping};
