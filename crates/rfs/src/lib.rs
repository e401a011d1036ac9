#![forbid(unsafe_code)]
//! RescueFS: the read-only recovery core for a copy-on-write,
//! B-tree-structured, logically-addressed filesystem.

pub use rfs_container as container;
pub use rfs_error as error;
pub use rfs_index as index;
pub use rfs_ondisk as ondisk;
pub use rfs_rebuild as rebuild;
pub use rfs_tree as tree;
pub use rfs_types as types;
pub use rfs_volume as volume;

pub use rfs_error::{Result, RfsError};
pub use rfs_index::OldRebuiltForrest;
pub use rfs_rebuild::{scan_devices, Rebuilder, RebuiltForrest};
pub use rfs_tree::TreeFs;
pub use rfs_volume::{read_superblock, LogicalVolume};
