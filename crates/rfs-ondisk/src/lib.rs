#![forbid(unsafe_code)]
//! On-disk codecs for RescueFS.
//!
//! Pure byte-slice parsing: the superblock (with its embedded bootstrap
//! chunk array), tree-node headers and bodies, the closed union of item
//! bodies, and checksum dispatch. No I/O happens in this crate.

mod csum;
mod item;
mod node;
mod superblock;

pub use csum::{ChecksumType, Csum};
pub use item::{
    BlockGroupItem, ChunkItem, ChunkStripe, DevExtentItem, DevItem, DirEntry, ExtentCsum,
    ExtentDataRef, ExtentItem, FileExtent, FileExtentKind, InlineRef, InodeItem, InodeRef,
    ItemBody, ItemError, MetadataItem, RootItem, RootRef, Timespec, UuidMapItem,
};
pub use node::{
    verify_node_checksum, KeyPointer, LeafItem, Node, NodeBody, NodeHeader,
};
pub use superblock::{Superblock, SysChunk};
