#![forbid(unsafe_code)]
//! B-tree access for RescueFS.
//!
//! `TreeFs` bundles a logical volume, its superblock, and the shared
//! pinned node cache; `RawTree` navigates well-formed trees rooted from
//! the superblock or the ROOT tree, with searcher callbacks and walks
//! that survive bad nodes.

mod forrest;
mod mount;
mod path;
mod read;
mod search;
pub mod synth;

pub use forrest::{lookup_tree_root, RawTree, TreeRoot, WalkHandler};
pub use mount::populate_chunk_maps;
pub use path::{PathElem, WalkPath};
pub use read::{NodeGuard, NodeExpectations, OwnerCheck, TreeFs};
pub use search::{Item, Searcher};
