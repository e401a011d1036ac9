#![forbid(unsafe_code)]
//! Tree rebuilding for RescueFS.
//!
//! A sector scan feeds every plausible node into a directed graph; the
//! rebuilt-tree engine decides which orphan subtrees may be re-attached
//! to which logical tree by owner, generation, and COW-ancestry rules;
//! and the want/augment loop turns a consistency checker's missing-item
//! complaints into candidate roots for augmentation.

mod graph;
mod rebuilt;
mod scan;
mod want;

pub use graph::{FinalCheckReport, Graph, GraphEdge, GraphNode};
pub use rebuilt::{IndexRebuildCallbacks, RebuildCallbacks, RebuiltForrest, RebuiltTree};
pub use scan::{scan_devices, ItemPtr, ScanResult};
pub use want::{Rebuilder, WantKey, WantOffset, WantWithTree};
