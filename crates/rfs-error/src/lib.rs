#![forbid(unsafe_code)]
//! Error types for RescueFS.
//!
//! Defines `RfsError` and a `Result<T>` alias used throughout the workspace.
//! Every user-visible failure carries the address or `(tree, key)` context
//! needed to reproduce it.

use rfs_types::{DeviceId, Key, LogicalAddr, ParseError, TreeId};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Which mapping invariant an `add_mapping` candidate violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// A size-locked member disagrees with the union's size.
    SizeLocked,
    /// Two members carry different non-empty block-group flags.
    Flags,
    /// Overlapping dev-extents back-project to different logical addresses.
    DevExt,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeLocked => f.write_str("size-locked"),
            Self::Flags => f.write_str("flags"),
            Self::DevExt => f.write_str("dev-extent"),
        }
    }
}

/// Unified error type for all RescueFS operations.
#[derive(Debug, Error, Clone)]
pub enum RfsError {
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("decode error: {0}")]
    Parse(#[from] ParseError),

    #[error("could not map logical address {laddr}")]
    NotMapped { laddr: LogicalAddr },

    #[error("device {dev} is not registered")]
    DeviceMissing { dev: DeviceId },

    #[error("node at {laddr} failed checksum verification")]
    BadChecksum { laddr: LogicalAddr },

    #[error("node at {laddr}: expected {field}={expected}, but claims {field}={actual}")]
    NodeExpectation {
        field: &'static str,
        expected: String,
        actual: String,
        laddr: LogicalAddr,
    },

    #[error("inconsistent stripes at laddr={laddr} len={len}")]
    InconsistentStripes { laddr: LogicalAddr, len: usize },

    #[error("mapping conflict ({kind}): {detail}")]
    MappingConflict { kind: ConflictKind, detail: String },

    #[error("loop detected: {path:?}")]
    TreeLoop { path: Vec<TreeId> },

    #[error("tree {tree}: item {key} does not exist")]
    ItemMissing { tree: TreeId, key: Key },

    #[error("tree {tree} does not exist")]
    TreeMissing { tree: TreeId },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Aggregate(MultiError),
}

impl From<std::io::Error> for RfsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl RfsError {
    /// True for plain lookup misses with no underlying I/O problem.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ItemMissing { .. } | Self::TreeMissing { .. } => true,
            Self::Aggregate(multi) => multi.0.iter().all(Self::is_not_found),
            _ => false,
        }
    }

    /// Combine `errs` (and an optional base error) into one error.
    ///
    /// Returns `Ok(())` when there is nothing to report.
    pub fn aggregate(mut errs: Vec<RfsError>, base: Option<RfsError>) -> Result<()> {
        if let Some(base) = base {
            errs.push(base);
        }
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(RfsError::Aggregate(MultiError(errs))),
        }
    }
}

/// Several errors reported as one, preserving each member's context.
#[derive(Debug, Clone, Default)]
pub struct MultiError(pub Vec<RfsError>);

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: [", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        f.write_str("]")
    }
}

/// Result alias using `RfsError`.
pub type Result<T, E = RfsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use rfs_types::ObjectId;

    #[test]
    fn not_found_classification() {
        let miss = RfsError::ItemMissing {
            tree: ObjectId(5),
            key: Key::default(),
        };
        assert!(miss.is_not_found());
        assert!(!RfsError::Cancelled.is_not_found());

        let agg = RfsError::Aggregate(MultiError(vec![
            RfsError::TreeMissing { tree: ObjectId(5) },
            RfsError::ItemMissing {
                tree: ObjectId(5),
                key: Key::default(),
            },
        ]));
        assert!(agg.is_not_found());

        let mixed = RfsError::Aggregate(MultiError(vec![
            RfsError::TreeMissing { tree: ObjectId(5) },
            RfsError::Cancelled,
        ]));
        assert!(!mixed.is_not_found());
    }

    #[test]
    fn aggregate_flattens_singletons() {
        assert!(RfsError::aggregate(vec![], None).is_ok());

        let single = RfsError::aggregate(vec![RfsError::Cancelled], None).unwrap_err();
        assert!(matches!(single, RfsError::Cancelled));

        let multi = RfsError::aggregate(
            vec![RfsError::Cancelled],
            Some(RfsError::TreeMissing { tree: ObjectId(9) }),
        )
        .unwrap_err();
        let RfsError::Aggregate(inner) = multi else {
            panic!("expected aggregate");
        };
        assert_eq!(inner.0.len(), 2);
    }

    #[test]
    fn display_carries_context() {
        let err = RfsError::NodeExpectation {
            field: "level",
            expected: "1".to_owned(),
            actual: "0".to_owned(),
            laddr: LogicalAddr(0x4000),
        };
        let msg = err.to_string();
        assert!(msg.contains("0x4000"), "message was: {msg}");
        assert!(msg.contains("level"), "message was: {msg}");
    }
}
