//! Walk paths: where a node sits relative to its tree root.

use crate::read::NodeExpectations;
use rfs_types::{Generation, ItemType, Key, LogicalAddr, ObjectId, TreeId};
use std::fmt;

/// One hop of a walk path: the keypointer (or root reference) that led
/// to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathElem {
    /// Owning tree of the parent node (the tree id itself at the root).
    pub from_tree: TreeId,
    /// Keypointer slot in the parent; `None` at the root.
    pub from_slot: Option<usize>,
    pub to_addr: LogicalAddr,
    pub to_generation: Generation,
    pub to_level: u8,
    /// Smallest key the pointed-to subtree may contain.
    pub to_key: Key,
    /// Largest key the pointed-to subtree may contain.
    pub to_max_key: Key,
}

/// A path from a tree root down to one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkPath {
    elems: Vec<PathElem>,
}

impl WalkPath {
    #[must_use]
    pub fn root(tree: TreeId, addr: LogicalAddr, generation: Generation, level: u8) -> Self {
        Self {
            elems: vec![PathElem {
                from_tree: tree,
                from_slot: None,
                to_addr: addr,
                to_generation: generation,
                to_level: level,
                to_key: Key::MIN,
                to_max_key: Key::MAX,
            }],
        }
    }

    #[must_use]
    pub fn push(&self, elem: PathElem) -> Self {
        let mut elems = self.elems.clone();
        elems.push(elem);
        Self { elems }
    }

    #[must_use]
    pub fn last(&self) -> Option<&PathElem> {
        self.elems.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// The keypointer slot the final node was reached through.
    #[must_use]
    pub fn from_slot(&self) -> Option<usize> {
        self.last().and_then(|e| e.from_slot)
    }

    /// Expectations the final node must satisfy, derived from the
    /// keypointer that led to it.
    #[must_use]
    pub fn node_expectations(&self) -> NodeExpectations {
        let Some(elem) = self.last() else {
            return NodeExpectations::default();
        };
        NodeExpectations {
            laddr: Some(elem.to_addr),
            level: Some(elem.to_level),
            generation: Some(elem.to_generation),
            owner: None,
            min_item: Some(elem.to_key),
            max_item: Some(elem.to_max_key),
        }
    }

    /// The inclusive key range the final node was expected to cover.
    #[must_use]
    pub fn expected_key_range(&self) -> (Key, Key) {
        self.last()
            .map_or((Key::MIN, Key::MAX), |e| (e.to_key, e.to_max_key))
    }
}

impl fmt::Display for WalkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.elems.is_empty() {
            return f.write_str("(empty-path)");
        }
        for (i, elem) in self.elems.iter().enumerate() {
            if i == 0 {
                write!(f, "{}->", elem.from_tree)?;
            } else if let Some(slot) = elem.from_slot {
                write!(f, "[{slot}]->")?;
            }
            write!(f, "node:{}@{}", elem.to_level, elem.to_addr)?;
        }
        Ok(())
    }
}

/// The largest key strictly below `key`, for turning an exclusive
/// sibling bound into an inclusive subtree bound.
#[must_use]
pub(crate) fn key_before(key: Key) -> Key {
    if key.offset > 0 {
        return Key {
            offset: key.offset - 1,
            ..key
        };
    }
    if key.item_type.0 > 0 {
        return Key {
            item_type: ItemType(key.item_type.0 - 1),
            offset: u64::MAX,
            ..key
        };
    }
    if key.object_id.0 > 0 {
        return Key {
            object_id: ObjectId(key.object_id.0 - 1),
            item_type: ItemType(u8::MAX),
            offset: u64::MAX,
        };
    }
    Key::MIN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_display_and_expectations() {
        let root = WalkPath::root(ObjectId(5), LogicalAddr(0x4000), Generation(7), 1);
        let child = root.push(PathElem {
            from_tree: ObjectId(5),
            from_slot: Some(3),
            to_addr: LogicalAddr(0x8000),
            to_generation: Generation(6),
            to_level: 0,
            to_key: Key::new(ObjectId(256), ItemType::INODE_ITEM, 0),
            to_max_key: Key::new(ObjectId(300), ItemType(u8::MAX), u64::MAX),
        });

        assert_eq!(child.len(), 2);
        assert_eq!(child.from_slot(), Some(3));
        assert_eq!(child.to_string(), "5->node:1@0x4000[3]->node:0@0x8000");

        let exp = child.node_expectations();
        assert_eq!(exp.laddr, Some(LogicalAddr(0x8000)));
        assert_eq!(exp.level, Some(0));
        assert_eq!(
            exp.min_item,
            Some(Key::new(ObjectId(256), ItemType::INODE_ITEM, 0))
        );
    }

    #[test]
    fn key_before_borrows_across_fields() {
        let k = Key::new(ObjectId(5), ItemType(7), 9);
        assert_eq!(key_before(k), Key::new(ObjectId(5), ItemType(7), 8));

        let k = Key::new(ObjectId(5), ItemType(7), 0);
        assert_eq!(key_before(k), Key::new(ObjectId(5), ItemType(6), u64::MAX));

        let k = Key::new(ObjectId(5), ItemType(0), 0);
        assert_eq!(
            key_before(k),
            Key::new(ObjectId(4), ItemType(u8::MAX), u64::MAX)
        );
        assert_eq!(key_before(Key::MIN), Key::MIN);
    }
}
