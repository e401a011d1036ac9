//! Searcher callbacks for tree descent.
//!
//! A searcher is a 3-way comparison of *the wanted item(s)* against a
//! stored key: `Greater` means the wanted range lies after the key,
//! `Equal` means the key is inside it, `Less` before it. Matching keys
//! must form a contiguous run in key order.

use rfs_ondisk::ItemBody;
use rfs_types::{ItemType, Key, ObjectId};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// One item as returned by tree lookups: the key, the on-disk body size,
/// and the decoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Key,
    pub data_size: u32,
    pub body: ItemBody,
}

type CmpFn = dyn Fn(Key, u32) -> Ordering + Send + Sync;

/// A pure, key-order-consistent comparison driving tree descent.
#[derive(Clone)]
pub struct Searcher {
    cmp: Arc<CmpFn>,
    desc: String,
    /// A key inside the wanted range, carried in miss errors.
    representative: Key,
}

impl Searcher {
    /// Raw form: any 3-way comparator over `(key, item_size)`.
    pub fn raw(
        representative: Key,
        desc: impl Into<String>,
        cmp: impl Fn(Key, u32) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        Self {
            cmp: Arc::new(cmp),
            desc: desc.into(),
            representative,
        }
    }

    /// Match exactly `key`.
    #[must_use]
    pub fn exact_key(key: Key) -> Self {
        Self::raw(key, format!("key={key}"), move |k, _| key.cmp(&k))
    }

    /// Match every key of one object id.
    #[must_use]
    pub fn object(object_id: ObjectId) -> Self {
        Self::raw(
            Key::new(object_id, ItemType(0), 0),
            format!("object={object_id}"),
            move |k, _| object_id.cmp(&k.object_id),
        )
    }

    /// Match `(object_id, item_type, *)`, ignoring the offset.
    #[must_use]
    pub fn key_prefix(object_id: ObjectId, item_type: ItemType) -> Self {
        Self::raw(
            Key::new(object_id, item_type, 0),
            format!("prefix={{{object_id} {item_type}}}"),
            move |k, _| (object_id, item_type).cmp(&(k.object_id, k.item_type)),
        )
    }

    /// Match every key in the inclusive range `[min, max]`.
    #[must_use]
    pub fn key_range(min: Key, max: Key) -> Self {
        Self::raw(min, format!("range=[{min},{max}]"), move |k, _| {
            if k < min {
                Ordering::Greater
            } else if k > max {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        })
    }

    /// Match the ROOT_ITEM(s) of a tree, any offset.
    #[must_use]
    pub fn root_item(tree_id: ObjectId) -> Self {
        Self::key_prefix(tree_id, ItemType::ROOT_ITEM)
    }

    #[must_use]
    pub fn cmp(&self, key: Key, item_size: u32) -> Ordering {
        (self.cmp)(key, item_size)
    }

    #[must_use]
    pub fn representative(&self) -> Key {
        self.representative
    }
}

impl fmt::Display for Searcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.desc)
    }
}

impl fmt::Debug for Searcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Searcher({})", self.desc)
    }
}
