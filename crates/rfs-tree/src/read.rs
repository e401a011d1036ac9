//! Node reads with expectations, backed by the shared pinned cache.

use asupersync::Cx;
use rfs_container::{CacheSource, PinnedCache};
use rfs_error::{Result, RfsError};
use rfs_ondisk::{verify_node_checksum, Node, Superblock};
use rfs_types::{AddrDelta, Generation, Key, LogicalAddr, TreeId};
use rfs_volume::LogicalVolume;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tracing::trace;

const DEFAULT_NODE_CACHE_CAPACITY: usize = 1024;

/// How to validate a node's claimed owner and generation.
#[derive(Clone)]
pub enum OwnerCheck {
    /// Owner and generation must match exactly.
    Exact(TreeId, Generation),
    /// Arbitrary validation, e.g. COW-ancestry rules.
    Check(Arc<dyn Fn(TreeId, Generation) -> Result<()> + Send + Sync>),
}

impl fmt::Debug for OwnerCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(owner, gen) => write!(f, "Exact({owner}, {gen})"),
            Self::Check(_) => f.write_str("Check(..)"),
        }
    }
}

/// Optional-field bundle enforced by [`TreeFs::acquire_node`].
#[derive(Debug, Clone, Default)]
pub struct NodeExpectations {
    pub laddr: Option<LogicalAddr>,
    pub level: Option<u8>,
    pub generation: Option<Generation>,
    pub owner: Option<OwnerCheck>,
    /// Every key in the node must be `>= min_item`.
    pub min_item: Option<Key>,
    /// Every key in the node must be `<= max_item`.
    pub max_item: Option<Key>,
}

impl NodeExpectations {
    #[must_use]
    pub fn at(laddr: LogicalAddr) -> Self {
        Self {
            laddr: Some(laddr),
            ..Self::default()
        }
    }

    fn check(&self, node: &Node, laddr: LogicalAddr) -> Result<()> {
        fn violation<T: fmt::Display, U: fmt::Display>(
            field: &'static str,
            expected: T,
            actual: U,
            laddr: LogicalAddr,
        ) -> RfsError {
            RfsError::NodeExpectation {
                field,
                expected: expected.to_string(),
                actual: actual.to_string(),
                laddr,
            }
        }

        if let Some(expected) = self.laddr {
            if node.head.addr != expected {
                return Err(violation("addr", expected, node.head.addr, laddr));
            }
        }
        if let Some(expected) = self.level {
            if node.head.level != expected {
                return Err(violation("level", expected, node.head.level, laddr));
            }
        }
        if let Some(expected) = self.generation {
            if node.head.generation != expected {
                return Err(violation("generation", expected, node.head.generation, laddr));
            }
        }
        match &self.owner {
            Some(OwnerCheck::Exact(owner, gen)) => {
                if node.head.owner != *owner || node.head.generation != *gen {
                    return Err(violation(
                        "owner",
                        format!("{owner}@{gen}"),
                        format!("{}@{}", node.head.owner, node.head.generation),
                        laddr,
                    ));
                }
            }
            Some(OwnerCheck::Check(check)) => {
                check(node.head.owner, node.head.generation)?;
            }
            None => {}
        }
        if let Some(min) = self.min_item {
            if let Some(actual) = node.min_item_key() {
                if actual < min {
                    return Err(violation("min_item", min, actual, laddr));
                }
            }
        }
        if let Some(max) = self.max_item {
            if let Some(actual) = node.max_item_key() {
                if actual > max {
                    return Err(violation("max_item", max, actual, laddr));
                }
            }
        }
        Ok(())
    }
}

/// Cache source: read one replica through the volume, verify the
/// checksum and identity fields, parse.
struct NodeSource {
    lv: Arc<LogicalVolume>,
    sb: Superblock,
}

impl CacheSource<LogicalAddr, Node> for NodeSource {
    fn load(&self, cx: &Cx, laddr: &LogicalAddr) -> Result<Node> {
        read_node(cx, &self.lv, &self.sb, *laddr)
    }
}

/// Read and validate the node at `laddr`, bypassing the cache.
pub(crate) fn read_node(
    cx: &Cx,
    lv: &LogicalVolume,
    sb: &Superblock,
    laddr: LogicalAddr,
) -> Result<Node> {
    let node_size = sb.node_size as usize;
    let (chunk_laddr, stripe) = lv
        .resolve_any(laddr, AddrDelta(node_size as i64))
        .ok_or(RfsError::NotMapped { laddr })?;
    let paddr = stripe.add(laddr - chunk_laddr);

    let dev = lv
        .device(paddr.dev)
        .ok_or(RfsError::DeviceMissing { dev: paddr.dev })?;
    let mut block = vec![0_u8; node_size];
    dev.read_exact_at(cx, paddr.addr, &mut block)?;

    if !verify_node_checksum(&block, sb.csum_type)? {
        return Err(RfsError::BadChecksum { laddr });
    }
    let node = Node::parse(&block)?;
    if node.head.metadata_uuid != sb.effective_metadata_uuid() {
        return Err(RfsError::NodeExpectation {
            field: "metadata_uuid",
            expected: sb.effective_metadata_uuid().to_string(),
            actual: node.head.metadata_uuid.to_string(),
            laddr,
        });
    }
    trace!(target: "rfs::tree", %laddr, level = node.head.level, "read node");
    Ok(node)
}

/// A pinned node handle; releases its cache pin on drop.
pub struct NodeGuard<'a> {
    fs: &'a TreeFs,
    laddr: LogicalAddr,
    node: Arc<Node>,
}

impl NodeGuard<'_> {
    #[must_use]
    pub fn laddr(&self) -> LogicalAddr {
        self.laddr
    }

    /// The node, detached from the pin.
    #[must_use]
    pub fn to_arc(&self) -> Arc<Node> {
        Arc::clone(&self.node)
    }
}

impl Deref for NodeGuard<'_> {
    type Target = Node;
    fn deref(&self) -> &Node {
        &self.node
    }
}

impl std::fmt::Debug for NodeGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeGuard")
            .field("laddr", &self.laddr)
            .field("node", &self.node)
            .finish()
    }
}

impl Drop for NodeGuard<'_> {
    fn drop(&mut self) {
        self.fs.cache.release(&self.laddr);
    }
}

/// A logical volume plus its superblock and the shared node cache.
pub struct TreeFs {
    lv: Arc<LogicalVolume>,
    sb: Superblock,
    cache: PinnedCache<LogicalAddr, Node>,
}

impl TreeFs {
    #[must_use]
    pub fn new(lv: Arc<LogicalVolume>, sb: Superblock) -> Arc<Self> {
        Self::with_cache_capacity(lv, sb, DEFAULT_NODE_CACHE_CAPACITY)
    }

    #[must_use]
    pub fn with_cache_capacity(
        lv: Arc<LogicalVolume>,
        sb: Superblock,
        capacity: usize,
    ) -> Arc<Self> {
        let source = Arc::new(NodeSource {
            lv: Arc::clone(&lv),
            sb: sb.clone(),
        });
        Arc::new(Self {
            lv,
            sb,
            cache: PinnedCache::new(capacity, source),
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn volume(&self) -> &Arc<LogicalVolume> {
        &self.lv
    }

    /// Acquire the node at `laddr` and enforce `exp` against it.
    ///
    /// The pin is dropped (and the expectations failure returned) if the
    /// cached node does not satisfy `exp`.
    pub fn acquire_node(
        &self,
        cx: &Cx,
        laddr: LogicalAddr,
        exp: &NodeExpectations,
    ) -> Result<NodeGuard<'_>> {
        let node = self.cache.acquire(cx, &laddr)?;
        if let Err(err) = exp.check(&node, laddr) {
            self.cache.release(&laddr);
            return Err(err);
        }
        Ok(NodeGuard {
            fs: self,
            laddr,
            node,
        })
    }

    /// Drop the cached copy of `laddr`, blocking while it is pinned.
    pub fn evict_node(&self, laddr: LogicalAddr) {
        self.cache.delete(&laddr);
    }

    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
