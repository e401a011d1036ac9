//! Fixed-capacity LRU cache with pinning.
//!
//! Entries are pinned while a consumer holds them (`acquire` without a
//! matching `release`) and only unpinned entries are evictable. When the
//! cache is full and every entry is pinned, `acquire` blocks on a FIFO
//! waiter queue until some entry is released. `delete` on a pinned entry
//! blocks until the pin count drops to zero.

use asupersync::Cx;
use parking_lot::{Condvar, Mutex};
use rfs_error::{Result, RfsError};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

/// Loads values on cache miss and writes them back on `flush`.
///
/// The core's consumers are read-only, so `flush` defaults to a no-op; the
/// cache itself is written as a general mechanism.
pub trait CacheSource<K, V>: Send + Sync {
    fn load(&self, cx: &Cx, key: &K) -> Result<V>;

    fn flush(&self, _cx: &Cx, _key: &K, _val: &V) -> Result<()> {
        Ok(())
    }
}

/// One-shot gate used both for "a slot became available" and "your delete
/// completed" notifications.
#[derive(Default)]
struct Gate {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn open(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }
}

struct Entry<V> {
    val: Arc<V>,
    refs: usize,
    /// Position in the eviction order; `Some` iff `refs == 0`.
    lru_tick: Option<u64>,
    /// Deleters blocked on this entry.
    del: Vec<Arc<Gate>>,
}

struct State<K, V> {
    entries: HashMap<K, Entry<V>>,
    evictable: BTreeMap<u64, K>,
    tick: u64,
    avail_waiters: VecDeque<Arc<Gate>>,
}

/// Fixed-capacity LRU cache with pin counting.
pub struct PinnedCache<K, V> {
    cap: usize,
    src: Arc<dyn CacheSource<K, V>>,
    state: Mutex<State<K, V>>,
}

impl<K, V> PinnedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize, src: Arc<dyn CacheSource<K, V>>) -> Self {
        assert!(capacity > 0, "PinnedCache requires a non-zero capacity");
        Self {
            cap: capacity,
            src,
            state: Mutex::new(State {
                entries: HashMap::with_capacity(capacity),
                evictable: BTreeMap::new(),
                tick: 0,
                avail_waiters: VecDeque::new(),
            }),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Pin and return the value for `key`, loading it on miss.
    ///
    /// Blocks while the cache is full and every entry is pinned. Each
    /// successful `acquire` must be paired with exactly one [`release`].
    ///
    /// [`release`]: PinnedCache::release
    pub fn acquire(&self, cx: &Cx, key: &K) -> Result<Arc<V>> {
        loop {
            cx.checkpoint().map_err(|_| RfsError::Cancelled)?;
            let mut st = self.state.lock();

            if let Some(entry) = st.entries.get_mut(key) {
                if let Some(tick) = entry.lru_tick.take() {
                    st.evictable.remove(&tick);
                }
                let entry = st.entries.get_mut(key).unwrap_or_else(|| {
                    unreachable!("entry vanished while the lock was held")
                });
                entry.refs += 1;
                return Ok(Arc::clone(&entry.val));
            }

            if st.entries.len() >= self.cap {
                let Some((&tick, _)) = st.evictable.iter().next() else {
                    // Full and every entry pinned: wait FIFO for a release.
                    let gate = Arc::new(Gate::default());
                    st.avail_waiters.push_back(Arc::clone(&gate));
                    drop(st);
                    gate.wait();
                    continue;
                };
                let victim = st.evictable.remove(&tick).unwrap_or_else(|| {
                    unreachable!("evictable tick without key")
                });
                st.entries.remove(&victim);
            }

            // The load happens under the lock: concurrent acquires
            // serialize against it, and the slot cannot be stolen.
            match self.src.load(cx, key) {
                Ok(val) => {
                    let val = Arc::new(val);
                    st.entries.insert(
                        key.clone(),
                        Entry {
                            val: Arc::clone(&val),
                            refs: 1,
                            lru_tick: None,
                            del: Vec::new(),
                        },
                    );
                    return Ok(val);
                }
                Err(err) => {
                    // The slot stays free; let a blocked acquirer re-check.
                    Self::notify_avail(&mut st);
                    return Err(err);
                }
            }
        }
    }

    /// Unpin `key`.
    ///
    /// Panics if `key` is not currently held; that is a bug in the caller.
    pub fn release(&self, key: &K) {
        let mut st = self.state.lock();
        let Some(entry) = st.entries.get_mut(key) else {
            panic!("should not happen: release of a key that is not resident");
        };
        assert!(entry.refs > 0, "should not happen: release of an unpinned key");
        entry.refs -= 1;
        if entry.refs > 0 {
            return;
        }

        if entry.del.is_empty() {
            st.tick += 1;
            let tick = st.tick;
            let entry = st.entries.get_mut(key).unwrap_or_else(|| {
                unreachable!("entry vanished while the lock was held")
            });
            entry.lru_tick = Some(tick);
            st.evictable.insert(tick, key.clone());
        } else {
            // A deleter got here first: complete the deletion on its behalf.
            let entry = st.entries.remove(key).unwrap_or_else(|| {
                unreachable!("entry vanished while the lock was held")
            });
            for gate in entry.del {
                gate.open();
            }
        }
        Self::notify_avail(&mut st);
    }

    /// Remove `key` from the cache, blocking until it is unpinned.
    ///
    /// Returns immediately if `key` is not resident.
    pub fn delete(&self, key: &K) {
        let mut st = self.state.lock();
        let Some(entry) = st.entries.get_mut(key) else {
            return;
        };
        if entry.refs > 0 {
            let gate = Arc::new(Gate::default());
            entry.del.push(Arc::clone(&gate));
            drop(st);
            gate.wait();
            return;
        }
        let tick = entry.lru_tick.take();
        st.entries.remove(key);
        if let Some(tick) = tick {
            st.evictable.remove(&tick);
        }
        // The entry was already evictable, so nothing new became available.
    }

    /// Run the source's writeback for every resident entry.
    pub fn flush(&self, cx: &Cx) -> Result<()> {
        let st = self.state.lock();
        let mut errs = Vec::new();
        for (key, entry) in &st.entries {
            if let Err(err) = self.src.flush(cx, key, &entry.val) {
                errs.push(err);
            }
        }
        RfsError::aggregate(errs, None)
    }

    fn notify_avail(st: &mut State<K, V>) {
        if let Some(gate) = st.avail_waiters.pop_front() {
            gate.open();
        }
    }
}
