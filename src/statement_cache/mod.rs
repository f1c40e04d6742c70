//! Prepared-Statement Cache.
//!
//! Generic over the prepared-statement handle type `H` the (external,
//! out-of-scope) driver layer produces — this crate only owns the
//! sharded, ref-counted LRU bookkeeping around it.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DEFAULT_CAPACITY: usize = 100;
const DEFAULT_SHARDS: usize = 64;

struct EntryInner<H> {
    handle: Option<H>,
    ref_count: usize,
    evicted: bool,
}

/// A live reference to a cached statement. Dropping this without
/// calling [`Release::release`] is safe (the entry simply never
/// returns to ref_count 0 through this handle) but leaks the
/// reference count; callers are expected to call it exactly once,
/// which the consuming signature makes structurally hard to forget
/// twice (calling it a second time is a compile error, not a runtime
/// one).
pub struct Release<H> {
    entry: Arc<Mutex<EntryInner<H>>>,
}

impl<H> Release<H> {
    pub fn release(self) {
        let mut inner = self.entry.lock();
        inner.ref_count = inner.ref_count.saturating_sub(1);
        if inner.ref_count == 0 && inner.evicted {
            inner.handle = None;
        }
    }
}

struct ShardState<H> {
    order: VecDeque<String>,
    map: HashMap<String, Arc<Mutex<EntryInner<H>>>>,
}

struct Shard<H> {
    state: Mutex<ShardState<H>>,
    capacity: usize,
}

impl<H> Shard<H> {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ShardState { order: VecDeque::new(), map: HashMap::new() }),
            capacity,
        }
    }

    fn touch_mru(order: &mut VecDeque<String>, key: &str) {
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
        order.push_back(key.to_string());
    }

    fn evict_one(state: &mut ShardState<H>) {
        while let Some(victim_key) = state.order.pop_front() {
            if let Some(victim) = state.map.remove(&victim_key) {
                let mut inner = victim.lock();
                inner.evicted = true;
                if inner.ref_count == 0 {
                    inner.handle = None;
                }
                return;
            }
            // key was already removed from the map by close()/clear(); keep scanning.
        }
    }
}

/// Shard count and per-shard capacity are both fixed at construction
///. Minimum per-shard capacity is 1 so a tiny total capacity
/// still works.
pub struct StatementCache<H> {
    shards: Vec<Shard<H>>,
    closed: AtomicBool,
}

impl<H: Clone> StatementCache<H> {
    pub fn new(capacity: usize, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let per_shard = (capacity / shard_count).max(1);
        let shards = (0..shard_count).map(|_| Shard::new(per_shard)).collect();
        Self { shards, closed: AtomicBool::new(false) }
    }

    fn shard_for(&self, sql: &str) -> &Shard<H> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        sql.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Look up a cached statement, bumping it to MRU and incrementing
    /// its reference count. Returns `None` on a cache miss.
    pub fn get(&self, sql: &str) -> Option<(H, Release<H>)> {
        let shard = self.shard_for(sql);
        let mut state = shard.state.lock();
        let entry = state.map.get(sql)?.clone();
        Shard::<H>::touch_mru(&mut state.order, sql);
        drop(state);

        let handle = {
            let mut inner = entry.lock();
            inner.ref_count += 1;
            inner.handle.clone()?
        };
        Some((handle, Release { entry }))
    }

    /// Insert a freshly prepared handle and immediately hand back a
    /// live reference to it, in one critical section — this prevents
    /// the window a separate insert-then-get would have, where the
    /// entry could be evicted before the caller ever sees it.
    pub fn put_and_get(&self, sql: impl Into<String>, handle: H) -> crate::Result<(H, Release<H>)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(crate::error::Error::new(crate::error::ErrorKind::InvalidSyntax)
                .with_operation("statement_cache.put_and_get")
                .with_query("cache is closed", 0));
        }

        let sql = sql.into();
        let shard = self.shard_for(&sql);
        let mut state = shard.state.lock();

        if state.map.contains_key(&sql) {
            state.map.remove(&sql);
            if let Some(pos) = state.order.iter().position(|k| k == &sql) {
                state.order.remove(pos);
            }
        } else if state.order.len() >= shard.capacity {
            Shard::<H>::evict_one(&mut state);
        }

        let entry = Arc::new(Mutex::new(EntryInner { handle: Some(handle.clone()), ref_count: 1, evicted: false }));
        state.map.insert(sql.clone(), entry.clone());
        state.order.push_back(sql);

        Ok((handle, Release { entry }))
    }

    /// Mark every entry evicted; handles with no outstanding
    /// references are destroyed immediately, in-flight ones survive
    /// until their holder calls [`Release::release`].
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut state = shard.state.lock();
            for (_, entry) in state.map.drain() {
                let mut inner = entry.lock();
                inner.evicted = true;
                if inner.ref_count == 0 {
                    inner.handle = None;
                }
            }
            state.order.clear();
        }
    }

    /// Like [`Self::clear`], and additionally refuses subsequent
    /// [`Self::put_and_get`] calls.
    pub fn close(&self) {
        self.clear();
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<H: Clone> Default for StatementCache<H> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_SHARDS)
    }
}
