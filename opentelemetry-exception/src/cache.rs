//! # Stack Cache
//!
//! Resolving a frame means reading its source file and slicing a window out
//! of it, which is far too expensive to repeat every time the same error is
//! raised. [`StackCache`] remembers resolved frames keyed by their location
//! and evicts the least recently used entry once it is full.
use crate::frame::StackFrame;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Default number of frames kept by a [`StackCache`].
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Identity of a resolved frame.
///
/// The line number is part of the key, so a cached frame is always anchored
/// to the window around that exact line.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrameKey {
    /// Source file as reported by the runtime.
    pub file_path: String,
    /// 1-based line number.
    pub line_number: u32,
    /// Function name as reported by the runtime.
    pub function_name: String,
}

impl FrameKey {
    /// Create a new key.
    pub fn new(
        file_path: impl Into<String>,
        line_number: u32,
        function_name: impl Into<String>,
    ) -> Self {
        FrameKey {
            file_path: file_path.into(),
            line_number,
            function_name: function_name.into(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    frame: Arc<StackFrame>,
    tick: u64,
}

#[derive(Debug, Default)]
struct Lru {
    entries: HashMap<FrameKey, Entry>,
    // tick -> key, oldest first
    recency: BTreeMap<u64, FrameKey>,
    next_tick: u64,
}

impl Lru {
    fn touch(&mut self, key: &FrameKey) -> Option<Arc<StackFrame>> {
        let tick = self.next_tick;
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, key.clone());
        self.next_tick += 1;
        Some(entry.frame.clone())
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.recency.pop_first() {
            self.entries.remove(&key);
        }
    }
}

/// Bounded, thread safe least-recently-used cache of resolved frames.
///
/// Both reads and writes count as an access. A single lock guards the map and
/// the recency order together, so concurrent callers never observe one
/// without the other.
#[derive(Debug)]
pub struct StackCache {
    capacity: usize,
    inner: Mutex<Lru>,
}

impl Default for StackCache {
    fn default() -> Self {
        StackCache::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl StackCache {
    /// Create a cache holding at most `capacity` frames. A capacity of zero is
    /// raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        StackCache {
            capacity,
            inner: Mutex::new(Lru {
                entries: HashMap::with_capacity(capacity),
                ..Default::default()
            }),
        }
    }

    /// Maximum number of frames kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of frames currently cached.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a frame, marking it as most recently used.
    pub fn get(&self, key: &FrameKey) -> Option<Arc<StackFrame>> {
        self.lock().touch(key)
    }

    /// Insert or replace a frame. When the cache is full the least recently
    /// used entry is evicted to make room.
    pub fn put(&self, key: FrameKey, frame: Arc<StackFrame>) {
        let mut guard = self.lock();
        let lru = &mut *guard;
        let tick = lru.next_tick;
        lru.next_tick += 1;

        if let Some(entry) = lru.entries.get_mut(&key) {
            let old_tick = entry.tick;
            entry.frame = frame;
            entry.tick = tick;
            lru.recency.remove(&old_tick);
            lru.recency.insert(tick, key);
            return;
        }

        if lru.entries.len() >= self.capacity {
            lru.evict_oldest();
        }
        lru.recency.insert(tick, key.clone());
        lru.entries.insert(key, Entry { frame, tick });
    }

    fn lock(&self) -> MutexGuard<'_, Lru> {
        // The guarded structure is updated atomically under the lock, so a
        // panic elsewhere cannot leave it half-written.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn frame(name: &str, line: u32) -> Arc<StackFrame> {
        Arc::new(StackFrame::unresolved(
            format!("src/{name}.rs"),
            line,
            name.to_string(),
            "test",
            false,
        ))
    }

    fn key(name: &str, line: u32) -> FrameKey {
        FrameKey::new(format!("src/{name}.rs"), line, name)
    }

    #[test]
    fn get_after_put_returns_same_frame() {
        let cache = StackCache::new(4);
        let stored = frame("parse", 42);
        cache.put(key("parse", 42), stored.clone());

        let fetched = cache.get(&key("parse", 42)).expect("cached frame");
        assert!(Arc::ptr_eq(&stored, &fetched));
    }

    #[test]
    fn miss_returns_none() {
        let cache = StackCache::new(4);
        assert!(cache.get(&key("parse", 42)).is_none());
        // same file and function, other line
        cache.put(key("parse", 42), frame("parse", 42));
        assert!(cache.get(&key("parse", 43)).is_none());
    }

    #[test]
    fn overflow_evicts_least_recently_used() {
        let cache = StackCache::new(3);
        for (name, line) in [("a", 1), ("b", 2), ("c", 3)] {
            cache.put(key(name, line), frame(name, line));
        }
        // "a" becomes the most recent, so "b" is now the oldest.
        assert!(cache.get(&key("a", 1)).is_some());

        cache.put(key("d", 4), frame("d", 4));

        assert_eq!(cache.len(), 3);
        assert!(cache.get(&key("b", 2)).is_none());
        assert!(cache.get(&key("a", 1)).is_some());
        assert!(cache.get(&key("c", 3)).is_some());
        assert!(cache.get(&key("d", 4)).is_some());
    }

    #[test]
    fn capacity_plus_one_evicts_exactly_one() {
        let cache = StackCache::new(DEFAULT_CACHE_CAPACITY);
        for line in 0..=DEFAULT_CACHE_CAPACITY as u32 {
            cache.put(key("f", line), frame("f", line));
        }
        assert_eq!(cache.len(), DEFAULT_CACHE_CAPACITY);
        assert!(cache.get(&key("f", 0)).is_none());
        for line in 1..=DEFAULT_CACHE_CAPACITY as u32 {
            assert!(cache.get(&key("f", line)).is_some(), "line {line} evicted");
        }
    }

    #[test]
    fn replacing_existing_key_does_not_evict() {
        let cache = StackCache::new(2);
        cache.put(key("a", 1), frame("a", 1));
        cache.put(key("b", 2), frame("b", 2));

        let replacement = frame("a", 1);
        cache.put(key("a", 1), replacement.clone());

        assert_eq!(cache.len(), 2);
        assert!(Arc::ptr_eq(&cache.get(&key("a", 1)).unwrap(), &replacement));
        assert!(cache.get(&key("b", 2)).is_some());
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let cache = StackCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.put(key("a", 1), frame("a", 1));
        cache.put(key("b", 2), frame("b", 2));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("b", 2)).is_some());
    }

    #[test]
    fn concurrent_access_keeps_bounds() {
        let cache = Arc::new(StackCache::new(16));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for line in 0..200 {
                        let name = format!("w{}", worker % 4);
                        cache.put(key(&name, line % 32), frame(&name, line % 32));
                        let _ = cache.get(&key(&name, (line + 1) % 32));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let lru = cache.lock();
        assert!(lru.entries.len() <= 16);
        assert_eq!(lru.entries.len(), lru.recency.len());
        for (tick, key) in &lru.recency {
            assert_eq!(lru.entries[key].tick, *tick);
        }
    }
}
