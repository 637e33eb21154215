use crate::clock::Clock;
use crate::types::SharedEntry;
use lru::LruCache;
use std::sync::Arc;

struct Slot {
    entry: SharedEntry,
    size: usize,
}

/// Byte-budgeted LRU over cache keys, with a TTL check on read.
///
/// Not internally synchronized: the batcher owns it behind its own mutex, so
/// every access is already serialized. `get` of an expired entry reports a
/// miss but neither promotes nor evicts; the slot stays until normal LRU
/// pressure removes it or an `add` for the same key replaces it.
pub struct Cache {
    entries: LruCache<String, Slot>,
    size_bytes: usize,
    max_bytes: usize,
    clock: Arc<dyn Clock>,
}

impl Cache {
    pub fn new(max_bytes: usize, clock: Arc<dyn Clock>) -> Cache {
        Cache {
            entries: LruCache::unbounded(),
            size_bytes: 0,
            max_bytes,
            clock,
        }
    }

    /// Current total of entry sizes in bytes.
    pub fn size(&self) -> usize {
        self.size_bytes
    }

    /// Inserts or overwrites, promoting the key to most recently used, then
    /// evicts from the tail until the byte budget holds.
    pub fn add(&mut self, key: String, entry: SharedEntry) {
        let size = entry.read().size();
        if let Some(old) = self.entries.put(key, Slot { entry, size }) {
            self.size_bytes -= old.size;
        }
        self.size_bytes += size;

        while self.size_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, dropped)) => self.size_bytes -= dropped.size,
                None => break,
            }
        }
    }

    pub fn get(&mut self, key: &str) -> Option<SharedEntry> {
        let now = self.clock.now();
        // Probe without promoting so an expired entry keeps its position.
        let expired = match self.entries.peek(key) {
            None => return None,
            Some(slot) => slot.entry.read().expires.is_none_or(|at| at < now),
        };
        if expired {
            return None;
        }
        self.entries.get(key).map(|slot| Arc::clone(&slot.entry))
    }
}
