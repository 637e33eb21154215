use crate::cache::Cache;
use crate::clock::Clock;
use crate::fields::Fields;
use crate::metrics_defs::{BATCH_FLUSH_SIZE, CACHE_HIT, CACHE_MISS};
use crate::types::{CacheEntry, SharedEntry, cache_key, shared_entry};
use crate::upstream::Client;
use crate::wait::{Done, DoneHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const MAX_BATCH_ENTRIES: usize = 100;
const SWEEP_INTERVAL: Duration = Duration::from_millis(10);

struct Batch {
    entries: HashMap<String, SharedEntry>,
    done: Done,
}

impl Batch {
    fn with_capacity(capacity: usize) -> Batch {
        Batch {
            entries: HashMap::with_capacity(capacity),
            done: Done::new(),
        }
    }
}

struct State {
    /// The accumulating batch.
    next: Batch,
    /// Dispatched batches awaiting their upstream call. While a batch is
    /// here, its entries appear in no other batch; late callers for the same
    /// key attach to the running entry and wait on its signal.
    running: Vec<Arc<Batch>>,
    cache: Cache,
}

struct Inner {
    state: Mutex<State>,
    client: Arc<dyn Client>,
}

/// The request-coalescing batching engine.
///
/// `add` is pure in-memory work under one mutex; blocking happens only on the
/// completion signal a caller awaits. The upstream call runs outside the lock.
#[derive(Clone)]
pub struct Batcher {
    inner: Arc<Inner>,
}

impl Batcher {
    pub fn new(cache_max_bytes: usize, client: Arc<dyn Client>, clock: Arc<dyn Clock>) -> Batcher {
        Batcher {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next: Batch::with_capacity(0),
                    running: Vec::new(),
                    cache: Cache::new(cache_max_bytes, clock),
                }),
                client,
            }),
        }
    }

    /// Registers a lookup and returns the entry it will resolve into.
    ///
    /// A `None` handle means the entry is already complete (cache hit); any
    /// other caller must await the handle before reading the response.
    pub fn add(&self, ip: &str, lang: &str, fields: Fields) -> (SharedEntry, Option<DoneHandle>) {
        let key = cache_key(ip, lang);
        let mut state = self.inner.state.lock();

        // Complete in the cache with every requested field?
        if let Some(entry) = state.cache.get(&key) {
            if entry.read().fields.contains(fields) {
                metrics::counter!(CACHE_HIT.name).increment(1);
                return (entry, None);
            }
        }
        metrics::counter!(CACHE_MISS.name).increment(1);

        // Already on its way to the upstream?
        for batch in &state.running {
            if let Some(entry) = batch.entries.get(&key) {
                if entry.read().fields.contains(fields) {
                    return (Arc::clone(entry), Some(batch.done.handle()));
                }
            }
        }

        // Pending in the accumulating batch? Widen its mask and share it.
        if let Some(entry) = state.next.entries.get(&key) {
            {
                let mut e = entry.write();
                e.fields = e.fields.merge(fields);
            }
            let entry = Arc::clone(entry);
            let handle = state.next.done.handle();
            return (entry, Some(handle));
        }

        let entry = shared_entry(CacheEntry::new(ip, lang, fields));
        state.next.entries.insert(key, Arc::clone(&entry));

        // The signal is captured before the flush below can rotate it away.
        let handle = state.next.done.handle();
        if state.next.entries.len() >= MAX_BATCH_ENTRIES {
            self.flush_locked(&mut state);
        }

        (entry, Some(handle))
    }

    /// Time-triggered flush loop; spawned once at startup.
    pub async fn process_loop(&self) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            self.process();
        }
    }

    /// Flushes the accumulating batch if it holds anything.
    pub fn process(&self) {
        let mut state = self.inner.state.lock();
        if !state.next.entries.is_empty() {
            self.flush_locked(&mut state);
        }
    }

    /// Moves `next` into `running` and dispatches the upstream call.
    fn flush_locked(&self, state: &mut State) {
        let len = state.next.entries.len();
        let flushed = Arc::new(std::mem::replace(
            &mut state.next,
            Batch::with_capacity(len),
        ));
        state.running.push(Arc::clone(&flushed));

        tracing::debug!(entries = len, "flushing batch");
        metrics::histogram!(BATCH_FLUSH_SIZE.name).record(len as f64);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            // Ordered snapshot: the same slice drives the request payload and
            // the positional response assignment.
            let snapshot: Vec<SharedEntry> = flushed.entries.values().cloned().collect();
            let result = inner.client.fetch(&snapshot).await;

            let mut state = inner.state.lock();
            match result {
                Ok(()) => {
                    for (key, entry) in &flushed.entries {
                        state.cache.add(key.clone(), Arc::clone(entry));
                    }
                }
                // Failed batches are not cached; every entry still holds the
                // pre-populated upstream error for its waiters.
                Err(e) => tracing::warn!(error = %e, entries = flushed.entries.len(), "batch failed"),
            }

            if let Some(i) = state.running.iter().position(|b| Arc::ptr_eq(b, &flushed)) {
                state.running.swap_remove(i);
            }
            flushed.done.close();
        });
    }

    /// Cache byte total, for tests and introspection.
    #[cfg(test)]
    pub(crate) fn cache_size(&self) -> usize {
        self.inner.state.lock().cache.size()
    }
}
