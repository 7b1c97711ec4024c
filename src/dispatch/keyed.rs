use std::collections::VecDeque;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PendingState<K> {
    queues: FxHashMap<K, VecDeque<Task>>,
    active: FxHashSet<K>,
}

struct DispatcherInner<K> {
    pending: Mutex<PendingState<K>>,
    worker_thread_name: String,
}

/// Executes callbacks asynchronously, guaranteeing that tasks submitted under the same
///  correlation key run strictly in submission order with at most one active worker per
///  key, while tasks under different keys run fully concurrently.
///
/// Serializing *all* asynchronous callbacks on one thread would destroy concurrency
///  across unrelated remote parties; running every callback on its own thread would
///  destroy per-party ordering. Per-key ownership gives full inter-key concurrency with
///  intra-key total order, at the cost of an ephemeral worker thread only while a key has
///  pending work.
pub struct KeyedOrderedDispatcher<K> {
    inner: Arc<DispatcherInner<K>>,
}

impl<K> Clone for KeyedOrderedDispatcher<K> {
    fn clone(&self) -> Self {
        KeyedOrderedDispatcher {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Hash + Eq + Clone + Send + 'static> KeyedOrderedDispatcher<K> {
    pub fn new(name: &str) -> KeyedOrderedDispatcher<K> {
        KeyedOrderedDispatcher {
            inner: Arc::new(DispatcherInner {
                pending: Mutex::new(PendingState {
                    queues: FxHashMap::default(),
                    active: FxHashSet::default(),
                }),
                worker_thread_name: format!("{} keyed dispatcher", name),
            }),
        }
    }

    /// Appends the task to the key's pending queue and claims ownership of the key if
    ///  nobody holds it. If another worker currently owns the key, that worker is
    ///  guaranteed to pick the task up before it relinquishes ownership.
    pub fn submit(&self, key: K, task: impl FnOnce() + Send + 'static) {
        let became_owner = {
            let mut state = self.inner.pending.lock();
            state
                .queues
                .entry(key.clone())
                .or_default()
                .push_back(Box::new(task));
            state.active.insert(key.clone())
        };

        if became_owner {
            trace!("claimed dispatch ownership, spawning worker");
            Self::spawn_worker(self.inner.clone(), key);
        }
    }

    fn spawn_worker(inner: Arc<DispatcherInner<K>>, key: K) {
        let thread_name = inner.worker_thread_name.clone();
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || Self::drain(inner, key))
            .expect("failed to spawn dispatcher worker thread");
    }

    fn drain(inner: Arc<DispatcherInner<K>>, key: K) {
        loop {
            let task = {
                let mut state = inner.pending.lock();
                match state.queues.get_mut(&key).and_then(|queue| queue.pop_front()) {
                    Some(task) => task,
                    None => {
                        // atomically relinquish ownership under the same lock that
                        //  submitters use to claim it; the emptied queue is evicted so an
                        //  idle key does not keep memory alive
                        state.queues.remove(&key);
                        state.active.remove(&key);
                        return;
                    }
                }
            };

            if let Err(panic_payload) = panic::catch_unwind(AssertUnwindSafe(|| task())) {
                // hand ownership to a replacement worker before propagating, so one bad
                //  task neither stalls nor drops its siblings under the same key
                debug!("task panicked, handing key ownership to a replacement worker");
                Self::spawn_worker(inner.clone(), key.clone());
                panic::resume_unwind(panic_payload);
            }
        }
    }

    #[cfg(test)]
    fn pending_key_count(&self) -> usize {
        self.inner.pending.lock().queues.len()
    }
}
