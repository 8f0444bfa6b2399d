//! Sharded single-flight groups.
//!
//! [`FlightGroup`] de-duplicates concurrent identical calls: every caller
//! that arrives while a key is in flight joins the first call and receives
//! a clone of its outcome. The execution runs on its own task, so a caller
//! being cancelled never strands the other waiters. Keys are removed before
//! the outcome is broadcast, so a failed flight is never cached.
//!
//! [`KeyGate`] is the fire-and-forget sibling: it only answers "is this key
//! already being worked on", for de-duplicating background tasks nobody
//! awaits.

use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

fn shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .next_power_of_two()
}

fn shard_index<K: Hash>(key: &K, mask: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as usize & mask
}

struct FlightShards<K, T> {
    shards: Box<[Mutex<HashMap<K, watch::Receiver<Option<T>>>>]>,
    mask: usize,
}

impl<K: Eq + Hash, T> FlightShards<K, T> {
    fn remove(&self, key: &K) {
        let shard = &self.shards[shard_index(key, self.mask)];
        shard.lock().expect("flight shard lock poisoned").remove(key);
    }
}

/// A sharded group of in-flight calls keyed by `K`.
pub struct FlightGroup<K, T> {
    inner: Arc<FlightShards<K, T>>,
}

impl<K, T> Default for FlightGroup<K, T> {
    fn default() -> Self {
        let count = shard_count();
        let shards = (0..count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        FlightGroup {
            inner: Arc::new(FlightShards {
                shards,
                mask: count - 1,
            }),
        }
    }
}

impl<K, T> FlightGroup<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` under the given key, or join the execution already in
    /// flight for it. All concurrent callers see the same outcome.
    pub async fn run<F>(&self, key: K, fut: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
    {
        let mut rx = {
            let shard = &self.inner.shards[shard_index(&key, self.inner.mask)];
            let mut map = shard.lock().expect("flight shard lock poisoned");
            if let Some(rx) = map.get(&key) {
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None::<T>);
                map.insert(key.clone(), rx.clone());
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    let value = fut.await;
                    // Drop the key first: a new caller after this point
                    // starts a fresh flight instead of inheriting this
                    // outcome.
                    inner.remove(&key);
                    let _ = tx.send(Some(value));
                });
                rx
            }
        };
        loop {
            {
                let outcome = rx.borrow_and_update();
                if let Some(value) = outcome.as_ref() {
                    return value.clone();
                }
            }
            rx.changed()
                .await
                .expect("flight leader dropped without an outcome");
        }
    }
}

/// A sharded set of keys currently being worked on.
pub struct KeyGate<K> {
    shards: Box<[Mutex<HashSet<K>>]>,
    mask: usize,
}

impl<K: Eq + Hash> Default for KeyGate<K> {
    fn default() -> Self {
        let count = shard_count();
        let shards = (0..count)
            .map(|_| Mutex::new(HashSet::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        KeyGate {
            shards,
            mask: count - 1,
        }
    }
}

impl<K: Eq + Hash + Clone> KeyGate<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a key. Returns false if it is already claimed.
    pub fn try_acquire(&self, key: &K) -> bool {
        let shard = &self.shards[shard_index(key, self.mask)];
        shard
            .lock()
            .expect("key gate lock poisoned")
            .insert(key.clone())
    }

    /// Release a previously claimed key.
    pub fn release(&self, key: &K) {
        let shard = &self.shards[shard_index(key, self.mask)];
        shard.lock().expect("key gate lock poisoned").remove(key);
    }
}
