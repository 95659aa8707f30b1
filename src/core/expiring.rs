use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::warn;

/// Callback fired when an entry's lifetime runs out.
pub type ExpiryCallback<K, V> = Box<dyn Fn(K, V) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Deadline<K> {
    at: Instant,
    key: K,
}

impl<K: Ord + Eq> PartialOrd for Deadline<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord + Eq> Ord for Deadline<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then_with(|| self.key.cmp(&other.key))
    }
}

struct Shared<K, V> {
    entries: Mutex<HashMap<K, V>>,
    // Min-heap of absolute deadlines. Lock order is entries then queue, always.
    queue: Mutex<BinaryHeap<Reverse<Deadline<K>>>>,
    sweeping: AtomicBool,
    on_expired: ExpiryCallback<K, V>,
}

/// Map whose entries disappear a fixed time after their last insert.
///
/// One background task at a time sleeps until the earliest deadline and removes the
/// entry it belongs to, firing the expiry callback with the evicted value. A node in
/// the deadline queue only wins if it is still the head for the key it was scheduled
/// for, so replacements observed mid-sleep are skipped rather than mis-evicted.
pub struct ExpiringMap<K, V> {
    shared: Arc<Shared<K, V>>,
    ttl: Duration,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Clone + Eq + Hash + Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, on_expired: ExpiryCallback<K, V>) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                queue: Mutex::new(BinaryHeap::new()),
                sweeping: AtomicBool::new(false),
                on_expired,
            }),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Set the entry and schedule it to expire `ttl` from now. Replacing an existing
    /// entry drops its stale deadline and schedules a fresh one.
    pub fn insert(&self, key: K, value: V) {
        let deadline = Instant::now() + self.ttl;
        {
            let mut entries = self.shared.entries.lock().unwrap();
            let mut queue = self.shared.queue.lock().unwrap();
            if entries.insert(key.clone(), value).is_some() {
                queue.retain(|Reverse(node)| node.key != key);
            }
            queue.push(Reverse(Deadline { at: deadline, key }));
        }
        self.ensure_sweeper();
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.shared.entries.lock().unwrap().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shared.entries.lock().unwrap().contains_key(key)
    }

    /// Drop the entry and its pending deadline.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.shared.entries.lock().unwrap();
        let mut queue = self.shared.queue.lock().unwrap();
        let removed = entries.remove(key);
        if removed.is_some() {
            queue.retain(|Reverse(node)| &node.key != key);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.lock().unwrap().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.shared.entries.lock().unwrap().keys().cloned().collect()
    }

    fn ensure_sweeper(&self) {
        if self
            .shared
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tokio::spawn(sweep(Arc::clone(&self.shared)));
        }
    }
}

async fn sweep<K, V>(shared: Arc<Shared<K, V>>)
where
    K: Clone + Eq + Hash + Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    loop {
        let next = {
            let queue = shared.queue.lock().unwrap();
            queue.peek().map(|Reverse(node)| (node.at, node.key.clone()))
        };

        let Some((at, key)) = next else {
            shared.sweeping.store(false, Ordering::Release);
            // An insert may have raced the flag clear; reclaim and keep going if so.
            let pending = !shared.queue.lock().unwrap().is_empty();
            if pending
                && shared
                    .sweeping
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                continue;
            }
            return;
        };

        sleep_until(at).await;

        let expired = {
            let mut entries = shared.entries.lock().unwrap();
            let mut queue = shared.queue.lock().unwrap();
            let head_matches = queue
                .peek()
                .is_some_and(|Reverse(node)| node.key == key && node.at == at);
            if head_matches {
                queue.pop();
                entries.remove(&key).map(|value| (key, value))
            } else {
                None
            }
        };

        if let Some((key, value)) = expired {
            if catch_unwind(AssertUnwindSafe(|| (shared.on_expired)(key, value))).is_err() {
                warn!("expiry handler panicked; entry was still removed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::{advance, timeout};

    fn expiring_with_events(
        ttl: Duration,
    ) -> (ExpiringMap<String, u32>, mpsc::UnboundedReceiver<(String, u32)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let map = ExpiringMap::new(
            ttl,
            Box::new(move |key, value| {
                let _ = tx.send((key, value));
            }),
        );
        (map, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_the_lifetime() {
        let (map, mut rx) = expiring_with_events(Duration::from_millis(100));
        map.insert("a".to_string(), 1);
        assert!(map.contains_key(&"a".to_string()));

        let (key, value) = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("expiry should fire")
            .expect("channel open");
        assert_eq!(key, "a");
        assert_eq!(value, 1);
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_reschedules_the_deadline() {
        let (map, mut rx) = expiring_with_events(Duration::from_millis(100));
        map.insert("a".to_string(), 1);

        advance(Duration::from_millis(60)).await;
        map.insert("a".to_string(), 2);

        let (key, value) = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("expiry should fire")
            .expect("channel open");
        assert_eq!(key, "a");
        assert_eq!(value, 2);
        assert!(rx.try_recv().is_err(), "the stale deadline must not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn removal_cancels_expiry() {
        let (map, mut rx) = expiring_with_events(Duration::from_millis(100));
        map.insert("a".to_string(), 1);
        assert_eq!(map.remove(&"a".to_string()), Some(1));

        advance(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_survives_batches_and_restarts() {
        let (map, mut rx) = expiring_with_events(Duration::from_millis(50));
        map.insert("a".to_string(), 1);
        map.insert("b".to_string(), 2);

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (key, _) = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("expiry should fire")
                .expect("channel open");
            seen.push(key);
        }
        seen.sort();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);

        // The worker exited with an empty queue; a later insert must revive it.
        map.insert("c".to_string(), 3);
        let (key, value) = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("expiry should fire again")
            .expect("channel open");
        assert_eq!(key, "c");
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn get_returns_live_values_only() {
        let (map, mut rx) = expiring_with_events(Duration::from_millis(100));
        map.insert("a".to_string(), 7);
        assert_eq!(map.get(&"a".to_string()), Some(7));

        let _ = timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(map.get(&"a".to_string()), None);
    }
}
