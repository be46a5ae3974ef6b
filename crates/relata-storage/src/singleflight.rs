//! Singleflight: collapse concurrent identical lookups into one execution.

use dashmap::DashMap;
use tokio::sync::broadcast;

/// Result broadcast to followers of a singleflight call.
#[derive(Debug, Clone)]
pub struct SingleflightResult<V: Clone> {
    pub value: Option<V>,
    pub error: Option<String>,
}

/// Result of trying to acquire a singleflight slot.
pub enum SingleflightSlot<V: Clone> {
    /// We won the race and should execute the operation.
    /// Contains the sender to broadcast results.
    Leader(broadcast::Sender<SingleflightResult<V>>),
    /// Another task is executing; wait for its result.
    Follower(broadcast::Receiver<SingleflightResult<V>>),
}

/// Deduplicates concurrent identical operations: one caller executes, the
/// rest await its broadcast result. Entries are removed on completion, so
/// later calls execute again.
pub struct Singleflight<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    /// Map of in-flight requests to their broadcast senders.
    in_flight: DashMap<K, broadcast::Sender<SingleflightResult<V>>>,
}

impl<K, V> Singleflight<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }

    /// Atomically try to acquire a slot for this operation.
    ///
    /// Uses DashMap's entry API for atomic check-and-insert, preventing a
    /// race between observing an in-flight call and registering a new one.
    pub fn acquire(&self, key: K) -> SingleflightSlot<V> {
        use dashmap::mapref::entry::Entry;

        match self.in_flight.entry(key) {
            Entry::Occupied(entry) => SingleflightSlot::Follower(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(1);
                entry.insert(tx.clone());
                SingleflightSlot::Leader(tx)
            }
        }
    }

    /// Remove a completed in-flight request.
    pub fn complete(&self, key: &K) {
        self.in_flight.remove(key);
    }
}

impl<K, V> Default for Singleflight<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that ensures singleflight cleanup on drop.
///
/// Cleans up the in-flight entry even if the leader's execution panics or
/// is cancelled mid-await; followers then fall back to executing themselves.
pub struct SingleflightGuard<'a, K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    singleflight: &'a Singleflight<K, V>,
    key: K,
    completed: bool,
}

impl<'a, K, V> SingleflightGuard<'a, K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(singleflight: &'a Singleflight<K, V>, key: K) -> Self {
        Self {
            singleflight,
            key,
            completed: false,
        }
    }

    /// Mark as completed (normal path, not panic).
    pub fn complete(mut self) {
        self.singleflight.complete(&self.key);
        self.completed = true;
    }
}

impl<K, V> Drop for SingleflightGuard<'_, K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if !self.completed {
            self.singleflight.complete(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_acquire_is_leader_second_is_follower() {
        let group: Singleflight<String, u32> = Singleflight::new();

        let first = group.acquire("key".to_string());
        assert!(matches!(first, SingleflightSlot::Leader(_)));

        let second = group.acquire("key".to_string());
        assert!(matches!(second, SingleflightSlot::Follower(_)));
    }

    #[tokio::test]
    async fn test_followers_receive_the_leader_result() {
        let group: Singleflight<String, u32> = Singleflight::new();

        let SingleflightSlot::Leader(tx) = group.acquire("key".to_string()) else {
            panic!("expected leader");
        };
        let SingleflightSlot::Follower(mut rx) = group.acquire("key".to_string()) else {
            panic!("expected follower");
        };

        tx.send(SingleflightResult {
            value: Some(42),
            error: None,
        })
        .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.value, Some(42));
    }

    #[test]
    fn test_complete_releases_the_key() {
        let group: Singleflight<String, u32> = Singleflight::new();

        let _ = group.acquire("key".to_string());
        group.complete(&"key".to_string());

        assert!(matches!(
            group.acquire("key".to_string()),
            SingleflightSlot::Leader(_)
        ));
    }

    #[test]
    fn test_guard_cleans_up_on_drop() {
        let group: Singleflight<String, u32> = Singleflight::new();

        let _ = group.acquire("key".to_string());
        {
            let _guard = SingleflightGuard::new(&group, "key".to_string());
            // dropped without complete()
        }

        assert!(matches!(
            group.acquire("key".to_string()),
            SingleflightSlot::Leader(_)
        ));
    }
}
