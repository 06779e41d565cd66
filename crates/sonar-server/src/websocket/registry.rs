//! Live connection registry and the device → subscriber index.
//!
//! Both maps sit behind one mutex so every mutation updates them together:
//! for each live record, `record.devices` and the index's entries for that
//! record are always the exact inverse of each other. The lock is never held
//! across an `.await`.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use sonar_core::{ConnectionId, DeviceName};
use tokio::time::Instant;
use tracing::debug;

use super::connection::{ConnectionChannel, ConnectionRecord};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// Mapping from device to the connections interested in it.
///
/// Devices with no subscribers are removed rather than left empty.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    by_device: HashMap<DeviceName, HashSet<ConnectionId>>,
}

impl SubscriptionIndex {
    fn add(&mut self, device: &DeviceName, id: &ConnectionId) {
        let _ = self
            .by_device
            .entry(device.clone())
            .or_default()
            .insert(id.clone());
    }

    fn remove(&mut self, device: &DeviceName, id: &ConnectionId) {
        if let Entry::Occupied(mut entry) = self.by_device.entry(device.clone()) {
            let _ = entry.get_mut().remove(id);
            if entry.get().is_empty() {
                let _ = entry.remove();
            }
        }
    }

    fn subscribers(&self, device: &DeviceName) -> Vec<ConnectionId> {
        self.by_device
            .get(device)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn device_count(&self) -> usize {
        self.by_device.len()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    records: HashMap<ConnectionId, ConnectionRecord>,
    index: SubscriptionIndex,
}

/// Owner of every live [`ConnectionRecord`] and the [`SubscriptionIndex`].
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh identity bound to `channel` with no subscriptions.
    pub fn register(&self, channel: ConnectionChannel) -> ConnectionId {
        let id = ConnectionId::new();
        let record = ConnectionRecord::new(id.clone(), channel);
        let mut inner = self.inner.lock();
        let _ = inner.records.insert(id.clone(), record);
        debug!(conn_id = %id, connections = inner.records.len(), "connection registered");
        id
    }

    /// Refresh `last_seen`. Returns `false` if the connection is already gone.
    pub fn touch(&self, id: &ConnectionId) -> bool {
        match self.inner.lock().records.get_mut(id) {
            Some(record) => {
                record.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Replace the connection's subscription set with `devices`.
    ///
    /// Only the delta is applied to the index. Returns the resulting set, sorted.
    pub fn set_subscriptions(
        &self,
        id: &ConnectionId,
        devices: BTreeSet<DeviceName>,
    ) -> Result<Vec<DeviceName>, RegistryError> {
        let mut guard = self.inner.lock();
        let RegistryInner { records, index } = &mut *guard;
        let record = records
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;

        for dropped in record.devices.difference(&devices) {
            index.remove(dropped, id);
        }
        for added in devices.difference(&record.devices) {
            index.add(added, id);
        }
        record.devices = devices;
        Ok(record.devices.iter().cloned().collect())
    }

    /// Remove `devices` from the connection's subscription set.
    ///
    /// Devices the connection was not subscribed to are ignored.
    pub fn unsubscribe(
        &self,
        id: &ConnectionId,
        devices: &BTreeSet<DeviceName>,
    ) -> Result<Vec<DeviceName>, RegistryError> {
        let mut guard = self.inner.lock();
        let RegistryInner { records, index } = &mut *guard;
        let record = records
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;

        for device in devices {
            if record.devices.remove(device) {
                index.remove(device, id);
            }
        }
        Ok(record.devices.iter().cloned().collect())
    }

    /// Remove the connection and all of its index entries.
    ///
    /// Idempotent: returns the channel only for the call that actually removed
    /// the record, so the caller can close it.
    pub fn unregister(&self, id: &ConnectionId) -> Option<ConnectionChannel> {
        let mut guard = self.inner.lock();
        let RegistryInner { records, index } = &mut *guard;
        let record = records.remove(id)?;
        for device in &record.devices {
            index.remove(device, id);
        }
        debug!(conn_id = %id, connections = records.len(), "connection unregistered");
        Some(record.channel)
    }

    /// Drop every connection and ask each one to flush its outbox and close.
    /// Used at shutdown.
    pub fn close_all(&self) -> usize {
        let drained: Vec<ConnectionRecord> = {
            let mut guard = self.inner.lock();
            guard.index = SubscriptionIndex::default();
            guard.records.drain().map(|(_, r)| r).collect()
        };
        for record in &drained {
            record.channel.close_gracefully();
        }
        drained.len()
    }

    /// Snapshot of the connections subscribed to `device`.
    pub fn subscribers_of(&self, device: &DeviceName) -> Vec<ConnectionId> {
        self.inner.lock().index.subscribers(device)
    }

    /// Current send handle of a live connection.
    pub fn channel(&self, id: &ConnectionId) -> Option<ConnectionChannel> {
        self.inner.lock().records.get(id).map(|r| r.channel.clone())
    }

    /// Current subscription set of a live connection, sorted.
    pub fn subscriptions(&self, id: &ConnectionId) -> Option<Vec<DeviceName>> {
        self.inner
            .lock()
            .records
            .get(id)
            .map(|r| r.devices.iter().cloned().collect())
    }

    /// Connections that have been silent for longer than `threshold`.
    pub fn idle_connections(&self, threshold: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| r.is_idle(now, threshold))
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.lock().records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of devices with at least one subscriber.
    pub fn device_count(&self) -> usize {
        self.inner.lock().index.device_count()
    }

    /// Check that the index is exactly the inverse of the records' device sets.
    pub fn is_consistent(&self) -> bool {
        let inner = self.inner.lock();
        let mut expected: HashMap<&DeviceName, HashSet<&ConnectionId>> = HashMap::new();
        for record in inner.records.values() {
            for device in &record.devices {
                let _ = expected.entry(device).or_default().insert(&record.id);
            }
        }
        if expected.len() != inner.index.by_device.len() {
            return false;
        }
        inner.index.by_device.iter().all(|(device, ids)| {
            expected
                .get(device)
                .is_some_and(|exp| exp.len() == ids.len() && ids.iter().all(|id| exp.contains(id)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn devices(names: &[&str]) -> BTreeSet<DeviceName> {
        DeviceName::normalize_all(names)
    }

    fn device(name: &str) -> DeviceName {
        DeviceName::normalize(name).unwrap()
    }

    fn register(registry: &Registry) -> ConnectionId {
        let (channel, _rx) = ConnectionChannel::bounded(8);
        registry.register(channel)
    }

    fn names(list: &[DeviceName]) -> Vec<&str> {
        list.iter().map(DeviceName::as_str).collect()
    }

    #[test]
    fn register_and_unregister() {
        let registry = Registry::new();
        let a = register(&registry);
        let b = register(&registry);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(&a).is_some());
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&b));
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = Registry::new();
        let id = register(&registry);
        registry.set_subscriptions(&id, devices(&["a"])).unwrap();

        assert!(registry.unregister(&id).is_some());
        assert!(registry.unregister(&id).is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn set_subscriptions_replaces() {
        let registry = Registry::new();
        let id = register(&registry);

        let first = registry.set_subscriptions(&id, devices(&["a"])).unwrap();
        assert_eq!(names(&first), vec!["a"]);

        let second = registry.set_subscriptions(&id, devices(&["b"])).unwrap();
        assert_eq!(names(&second), vec!["b"]);
        assert!(registry.subscribers_of(&device("a")).is_empty());
        assert_eq!(registry.subscribers_of(&device("b")), vec![id]);
        assert_eq!(registry.device_count(), 1);
        assert!(registry.is_consistent());
    }

    #[test]
    fn set_subscriptions_returns_sorted() {
        let registry = Registry::new();
        let id = register(&registry);
        let result = registry
            .set_subscriptions(&id, devices(&["zulu", "Alpha", "mike"]))
            .unwrap();
        assert_eq!(names(&result), vec!["alpha", "mike", "zulu"]);
    }

    #[test]
    fn set_subscriptions_unknown_connection() {
        let registry = Registry::new();
        let ghost = ConnectionId::new();
        let err = registry.set_subscriptions(&ghost, devices(&["a"])).unwrap_err();
        assert_eq!(err, RegistryError::UnknownConnection(ghost));
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn unsubscribe_removes_only_listed() {
        let registry = Registry::new();
        let id = register(&registry);
        registry.set_subscriptions(&id, devices(&["a", "b", "c"])).unwrap();

        let left = registry.unsubscribe(&id, &devices(&["b", "never"])).unwrap();
        assert_eq!(names(&left), vec!["a", "c"]);
        assert!(registry.subscribers_of(&device("b")).is_empty());
        assert!(registry.is_consistent());
    }

    #[test]
    fn shared_device_keeps_other_subscriber() {
        let registry = Registry::new();
        let a = register(&registry);
        let b = register(&registry);
        registry.set_subscriptions(&a, devices(&["mic"])).unwrap();
        registry.set_subscriptions(&b, devices(&["mic"])).unwrap();

        let _ = registry.unregister(&a);
        assert_eq!(registry.subscribers_of(&device("mic")), vec![b]);
        assert!(registry.is_consistent());
    }

    #[test]
    fn subscribers_of_is_a_snapshot() {
        let registry = Registry::new();
        let id = register(&registry);
        registry.set_subscriptions(&id, devices(&["mic"])).unwrap();

        let snapshot = registry.subscribers_of(&device("mic"));
        let _ = registry.unregister(&id);
        assert_eq!(snapshot, vec![id.clone()]);
        assert!(registry.channel(&id).is_none());
    }

    #[test]
    fn touch_unknown_connection() {
        let registry = Registry::new();
        assert!(!registry.touch(&ConnectionId::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle_clock() {
        let registry = Registry::new();
        let quiet = register(&registry);
        let chatty = register(&registry);
        let threshold = Duration::from_secs(30);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(registry.touch(&chatty));
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(registry.idle_connections(threshold), vec![quiet]);
    }

    #[test]
    fn concurrent_mutations_keep_index_consistent() {
        let registry = Arc::new(Registry::new());
        let pool = ["a", "b", "c", "d", "e"];

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let mut keep = None;
                    for round in 0..200usize {
                        let id = register(&registry);
                        let pick: Vec<&str> = pool
                            .iter()
                            .copied()
                            .enumerate()
                            .filter(|(i, _)| (i + round + worker) % 3 != 0)
                            .map(|(_, d)| d)
                            .collect();
                        registry.set_subscriptions(&id, devices(&pick)).unwrap();
                        registry
                            .unsubscribe(&id, &devices(&[pool[(round + worker) % pool.len()]]))
                            .unwrap();
                        if round % 2 == 0 {
                            let _ = registry.unregister(&id);
                        } else if let Some(prev) = keep.replace(id) {
                            let _ = registry.unregister(&prev);
                        }
                    }
                    keep
                })
            })
            .collect();

        let survivors: Vec<ConnectionId> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert!(registry.is_consistent());
        assert_eq!(registry.len(), survivors.len());

        for id in &survivors {
            let _ = registry.unregister(id);
        }
        assert!(registry.is_consistent());
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn close_all_empties_both_maps() {
        let registry = Registry::new();
        let (channel, _rx) = ConnectionChannel::bounded(8);
        let a = registry.register(channel.clone());
        let b = register(&registry);
        registry.set_subscriptions(&a, devices(&["x", "y"])).unwrap();
        registry.set_subscriptions(&b, devices(&["y"])).unwrap();

        assert_eq!(registry.close_all(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.device_count(), 0);
        assert!(channel.is_draining());
        assert!(!channel.is_closed());
        assert!(registry.is_consistent());
    }
}
