//! In-process watch/notify store
//!
//! A [`MemoryCluster`] holds the objects and watches; each gateway talks to it
//! through its own [`MemoryStore`] client, which gives acks a distinct
//! notifier id. Callbacks are held weakly: a watcher that is dropped without
//! unwatching simply stops receiving notifications.
//!
//! Fault injection (`disconnect`, `fail_next_watch`, `fail_next_unwatch`)
//! drives the reconnect paths in tests and the simulator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{NotifyReply, ObjectStore, WatchCallback, WatchHandle};
use crate::error::StoreError;

struct WatchEntry {
    object: String,
    callback: Weak<dyn WatchCallback>,
}

#[derive(Default)]
struct ClusterInner {
    objects: DashSet<String>,
    watches: DashMap<u64, WatchEntry>,
    /// Acks gathered per in-flight notify
    pending: DashMap<u64, Vec<NotifyReply>>,
    next_cookie: AtomicU64,
    next_notify_id: AtomicU64,
    next_client_id: AtomicU64,
    watch_failure: Mutex<Option<StoreError>>,
    unwatch_failure: Mutex<Option<StoreError>>,
}

/// Shared backing state for a set of [`MemoryStore`] clients
#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client with its own notifier id.
    pub fn client(&self) -> MemoryStore {
        let client_id = self.inner.next_client_id.fetch_add(1, Ordering::SeqCst) + 1;
        MemoryStore {
            cluster: self.clone(),
            client_id,
        }
    }

    pub fn object_exists(&self, name: &str) -> bool {
        self.inner.objects.contains(name)
    }

    /// Active watch handles on `name`, lowest cookie first.
    pub fn watchers(&self, name: &str) -> Vec<WatchHandle> {
        let mut handles: Vec<WatchHandle> = self
            .inner
            .watches
            .iter()
            .filter(|entry| entry.value().object == name)
            .map(|entry| WatchHandle::new(*entry.key()))
            .collect();
        handles.sort();
        handles
    }

    /// Drop the watch and report `NotConnected` to its callback.
    ///
    /// Returns false when no such watch is registered.
    pub async fn disconnect(&self, handle: WatchHandle) -> bool {
        let Some((cookie, entry)) = self.inner.watches.remove(&handle.cookie()) else {
            return false;
        };
        debug!("Disconnecting watch {} on {}", cookie, entry.object);
        if let Some(callback) = entry.callback.upgrade() {
            callback
                .handle_error(cookie, StoreError::NotConnected(cookie))
                .await;
        }
        true
    }

    /// Make the next `watch` call from any client fail with `err`.
    pub fn fail_next_watch(&self, err: StoreError) {
        *lock(&self.inner.watch_failure) = Some(err);
    }

    /// Make the next `unwatch` call from any client fail with `err`.
    pub fn fail_next_unwatch(&self, err: StoreError) {
        *lock(&self.inner.unwatch_failure) = Some(err);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One client connection to a [`MemoryCluster`]
#[derive(Clone)]
pub struct MemoryStore {
    cluster: MemoryCluster,
    client_id: u64,
}

impl MemoryStore {
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    fn inner(&self) -> &ClusterInner {
        &self.cluster.inner
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create(&self, name: &str, exclusive: bool) -> Result<(), StoreError> {
        let created = self.inner().objects.insert(name.to_string());
        if !created && exclusive {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        Ok(())
    }

    async fn watch(
        &self,
        name: &str,
        callback: Arc<dyn WatchCallback>,
    ) -> Result<WatchHandle, StoreError> {
        if let Some(err) = lock(&self.inner().watch_failure).take() {
            return Err(err);
        }
        if !self.inner().objects.contains(name) {
            return Err(StoreError::NotFound(name.to_string()));
        }

        let cookie = self.inner().next_cookie.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner().watches.insert(
            cookie,
            WatchEntry {
                object: name.to_string(),
                callback: Arc::downgrade(&callback),
            },
        );
        Ok(WatchHandle::new(cookie))
    }

    async fn unwatch(&self, handle: WatchHandle) -> Result<(), StoreError> {
        if let Some(err) = lock(&self.inner().unwatch_failure).take() {
            return Err(err);
        }
        match self.inner().watches.remove(&handle.cookie()) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotConnected(handle.cookie())),
        }
    }

    async fn notify_ack(
        &self,
        name: &str,
        notify_id: u64,
        cookie: u64,
        reply: Bytes,
    ) -> Result<(), StoreError> {
        match self.inner().pending.get_mut(&notify_id) {
            Some(mut replies) => {
                replies.push(NotifyReply {
                    notifier_id: self.client_id,
                    cookie,
                    payload: reply,
                });
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "notify {} on {}",
                notify_id, name
            ))),
        }
    }

    async fn notify(
        &self,
        name: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Vec<NotifyReply>, StoreError> {
        if !self.inner().objects.contains(name) {
            return Err(StoreError::NotFound(name.to_string()));
        }

        let notify_id = self.inner().next_notify_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner().pending.insert(notify_id, Vec::new());

        // Collect first so no map shard is locked while callbacks run
        let targets: Vec<(u64, Weak<dyn WatchCallback>)> = self
            .inner()
            .watches
            .iter()
            .filter(|entry| entry.value().object == name)
            .map(|entry| (*entry.key(), entry.value().callback.clone()))
            .collect();

        // Every watcher gets the notify at once; a stalled one only costs its own ack
        let mut deliveries = JoinSet::new();
        for (cookie, callback) in targets {
            let Some(callback) = callback.upgrade() else {
                continue;
            };
            let payload = payload.clone();
            let notifier_id = self.client_id;
            deliveries.spawn(async move {
                callback
                    .handle_notify(notify_id, cookie, notifier_id, payload)
                    .await;
            });
        }

        let deadline = Instant::now() + timeout;
        let all_acked = tokio::time::timeout_at(deadline, async {
            while deliveries.join_next().await.is_some() {}
        })
        .await;
        if all_acked.is_err() {
            warn!(
                "Notify {} on {} timed out with {} watchers still pending",
                notify_id,
                name,
                deliveries.len()
            );
            // late acks find no pending entry and are rejected
            deliveries.detach_all();
        }

        let replies = self
            .inner()
            .pending
            .remove(&notify_id)
            .map(|(_, replies)| replies)
            .unwrap_or_default();
        Ok(replies)
    }
}
