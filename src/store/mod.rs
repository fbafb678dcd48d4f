//! Object store interface
//!
//! The trim subsystem only needs a handful of primitives from the backing
//! store: exclusive object creation and watch/notify on a named object.
//! [`memory`] provides an in-process implementation shared by every gateway
//! of a simulated zone.

pub mod memory;

pub use memory::{MemoryCluster, MemoryStore};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;

/// Cookie identifying one registered watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(u64);

impl WatchHandle {
    pub fn new(cookie: u64) -> Self {
        Self(cookie)
    }

    pub fn cookie(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One watcher's acknowledgement of a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyReply {
    /// Store client that sent the ack
    pub notifier_id: u64,
    /// Watch the ack was sent for
    pub cookie: u64,
    pub payload: Bytes,
}

/// Receiver side of a watch
///
/// The store calls at most one method at a time per watch.
#[async_trait]
pub trait WatchCallback: Send + Sync {
    /// A notification arrived for the watch identified by `cookie`. The
    /// receiver answers through [`ObjectStore::notify_ack`].
    async fn handle_notify(&self, notify_id: u64, cookie: u64, notifier_id: u64, payload: Bytes);

    /// The watch identified by `cookie` failed; `NotConnected` means it was
    /// dropped by the store and has to be re-established.
    async fn handle_error(&self, cookie: u64, err: StoreError);
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create `name`; with `exclusive` an existing object is `AlreadyExists`.
    async fn create(&self, name: &str, exclusive: bool) -> Result<(), StoreError>;

    /// Register `callback` for notifications on `name`.
    async fn watch(
        &self,
        name: &str,
        callback: Arc<dyn WatchCallback>,
    ) -> Result<WatchHandle, StoreError>;

    async fn unwatch(&self, handle: WatchHandle) -> Result<(), StoreError>;

    /// Answer notification `notify_id` received on watch `cookie`.
    async fn notify_ack(
        &self,
        name: &str,
        notify_id: u64,
        cookie: u64,
        reply: Bytes,
    ) -> Result<(), StoreError>;

    /// Send `payload` to every watcher of `name` and gather their acks.
    async fn notify(
        &self,
        name: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Vec<NotifyReply>, StoreError>;
}
