//! Watcher for bucket trim notifications
//!
//! Keeps a watch registered on the zone's trim control object and answers
//! peer notifications through the handler table. A watch reported as
//! disconnected is re-established once; if that fails the watcher parks in
//! [`WatchState::Error`] until it is stopped and started again.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

use crate::coordinator::TrimCounterServer;
use crate::error::{Result, StoreError, TrimError};
use crate::handler::{handler_table, NotifyHandler};
use crate::protocol::{NotifyEnvelope, ProtocolResult};
use crate::store::{ObjectStore, WatchCallback, WatchHandle};

/// Watch lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// No watch registered
    Unwatched,
    /// Watch registered under this handle
    Watching(WatchHandle),
    /// Establishing or restarting the watch failed
    Error,
}

impl WatchState {
    pub fn handle(&self) -> Option<WatchHandle> {
        match self {
            WatchState::Watching(handle) => Some(*handle),
            _ => None,
        }
    }

    pub fn is_watching(&self) -> bool {
        matches!(self, WatchState::Watching(_))
    }
}

impl fmt::Display for WatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchState::Unwatched => write!(f, "unwatched"),
            WatchState::Watching(handle) => write!(f, "watching({})", handle),
            WatchState::Error => write!(f, "error"),
        }
    }
}

struct WatcherInner {
    store: Arc<dyn ObjectStore>,
    object: String,
    handlers: BTreeMap<u8, NotifyHandler>,
    /// Serializes deliveries, reconnects and teardown
    state: Mutex<WatchState>,
    span: Span,
    me: Weak<WatcherInner>,
}

/// Watch/notify endpoint serving trim counter queries
#[derive(Clone)]
pub struct TrimWatcher {
    inner: Arc<WatcherInner>,
}

impl TrimWatcher {
    pub fn new(store: Arc<dyn ObjectStore>, object: String, server: TrimCounterServer) -> Self {
        let span = info_span!("trim", object = %object);
        Self::with_span(store, object, server, span)
    }

    /// Like [`TrimWatcher::new`], logging under the caller's span.
    pub fn with_span(
        store: Arc<dyn ObjectStore>,
        object: String,
        server: TrimCounterServer,
        span: Span,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| WatcherInner {
            store,
            object,
            handlers: handler_table(server),
            state: Mutex::new(WatchState::Unwatched),
            span,
            me: me.clone(),
        });
        Self { inner }
    }

    pub fn object(&self) -> &str {
        &self.inner.object
    }

    pub async fn state(&self) -> WatchState {
        *self.inner.state.lock().await
    }

    pub async fn handle(&self) -> Option<WatchHandle> {
        self.state().await.handle()
    }

    /// Register the watch, creating the control object if it doesn't exist.
    pub async fn start(&self) -> Result<WatchHandle> {
        let inner = &self.inner;
        async move {
            let mut state = inner.state.lock().await;
            if *state != WatchState::Unwatched {
                return Err(TrimError::InvalidState(format!(
                    "cannot start watch on {} while {}",
                    inner.object, *state
                )));
            }

            match inner.establish().await {
                Ok(handle) => {
                    *state = WatchState::Watching(handle);
                    info!("Watching {} (cookie {})", inner.object, handle);
                    Ok(handle)
                }
                Err(e) => {
                    *state = WatchState::Error;
                    error!("Failed to watch {} with {}", inner.object, e);
                    Err(TrimError::Subscription(e))
                }
            }
        }
        .instrument(inner.span.clone())
        .await
    }

    /// Drop the watch. Safe to call in any state and more than once.
    pub async fn stop(&self) {
        let inner = &self.inner;
        async move {
            let mut state = inner.state.lock().await;
            if let WatchState::Watching(handle) = *state {
                if let Err(e) = inner.store.unwatch(handle).await {
                    debug!("Unwatch of {} on stop failed: {}", handle, e);
                }
            }
            if *state != WatchState::Unwatched {
                info!("Stopped watching {}", inner.object);
            }
            *state = WatchState::Unwatched;
        }
        .instrument(inner.span.clone())
        .await
    }

    /// Best-effort stop for synchronous teardown paths.
    ///
    /// Does nothing when the watcher is already known to be unwatched or no
    /// tokio runtime is available.
    pub(crate) fn stop_in_background(&self) {
        if let Ok(state) = self.inner.state.try_lock() {
            if *state == WatchState::Unwatched {
                return;
            }
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let watcher = self.clone();
                runtime.spawn(async move { watcher.stop().await });
            }
            Err(_) => {
                let _enter = self.inner.span.enter();
                warn!(
                    "No runtime to stop watch on {}; leaving it to the store",
                    self.inner.object
                );
            }
        }
    }

    #[cfg(test)]
    fn callback(&self) -> Arc<dyn WatchCallback> {
        self.inner.clone()
    }
}

impl WatcherInner {
    fn callback(&self) -> Option<Arc<dyn WatchCallback>> {
        self.me
            .upgrade()
            .map(|inner| inner as Arc<dyn WatchCallback>)
    }

    async fn watch_once(&self) -> std::result::Result<WatchHandle, StoreError> {
        let callback = self
            .callback()
            .ok_or_else(|| StoreError::Other("watcher dropped".to_string()))?;
        self.store.watch(&self.object, callback).await
    }

    async fn establish(&self) -> std::result::Result<WatchHandle, StoreError> {
        match self.watch_once().await {
            Err(StoreError::NotFound(_)) => {
                debug!("{} does not exist, creating it", self.object);
                match self.store.create(&self.object, true).await {
                    Ok(()) | Err(StoreError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e),
                }
                self.watch_once().await
            }
            other => other,
        }
    }

    /// Replace a disconnected watch. Leaves `Error` behind on failure.
    async fn restart(&self, state: &mut WatchState, old: WatchHandle) {
        match self.store.unwatch(old).await {
            Ok(()) => {}
            // the store already tore the watch down when it reported the disconnect
            Err(StoreError::NotConnected(_)) => {
                debug!("Watch {} on {} was already gone", old, self.object);
            }
            Err(e) => error!("Failed to unwatch on {} with {}", self.object, e),
        }
        match self.watch_once().await {
            Ok(handle) => {
                info!(
                    "Restarted watch on {} (cookie {} -> {})",
                    self.object, old, handle
                );
                *state = WatchState::Watching(handle);
            }
            Err(e) => {
                error!("Failed to restart watch on {} with {}", self.object, e);
                *state = WatchState::Error;
            }
        }
    }

    /// Decode the envelope and run its handler; the reply is empty whenever
    /// that fails or no handler matches.
    fn dispatch(&self, mut payload: Bytes, notifier_id: u64) -> Bytes {
        let mut reply = BytesMut::new();
        if let Err(e) = self.try_dispatch(&mut payload, &mut reply) {
            error!(
                "Failed to decode notification from {}: {}",
                notifier_id, e
            );
            reply.clear();
        }
        reply.freeze()
    }

    fn try_dispatch(&self, payload: &mut Bytes, reply: &mut BytesMut) -> ProtocolResult<()> {
        let mut envelope = NotifyEnvelope::decode(payload)?;
        match self.handlers.get(&envelope.notify_type) {
            Some(handler) => handler.handle(&mut envelope.payload, reply),
            None => {
                error!("no handler for notify type {}", envelope.notify_type);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl WatchCallback for WatcherInner {
    async fn handle_notify(&self, notify_id: u64, cookie: u64, notifier_id: u64, payload: Bytes) {
        async move {
            let state = self.state.lock().await;
            match *state {
                WatchState::Watching(handle) if handle.cookie() == cookie => {}
                _ => {
                    trace!("Dropping notify {} for stale cookie {}", notify_id, cookie);
                    return;
                }
            }

            let reply = self.dispatch(payload, notifier_id);
            if let Err(e) = self
                .store
                .notify_ack(&self.object, notify_id, cookie, reply)
                .await
            {
                warn!("Failed to ack notify {} on {}: {}", notify_id, self.object, e);
            }
        }
        .instrument(self.span.clone())
        .await
    }

    async fn handle_error(&self, cookie: u64, err: StoreError) {
        async move {
            let mut state = self.state.lock().await;
            let current = match *state {
                WatchState::Watching(handle) if handle.cookie() == cookie => handle,
                _ => return,
            };

            match err {
                StoreError::NotConnected(_) => {
                    info!("Disconnected watch on {}", self.object);
                    self.restart(&mut *state, current).await;
                }
                other => warn!("Watch error on {}: {}", self.object, other),
            }
        }
        .instrument(self.span.clone())
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ChangeAggregator;
    use crate::protocol::{TrimNotifyType, TrimRequest, TrimResponse};
    use crate::store::{MemoryCluster, MockObjectStore};
    use mockall::Sequence;
    use std::time::Duration;

    const OBJECT: &str = "bilog.trim";

    fn server() -> (Arc<ChangeAggregator>, TrimCounterServer) {
        let aggregator = Arc::new(ChangeAggregator::new(64).unwrap());
        let server = TrimCounterServer::new(Arc::clone(&aggregator));
        (aggregator, server)
    }

    fn memory_watcher(cluster: &MemoryCluster) -> (Arc<ChangeAggregator>, TrimWatcher) {
        let (aggregator, server) = server();
        let watcher = TrimWatcher::new(Arc::new(cluster.client()), OBJECT.to_string(), server);
        (aggregator, watcher)
    }

    fn trim_request(max_buckets: u16) -> Bytes {
        NotifyEnvelope::new(
            TrimNotifyType::TrimCounters,
            TrimRequest { max_buckets }.to_bytes(),
        )
        .to_bytes()
    }

    #[tokio::test]
    async fn test_start_creates_missing_object() {
        let cluster = MemoryCluster::new();
        let (_, watcher) = memory_watcher(&cluster);
        assert!(!cluster.object_exists(OBJECT));

        let handle = watcher.start().await.unwrap();

        assert!(cluster.object_exists(OBJECT));
        assert_eq!(watcher.state().await, WatchState::Watching(handle));
        assert_eq!(cluster.watchers(OBJECT), vec![handle]);
    }

    #[tokio::test]
    async fn test_start_tolerates_concurrent_create() {
        let mut store = MockObjectStore::new();
        let mut seq = Sequence::new();
        store
            .expect_watch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, _| Err(StoreError::NotFound(name.to_string())));
        store
            .expect_create()
            .withf(|name, exclusive| name == OBJECT && *exclusive)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, _| Err(StoreError::AlreadyExists(name.to_string())));
        store
            .expect_watch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(WatchHandle::new(42)));

        let (_, server) = server();
        let watcher = TrimWatcher::new(Arc::new(store), OBJECT.to_string(), server);

        assert_eq!(watcher.start().await.unwrap(), WatchHandle::new(42));
    }

    #[tokio::test]
    async fn test_start_surfaces_permission_error() {
        let mut store = MockObjectStore::new();
        store
            .expect_watch()
            .times(1)
            .returning(|name, _| Err(StoreError::PermissionDenied(name.to_string())));
        store.expect_create().times(0);

        let (_, server) = server();
        let watcher = TrimWatcher::new(Arc::new(store), OBJECT.to_string(), server);

        let err = watcher.start().await.unwrap_err();
        assert!(matches!(
            err,
            TrimError::Subscription(StoreError::PermissionDenied(_))
        ));
        assert_eq!(watcher.state().await, WatchState::Error);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let cluster = MemoryCluster::new();
        let (_, watcher) = memory_watcher(&cluster);
        watcher.start().await.unwrap();

        let err = watcher.start().await.unwrap_err();
        assert!(matches!(err, TrimError::InvalidState(_)));
        assert_eq!(cluster.watchers(OBJECT).len(), 1);
    }

    #[tokio::test]
    async fn test_stale_cookie_dropped_without_ack() {
        let mut store = MockObjectStore::new();
        store
            .expect_watch()
            .times(1)
            .returning(|_, _| Ok(WatchHandle::new(7)));
        store.expect_notify_ack().times(0);

        let (aggregator, server) = server();
        aggregator.record("bucket1:inst1");
        let watcher = TrimWatcher::new(Arc::new(store), OBJECT.to_string(), server);
        watcher.start().await.unwrap();

        watcher
            .callback()
            .handle_notify(1, 8, 99, trim_request(10))
            .await;

        assert_eq!(watcher.state().await, WatchState::Watching(WatchHandle::new(7)));
        assert_eq!(aggregator.snapshot(10), vec![("bucket1:inst1".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_unknown_type_gets_empty_ack() {
        let mut store = MockObjectStore::new();
        store
            .expect_watch()
            .returning(|_, _| Ok(WatchHandle::new(3)));
        store
            .expect_notify_ack()
            .withf(|name, notify_id, cookie, reply| {
                name == OBJECT && *notify_id == 5 && *cookie == 3 && reply.is_empty()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let (_, server) = server();
        let watcher = TrimWatcher::new(Arc::new(store), OBJECT.to_string(), server);
        watcher.start().await.unwrap();

        let envelope = NotifyEnvelope {
            notify_type: 200,
            payload: Bytes::from_static(b"whatever"),
        };
        watcher
            .callback()
            .handle_notify(5, 3, 1, envelope.to_bytes())
            .await;
    }

    #[tokio::test]
    async fn test_malformed_payloads_get_empty_ack() {
        let mut store = MockObjectStore::new();
        store
            .expect_watch()
            .returning(|_, _| Ok(WatchHandle::new(3)));
        store
            .expect_notify_ack()
            .withf(|_, _, _, reply| reply.is_empty())
            .times(3)
            .returning(|_, _, _, _| Ok(()));

        let (_, server) = server();
        let watcher = TrimWatcher::new(Arc::new(store), OBJECT.to_string(), server);
        watcher.start().await.unwrap();

        let callback = watcher.callback();
        // empty envelope
        callback.handle_notify(1, 3, 1, Bytes::new()).await;
        // truncated request
        callback
            .handle_notify(2, 3, 1, Bytes::from_static(&[0, 1, 1, 9]))
            .await;
        // request from the future
        callback
            .handle_notify(3, 3, 1, Bytes::from_static(&[0, 3, 3, 2, 0, 0, 0, 1, 0]))
            .await;
    }

    #[tokio::test]
    async fn test_failed_ack_is_not_fatal() {
        let mut store = MockObjectStore::new();
        store
            .expect_watch()
            .returning(|_, _| Ok(WatchHandle::new(3)));
        store
            .expect_notify_ack()
            .times(1)
            .returning(|_, _, _, _| Err(StoreError::Other("timed out".to_string())));

        let (_, server) = server();
        let watcher = TrimWatcher::new(Arc::new(store), OBJECT.to_string(), server);
        watcher.start().await.unwrap();

        watcher.callback().handle_notify(1, 3, 1, trim_request(1)).await;
        assert!(watcher.state().await.is_watching());
    }

    #[tokio::test]
    async fn test_disconnect_restarts_with_new_handle() {
        let cluster = MemoryCluster::new();
        let (aggregator, watcher) = memory_watcher(&cluster);
        let first = watcher.start().await.unwrap();
        aggregator.record("bucket1:inst1");

        assert!(cluster.disconnect(first).await);

        let second = watcher.handle().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(cluster.watchers(OBJECT), vec![second]);

        let replies = cluster
            .client()
            .notify(OBJECT, trim_request(10), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].cookie, second.cookie());
        let response = TrimResponse::decode(&mut replies[0].payload.clone()).unwrap();
        assert_eq!(response.bucket_counters.len(), 1);
        assert_eq!(response.bucket_counters[0].count, 1);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_reconnect_logs_no_error_for_vanished_watch() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let cluster = MemoryCluster::new();
        let (_, watcher) = memory_watcher(&cluster);
        let first = watcher.start().await.unwrap();
        assert!(cluster.disconnect(first).await);
        assert!(watcher.state().await.is_watching());

        let out = logs.contents();
        assert!(out.contains("was already gone"), "{out}");
        assert!(out.contains("Restarted watch"), "{out}");
        assert!(!out.contains("ERROR"), "{out}");
    }

    #[tokio::test]
    async fn test_restart_survives_unwatch_failure() {
        let cluster = MemoryCluster::new();
        let (_, watcher) = memory_watcher(&cluster);
        let first = watcher.start().await.unwrap();

        cluster.fail_next_unwatch(StoreError::Other("osd busy".to_string()));
        assert!(cluster.disconnect(first).await);

        let second = watcher.handle().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(cluster.watchers(OBJECT), vec![second]);
    }

    #[tokio::test]
    async fn test_failed_restart_enters_error() {
        let cluster = MemoryCluster::new();
        let (_, watcher) = memory_watcher(&cluster);
        let handle = watcher.start().await.unwrap();

        cluster.fail_next_watch(StoreError::Other("osd down".to_string()));
        assert!(cluster.disconnect(handle).await);

        assert_eq!(watcher.state().await, WatchState::Error);
        assert!(cluster.watchers(OBJECT).is_empty());

        // a notify now reaches nobody rather than failing
        let replies = cluster
            .client()
            .notify(OBJECT, trim_request(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(replies.is_empty());

        // only an explicit stop/start recovers
        assert!(watcher.start().await.is_err());
        watcher.stop().await;
        assert!(watcher.start().await.is_ok());
    }

    #[tokio::test]
    async fn test_error_for_stale_cookie_ignored() {
        let cluster = MemoryCluster::new();
        let (_, watcher) = memory_watcher(&cluster);
        let handle = watcher.start().await.unwrap();

        watcher
            .callback()
            .handle_error(handle.cookie() + 100, StoreError::NotConnected(0))
            .await;
        watcher
            .callback()
            .handle_error(handle.cookie(), StoreError::Other("slow".to_string()))
            .await;

        assert_eq!(watcher.state().await, WatchState::Watching(handle));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let cluster = MemoryCluster::new();
        let (_, watcher) = memory_watcher(&cluster);

        watcher.stop().await;
        watcher.start().await.unwrap();
        cluster.fail_next_unwatch(StoreError::Other("busy".to_string()));
        watcher.stop().await;
        watcher.stop().await;

        assert_eq!(watcher.state().await, WatchState::Unwatched);
    }
}
