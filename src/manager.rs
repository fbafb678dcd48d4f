//! Bucket Trim Manager
//!
//! Entry point for the replication pipeline: count bucket changes as datalog
//! entries are processed, and serve those counts to the gateway that runs the
//! trim process.

use std::sync::Arc;

use tracing::info;

use crate::config::TrimConfig;
use crate::coordinator::TrimCoordinator;
use crate::error::{Result, TrimError};
use crate::protocol::BucketCounter;
use crate::store::ObjectStore;
use crate::watcher::WatchState;

pub struct BucketTrimManager {
    coordinator: TrimCoordinator,
}

impl BucketTrimManager {
    pub fn new(store: Arc<dyn ObjectStore>, config: TrimConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| TrimError::InvalidConfig(errors.join("; ")))?;
        let coordinator = TrimCoordinator::new(store, config)?;
        Ok(Self { coordinator })
    }

    /// Start serving trim counters to peer gateways.
    pub async fn init(&self) -> Result<()> {
        let handle = self.coordinator.start().await?;
        info!(
            "Bucket trim manager serving {} (cookie {})",
            self.coordinator.config().control_object,
            handle
        );
        Ok(())
    }

    /// Count one datalog entry for `bucket`. Never touches the network.
    pub fn on_bucket_changed(&self, bucket: &str) {
        self.coordinator.record(bucket);
    }

    /// Merge the hottest buckets reported by every gateway in the zone.
    pub async fn collect_counters(&self, max_buckets: u16) -> Result<Vec<BucketCounter>> {
        self.coordinator.collect_counters(max_buckets).await
    }

    pub async fn watch_state(&self) -> WatchState {
        self.coordinator.watcher().state().await
    }

    pub fn coordinator(&self) -> &TrimCoordinator {
        &self.coordinator
    }

    /// Stop serving notifications. Safe whether or not `init` succeeded.
    pub async fn shutdown(&self) {
        self.coordinator.stop().await;
    }
}

impl Drop for BucketTrimManager {
    fn drop(&mut self) {
        self.coordinator.watcher().stop_in_background();
    }
}
