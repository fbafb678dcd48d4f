//! Trim Coordinator
//!
//! Bridges the replication pipeline, which records one change per observed
//! datalog entry, and peer gateways, which query the hottest buckets over the
//! watch/notify api. Also gathers counters from every gateway in the zone when
//! this gateway runs the trim process.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::aggregator::ChangeAggregator;
use crate::config::TrimConfig;
use crate::error::Result;
use crate::protocol::{BucketCounter, NotifyEnvelope, TrimNotifyType, TrimRequest, TrimResponse};
use crate::store::{NotifyReply, ObjectStore, WatchHandle};
use crate::watcher::TrimWatcher;

/// Most counters any query returns, whatever the peer asked for
pub const HARD_CEILING: usize = 128;

/// Query side of the change counter, handed to the notify handlers
#[derive(Debug, Clone)]
pub struct TrimCounterServer {
    aggregator: Arc<ChangeAggregator>,
}

impl TrimCounterServer {
    pub fn new(aggregator: Arc<ChangeAggregator>) -> Self {
        Self { aggregator }
    }

    /// Up to `min(count, HARD_CEILING)` hottest buckets, highest count first.
    pub fn get_bucket_counters(&self, count: usize) -> Vec<BucketCounter> {
        let count = count.min(HARD_CEILING);
        let counters: Vec<BucketCounter> = self
            .aggregator
            .snapshot(count)
            .into_iter()
            .map(|(bucket, count)| BucketCounter::new(bucket, count))
            .collect();
        debug!(
            "get_bucket_counters: [{}]",
            counters
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        counters
    }
}

pub struct TrimCoordinator {
    config: TrimConfig,
    store: Arc<dyn ObjectStore>,
    /// count frequency of bucket instance entries in the data changes log
    aggregator: Arc<ChangeAggregator>,
    server: TrimCounterServer,
    /// serve the bucket trim watch/notify api
    watcher: TrimWatcher,
}

impl TrimCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, config: TrimConfig) -> Result<Self> {
        let aggregator = Arc::new(ChangeAggregator::new(config.counter_size)?);
        let server = TrimCounterServer::new(Arc::clone(&aggregator));
        let watcher = TrimWatcher::new(
            Arc::clone(&store),
            config.control_object.clone(),
            server.clone(),
        );
        Ok(Self {
            config,
            store,
            aggregator,
            server,
            watcher,
        })
    }

    pub fn config(&self) -> &TrimConfig {
        &self.config
    }

    pub fn watcher(&self) -> &TrimWatcher {
        &self.watcher
    }

    /// Count one datalog entry for `bucket`.
    pub fn record(&self, bucket: &str) {
        self.aggregator.record(bucket);
    }

    /// This gateway's hottest buckets, at most `min(requested, HARD_CEILING)`.
    pub fn query(&self, requested: usize) -> Vec<BucketCounter> {
        self.server.get_bucket_counters(requested)
    }

    /// Number of distinct buckets currently tracked
    pub fn tracked_buckets(&self) -> usize {
        self.aggregator.len()
    }

    pub async fn start(&self) -> Result<WatchHandle> {
        self.watcher.start().await
    }

    pub async fn stop(&self) {
        self.watcher.stop().await
    }

    /// Ask every gateway watching the control object for its hottest buckets
    /// and merge the answers.
    ///
    /// Replies that are empty or fail to decode are skipped; counts for the
    /// same bucket from different gateways are summed.
    pub async fn collect_counters(&self, max_buckets: u16) -> Result<Vec<BucketCounter>> {
        let request = TrimRequest { max_buckets };
        let payload =
            NotifyEnvelope::new(TrimNotifyType::TrimCounters, request.to_bytes()).to_bytes();

        let replies = self
            .store
            .notify(
                &self.config.control_object,
                payload,
                self.config.notify_timeout(),
            )
            .await?;
        let responders = replies.len();

        let merged = merge_replies(replies, max_buckets as usize);
        info!(
            "Collected {} bucket counters from {} gateways",
            merged.len(),
            responders
        );
        Ok(merged)
    }
}

fn merge_replies(replies: Vec<NotifyReply>, limit: usize) -> Vec<BucketCounter> {
    let mut totals: HashMap<String, i32> = HashMap::new();
    for reply in replies {
        if reply.payload.is_empty() {
            debug!("Empty trim counter reply from {}", reply.notifier_id);
            continue;
        }
        let mut payload = reply.payload;
        match TrimResponse::decode(&mut payload) {
            Ok(response) => {
                for counter in response.bucket_counters {
                    let total = totals.entry(counter.bucket).or_insert(0);
                    *total = total.saturating_add(counter.count.max(0));
                }
            }
            Err(e) => warn!(
                "Failed to decode trim counters from {}: {}",
                reply.notifier_id, e
            ),
        }
    }

    let mut merged: Vec<BucketCounter> = totals
        .into_iter()
        .map(|(bucket, count)| BucketCounter::new(bucket, count))
        .collect();
    merged.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.bucket.cmp(&b.bucket)));
    merged.truncate(limit.min(HARD_CEILING));
    merged
}
