//! In-process zone simulation
//!
//! Spins up several gateways over one [`MemoryCluster`], spreads bucket
//! changes across them the way datalog shards would be, and collects the
//! zone-wide hottest buckets from the first gateway.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::TrimConfig;
use crate::error::{Result, TrimError};
use crate::manager::BucketTrimManager;
use crate::protocol::BucketCounter;
use crate::store::MemoryCluster;

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub gateways: usize,
    pub top: u16,
    /// Disconnect every watch once before collecting
    pub disconnect: bool,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            gateways: 3,
            top: 16,
            disconnect: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub changes: usize,
    pub gateways: usize,
    /// Gateways still watching when counters were collected
    pub watching: usize,
    pub counters: Vec<BucketCounter>,
}

pub async fn run_simulation<I, S>(
    config: TrimConfig,
    options: &SimulationOptions,
    changes: I,
) -> Result<SimulationReport>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    if options.gateways == 0 {
        return Err(TrimError::InvalidConfig(
            "simulation needs at least one gateway".to_string(),
        ));
    }

    let cluster = MemoryCluster::new();
    let mut managers = Vec::with_capacity(options.gateways);
    for _ in 0..options.gateways {
        let manager = BucketTrimManager::new(Arc::new(cluster.client()), config.clone())?;
        manager.init().await?;
        managers.push(manager);
    }

    // round-robin stands in for shard ownership
    let mut recorded = 0;
    for (i, bucket) in changes.into_iter().enumerate() {
        let bucket = bucket.as_ref().trim();
        if bucket.is_empty() {
            continue;
        }
        managers[i % managers.len()].on_bucket_changed(bucket);
        recorded += 1;
    }
    info!(
        "Recorded {} bucket changes across {} gateways",
        recorded,
        managers.len()
    );

    if options.disconnect {
        for handle in cluster.watchers(&config.control_object) {
            if !cluster.disconnect(handle).await {
                warn!("Watch {} vanished before disconnect", handle);
            }
        }
    }

    let mut watching = 0;
    for manager in &managers {
        if manager.watch_state().await.is_watching() {
            watching += 1;
        }
    }

    let counters = managers[0].collect_counters(options.top).await?;

    for manager in &managers {
        manager.shutdown().await;
    }

    Ok(SimulationReport {
        changes: recorded,
        gateways: managers.len(),
        watching,
        counters,
    })
}
