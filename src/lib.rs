pub mod aggregator;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod counter;
pub mod error;
pub mod handler;
pub mod logging;
pub mod manager;
pub mod protocol;
pub mod simulate;
pub mod store;
pub mod watcher;

pub use aggregator::ChangeAggregator;
pub use config::{LoggingConfig, TrimConfig, MAX_COUNTER_SIZE};
pub use coordinator::{TrimCoordinator, TrimCounterServer, HARD_CEILING};
pub use counter::BoundedKeyCounter;
pub use error::{ProtocolError, Result, StoreError, TrimError};
pub use manager::BucketTrimManager;
pub use protocol::{BucketCounter, NotifyEnvelope, TrimNotifyType, TrimRequest, TrimResponse};
pub use store::{MemoryCluster, MemoryStore, NotifyReply, ObjectStore, WatchCallback, WatchHandle};
pub use watcher::{TrimWatcher, WatchState};
