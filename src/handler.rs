//! Notification handlers registered on the trim watcher

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::coordinator::TrimCounterServer;
use crate::protocol::{ProtocolResult, TrimNotifyType, TrimRequest, TrimResponse};

/// Handler for one notification type
#[derive(Debug, Clone)]
pub enum NotifyHandler {
    /// Answer a [`TrimRequest`] with this gateway's hottest buckets
    TrimCounters(TrimCounterServer),
}

impl NotifyHandler {
    /// Decode the request in `input` and append the reply to `output`.
    pub fn handle(&self, input: &mut Bytes, output: &mut BytesMut) -> ProtocolResult<()> {
        match self {
            NotifyHandler::TrimCounters(server) => {
                let request = TrimRequest::decode(input)?;
                let counters = server.get_bucket_counters(request.max_buckets as usize);
                debug!(
                    requested = request.max_buckets,
                    returned = counters.len(),
                    "Answering trim counter request"
                );
                TrimResponse::new(counters).encode(output);
                Ok(())
            }
        }
    }
}

/// Handler table keyed by notification type discriminant
pub fn handler_table(server: TrimCounterServer) -> BTreeMap<u8, NotifyHandler> {
    let mut handlers = BTreeMap::new();
    handlers.insert(
        TrimNotifyType::TrimCounters.as_u8(),
        NotifyHandler::TrimCounters(server),
    );
    handlers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ChangeAggregator;
    use crate::error::ProtocolError;
    use std::sync::Arc;

    fn server_with(counts: &[(&str, usize)]) -> TrimCounterServer {
        let aggregator = Arc::new(ChangeAggregator::new(512).unwrap());
        for (bucket, hits) in counts {
            for _ in 0..*hits {
                aggregator.record(bucket);
            }
        }
        TrimCounterServer::new(aggregator)
    }

    #[test]
    fn test_table_registers_trim_counters() {
        let table = handler_table(server_with(&[]));
        assert_eq!(table.len(), 1);
        assert!(matches!(table.get(&0), Some(NotifyHandler::TrimCounters(_))));
        assert!(table.get(&1).is_none());
    }

    #[test]
    fn test_handler_clamps_request() {
        let owned: Vec<(String, usize)> = (0..200).map(|i| (format!("b{:03}", i), 1)).collect();
        let counts: Vec<(&str, usize)> = owned.iter().map(|(b, n)| (b.as_str(), *n)).collect();
        let handler = NotifyHandler::TrimCounters(server_with(&counts));

        let mut input = TrimRequest { max_buckets: 1_000 }.to_bytes();
        let mut output = BytesMut::new();
        handler.handle(&mut input, &mut output).unwrap();

        let response = TrimResponse::decode(&mut output.freeze()).unwrap();
        assert_eq!(response.bucket_counters.len(), 128);
    }

    #[test]
    fn test_handler_rejects_garbage_without_output() {
        let handler = NotifyHandler::TrimCounters(server_with(&[("b", 1)]));
        let mut input = Bytes::from_static(&[9, 9, 0, 0, 0, 0]);
        let mut output = BytesMut::new();

        let err = handler.handle(&mut input, &mut output).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion { compat: 9, .. }));
        assert!(output.is_empty());
    }
}
