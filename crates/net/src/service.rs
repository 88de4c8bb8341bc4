//! Transport-facing service trait.

use async_trait::async_trait;
use cellstore_cell::{BatchRequest, BatchResponse, CellRequestProcessor};
use serde::{Deserialize, Serialize};

/// Counters reported by `GET /stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub uptime_secs: u64,
    /// Files with in-memory lock or partial put state.
    pub open_files: usize,
    pub stored_elements: usize,
    pub payload_bytes: u64,
}

/// Executes batches on behalf of the transport.
///
/// Batch processing never fails as a whole: every error is carried inside
/// the returned `BatchResponse`.
#[async_trait]
pub trait CellService: Send + Sync + 'static {
    async fn process(&self, batch: BatchRequest) -> BatchResponse;

    /// Storage and registry counters; `uptime_secs` is filled by the server.
    async fn stats(&self) -> ServiceStats;
}

#[async_trait]
impl CellService for CellRequestProcessor {
    async fn process(&self, batch: BatchRequest) -> BatchResponse {
        CellRequestProcessor::process(self, batch).await
    }

    async fn stats(&self) -> ServiceStats {
        let open_files = self.files().len().await;
        let store = self.store().read().await;
        ServiceStats {
            uptime_secs: 0,
            open_files,
            stored_elements: store.element_count(),
            payload_bytes: store.payload_bytes(),
        }
    }
}
