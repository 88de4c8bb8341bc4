//! Background reaper for expired locks, stale partial puts and
//! unreachable content.
//!
//! Lock expiry stays lazy for callers: every lock operation expires leases
//! itself before acting. The reaper only frees memory and storage that no
//! request would otherwise revisit.

use crate::processor::CellRequestProcessor;
use cellstore_metrics::metrics;
use cellstore_storage::StorageError;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// What one reaper pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub leases_expired: usize,
    pub partials_dropped: usize,
    pub files_evicted: usize,
    pub elements_reclaimed: usize,
}

/// One reaper pass over every tracked file and the content store.
pub async fn reap_once(processor: &CellRequestProcessor) -> Result<ReapReport, StorageError> {
    let mut report = ReapReport::default();
    let partial_ttl = processor.policy().default_timeout;

    for (url, file) in processor.files().all().await {
        let mut record = file.lock().await;
        let expired = record.lock.expire();
        let dropped = record.partials.expire(partial_ttl);
        if expired + dropped > 0 {
            tracing::debug!(%url, expired, dropped, "reaped file state");
        }
        report.leases_expired += expired;
        report.partials_dropped += dropped;
    }
    report.files_evicted = processor.files().evict_idle().await;

    report.elements_reclaimed = {
        let mut store = processor.store().write().await;
        let reclaimed = store.reclaim_unreachable()?;
        store.sync()?;
        reclaimed
    };

    let m = metrics();
    m.lock_expirations.inc_by(report.leases_expired as u64);
    m.elements_reclaimed.inc_by(report.elements_reclaimed as u64);
    m.open_files.set(processor.files().len().await as i64);
    Ok(report)
}

/// Spawn the periodic reaper. Returns a `JoinHandle` for the spawned task.
pub fn spawn_reaper(
    processor: Arc<CellRequestProcessor>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        tick.tick().await;
        loop {
            tick.tick().await;
            match reap_once(&processor).await {
                Ok(report) if report != ReapReport::default() => {
                    tracing::info!(?report, "reaper pass");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("reaper pass failed: {}", e),
            }
        }
    })
}
