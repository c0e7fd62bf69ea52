use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::delivery::DeliveryEngine;
use crate::metrics::report_batch_recovered;
use crate::store::{PersistedBatch, StorageBackend};
use crate::time::TimeSource;

/// One recovery pass over every backend's persisted batch, run at startup.
///
/// Expired records and records that no longer parse are deleted. A batch
/// that fails delivery again is left in place with its original
/// `created_at`, so its expiry clock keeps running across restarts.
/// Returns how many batches were delivered.
pub async fn run(
    engines: &[Arc<DeliveryEngine>],
    store: &Arc<dyn StorageBackend>,
    clock: &Arc<dyn TimeSource>,
    ttl: Duration,
    user_id: Option<&str>,
) -> usize {
    let mut recovered = 0;

    for engine in engines {
        let key = engine.storage_key(user_id);
        let raw = match store.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                warn!(backend = engine.backend_name(), "could not read persisted batch: {e}");
                continue;
            }
        };

        let record: PersistedBatch = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    backend = engine.backend_name(),
                    key, "deleting corrupted persisted batch: {e}"
                );
                if let Err(remove_err) = store.remove(&key) {
                    warn!(key, "could not delete corrupted record: {remove_err}");
                }
                continue;
            }
        };

        if record.is_expired(clock.now(), ttl) {
            debug!(
                backend = engine.backend_name(),
                created_at = %record.created_at,
                "discarding expired persisted batch"
            );
            if let Err(remove_err) = store.remove(&key) {
                warn!(key, "could not delete expired record: {remove_err}");
            }
            continue;
        }

        let events = record.events.len();
        let batch = record.into_batch(clock.now());
        if engine.deliver(&batch, false).await {
            if let Err(remove_err) = store.remove(&key) {
                warn!(key, "recovered batch but could not delete its record: {remove_err}");
            }
            debug!(
                backend = engine.backend_name(),
                events, "recovered persisted batch"
            );
            report_batch_recovered(engine.backend_name());
            recovered += 1;
        }
    }

    recovered
}
