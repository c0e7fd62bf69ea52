use std::sync::Arc;

use http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::api::{DeliveryError, TransportError};
use crate::config::{BackendConfig, BackendKind};
use crate::event::Batch;
use crate::metrics::{
    report_batch_failed, report_batch_persisted, report_batch_sent, report_delivery_retry,
};
use crate::retry::RetryPolicy;
use crate::store::{PersistedBatch, StorageBackend};
use crate::time::TimeSource;
use crate::transport::Transport;

/// Callbacks fired after each batch reaches a terminal outcome for one
/// backend. Runs on the delivery task; keep implementations quick.
pub trait DeliveryObserver: Send + Sync {
    fn on_success(&self, _backend: &str, _batch: &Batch) {}
    fn on_failure(&self, _backend: &str, _batch: &Batch, _error: &DeliveryError) {}
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// Owns delivery to a single backend: batch transform, serialization, send,
/// retry with backoff, and persistence of batches that exhaust their
/// attempts. Backends never block each other; the pipeline runs one engine
/// per configured backend.
pub struct DeliveryEngine {
    backend: BackendConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn StorageBackend>,
    retry: RetryPolicy,
    clock: Arc<dyn TimeSource>,
    namespace: String,
    cancel: CancellationToken,
}

impl DeliveryEngine {
    pub fn new(
        backend: BackendConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn StorageBackend>,
        retry: RetryPolicy,
        clock: Arc<dyn TimeSource>,
        namespace: String,
        cancel: CancellationToken,
    ) -> Self {
        DeliveryEngine {
            backend,
            transport,
            store,
            retry,
            clock,
            namespace,
            cancel,
        }
    }

    pub fn backend_name(&self) -> &str {
        &self.backend.name
    }

    pub(crate) fn storage_key(&self, user_id: Option<&str>) -> String {
        PersistedBatch::storage_key(&self.namespace, user_id, &self.backend.name)
    }

    /// Deliver one batch, retrying transient failures until attempts run
    /// out, then persisting the batch for startup recovery. Returns true
    /// when the batch is out of our hands: delivered, or filtered by the
    /// batch transform.
    pub async fn send_batch(&self, batch: &Batch) -> bool {
        self.deliver(batch, true).await
    }

    pub(crate) async fn deliver(&self, batch: &Batch, persist_on_failure: bool) -> bool {
        let outgoing = match self.apply_before_batch(batch) {
            Some(outgoing) => outgoing,
            None => {
                debug!(
                    backend = self.backend.name,
                    "batch transform filtered the whole batch"
                );
                return true;
            }
        };

        let body = match serde_json::to_vec(&outgoing) {
            Ok(body) => body,
            Err(e) => {
                let err = DeliveryError::Serialization(e);
                error!(backend = self.backend.name, "dropping batch: {err}");
                report_batch_failed(&self.backend.name, err.to_metric_tag());
                self.notify_failure(&outgoing, &err);
                return false;
            }
        };

        let mut attempt = 1;
        loop {
            match self.transmit(body.clone()).await {
                Ok(()) => {
                    debug!(
                        backend = self.backend.name,
                        events = outgoing.len(),
                        attempt,
                        "batch delivered"
                    );
                    report_batch_sent(&self.backend.name, outgoing.len() as u64);
                    self.notify_success(&outgoing);
                    return true;
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts() => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        backend = self.backend.name,
                        attempt,
                        "transient delivery failure, retrying in {delay:?}: {err}"
                    );
                    report_delivery_retry(&self.backend.name);
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            debug!(backend = self.backend.name, "delivery cancelled during backoff");
                            return false;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(
                            backend = self.backend.name,
                            attempts = attempt,
                            "delivery attempts exhausted: {err}"
                        );
                        if persist_on_failure {
                            self.persist(&outgoing);
                        }
                    } else {
                        warn!(backend = self.backend.name, "batch rejected: {err}");
                    }
                    report_batch_failed(&self.backend.name, err.to_metric_tag());
                    self.notify_failure(&outgoing, &err);
                    return false;
                }
            }
        }
    }

    /// Unload-time handoff over the fire-and-forget transport. No retries,
    /// no persistence, no response handling.
    pub fn send_batch_detached(&self, batch: &Batch) -> bool {
        let outgoing = match self.apply_before_batch(batch) {
            Some(outgoing) => outgoing,
            None => return true,
        };
        let body = match serde_json::to_vec(&outgoing) {
            Ok(body) => body,
            Err(e) => {
                error!(backend = self.backend.name, "dropping batch: {e}");
                return false;
            }
        };
        self.transport.send_detached(&self.backend.endpoint, body)
    }

    async fn transmit(&self, body: Vec<u8>) -> Result<(), DeliveryError> {
        let status = match self.transport.send(&self.backend.endpoint, body).await {
            Ok(status) => status,
            // encoding is deterministic; a retry would fail the same way
            Err(TransportError::Body(e)) => return Err(DeliveryError::Encoding(e.to_string())),
            Err(TransportError::Request(reason)) => {
                return Err(DeliveryError::Transient {
                    reason,
                    status: None,
                })
            }
        };

        match StatusCode::from_u16(status) {
            Ok(code) if code.is_success() => Ok(()),
            Ok(code) if is_transient_status(code) => Err(DeliveryError::Transient {
                reason: format!("status {code}"),
                status: Some(status),
            }),
            Ok(_) => Err(DeliveryError::Rejected { status }),
            Err(_) => Err(DeliveryError::Transient {
                reason: format!("unparseable status {status}"),
                status: Some(status),
            }),
        }
    }

    fn apply_before_batch(&self, batch: &Batch) -> Option<Batch> {
        if self.backend.kind == BackendKind::Managed {
            return Some(batch.clone());
        }
        let hook = match &self.backend.before_batch {
            Some(hook) => hook,
            None => return Some(batch.clone()),
        };
        match hook(batch.clone()) {
            Ok(Some(transformed)) => Some(transformed),
            Ok(None) => None,
            Err(e) => {
                warn!(
                    backend = self.backend.name,
                    "batch transform failed, sending original batch: {e}"
                );
                Some(batch.clone())
            }
        }
    }

    fn persist(&self, batch: &Batch) {
        let record = PersistedBatch::from_batch(batch, self.clock.now());
        let key = self.storage_key(batch.user_id.as_deref());
        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(e) => {
                error!(backend = self.backend.name, "could not serialize batch for storage: {e}");
                return;
            }
        };
        match self.store.set(&key, &json) {
            Ok(()) => {
                debug!(
                    backend = self.backend.name,
                    events = record.events.len(),
                    key,
                    "persisted undelivered batch"
                );
                report_batch_persisted(&self.backend.name);
            }
            Err(e) => warn!(
                backend = self.backend.name,
                "failed to persist undelivered batch: {e}"
            ),
        }
    }

    fn notify_success(&self, batch: &Batch) {
        if let Some(observer) = &self.backend.observer {
            observer.on_success(&self.backend.name, batch);
        }
    }

    fn notify_failure(&self, batch: &Batch, error: &DeliveryError) {
        if let Some(observer) = &self.backend.observer {
            observer.on_failure(&self.backend.name, batch, error);
        }
    }
}
