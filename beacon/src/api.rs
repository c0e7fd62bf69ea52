use thiserror::Error;

/// Why an event was refused during admission. Used as the `cause` label on
/// drop counters and carried in [`PipelineStats`](crate::pipeline::PipelineStats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropCause {
    MissingEventName,
    Oversized,
    Duplicate,
    SampledOut,
    RateLimited,
    TransformDropped,
    QueueOverflow,
    QueueSaturated,
    PendingOverflow,
    ConsentOverflow,
    Stopped,
}

impl DropCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropCause::MissingEventName => "missing_event_name",
            DropCause::Oversized => "oversized",
            DropCause::Duplicate => "duplicate",
            DropCause::SampledOut => "sampled_out",
            DropCause::RateLimited => "rate_limited",
            DropCause::TransformDropped => "transform_dropped",
            DropCause::QueueOverflow => "queue_overflow",
            DropCause::QueueSaturated => "queue_saturated",
            DropCause::PendingOverflow => "pending_overflow",
            DropCause::ConsentOverflow => "consent_overflow",
            DropCause::Stopped => "stopped",
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("failed to encode request body: {0}")]
    Body(#[from] std::io::Error),
}

/// Outcome classification for a single delivery attempt. Transient failures
/// are retried until attempts run out, then the batch is persisted;
/// permanent rejections drop the batch immediately.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("failed to serialize batch: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to encode batch body: {0}")]
    Encoding(String),
    #[error("delivery failed, may be retried: {reason}")]
    Transient { reason: String, status: Option<u16> },
    #[error("batch rejected with status {status}, not retried")]
    Rejected { status: u16 },
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient { .. })
    }

    pub fn to_metric_tag(&self) -> &'static str {
        match self {
            DeliveryError::Serialization(_) => "serialization",
            DeliveryError::Encoding(_) => "encoding",
            DeliveryError::Transient { .. } => "transient",
            DeliveryError::Rejected { .. } => "rejected",
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage capacity exceeded")]
    CapacityExceeded,
}
