use std::str::FromStr;
use std::sync::Arc;
use std::time;

use envconfig::Envconfig;

use crate::delivery::DeliveryObserver;
use crate::event::{Batch, CapturedEvent};

/// Pipeline tuning knobs. Every field has a default that matches the
/// documented behavior; `init_from_env` overrides them for deployments that
/// configure through the environment.
#[derive(Envconfig, Clone)]
pub struct Config {
    /// Fraction of non-critical events admitted, 0.0 to 1.0.
    #[envconfig(default = "1.0")]
    pub sampling_rate: f64,

    /// Separate admission fraction for `$exception` events.
    #[envconfig(default = "1.0")]
    pub error_sampling: f64,

    #[envconfig(default = "500")]
    pub dedup_window: EnvMsDuration,

    #[envconfig(default = "100")]
    pub queue_capacity: usize,

    #[envconfig(default = "100")]
    pub pending_capacity: usize,

    /// Per-backend ceiling on events held while awaiting consent.
    #[envconfig(default = "500")]
    pub consent_capacity: usize,

    /// When true, events are held until some backend has consent.
    #[envconfig(default = "false")]
    pub require_consent: bool,

    #[envconfig(default = "1000")]
    pub max_events_per_second: u32,

    #[envconfig(default = "600")]
    pub max_per_name_per_minute: u32,

    #[envconfig(default = "524288")]
    pub max_event_bytes: usize,

    /// Queue depth that triggers an early background flush.
    #[envconfig(default = "50")]
    pub flush_at: usize,

    /// Background flush cadence. Zero disables the timer entirely.
    #[envconfig(default = "5000")]
    pub flush_interval: EnvMsDuration,

    /// Chunk size used when draining a consent buffer after a grant.
    #[envconfig(default = "10")]
    pub consent_flush_batch: usize,

    #[envconfig(default = "100")]
    pub consent_flush_delay: EnvMsDuration,

    /// How long a persisted batch stays eligible for startup recovery.
    #[envconfig(default = "7200000")]
    pub persist_ttl: EnvMsDuration,

    #[envconfig(default = "beacon")]
    pub storage_namespace: String,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sampling_rate: 1.0,
            error_sampling: 1.0,
            dedup_window: EnvMsDuration(time::Duration::from_millis(500)),
            queue_capacity: 100,
            pending_capacity: 100,
            consent_capacity: 500,
            require_consent: false,
            max_events_per_second: 1000,
            max_per_name_per_minute: 600,
            max_event_bytes: 512 * 1024,
            flush_at: 50,
            flush_interval: EnvMsDuration(time::Duration::from_millis(5000)),
            consent_flush_batch: 10,
            consent_flush_delay: EnvMsDuration(time::Duration::from_millis(100)),
            persist_ttl: EnvMsDuration(time::Duration::from_millis(7_200_000)),
            storage_namespace: "beacon".to_string(),
            request_timeout: EnvMsDuration(time::Duration::from_millis(5000)),
            retry_policy: RetryPolicyConfig::default(),
        }
    }
}

#[derive(Envconfig, Debug, Clone, Copy)]
pub struct RetryPolicyConfig {
    /// Total attempts per batch, the initial send included.
    #[envconfig(default = "3")]
    pub max_attempts: u32,

    #[envconfig(default = "1000")]
    pub base_interval: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub maximum_interval: EnvMsDuration,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        RetryPolicyConfig {
            max_attempts: 3,
            base_interval: EnvMsDuration(time::Duration::from_millis(1000)),
            maximum_interval: EnvMsDuration(time::Duration::from_millis(30000)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Error type surfaced by user hooks. Hook failures never abort the
/// pipeline; the untransformed value is used instead.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Event transform applied before routing, single-backend setups only.
/// `Ok(None)` drops the event, `Err` keeps the original.
pub type BeforeSend = dyn Fn(CapturedEvent) -> Result<Option<CapturedEvent>, HookError> + Send + Sync;

/// Batch transform applied before serialization, custom backends only.
/// `Ok(None)` filters the whole batch, `Err` sends the original.
pub type BeforeBatch = dyn Fn(Batch) -> Result<Option<Batch>, HookError> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The first-party collector. Its wire schema is fixed, so batch
    /// transforms never run against it.
    Managed,
    /// A self-hosted or third-party collector that accepts whatever shape
    /// the `before_batch` hook produces.
    Custom,
}

/// One delivery destination. The pipeline spawns an independent delivery
/// engine per backend; consent is tracked per backend name.
#[derive(Clone)]
pub struct BackendConfig {
    pub name: String,
    pub endpoint: String,
    pub kind: BackendKind,
    pub before_batch: Option<Arc<BeforeBatch>>,
    pub observer: Option<Arc<dyn DeliveryObserver>>,
}

impl BackendConfig {
    pub fn managed(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        BackendConfig {
            name: name.into(),
            endpoint: endpoint.into(),
            kind: BackendKind::Managed,
            before_batch: None,
            observer: None,
        }
    }

    pub fn custom(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        BackendConfig {
            name: name.into(),
            endpoint: endpoint.into(),
            kind: BackendKind::Custom,
            before_batch: None,
            observer: None,
        }
    }

    pub fn with_before_batch(
        mut self,
        hook: impl Fn(Batch) -> Result<Option<Batch>, HookError> + Send + Sync + 'static,
    ) -> Self {
        self.before_batch = Some(Arc::new(hook));
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("kind", &self.kind)
            .field("before_batch", &self.before_batch.is_some())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
