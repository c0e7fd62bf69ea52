//! Shared fixtures for the pipeline integration tests: a manual clock, a
//! scriptable in-memory transport, and a harness wiring them together.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use beacon::api::TransportError;
use beacon::config::{BackendConfig, Config, HookError};
use beacon::event::CapturedEvent;
use beacon::pipeline::Pipeline;
use beacon::session::SharedState;
use beacon::store::MemoryStore;
use beacon::time::TimeSource;
use beacon::transport::Transport;

pub const PRIMARY_ENDPOINT: &str = "https://collector.test/batch";
pub const SECONDARY_ENDPOINT: &str = "https://mirror.test/batch";

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt::init();
    });
}

/// Clock the tests move by hand.
#[derive(Clone)]
pub struct ManualTime {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualTime {
    pub fn new() -> Self {
        ManualTime {
            now: Arc::new(Mutex::new(
                Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            )),
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::milliseconds(ms);
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Scripted response for one transport call. Endpoints with no script left
/// answer 200.
#[derive(Debug, Clone, Copy)]
pub enum SendOutcome {
    Status(u16),
    NetworkError,
    /// Respond with the status only after the delay elapses.
    DelayedStatus(u16, Duration),
}

#[derive(Debug, Clone)]
pub struct SentRequest {
    pub endpoint: String,
    pub body: Vec<u8>,
}

impl SentRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// Transport double that records every call and plays back scripted
/// outcomes per endpoint.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    calls: Arc<Mutex<Vec<SentRequest>>>,
    detached: Arc<Mutex<Vec<SentRequest>>>,
    plans: Arc<Mutex<HashMap<String, VecDeque<SendOutcome>>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&self, endpoint: &str, outcomes: impl IntoIterator<Item = SendOutcome>) {
        self.plans
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn calls(&self) -> Vec<SentRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.endpoint == endpoint)
            .count()
    }

    pub fn bodies_to(&self, endpoint: &str) -> Vec<serde_json::Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.endpoint == endpoint)
            .map(SentRequest::json)
            .collect()
    }

    pub fn detached_to(&self, endpoint: &str) -> usize {
        self.detached
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.endpoint == endpoint)
            .count()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, endpoint: &str, body: Vec<u8>) -> Result<u16, TransportError> {
        self.calls.lock().unwrap().push(SentRequest {
            endpoint: endpoint.to_string(),
            body,
        });
        let outcome = self
            .plans
            .lock()
            .unwrap()
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front)
            .unwrap_or(SendOutcome::Status(200));

        match outcome {
            SendOutcome::Status(status) => Ok(status),
            SendOutcome::NetworkError => {
                Err(TransportError::Request("connection refused".to_string()))
            }
            SendOutcome::DelayedStatus(status, delay) => {
                tokio::time::sleep(delay).await;
                Ok(status)
            }
        }
    }

    fn send_detached(&self, endpoint: &str, body: Vec<u8>) -> bool {
        self.detached.lock().unwrap().push(SentRequest {
            endpoint: endpoint.to_string(),
            body,
        });
        true
    }
}

pub struct TestPipeline {
    pub pipeline: Arc<Pipeline>,
    pub transport: RecordingTransport,
    pub store: MemoryStore,
    pub clock: ManualTime,
    pub state: Arc<SharedState>,
}

/// Harness around one managed backend named `primary`, with a session and
/// a user already present.
pub fn single_backend(config: Config) -> TestPipeline {
    with_backends(
        config,
        vec![BackendConfig::managed("primary", PRIMARY_ENDPOINT)],
    )
}

pub fn with_backends(config: Config, backends: Vec<BackendConfig>) -> TestPipeline {
    build(config, backends, |pipeline| pipeline)
}

/// Same as [`single_backend`] but over a caller-provided store, for tests
/// that span a simulated restart.
pub fn single_backend_with_store(config: Config, store: MemoryStore) -> TestPipeline {
    build_with_store(
        config,
        vec![BackendConfig::managed("primary", PRIMARY_ENDPOINT)],
        store,
        |pipeline| pipeline,
    )
}

pub fn single_backend_with_hook(
    config: Config,
    hook: impl Fn(CapturedEvent) -> Result<Option<CapturedEvent>, HookError> + Send + Sync + 'static,
) -> TestPipeline {
    backends_with_hook(
        config,
        vec![BackendConfig::managed("primary", PRIMARY_ENDPOINT)],
        hook,
    )
}

pub fn backends_with_hook(
    config: Config,
    backends: Vec<BackendConfig>,
    hook: impl Fn(CapturedEvent) -> Result<Option<CapturedEvent>, HookError> + Send + Sync + 'static,
) -> TestPipeline {
    build(config, backends, |pipeline| pipeline.with_before_send(hook))
}

fn build(
    config: Config,
    backends: Vec<BackendConfig>,
    finish: impl FnOnce(Pipeline) -> Pipeline,
) -> TestPipeline {
    build_with_store(config, backends, MemoryStore::new(), finish)
}

fn build_with_store(
    config: Config,
    backends: Vec<BackendConfig>,
    store: MemoryStore,
    finish: impl FnOnce(Pipeline) -> Pipeline,
) -> TestPipeline {
    init_tracing();
    let transport = RecordingTransport::new();
    let clock = ManualTime::new();
    let state = Arc::new(SharedState::new());
    state.set_session_id("s-1");
    state.set_user_id("u-1");

    let pipeline = Pipeline::new(
        config,
        backends,
        state.clone(),
        Arc::new(transport.clone()),
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
    );

    TestPipeline {
        pipeline: Arc::new(finish(pipeline)),
        transport,
        store,
        clock,
        state,
    }
}
