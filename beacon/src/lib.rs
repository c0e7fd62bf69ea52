pub mod api;
pub mod config;
pub mod consent;
pub mod delivery;
pub mod event;
pub mod fingerprint;
pub mod limits;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod session;
pub mod store;
pub mod time;
pub mod transport;

// The embedding surface most applications need.
pub use config::{BackendConfig, BackendKind, Config};
pub use event::{Batch, CapturedEvent, RawEvent};
pub use pipeline::{Pipeline, Signal};
pub use session::SharedState;
