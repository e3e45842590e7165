//! Shared plumbing for the CloudSigma controllers
//!
//! - `backoff`: per-resource exponential requeue delays
//! - `store`: the desired-state store seam (kube-backed and in-memory)
//! - `metrics` / `probes`: Prometheus registry and the health/metrics HTTP server
//! - `shutdown`: process-wide cancellation signal
//! - `telemetry`: tracing subscriber setup

pub mod backoff;
pub mod metrics;
pub mod probes;
pub mod shutdown;
pub mod store;
pub mod telemetry;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use backoff::{BackoffRegistry, ExponentialBackoff};
pub use metrics::Metrics;
pub use probes::{Readiness, serve_probes};
pub use shutdown::Shutdown;
pub use store::{KubeStore, RecordStore, StoreError};
