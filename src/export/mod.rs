//! Telemetry export: a generic retrying task queue and the backend it feeds.
//!
//! - [`queue`]: bounded-concurrency executor with timeout and backoff
//! - [`backend`]: backend trait and payload types
//! - [`exporter`]: adapter from history writes to queue tasks
//! - [`http`]: JSON-over-HTTP backend

pub mod backend;
pub mod exporter;
pub mod http;
pub mod queue;

pub use backend::{EventExport, RunExport, RunPatchExport, TelemetryBackend};
pub use exporter::TelemetryExporter;
pub use http::HttpTelemetryBackend;
pub use queue::{ExportQueue, QueueConfig, QueueStats, QueueTask};
