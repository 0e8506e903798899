//! UAR Core
//!
//! Run-concurrency core for tool-using agents: per-run operation contexts
//! and their timeline events, real-time merging of sub-agent activity into
//! a parent's output stream, run history, and a retrying telemetry export
//! queue.
//!
//! # Architecture
//!
//! - **Runs**: every run owns an [`OperationContext`] that publishes its
//!   lifecycle events and shares a step log with delegated runs
//! - **Streaming**: [`StreamMergeEngine`] interleaves sub-agent tool activity
//!   with the primary model stream
//! - **History**: [`HistoryRecorder`] writes run records and events to a
//!   [`HistoryStore`] and mirrors them to telemetry
//! - **Export**: [`ExportQueue`] runs telemetry work with bounded
//!   concurrency, timeouts and exponential backoff
//!
//! # Modules
//!
//! - [`runtime`]: agent driver, contexts, event bus, merging, delegation
//! - [`history`]: run history storage and recording
//! - [`export`]: telemetry queue, backends and exporter
//! - [`domain`]: run, step and timeline event types
//! - [`config`]: layered configuration
//! - [`telemetry`]: tracing subscriber setup

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

pub mod config;
pub mod domain;
pub mod error;
pub mod export;
pub mod history;
pub mod runtime;
pub mod telemetry;

pub use config::RuntimeConfig;
pub use error::{AgentError, EventError, ExportError, HistoryError, ModelError, QueueError, ToolError};
pub use export::{ExportQueue, HttpTelemetryBackend, TelemetryBackend, TelemetryExporter};
pub use history::{HistoryRecorder, HistoryStore, InMemoryHistoryStore};
pub use runtime::{
    Agent, AgentHooks, AgentStream, EventBus, GenerateResult, MergedEvent, OperationContext,
    RunOptions, Runtime, StreamMergeEngine, StreamPart,
};
