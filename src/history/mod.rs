//! Run history: storage contract, in-memory store and the recorder that
//! mirrors writes to telemetry.

pub mod memory;
pub mod recorder;
pub mod store;

pub use memory::InMemoryHistoryStore;
pub use recorder::HistoryRecorder;
pub use store::HistoryStore;
