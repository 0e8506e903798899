//! Data model shared by every component: runs, steps and timeline events.

pub mod events;
pub mod runs;
pub mod steps;

pub use events::{EntityKind, EventLevel, EventPhase, EventStatus, TimelineEvent};
pub use runs::{RunPatch, RunRecord, RunStatus, RunUpdate, Usage};
pub use steps::{Step, StepKind, StepLog};
