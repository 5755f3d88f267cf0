//! Invocation loop (orchestrator, limits, events).

pub mod events;
pub mod limits;
pub mod runner;
pub mod types;

pub use events::{RunEvent, RunEventPayload, RunEventSink};
pub use limits::TaskLimits;
pub use runner::{Orchestrator, RunHandle};
pub use types::*;
