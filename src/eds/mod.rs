//! The staged event-driven runtime
//!
//! Stages own a bounded priority queue and a pool of worker threads; they
//! communicate only by posting events that carry shared-ownership job
//! references. The HTTP pipeline in [`crate::http`] is built entirely from
//! these parts.

pub mod event;
pub mod helpers;
pub mod job;
pub mod queue;
pub mod stage;

pub use event::StageEvent;
pub use job::{Job, JobCore};
pub use queue::{EventQueue, QueueError};
pub use stage::{EventHandler, EventHandlerFactory, Stage, StageId};
