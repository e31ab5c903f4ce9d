//! The event contract shared by all stages
//!
//! Each stage defines its own event enumeration; the queue and worker
//! machinery only need a priority and a label for logging.

use crate::domain_types::EventPriority;

/// An event that can be posted to a [`Stage`](crate::eds::stage::Stage).
///
/// Variants fuse the event type and its payload; job references travel
/// inside the variants as shared-ownership handles.
pub trait StageEvent: Send + 'static {
    /// Queue priority for this event. Lower values dequeue earlier; ties
    /// are broken first-in-first-out. Defaults to 1000.
    fn priority(&self) -> EventPriority {
        EventPriority::normal()
    }

    /// A short label used in worker logs.
    fn describe(&self) -> &'static str;
}
