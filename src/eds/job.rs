//! Jobs: long-lived work units shared between stages
//!
//! A job outlives any single event. Shared ownership is an `Arc`; the last
//! handle to drop runs destruction, which notifies every registered
//! listener exactly once. Each stage may attach one opaque state blob to a
//! job, created lazily on first use and dropped with the job.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::domain_types::JobId;
use crate::eds::stage::StageId;

type DestroyListener = Box<dyn FnOnce(JobId) + Send>;

/// Shared bookkeeping embedded in every job type.
pub struct JobCore {
    id: JobId,
    alive: AtomicBool,
    stage_data: Mutex<Vec<Option<Box<dyn Any + Send>>>>,
    listeners: Mutex<Vec<DestroyListener>>,
}

impl JobCore {
    pub fn new() -> Self {
        Self {
            id: JobId::generate(),
            alive: AtomicBool::new(true),
            stage_data: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    /// Registers a callback to run when the job is destroyed.
    pub fn add_destroy_listener(&self, listener: impl FnOnce(JobId) + Send + 'static) {
        self.listeners
            .lock()
            .expect("job listener mutex poisoned")
            .push(Box::new(listener));
    }

    /// Runs `f` against this job's state slot for `stage`, creating the
    /// slot with `init` on first use.
    ///
    /// The stored type is fixed by the stage that owns the slot; only that
    /// stage's workers ever touch it.
    pub fn with_stage_data<T, R>(
        &self,
        stage: StageId,
        init: impl FnOnce() -> T,
        f: impl FnOnce(&mut T) -> R,
    ) -> R
    where
        T: Send + 'static,
    {
        let mut slots = self.stage_data.lock().expect("stage data mutex poisoned");
        let index = stage.index();
        if slots.len() <= index {
            slots.resize_with(index + 1, || None);
        }
        let slot = &mut slots[index];
        if slot.is_none() {
            *slot = Some(Box::new(init()));
        }
        let data = slot
            .as_mut()
            .and_then(|boxed| boxed.downcast_mut::<T>())
            .expect("stage data type is fixed at stage registration");
        f(data)
    }

    /// Like [`with_stage_data`](Self::with_stage_data) but without lazy
    /// creation: returns `None` when the slot has not been populated.
    pub fn try_with_stage_data<T, R>(
        &self,
        stage: StageId,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R>
    where
        T: Send + 'static,
    {
        let mut slots = self.stage_data.lock().expect("stage data mutex poisoned");
        let data = slots
            .get_mut(stage.index())?
            .as_mut()?
            .downcast_mut::<T>()?;
        Some(f(data))
    }

    /// Replaces this job's state slot for `stage`, dropping any previous
    /// blob. Used when a stage starts a fresh unit of work on the job.
    pub fn reset_stage_data<T>(&self, stage: StageId, value: T)
    where
        T: Send + 'static,
    {
        let mut slots = self.stage_data.lock().expect("stage data mutex poisoned");
        let index = stage.index();
        if slots.len() <= index {
            slots.resize_with(index + 1, || None);
        }
        slots[index] = Some(Box::new(value));
    }

    /// Removes this job's state slot for `stage`, if any.
    pub fn clear_stage_data(&self, stage: StageId) {
        let mut slots = self.stage_data.lock().expect("stage data mutex poisoned");
        if let Some(slot) = slots.get_mut(stage.index()) {
            *slot = None;
        }
    }
}

impl Default for JobCore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobCore {
    fn drop(&mut self) {
        // Drop runs once by construction, so every listener is notified
        // exactly once.
        self.alive.store(false, Ordering::Release);
        let listeners = std::mem::take(
            &mut *self
                .listeners
                .lock()
                .expect("job listener mutex poisoned"),
        );
        trace!(job = %self.id, listeners = listeners.len(), "job destroyed");
        for listener in listeners {
            listener(self.id);
        }
    }
}

impl std::fmt::Debug for JobCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCore")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

/// Anything addressable by events across stages.
pub trait Job: Send + Sync + 'static {
    fn core(&self) -> &JobCore;

    /// Upcast used by helper stages to hand a completion back to the
    /// concrete job type that issued the operation.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Plain {
        core: JobCore,
    }

    impl Job for Plain {
        fn core(&self) -> &JobCore {
            &self.core
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn listeners_fire_exactly_once_on_last_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let job = Arc::new(Plain { core: JobCore::new() });
        let counter = Arc::clone(&fired);
        job.core().add_destroy_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let second = Arc::clone(&job);
        drop(job);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stage_data_is_lazy_and_per_stage() {
        let job = Plain { core: JobCore::new() };
        let a = StageId::next();
        let b = StageId::next();

        let first = job.core().with_stage_data(a, || 10u32, |v| {
            *v += 1;
            *v
        });
        assert_eq!(first, 11);

        // A different stage sees its own slot, not stage a's counter.
        let other = job.core().with_stage_data(b, || 0u32, |v| *v);
        assert_eq!(other, 0);

        let again = job.core().with_stage_data(a, || 99u32, |v| *v);
        assert_eq!(again, 11);

        job.core().clear_stage_data(a);
        let reset = job.core().with_stage_data(a, || 7u32, |v| *v);
        assert_eq!(reset, 7);
    }

    #[test]
    fn alive_flag_tracks_state() {
        let job = Plain { core: JobCore::new() };
        assert!(job.core().is_alive());
        job.core().set_alive(false);
        assert!(!job.core().is_alive());
    }
}
