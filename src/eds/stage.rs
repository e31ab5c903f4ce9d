//! Stages: an event queue plus a pool of worker threads
//!
//! A stage owns the only shared-mutable structure between its producers and
//! its workers, the bounded priority queue. Workers run each event to
//! completion and never block on I/O; blocking work belongs in a helper
//! stage. Failures inside a handler are caught at the stage boundary so one
//! bad event cannot take the stage down.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use crate::domain_types::{QueueCapacity, WorkerCount};
use crate::eds::event::StageEvent;
use crate::eds::queue::{EventQueue, QueueError};

static NEXT_STAGE_ID: AtomicUsize = AtomicUsize::new(0);

/// Identity token for a stage, used to index per-stage job state slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageId(usize);

impl StageId {
    /// Allocates the next process-unique stage identity.
    pub fn next() -> Self {
        Self(NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Processes one kind of event on behalf of a stage.
pub trait EventHandler<E>: Send {
    fn handle_event(&mut self, event: E) -> crate::Result<()>;
}

/// Creates handlers for a stage's workers, one per dequeued event.
///
/// The factory may pool handlers internally; the default implementations in
/// this crate construct cheap handlers on demand.
pub trait EventHandlerFactory<E>: Send + Sync + 'static {
    fn new_handler(&self) -> Box<dyn EventHandler<E>>;
}

/// A named component owning an event queue and a worker pool.
pub struct Stage<E: StageEvent> {
    name: String,
    id: StageId,
    queue: Arc<EventQueue<E>>,
    factory: Arc<dyn EventHandlerFactory<E>>,
    worker_count: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    in_flight: Arc<AtomicUsize>,
}

impl<E: StageEvent> Stage<E> {
    pub fn new(
        name: &str,
        capacity: QueueCapacity,
        workers: WorkerCount,
        factory: Arc<dyn EventHandlerFactory<E>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            id: StageId::next(),
            queue: Arc::new(EventQueue::new(capacity)),
            factory,
            worker_count: workers.as_usize(),
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    /// Posts an event to this stage. Blocks only when the queue is full;
    /// back-pressure through that blocking is the only admission policy.
    pub fn post(&self, event: E) -> Result<(), QueueError> {
        self.queue.enqueue(event)
    }

    /// Number of events waiting in the stage queue.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the worker pool. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(stage = %self.name, "stage already running");
            return;
        }
        let mut workers = self.workers.lock().expect("worker list mutex poisoned");
        for worker_id in 0..self.worker_count {
            let queue = Arc::clone(&self.queue);
            let factory = Arc::clone(&self.factory);
            let stage_name = self.name.clone();
            let in_flight = Arc::clone(&self.in_flight);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{worker_id}", self.name))
                .spawn(move || worker_loop(&stage_name, worker_id, &queue, &factory, &in_flight))
                .expect("failed to spawn stage worker");
            workers.push(handle);
        }
        info!(stage = %self.name, workers = self.worker_count, "stage started");
    }

    /// Stops the stage: waits until queued and in-flight events (including
    /// continuations workers post back to this stage) have drained, then
    /// closes the queue and joins the workers. After this returns no
    /// further event is processed and `post` fails with
    /// `QueueError::Closed`. Drain is bounded; a stage that cannot quiesce
    /// within the window is closed anyway.
    pub fn stop(&self) {
        if self.running.load(Ordering::SeqCst) {
            let deadline = std::time::Instant::now() + DRAIN_WINDOW;
            // Quiet must hold for a few samples in a row; a worker that
            // just pulled an event may not have bumped the counter yet.
            let mut quiet_samples = 0;
            while quiet_samples < 3 && std::time::Instant::now() < deadline {
                if self.queue.is_empty() && self.in_flight.load(Ordering::SeqCst) == 0 {
                    quiet_samples += 1;
                } else {
                    quiet_samples = 0;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            if !self.queue.is_empty() {
                warn!(stage = %self.name, pending = self.queue.len(),
                    "stage did not quiesce, discarding pending events");
            }
        }
        self.queue.close();
        let workers = std::mem::take(&mut *self.workers.lock().expect("worker list mutex poisoned"));
        for handle in workers {
            if handle.join().is_err() {
                error!(stage = %self.name, "stage worker terminated abnormally");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!(stage = %self.name, "stage stopped");
    }
}

impl<E: StageEvent> std::fmt::Debug for Stage<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("workers", &self.worker_count)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

const DRAIN_WINDOW: std::time::Duration = std::time::Duration::from_secs(5);

fn worker_loop<E: StageEvent>(
    stage: &str,
    worker_id: usize,
    queue: &EventQueue<E>,
    factory: &Arc<dyn EventHandlerFactory<E>>,
    in_flight: &AtomicUsize,
) {
    debug!(stage, worker_id, "worker started");
    loop {
        let event = match queue.dequeue() {
            Ok(event) => event,
            Err(QueueError::Closed) => break,
        };
        in_flight.fetch_add(1, Ordering::SeqCst);
        let label = event.describe();
        let mut handler = factory.new_handler();
        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle_event(event)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // The event is dropped here, releasing its job reference.
                warn!(stage, worker_id, event = label, error = %e, "event handler failed");
            }
            Err(_) => {
                error!(stage, worker_id, event = label, "event handler panicked");
            }
        }
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
    debug!(stage, worker_id, "worker terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::EventPriority;
    use std::sync::mpsc;
    use std::time::Duration;

    enum Ev {
        Record(u32),
        Boom,
    }

    impl StageEvent for Ev {
        fn priority(&self) -> EventPriority {
            match self {
                Ev::Record(_) => EventPriority::normal(),
                Ev::Boom => EventPriority::normal(),
            }
        }

        fn describe(&self) -> &'static str {
            match self {
                Ev::Record(_) => "record",
                Ev::Boom => "boom",
            }
        }
    }

    struct Recorder {
        sink: mpsc::Sender<u32>,
    }

    impl EventHandler<Ev> for Recorder {
        fn handle_event(&mut self, event: Ev) -> crate::Result<()> {
            match event {
                Ev::Record(n) => {
                    self.sink.send(n).ok();
                    Ok(())
                }
                Ev::Boom => panic!("boom"),
            }
        }
    }

    struct RecorderFactory {
        sink: mpsc::Sender<u32>,
    }

    impl EventHandlerFactory<Ev> for RecorderFactory {
        fn new_handler(&self) -> Box<dyn EventHandler<Ev>> {
            Box::new(Recorder {
                sink: self.sink.clone(),
            })
        }
    }

    fn test_stage(workers: usize) -> (Arc<Stage<Ev>>, mpsc::Receiver<u32>) {
        let (tx, rx) = mpsc::channel();
        let stage = Stage::new(
            "test",
            QueueCapacity::try_new(64).unwrap(),
            WorkerCount::try_new(workers).unwrap(),
            Arc::new(RecorderFactory { sink: tx }),
        );
        (stage, rx)
    }

    #[test]
    fn processes_posted_events() {
        let (stage, rx) = test_stage(2);
        stage.start();
        for n in 0..10 {
            stage.post(Ev::Record(n)).unwrap();
        }
        let mut seen: Vec<u32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        stage.stop();
    }

    #[test]
    fn survives_handler_panics() {
        let (stage, rx) = test_stage(1);
        stage.start();
        stage.post(Ev::Boom).unwrap();
        stage.post(Ev::Record(7)).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
        stage.stop();
    }

    #[test]
    fn no_event_processed_after_stop() {
        let (stage, rx) = test_stage(1);
        stage.start();
        stage.post(Ev::Record(1)).unwrap();
        stage.stop();
        // Queued work was drained before stop returned.
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert!(stage.post(Ev::Record(2)).is_err());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn start_is_idempotent() {
        let (stage, _rx) = test_stage(1);
        stage.start();
        stage.start();
        assert!(stage.is_running());
        stage.stop();
        assert!(!stage.is_running());
    }
}
