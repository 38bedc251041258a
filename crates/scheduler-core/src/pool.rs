//! Bounded worker pool (spec.md §4.D). The spec calls for OS-thread
//! semantics (blocking execution, no yielding between fires), which is
//! why this is built on `std::thread` rather than the teacher's usual
//! `tokio::spawn` — see SPEC_FULL.md for the rationale.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use tracing::{debug, warn};

/// A unit of work submitted to the pool: a thunk to run on a worker
/// thread, owning everything it needs.
pub type PoolTask = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(PoolTask),
    Shutdown,
}

/// Fixed-size pool of OS threads draining a shared queue (spec.md §4.D).
/// Unlike the teacher's async worker contexts, capacity here is a hard
/// ceiling enforced by the channel's senders, not a semaphore permit.
pub struct WorkerPool {
    sender: mpsc::Sender<Message>,
    handles: parking_lot::Mutex<Vec<thread::JoinHandle<()>>>,
    size: usize,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn `size` worker threads, each looping on the shared receiver.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "worker pool size must be positive");
        let (sender, receiver) = mpsc::channel::<Message>();
        let receiver = Arc::new(parking_lot::Mutex::new(receiver));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let handles = (0..size)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let in_flight = in_flight.clone();
                thread::Builder::new()
                    .name(format!("scheduler-worker-{worker_id}"))
                    .spawn(move || loop {
                        let message = receiver.lock().recv();
                        match message {
                            Ok(Message::Run(task)) => {
                                in_flight.fetch_add(1, Ordering::SeqCst);
                                debug!(worker_id, "running task");
                                task();
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                            }
                            Ok(Message::Shutdown) | Err(_) => {
                                debug!(worker_id, "worker shutting down");
                                break;
                            }
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            sender,
            handles: parking_lot::Mutex::new(handles),
            size,
            in_flight,
        }
    }

    /// Number of worker threads in the pool.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Threads currently executing a task (approximate, for diagnostics
    /// and the `available()` heuristic only).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Best-effort count of threads not currently running a task. The
    /// scheduler loop uses this to bound how many triggers it acquires
    /// per pass (spec.md §4.E step 1) — it is a heuristic, not a lock.
    pub fn available(&self) -> usize {
        self.size.saturating_sub(self.in_flight())
    }

    /// Queue a task for execution on the next free worker. Never blocks
    /// the caller on a worker becoming free — the channel is unbounded,
    /// matching spec.md's "acquire is advisory, submission never blocks"
    /// note in §4.E.
    pub fn submit(&self, task: PoolTask) {
        if self.sender.send(Message::Run(task)).is_err() {
            warn!("worker pool is shut down; dropping submitted task");
        }
    }

    /// Stop accepting new work. If `wait_for_completion` is true, blocks
    /// until every worker thread has drained and exited. Callable through
    /// a shared reference since the pool is held in an `Arc` by the
    /// engine; idempotent beyond the first call (later calls just find
    /// nothing left to join).
    pub fn shutdown(&self, wait_for_completion: bool) {
        for _ in 0..self.size {
            let _ = self.sender.send(Message::Shutdown);
        }
        if wait_for_completion {
            for handle in self.handles.lock().drain(..) {
                let _ = handle.join();
            }
        }
    }
}
