//! Worker thread pool.
//!
//! Session relays run as tasks on this pool: one task per session, submitted
//! when the flow is accepted and returning when the session closes. Dispatch
//! is FIFO through a bounded queue; `submit` fails fast when the queue is at
//! capacity so the accept path can drop the flow instead of blocking a
//! reader thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use tracing::{debug, trace, warn};

use crate::common::{Error, Result};

/// Upper bound on queued-but-not-yet-running tasks.
const TASK_QUEUE_CAPACITY: usize = 10_000;

/// Workers when the caller does not pick a count: twice the CPUs, clamped.
const MIN_WORKERS: usize = 2;
const MAX_WORKERS: usize = 64;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    /// Tasks currently executing on a worker.
    active: Mutex<usize>,
    /// Signaled whenever a worker goes idle with an empty queue.
    all_idle: Condvar,
    shutdown: AtomicBool,
}

pub struct ThreadPool {
    tasks_tx: Sender<Task>,
    tasks_rx: Receiver<Task>,
    /// Dropped on shutdown; workers observe the disconnect and exit.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    state: Arc<PoolState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// `workers == 0` picks a default from the CPU count.
    pub fn new(workers: usize, stack_size: usize) -> Self {
        Self::with_capacity(workers, stack_size, TASK_QUEUE_CAPACITY)
    }

    fn with_capacity(workers: usize, stack_size: usize, capacity: usize) -> Self {
        let workers = if workers == 0 {
            default_worker_count()
        } else {
            workers
        };

        let (tasks_tx, tasks_rx) = channel::bounded::<Task>(capacity);
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let state = Arc::new(PoolState {
            active: Mutex::new(0),
            all_idle: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = tasks_rx.clone();
            let shutdown = shutdown_rx.clone();
            let state = Arc::clone(&state);
            let mut builder = std::thread::Builder::new().name(format!("tb-worker-{}", i));
            if stack_size > 0 {
                builder = builder.stack_size(stack_size);
            }
            let handle = builder
                .spawn(move || worker_loop(rx, shutdown, state))
                .expect("failed to spawn pool worker");
            handles.push(handle);
        }
        debug!(workers, capacity, "thread pool started");

        Self {
            tasks_tx,
            tasks_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            state,
            workers: Mutex::new(handles),
        }
    }

    /// Enqueue a task. Fails with `Error::QueueFull` when the queue is at
    /// capacity or the pool has shut down; the rejected task is dropped
    /// without running.
    pub fn submit(&self, task: Task) -> Result<()> {
        if self.state.shutdown.load(Ordering::Acquire) {
            return Err(Error::QueueFull("task"));
        }
        match self.tasks_tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                Err(Error::QueueFull("task"))
            }
        }
    }

    /// Block until the queue is empty and no worker is executing a task.
    pub fn wait_all(&self) {
        let mut active = self.state.active.lock().unwrap_or_else(|e| e.into_inner());
        while *active > 0 || !self.tasks_rx.is_empty() {
            let (guard, _) = self
                .state
                .all_idle
                .wait_timeout(active, Duration::from_millis(50))
                .unwrap_or_else(|e| e.into_inner());
            active = guard;
        }
    }

    pub fn queued(&self) -> usize {
        self.tasks_rx.len()
    }

    /// Stop accepting work, wake every worker, join them, then drop any
    /// tasks still queued without executing them.
    pub fn shutdown(&self) {
        if self.state.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender disconnects the shutdown channel, which every
        // worker selects on.
        self.shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in handles {
            let _ = handle.join();
        }

        let mut dropped = 0usize;
        while self.tasks_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "thread pool discarded queued tasks on shutdown");
        }
        debug!("thread pool stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(tasks: Receiver<Task>, shutdown: Receiver<()>, state: Arc<PoolState>) {
    loop {
        crossbeam::channel::select! {
            recv(tasks) -> msg => {
                let task = match msg {
                    Ok(task) => task,
                    Err(_) => break,
                };
                {
                    let mut active = state.active.lock().unwrap_or_else(|e| e.into_inner());
                    *active += 1;
                }
                task();
                let mut active = state.active.lock().unwrap_or_else(|e| e.into_inner());
                *active -= 1;
                if *active == 0 && tasks.is_empty() {
                    state.all_idle.notify_all();
                }
            },
            recv(shutdown) -> _ => {
                trace!("worker received shutdown");
                break;
            },
        }
    }
}

fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus * 2).clamp(MIN_WORKERS, MAX_WORKERS)
}
