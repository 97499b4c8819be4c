//! Threading Primitives
//!
//! Background execution for streaming work:
//! - Named worker thread pool fed by a crossbeam channel
//! - `ExclusiveSlot`, a monitor that hands out at most one lease on its state at a time

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use log::error;
use parking_lot::{Condvar, Mutex};

use crate::{PlatformError, PlatformResult};

/// Task for the thread pool
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Thread pool for background work
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<Sender<Task>>,
    shutdown: Arc<AtomicBool>,
    task_count: Arc<AtomicUsize>,
}

struct Worker {
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        name: String,
        receiver: Receiver<Task>,
        shutdown: Arc<AtomicBool>,
        task_count: Arc<AtomicUsize>,
    ) -> PlatformResult<Self> {
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    match receiver.recv_timeout(Duration::from_millis(100)) {
                        Ok(task) => {
                            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                                error!("Worker task panicked");
                            }
                            task_count.fetch_sub(1, Ordering::Release);
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        Ok(Self {
            thread: Some(thread),
        })
    }
}

impl ThreadPool {
    /// Create a pool of `num_workers` threads named `{name}-{index}`
    pub fn new(name: &str, num_workers: usize) -> PlatformResult<Self> {
        let num_workers = num_workers.max(1);
        let (sender, receiver) = bounded(1024);
        let shutdown = Arc::new(AtomicBool::new(false));
        let task_count = Arc::new(AtomicUsize::new(0));

        let workers = (0..num_workers)
            .map(|id| {
                Worker::spawn(
                    format!("{name}-{id}"),
                    receiver.clone(),
                    shutdown.clone(),
                    task_count.clone(),
                )
            })
            .collect::<PlatformResult<Vec<_>>>()?;

        Ok(Self {
            workers,
            sender: Some(sender),
            shutdown,
            task_count,
        })
    }

    /// Get the number of workers
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Submit a task to the pool
    pub fn submit<F>(&self, task: F) -> PlatformResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(PlatformError::PoolShutdown)?;
        self.task_count.fetch_add(1, Ordering::Acquire);
        if sender.send(Box::new(task)).is_err() {
            self.task_count.fetch_sub(1, Ordering::Release);
            return Err(PlatformError::PoolShutdown);
        }
        Ok(())
    }

    /// Get the number of queued and running tasks
    pub fn pending_tasks(&self) -> usize {
        self.task_count.load(Ordering::Acquire)
    }

    /// Wait for all tasks to complete
    pub fn wait_all(&self) {
        while self.task_count.load(Ordering::Acquire) > 0 {
            thread::yield_now();
        }
    }

    /// Check if the pool is idle
    pub fn is_idle(&self) -> bool {
        self.pending_tasks() == 0
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        self.wait_all();
        self.shutdown.store(true, Ordering::Relaxed);

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

struct SlotShared<T> {
    value: Mutex<Option<T>>,
    in_flight: AtomicBool,
    idle: Condvar,
}

/// Single-holder monitor around a piece of state
///
/// `try_acquire` moves the state into a `SlotLease` and marks the slot in flight. Dropping the
/// lease, including during a panic unwind, moves the state back and clears the flag, so at
/// most one holder exists at any time.
pub struct ExclusiveSlot<T> {
    shared: Arc<SlotShared<T>>,
}

impl<T> Clone for ExclusiveSlot<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> ExclusiveSlot<T> {
    /// Create a slot holding `value`
    pub fn new(value: T) -> Self {
        Self {
            shared: Arc::new(SlotShared {
                value: Mutex::new(Some(value)),
                in_flight: AtomicBool::new(false),
                idle: Condvar::new(),
            }),
        }
    }

    /// Take the state if no lease is outstanding
    pub fn try_acquire(&self) -> Option<SlotLease<T>> {
        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let mut guard = self.shared.value.lock();
        match guard.take() {
            Some(value) => Some(SlotLease {
                value: ManuallyDrop::new(value),
                shared: self.shared.clone(),
            }),
            None => {
                self.shared.in_flight.store(false, Ordering::Release);
                None
            }
        }
    }

    /// Whether a lease is outstanding
    pub fn is_in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Block until no lease is outstanding
    pub fn wait_idle(&self) {
        let mut guard = self.shared.value.lock();
        while self.shared.in_flight.load(Ordering::Acquire) {
            self.shared.idle.wait(&mut guard);
        }
    }

    /// Block until no lease is outstanding or the timeout elapses, returning whether idle
    pub fn wait_idle_for(&self, timeout: Duration) -> bool {
        let mut guard = self.shared.value.lock();
        while self.shared.in_flight.load(Ordering::Acquire) {
            if self.shared.idle.wait_for(&mut guard, timeout).timed_out() {
                return !self.shared.in_flight.load(Ordering::Acquire);
            }
        }
        true
    }
}

/// Exclusive access to the state of an `ExclusiveSlot`
pub struct SlotLease<T> {
    value: ManuallyDrop<T>,
    shared: Arc<SlotShared<T>>,
}

impl<T> Deref for SlotLease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for SlotLease<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> Drop for SlotLease<T> {
    fn drop(&mut self) {
        // Safety: the value is taken exactly once, here, and never touched afterwards
        let value = unsafe { ManuallyDrop::take(&mut self.value) };

        let mut guard = self.shared.value.lock();
        *guard = Some(value);
        self.shared.in_flight.store(false, Ordering::Release);
        self.shared.idle.notify_all();
    }
}
