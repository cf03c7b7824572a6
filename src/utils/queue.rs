//! Ordered, non-overlapping processing of enqueued items
//!
//! Items are processed one at a time in insertion order. The processor gets
//! the item and a [`Completion`] it must signal before the next item starts.
//! Items enqueued while a pass is running are picked up by the next pass.
//! The state mutex is never held while the processor runs.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::{runtime::Handle, sync::oneshot};
use tracing::{debug, warn};

/// Item waiting in the queue
#[derive(Debug)]
pub struct QueueItem<T> {
    pub payload: T,
    pub enqueued_at: Instant,
}

/// Completion signal handed to the processor with each item
pub struct Completion {
    tx: Option<oneshot::Sender<()>>,
}

impl Completion {
    pub fn complete(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        // Never leave the queue stuck on a forgotten completion
        if let Some(tx) = self.tx.take() {
            warn!("Queue item dropped without completion");
            let _ = tx.send(());
        }
    }
}

pub type DrainCallback = Box<dyn FnOnce() + Send>;

type Processor<T> = Arc<dyn Fn(QueueItem<T>, Completion) + Send + Sync>;

struct QueueState<T> {
    waiting: Vec<QueueItem<T>>,
    running: bool,
    paused: bool,
    on_drained: Vec<DrainCallback>,
}

struct QueueInner<T> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    processor: Processor<T>,
    runtime: Handle,
}

pub struct SequentialQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for SequentialQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> SequentialQueue<T> {
    /// Must be created inside a Tokio runtime; processing passes run on it.
    pub fn new<F>(name: &'static str, processor: F) -> Self
    where
        F: Fn(QueueItem<T>, Completion) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(QueueInner {
                name,
                state: Mutex::new(QueueState {
                    waiting: Vec::new(),
                    running: false,
                    paused: false,
                    on_drained: Vec::new(),
                }),
                processor: Arc::new(processor),
                runtime: Handle::current(),
            }),
        }
    }

    /// Appends an item and starts a pass when idle
    pub fn enqueue(&self, payload: T) {
        let start = {
            let mut state = self.inner.lock();
            state.waiting.push(QueueItem {
                payload,
                enqueued_at: Instant::now(),
            });
            if state.running || state.paused {
                false
            } else {
                state.running = true;
                true
            }
        };

        if start {
            self.spawn_pass();
        }
    }

    /// No new pass starts after the current one finishes
    pub fn pause(&self) {
        self.inner.lock().paused = true;
        debug!(queue = self.inner.name, "Queue paused");
    }

    /// Restarts processing. `on_drained` fires once the queue is idle,
    /// together with any callback registered earlier, in registration order.
    pub fn resume(&self, on_drained: Option<DrainCallback>) {
        let (start, ready) = {
            let mut state = self.inner.lock();
            state.paused = false;
            if let Some(callback) = on_drained {
                state.on_drained.push(callback);
            }

            if state.running {
                (false, Vec::new())
            } else if state.waiting.is_empty() {
                (false, mem::take(&mut state.on_drained))
            } else {
                state.running = true;
                (true, Vec::new())
            }
        };

        debug!(queue = self.inner.name, "Queue resumed");
        for callback in ready {
            callback();
        }
        if start {
            self.spawn_pass();
        }
    }

    /// Resumes the queue and waits until everything enqueued so far is processed
    pub async fn drain(&self) {
        let (tx, rx) = oneshot::channel();
        self.resume(Some(Box::new(move || {
            let _ = tx.send(());
        })));
        let _ = rx.await;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    fn spawn_pass(&self) {
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            inner.run().await;
        });
    }
}

impl<T: Send + 'static> QueueInner<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>) {
        loop {
            let batch = mem::take(&mut self.lock().waiting);
            debug!(queue = self.name, items = batch.len(), "Processing pass");

            for item in batch {
                let (tx, rx) = oneshot::channel();
                (self.processor)(item, Completion { tx: Some(tx) });
                let _ = rx.await;
            }

            let callbacks = {
                let mut state = self.lock();
                if !state.paused && !state.waiting.is_empty() {
                    None
                } else {
                    state.running = false;
                    if state.paused {
                        Some(Vec::new())
                    } else {
                        Some(mem::take(&mut state.on_drained))
                    }
                }
            };

            match callbacks {
                // More items arrived during the pass
                None => continue,
                Some(callbacks) => {
                    for callback in callbacks {
                        callback();
                    }
                    break;
                }
            }
        }
    }
}

impl<T> QueueItem<T> {
    pub fn age(&self) -> std::time::Duration {
        self.enqueued_at.elapsed()
    }
}
