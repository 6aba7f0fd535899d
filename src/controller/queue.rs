//! Coalescing work queue.
//!
//! Mirrors the usual controller work queue contract: `add` is idempotent while
//! a key is queued or in flight, `get` parks the worker until work or
//! shutdown, and `done` releases a key and re-queues it if it went dirty
//! during processing. One key is never checked out by two workers at once.

use std::collections::{HashSet, VecDeque};

use tokio::sync::{Mutex, Notify};
use tracing::trace;

use crate::controller::types::ObjectKey;

pub struct WorkQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    wakeup: Notify,
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    shutting_down: bool,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState::default()),
            wakeup: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Schedules a key for processing. A key that is already queued or in
    /// flight is only marked dirty so it runs once more after the current
    /// pass.
    pub async fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            trace!(queue = self.name, key = %key, "queue shutting down, dropping key");
            return;
        }
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            // done() re-queues dirty in-flight keys.
            return;
        }
        state.order.push_back(key);
        drop(state);
        self.wakeup.notify_one();
    }

    /// Blocks until a key is available or the queue is shut down. Returns
    /// `None` once shut down and drained. Every `Some` must be paired with a
    /// `done` call.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let wakeup = self.wakeup.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.order.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            wakeup.await;
        }
    }

    /// Releases a key checked out by `get`, re-queueing it if it was added
    /// again while in flight.
    pub async fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.order.push_back(key.clone());
            drop(state);
            self.wakeup.notify_one();
        }
    }

    /// Stops accepting new keys and unblocks all parked `get` calls once the
    /// remaining items are drained.
    pub async fn shutdown(&self) {
        self.state.lock().await.shutting_down = true;
        self.wakeup.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.state.lock().await.order.len()
    }
}
