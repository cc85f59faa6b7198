//! FIFO of job ids waiting for the render worker.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Holds ids only; payloads stay in the registry.
#[derive(Default)]
pub struct SubmissionQueue {
    pending: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl SubmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `id` and wakes the worker. Callers must have stored the QUEUED
    /// record before calling this.
    pub fn enqueue(&self, id: String) {
        self.lock().push_back(id);
        // Stores a permit when the worker is busy, so a wake-up issued while
        // it is finishing a drain pass is never lost.
        self.notify.notify_one();
    }

    pub fn pop_front(&self) -> Option<String> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.lock().iter().position(|queued| queued == id)
    }

    /// Resolves once an `enqueue` happened since the last wake-up.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
