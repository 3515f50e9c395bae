//! Bounded FIFO between message arrival and processing

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Semaphore;

/// Bounded multi-producer/multi-consumer message queue
///
/// Free slots and ready items are tracked by two semaphores; the queue itself
/// sits behind a mutex that is never held across an await.
pub struct MessageBuffer<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    free_slots: Semaphore,
    ready: Semaphore,
}

impl<T> MessageBuffer<T> {
    /// Create an empty buffer holding at most `capacity` messages
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            free_slots: Semaphore::new(capacity),
            ready: Semaphore::new(0),
        }
    }

    /// Append a message, waiting while the buffer is full
    pub async fn put(&self, msg: T) {
        // The semaphores are never closed
        if let Ok(permit) = self.free_slots.acquire().await {
            permit.forget();
        }
        self.lock().push_back(msg);
        self.ready.add_permits(1);
    }

    /// Return a message to the head of the buffer without waiting
    ///
    /// # Errors
    ///
    /// Hands the message back if the buffer is full
    pub fn requeue(&self, msg: T) -> Result<(), T> {
        let Ok(permit) = self.free_slots.try_acquire() else {
            return Err(msg);
        };
        permit.forget();
        self.lock().push_front(msg);
        self.ready.add_permits(1);
        Ok(())
    }

    /// Remove the oldest message, waiting while the buffer is empty
    pub async fn get(&self) -> T {
        loop {
            if let Ok(permit) = self.ready.acquire().await {
                permit.forget();
            }
            if let Some(msg) = self.pop() {
                return msg;
            }
        }
    }

    /// Remove the oldest message if one is ready
    pub fn try_get(&self) -> Option<T> {
        let permit = self.ready.try_acquire().ok()?;
        permit.forget();
        self.pop()
    }

    /// Messages currently buffered
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no messages are buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of buffered messages
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn pop(&self) -> Option<T> {
        let msg = self.lock().pop_front();
        if msg.is_some() {
            self.free_slots.add_permits(1);
        }
        msg
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}
