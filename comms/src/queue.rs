use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// An unbounded multi-producer multi-consumer FIFO.
///
/// `push` never blocks; `pop` parks the calling thread until an item exists.
/// Every push wakes all parked poppers, the queue guarantees progress but not
/// which popper wins. Backpressure is not this type's job, the buffer pools
/// bound how many items can exist at once.
pub struct SyncQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> SyncQueue<T> {
    /// Creates an empty `SyncQueue`.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Appends `item` at the back and wakes every thread parked in `pop`.
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.notify_all();
    }

    /// Removes the oldest item, parking the calling thread until one exists.
    pub fn pop(&self) -> T {
        let mut items = self.items.lock();

        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }

            self.available.wait(&mut items);
        }
    }

    /// Removes the oldest item if the queue is non-empty.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for SyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
