//! Shared state between a follower's subscription threads and its compute
//! loop.

use std::collections::BTreeMap;

use comms::{PoolBuf, specs};
use parking_lot::{Condvar, Mutex};

/// Latest step word heard from the coordinator.
///
/// The observer thread publishes into the cell, the compute loop parks on
/// it. Closing wakes every waiter for good; there is no reopening.
pub struct StepCell {
    inner: Mutex<StepState>,
    moved: Condvar,
}

struct StepState {
    step: u32,
    closed: bool,
}

impl StepCell {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StepState {
                step: specs::STEP_SENTINEL,
                closed: false,
            }),
            moved: Condvar::new(),
        }
    }

    /// Publishes a newly observed step, waking every parked waiter.
    pub fn advance(&self, step: u32) {
        self.inner.lock().step = step;
        self.moved.notify_all();
    }

    /// Marks the stream over, waking every parked waiter.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.moved.notify_all();
    }

    pub fn get(&self) -> u32 {
        self.inner.lock().step
    }

    /// Whether the observed step moved past `current` or the cell closed.
    /// This is the mid-pass staleness probe.
    pub fn moved_past(&self, current: u32) -> bool {
        let inner = self.inner.lock();
        inner.closed || inner.step != current
    }

    /// Parks until the observed step differs from `current`. Returns `None`
    /// once the cell closes.
    pub fn wait_changed(&self, current: u32) -> Option<u32> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if inner.step != current {
                return Some(inner.step);
            }
            self.moved.wait(&mut inner);
        }
    }
}

impl Default for StepCell {
    fn default() -> Self {
        Self::new()
    }
}

/// What a blocked [`WeightStore::take`] resolved to.
#[derive(Debug)]
pub enum TakeOutcome {
    /// The payload posted for the requested step.
    Got(PoolBuf),
    /// The broadcast was overtaken; newer weights are on the way instead.
    Superseded,
    /// The store closed, the run is over.
    Closed,
}

/// Weight payloads keyed by (layer, step): the receiver thread files them,
/// the compute loop takes them.
///
/// The store also tracks the newest step heard on the control channel, so a
/// take blocked on a broadcast the coordinator has since cancelled can give
/// up instead of parking forever.
pub struct WeightStore {
    inner: Mutex<StoreState>,
    arrived: Condvar,
}

struct StoreState {
    slots: Vec<BTreeMap<u32, PoolBuf>>,
    observed: u32,
    closed: bool,
}

impl WeightStore {
    pub fn new(layers: usize) -> Self {
        Self {
            inner: Mutex::new(StoreState {
                slots: (0..layers).map(|_| BTreeMap::new()).collect(),
                observed: specs::STEP_SENTINEL,
                closed: false,
            }),
            arrived: Condvar::new(),
        }
    }

    /// Files a received payload. A duplicate for the same (layer, step)
    /// replaces the old one, recycling its buffer. Payloads filed after the
    /// store closed recycle immediately.
    pub fn put(&self, layer: usize, step: u32, buf: PoolBuf) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.slots[layer].insert(step, buf);
        }
        drop(inner);
        self.arrived.notify_all();
    }

    /// Records the newest step heard on the control channel and wakes
    /// blocked takes so they can notice being superseded.
    pub fn note_step(&self, step: u32) {
        self.inner.lock().observed = step;
        self.arrived.notify_all();
    }

    /// Closes the store, resolving blocked and future takes to
    /// [`TakeOutcome::Closed`]. Stored payloads recycle.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for slot in &mut inner.slots {
            slot.clear();
        }
        drop(inner);
        self.arrived.notify_all();
    }

    /// Parks until the payload for `(layer, step)` arrives. Gives up when
    /// the observed step moves past `step` or the store closes.
    pub fn take(&self, layer: usize, step: u32) -> TakeOutcome {
        let mut inner = self.inner.lock();
        loop {
            if let Some(buf) = inner.slots[layer].remove(&step) {
                return TakeOutcome::Got(buf);
            }
            if inner.closed {
                return TakeOutcome::Closed;
            }
            if inner.observed > step {
                return TakeOutcome::Superseded;
            }
            self.arrived.wait(&mut inner);
        }
    }

    /// Removes the newest stored payload for `layer`, dropping anything
    /// older. `None` when the layer holds nothing.
    pub fn take_newest(&self, layer: usize) -> Option<(u32, PoolBuf)> {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[layer];
        let (step, buf) = slot.pop_last()?;
        slot.clear();
        Some((step, buf))
    }

    /// Drops every payload older than `step`, recycling the buffers.
    pub fn prune_below(&self, step: u32) {
        let mut inner = self.inner.lock();
        for slot in &mut inner.slots {
            *slot = slot.split_off(&step);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use comms::BufferPool;

    use super::*;

    #[test]
    fn step_cell_wakes_parked_waiters() {
        let cell = Arc::new(StepCell::new());
        let parked = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.wait_changed(0))
        };

        thread::sleep(Duration::from_millis(20));
        cell.advance(3);
        assert_eq!(parked.join().unwrap(), Some(3));
        assert_eq!(cell.get(), 3);
        assert!(cell.moved_past(0));
        assert!(!cell.moved_past(3));
    }

    #[test]
    fn closing_the_cell_releases_waiters_for_good() {
        let cell = Arc::new(StepCell::new());
        let parked = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.wait_changed(0))
        };

        thread::sleep(Duration::from_millis(20));
        cell.close();
        assert_eq!(parked.join().unwrap(), None);
        assert_eq!(cell.wait_changed(7), None);
        assert!(cell.moved_past(0));
    }

    #[test]
    fn take_blocks_until_the_payload_is_filed() {
        let pool = BufferPool::new(2, 4);
        let store = Arc::new(WeightStore::new(1));

        let taker = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.take(0, 1))
        };

        thread::sleep(Duration::from_millis(20));
        let mut buf = pool.checkout();
        buf.write_floats(&[1.5]);
        store.put(0, 1, buf);

        match taker.join().unwrap() {
            TakeOutcome::Got(buf) => assert_eq!(buf.as_floats(), &[1.5]),
            other => panic!("expected the payload, got {other:?}"),
        }
    }

    #[test]
    fn a_newer_step_resolves_a_blocked_take_as_superseded() {
        let store = Arc::new(WeightStore::new(1));
        let taker = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.take(0, 1))
        };

        thread::sleep(Duration::from_millis(20));
        store.note_step(2);
        assert!(matches!(taker.join().unwrap(), TakeOutcome::Superseded));
    }

    #[test]
    fn take_newest_clears_out_older_payloads() {
        let pool = BufferPool::new(3, 4);
        let store = WeightStore::new(1);
        for step in [1, 2, 3] {
            let mut buf = pool.checkout();
            buf.write_floats(&[step as f32]);
            store.put(0, step, buf);
        }

        let (step, buf) = store.take_newest(0).unwrap();
        assert_eq!(step, 3);
        assert_eq!(buf.as_floats(), &[3.0]);
        drop(buf);

        // The two older payloads went back to the pool with the taken one.
        assert_eq!(pool.available(), 3);
        assert!(store.take_newest(0).is_none());
    }

    #[test]
    fn prune_recycles_everything_below_the_step() {
        let pool = BufferPool::new(3, 4);
        let store = WeightStore::new(1);
        for step in [1, 2, 3] {
            let mut buf = pool.checkout();
            buf.write_floats(&[step as f32]);
            store.put(0, step, buf);
        }

        store.prune_below(3);
        assert_eq!(pool.available(), 2);
        assert!(matches!(store.take(0, 3), TakeOutcome::Got(_)));
    }

    #[test]
    fn a_closed_store_fails_takes_and_swallows_puts() {
        let pool = BufferPool::new(1, 4);
        let store = WeightStore::new(1);
        store.close();

        store.put(0, 1, pool.checkout());
        assert_eq!(pool.available(), 1);
        assert!(matches!(store.take(0, 1), TakeOutcome::Closed));
    }
}
