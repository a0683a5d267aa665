//! Rank/tag/channel addressed messaging with non-blocking completion handles.
//!
//! A transport endpoint posts sends and receives that complete in the
//! background; handles own the leased buffer while the transfer is in flight
//! and give it back on completion, so a buffer always has exactly one owner:
//! the pool, the transport, or the application.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{CommsErr, Result},
    pool::PoolBuf,
};

/// A participant address. The coordinator is rank 0 by convention.
pub type Rank = u32;

/// Message tag; data-plane messages are tagged with the training step.
pub type Tag = u32;

/// A logical stream between two ranks with FIFO delivery per sender.
pub type ChannelId = u32;

/// One endpoint of a message fabric.
///
/// `post_send` and `post_recv` never block on the network; the blocking
/// variants are sugar for posting and waiting in place. `close` tears the
/// whole fabric down: every pending and future operation fails with
/// [`CommsErr::Closed`] so no thread stays parked.
pub trait Transport: Send + Sync {
    fn rank(&self) -> Rank;

    fn world(&self) -> u32;

    fn channels(&self) -> u32;

    /// Starts sending `buf` to `dest` and returns a handle owning it.
    fn post_send(&self, buf: PoolBuf, dest: Rank, tag: Tag, channel: ChannelId)
    -> Result<SendHandle>;

    /// Posts `buf` to receive a message matching `src` and `tag` on
    /// `channel`; `None` matches any sender / any tag.
    fn post_recv(
        &self,
        buf: PoolBuf,
        src: Option<Rank>,
        tag: Option<Tag>,
        channel: ChannelId,
    ) -> Result<RecvHandle>;

    fn close(&self);

    fn send_blocking(&self, buf: PoolBuf, dest: Rank, tag: Tag, channel: ChannelId) -> Result<PoolBuf> {
        self.post_send(buf, dest, tag, channel)?.wait()
    }

    fn recv_blocking(
        &self,
        buf: PoolBuf,
        src: Option<Rank>,
        tag: Option<Tag>,
        channel: ChannelId,
    ) -> Result<RecvDone> {
        self.post_recv(buf, src, tag, channel)?.wait()
    }
}

/// A completed receive: the posted buffer filled with the payload plus the
/// resolved sender address and tag.
#[derive(Debug)]
pub struct RecvDone {
    pub buf: PoolBuf,
    pub src: Rank,
    pub tag: Tag,
    pub channel: ChannelId,
}

/// Endpoint-wide completion signal.
///
/// Completions bump the epoch after writing their op state, waiters re-scan
/// whenever the epoch moves while they hold its lock, so a completion can
/// never slip between a scan and the park that follows it.
pub(crate) struct Signal {
    epoch: Mutex<u64>,
    moved: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Mutex::new(0),
            moved: Condvar::new(),
        })
    }

    pub(crate) fn bump(&self) {
        *self.epoch.lock() += 1;
        self.moved.notify_all();
    }
}

pub(crate) enum OpState<T> {
    Pending,
    Ready(T),
    Failed(CommsErr),
    Taken,
}

/// Shared completion cell of one posted operation.
pub(crate) struct OpCell<T> {
    state: Mutex<OpState<T>>,
    signal: Arc<Signal>,
}

impl<T> OpCell<T> {
    pub(crate) fn new(signal: Arc<Signal>) -> Self {
        Self {
            state: Mutex::new(OpState::Pending),
            signal,
        }
    }

    /// Resolves the op. The value is dropped if the op was abandoned first.
    pub(crate) fn complete(&self, value: T) {
        {
            let mut state = self.state.lock();
            if matches!(*state, OpState::Pending) {
                *state = OpState::Ready(value);
            }
        }
        self.signal.bump();
    }

    pub(crate) fn fail(&self, err: CommsErr) {
        {
            let mut state = self.state.lock();
            if matches!(*state, OpState::Pending) {
                *state = OpState::Failed(err);
            }
        }
        self.signal.bump();
    }

    /// Marks the op as consumed so a late completion is discarded.
    pub(crate) fn abandon(&self) {
        let mut state = self.state.lock();
        if matches!(*state, OpState::Pending) {
            *state = OpState::Taken;
        }
    }

    fn try_take(&self) -> Option<Result<T>> {
        let mut state = self.state.lock();

        match *state {
            OpState::Pending | OpState::Taken => None,
            _ => match std::mem::replace(&mut *state, OpState::Taken) {
                OpState::Ready(value) => Some(Ok(value)),
                OpState::Failed(err) => Some(Err(err)),
                _ => unreachable!(),
            },
        }
    }

    fn wait_take(&self) -> Result<T> {
        let signal = Arc::clone(&self.signal);
        let mut epoch = signal.epoch.lock();

        loop {
            if let Some(done) = self.try_take() {
                return done;
            }

            signal.moved.wait(&mut epoch);
        }
    }
}

pub(crate) struct SendOp {
    pub(crate) cell: OpCell<PoolBuf>,
    /// The outgoing buffer; taken by the backend at transfer time or by
    /// `cancel`, whichever comes first.
    pub(crate) payload: Mutex<Option<PoolBuf>>,
    pub(crate) src: Rank,
    pub(crate) tag: Tag,
    pub(crate) channel: ChannelId,
}

impl SendOp {
    pub(crate) fn new(signal: Arc<Signal>, buf: PoolBuf, src: Rank, tag: Tag, channel: ChannelId) -> Arc<Self> {
        Arc::new(Self {
            cell: OpCell::new(signal),
            payload: Mutex::new(Some(buf)),
            src,
            tag,
            channel,
        })
    }
}

/// Owner side of a posted send.
pub struct SendHandle {
    pub(crate) op: Arc<SendOp>,
}

impl SendHandle {
    /// Parks until the transfer completes and returns the buffer.
    pub fn wait(self) -> Result<PoolBuf> {
        self.op.cell.wait_take()
    }

    /// Revokes the transfer if it has not happened yet.
    ///
    /// Returns the buffer either way: immediately when the payload was still
    /// queued, otherwise after the in-progress transfer finishes.
    pub fn cancel(self) -> Result<PoolBuf> {
        if let Some(buf) = self.op.payload.lock().take() {
            self.op.cell.abandon();
            return Ok(buf);
        }

        self.op.cell.wait_take()
    }
}

pub(crate) struct RecvOp {
    pub(crate) cell: OpCell<RecvDone>,
    /// The posted buffer; taken by the backend when a payload lands in it.
    pub(crate) slab: Mutex<Option<PoolBuf>>,
    pub(crate) src: Option<Rank>,
    pub(crate) tag: Option<Tag>,
}

impl RecvOp {
    pub(crate) fn new(signal: Arc<Signal>, buf: PoolBuf, src: Option<Rank>, tag: Option<Tag>) -> Arc<Self> {
        Arc::new(Self {
            cell: OpCell::new(signal),
            slab: Mutex::new(Some(buf)),
            src,
            tag,
        })
    }

    pub(crate) fn matches(&self, src: Rank, tag: Tag) -> bool {
        self.src.is_none_or(|s| s == src) && self.tag.is_none_or(|t| t == tag)
    }
}

/// Owner side of a posted receive.
pub struct RecvHandle {
    pub(crate) op: Arc<RecvOp>,
}

impl RecvHandle {
    /// Parks until a matching message lands in the posted buffer.
    pub fn wait(self) -> Result<RecvDone> {
        self.op.cell.wait_take()
    }
}

/// Parks until any of `handles` completes, removes it from the vec and
/// returns its outcome. All handles must come from the same endpoint.
pub fn wait_any(handles: &mut Vec<RecvHandle>) -> Result<RecvDone> {
    assert!(!handles.is_empty(), "wait_any over no posted receives");

    let signal = Arc::clone(&handles[0].op.cell.signal);
    let mut epoch = signal.epoch.lock();

    loop {
        for i in 0..handles.len() {
            if let Some(done) = handles[i].op.cell.try_take() {
                handles.swap_remove(i);
                return done;
            }
        }

        signal.moved.wait(&mut epoch);
    }
}
