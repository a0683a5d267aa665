//! In-process fabric for tests and single-process simulation.
//!
//! Every rank lives in the same address space; a send copies its payload into
//! the receiver's posted buffer at match time. A send with no matching
//! receive parks inside the fabric still holding the sender's buffer, which
//! is exactly how pool exhaustion throttles a producer that outruns its peer.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;

use crate::{
    error::{CommsErr, Result},
    pool::PoolBuf,
    transport::{
        ChannelId, Rank, RecvDone, RecvHandle, RecvOp, SendHandle, SendOp, Signal, Tag, Transport,
    },
};

/// A world of in-process endpoints over shared mailboxes.
pub struct LocalFabric {
    shared: Arc<FabricShared>,
}

struct FabricShared {
    world: u32,
    channels: u32,
    signals: Vec<Arc<Signal>>,
    state: Mutex<FabricState>,
}

struct FabricState {
    closed: bool,
    taken: Vec<bool>,
    /// One mailbox per (rank, channel).
    boxes: Vec<Mailbox>,
}

#[derive(Default)]
struct Mailbox {
    /// Receives posted by the owning rank, in post order.
    posted: VecDeque<Arc<RecvOp>>,
    /// Sends waiting for a matching receive, in arrival order.
    parked: VecDeque<Arc<SendOp>>,
}

impl LocalFabric {
    /// Creates a fabric of `world` ranks with `channels` channels each.
    pub fn new(world: u32, channels: u32) -> Self {
        let boxes = (0..world * channels).map(|_| Mailbox::default()).collect();

        Self {
            shared: Arc::new(FabricShared {
                world,
                channels,
                signals: (0..world).map(|_| Signal::new()).collect(),
                state: Mutex::new(FabricState {
                    closed: false,
                    taken: vec![false; world as usize],
                    boxes,
                }),
            }),
        }
    }

    /// Claims the endpoint of `rank`. Each rank can be claimed once.
    pub fn endpoint(&self, rank: Rank) -> Result<LocalEndpoint> {
        if rank >= self.shared.world {
            return Err(CommsErr::RankOutOfRange {
                rank,
                world: self.shared.world,
            });
        }

        let mut state = self.shared.state.lock();
        if std::mem::replace(&mut state.taken[rank as usize], true) {
            return Err(CommsErr::DuplicateRank { rank });
        }

        Ok(LocalEndpoint {
            rank,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// One rank's endpoint on a [`LocalFabric`].
pub struct LocalEndpoint {
    rank: Rank,
    shared: Arc<FabricShared>,
}

impl FabricShared {
    fn mailbox_index(&self, rank: Rank, channel: ChannelId) -> usize {
        rank as usize * self.channels as usize + channel as usize
    }

    fn check_channel(&self, channel: ChannelId) -> Result<()> {
        if channel >= self.channels {
            return Err(CommsErr::ChannelOutOfRange {
                channel,
                channels: self.channels,
            });
        }
        Ok(())
    }

    fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank >= self.world {
            return Err(CommsErr::RankOutOfRange {
                rank,
                world: self.world,
            });
        }
        Ok(())
    }

    /// Copies the parked payload into the posted buffer and resolves both
    /// sides. Must run with the fabric lock held so slab and payload are
    /// still owned by the fabric.
    fn deliver(recv: &RecvOp, send: &SendOp, payload: PoolBuf, channel: ChannelId) {
        // Posted receives keep their slab until delivery or close, and both
        // happen under the fabric lock.
        let mut slab = recv.slab.lock().take().unwrap();

        if payload.len() > slab.byte_capacity() {
            recv.cell.fail(CommsErr::Truncated {
                got: payload.len(),
                capacity: slab.byte_capacity(),
            });
            send.cell.complete(payload);
            return;
        }

        slab.write_bytes(payload.as_bytes());
        recv.cell.complete(RecvDone {
            buf: slab,
            src: send.src,
            tag: send.tag,
            channel,
        });
        send.cell.complete(payload);
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if std::mem::replace(&mut state.closed, true) {
            return;
        }

        for mailbox in &mut state.boxes {
            for recv in mailbox.posted.drain(..) {
                drop(recv.slab.lock().take());
                recv.cell.fail(CommsErr::Closed);
            }
            for send in mailbox.parked.drain(..) {
                drop(send.payload.lock().take());
                send.cell.fail(CommsErr::Closed);
            }
        }
        drop(state);

        for signal in &self.signals {
            signal.bump();
        }
    }
}

impl Transport for LocalEndpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world(&self) -> u32 {
        self.shared.world
    }

    fn channels(&self) -> u32 {
        self.shared.channels
    }

    fn post_send(
        &self,
        buf: PoolBuf,
        dest: Rank,
        tag: Tag,
        channel: ChannelId,
    ) -> Result<SendHandle> {
        self.shared.check_rank(dest)?;
        self.shared.check_channel(channel)?;

        let signal = Arc::clone(&self.shared.signals[self.rank as usize]);
        let op = SendOp::new(signal, buf, self.rank, tag, channel);

        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(CommsErr::Closed);
        }

        let idx = self.shared.mailbox_index(dest, channel);
        let mailbox = &mut state.boxes[idx];

        // Oldest matching posted receive wins.
        let found = mailbox
            .posted
            .iter()
            .position(|recv| recv.matches(self.rank, tag));

        match found {
            Some(i) => {
                let recv = mailbox.posted.remove(i).unwrap();
                let payload = op.payload.lock().take().unwrap();
                FabricShared::deliver(&recv, &op, payload, channel);
            }
            None => mailbox.parked.push_back(Arc::clone(&op)),
        }

        Ok(SendHandle { op })
    }

    fn post_recv(
        &self,
        buf: PoolBuf,
        src: Option<Rank>,
        tag: Option<Tag>,
        channel: ChannelId,
    ) -> Result<RecvHandle> {
        if let Some(src) = src {
            self.shared.check_rank(src)?;
        }
        self.shared.check_channel(channel)?;

        let signal = Arc::clone(&self.shared.signals[self.rank as usize]);
        let op = RecvOp::new(signal, buf, src, tag);

        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(CommsErr::Closed);
        }

        let idx = self.shared.mailbox_index(self.rank, channel);
        let mailbox = &mut state.boxes[idx];

        // Walk parked sends in arrival order; entries whose payload was
        // cancelled away are dropped on the way.
        let mut i = 0;
        while i < mailbox.parked.len() {
            let entry = &mailbox.parked[i];
            let hit = src.is_none_or(|s| s == entry.src) && tag.is_none_or(|t| t == entry.tag);
            if !hit {
                i += 1;
                continue;
            }

            let send = mailbox.parked.remove(i).unwrap();
            let Some(payload) = send.payload.lock().take() else {
                continue;
            };

            FabricShared::deliver(&op, &send, payload, channel);
            return Ok(RecvHandle { op });
        }

        mailbox.posted.push_back(Arc::clone(&op));
        Ok(RecvHandle { op })
    }

    fn close(&self) {
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    fn pair() -> (LocalEndpoint, LocalEndpoint, BufferPool) {
        let fabric = LocalFabric::new(2, 2);
        let a = fabric.endpoint(0).unwrap();
        let b = fabric.endpoint(1).unwrap();
        (a, b, BufferPool::new(8, 4))
    }

    #[test]
    fn endpoint_claims_are_exclusive() {
        let fabric = LocalFabric::new(2, 1);
        fabric.endpoint(0).unwrap();
        assert!(matches!(
            fabric.endpoint(0),
            Err(CommsErr::DuplicateRank { rank: 0 })
        ));
        assert!(matches!(
            fabric.endpoint(5),
            Err(CommsErr::RankOutOfRange { rank: 5, world: 2 })
        ));
    }

    #[test]
    fn send_then_recv_delivers() {
        let (a, b, pool) = pair();

        let mut buf = pool.checkout();
        buf.write_floats(&[1.0, 2.0]);
        let send = a.post_send(buf, 1, 7, 0).unwrap();

        let done = b
            .recv_blocking(pool.checkout(), Some(0), Some(7), 0)
            .unwrap();
        assert_eq!(done.buf.as_floats(), &[1.0, 2.0]);
        assert_eq!(done.src, 0);
        assert_eq!(done.tag, 7);

        send.wait().unwrap();
    }

    #[test]
    fn recv_then_send_delivers() {
        let (a, b, pool) = pair();

        let recv = b.post_recv(pool.checkout(), None, None, 1).unwrap();

        let mut buf = pool.checkout();
        buf.write_floats(&[5.0]);
        a.send_blocking(buf, 1, 3, 1).unwrap();

        let done = recv.wait().unwrap();
        assert_eq!(done.buf.as_floats(), &[5.0]);
        assert_eq!(done.tag, 3);
        assert_eq!(done.channel, 1);
    }

    #[test]
    fn tag_selective_receive_skips_other_tags() {
        let (a, b, pool) = pair();

        let mut first = pool.checkout();
        first.write_floats(&[1.0]);
        let mut second = pool.checkout();
        second.write_floats(&[2.0]);

        let s1 = a.post_send(first, 1, 1, 0).unwrap();
        let s2 = a.post_send(second, 1, 2, 0).unwrap();

        // Asking for tag 2 must not consume the earlier tag-1 send.
        let done = b
            .recv_blocking(pool.checkout(), Some(0), Some(2), 0)
            .unwrap();
        assert_eq!(done.buf.as_floats(), &[2.0]);

        let done = b.recv_blocking(pool.checkout(), Some(0), None, 0).unwrap();
        assert_eq!(done.buf.as_floats(), &[1.0]);

        s1.wait().unwrap();
        s2.wait().unwrap();
    }

    #[test]
    fn wildcard_receive_takes_oldest_parked_send() {
        let (a, b, pool) = pair();

        for v in [1.0, 2.0, 3.0] {
            let mut buf = pool.checkout();
            buf.write_floats(&[v]);
            a.post_send(buf, 1, v as Tag, 0).unwrap();
        }

        for expect in [1.0, 2.0, 3.0] {
            let done = b.recv_blocking(pool.checkout(), None, None, 0).unwrap();
            assert_eq!(done.buf.as_floats(), &[expect]);
        }
    }

    #[test]
    fn cancel_returns_the_parked_buffer() {
        let (a, b, pool) = pair();

        let mut buf = pool.checkout();
        buf.write_floats(&[9.0]);
        let send = a.post_send(buf, 1, 1, 0).unwrap();

        let buf = send.cancel().unwrap();
        assert_eq!(buf.as_floats(), &[9.0]);

        // The cancelled payload must be unreceivable.
        let mut other = pool.checkout();
        other.write_floats(&[4.0]);
        a.post_send(other, 1, 2, 0).unwrap();

        let done = b.recv_blocking(pool.checkout(), Some(0), None, 0).unwrap();
        assert_eq!(done.buf.as_floats(), &[4.0]);
    }

    #[test]
    fn oversized_payload_fails_the_receiver() {
        let fabric = LocalFabric::new(2, 1);
        let a = fabric.endpoint(0).unwrap();
        let b = fabric.endpoint(1).unwrap();

        let big = BufferPool::new(1, 8);
        let small = BufferPool::new(1, 2);

        let recv = b.post_recv(small.checkout(), None, None, 0).unwrap();

        let mut buf = big.checkout();
        buf.write_floats(&[0.0; 8]);
        let send = a.post_send(buf, 1, 0, 0).unwrap();

        assert!(matches!(
            recv.wait(),
            Err(CommsErr::Truncated {
                got: 32,
                capacity: 8
            })
        ));
        // The sender still gets its buffer back.
        send.wait().unwrap();
    }

    #[test]
    fn close_poisons_pending_operations() {
        let (a, b, pool) = pair();

        let recv = b.post_recv(pool.checkout(), None, None, 0).unwrap();
        let send = a.post_send(pool.checkout(), 1, 9, 1).unwrap();

        a.close();

        assert!(matches!(recv.wait(), Err(CommsErr::Closed)));
        assert!(matches!(send.wait(), Err(CommsErr::Closed)));
        assert!(matches!(
            b.post_recv(pool.checkout(), None, None, 0),
            Err(CommsErr::Closed)
        ));

        // Poisoned operations gave their buffers back to the pool.
        assert_eq!(pool.available(), pool.capacity());
    }
}
