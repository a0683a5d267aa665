//! Multi-process transport over blocking TCP sockets.
//!
//! Rank `i` listens on `addrs[i]`, accepts connections from every higher
//! rank and dials every lower one, so each pair of ranks shares exactly one
//! stream. A connecting peer introduces itself with a 4-byte rank hello.
//! Each stream gets a writer thread draining an outbound queue (which is
//! where `cancel` can still revoke a frame) and a reader thread decoding
//! frames into posted buffers. Frames that arrive before a matching receive
//! are staged on the heap; staging stays bounded because a sender with
//! nothing left in its pool parks until a buffer comes back.

use std::{
    collections::VecDeque,
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    error::{CommsErr, Result},
    msg::{FRAME_HEADER_LEN, decode_frame_header, encode_frame_header},
    pool::PoolBuf,
    queue::SyncQueue,
    transport::{
        ChannelId, Rank, RecvDone, RecvHandle, RecvOp, SendHandle, SendOp, Signal, Tag, Transport,
    },
};

const CONNECT_RETRY: Duration = Duration::from_millis(50);
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

/// Upper bound on a single frame; anything bigger is a corrupt stream.
const MAX_FRAME_LEN: usize = 256 << 20;

enum WriterItem {
    Op(Arc<SendOp>),
    Shutdown,
}

struct Peer {
    outbound: Arc<SyncQueue<WriterItem>>,
    stream: TcpStream,
}

struct Staged {
    src: Rank,
    tag: Tag,
    data: Vec<u8>,
}

struct TcpState {
    /// Posted receives per channel, in post order.
    posted: Vec<VecDeque<Arc<RecvOp>>>,
    /// Frames that arrived before a matching receive, per channel.
    staged: Vec<VecDeque<Staged>>,
}

struct TcpShared {
    rank: Rank,
    world: u32,
    channels: u32,
    signal: Arc<Signal>,
    closed: AtomicBool,
    state: Mutex<TcpState>,
    peers: Vec<Option<Peer>>,
}

/// One rank's endpoint of a fully-connected TCP world.
pub struct TcpTransport {
    shared: Arc<TcpShared>,
}

impl TcpTransport {
    /// Binds `addrs[rank]`, meets every other rank and starts the per-peer
    /// reader and writer threads. Returns once the world is fully wired.
    pub fn connect(rank: Rank, addrs: &[String], channels: u32) -> Result<Self> {
        let world = addrs.len() as u32;
        if rank >= world {
            return Err(CommsErr::RankOutOfRange { rank, world });
        }

        let listener = TcpListener::bind(&addrs[rank as usize])?;
        let mut streams: Vec<Option<TcpStream>> = (0..world).map(|_| None).collect();

        // Dial the lower ranks first; they are already accepting by the
        // time their own dials went through.
        for peer in 0..rank {
            let stream = dial(&addrs[peer as usize])?;
            streams[peer as usize] = Some(hello(stream, rank)?);
        }

        for _ in rank + 1..world {
            let (stream, _) = listener.accept()?;
            let peer = read_hello(&stream)?;
            if peer <= rank || peer >= world {
                return Err(CommsErr::RankOutOfRange { rank: peer, world });
            }
            if streams[peer as usize].is_some() {
                return Err(CommsErr::DuplicateRank { rank: peer });
            }
            streams[peer as usize] = Some(stream);
        }

        let peers = streams
            .into_iter()
            .map(|stream| {
                stream.map(|stream| Peer {
                    outbound: Arc::new(SyncQueue::new()),
                    stream,
                })
            })
            .collect();

        let shared = Arc::new(TcpShared {
            rank,
            world,
            channels,
            signal: Signal::new(),
            closed: AtomicBool::new(false),
            state: Mutex::new(TcpState {
                posted: (0..channels).map(|_| VecDeque::new()).collect(),
                staged: (0..channels).map(|_| VecDeque::new()).collect(),
            }),
            peers,
        });

        for peer in 0..world {
            let Some(entry) = &shared.peers[peer as usize] else {
                continue;
            };

            let writer_stream = entry.stream.try_clone()?;
            let writer_queue = Arc::clone(&entry.outbound);
            let writer_shared = Arc::clone(&shared);
            thread::spawn(move || write_loop(writer_shared, writer_queue, writer_stream));

            let reader_stream = entry.stream.try_clone()?;
            let reader_shared = Arc::clone(&shared);
            thread::spawn(move || read_loop(reader_shared, reader_stream, peer));
        }

        Ok(Self { shared })
    }
}

fn dial(addr: &str) -> Result<TcpStream> {
    let deadline = Instant::now() + CONNECT_DEADLINE;

    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => return Err(e.into()),
            Err(_) => thread::sleep(CONNECT_RETRY),
        }
    }
}

fn hello(mut stream: TcpStream, rank: Rank) -> Result<TcpStream> {
    stream.set_nodelay(true)?;
    stream.write_all(&rank.to_be_bytes())?;
    Ok(stream)
}

fn read_hello(mut stream: &TcpStream) -> Result<Rank> {
    stream.set_nodelay(true)?;
    let mut word = [0u8; 4];
    stream.read_exact(&mut word)?;
    Ok(Rank::from_be_bytes(word))
}

impl TcpShared {
    /// Poisons the endpoint: fails every posted receive, tells the writers
    /// to wind down and shuts the sockets so the readers unblock.
    fn poison(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut state = self.state.lock();
            for posted in &mut state.posted {
                for recv in posted.drain(..) {
                    drop(recv.slab.lock().take());
                    recv.cell.fail(CommsErr::Closed);
                }
            }
            for staged in &mut state.staged {
                staged.clear();
            }
        }

        for peer in self.peers.iter().flatten() {
            peer.outbound.push(WriterItem::Shutdown);
            let _ = peer.stream.shutdown(std::net::Shutdown::Both);
        }

        self.signal.bump();
    }

    /// Hands a decoded frame to the oldest matching posted receive, or
    /// stages it. `data` must hold exactly the frame payload.
    fn place(&self, peer: Rank, channel: ChannelId, tag: Tag, data: Vec<u8>) {
        let mut state = self.state.lock();
        let posted = &mut state.posted[channel as usize];

        if let Some(i) = posted.iter().position(|recv| recv.matches(peer, tag)) {
            let recv = posted.remove(i).unwrap();
            drop(state);
            complete_recv(&recv, peer, channel, tag, &data);
        } else {
            state.staged[channel as usize].push_back(Staged {
                src: peer,
                tag,
                data,
            });
        }
    }
}

/// Fills the posted slab from `data` and resolves the receive.
fn complete_recv(recv: &RecvOp, src: Rank, channel: ChannelId, tag: Tag, data: &[u8]) {
    // Receives leave the posted list before completion, so the slab is
    // still in place here.
    let mut slab = recv.slab.lock().take().unwrap();

    if data.len() > slab.byte_capacity() {
        recv.cell.fail(CommsErr::Truncated {
            got: data.len(),
            capacity: slab.byte_capacity(),
        });
        return;
    }

    slab.write_bytes(data);
    recv.cell.complete(RecvDone {
        buf: slab,
        src,
        tag,
        channel,
    });
}

fn write_loop(shared: Arc<TcpShared>, queue: Arc<SyncQueue<WriterItem>>, mut stream: TcpStream) {
    loop {
        match queue.pop() {
            WriterItem::Shutdown => break,
            WriterItem::Op(op) => {
                let Some(payload) = op.payload.lock().take() else {
                    continue;
                };

                let header = encode_frame_header(op.channel, op.tag, payload.len());
                let wrote = stream
                    .write_all(&header)
                    .and_then(|_| stream.write_all(payload.as_bytes()));

                match wrote {
                    Ok(()) => op.cell.complete(payload),
                    Err(e) => {
                        op.cell.fail(e.into());
                        shared.poison();
                        break;
                    }
                }
            }
        }
    }

    // Anything still queued can no longer reach the wire.
    while let Some(item) = queue.try_pop() {
        if let WriterItem::Op(op) = item {
            drop(op.payload.lock().take());
            op.cell.fail(CommsErr::Closed);
        }
    }
}

fn read_loop(shared: Arc<TcpShared>, mut stream: TcpStream, peer: Rank) {
    loop {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if stream.read_exact(&mut header).is_err() {
            shared.poison();
            return;
        }

        let (channel, tag, len) = decode_frame_header(&header);
        if channel >= shared.channels || len > MAX_FRAME_LEN {
            shared.poison();
            return;
        }

        let mut data = vec![0u8; len];
        if stream.read_exact(&mut data).is_err() {
            shared.poison();
            return;
        }

        shared.place(peer, channel, tag, data);
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.shared.rank
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
        if dest >= self.shared.world {
            return Err(CommsErr::RankOutOfRange {
                rank: dest,
                world: self.shared.world,
            });
        }
        if dest == self.shared.rank {
            return Err(CommsErr::SelfSend { rank: dest });
        }
        if channel >= self.shared.channels {
            return Err(CommsErr::ChannelOutOfRange {
                channel,
                channels: self.shared.channels,
            });
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CommsErr::Closed);
        }

        let signal = Arc::clone(&self.shared.signal);
        let op = SendOp::new(signal, buf, self.shared.rank, tag, channel);

        // Wired in `connect`: every rank but ours has a peer entry.
        let peer = self.shared.peers[dest as usize].as_ref().unwrap();
        peer.outbound.push(WriterItem::Op(Arc::clone(&op)));

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
            if src >= self.shared.world {
                return Err(CommsErr::RankOutOfRange {
                    rank: src,
                    world: self.shared.world,
                });
            }
        }
        if channel >= self.shared.channels {
            return Err(CommsErr::ChannelOutOfRange {
                channel,
                channels: self.shared.channels,
            });
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CommsErr::Closed);
        }

        let signal = Arc::clone(&self.shared.signal);
        let op = RecvOp::new(signal, buf, src, tag);

        let mut state = self.shared.state.lock();
        let staged = &mut state.staged[channel as usize];

        let hit = staged.iter().position(|frame| {
            src.is_none_or(|s| s == frame.src) && tag.is_none_or(|t| t == frame.tag)
        });

        if let Some(i) = hit {
            let frame = staged.remove(i).unwrap();
            drop(state);
            complete_recv(&op, frame.src, channel, frame.tag, &frame.data);
        } else {
            state.posted[channel as usize].push_back(Arc::clone(&op));
        }

        Ok(RecvHandle { op })
    }

    fn close(&self) {
        self.shared.poison();
    }
}
