//! Gradient intake running beside the round loop.

use comms::{BufferPool, CommsErr, PoolBuf, Rank, SyncQueue, Transport, specs, wait_any};

/// One item handed from the collector thread to the round loop.
#[derive(Debug)]
pub enum Collected {
    /// A payload landed on a layer channel, tagged with its sender's step.
    Gradient {
        layer: usize,
        step: u32,
        src: Rank,
        buf: PoolBuf,
    },
    /// The collector can no longer receive and has exited.
    Fault(CommsErr),
}

/// Receives gradients on every layer channel until the transport closes.
///
/// Keeps `recvs_per_channel` receives posted per channel at all times: each
/// completion is replaced before its payload is handed over, so a sending
/// worker never finds a channel unposted. The final `Fault` item doubles as
/// the exit notice, after it the queue goes quiet for good.
pub fn run<T: Transport>(
    transport: &T,
    pools: &[BufferPool],
    recvs_per_channel: usize,
    queue: &SyncQueue<Collected>,
) {
    let mut posted = Vec::with_capacity(pools.len() * recvs_per_channel);

    for (layer, pool) in pools.iter().enumerate() {
        for _ in 0..recvs_per_channel {
            let channel = specs::layer_channel(layer);
            match transport.post_recv(pool.checkout(), None, None, channel) {
                Ok(handle) => posted.push(handle),
                Err(err) => {
                    queue.push(Collected::Fault(err));
                    return;
                }
            }
        }
    }

    loop {
        let done = match wait_any(&mut posted) {
            Ok(done) => done,
            Err(err) => {
                queue.push(Collected::Fault(err));
                return;
            }
        };

        let layer = specs::layer_of(done.channel);
        match transport.post_recv(pools[layer].checkout(), None, None, done.channel) {
            Ok(handle) => posted.push(handle),
            Err(err) => {
                queue.push(Collected::Fault(err));
                return;
            }
        }

        queue.push(Collected::Gradient {
            layer,
            step: done.tag,
            src: done.src,
            buf: done.buf,
        });
    }
}
