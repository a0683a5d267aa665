//! Subscription threads every follower runs next to its compute loop.

use std::{sync::Arc, thread};

use comms::{BufferPool, CommsErr, Transport, msg, specs, wait_any};
use log::debug;

use crate::{
    error::{Result, WorkerErr},
    state::{StepCell, WeightStore},
};

/// Spawns the step observer: a blocking receive loop on the control channel
/// that publishes every step word into `cell` and exits on the shutdown
/// sentinel, closing both shared states so the sibling threads unwind too.
pub fn spawn_observer<T: Transport + 'static>(
    transport: Arc<T>,
    cell: Arc<StepCell>,
    store: Arc<WeightStore>,
) -> thread::JoinHandle<std::result::Result<(), CommsErr>> {
    thread::spawn(move || {
        let pool = BufferPool::new(2, specs::CONTROL_SLOTS);
        let result = observe(transport.as_ref(), &pool, &cell, &store);
        cell.close();
        store.close();
        match result {
            Err(CommsErr::Closed) => {
                debug!("fabric closed under the step observer");
                Ok(())
            }
            other => other,
        }
    })
}

fn observe<T: Transport>(
    transport: &T,
    pool: &BufferPool,
    cell: &StepCell,
    store: &WeightStore,
) -> std::result::Result<(), CommsErr> {
    loop {
        let done = transport.recv_blocking(
            pool.checkout(),
            Some(specs::COORDINATOR_RANK),
            Some(specs::STEP_TAG),
            specs::CONTROL_CHANNEL,
        )?;
        let step = msg::read_step(&done.buf)?;
        if step == specs::STEP_SENTINEL {
            debug!("shutdown sentinel received");
            return Ok(());
        }

        // The store learns about the step before any waiter wakes, so a
        // take that then comes up empty can tell it was overtaken.
        store.note_step(step);
        cell.advance(step);
    }
}

/// Spawns the weight receiver: keeps `recvs` receives posted on every layer
/// channel, files each completion into the store and reposts its slot at
/// once. Runs until the transport closes.
pub fn spawn_weight_receiver<T: Transport + 'static>(
    transport: Arc<T>,
    pools: Vec<BufferPool>,
    recvs: usize,
    store: Arc<WeightStore>,
) -> thread::JoinHandle<std::result::Result<(), CommsErr>> {
    thread::spawn(move || {
        let result = receive_weights(transport.as_ref(), &pools, recvs, &store);
        store.close();
        match result {
            Err(CommsErr::Closed) => {
                debug!("fabric closed under the weight receiver");
                Ok(())
            }
            other => other,
        }
    })
}

fn receive_weights<T: Transport>(
    transport: &T,
    pools: &[BufferPool],
    recvs: usize,
    store: &WeightStore,
) -> std::result::Result<(), CommsErr> {
    let mut posted = Vec::with_capacity(pools.len() * recvs);
    for (layer, pool) in pools.iter().enumerate() {
        for _ in 0..recvs {
            posted.push(transport.post_recv(
                pool.checkout(),
                Some(specs::COORDINATOR_RANK),
                None,
                specs::layer_channel(layer),
            )?);
        }
    }

    loop {
        let done = wait_any(&mut posted)?;
        let layer = specs::layer_of(done.channel);
        posted.push(transport.post_recv(
            pools[layer].checkout(),
            Some(specs::COORDINATOR_RANK),
            None,
            done.channel,
        )?);
        store.put(layer, done.tag, done.buf);
    }
}

/// Joins a role thread, folding a panic into an error a caller can report.
pub(crate) fn join_role(
    handle: thread::JoinHandle<std::result::Result<(), CommsErr>>,
    role: &'static str,
) -> Result<()> {
    match handle.join() {
        Ok(result) => result.map_err(WorkerErr::from),
        Err(_) => Err(WorkerErr::ThreadPanicked { role }),
    }
}
