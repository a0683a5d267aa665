//! The gradient-producing rank.

use std::{sync::Arc, thread, time::Instant};

use comms::{BufferPool, CommsErr, PoolBuf, RunSpec, SyncQueue, Transport, specs};
use log::{debug, info};
use machine_learning::{Dataset, Model};
use ndarray::s;

use crate::{
    error::{Result, WorkerErr},
    follow::{self, join_role},
    metrics::WorkerMetrics,
    state::{StepCell, TakeOutcome, WeightStore},
};

/// One message queued for the sender thread.
enum Outgoing {
    Gradient { layer: usize, step: u32, buf: PoolBuf },
    Stop,
}

/// A training rank: mirrors the coordinator's broadcasts and answers each
/// committed round with one gradient per layer, computed over its shard.
///
/// Four threads share the endpoint: the observer follows step words, the
/// receiver keeps weight receives posted, the sender drains the outgoing
/// queue, and the calling thread runs the model.
pub struct Worker<T: Transport> {
    transport: Arc<T>,
    spec: RunSpec,
    batch: usize,
    step: Arc<StepCell>,
    store: Arc<WeightStore>,
    outgoing: Arc<SyncQueue<Outgoing>>,
    pools: Vec<BufferPool>,
}

impl<T: Transport + 'static> Worker<T> {
    pub fn new(transport: Arc<T>, spec: RunSpec, batch: usize) -> Self {
        let pools = spec
            .layer_sizes
            .iter()
            .map(|&slots| BufferPool::new(spec.pool_capacity, slots))
            .collect();
        let layers = spec.layer_sizes.len();

        Self {
            transport,
            spec,
            batch,
            step: Arc::new(StepCell::new()),
            store: Arc::new(WeightStore::new(layers)),
            outgoing: Arc::new(SyncQueue::new()),
            pools,
        }
    }

    /// Trains until the coordinator broadcasts the shutdown sentinel.
    pub fn run<M: Model>(self, model: &mut M, shard: &Dataset) -> Result<WorkerMetrics> {
        if shard.is_empty() {
            return Err(WorkerErr::EmptyShard);
        }

        let observer = follow::spawn_observer(
            Arc::clone(&self.transport),
            Arc::clone(&self.step),
            Arc::clone(&self.store),
        );
        let receiver = follow::spawn_weight_receiver(
            Arc::clone(&self.transport),
            self.pools.clone(),
            self.spec.recvs_per_channel,
            Arc::clone(&self.store),
        );
        let sender = self.spawn_sender();

        let computed = self.compute_loop(model, shard);

        // Flush queued gradients before tearing the fabric down, then let
        // the blocked subscription threads unwind on the close.
        self.outgoing.push(Outgoing::Stop);
        let sent = join_role(sender, "sender");
        self.transport.close();
        let observed = join_role(observer, "observer");
        let received = join_role(receiver, "weight receiver");

        let metrics = computed?;
        sent?;
        observed?;
        received?;

        info!(
            "worker {} done: {} rounds, {} gradients, {} abandoned, {} superseded",
            self.transport.rank(),
            metrics.rounds,
            metrics.emitted,
            metrics.abandoned,
            metrics.superseded,
        );
        Ok(metrics)
    }

    fn spawn_sender(&self) -> thread::JoinHandle<std::result::Result<(), CommsErr>> {
        let transport = Arc::clone(&self.transport);
        let outgoing = Arc::clone(&self.outgoing);

        thread::spawn(move || {
            loop {
                let Outgoing::Gradient { layer, step, buf } = outgoing.pop() else {
                    return Ok(());
                };
                let sent = transport.send_blocking(
                    buf,
                    specs::COORDINATOR_RANK,
                    step,
                    specs::layer_channel(layer),
                );
                match sent {
                    Ok(_) => {}
                    // Shutdown can race the last gradients out; they were
                    // fire-and-forget anyway.
                    Err(CommsErr::Closed) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        })
    }

    fn compute_loop<M: Model>(&self, model: &mut M, shard: &Dataset) -> Result<WorkerMetrics> {
        let mut metrics = WorkerMetrics::default();
        let batch = self.batch.min(shard.len()).max(1);
        let layers = self.spec.layer_sizes.len();
        let mut cursor = 0;
        let mut local_step = specs::STEP_SENTINEL;

        'rounds: while let Some(step) = self.step.wait_changed(local_step) {
            local_step = step;

            for layer in 0..layers {
                match self.store.take(layer, step) {
                    TakeOutcome::Got(buf) => {
                        let expected = self.spec.layer_sizes[layer] * size_of::<f32>();
                        if buf.len() != expected {
                            return Err(WorkerErr::WeightsLengthMismatch {
                                layer,
                                got: buf.len(),
                                expected,
                            });
                        }
                        model.commit_weights(layer, buf.as_floats())?;
                    }
                    TakeOutcome::Superseded => {
                        debug!("weights for step {step} were overtaken, skipping the round");
                        metrics.bump_superseded();
                        continue 'rounds;
                    }
                    TakeOutcome::Closed => break 'rounds,
                }
            }
            self.store.prune_below(step);

            if cursor + batch > shard.len() {
                cursor = 0;
            }
            let x = shard.x().slice_move(s![cursor..cursor + batch, ..]);
            let y = shard.y().slice_move(s![cursor..cursor + batch, ..]);
            cursor += batch;

            let begun = Instant::now();
            let pass = model.forward(x, || self.still_current(step))?;
            if !pass.completed() {
                metrics.compute_time += begun.elapsed();
                metrics.bump_abandoned();
                continue;
            }

            let pass = model.backward(y, |layer, grad| {
                let mut buf = self.pools[layer].checkout();
                buf.write_floats(grad);
                self.outgoing.push(Outgoing::Gradient { layer, step, buf });
                metrics.bump_emitted();
                self.still_current(step)
            })?;
            metrics.compute_time += begun.elapsed();

            if pass.completed() {
                metrics.bump_round();
            } else {
                metrics.bump_abandoned();
            }
        }

        Ok(metrics)
    }

    /// Whether the round is still worth computing. Always true with the
    /// shortcircuit policy off.
    fn still_current(&self, step: u32) -> bool {
        !self.spec.shortcircuit || !self.step.moved_past(step)
    }
}
