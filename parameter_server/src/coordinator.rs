//! The rank that owns the canonical weights and drives the rounds.
//!
//! A round is: notify every follower of the current step, broadcast each
//! layer's weights tagged with that step, pop gradients off the collector's
//! queue until every layer reached its quorum, apply the accumulated update,
//! advance. The evaluator mirrors the broadcasts without ever answering, so
//! it costs the round loop nothing.

use std::{sync::Arc, thread};

use comms::{BufferPool, CommsErr, Rank, RunSpec, SyncQueue, Transport, msg, specs};
use log::{debug, info, warn};
use machine_learning::{Dataset, Model};
use rayon::prelude::*;

use crate::{
    collector::{self, Collected},
    error::{PsErr, Result},
    metrics::TrainMetrics,
    slot::SendSlot,
};

/// Elementwise accumulation is split at this width before rayon fans out.
const FOLD_CHUNK: usize = 4096;

pub struct Coordinator<T: Transport> {
    transport: Arc<T>,
    spec: RunSpec,
    /// One pool per trainable layer, serving that layer's sends and receives.
    pools: Vec<BufferPool>,
    control_pool: BufferPool,
    /// Step broadcast slots, one per follower rank.
    step_slots: Vec<SendSlot>,
    /// Weight broadcast slots, `[layer][follower]`.
    weight_slots: Vec<Vec<SendSlot>>,
    /// Per-layer gradient accumulators for the round in progress.
    sums: Vec<Vec<f32>>,
    counts: Vec<usize>,
    queue: Arc<SyncQueue<Collected>>,
}

impl<T: Transport + 'static> Coordinator<T> {
    pub fn new(transport: Arc<T>, spec: RunSpec) -> Result<Self> {
        spec.validate()?;

        let followers = spec.world() as usize - 1;
        let pools = spec
            .layer_sizes
            .iter()
            .map(|&slots| BufferPool::new(spec.pool_capacity, slots))
            .collect();
        let step_slots = (0..followers).map(|_| SendSlot::new()).collect();
        let weight_slots = spec
            .layer_sizes
            .iter()
            .map(|_| (0..followers).map(|_| SendSlot::new()).collect())
            .collect();
        let sums = spec.layer_sizes.iter().map(|&n| vec![0.0; n]).collect();
        let counts = vec![0; spec.layer_sizes.len()];

        Ok(Self {
            transport,
            control_pool: BufferPool::new(spec.world() as usize + 1, specs::CONTROL_SLOTS),
            pools,
            step_slots,
            weight_slots,
            sums,
            counts,
            queue: Arc::new(SyncQueue::new()),
            spec,
        })
    }

    /// Drives the whole run, training `model` in place.
    ///
    /// `data` is only read at the metrics cadence; the gradients come from
    /// the workers. Returns the run's counters and evaluation records.
    pub fn run<M: Model>(mut self, model: &mut M, data: &Dataset) -> Result<TrainMetrics> {
        debug_assert_eq!(model.trainable_layers(), self.spec.layer_sizes.len());

        let collector = self.spawn_collector();
        self.hello()?;

        let mut metrics = TrainMetrics::new();
        for round in 0..self.spec.rounds {
            let step = specs::FIRST_STEP + round;

            self.broadcast_step(step)?;
            self.broadcast_weights(model, step)?;
            self.collect_round(model, step, &mut metrics)?;
            self.apply_update(model)?;
            metrics.bump_round();

            if self.spec.eval_every != 0 && (round + 1) % self.spec.eval_every == 0 {
                let loss = model.loss(data.x(), data.y())?;
                let err = model.error_rate(data.x(), data.y())?;
                let record = metrics.record(step, loss, err);
                info!("step {step}: loss {loss}, error rate {err}, {} ms in", record.elapsed_ms);
            }
        }

        self.shutdown()?;
        self.transport.close();
        if collector.join().is_err() {
            warn!("gradient collector exited abnormally");
        }

        info!(
            "run complete: {} rounds, {} gradients folded, {} stale",
            metrics.rounds, metrics.folded, metrics.stale
        );
        Ok(metrics)
    }

    /// Exchanges the run name with the evaluator. Labels only, so a mismatch
    /// is logged rather than fatal.
    fn hello(&self) -> Result<()> {
        let name = self.spec.run_name();

        let mut buf = self.control_pool.checkout();
        msg::write_control(&mut buf, &specs::Control::Hello { name: name.clone() })?;
        self.transport.send_blocking(
            buf,
            specs::EVALUATOR_RANK,
            specs::HELLO_TAG,
            specs::CONTROL_CHANNEL,
        )?;

        let echo = self.transport.recv_blocking(
            self.control_pool.checkout(),
            Some(specs::EVALUATOR_RANK),
            Some(specs::HELLO_TAG),
            specs::CONTROL_CHANNEL,
        )?;
        let specs::Control::Hello { name: theirs } = msg::read_control(&echo.buf)?;
        if theirs == name {
            info!("evaluator joined run {name}");
        } else {
            warn!("evaluator answered for run {theirs}, expected {name}");
        }
        Ok(())
    }

    fn spawn_collector(&self) -> thread::JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let pools = self.pools.clone();
        let recvs = self.spec.recvs_per_channel;
        let queue = Arc::clone(&self.queue);

        thread::spawn(move || collector::run(transport.as_ref(), &pools, recvs, &queue))
    }

    /// Notifies every follower of `step` on the control channel.
    ///
    /// A still-pending notification to the same destination is waited out
    /// first: step words must never be dropped, a follower that misses one
    /// skips a round silently.
    fn broadcast_step(&mut self, step: u32) -> Result<()> {
        for (follower, slot) in self.step_slots.iter_mut().enumerate() {
            slot.make_idle()?;

            let mut buf = self.control_pool.checkout();
            msg::write_step(&mut buf, step);
            let handle = self.transport.post_send(
                buf,
                follower as Rank + 1,
                specs::STEP_TAG,
                specs::CONTROL_CHANNEL,
            )?;
            slot.put(handle);
        }
        Ok(())
    }

    /// Sends every layer's current weights to every follower, tagged with
    /// `step`. A still-pending send to the same (layer, destination) is
    /// superseded, only the newest weights matter.
    fn broadcast_weights<M: Model>(&mut self, model: &M, step: u32) -> Result<()> {
        for (layer, slots) in self.weight_slots.iter_mut().enumerate() {
            let weights = model.weights(layer);
            for (follower, slot) in slots.iter_mut().enumerate() {
                slot.supersede()?;

                let mut buf = self.pools[layer].checkout();
                buf.write_floats(weights);
                let handle = self.transport.post_send(
                    buf,
                    follower as Rank + 1,
                    step,
                    specs::layer_channel(layer),
                )?;
                slot.put(handle);
            }
        }
        Ok(())
    }

    /// Pops collected gradients until every layer has `required` of them
    /// tagged with `step`. Off-step payloads are recycled without counting;
    /// a payload of the wrong length is a protocol desync and fatal.
    fn collect_round<M: Model>(
        &mut self,
        model: &M,
        step: u32,
        metrics: &mut TrainMetrics,
    ) -> Result<()> {
        let required = self.spec.required();

        while self.counts.iter().any(|&c| c < required) {
            match self.queue.pop() {
                Collected::Gradient {
                    layer,
                    step: tag,
                    src,
                    buf,
                } => {
                    if tag != step {
                        metrics.bump_stale();
                        debug!(layer = layer, step = tag, src = src; "discarding stale gradient");
                        continue;
                    }

                    let expected = model.layer_len(layer) * size_of::<f32>();
                    if buf.len() != expected {
                        return Err(PsErr::GradientLengthMismatch {
                            layer,
                            got: buf.len(),
                            expected,
                        });
                    }

                    fold(&mut self.sums[layer], buf.as_floats());
                    self.counts[layer] += 1;
                    metrics.bump_folded();
                }
                Collected::Fault(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Applies each layer's accumulated gradient once and rearms the
    /// accumulators. The effective rate divides by the contribution count,
    /// so a round updates with the mean gradient whatever the quorum was.
    fn apply_update<M: Model>(&mut self, model: &mut M) -> Result<()> {
        for (layer, sum) in self.sums.iter_mut().enumerate() {
            // The round loop only gets here once every count reached quorum.
            let count = self.counts[layer];
            let rate = model.learning_rate() / count as f32;
            model.apply_update(layer, rate, sum)?;

            sum.fill(0.0);
            self.counts[layer] = 0;
        }
        Ok(())
    }

    /// Broadcasts the sentinel step, which unwinds every follower, and
    /// drains the broadcast slots so no send outlives the coordinator.
    ///
    /// A follower tears its endpoint down as soon as its sentinel lands,
    /// which can close the fabric under the slots still draining. `Closed`
    /// here is that teardown racing us, not a failure.
    fn shutdown(&mut self) -> Result<()> {
        match self.drain_broadcasts() {
            Err(PsErr::Comms(CommsErr::Closed)) => Ok(()),
            outcome => outcome,
        }
    }

    fn drain_broadcasts(&mut self) -> Result<()> {
        self.broadcast_step(specs::STEP_SENTINEL)?;
        for slot in &mut self.step_slots {
            slot.make_idle()?;
        }
        for slots in &mut self.weight_slots {
            for slot in slots {
                slot.supersede()?;
            }
        }
        Ok(())
    }
}

fn fold(sum: &mut [f32], grad: &[f32]) {
    sum.par_chunks_mut(FOLD_CHUNK)
        .zip(grad.par_chunks(FOLD_CHUNK))
        .for_each(|(s, g)| {
            for (s, g) in s.iter_mut().zip(g) {
                *s += g;
            }
        });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use comms::{Consistency, LocalFabric};
    use machine_learning::{PassOutcome, Result as MlResult};
    use ndarray::ArrayView2;

    use super::*;

    /// A model stand-in that records every update it is asked to apply.
    struct ScriptedModel {
        lens: Vec<usize>,
        rate: f32,
        updates: Vec<(usize, f32, Vec<f32>)>,
    }

    impl ScriptedModel {
        fn new(lens: Vec<usize>, rate: f32) -> Self {
            Self {
                lens,
                rate,
                updates: Vec::new(),
            }
        }
    }

    impl Model for ScriptedModel {
        fn trainable_layers(&self) -> usize {
            self.lens.len()
        }

        fn layer_len(&self, layer: usize) -> usize {
            self.lens[layer]
        }

        fn learning_rate(&self) -> f32 {
            self.rate
        }

        fn weights(&self, _layer: usize) -> &[f32] {
            &[]
        }

        fn gradient(&self, _layer: usize) -> &[f32] {
            &[]
        }

        fn commit_weights(&mut self, _layer: usize, _data: &[f32]) -> MlResult<()> {
            Ok(())
        }

        fn apply_update(&mut self, layer: usize, rate: f32, grad: &[f32]) -> MlResult<()> {
            self.updates.push((layer, rate, grad.to_vec()));
            Ok(())
        }

        fn forward<P>(&mut self, _x: ArrayView2<f32>, _probe: P) -> MlResult<PassOutcome>
        where
            P: FnMut() -> bool,
        {
            Ok(PassOutcome::Completed)
        }

        fn backward<S>(&mut self, _y: ArrayView2<f32>, _sink: S) -> MlResult<PassOutcome>
        where
            S: FnMut(usize, &[f32]) -> bool,
        {
            Ok(PassOutcome::Completed)
        }

        fn loss(&mut self, _x: ArrayView2<f32>, _y: ArrayView2<f32>) -> MlResult<f32> {
            Ok(0.0)
        }

        fn error_rate(&mut self, _x: ArrayView2<f32>, _y: ArrayView2<f32>) -> MlResult<f32> {
            Ok(0.0)
        }
    }

    fn small_spec(layer_sizes: Vec<usize>, consistency: Consistency) -> RunSpec {
        RunSpec {
            layer_sizes,
            workers: 2,
            consistency,
            shortcircuit: false,
            rounds: 1,
            pool_capacity: specs::DEFAULT_POOL_CAPACITY,
            recvs_per_channel: 1,
            eval_every: 0,
        }
    }

    fn coordinator_over(spec: &RunSpec) -> Coordinator<comms::LocalEndpoint> {
        let fabric = LocalFabric::new(spec.world(), spec.channels());
        Coordinator::new(Arc::new(fabric.endpoint(0).unwrap()), spec.clone()).unwrap()
    }

    fn gradient(pool: &BufferPool, values: &[f32], layer: usize, step: u32, src: Rank) -> Collected {
        let mut buf = pool.checkout();
        buf.write_floats(values);
        Collected::Gradient {
            layer,
            step,
            src,
            buf,
        }
    }

    #[test]
    fn stale_tags_recycle_without_counting() {
        let spec = small_spec(vec![4], Consistency::Quorum { k: 1 });
        let mut coordinator = coordinator_over(&spec);
        let model = ScriptedModel::new(vec![4], 0.1);
        let mut metrics = TrainMetrics::new();

        let pool = BufferPool::new(4, 4);
        coordinator
            .queue
            .push(gradient(&pool, &[9.0; 4], 0, 3, 2));
        coordinator
            .queue
            .push(gradient(&pool, &[1.0, 2.0, 3.0, 4.0], 0, 4, 3));

        coordinator.collect_round(&model, 4, &mut metrics).unwrap();

        assert_eq!(metrics.stale, 1);
        assert_eq!(metrics.folded, 1);
        assert_eq!(coordinator.counts, vec![1]);
        assert_eq!(coordinator.sums[0], vec![1.0, 2.0, 3.0, 4.0]);
        // Both payload buffers went back, counted or not.
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn a_round_waits_on_every_layers_quorum() {
        let spec = small_spec(vec![2, 2], Consistency::FullSync);
        let mut coordinator = coordinator_over(&spec);
        let queue = Arc::clone(&coordinator.queue);

        let pool = BufferPool::new(8, 2);
        queue.push(gradient(&pool, &[1.0, 1.0], 0, 1, 2));
        queue.push(gradient(&pool, &[1.0, 1.0], 0, 1, 3));
        queue.push(gradient(&pool, &[2.0, 2.0], 1, 1, 2));

        let round = thread::spawn(move || {
            let model = ScriptedModel::new(vec![2, 2], 0.1);
            let mut metrics = TrainMetrics::new();
            coordinator.collect_round(&model, 1, &mut metrics).unwrap();
            (coordinator.counts.clone(), coordinator.sums.clone())
        });

        // Layer 1 is one contribution short, so the round must still be
        // parked on the queue.
        thread::sleep(Duration::from_millis(30));
        assert!(!round.is_finished());

        queue.push(gradient(&pool, &[2.0, 2.0], 1, 1, 3));
        let (counts, sums) = round.join().unwrap();
        assert_eq!(counts, vec![2, 2]);
        assert_eq!(sums[0], vec![2.0, 2.0]);
        assert_eq!(sums[1], vec![4.0, 4.0]);
    }

    #[test]
    fn update_divides_by_the_contribution_count() {
        let spec = small_spec(vec![2, 2], Consistency::Quorum { k: 2 });
        let mut coordinator = coordinator_over(&spec);
        let mut model = ScriptedModel::new(vec![2, 2], 0.6);

        coordinator.sums[0].copy_from_slice(&[2.0, 4.0]);
        coordinator.counts[0] = 2;
        coordinator.sums[1].copy_from_slice(&[3.0, 9.0]);
        coordinator.counts[1] = 3;

        coordinator.apply_update(&mut model).unwrap();

        assert_eq!(model.updates.len(), 2);
        let (layer, rate, grad) = &model.updates[0];
        assert_eq!(*layer, 0);
        assert!((rate - 0.3).abs() < 1e-6);
        assert_eq!(grad, &vec![2.0, 4.0]);
        let (layer, rate, grad) = &model.updates[1];
        assert_eq!(*layer, 1);
        assert!((rate - 0.2).abs() < 1e-6);
        assert_eq!(grad, &vec![3.0, 9.0]);

        // Accumulators rearm for the next round.
        assert_eq!(coordinator.counts, vec![0, 0]);
        assert!(coordinator.sums.iter().all(|s| s.iter().all(|&v| v == 0.0)));
    }

    #[test]
    fn wrong_length_gradient_is_fatal() {
        let spec = small_spec(vec![4], Consistency::Quorum { k: 1 });
        let mut coordinator = coordinator_over(&spec);
        let model = ScriptedModel::new(vec![4], 0.1);
        let mut metrics = TrainMetrics::new();

        let pool = BufferPool::new(2, 4);
        coordinator
            .queue
            .push(gradient(&pool, &[1.0, 2.0, 3.0], 0, 1, 2));

        let err = coordinator
            .collect_round(&model, 1, &mut metrics)
            .unwrap_err();
        assert!(matches!(
            err,
            PsErr::GradientLengthMismatch {
                layer: 0,
                got: 12,
                expected: 16,
            }
        ));
    }
}
