//! The read-only observer rank.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use comms::{BufferPool, RunSpec, Transport, msg, specs};
use log::info;
use machine_learning::{Dataset, EvalRecord, Model};

use crate::{
    error::{Result, WorkerErr},
    follow::{self, join_role},
    state::{StepCell, WeightStore},
};

/// A passive rank: answers the coordinator's greeting, mirrors whatever
/// weights reach it and scores each mirrored step over a holdout set.
///
/// It never sends gradients, so the coordinator is free to supersede its
/// broadcasts; the evaluator just picks up the newest payload it has
/// whenever the step moves.
pub struct Evaluator<T: Transport> {
    transport: Arc<T>,
    spec: RunSpec,
    step: Arc<StepCell>,
    store: Arc<WeightStore>,
    control_pool: BufferPool,
}

impl<T: Transport + 'static> Evaluator<T> {
    pub fn new(transport: Arc<T>, spec: RunSpec) -> Self {
        let layers = spec.layer_sizes.len();

        Self {
            transport,
            spec,
            step: Arc::new(StepCell::new()),
            store: Arc::new(WeightStore::new(layers)),
            control_pool: BufferPool::new(4, specs::CONTROL_SLOTS),
        }
    }

    /// Follows the run to the shutdown sentinel. Returns the run name from
    /// the handshake and one record per evaluated step.
    pub fn run<M: Model>(
        self,
        model: &mut M,
        holdout: &Dataset,
    ) -> Result<(String, Vec<EvalRecord>)> {
        let name = self.hello()?;
        info!("evaluating run {name}");

        let pools = self
            .spec
            .layer_sizes
            .iter()
            .map(|&slots| BufferPool::new(self.spec.pool_capacity, slots))
            .collect();
        let observer = follow::spawn_observer(
            Arc::clone(&self.transport),
            Arc::clone(&self.step),
            Arc::clone(&self.store),
        );
        let receiver = follow::spawn_weight_receiver(
            Arc::clone(&self.transport),
            pools,
            self.spec.recvs_per_channel,
            Arc::clone(&self.store),
        );

        let mirrored = self.mirror_loop(model, holdout);

        self.transport.close();
        let observed = join_role(observer, "observer");
        let received = join_role(receiver, "weight receiver");

        let records = mirrored?;
        observed?;
        received?;

        info!("evaluator done after {} records", records.len());
        Ok((name, records))
    }

    fn hello(&self) -> Result<String> {
        let greeting = self.transport.recv_blocking(
            self.control_pool.checkout(),
            Some(specs::COORDINATOR_RANK),
            Some(specs::HELLO_TAG),
            specs::CONTROL_CHANNEL,
        )?;
        let specs::Control::Hello { name } = msg::read_control(&greeting.buf)?;

        let mut echo = self.control_pool.checkout();
        msg::write_control(&mut echo, &specs::Control::Hello { name: name.clone() })?;
        self.transport
            .send_blocking(echo, specs::COORDINATOR_RANK, specs::HELLO_TAG, specs::CONTROL_CHANNEL)?;

        Ok(name)
    }

    fn mirror_loop<M: Model>(&self, model: &mut M, holdout: &Dataset) -> Result<Vec<EvalRecord>> {
        let started = Instant::now();
        let mut records = Vec::new();
        let mut local_step = specs::STEP_SENTINEL;

        while let Some(step) = self.step.wait_changed(local_step) {
            local_step = step;

            for (layer, &len) in self.spec.layer_sizes.iter().enumerate() {
                if let Some((_, buf)) = self.store.take_newest(layer) {
                    let expected = len * size_of::<f32>();
                    if buf.len() != expected {
                        return Err(WorkerErr::WeightsLengthMismatch {
                            layer,
                            got: buf.len(),
                            expected,
                        });
                    }
                    model.commit_weights(layer, buf.as_floats())?;
                }
            }

            let loss = model.loss(holdout.x(), holdout.y())?;
            let error_rate = model.error_rate(holdout.x(), holdout.y())?;
            let record = EvalRecord {
                step,
                elapsed_ms: started.elapsed().as_millis() as u64,
                loss,
                error_rate,
            };
            info!("step {step}: loss {loss}, error rate {error_rate}");
            records.push(record);
        }

        Ok(records)
    }
}

/// Writes the `<name>_time_loss_out` artifact under `dir`: the run name on
/// the first line, then one `step elapsed_ms loss error_rate` line per
/// record. Returns the path written.
pub fn write_time_loss(dir: &Path, name: &str, records: &[EvalRecord]) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{name}_time_loss_out"));

    let mut out = String::with_capacity(name.len() + 1 + records.len() * 32);
    out.push_str(name);
    out.push('\n');
    for record in records {
        out.push_str(&record.to_string());
        out.push('\n');
    }

    fs::write(&path, out)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;

    #[test]
    fn artifact_lists_the_name_then_one_line_per_record() {
        let dir = env::temp_dir().join(format!("time_loss_{}", std::process::id()));
        let records = vec![
            EvalRecord {
                step: 1,
                elapsed_ms: 10,
                loss: 2.5,
                error_rate: 0.5,
            },
            EvalRecord {
                step: 3,
                elapsed_ms: 42,
                loss: 1.25,
                error_rate: 0.25,
            },
        ];

        let path = write_time_loss(&dir, "fullsync_2_noshort", &records).unwrap();
        assert_eq!(path, dir.join("fullsync_2_noshort_time_loss_out"));

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "fullsync_2_noshort\n1 10 2.5 0.5\n3 42 1.25 0.25\n");

        fs::remove_dir_all(&dir).unwrap();
    }
}
