//! Runs a whole training world inside one process: every rank becomes a
//! thread on the in-process fabric. The demo and benchmark entry point.

use std::{io, path::PathBuf, sync::Arc, thread};

use comms::{LocalFabric, RunSpec, specs};
use log::info;
use machine_learning::{Dataset, EvalRecord, Network, NetworkSpec};
use parameter_server::{Coordinator, TrainMetrics};
use worker::{Evaluator, Worker, WorkerMetrics};

/// Everything a single-process run needs.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub run: RunSpec,
    pub net: NetworkSpec,
    pub seed: u64,
    /// Synthetic dataset shape: rows per class and cluster spread.
    pub per_class: usize,
    pub spread: f32,
    /// Where the evaluator artifact lands.
    pub outdir: PathBuf,
}

/// What the rank threads brought home.
#[derive(Debug)]
pub struct RunReport {
    pub train: TrainMetrics,
    pub workers: Vec<WorkerMetrics>,
    pub records: Vec<EvalRecord>,
    pub artifact: PathBuf,
}

/// Spawns coordinator, evaluator and workers over one [`LocalFabric`] and
/// waits the run out. The artifact is written once the evaluator returns.
pub fn launch(config: NodeConfig) -> io::Result<RunReport> {
    config.run.validate().map_err(io::Error::other)?;

    let train_set = Dataset::blobs(
        config.per_class,
        config.net.classes(),
        config.net.features(),
        config.spread,
        config.seed,
    )?;
    let holdout = Dataset::blobs(
        config.per_class,
        config.net.classes(),
        config.net.features(),
        config.spread,
        config.seed.wrapping_add(1),
    )?;

    let workers = config.run.workers;
    let shards: Vec<Dataset> = (0..workers).map(|w| train_set.shard(w, workers)).collect();

    let fabric = LocalFabric::new(config.run.world(), config.run.channels());
    info!(
        "launching {} in process: {} ranks, {} rounds",
        config.run.run_name(),
        config.run.world(),
        config.run.rounds,
    );

    let coordinator = {
        let endpoint = endpoint_of(&fabric, specs::COORDINATOR_RANK)?;
        let run = config.run.clone();
        let mut model = Network::new(config.net.clone(), config.seed)?;
        thread::spawn(move || -> io::Result<TrainMetrics> {
            let coordinator = Coordinator::new(endpoint, run)?;
            Ok(coordinator.run(&mut model, &train_set)?)
        })
    };

    let evaluator = {
        let endpoint = endpoint_of(&fabric, specs::EVALUATOR_RANK)?;
        let run = config.run.clone();
        let mut model = Network::new(config.net.clone(), config.seed)?;
        thread::spawn(move || -> io::Result<(String, Vec<EvalRecord>)> {
            Ok(Evaluator::new(endpoint, run).run(&mut model, &holdout)?)
        })
    };

    let mut trainers = Vec::with_capacity(workers);
    for (w, shard) in shards.into_iter().enumerate() {
        let endpoint = endpoint_of(&fabric, specs::worker_rank(w))?;
        let run = config.run.clone();
        let batch = config.net.batch;
        let mut model = Network::new(config.net.clone(), config.seed)?;
        trainers.push(thread::spawn(move || -> io::Result<WorkerMetrics> {
            Ok(Worker::new(endpoint, run, batch).run(&mut model, &shard)?)
        }));
    }

    let train = join_rank(coordinator, "coordinator")?;
    let (name, records) = join_rank(evaluator, "evaluator")?;
    let mut worker_metrics = Vec::with_capacity(trainers.len());
    for trainer in trainers {
        worker_metrics.push(join_rank(trainer, "worker")?);
    }

    let artifact = worker::write_time_loss(&config.outdir, &name, &records)?;
    info!(
        "run {name} finished: {} rounds, {} evaluations, artifact {}",
        train.rounds,
        records.len(),
        artifact.display(),
    );

    Ok(RunReport {
        train,
        workers: worker_metrics,
        records,
        artifact,
    })
}

fn endpoint_of(fabric: &LocalFabric, rank: u32) -> io::Result<Arc<comms::LocalEndpoint>> {
    Ok(Arc::new(fabric.endpoint(rank)?))
}

fn join_rank<T>(handle: thread::JoinHandle<io::Result<T>>, role: &str) -> io::Result<T> {
    handle
        .join()
        .map_err(|_| io::Error::other(format!("{role} thread panicked")))?
}
