use std::{io, sync::Arc};

use comms::{TcpTransport, specs};
use log::info;
use machine_learning::{Dataset, Network};

use worker::{Evaluator, FollowerConfig, Worker, evaluator};

fn main() -> io::Result<()> {
    env_logger::init();

    let config = FollowerConfig::from_env()?;
    let run = config.run.clone();
    info!("rank {} joining {}", config.rank, run.run_name());

    let transport = Arc::new(TcpTransport::connect(
        config.rank,
        &config.addrs,
        run.channels(),
    )?);
    let mut network = Network::new(config.net.clone(), config.seed)?;

    if config.rank == specs::EVALUATOR_RANK {
        let holdout = Dataset::blobs(
            config.per_class,
            config.net.classes(),
            config.net.features(),
            config.spread,
            config.seed.wrapping_add(1),
        )?;
        let (name, records) = Evaluator::new(transport, run).run(&mut network, &holdout)?;
        let path = evaluator::write_time_loss(&config.outdir, &name, &records)?;
        info!("wrote {} records to {}", records.len(), path.display());
    } else {
        let train = Dataset::blobs(
            config.per_class,
            config.net.classes(),
            config.net.features(),
            config.spread,
            config.seed,
        )?;
        let shard = train.shard(specs::worker_index(config.rank), run.workers);
        info!("worker {} training on {} rows", config.rank, shard.len());

        let metrics = Worker::new(transport, run, config.net.batch).run(&mut network, &shard)?;
        info!(
            "sent {} gradients over {} rounds",
            metrics.emitted, metrics.rounds
        );
    }

    Ok(())
}
