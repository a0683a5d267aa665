use std::{io, sync::Arc};

use comms::{TcpTransport, specs};
use log::info;
use machine_learning::{Dataset, Network};
use parameter_server::{Coordinator, PsConfig};

fn main() -> io::Result<()> {
    env_logger::init();

    let config = PsConfig::from_env()?;
    let run = config.run.clone();
    info!(
        "coordinating run {} with {} workers for {} rounds",
        run.run_name(),
        run.workers,
        run.rounds
    );

    let transport = TcpTransport::connect(specs::COORDINATOR_RANK, &config.addrs, run.channels())?;
    info!("fabric up across {} ranks", run.world());

    let mut network = Network::new(config.net.clone(), config.seed)?;
    let data = Dataset::blobs(
        config.per_class,
        config.net.classes(),
        config.net.features(),
        config.spread,
        config.seed,
    )?;

    let coordinator = Coordinator::new(Arc::new(transport), run)?;
    let metrics = coordinator.run(&mut network, &data)?;

    info!(
        "trained {} rounds: {} gradients folded, {} stale",
        metrics.rounds, metrics.folded, metrics.stale
    );
    Ok(())
}
