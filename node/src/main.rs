use std::{env, io, path::PathBuf};

use comms::{RunSpec, specs};
use machine_learning::NetworkSpec;
use node::{NodeConfig, launch};
use parameter_server::config::{consistency_from_env, parse_widths, var_or};

fn main() -> io::Result<()> {
    env_logger::init();

    let widths = parse_widths(&env::var("LAYERS").unwrap_or_else(|_| "4,16,3".to_string()))?;
    if widths.len() < 2 {
        return Err(io::Error::other("LAYERS needs an input and an output width"));
    }
    let pairs = widths.windows(2).map(|w| (w[0], w[1])).collect();
    let net = NetworkSpec::new(pairs, var_or("BATCH", 32usize)?, var_or("RATE", 0.01f32)?)?;

    let workers = var_or("WORKERS", 2usize)?;
    let run = RunSpec {
        layer_sizes: (0..net.trainable_layers())
            .map(|l| net.layer_len(l))
            .collect(),
        workers,
        consistency: consistency_from_env(workers)?,
        shortcircuit: var_or("SHORTCIRCUIT", false)?,
        rounds: var_or("ROUNDS", 100u32)?,
        pool_capacity: var_or("POOL_CAPACITY", specs::DEFAULT_POOL_CAPACITY)?,
        recvs_per_channel: var_or("RECVS_PER_CHANNEL", specs::DEFAULT_RECVS_PER_CHANNEL)?,
        eval_every: var_or("EVAL_EVERY", 10u32)?,
    };

    let report = launch(NodeConfig {
        run,
        net,
        seed: var_or("SEED", 42u64)?,
        per_class: var_or("PER_CLASS", 64usize)?,
        spread: var_or("SPREAD", 3.0f32)?,
        outdir: PathBuf::from(env::var("OUTDIR").unwrap_or_else(|_| "outfiles".to_string())),
    })?;

    if let Some(last) = report.records.last() {
        println!(
            "final model: loss {} error rate {} after {} rounds",
            last.loss, last.error_rate, report.train.rounds
        );
    }
    println!("wrote {}", report.artifact.display());

    Ok(())
}
