use std::{env, io, path::PathBuf, str::FromStr};

use comms::{Consistency, Rank, RunSpec, specs};
use machine_learning::NetworkSpec;

/// Environment-driven settings of a follower binary.
///
/// Followers read the same variable family as the coordinator so that one
/// environment file describes the whole run; `RANK` picks the role.
#[derive(Debug, Clone)]
pub struct FollowerConfig {
    pub rank: Rank,
    /// One listen address per rank, coordinator first.
    pub addrs: Vec<String>,
    pub run: RunSpec,
    pub net: NetworkSpec,
    pub seed: u64,
    /// Synthetic dataset shape: rows per class and cluster spread.
    pub per_class: usize,
    pub spread: f32,
    /// Where the evaluator writes its artifact.
    pub outdir: PathBuf,
}

impl FollowerConfig {
    /// Reads the run settings from the environment. `RANK`, `ADDRS` and
    /// `LAYERS` are required; everything else falls back to a small demo
    /// run.
    pub fn from_env() -> io::Result<Self> {
        let rank: Rank = env::var("RANK")
            .map_err(|e| io::Error::other(e))?
            .parse()
            .map_err(|e| io::Error::other(format!("bad RANK: {e}")))?;
        if rank == specs::COORDINATOR_RANK {
            return Err(io::Error::other(
                "rank 0 is the coordinator; run the parameter_server binary",
            ));
        }

        let addrs: Vec<String> = env::var("ADDRS")
            .map_err(|e| io::Error::other(e))?
            .split(',')
            .map(|a| a.trim().to_string())
            .collect();
        if addrs.len() < 3 {
            return Err(io::Error::other(
                "ADDRS needs coordinator, evaluator and at least one worker",
            ));
        }
        if rank as usize >= addrs.len() {
            return Err(io::Error::other(format!(
                "RANK {rank} is outside the {} configured addresses",
                addrs.len()
            )));
        }
        let workers = addrs.len() - 2;

        let widths = parse_widths(&env::var("LAYERS").map_err(|e| io::Error::other(e))?)?;
        if widths.len() < 2 {
            return Err(io::Error::other("LAYERS needs an input and an output width"));
        }
        let pairs = widths.windows(2).map(|w| (w[0], w[1])).collect();
        let net = NetworkSpec::new(pairs, var_or("BATCH", 32usize)?, var_or("RATE", 0.01f32)?)?;

        let scheme = env::var("SCHEME").unwrap_or_else(|_| "fullsync".to_string());
        let consistency = match scheme.as_str() {
            "fullsync" => Consistency::FullSync,
            "quorum" => Consistency::Quorum {
                k: var_or("QUORUM", workers)?,
            },
            "async" => Consistency::ContinuousAsync,
            other => return Err(io::Error::other(format!("unknown scheme {other}"))),
        };

        let run = RunSpec {
            layer_sizes: (0..net.trainable_layers())
                .map(|l| net.layer_len(l))
                .collect(),
            workers,
            consistency,
            shortcircuit: var_or("SHORTCIRCUIT", false)?,
            rounds: var_or("ROUNDS", 100u32)?,
            pool_capacity: var_or("POOL_CAPACITY", specs::DEFAULT_POOL_CAPACITY)?,
            recvs_per_channel: var_or("RECVS_PER_CHANNEL", specs::DEFAULT_RECVS_PER_CHANNEL)?,
            eval_every: var_or("EVAL_EVERY", 10u32)?,
        };
        run.validate().map_err(|e| io::Error::other(e))?;

        Ok(Self {
            rank,
            addrs,
            run,
            net,
            seed: var_or("SEED", 42u64)?,
            per_class: var_or("PER_CLASS", 64usize)?,
            spread: var_or("SPREAD", 3.0f32)?,
            outdir: PathBuf::from(
                env::var("OUTDIR").unwrap_or_else(|_| "outfiles".to_string()),
            ),
        })
    }
}

/// Reads and parses one environment variable, absent means `default`.
pub fn var_or<T>(name: &str, default: T) -> io::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|e| io::Error::other(e)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(io::Error::other(e)),
    }
}

/// Parses a comma-separated width list such as `"4,16,3"`.
pub fn parse_widths(raw: &str) -> io::Result<Vec<usize>> {
    raw.split(',')
        .map(|w| w.trim().parse().map_err(|e| io::Error::other(e)))
        .collect()
}
