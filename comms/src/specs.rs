//! Run topology and the shared training-run specification.
//!
//! The address space is fixed: rank 0 coordinates, rank 1 evaluates, every
//! further rank is a worker. Channel 0 is the control stream; trainable
//! layer `l` exchanges its data on channel `l + 1`, tagged with the step.

use std::{error::Error, fmt};

use serde::{Deserialize, Serialize};

use crate::transport::{ChannelId, Rank, Tag};

pub const COORDINATOR_RANK: Rank = 0;
pub const EVALUATOR_RANK: Rank = 1;
pub const FIRST_WORKER_RANK: Rank = 2;

pub const CONTROL_CHANNEL: ChannelId = 0;
pub const STEP_TAG: Tag = 0;
pub const HELLO_TAG: Tag = 1;

/// Steps count from 1; observing the sentinel tells a follower to stop.
pub const FIRST_STEP: u32 = 1;
pub const STEP_SENTINEL: u32 = 0;

pub const DEFAULT_POOL_CAPACITY: usize = 100;
pub const DEFAULT_RECVS_PER_CHANNEL: usize = 1;

/// f32 slots per control-channel buffer; fits a step word or a greeting.
pub const CONTROL_SLOTS: usize = 64;

pub fn layer_channel(layer: usize) -> ChannelId {
    layer as ChannelId + 1
}

/// The trainable layer whose traffic a data channel carries.
pub fn layer_of(channel: ChannelId) -> usize {
    debug_assert!(channel != CONTROL_CHANNEL, "control channel has no layer");
    channel as usize - 1
}

pub fn worker_rank(index: usize) -> Rank {
    FIRST_WORKER_RANK + index as Rank
}

pub fn worker_index(rank: Rank) -> usize {
    debug_assert!(rank >= FIRST_WORKER_RANK);
    (rank - FIRST_WORKER_RANK) as usize
}

/// Messages exchanged on the control channel under [`HELLO_TAG`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    Hello { name: String },
}

/// How many tagged gradients a round needs per layer before the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Every worker contributes every round.
    FullSync,
    /// Any `k` contributions complete a round; the rest arrive late and
    /// are discarded as stale.
    Quorum { k: usize },
    /// The first contribution per layer advances the round.
    ContinuousAsync,
}

impl Consistency {
    pub fn required(&self, workers: usize) -> usize {
        match self {
            Consistency::FullSync => workers,
            Consistency::Quorum { k } => *k,
            Consistency::ContinuousAsync => 1,
        }
    }

    fn scheme(&self) -> String {
        match self {
            Consistency::FullSync => "fullsync".to_string(),
            Consistency::Quorum { k } => format!("quorum{k}"),
            Consistency::ContinuousAsync => "async".to_string(),
        }
    }
}

/// Validation failures of a [`RunSpec`].
#[derive(Debug, PartialEq, Eq)]
pub enum SpecErr {
    NoWorkers,
    NoLayers,
    EmptyLayer {
        layer: usize,
    },
    NoRounds,
    QuorumOutOfRange {
        k: usize,
        workers: usize,
    },
    /// The per-layer pools must cover a full weight fan-out plus the posted
    /// receives, with room for queued gradients on top.
    PoolTooSmall {
        capacity: usize,
        need: usize,
    },
    NoPostedReceives,
}

impl fmt::Display for SpecErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecErr::NoWorkers => write!(f, "a run needs at least one worker"),
            SpecErr::NoLayers => write!(f, "a run needs at least one trainable layer"),
            SpecErr::EmptyLayer { layer } => write!(f, "layer {layer} has no parameters"),
            SpecErr::NoRounds => write!(f, "a run needs at least one round"),
            SpecErr::QuorumOutOfRange { k, workers } => {
                write!(f, "quorum of {k} outside 1..={workers}")
            }
            SpecErr::PoolTooSmall { capacity, need } => {
                write!(f, "pool capacity {capacity} below the required {need}")
            }
            SpecErr::NoPostedReceives => {
                write!(f, "at least one receive must stay posted per channel")
            }
        }
    }
}

impl Error for SpecErr {}

/// Immutable description of a training run, shared by every rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    /// Flat parameter count per trainable layer.
    pub layer_sizes: Vec<usize>,
    pub workers: usize,
    pub consistency: Consistency,
    /// Abandon the rest of a pass once the observed step moved on.
    pub shortcircuit: bool,
    pub rounds: u32,
    /// Buffers preallocated per layer pool.
    pub pool_capacity: usize,
    /// Receives kept posted per layer channel.
    pub recvs_per_channel: usize,
    /// Coordinator metrics cadence, in rounds.
    pub eval_every: u32,
}

impl RunSpec {
    pub fn validate(&self) -> Result<(), SpecErr> {
        if self.workers == 0 {
            return Err(SpecErr::NoWorkers);
        }
        if self.layer_sizes.is_empty() {
            return Err(SpecErr::NoLayers);
        }
        if let Some(layer) = self.layer_sizes.iter().position(|&s| s == 0) {
            return Err(SpecErr::EmptyLayer { layer });
        }
        if self.rounds == 0 {
            return Err(SpecErr::NoRounds);
        }
        if let Consistency::Quorum { k } = self.consistency {
            if k == 0 || k > self.workers {
                return Err(SpecErr::QuorumOutOfRange {
                    k,
                    workers: self.workers,
                });
            }
        }
        if self.recvs_per_channel == 0 {
            return Err(SpecErr::NoPostedReceives);
        }

        // Worst case per layer pool on the coordinator: one in-flight weight
        // send per follower, the posted receives, and a queue of gradients.
        let need = 2 * self.workers + self.recvs_per_channel + 3;
        if self.pool_capacity < need {
            return Err(SpecErr::PoolTooSmall {
                capacity: self.pool_capacity,
                need,
            });
        }

        Ok(())
    }

    /// Ranks in the world: coordinator, evaluator, then the workers.
    pub fn world(&self) -> u32 {
        self.workers as u32 + 2
    }

    /// The control channel plus one channel per trainable layer.
    pub fn channels(&self) -> u32 {
        self.layer_sizes.len() as u32 + 1
    }

    pub fn required(&self) -> usize {
        self.consistency.required(self.workers)
    }

    /// The run's display name, also the stem of its output artifact.
    pub fn run_name(&self) -> String {
        let circuit = if self.shortcircuit {
            "shortcircuit"
        } else {
            "no_shortcircuit"
        };
        format!("{}_{}_{}", self.consistency.scheme(), self.workers, circuit)
    }
}
