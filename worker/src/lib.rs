//! The follower side of the trainer: workers that answer weight broadcasts
//! with gradients, and the evaluator that scores the run as it goes.

pub mod config;
pub mod error;
pub mod evaluator;
pub mod follow;
pub mod metrics;
pub mod state;
pub mod worker;

pub use config::FollowerConfig;
pub use error::{Result, WorkerErr};
pub use evaluator::{Evaluator, write_time_loss};
pub use metrics::WorkerMetrics;
pub use state::{StepCell, TakeOutcome, WeightStore};
pub use worker::Worker;
