//! The coordinator side of the trainer: canonical weights, step ownership,
//! gradient collection under a consistency policy.

pub mod collector;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod slot;

pub use collector::Collected;
pub use config::PsConfig;
pub use coordinator::Coordinator;
pub use error::{PsErr, Result};
pub use metrics::TrainMetrics;
pub use slot::SendSlot;
