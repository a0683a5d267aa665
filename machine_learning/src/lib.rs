//! Dense feed-forward networks with externally owned flat parameters, plus
//! the synthetic datasets the training ranks share.

pub mod dataset;
pub mod dense;
pub mod error;
pub mod metrics;
pub mod network;
pub mod spec;

pub use dataset::{Dataset, shard_range};
pub use dense::{ActFn, Dense};
pub use error::{MlErr, Result};
pub use metrics::EvalRecord;
pub use network::{Model, Network, PassOutcome};
pub use spec::NetworkSpec;
