//! Messaging substrate of the trainer: fixed buffer pools, blocking queues
//! and a rank/tag/channel transport with in-process and TCP backends.

pub mod error;
pub mod mem;
pub mod msg;
pub mod pool;
pub mod queue;
pub mod specs;
pub mod tcp;
pub mod transport;

pub use error::{CommsErr, Result};
pub use mem::{LocalEndpoint, LocalFabric};
pub use pool::{BufferPool, PoolBuf};
pub use queue::SyncQueue;
pub use specs::{Consistency, Control, RunSpec, SpecErr};
pub use tcp::TcpTransport;
pub use transport::{ChannelId, Rank, RecvDone, RecvHandle, SendHandle, Tag, Transport, wait_any};
