use std::{error::Error, fmt, io};

use comms::CommsErr;
use machine_learning::MlErr;

/// The follower crate's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker and evaluator runtime failures.
#[derive(Debug)]
pub enum WorkerErr {
    Comms(CommsErr),
    Model(MlErr),
    /// A weight payload does not span the layer's parameters.
    WeightsLengthMismatch {
        layer: usize,
        got: usize,
        expected: usize,
    },
    /// The training shard has no rows to batch over.
    EmptyShard,
    /// A background role thread died without reporting an error.
    ThreadPanicked { role: &'static str },
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Comms(e) => write!(f, "transport error: {e}"),
            WorkerErr::Model(e) => write!(f, "model error: {e}"),
            WorkerErr::WeightsLengthMismatch {
                layer,
                got,
                expected,
            } => write!(
                f,
                "weights length mismatch on layer {layer}: got {got} bytes, expected {expected}"
            ),
            WorkerErr::EmptyShard => write!(f, "training shard is empty"),
            WorkerErr::ThreadPanicked { role } => write!(f, "{role} thread panicked"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Comms(e) => Some(e),
            WorkerErr::Model(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CommsErr> for WorkerErr {
    fn from(value: CommsErr) -> Self {
        Self::Comms(value)
    }
}

impl From<MlErr> for WorkerErr {
    fn from(value: MlErr) -> Self {
        Self::Model(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, value)
    }
}
