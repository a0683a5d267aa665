use std::{error::Error, fmt, io};

use comms::{CommsErr, SpecErr};
use machine_learning::MlErr;

/// The coordinator's result type.
pub type Result<T> = std::result::Result<T, PsErr>;

/// Coordinator runtime failures.
#[derive(Debug)]
pub enum PsErr {
    Comms(CommsErr),
    Model(MlErr),
    Spec(SpecErr),
    /// A received gradient does not span the layer's parameters.
    GradientLengthMismatch {
        layer: usize,
        got: usize,
        expected: usize,
    },
}

impl fmt::Display for PsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsErr::Comms(e) => write!(f, "transport error: {e}"),
            PsErr::Model(e) => write!(f, "model error: {e}"),
            PsErr::Spec(e) => write!(f, "run spec error: {e}"),
            PsErr::GradientLengthMismatch {
                layer,
                got,
                expected,
            } => write!(
                f,
                "gradient length mismatch on layer {layer}: got {got} bytes, expected {expected}"
            ),
        }
    }
}

impl Error for PsErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PsErr::Comms(e) => Some(e),
            PsErr::Model(e) => Some(e),
            PsErr::Spec(e) => Some(e),
            PsErr::GradientLengthMismatch { .. } => None,
        }
    }
}

impl From<CommsErr> for PsErr {
    fn from(value: CommsErr) -> Self {
        Self::Comms(value)
    }
}

impl From<MlErr> for PsErr {
    fn from(value: MlErr) -> Self {
        Self::Model(value)
    }
}

impl From<SpecErr> for PsErr {
    fn from(value: SpecErr) -> Self {
        Self::Spec(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<PsErr> for io::Error {
    fn from(value: PsErr) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, value)
    }
}
