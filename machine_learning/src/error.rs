use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use rand_distr::NormalError;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    EmptyNetwork,
    ZeroWidth {
        layer: usize,
    },
    WidthChain {
        layer: usize,
        got: usize,
        expected: usize,
    },
    ZeroBatch,
    BadRate {
        rate: f32,
    },
    Distribution(NormalError),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => {
                format!("There's a size mismatch in {what}, got {got} and expected {expected}")
            }
            MlErr::EmptyNetwork => "The network has no layers".to_string(),
            MlErr::ZeroWidth { layer } => {
                format!("Layer {layer} has a zero input or output width")
            }
            MlErr::WidthChain {
                layer,
                got,
                expected,
            } => format!(
                "Layer {layer} takes {got} inputs but the previous layer produces {expected}"
            ),
            MlErr::ZeroBatch => "The batch size must be at least 1".to_string(),
            MlErr::BadRate { rate } => {
                format!("The learning rate must be positive and finite, got {rate}")
            }
            MlErr::Distribution(e) => format!("Failed to build the weight distribution: {e}"),
        };

        write!(f, "{s}")
    }
}

impl Error for MlErr {}

impl From<NormalError> for MlErr {
    fn from(e: NormalError) -> Self {
        MlErr::Distribution(e)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<MlErr> for io::Error {
    fn from(value: MlErr) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, value)
    }
}
