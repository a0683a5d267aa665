use std::{error::Error, fmt, io};

/// The result type used across the transport layer.
pub type Result<T> = std::result::Result<T, CommsErr>;

/// Transport layer failures.
#[derive(Debug)]
pub enum CommsErr {
    Io(io::Error),
    Json(serde_json::Error),
    /// The endpoint (or the whole fabric) was closed while the operation
    /// was pending or before it was posted.
    Closed,
    RankOutOfRange {
        rank: u32,
        world: u32,
    },
    DuplicateRank {
        rank: u32,
    },
    SelfSend {
        rank: u32,
    },
    ChannelOutOfRange {
        channel: u32,
        channels: u32,
    },
    /// An incoming payload did not fit in the posted buffer.
    Truncated {
        got: usize,
        capacity: usize,
    },
    Malformed {
        what: &'static str,
        len: usize,
    },
}

impl fmt::Display for CommsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommsErr::Io(e) => write!(f, "io error: {e}"),
            CommsErr::Json(e) => write!(f, "json error: {e}"),
            CommsErr::Closed => write!(f, "transport closed"),
            CommsErr::RankOutOfRange { rank, world } => {
                write!(f, "rank {rank} out of range for a world of {world}")
            }
            CommsErr::DuplicateRank { rank } => {
                write!(f, "rank {rank} already has an endpoint")
            }
            CommsErr::SelfSend { rank } => {
                write!(f, "rank {rank} cannot address itself")
            }
            CommsErr::ChannelOutOfRange { channel, channels } => {
                write!(f, "channel {channel} out of range, only {channels} exist")
            }
            CommsErr::Truncated { got, capacity } => {
                write!(
                    f,
                    "incoming payload of {got} bytes exceeds the posted buffer of {capacity} bytes"
                )
            }
            CommsErr::Malformed { what, len } => {
                write!(f, "malformed {what} of {len} bytes")
            }
        }
    }
}

impl Error for CommsErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CommsErr::Io(e) => Some(e),
            CommsErr::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CommsErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for CommsErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<CommsErr> for io::Error {
    fn from(value: CommsErr) -> Self {
        match value {
            CommsErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
