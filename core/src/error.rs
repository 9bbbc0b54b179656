use std::io;

use crate::tlv;

/// Errors raised while preparing, driving or talking to a card simulation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Malformed simulation configuration: {0}")]
    Configuration(String),

    #[error("The simulator process could not be started: {0}")]
    ProcessSpawn(String),

    #[error("The simulation is not running")]
    NotRunning,

    #[error("No response from the simulator within the given time")]
    Timeout,

    #[error("Error occurred while decoding a TLV frame: {0}")]
    Codec(#[from] tlv::Error),

    #[error("The future has already dispatched its event")]
    AlreadyCompleted,

    #[error("The operation has been cancelled")]
    Cancelled,

    #[error("The simulator connection closed without a response")]
    NoResponse,

    #[error("The simulator sent an invalid response APDU")]
    InvalidResponse,

    #[error("Command of {length} bytes exceeds the maximum of {max} bytes")]
    CommandTooLarge { max: usize, length: usize },

    #[error("Response of {length} bytes exceeds the maximum of {max} bytes")]
    ResponseTooLarge { max: usize, length: usize },

    #[error("The channel has already been closed")]
    ChannelClosed,

    #[error("Not supported by the simulator: {0}")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary error, e.g. one raised inside a future transformation.
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
