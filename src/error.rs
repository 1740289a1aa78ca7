//! The crate-wide error type.

use std::{error::Error, fmt::Display, io};

/// Everything that can go wrong outside of the expected, silently handled
/// cases (protocol noise, an absent sensor, a closed socket).
#[derive(Debug)]
pub enum FlyflixError {
    /// Returned when reading a configuration file or writing a data file fails.
    IoError(io::Error),

    /// Returned when the telemetry socket fails in a way we did not
    /// anticipate. Timeouts and refused connections never end up here.
    Telemetry(io::Error),

    /// Returned when a configuration document cannot be deserialized.
    RonSpannedError(ron::error::SpannedError),

    /// Returned when a background activity panicked before it could be joined.
    JoinError,
}

impl Display for FlyflixError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(error) => write!(f, "io error: {}", error),
            Self::Telemetry(error) => write!(f, "telemetry socket error: {}", error),
            Self::RonSpannedError(error) => write!(f, "configuration error: {}", error),
            Self::JoinError => write!(f, "background activity panicked"),
        }
    }
}

impl Error for FlyflixError {}

impl From<io::Error> for FlyflixError {
    fn from(value: io::Error) -> Self {
        Self::IoError(value)
    }
}

impl From<ron::error::SpannedError> for FlyflixError {
    fn from(value: ron::error::SpannedError) -> Self {
        Self::RonSpannedError(value)
    }
}
