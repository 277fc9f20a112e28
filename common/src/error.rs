use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClockError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("stored configuration failed its integrity check")]
    ConfigCorrupt,
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("update manifest fetch failed: {0}")]
    ManifestFetchFailed(String),
    #[error("download incomplete: received {received} of {expected} bytes")]
    DownloadIncomplete { received: u64, expected: u64 },
    #[error("automatic update apply failed: {0}")]
    ApplyFailed(String),
    #[error("hardware clock unavailable")]
    HardwareClockUnavailable,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClockError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn network(err: impl std::fmt::Display) -> Self {
        Self::NetworkUnavailable(err.to_string())
    }
}

impl From<std::io::Error> for ClockError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
