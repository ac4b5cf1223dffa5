use thiserror::Error;

use crate::frame::FrameError;
use crate::switchboard::SwitchboardError;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("invalid id")]
    InvalidId,
    #[error("invalid host origin")]
    InvalidOrigin,
    #[error("invalid mount point")]
    InvalidMountTarget,
    #[error("invalid guest token fetcher")]
    InvalidFetcher,
    #[error("guest token fetch failed: {0:#}")]
    GuestTokenFetch(anyhow::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("switchboard error: {0}")]
    Switchboard(#[from] SwitchboardError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a whole number of milliseconds, got {value:?}")]
    InvalidMillis { var: &'static str, value: String },
}
