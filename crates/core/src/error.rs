use crate::types::BannerId;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub type RotatorResult<T> = Result<T, RotatorError>;

/// Failure category, stable across message wording. Callers map kinds to
/// status codes or exit codes without inspecting the error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NoEligibleBanners,
    InvalidArmState,
    Conflict,
    NotFound,
    StorageUnavailable,
    Timeout,
    Config,
}

#[derive(Error, Debug)]
pub enum RotatorError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No eligible banners for slot {slot} and social group {social_group}")]
    NoEligibleBanners { slot: i64, social_group: i64 },

    #[error("Invalid arm state: {0}")]
    InvalidArmState(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Operation '{operation}' timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// The banner was selected but its outcome counter could not be written.
    #[error("Banner {banner} selected but outcome not recorded: {source}")]
    OutcomeNotRecorded {
        banner: BannerId,
        #[source]
        source: Box<RotatorError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RotatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NoEligibleBanners { .. } => ErrorKind::NoEligibleBanners,
            Self::InvalidArmState(_) => ErrorKind::InvalidArmState,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::OutcomeNotRecorded { source, .. } => source.kind(),
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Timeouts and storage outages may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::StorageUnavailable
        )
    }
}

impl From<config::ConfigError> for RotatorError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
