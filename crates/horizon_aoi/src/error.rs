//! Error types for the AOI engine

use crate::types::{EntityId, GroupId, LayerIndex, Position};
use thiserror::Error;

/// Failures returned by AOI engine operations.
///
/// None of these terminate the process; every operation either completes
/// with its documented effects or returns one of these without side effects,
/// except [`AoiError::InvariantViolation`] which is reported after the
/// triggering operation has already been applied and flushed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AoiError {
    #[error("Invalid entity: {0}")]
    InvalidEntity(String),

    #[error("Entity {0} is already tracked")]
    AlreadyTracked(EntityId),

    #[error("Entity {0} is not tracked")]
    NotTracked(EntityId),

    #[error("Position {0} is outside the configured bounds")]
    InvalidPosition(Position),

    #[error("Group {0} not found")]
    GroupNotFound(GroupId),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Layer {0} is not registered")]
    UnknownLayer(LayerIndex),

    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Configuration rejected: {0}")]
    Invalid(#[from] AoiError),
}

pub type AoiResult<T> = Result<T, AoiError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
