//! Error types for the shardplan planner and coordinator

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for shardplan operations
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShardplanError {
    /// Mesh construction failed (non-positive sizes, device count mismatch, bad rank array)
    #[error("Invalid topology: {message}")]
    InvalidTopology { message: String },

    /// Sub-mesh or group lookup referenced an axis the mesh does not have
    #[error("Unknown mesh axis '{axis}'")]
    UnknownAxis { axis: String },

    /// The process mesh of a context was set twice
    #[error("Process mesh already initialized")]
    AlreadyInitialized,

    /// A plan rule pattern matched nothing in the model tree (non-fatal)
    #[error("Plan rule '{pattern}' ({rule}) matched no layer")]
    UnresolvedPath { pattern: String, rule: String },

    /// Two pipeline split rules claim the same leaf
    #[error("Conflicting pipeline split on '{path}': claimed by '{first}' and '{second}'")]
    ConflictingSplit {
        path: String,
        first: String,
        second: String,
    },

    /// A sharded dimension is not divisible by its mesh axis size
    #[error(
        "Shape mismatch on '{path}' under {rule}: dimension {dim} of size {size} is not divisible by {divisor}"
    )]
    ShapeMismatch {
        path: String,
        rule: String,
        dim: usize,
        size: usize,
        divisor: usize,
    },

    /// NaN/Inf gradients under mixed precision (recovered by skipping the step)
    #[error("Numeric overflow: {message}")]
    NumericOverflow { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Collective or point-to-point communication errors
    #[error("Communication error: {message}")]
    Communication { message: String },

    /// Forward/backward/optimizer execution errors
    #[error("Execution error: {message}")]
    Execution { message: String },

    /// Not found errors
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    IO { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ShardplanError {
    /// Create an invalid topology error
    pub fn invalid_topology(message: impl Into<String>) -> Self {
        Self::InvalidTopology {
            message: message.into(),
        }
    }

    /// Create an unknown axis error
    pub fn unknown_axis(axis: impl Into<String>) -> Self {
        Self::UnknownAxis { axis: axis.into() }
    }

    /// Create an unresolved path error
    pub fn unresolved_path(pattern: impl Into<String>, rule: impl Into<String>) -> Self {
        Self::UnresolvedPath {
            pattern: pattern.into(),
            rule: rule.into(),
        }
    }

    /// Create a conflicting split error
    pub fn conflicting_split(
        path: impl Into<String>,
        first: impl Into<String>,
        second: impl Into<String>,
    ) -> Self {
        Self::ConflictingSplit {
            path: path.into(),
            first: first.into(),
            second: second.into(),
        }
    }

    /// Create a numeric overflow error
    pub fn numeric_overflow(message: impl Into<String>) -> Self {
        Self::NumericOverflow {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a communication error
    pub fn communication(message: impl Into<String>) -> Self {
        Self::Communication {
            message: message.into(),
        }
    }

    /// Create an execution error
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::IO {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error must abort the current phase.
    ///
    /// Unresolved plan paths are logged and skipped; numeric overflow is
    /// handled inline by skipping the optimizer step.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::UnresolvedPath { .. } | Self::NumericOverflow { .. }
        )
    }

    /// Check if this error originates from mesh construction or planning
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTopology { .. }
                | Self::UnknownAxis { .. }
                | Self::AlreadyInitialized
                | Self::UnresolvedPath { .. }
                | Self::ConflictingSplit { .. }
                | Self::ShapeMismatch { .. }
        )
    }
}

/// Conversion from std::io::Error
impl From<std::io::Error> for ShardplanError {
    fn from(err: std::io::Error) -> Self {
        Self::io(format!("{}", err))
    }
}

/// Conversion from serde_json::Error
impl From<serde_json::Error> for ShardplanError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("{}", err))
    }
}

/// Conversion from toml::de::Error
impl From<toml::de::Error> for ShardplanError {
    fn from(err: toml::de::Error) -> Self {
        Self::serialization(format!("{}", err))
    }
}
