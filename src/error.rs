//! Error taxonomy for the sorting engine.
//!
//! Configuration problems are fatal and surface at construction time, prior
//! parameters are validated by their setters, and numerical failures from
//! the covariance path are wrapped from [`LinalgError`]. Everything else
//! degrades to "no spikes found" rather than failing.

use alloc::string::String;

use crate::linalg::LinalgError;

/// Errors returned by the sorting engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BotmError {
    /// Missing or inconsistent template or filter bank setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A probability or prior parameter is out of range.
    #[error("invalid value for {name}: {value}")]
    Value {
        /// Parameter name
        name: &'static str,
        /// Rejected value
        value: f64,
    },

    /// Data or template shape does not match the configured bank.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Expected size
        expected: usize,
        /// Received size
        got: usize,
    },

    /// Numerical failure in a matrix decomposition.
    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

impl BotmError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        BotmError::Configuration(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, BotmError>;
