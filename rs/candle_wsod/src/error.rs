//! Error types shared by the model, label and configuration layers.

use thiserror::Error;

/// Errors raised while building or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for option '{option}'")]
    InvalidOption { option: &'static str, value: String },

    #[error("option '{option}' is disabled: {reason}")]
    Disabled {
        option: &'static str,
        reason: &'static str,
    },

    #[error("option '{option}' out of range: {message}")]
    OutOfRange { option: &'static str, message: String },
}

/// Errors raised by model construction and forward passes.
#[derive(Debug, Error)]
pub enum WsodError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("shape mismatch in {context}: {message}")]
    Shape {
        context: &'static str,
        message: String,
    },

    #[error("missing input '{0}'")]
    MissingInput(&'static str),

    #[error("checkpoint '{path}': {message}")]
    Checkpoint { path: String, message: String },

    #[error("tensor operation failed")]
    Tensor(#[from] candle_core::Error),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("failed to read embedding matrix")]
    Npy(#[from] ndarray_npy::ReadNpyError),

    #[error("failed to parse configuration")]
    Json(#[from] serde_json::Error),
}

impl WsodError {
    pub fn shape(context: &'static str, message: impl Into<String>) -> Self {
        Self::Shape {
            context,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WsodError>;
