//! Error types for the change detection workspace.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the change detection workspace.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image could not be opened or decoded
    #[error("Image error at {path}: {message}")]
    Image { path: PathBuf, message: String },

    /// Configuration error, raised while constructing a component
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dataset error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Tensor or pixel array shapes do not line up
    #[error("Shape mismatch: {0}")]
    Shape(String),

    /// Model error
    #[error("Model error: {0}")]
    Model(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wraps an `image` crate error with the path that produced it.
    pub fn image(path: impl Into<PathBuf>, err: image::ImageError) -> Self {
        Error::Image {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Specialized Result type for change detection operations.
pub type Result<T> = std::result::Result<T, Error>;
