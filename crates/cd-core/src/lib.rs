//! Core types and utilities for paired-image change detection.
//!
//! This crate provides the error type, the configuration surface with its
//! enumerated component tags, and helpers shared by the workspace tools.

pub mod cli;
pub mod config;
pub mod error;
pub mod types;

pub use cli::*;
pub use config::*;
pub use error::{Error, Result};
pub use types::*;
