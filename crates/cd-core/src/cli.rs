//! Shared CLI helpers for workspace tools.

use std::fs;
use std::io;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, Result};

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the verbosity flag when it is set.
pub fn setup_cli_logging(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}

/// Reads an experiment file into `T`.
///
/// A missing file is `NotFound` so tools can tell it apart from a file that
/// exists but does not parse. Parse errors carry the TOML line and column.
pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!("config file {}", path.display())));
        }
        Err(e) => return Err(Error::Io(e)),
    };

    toml::from_str(&content).map_err(|e| {
        let location = e
            .span()
            .map(|span| line_col(&content, span.start))
            .map(|(line, col)| format!(" at line {line}, column {col}"))
            .unwrap_or_default();
        Error::Config(format!(
            "{}{location}: {}",
            path.display(),
            e.message()
        ))
    })
}

/// One-based line and column of a byte offset.
fn line_col(content: &str, offset: usize) -> (usize, usize) {
    let before = content.get(..offset).unwrap_or(content);
    let line = before.matches('\n').count() + 1;
    let col = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
    (line, col)
}
