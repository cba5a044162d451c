//! Configuration loading
//!
//! Configuration lives in a single TOML file. Every section and field is
//! optional and falls back to its default.

mod schema;

pub use schema::*;

use std::path::Path;

use tracing::{debug, info};

use crate::error::{CaptureError, Result};

/// Parse and validate configuration text
pub fn parse(text: &str) -> Result<AppConfig> {
    let config: AppConfig =
        toml::from_str(text).map_err(|e| CaptureError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML file
pub fn load(path: &Path) -> Result<AppConfig> {
    let text = std::fs::read_to_string(path)?;
    let config = parse(&text)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Load `path` if given, defaults otherwise
pub fn load_or_default(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => load(path),
        None => {
            debug!("No configuration file given, using defaults");
            Ok(AppConfig::default())
        }
    }
}
