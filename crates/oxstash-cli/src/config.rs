//! Settings file for the CLI.
//!
//! The file is optional. Command-line flags and environment variables win
//! over anything it sets.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use oxstash_core::ConnectOptions;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    /// Directory holding the store
    pub store: Option<PathBuf>,
    /// Create the store directory when missing
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub connect: ConnectOptions,
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
