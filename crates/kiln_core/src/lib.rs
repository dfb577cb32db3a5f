//! Core types shared by the kiln build engine
//!
//! Content ids, object urls, step statuses, command results and the
//! builder configuration.

mod object_id;
mod result;
mod url;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use object_id::{OBJECT_ID_LEN, ObjectId, ObjectIdError};
pub use result::{BuildResultCode, CommandResult, LogEntry, LogLevel, ResultStatus};
pub use url::{ObjectUrl, UrlError, UrlType};

/** Errors that can occur while loading a builder configuration */
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Invalid builder configuration: {0}")]
    Invalid(String),
}

fn default_build_path() -> PathBuf {
    PathBuf::from(".kiln")
}

fn default_index_name() -> String {
    "index".to_string()
}

fn default_builder_name() -> String {
    "Builder".to_string()
}

/**
 * Settings of a builder
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuilderConfig {
    /** Directory holding the object database, cached results and index files */
    #[serde(default = "default_build_path")]
    pub build_path: PathBuf,

    /** Name of the index file written after a build */
    #[serde(default = "default_index_name")]
    pub index_name: String,

    /** Number of worker threads; defaults to the logical core count */
    #[serde(default)]
    pub thread_count: Option<usize>,

    /** Prefix of worker thread names */
    #[serde(default = "default_builder_name")]
    pub builder_name: String,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            build_path: default_build_path(),
            index_name: default_index_name(),
            thread_count: None,
            builder_name: default_builder_name(),
        }
    }
}

impl BuilderConfig {
    pub fn new(build_path: impl Into<PathBuf>) -> Self {
        Self {
            build_path: build_path.into(),
            ..Self::default()
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BuilderConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count == Some(0) {
            return Err(ConfigError::Invalid(
                "thread_count must be at least 1".to_string(),
            ));
        }

        if self.index_name.trim().is_empty() {
            return Err(ConfigError::Invalid("index_name is empty".to_string()));
        }

        Ok(())
    }

    /// Configured thread count, falling back to the number of logical cores
    pub fn effective_thread_count(&self) -> usize {
        self.thread_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_content = r#"
            build_path = "obj/assets"
            index_name = "index.game.windows"
            thread_count = 4
            builder_name = "AssetBuilder"
            "#;

        let config = BuilderConfig::from_toml(toml_content).unwrap();
        assert_eq!(config.build_path, PathBuf::from("obj/assets"));
        assert_eq!(config.index_name, "index.game.windows");
        assert_eq!(config.effective_thread_count(), 4);
        assert_eq!(config.builder_name, "AssetBuilder");
    }

    #[test]
    fn test_defaults_use_core_count() {
        let config = BuilderConfig::from_toml("").unwrap();
        assert_eq!(config, BuilderConfig::default());
        assert!(config.effective_thread_count() >= 1);
    }
}
