//! Cortex configuration structures to map the cortex.toml configuration.

#![deny(missing_docs)]

mod loader;
mod model;
mod pathway;
mod server;

use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;

pub use model::{EndpointConfig, ModelConfig, ProviderFamily};
pub use pathway::{OutputKind, PathwayConfig, ToolConfig};
pub use server::{FilesConfig, ServerConfig};

/// Main configuration structure for the Cortex gateway.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server and host-environment settings.
    pub server: ServerConfig,
    /// File collection and encryption settings.
    pub files: FilesConfig,
    /// Map of model name to model descriptor.
    pub models: IndexMap<String, ModelConfig>,
    /// Map of pathway name to pathway declaration.
    pub pathways: IndexMap<String, PathwayConfig>,
}

impl Config {
    /// Load configuration from a file path, applying environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates cross-references between pathways and models.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}
