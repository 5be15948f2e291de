//! Configuration loading, environment overrides and validation.

use std::path::Path;

use anyhow::{Context, bail};
use secrecy::SecretString;

use crate::Config;

/// Environment variables the host may set to override file configuration.
/// The camel-case names mirror the embedding host's contract.
const ENV_PORT: &str = "CORTEX_PORT";
const ENV_ENABLE_REST: &str = "CORTEX_ENABLE_REST";
const ENV_MEDIA_API_URL: &str = "WHISPER_MEDIA_API_URL";
const ENV_APPTEK_ENDPOINT: &str = "APPTEK_API_ENDPOINT";
const ENV_APPTEK_KEY: &str = "APPTEK_API_KEY";
const ENV_STORAGE: &str = "storageConnectionString";
const ENV_ENCRYPTION_KEY: &str = "redisEncryptionKey";
const ENV_CORTEX_ID: &str = "cortexId";

pub(crate) fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| format!("invalid configuration in {}", path.display()))?;

    apply_env_overrides(&mut config)?;
    validate(&config)?;

    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> anyhow::Result<()> {
    if let Ok(port) = std::env::var(ENV_PORT) {
        config.server.port = port
            .parse()
            .with_context(|| format!("{ENV_PORT} must be a port number, got {port:?}"))?;
    }

    if let Ok(enabled) = std::env::var(ENV_ENABLE_REST) {
        config.server.enable_rest = enabled.eq_ignore_ascii_case("true") || enabled == "1";
    }

    if let Ok(url) = std::env::var(ENV_MEDIA_API_URL) {
        config.files.media_api_url = Some(url);
    }

    if let Ok(endpoint) = std::env::var(ENV_APPTEK_ENDPOINT) {
        config.files.apptek_api_endpoint = Some(endpoint);
    }

    if let Ok(key) = std::env::var(ENV_APPTEK_KEY) {
        config.files.apptek_api_key = Some(SecretString::from(key));
    }

    if let Ok(connection) = std::env::var(ENV_STORAGE) {
        config.server.storage_connection_string = Some(connection);
    }

    if let Ok(key) = std::env::var(ENV_ENCRYPTION_KEY) {
        config.files.encryption_key = Some(SecretString::from(key));
    }

    if let Ok(id) = std::env::var(ENV_CORTEX_ID) {
        config.server.cortex_id = Some(id);
    }

    Ok(())
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    for (name, model) in &config.models {
        if model.endpoints.is_empty() {
            bail!("model '{name}' declares no endpoints");
        }
    }

    for (name, pathway) in &config.pathways {
        if pathway.model.is_empty() {
            bail!("pathway '{name}' declares no model");
        }

        if !config.models.contains_key(&pathway.model) {
            bail!("pathway '{name}' references unknown model '{}'", pathway.model);
        }

        if pathway.prompts.is_empty() {
            bail!("pathway '{name}' declares no prompt templates");
        }

        if let Some(fallback) = &pathway.fallback_pathway {
            if !config.pathways.contains_key(fallback) {
                bail!("pathway '{name}' references unknown fallback pathway '{fallback}'");
            }

            if fallback == name {
                bail!("pathway '{name}' falls back to itself");
            }
        }
    }

    Ok(())
}
