//! Server and host-environment configuration.

use secrecy::SecretString;
use serde::Deserialize;

/// HTTP server and host identifiers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Port the REST surface binds to. Overridden by `CORTEX_PORT`.
    pub port: u16,

    /// Whether the OpenAI-compatible REST surface is exposed. Overridden by
    /// `CORTEX_ENABLE_REST`.
    pub enable_rest: bool,

    /// Identifier of this gateway instance.
    pub cortex_id: Option<String>,

    /// Connection string for the external key/value collaborator.
    pub storage_connection_string: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4089,
            enable_rest: false,
            cortex_id: None,
            storage_connection_string: None,
        }
    }
}

/// File collection, file handler and encryption settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FilesConfig {
    /// Base URL of the file-handler collaborator
    /// (`POST /api/CortexFileHandler`). Overridden by `WHISPER_MEDIA_API_URL`.
    pub media_api_url: Option<String>,

    /// System-layer encryption key for file metadata at rest. Overridden by
    /// `redisEncryptionKey`.
    pub encryption_key: Option<SecretString>,

    /// Endpoint of the external translation provider. Overridden by
    /// `APPTEK_API_ENDPOINT`.
    pub apptek_api_endpoint: Option<String>,

    /// API key for the external translation provider. Overridden by
    /// `APPTEK_API_KEY`.
    pub apptek_api_key: Option<SecretString>,
}
