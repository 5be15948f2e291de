use std::{sync::OnceLock, time::Duration};

use reqwest::Client;

/// Shared client builder for all plugins.
///
/// No total request timeout: streamed completions from reasoning models can
/// stay silent for minutes, and the pathway deadline is enforced by the
/// executor. The pool idle timeout stays low so DNS changes are picked up.
pub(crate) fn default_http_client_builder() -> reqwest::ClientBuilder {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
}

/// Common HTTP client to re-use as much as possible the same connections.
pub(crate) fn http_client() -> reqwest::Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();

    CLIENT
        .get_or_init(|| {
            default_http_client_builder()
                .build()
                .expect("failed to build default HTTP client")
        })
        .clone()
}
