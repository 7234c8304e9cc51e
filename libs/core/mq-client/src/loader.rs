//! Fetches and caches the YAML configuration document.

use crate::config::MqConfig;
use crate::error::MqError;
use tracing::{debug, error, info};

/// Loads an [`MqConfig`] from an HTTP(S) URL or a local path.
///
/// The first successful load is cached; later calls return the cached
/// configuration until the location changes or [`ConfigLoader::invalidate`]
/// is called. Failed loads are never cached.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    client: reqwest::Client,
    location: Option<String>,
    cached: Option<MqConfig>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured HTTP client (proxies, timeouts, TLS roots).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            ..Default::default()
        }
    }

    /// The last non-empty location that was supplied.
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// The cached configuration, if a load has succeeded.
    pub fn cached(&self) -> Option<&MqConfig> {
        self.cached.as_ref()
    }

    /// Remember `location`; an empty string keeps the previous one.
    pub fn set_location(&mut self, location: &str) {
        let location = location.trim();
        if location.is_empty() || self.location.as_deref() == Some(location) {
            return;
        }
        self.location = Some(location.to_string());
        self.cached = None;
    }

    /// Drop the cached configuration so the next load fetches again.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Remember `location` (if non-empty) and load from the remembered one.
    pub async fn load_from(&mut self, location: &str) -> Result<MqConfig, MqError> {
        self.set_location(location);
        self.load().await
    }

    /// Load from the remembered location, using the cache when possible.
    pub async fn load(&mut self) -> Result<MqConfig, MqError> {
        if let Some(config) = &self.cached {
            debug!("Using cached mq configuration");
            return Ok(config.clone());
        }

        let Some(location) = self.location.clone() else {
            error!("No mq configuration location was ever supplied");
            return Err(MqError::EmptySource);
        };

        let document = self.fetch(&location).await.inspect_err(|e| {
            error!(location = %location, error = %e, "Failed to fetch mq configuration");
        })?;

        let config = MqConfig::from_yaml(&document).inspect_err(|e| {
            error!(location = %location, error = %e, "Failed to parse mq configuration");
        })?;

        info!(
            location = %location,
            name_servers = ?config.name_servers,
            "Loaded mq configuration"
        );
        self.cached = Some(config.clone());
        Ok(config)
    }

    async fn fetch(&self, location: &str) -> Result<String, MqError> {
        if is_remote(location) {
            let fetch_error = |message: String| MqError::Fetch {
                url: location.to_string(),
                message,
            };

            let response = self
                .client
                .get(location)
                .send()
                .await
                .map_err(|e| fetch_error(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(fetch_error(format!(
                    "request failed with status {}: {}",
                    status,
                    body.trim()
                )));
            }

            response.text().await.map_err(|e| fetch_error(e.to_string()))
        } else {
            tokio::fs::read_to_string(location)
                .await
                .map_err(|e| MqError::Read {
                    path: location.to_string(),
                    message: e.to_string(),
                })
        }
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}
