use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use config::validation::normalize_url;
use config::{EnvDefaults, ProviderSettings, ProviderSettingsSource};
use core_types::{
    ChatProvider, ProviderConfig, ProviderKind, ProviderName, ProviderResolver, RelayError,
    RelayResult,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::openai::OpenAiCompatibleProvider;
use crate::qianfan::{QianfanEndpoints, QianfanProvider};

pub const DEFAULT_CONFIG_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct CachedConfig {
    config: ProviderConfig,
    loaded_at: Instant,
}

/// Builds a fresh provider per request from user settings layered over
/// process defaults. Resolved configuration is cached for a short TTL.
pub struct ProviderFactory {
    source: Arc<dyn ProviderSettingsSource>,
    defaults: EnvDefaults,
    ttl: Duration,
    qianfan_endpoints: QianfanEndpoints,
    cache: RwLock<HashMap<ProviderName, CachedConfig>>,
    refreshing: HashMap<ProviderName, Mutex<()>>,
}

impl ProviderFactory {
    pub fn new(source: Arc<dyn ProviderSettingsSource>, defaults: EnvDefaults) -> Self {
        Self {
            source,
            defaults,
            ttl: DEFAULT_CONFIG_TTL,
            qianfan_endpoints: QianfanEndpoints::default(),
            cache: RwLock::new(HashMap::new()),
            refreshing: ProviderName::ALL
                .into_iter()
                .map(|provider| (provider, Mutex::new(())))
                .collect(),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_qianfan_endpoints(mut self, endpoints: QianfanEndpoints) -> Self {
        self.qianfan_endpoints = endpoints;
        self
    }

    /// Returns the layered configuration for `provider`, re-reading the
    /// settings store once the cached entry is older than the TTL.
    pub fn resolve_config(&self, provider: ProviderName) -> RelayResult<ProviderConfig> {
        if let Some(config) = self.cached(provider) {
            return Ok(config);
        }

        // One refresher per provider; callers that queued behind it reuse its result.
        let _refresh = self.refreshing.get(&provider).map(|guard| guard.lock());
        if let Some(config) = self.cached(provider) {
            return Ok(config);
        }

        // The store is read without holding the cache lock.
        let settings = self
            .source
            .read_provider_settings(provider)
            .map_err(|err| RelayError::InvalidConfiguration {
                provider,
                message: format!("failed to read settings: {err:#}"),
            })?;
        let config = self.layer(provider, settings.as_ref())?;

        self.cache.write().insert(
            provider,
            CachedConfig {
                config: config.clone(),
                loaded_at: Instant::now(),
            },
        );
        debug!(provider = %provider, "resolved provider configuration");
        Ok(config)
    }

    pub fn invalidate(&self, provider: ProviderName) {
        self.cache.write().remove(&provider);
    }

    pub fn invalidate_all(&self) {
        self.cache.write().clear();
        debug!("provider configuration cache cleared");
    }

    pub fn build(&self, provider: ProviderName) -> RelayResult<Box<dyn ChatProvider>> {
        let config = self.resolve_config(provider)?;
        let built: Box<dyn ChatProvider> = match config {
            ProviderConfig::KeyPair {
                access_key,
                secret_key,
            } => Box::new(QianfanProvider::with_endpoints(
                access_key,
                secret_key,
                self.qianfan_endpoints.clone(),
            )?),
            ProviderConfig::Bearer { api_key, base_url } => Box::new(
                OpenAiCompatibleProvider::new(provider, api_key, base_url)?,
            ),
        };
        Ok(built)
    }

    fn cached(&self, provider: ProviderName) -> Option<ProviderConfig> {
        let cache = self.cache.read();
        cache
            .get(&provider)
            .filter(|entry| entry.loaded_at.elapsed() < self.ttl)
            .map(|entry| entry.config.clone())
    }

    fn layer(
        &self,
        provider: ProviderName,
        settings: Option<&ProviderSettings>,
    ) -> RelayResult<ProviderConfig> {
        match provider.kind() {
            ProviderKind::KeyPair => {
                let (access_key, secret_key) = match settings {
                    Some(ProviderSettings::KeyPair(keys)) => {
                        (Some(keys.access_key.as_str()), Some(keys.secret_key.as_str()))
                    }
                    Some(ProviderSettings::Endpoint(_)) => {
                        warn!(provider = %provider, "ignoring settings of the wrong shape");
                        (None, None)
                    }
                    None => (None, None),
                };
                Ok(ProviderConfig::KeyPair {
                    access_key: self.pick(provider, "access_key", access_key)?,
                    secret_key: self.pick(provider, "secret_key", secret_key)?,
                })
            }
            ProviderKind::Bearer => {
                let (api_key, base_url) = match settings {
                    Some(ProviderSettings::Endpoint(endpoint)) => {
                        (Some(endpoint.api_key.as_str()), Some(endpoint.base_url.as_str()))
                    }
                    Some(ProviderSettings::KeyPair(_)) => {
                        warn!(provider = %provider, "ignoring settings of the wrong shape");
                        (None, None)
                    }
                    None => (None, None),
                };
                let base_url = normalize_url(&self.pick(provider, "base_url", base_url)?);
                if base_url.is_empty() {
                    return Err(RelayError::MissingConfiguration {
                        provider,
                        field: "base_url",
                    });
                }
                Ok(ProviderConfig::Bearer {
                    api_key: self.pick(provider, "api_key", api_key)?,
                    base_url,
                })
            }
        }
    }

    /// User value when non-blank, else the process default.
    fn pick(
        &self,
        provider: ProviderName,
        field: &'static str,
        user: Option<&str>,
    ) -> RelayResult<String> {
        user.map(str::trim)
            .filter(|value| !value.is_empty())
            .or_else(|| self.defaults.get(provider, field))
            .map(str::to_string)
            .ok_or(RelayError::MissingConfiguration { provider, field })
    }
}

impl ProviderResolver for ProviderFactory {
    fn create(&self, provider_name: &str) -> RelayResult<Box<dyn ChatProvider>> {
        let provider: ProviderName = provider_name.parse()?;
        self.build(provider)
    }
}
