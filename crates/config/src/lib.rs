mod env;
pub mod validation;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use core_types::ProviderName;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use env::EnvDefaults;
use validation::ValidationError;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_DASHSCOPE_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FontSize {
    Small,
    #[default]
    Medium,
    Large,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub enum UiLanguage {
    #[default]
    #[serde(rename = "zh-CN")]
    ZhCn,
    #[serde(rename = "en-US")]
    EnUs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct KeyPairSettings {
    #[serde(default, with = "obfuscated")]
    pub access_key: String,
    #[serde(default, with = "obfuscated")]
    pub secret_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct EndpointSettings {
    #[serde(default, with = "obfuscated")]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
}

impl EndpointSettings {
    fn with_base_url(base_url: &str) -> Self {
        Self {
            api_key: String::new(),
            base_url: base_url.to_string(),
        }
    }
}

/// User-entered credentials for one provider, before layering.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ProviderSettings {
    KeyPair(KeyPairSettings),
    Endpoint(EndpointSettings),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ApiKeyConfig {
    #[serde(default)]
    pub qianfan: KeyPairSettings,
    #[serde(default = "default_dashscope")]
    pub dashscope: EndpointSettings,
    #[serde(default = "default_deepseek")]
    pub deepseek: EndpointSettings,
    #[serde(default = "default_openai")]
    pub openai: EndpointSettings,
}

fn default_dashscope() -> EndpointSettings {
    EndpointSettings::with_base_url(DEFAULT_DASHSCOPE_BASE_URL)
}

fn default_deepseek() -> EndpointSettings {
    EndpointSettings::with_base_url(DEFAULT_DEEPSEEK_BASE_URL)
}

fn default_openai() -> EndpointSettings {
    EndpointSettings::with_base_url(DEFAULT_OPENAI_BASE_URL)
}

pub fn default_base_url(provider: ProviderName) -> Option<&'static str> {
    match provider {
        ProviderName::Qianfan => None,
        ProviderName::DashScope => Some(DEFAULT_DASHSCOPE_BASE_URL),
        ProviderName::DeepSeek => Some(DEFAULT_DEEPSEEK_BASE_URL),
        ProviderName::OpenAi => Some(DEFAULT_OPENAI_BASE_URL),
    }
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            qianfan: KeyPairSettings::default(),
            dashscope: default_dashscope(),
            deepseek: default_deepseek(),
            openai: default_openai(),
        }
    }
}

impl ApiKeyConfig {
    pub fn get(&self, provider: ProviderName) -> ProviderSettings {
        match provider {
            ProviderName::Qianfan => ProviderSettings::KeyPair(self.qianfan.clone()),
            ProviderName::DashScope => ProviderSettings::Endpoint(self.dashscope.clone()),
            ProviderName::DeepSeek => ProviderSettings::Endpoint(self.deepseek.clone()),
            ProviderName::OpenAi => ProviderSettings::Endpoint(self.openai.clone()),
        }
    }

    fn endpoint_mut(&mut self, provider: ProviderName) -> Option<&mut EndpointSettings> {
        match provider {
            ProviderName::Qianfan => None,
            ProviderName::DashScope => Some(&mut self.dashscope),
            ProviderName::DeepSeek => Some(&mut self.deepseek),
            ProviderName::OpenAi => Some(&mut self.openai),
        }
    }

    /// A provider counts as configured once its secret fields are present.
    pub fn has_api_key(&self, provider: ProviderName) -> bool {
        match self.get(provider) {
            ProviderSettings::KeyPair(pair) => {
                !pair.access_key.is_empty() && !pair.secret_key.is_empty()
            }
            ProviderSettings::Endpoint(endpoint) => !endpoint.api_key.is_empty(),
        }
    }

    fn fill_missing_base_urls(&mut self) {
        for provider in ProviderName::ALL {
            let Some(default) = default_base_url(provider) else {
                continue;
            };
            if let Some(endpoint) = self.endpoint_mut(provider)
                && endpoint.base_url.trim().is_empty()
            {
                endpoint.base_url = default.to_string();
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AppConfig {
    pub schema_version: u32,
    #[serde(default)]
    pub font_size: FontSize,
    #[serde(default)]
    pub theme: Theme,
    #[serde(default)]
    pub language: UiLanguage,
    #[serde(default)]
    pub api_keys: ApiKeyConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            font_size: FontSize::default(),
            theme: Theme::default(),
            language: UiLanguage::default(),
            api_keys: ApiKeyConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn is_configured(&self) -> bool {
        ProviderName::ALL
            .into_iter()
            .any(|provider| self.api_keys.has_api_key(provider))
    }
}

/// Partial update to one provider's credentials; `None` keeps the saved value.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyUpdate {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

/// Read side of the configuration store as seen by the provider factory.
pub trait ProviderSettingsSource: Send + Sync {
    fn read_provider_settings(&self, provider: ProviderName) -> Result<Option<ProviderSettings>>;
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("settings.json"),
        }
    }

    pub fn from_default_location() -> Result<Self> {
        let mut dir = dirs::config_dir().context("failed to resolve config_dir")?;
        dir.push("vchat");
        Ok(Self::from_dir(dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the saved settings without writing anything back.
    pub fn load(&self) -> Result<AppConfig> {
        if !self.path.exists() {
            return Ok(AppConfig::default());
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut config: AppConfig =
            serde_json::from_str(&raw).context("failed to parse settings json")?;
        if config.schema_version > CURRENT_SCHEMA_VERSION {
            warn!(
                found = config.schema_version,
                supported = CURRENT_SCHEMA_VERSION,
                "settings schema is newer than supported, using defaults"
            );
            return Ok(AppConfig::default());
        }
        self.migrate(&mut config);
        config.api_keys.fill_missing_base_urls();
        Ok(config)
    }

    pub fn load_or_init(&self) -> Result<AppConfig> {
        let config = self.load()?;
        self.save(&config)?;
        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let text = serde_json::to_string_pretty(config).context("failed to serialize settings")?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    /// Validates and persists new credentials for one provider. Validation
    /// failures leave the saved file untouched.
    pub fn update_api_key(
        &self,
        provider: ProviderName,
        update: ApiKeyUpdate,
    ) -> Result<AppConfig> {
        let mut config = self.load()?;
        apply_api_key_update(&mut config.api_keys, provider, update)?;
        self.save(&config)?;
        info!(provider = %provider, "saved provider credentials");
        Ok(config)
    }

    pub fn reset(&self) -> Result<AppConfig> {
        let config = AppConfig::default();
        self.save(&config)?;
        Ok(config)
    }

    /// Plain JSON for backups; credentials are not obfuscated here.
    pub fn export_json(&self) -> Result<String> {
        let config = self.load()?;
        let value = plain_export(&config);
        serde_json::to_string_pretty(&value).context("failed to serialize settings export")
    }

    pub fn import_json(&self, text: &str) -> Result<AppConfig> {
        let value: serde_json::Value =
            serde_json::from_str(text).context("settings import is not valid json")?;
        let mut config = plain_import(value)?;
        config.schema_version = CURRENT_SCHEMA_VERSION;
        config.api_keys.fill_missing_base_urls();
        self.save(&config)?;
        Ok(config)
    }

    fn migrate(&self, config: &mut AppConfig) {
        if config.schema_version >= CURRENT_SCHEMA_VERSION {
            return;
        }

        warn!(
            from = config.schema_version,
            to = CURRENT_SCHEMA_VERSION,
            "migrating settings schema"
        );
        config.schema_version = CURRENT_SCHEMA_VERSION;
    }
}

impl ProviderSettingsSource for ConfigStore {
    fn read_provider_settings(&self, provider: ProviderName) -> Result<Option<ProviderSettings>> {
        let config = self.load()?;
        Ok(Some(config.api_keys.get(provider)))
    }
}

fn apply_api_key_update(
    keys: &mut ApiKeyConfig,
    provider: ProviderName,
    update: ApiKeyUpdate,
) -> Result<(), ValidationError> {
    match provider {
        ProviderName::Qianfan => {
            let access_key = non_empty(update.access_key)
                .unwrap_or_else(|| keys.qianfan.access_key.clone());
            let secret_key = non_empty(update.secret_key)
                .unwrap_or_else(|| keys.qianfan.secret_key.clone());
            if !access_key.is_empty() || !secret_key.is_empty() {
                validation::validate_key_pair(&access_key, &secret_key)?;
            }
            keys.qianfan = KeyPairSettings {
                access_key,
                secret_key,
            };
        }
        _ => {
            let Some(current) = keys.endpoint_mut(provider) else {
                return Ok(());
            };
            let api_key = non_empty(update.api_key).unwrap_or_else(|| current.api_key.clone());
            let supplied_url = non_empty(update.base_url);
            if let Some(url) = &supplied_url {
                validation::validate_url(url)?;
            }
            let base_url = supplied_url.unwrap_or_else(|| current.base_url.clone());
            if !api_key.is_empty() {
                validation::validate_api_config(&api_key, &base_url, provider)?;
            }
            *current = EndpointSettings {
                api_key,
                base_url: validation::normalize_url(&base_url),
            };
        }
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn plain_export(config: &AppConfig) -> serde_json::Value {
    let keys = &config.api_keys;
    let endpoint = |e: &EndpointSettings| {
        serde_json::json!({ "api_key": e.api_key, "base_url": e.base_url })
    };
    serde_json::json!({
        "font_size": config.font_size,
        "theme": config.theme,
        "language": config.language,
        "api_keys": {
            "qianfan": {
                "access_key": keys.qianfan.access_key,
                "secret_key": keys.qianfan.secret_key,
            },
            "dashscope": endpoint(&keys.dashscope),
            "deepseek": endpoint(&keys.deepseek),
            "openai": endpoint(&keys.openai),
        }
    })
}

fn plain_import(value: serde_json::Value) -> Result<AppConfig> {
    let mut config = AppConfig::default();
    if let Some(font_size) = value.get("font_size") {
        config.font_size = serde_json::from_value(font_size.clone()).context("invalid font_size")?;
    }
    if let Some(theme) = value.get("theme") {
        config.theme = serde_json::from_value(theme.clone()).context("invalid theme")?;
    }
    if let Some(language) = value.get("language") {
        config.language = serde_json::from_value(language.clone()).context("invalid language")?;
    }
    let Some(keys) = value.get("api_keys") else {
        return Ok(config);
    };
    let text = |v: Option<&serde_json::Value>| {
        v.and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    if let Some(pair) = keys.get("qianfan") {
        config.api_keys.qianfan = KeyPairSettings {
            access_key: text(pair.get("access_key")),
            secret_key: text(pair.get("secret_key")),
        };
    }
    for provider in [
        ProviderName::DashScope,
        ProviderName::DeepSeek,
        ProviderName::OpenAi,
    ] {
        let Some(entry) = keys.get(provider.as_str()) else {
            continue;
        };
        if let Some(endpoint) = config.api_keys.endpoint_mut(provider) {
            endpoint.api_key = text(entry.get("api_key"));
            let base_url = text(entry.get("base_url"));
            if !base_url.is_empty() {
                endpoint.base_url = base_url;
            }
        }
    }
    Ok(config)
}

/// Base64 on disk so keys are not stored as plain text. This is obfuscation,
/// not encryption.
mod obfuscated {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::BASE64;

    pub fn serialize<S: Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_empty() {
            return serializer.serialize_str("");
        }
        serializer.serialize_str(&BASE64.encode(value.as_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(decode(&raw))
    }

    pub(super) fn decode(raw: &str) -> String {
        if raw.is_empty() {
            return String::new();
        }
        match BASE64.decode(raw.as_bytes()) {
            Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| raw.to_string()),
            Err(_) => raw.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    const OPENAI_KEY: &str = "sk-proj-abcdefghijklmnopqrstuvwxyz";

    #[test]
    fn load_returns_defaults_when_missing() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::from_dir(dir.path());
        let config = store.load().expect("load default");
        assert_eq!(config.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(config.api_keys.openai.base_url, DEFAULT_OPENAI_BASE_URL);
        assert!(!store.path().exists());
        assert!(!config.is_configured());
    }

    #[test]
    fn keys_are_obfuscated_on_disk_and_restored_on_load() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::from_dir(dir.path());
        store
            .update_api_key(
                ProviderName::OpenAi,
                ApiKeyUpdate {
                    api_key: Some(OPENAI_KEY.to_string()),
                    base_url: Some("https://proxy.example.com/v1/".to_string()),
                    ..Default::default()
                },
            )
            .expect("update");

        let raw = fs::read_to_string(store.path()).expect("read file");
        assert!(!raw.contains(OPENAI_KEY));

        let config = store.load().expect("load");
        assert_eq!(config.api_keys.openai.api_key, OPENAI_KEY);
        assert_eq!(
            config.api_keys.openai.base_url,
            "https://proxy.example.com/v1"
        );
        assert!(config.api_keys.has_api_key(ProviderName::OpenAi));
    }

    #[test]
    fn invalid_key_is_rejected_and_not_saved() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::from_dir(dir.path());
        let err = store
            .update_api_key(
                ProviderName::DeepSeek,
                ApiKeyUpdate {
                    api_key: Some("not-a-key".to_string()),
                    ..Default::default()
                },
            )
            .expect_err("must fail");
        assert!(err.downcast_ref::<ValidationError>().is_some(), "{err}");
        assert!(!store.path().exists());
    }

    #[test]
    fn base_url_alone_is_validated_and_normalized() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::from_dir(dir.path());
        let err = store
            .update_api_key(
                ProviderName::OpenAi,
                ApiKeyUpdate {
                    base_url: Some("ftp://x/".to_string()),
                    ..Default::default()
                },
            )
            .expect_err("ftp is not a supported scheme");
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::UnsupportedScheme)
        );
        assert!(!store.path().exists());

        let config = store
            .update_api_key(
                ProviderName::OpenAi,
                ApiKeyUpdate {
                    base_url: Some("https://proxy.example.com/v1/".to_string()),
                    ..Default::default()
                },
            )
            .expect("https url accepted without a key");
        assert_eq!(
            config.api_keys.openai.base_url,
            "https://proxy.example.com/v1"
        );
    }

    #[test]
    fn qianfan_requires_both_keys() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::from_dir(dir.path());
        let err = store
            .update_api_key(
                ProviderName::Qianfan,
                ApiKeyUpdate {
                    access_key: Some("ALTAKabcdefghijklmnopqrst".to_string()),
                    ..Default::default()
                },
            )
            .expect_err("secret key missing");
        assert!(err.to_string().contains("Secret Key"), "{err}");
    }

    #[test]
    fn empty_saved_base_url_falls_back_to_default() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::from_dir(dir.path());
        fs::write(
            store.path(),
            r#"{"schema_version":1,"api_keys":{"deepseek":{"api_key":"","base_url":""}}}"#,
        )
        .expect("write");
        let config = store.load().expect("load");
        assert_eq!(config.api_keys.deepseek.base_url, DEFAULT_DEEPSEEK_BASE_URL);
        assert_eq!(config.language, UiLanguage::ZhCn);
    }

    #[test]
    fn undecodable_key_is_kept_verbatim() {
        assert_eq!(obfuscated::decode("plain key!"), "plain key!");
        assert_eq!(obfuscated::decode(""), "");
    }

    #[test]
    fn newer_schema_falls_back_to_defaults() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::from_dir(dir.path());
        fs::write(store.path(), r#"{"schema_version":99,"theme":"dark"}"#).expect("write");
        let config = store.load().expect("load");
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn export_then_import_restores_settings() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::from_dir(dir.path());
        let mut config = AppConfig::default();
        config.theme = Theme::Dark;
        config.api_keys.openai.api_key = OPENAI_KEY.to_string();
        store.save(&config).expect("save");

        let exported = store.export_json().expect("export");
        assert!(exported.contains(OPENAI_KEY));

        let other = ConfigStore::from_dir(dir.path().join("other"));
        let imported = other.import_json(&exported).expect("import");
        assert_eq!(imported, config);
    }

    #[test]
    fn settings_source_reads_latest_saved_file() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::from_dir(dir.path());
        let settings = store
            .read_provider_settings(ProviderName::OpenAi)
            .expect("read");
        assert_eq!(
            settings,
            Some(ProviderSettings::Endpoint(default_openai()))
        );

        let mut config = AppConfig::default();
        config.api_keys.qianfan.access_key = "ak".to_string();
        store.save(&config).expect("save");
        let settings = store
            .read_provider_settings(ProviderName::Qianfan)
            .expect("read");
        assert_eq!(
            settings,
            Some(ProviderSettings::KeyPair(KeyPairSettings {
                access_key: "ak".to_string(),
                secret_key: String::new(),
            }))
        );
    }
}
