use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use config::validation::mask_sensitive_data;
use config::{ApiKeyUpdate, AppConfig, ConfigStore, ProviderSettings};
use core_types::ProviderName;
use serde_json::{Map, Value, json};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the settings with credentials masked.
    Show,
    /// Validate and save credentials for one provider.
    SetKey {
        #[arg(long)]
        provider: ProviderName,
        #[arg(long)]
        access_key: Option<String>,
        #[arg(long)]
        secret_key: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
    },
    /// Restore default settings.
    Reset,
    /// Print the settings as plain JSON.
    Export,
    /// Replace the settings with a previously exported file.
    Import { file: PathBuf },
}

pub fn run(store: &ConfigStore, command: ConfigCommand) -> Result<String> {
    match command {
        ConfigCommand::Show => {
            let config = store.load()?;
            to_pretty(&masked_view(&config))
        }
        ConfigCommand::SetKey {
            provider,
            access_key,
            secret_key,
            api_key,
            base_url,
        } => {
            let config = store.update_api_key(
                provider,
                ApiKeyUpdate {
                    access_key,
                    secret_key,
                    api_key,
                    base_url,
                },
            )?;
            let configured = config.api_keys.has_api_key(provider);
            Ok(format!(
                "saved {} credentials to {} (configured: {configured})",
                provider.title(),
                store.path().display()
            ))
        }
        ConfigCommand::Reset => {
            store.reset()?;
            Ok(format!("settings reset: {}", store.path().display()))
        }
        ConfigCommand::Export => store.export_json(),
        ConfigCommand::Import { file } => {
            let text = fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            store.import_json(&text)?;
            Ok(format!("settings imported from {}", file.display()))
        }
    }
}

fn masked_view(config: &AppConfig) -> Value {
    let mut providers = Map::new();
    for provider in ProviderName::ALL {
        let view = match config.api_keys.get(provider) {
            ProviderSettings::KeyPair(keys) => json!({
                "access_key": mask(&keys.access_key),
                "secret_key": mask(&keys.secret_key),
            }),
            ProviderSettings::Endpoint(endpoint) => json!({
                "api_key": mask(&endpoint.api_key),
                "base_url": endpoint.base_url,
            }),
        };
        providers.insert(provider.as_str().to_string(), view);
    }
    json!({
        "schema_version": config.schema_version,
        "font_size": config.font_size,
        "theme": config.theme,
        "language": config.language,
        "configured": config.is_configured(),
        "api_keys": providers,
    })
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        mask_sensitive_data(secret, 4)
    }
}

fn to_pretty(value: &Value) -> Result<String> {
    serde_json::to_string_pretty(value).context("failed to render settings")
}
