use std::collections::HashMap;

use core_types::ProviderName;

/// Process-level fallback values for provider credentials.
#[derive(Debug, Clone, Default)]
pub struct EnvDefaults {
    vars: HashMap<String, String>,
}

impl EnvDefaults {
    /// Snapshots the provider variables from the current process environment.
    pub fn from_process() -> Self {
        let vars = ProviderName::ALL
            .into_iter()
            .flat_map(env_keys)
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
            .collect();
        Self { vars }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Looks up the default for `field` of `provider`, ignoring blank values.
    pub fn get(&self, provider: ProviderName, field: &str) -> Option<&str> {
        let key = env_key(provider, field)?;
        self.vars
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

pub fn env_key(provider: ProviderName, field: &str) -> Option<&'static str> {
    let key = match (provider, field) {
        (ProviderName::Qianfan, "access_key") => "QIANFAN_ACCESS_KEY",
        (ProviderName::Qianfan, "secret_key") => "QIANFAN_SECRET_KEY",
        (ProviderName::OpenAi, "api_key") => "OPENAI_API_KEY",
        (ProviderName::OpenAi, "base_url") => "OPENAI_BASE_URL",
        (ProviderName::DashScope, "api_key") => "DASHSCOPE_API_KEY",
        (ProviderName::DashScope, "base_url") => "DASHSCOPE_BASE_URL",
        (ProviderName::DeepSeek, "api_key") => "DEEPSEEK_API_KEY",
        (ProviderName::DeepSeek, "base_url") => "DEEPSEEK_BASE_URL",
        _ => return None,
    };
    Some(key)
}

fn env_keys(provider: ProviderName) -> Vec<&'static str> {
    ["access_key", "secret_key", "api_key", "base_url"]
        .into_iter()
        .filter_map(|field| env_key(provider, field))
        .collect()
}
