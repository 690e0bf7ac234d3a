use std::sync::LazyLock;

use core_types::ProviderName;
use regex::Regex;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum ValidationError {
    #[error("{field} is malformed, expected something like {example}")]
    KeyFormat {
        field: &'static str,
        example: &'static str,
    },
    #[error("Access Key and Secret Key are both required")]
    IncompleteKeyPair,
    #[error("API Key is required")]
    MissingApiKey,
    #[error("Base URL is required")]
    MissingUrl,
    #[error("Base URL must use http or https")]
    UnsupportedScheme,
    #[error("Base URL is malformed: {0}")]
    MalformedUrl(String),
}

struct KeyPattern {
    pattern: Regex,
    example: &'static str,
}

fn key_pattern(provider: ProviderName) -> &'static KeyPattern {
    static OPENAI: LazyLock<KeyPattern> = LazyLock::new(|| KeyPattern {
        pattern: Regex::new(r"^sk-[a-zA-Z0-9\-_]{20,}$").expect("valid regex"),
        example: "sk-proj-xxxxxxxxxxxxxxxx",
    });
    static SK_ALNUM: LazyLock<KeyPattern> = LazyLock::new(|| KeyPattern {
        pattern: Regex::new(r"^sk-[a-zA-Z0-9]{20,}$").expect("valid regex"),
        example: "sk-xxxxxxxxxxxxxxxx",
    });
    static QIANFAN: LazyLock<KeyPattern> = LazyLock::new(|| KeyPattern {
        pattern: Regex::new(r"^[a-zA-Z0-9]{20,}$").expect("valid regex"),
        example: "ALTAKxxxxxxxxxxx",
    });

    match provider {
        ProviderName::OpenAi => &OPENAI,
        ProviderName::DeepSeek | ProviderName::DashScope => &SK_ALNUM,
        ProviderName::Qianfan => &QIANFAN,
    }
}

/// Empty keys are accepted; only a non-empty key must match the provider's format.
pub fn validate_api_key(key: &str, provider: ProviderName) -> Result<(), ValidationError> {
    validate_key_field(key, provider, "API Key")
}

fn validate_key_field(
    key: &str,
    provider: ProviderName,
    field: &'static str,
) -> Result<(), ValidationError> {
    let key = key.trim();
    if key.is_empty() {
        return Ok(());
    }
    let pattern = key_pattern(provider);
    if pattern.pattern.is_match(key) {
        Ok(())
    } else {
        Err(ValidationError::KeyFormat {
            field,
            example: pattern.example,
        })
    }
}

pub fn validate_url(raw: &str) -> Result<(), ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidationError::MissingUrl);
    }
    let parsed = Url::parse(raw).map_err(|e| ValidationError::MalformedUrl(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        _ => Err(ValidationError::UnsupportedScheme),
    }
}

pub fn validate_key_pair(access_key: &str, secret_key: &str) -> Result<(), ValidationError> {
    if access_key.trim().is_empty() || secret_key.trim().is_empty() {
        return Err(ValidationError::IncompleteKeyPair);
    }
    validate_key_field(access_key, ProviderName::Qianfan, "Access Key")?;
    validate_key_field(secret_key, ProviderName::Qianfan, "Secret Key")
}

pub fn validate_api_config(
    api_key: &str,
    base_url: &str,
    provider: ProviderName,
) -> Result<(), ValidationError> {
    if api_key.trim().is_empty() {
        return Err(ValidationError::MissingApiKey);
    }
    validate_api_key(api_key, provider)?;
    validate_url(base_url)
}

/// Trims whitespace and every trailing slash.
pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Keeps the first and last `visible` characters and masks the middle with at
/// most 20 asterisks. Short values collapse to `****`.
pub fn mask_sensitive_data(data: &str, visible: usize) -> String {
    let chars: Vec<char> = data.chars().collect();
    if chars.len() <= visible * 2 {
        return "****".to_string();
    }
    let start: String = chars[..visible].iter().collect();
    let end: String = chars[chars.len() - visible..].iter().collect();
    let masked = "*".repeat((chars.len() - visible * 2).min(20));
    format!("{start}{masked}{end}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_formats_follow_provider() {
        assert!(validate_api_key("", ProviderName::OpenAi).is_ok());
        assert!(validate_api_key("sk-proj-abc_def-ghijklmnopqrstu", ProviderName::OpenAi).is_ok());
        assert!(
            validate_api_key("sk-proj-abc_def-ghijklmnopqrstu", ProviderName::DeepSeek).is_err()
        );
        assert!(validate_api_key("sk-abcdefghijklmnopqrstuvwx", ProviderName::DashScope).is_ok());
        assert!(validate_api_key("sk-short", ProviderName::DeepSeek).is_err());
        assert_eq!(
            validate_api_key("abc", ProviderName::Qianfan),
            Err(ValidationError::KeyFormat {
                field: "API Key",
                example: "ALTAKxxxxxxxxxxx",
            })
        );
    }

    #[test]
    fn urls_must_be_http() {
        assert!(validate_url("https://api.deepseek.com").is_ok());
        assert!(validate_url("http://localhost:11434/v1").is_ok());
        assert_eq!(validate_url("  "), Err(ValidationError::MissingUrl));
        assert_eq!(
            validate_url("ftp://example.com"),
            Err(ValidationError::UnsupportedScheme)
        );
        assert!(matches!(
            validate_url("not a url"),
            Err(ValidationError::MalformedUrl(_))
        ));
    }

    #[test]
    fn key_pair_checks_both_fields() {
        assert_eq!(
            validate_key_pair("ALTAKabcdefghijklmnopqrst", ""),
            Err(ValidationError::IncompleteKeyPair)
        );
        assert_eq!(
            validate_key_pair("ALTAKabcdefghijklmnopqrst", "bad-secret"),
            Err(ValidationError::KeyFormat {
                field: "Secret Key",
                example: "ALTAKxxxxxxxxxxx",
            })
        );
        assert!(validate_key_pair("ALTAKabcdefghijklmnopqrst", "abcdefghijklmnopqrstuvwxyz").is_ok());
    }

    #[test]
    fn api_config_requires_key_and_url() {
        assert_eq!(
            validate_api_config("", "https://api.openai.com/v1", ProviderName::OpenAi),
            Err(ValidationError::MissingApiKey)
        );
        assert_eq!(
            validate_api_config("sk-abcdefghijklmnopqrstuvwx", "", ProviderName::DeepSeek),
            Err(ValidationError::MissingUrl)
        );
    }

    #[test]
    fn normalizes_trailing_slashes() {
        assert_eq!(
            normalize_url(" https://api.example.com/ "),
            "https://api.example.com"
        );
        assert_eq!(normalize_url("https://api.example.com//"), "https://api.example.com");
        assert_eq!(normalize_url("https://api.example.com"), "https://api.example.com");
    }

    #[test]
    fn masks_middle_of_secrets() {
        assert_eq!(mask_sensitive_data("short", 4), "****");
        assert_eq!(mask_sensitive_data("sk-1234567890", 4), "sk-1*****7890");
        let long = format!("sk-{}", "a".repeat(60));
        let masked = mask_sensitive_data(&long, 4);
        assert_eq!(masked, format!("sk-a{}aaaa", "*".repeat(20)));
    }
}
