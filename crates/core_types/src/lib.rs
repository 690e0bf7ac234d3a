use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type CorrelationId = i64;
pub type RelayResult<T> = std::result::Result<T, RelayError>;
pub type ChunkStream = Pin<Box<dyn Stream<Item = RelayResult<UniversalChunk>> + Send + 'static>>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ProviderName {
    Qianfan,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "dashscope")]
    DashScope,
    #[serde(rename = "deepseek")]
    DeepSeek,
}

/// Authentication family a provider belongs to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ProviderKind {
    KeyPair,
    Bearer,
}

impl ProviderName {
    pub const ALL: [ProviderName; 4] = [
        ProviderName::Qianfan,
        ProviderName::DashScope,
        ProviderName::DeepSeek,
        ProviderName::OpenAi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderName::Qianfan => "qianfan",
            ProviderName::OpenAi => "openai",
            ProviderName::DashScope => "dashscope",
            ProviderName::DeepSeek => "deepseek",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            ProviderName::Qianfan => "文心一言",
            ProviderName::OpenAi => "OpenAI",
            ProviderName::DashScope => "通义千问",
            ProviderName::DeepSeek => "DeepSeek",
        }
    }

    pub fn kind(self) -> ProviderKind {
        match self {
            ProviderName::Qianfan => ProviderKind::KeyPair,
            ProviderName::OpenAi | ProviderName::DashScope | ProviderName::DeepSeek => {
                ProviderKind::Bearer
            }
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = RelayError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        ProviderName::ALL
            .into_iter()
            .find(|name| name.as_str() == normalized)
            .ok_or_else(|| RelayError::UnknownProvider(value.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            image_path: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn with_image(mut self, path: impl Into<String>) -> Self {
        self.image_path = Some(path.into());
        self
    }
}

/// One user-submitted turn, as it arrives from the UI boundary.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(rename = "messageId")]
    pub correlation_id: CorrelationId,
    pub provider_name: String,
    #[serde(rename = "selectedModel")]
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct UniversalChunk {
    pub is_end: bool,
    #[serde(rename = "result")]
    pub text: String,
}

impl UniversalChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            is_end: false,
            text: text.into(),
        }
    }

    pub fn end(text: impl Into<String>) -> Self {
        Self {
            is_end: true,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StreamUpdate {
    #[serde(rename = "messageId")]
    pub correlation_id: CorrelationId,
    #[serde(rename = "data")]
    pub chunk: UniversalChunk,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StreamError {
    #[serde(rename = "messageId")]
    pub correlation_id: CorrelationId,
    pub code: String,
    #[serde(rename = "error")]
    pub message: String,
}

impl StreamError {
    pub fn from_error(correlation_id: CorrelationId, err: &RelayError) -> Self {
        Self {
            correlation_id,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Everything that crosses from the relay to the UI boundary.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "channel", content = "payload")]
pub enum RelayEvent {
    #[serde(rename = "update-message")]
    Update(StreamUpdate),
    #[serde(rename = "chat-error")]
    Error(StreamError),
}

impl RelayEvent {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            RelayEvent::Update(update) => update.correlation_id,
            RelayEvent::Error(error) => error.correlation_id,
        }
    }
}

#[derive(Clone, Eq, PartialEq)]
pub enum ProviderConfig {
    KeyPair {
        access_key: String,
        secret_key: String,
    },
    Bearer {
        api_key: String,
        base_url: String,
    },
}

// Credentials stay out of logs.
impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderConfig::KeyPair { .. } => f
                .debug_struct("KeyPair")
                .field("access_key", &"<redacted>")
                .field("secret_key", &"<redacted>")
                .finish(),
            ProviderConfig::Bearer { base_url, .. } => f
                .debug_struct("Bearer")
                .field("api_key", &"<redacted>")
                .field("base_url", base_url)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum RelayError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("provider {provider} is missing required configuration `{field}`")]
    MissingConfiguration {
        provider: ProviderName,
        field: &'static str,
    },
    #[error("provider {provider} has invalid configuration: {message}")]
    InvalidConfiguration {
        provider: ProviderName,
        message: String,
    },
    #[error("invalid chat request: {0}")]
    InvalidRequest(String),
    #[error("{provider} rejected the credentials: {message}")]
    ProviderAuth {
        provider: ProviderName,
        message: String,
    },
    #[error("{provider} request failed ({status}): {message}")]
    ProviderRequest {
        provider: ProviderName,
        status: u16,
        message: String,
    },
    #[error("network error talking to {provider}: {message}")]
    Network {
        provider: ProviderName,
        message: String,
    },
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::UnknownProvider(_) => "UNKNOWN_PROVIDER",
            RelayError::MissingConfiguration { .. } => "MISSING_CONFIGURATION",
            RelayError::InvalidConfiguration { .. } => "INVALID_CONFIGURATION",
            RelayError::InvalidRequest(_) => "INVALID_REQUEST",
            RelayError::ProviderAuth { .. } => "PROVIDER_AUTH_FAILED",
            RelayError::ProviderRequest { .. } => "PROVIDER_REQUEST_FAILED",
            RelayError::Network { .. } => "NETWORK_ERROR",
        }
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> ProviderName;

    /// Opens one upstream stream. The returned sequence owns the connection;
    /// dropping it releases the connection.
    async fn chat(&self, messages: &[ChatMessage], model: &str) -> RelayResult<ChunkStream>;
}

/// Builds a provider for a single chat request.
pub trait ProviderResolver: Send + Sync {
    fn create(&self, provider_name: &str) -> RelayResult<Box<dyn ChatProvider>>;
}
