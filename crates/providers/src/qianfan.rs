use async_trait::async_trait;
use core_types::{
    ChatMessage, ChatProvider, ChunkStream, ProviderName, RelayError, RelayResult, UniversalChunk,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::http::{
    build_client, chunk_stream, error_from_response, error_message, is_json_response,
    network_error, parse_unit, response_frames,
};
use crate::sse::SseFrame;

pub const DEFAULT_AUTH_BASE: &str = "https://aip.baidubce.com";
pub const DEFAULT_API_BASE: &str = "https://aip.baidubce.com";

const PROVIDER: ProviderName = ProviderName::Qianfan;
const CHAT_PATH: &str = "rpc/2.0/ai_custom/v1/wenxinworkshop/chat";

/// Error codes that mean the key pair or access token was rejected.
const AUTH_ERROR_CODES: [i64; 5] = [6, 13, 14, 110, 111];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QianfanEndpoints {
    pub auth_base: String,
    pub api_base: String,
}

impl Default for QianfanEndpoints {
    fn default() -> Self {
        Self {
            auth_base: DEFAULT_AUTH_BASE.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

/// Baidu Qianfan (ERNIE) provider authenticated with an access/secret key
/// pair. The key pair is exchanged for an access token on the first `chat`
/// call and the token is reused for the lifetime of the instance.
pub struct QianfanProvider {
    client: reqwest::Client,
    access_key: String,
    secret_key: String,
    endpoints: QianfanEndpoints,
    access_token: OnceCell<String>,
}

impl QianfanProvider {
    pub fn with_endpoints(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        endpoints: QianfanEndpoints,
    ) -> RelayResult<Self> {
        Ok(Self {
            client: build_client(PROVIDER)?,
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            endpoints: QianfanEndpoints {
                auth_base: endpoints.auth_base.trim_end_matches('/').to_string(),
                api_base: endpoints.api_base.trim_end_matches('/').to_string(),
            },
            access_token: OnceCell::new(),
        })
    }

    async fn access_token(&self) -> RelayResult<&str> {
        self.access_token
            .get_or_try_init(|| self.fetch_access_token())
            .await
            .map(String::as_str)
    }

    async fn fetch_access_token(&self) -> RelayResult<String> {
        debug!(provider = %PROVIDER, "exchanging key pair for access token");
        let url = format!("{}/oauth/2.0/token", self.endpoints.auth_base);
        let response = self
            .client
            .post(&url)
            .query(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.access_key.trim()),
                ("client_secret", self.secret_key.trim()),
            ])
            .send()
            .await
            .map_err(|err| network_error(PROVIDER, err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| network_error(PROVIDER, err))?;
        if !status.is_success() {
            return Err(RelayError::ProviderAuth {
                provider: PROVIDER,
                message: error_message(&body),
            });
        }

        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|err| RelayError::ProviderAuth {
                provider: PROVIDER,
                message: format!("unreadable token response: {err}"),
            })?;
        match token.access_token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(RelayError::ProviderAuth {
                provider: PROVIDER,
                message: token
                    .error_description
                    .unwrap_or_else(|| "token response carried no access_token".to_string()),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QianfanUnit {
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_end: bool,
}

#[async_trait]
impl ChatProvider for QianfanProvider {
    fn name(&self) -> ProviderName {
        PROVIDER
    }

    async fn chat(&self, messages: &[ChatMessage], model: &str) -> RelayResult<ChunkStream> {
        let token = self.access_token().await?;
        let endpoint = model_endpoint(model);
        let url = format!("{}/{CHAT_PATH}/{endpoint}", self.endpoints.api_base);
        debug!(provider = %PROVIDER, model, endpoint = %endpoint, "opening stream");

        let response = self
            .client
            .post(&url)
            .query(&[("access_token", token)])
            .json(&request_body(messages))
            .send()
            .await
            .map_err(|err| network_error(PROVIDER, err))?;

        if !response.status().is_success() {
            return Err(error_from_response(PROVIDER, response).await);
        }
        // Failures come back as a plain JSON body with a 200 status.
        if is_json_response(&response) {
            let body = response
                .text()
                .await
                .map_err(|err| network_error(PROVIDER, err))?;
            let value = parse_unit(PROVIDER, &body)?;
            return Err(in_band_error(&value).unwrap_or_else(|| RelayError::ProviderRequest {
                provider: PROVIDER,
                status: 200,
                message: "expected an event stream".to_string(),
            }));
        }

        Ok(chunk_stream(response_frames(PROVIDER, response), normalize))
    }
}

/// Maps a model display name to its wenxinworkshop endpoint.
pub(crate) fn model_endpoint(model: &str) -> String {
    let model = model.trim();
    let endpoint = match model {
        "ERNIE-4.0-8K" | "ERNIE-Bot-4" => "completions_pro",
        "ERNIE-4.0-Turbo-8K" => "ernie-4.0-turbo-8k",
        "ERNIE-3.5-8K" | "ERNIE-Bot" => "completions",
        "ERNIE-Speed-8K" => "ernie_speed",
        "ERNIE-Speed-128K" => "ernie-speed-128k",
        "ERNIE-Lite-8K" => "ernie-lite-8k",
        "ERNIE-Tiny-8K" => "ernie-tiny-8k",
        "ERNIE-Bot-turbo" => "eb-instant",
        other => return other.to_lowercase(),
    };
    endpoint.to_string()
}

fn request_body(messages: &[ChatMessage]) -> Value {
    let (system, rest) = match messages.split_first() {
        Some((first, rest)) if first.role == "system" => (Some(first.content.as_str()), rest),
        _ => (None, messages),
    };
    if rest.iter().any(|message| message.image_path.is_some()) {
        warn!(provider = %PROVIDER, "image attachments are not supported and were dropped");
    }

    let wire: Vec<Value> = rest
        .iter()
        .map(|message| json!({ "role": message.role, "content": message.content }))
        .collect();
    let mut body = json!({ "messages": wire, "stream": true });
    if let Some(system) = system {
        body["system"] = Value::String(system.to_string());
    }
    body
}

fn in_band_error(value: &Value) -> Option<RelayError> {
    let code = value.get("error_code")?.as_i64()?;
    let message = value
        .get("error_msg")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    let message = format!("error {code}: {message}");
    Some(if AUTH_ERROR_CODES.contains(&code) {
        RelayError::ProviderAuth {
            provider: PROVIDER,
            message,
        }
    } else {
        RelayError::ProviderRequest {
            provider: PROVIDER,
            status: 200,
            message,
        }
    })
}

pub(crate) fn normalize(frame: SseFrame) -> RelayResult<UniversalChunk> {
    let data = match frame {
        SseFrame::Data(data) => data,
        SseFrame::Done => return Ok(UniversalChunk::end("")),
    };
    let value = parse_unit(PROVIDER, &data)?;
    if let Some(err) = in_band_error(&value) {
        return Err(err);
    }
    let unit: QianfanUnit = serde_json::from_value(value).map_err(|err| {
        RelayError::ProviderRequest {
            provider: PROVIDER,
            status: 200,
            message: format!("unexpected stream chunk: {err}"),
        }
    })?;
    Ok(UniversalChunk {
        is_end: unit.is_end,
        text: unit.result,
    })
}
