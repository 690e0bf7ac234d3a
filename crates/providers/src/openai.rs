use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use core_types::{
    ChatMessage, ChatProvider, ChunkStream, ProviderName, RelayError, RelayResult, UniversalChunk,
};
use serde_json::{Value, json};
use tracing::debug;

use crate::http::{
    build_client, chunk_stream, error_from_response, network_error, parse_unit, response_frames,
};
use crate::sse::SseFrame;

/// Provider for any endpoint speaking the OpenAI chat completions protocol.
/// Used for OpenAI itself, DashScope compatible mode and DeepSeek.
pub struct OpenAiCompatibleProvider {
    name: ProviderName,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        name: ProviderName,
        api_key: impl Into<String>,
        base_url: impl AsRef<str>,
    ) -> RelayResult<Self> {
        Ok(Self {
            name,
            client: build_client(name)?,
            api_key: api_key.into(),
            base_url: base_url.as_ref().trim().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleProvider {
    fn name(&self) -> ProviderName {
        self.name
    }

    async fn chat(&self, messages: &[ChatMessage], model: &str) -> RelayResult<ChunkStream> {
        let mut wire = Vec::with_capacity(messages.len());
        for message in messages {
            wire.push(to_wire_message(message).await?);
        }
        let body = json!({
            "model": model,
            "messages": wire,
            "stream": true,
        });
        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = %self.name, model, "opening stream");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.trim())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|err| network_error(self.name, err))?;

        if !response.status().is_success() {
            return Err(error_from_response(self.name, response).await);
        }

        let name = self.name;
        Ok(chunk_stream(
            response_frames(name, response),
            move |frame| normalize(name, frame),
        ))
    }
}

async fn to_wire_message(message: &ChatMessage) -> RelayResult<Value> {
    let Some(image_path) = message.image_path.as_deref() else {
        return Ok(json!({ "role": message.role, "content": message.content }));
    };

    let bytes = tokio::fs::read(image_path).await.map_err(|err| {
        RelayError::InvalidRequest(format!("cannot read image {image_path}: {err}"))
    })?;
    let data_url = format!(
        "data:{};base64,{}",
        image_mime(Path::new(image_path)),
        BASE64.encode(bytes)
    );
    Ok(json!({
        "role": message.role,
        "content": [
            { "type": "text", "text": message.content },
            { "type": "image_url", "image_url": { "url": data_url } },
        ],
    }))
}

fn image_mime(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

/// One `chat.completion.chunk` becomes one delta; `[DONE]` becomes the end.
pub(crate) fn normalize(provider: ProviderName, frame: SseFrame) -> RelayResult<UniversalChunk> {
    let data = match frame {
        SseFrame::Data(data) => data,
        SseFrame::Done => return Ok(UniversalChunk::end("")),
    };
    let value = parse_unit(provider, &data)?;
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("stream reported an error")
            .to_string();
        return Err(RelayError::ProviderRequest {
            provider,
            status: 200,
            message,
        });
    }

    let text = value
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .filter_map(|choice| choice.pointer("/delta/content").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default();
    Ok(UniversalChunk::delta(text))
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn sse(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/event-stream")
    }

    async fn collect(stream: RelayResult<ChunkStream>) -> Vec<RelayResult<UniversalChunk>> {
        match stream {
            Ok(stream) => stream.collect().await,
            Err(err) => panic!("chat failed: {err}"),
        }
    }

    #[test]
    fn normalizes_deltas_and_done() {
        let chunk = normalize(
            ProviderName::OpenAi,
            SseFrame::Data(
                r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#
                    .to_string(),
            ),
        )
        .expect("chunk");
        assert_eq!(chunk, UniversalChunk::delta("Hi"));

        let role_only = normalize(
            ProviderName::DeepSeek,
            SseFrame::Data(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#.to_string()),
        )
        .expect("chunk");
        assert_eq!(role_only, UniversalChunk::delta(""));

        assert_eq!(
            normalize(ProviderName::OpenAi, SseFrame::Done),
            Ok(UniversalChunk::end(""))
        );
    }

    #[test]
    fn invalid_json_is_not_dropped() {
        let err = normalize(ProviderName::DashScope, SseFrame::Data("{".to_string()))
            .expect_err("must fail");
        assert_eq!(err.code(), "PROVIDER_REQUEST_FAILED");
    }

    #[test]
    fn trims_trailing_slashes_from_base_url() {
        let provider =
            OpenAiCompatibleProvider::new(ProviderName::OpenAi, "sk-x", "https://api.example.com/")
                .expect("provider");
        assert_eq!(provider.base_url(), "https://api.example.com");
    }

    #[tokio::test]
    async fn streams_chat_completion_chunks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "deepseek-chat",
                "stream": true,
                "messages": [{ "role": "user", "content": "hi" }]
            })))
            .respond_with(sse(
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                 data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
                 data: [DONE]\n\n",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::new(
            ProviderName::DeepSeek,
            "sk-test",
            format!("{}/v1/", server.uri()),
        )
        .expect("provider");
        let chunks = collect(
            provider
                .chat(&[ChatMessage::user("hi")], "deepseek-chat")
                .await,
        )
        .await;
        assert_eq!(
            chunks,
            vec![
                Ok(UniversalChunk::delta("Hel")),
                Ok(UniversalChunk::delta("lo")),
                Ok(UniversalChunk::end("")),
            ]
        );
    }

    #[tokio::test]
    async fn missing_done_still_ends_the_stream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(sse("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n"))
            .mount(&server)
            .await;

        let provider =
            OpenAiCompatibleProvider::new(ProviderName::OpenAi, "sk-test", server.uri())
                .expect("provider");
        let chunks = collect(provider.chat(&[ChatMessage::user("hi")], "gpt-4o").await).await;
        assert_eq!(
            chunks,
            vec![Ok(UniversalChunk::delta("x")), Ok(UniversalChunk::end(""))]
        );
    }

    #[tokio::test]
    async fn unauthorized_is_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": { "message": "Incorrect API key provided", "type": "invalid_request_error" }
            })))
            .mount(&server)
            .await;

        let provider =
            OpenAiCompatibleProvider::new(ProviderName::OpenAi, "sk-bad", server.uri())
                .expect("provider");
        let err = provider
            .chat(&[ChatMessage::user("hi")], "gpt-4o")
            .await
            .err()
            .expect("auth failure");
        assert_eq!(
            err,
            RelayError::ProviderAuth {
                provider: ProviderName::OpenAi,
                message: "Incorrect API key provided".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn server_error_is_a_request_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let provider =
            OpenAiCompatibleProvider::new(ProviderName::DashScope, "sk-test", server.uri())
                .expect("provider");
        let err = provider
            .chat(&[ChatMessage::user("hi")], "qwen-plus")
            .await
            .err()
            .expect("request failure");
        assert_eq!(
            err,
            RelayError::ProviderRequest {
                provider: ProviderName::DashScope,
                status: 503,
                message: "overloaded".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn image_messages_become_multimodal_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("cat.JPG");
        std::fs::write(&image, [0xff, 0xd8, 0xff]).expect("write image");

        let message = ChatMessage::user("what is this?").with_image(image.display().to_string());
        let wire = to_wire_message(&message).await.expect("wire message");
        assert_eq!(wire["content"][0], json!({ "type": "text", "text": "what is this?" }));
        assert_eq!(wire["content"][1]["image_url"]["url"], "data:image/jpeg;base64,/9j/");
    }

    #[tokio::test]
    async fn unreadable_image_is_an_invalid_request() {
        let message = ChatMessage::user("hi").with_image("/definitely/not/here.png");
        let err = to_wire_message(&message).await.expect_err("missing file");
        assert_eq!(err.code(), "INVALID_REQUEST");
    }
}
