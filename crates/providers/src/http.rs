use std::time::Duration;

use core_types::{ChunkStream, ProviderName, RelayError, RelayResult, UniversalChunk};
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde_json::Value;

use crate::sse::{SseFrame, sse_frames};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_ERROR_BODY_CHARS: usize = 300;

pub(crate) fn build_client(provider: ProviderName) -> RelayResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|err| RelayError::InvalidConfiguration {
            provider,
            message: format!("failed to build HTTP client: {err}"),
        })
}

pub(crate) fn network_error(provider: ProviderName, err: reqwest::Error) -> RelayError {
    RelayError::Network {
        provider,
        message: err.to_string(),
    }
}

/// Turns a non-2xx response into the matching error. 401/403 mean the
/// credentials were rejected.
pub(crate) async fn error_from_response(
    provider: ProviderName,
    response: reqwest::Response,
) -> RelayError {
    let status = response.status();
    let body = match response.text().await {
        Ok(body) => body,
        Err(err) => return network_error(provider, err),
    };
    let mut message = error_message(&body);
    if message.is_empty() {
        message = status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string();
    }

    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        RelayError::ProviderAuth { provider, message }
    } else {
        RelayError::ProviderRequest {
            provider,
            status: status.as_u16(),
            message,
        }
    }
}

/// Best-effort extraction of a human readable message from an error body.
pub(crate) fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let found = value
            .pointer("/error/message")
            .or_else(|| value.get("error_msg"))
            .or_else(|| value.get("error_description"))
            .or_else(|| value.get("message"))
            .or_else(|| value.get("error"))
            .and_then(Value::as_str);
        if let Some(message) = found {
            return message.to_string();
        }
    }
    body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect()
}

pub(crate) fn is_json_response(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"))
}

pub(crate) fn parse_unit(provider: ProviderName, data: &str) -> RelayResult<Value> {
    serde_json::from_str(data).map_err(|err| RelayError::ProviderRequest {
        provider,
        status: StatusCode::OK.as_u16(),
        message: format!("malformed stream chunk: {err}"),
    })
}

pub(crate) fn response_frames(
    provider: ProviderName,
    response: reqwest::Response,
) -> impl Stream<Item = RelayResult<SseFrame>> + Send + 'static {
    sse_frames(Box::pin(response.bytes_stream()))
        .map(move |frame| frame.map_err(|err| network_error(provider, err)))
}

/// Maps frames through `normalize`. The stream stops after the first end chunk
/// or the first error, and a clean EOF without an end chunk yields one.
pub(crate) fn chunk_stream<S, F>(frames: S, normalize: F) -> ChunkStream
where
    S: Stream<Item = RelayResult<SseFrame>> + Send + 'static,
    F: Fn(SseFrame) -> RelayResult<UniversalChunk> + Send + 'static,
{
    Box::pin(futures::stream::unfold(
        (Box::pin(frames), normalize, false),
        |(mut frames, normalize, finished)| async move {
            if finished {
                return None;
            }
            let item = match frames.next().await {
                Some(Ok(frame)) => normalize(frame),
                Some(Err(err)) => Err(err),
                None => Ok(UniversalChunk::end("")),
            };
            let finished = !matches!(&item, Ok(chunk) if !chunk.is_end);
            Some((item, (frames, normalize, finished)))
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(items: Vec<RelayResult<SseFrame>>) -> impl Stream<Item = RelayResult<SseFrame>> {
        futures::stream::iter(items)
    }

    fn echo(frame: SseFrame) -> RelayResult<UniversalChunk> {
        match frame {
            SseFrame::Data(text) => Ok(UniversalChunk::delta(text)),
            SseFrame::Done => Ok(UniversalChunk::end("")),
        }
    }

    #[tokio::test]
    async fn synthesizes_end_on_clean_eof() {
        let chunks: Vec<_> = chunk_stream(frames(vec![Ok(SseFrame::Data("a".into()))]), echo)
            .collect()
            .await;
        assert_eq!(
            chunks,
            vec![Ok(UniversalChunk::delta("a")), Ok(UniversalChunk::end(""))]
        );
    }

    #[tokio::test]
    async fn stops_after_end_chunk() {
        let chunks: Vec<_> = chunk_stream(
            frames(vec![
                Ok(SseFrame::Done),
                Ok(SseFrame::Data("late".into())),
            ]),
            echo,
        )
        .collect()
        .await;
        assert_eq!(chunks, vec![Ok(UniversalChunk::end(""))]);
    }

    #[tokio::test]
    async fn stops_after_first_error() {
        let failure = RelayError::Network {
            provider: ProviderName::OpenAi,
            message: "reset".into(),
        };
        let chunks: Vec<_> = chunk_stream(
            frames(vec![
                Ok(SseFrame::Data("a".into())),
                Err(failure.clone()),
                Ok(SseFrame::Data("b".into())),
            ]),
            echo,
        )
        .collect()
        .await;
        assert_eq!(chunks, vec![Ok(UniversalChunk::delta("a")), Err(failure)]);
    }

    #[test]
    fn extracts_error_messages_from_common_shapes() {
        assert_eq!(
            error_message(r#"{"error":{"message":"Incorrect API key provided"}}"#),
            "Incorrect API key provided"
        );
        assert_eq!(
            error_message(r#"{"error_code":110,"error_msg":"Access token invalid"}"#),
            "Access token invalid"
        );
        assert_eq!(
            error_message(r#"{"error":"invalid_client","error_description":"unknown client id"}"#),
            "unknown client id"
        );
        assert_eq!(error_message("  upstream exploded  "), "upstream exploded");
        assert_eq!(error_message(&"x".repeat(1000)).len(), MAX_ERROR_BODY_CHARS);
    }

    #[test]
    fn malformed_unit_is_a_request_error() {
        let err = parse_unit(ProviderName::DeepSeek, "{not json").expect_err("must fail");
        assert_eq!(err.code(), "PROVIDER_REQUEST_FAILED");
    }
}
