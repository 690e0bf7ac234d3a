//! Newline-delimited JSON bridge between a UI process and the chat relay.
//!
//! Every line is one envelope `{"channel": ..., "payload": ...}`. Outbound
//! envelopes are the serialized [`RelayEvent`]s.

use std::sync::Arc;

use anyhow::{Context, Result};
use core_relay::{ChannelSink, ChatRelay, RelayOutcome};
use core_types::{ChatRequest, CorrelationId, RelayEvent};
use providers::ProviderFactory;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "channel", content = "payload")]
pub enum HostCommand {
    #[serde(rename = "start-chat")]
    StartChat(ChatRequest),
    #[serde(rename = "cancel-chat")]
    CancelChat {
        #[serde(rename = "messageId")]
        correlation_id: CorrelationId,
    },
    #[serde(rename = "config-updated")]
    ConfigUpdated,
}

pub fn parse_command(line: &str) -> Result<HostCommand> {
    serde_json::from_str(line).context("malformed host command")
}

/// Runs until `input` reaches EOF, then waits for in-flight streams and
/// returns once every event has been written to `output`.
pub async fn serve<R, W>(factory: Arc<ProviderFactory>, input: R, output: W) -> Result<W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (sink, rx) = ChannelSink::new(EVENT_BUFFER);
    let writer = tokio::spawn(write_events(rx, output));
    let relay = ChatRelay::new(factory.clone(), Arc::new(sink));
    let mut in_flight: Vec<JoinHandle<RelayOutcome>> = Vec::new();

    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "skipping input line");
                continue;
            }
        };

        match command {
            HostCommand::StartChat(request) => {
                debug!(correlation_id = request.correlation_id, "start-chat received");
                if let Some(handle) = relay.submit(request) {
                    in_flight.push(handle);
                }
            }
            HostCommand::CancelChat { correlation_id } => {
                relay.cancel(correlation_id);
            }
            HostCommand::ConfigUpdated => {
                factory.invalidate_all();
                info!("settings changed, provider configuration reloaded on next request");
            }
        }
        in_flight.retain(|handle| !handle.is_finished());
    }

    info!(in_flight = in_flight.len(), "input closed, draining streams");
    for handle in in_flight {
        // Cancelled tasks report a join error; nothing left to deliver for them.
        let _ = handle.await;
    }
    drop(relay);

    writer
        .await
        .context("event writer task failed")?
        .context("failed to write events")
}

/// Writes one JSON line per event. On a write failure the receiver is
/// dropped, which closes the sink and detaches every relay.
async fn write_events<W>(mut rx: mpsc::Receiver<RelayEvent>, mut output: W) -> Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        let mut line = serde_json::to_vec(&event).context("failed to encode event")?;
        line.push(b'\n');
        output
            .write_all(&line)
            .await
            .context("failed to write event")?;
        output.flush().await.context("failed to flush event")?;
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use config::{ApiKeyUpdate, ConfigStore, EnvDefaults};
    use core_types::{ChatMessage, ProviderName};
    use serde_json::{Value, json};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn factory_for(dir: &std::path::Path) -> Arc<ProviderFactory> {
        Arc::new(ProviderFactory::new(
            Arc::new(ConfigStore::from_dir(dir)),
            EnvDefaults::default(),
        ))
    }

    fn output_lines(output: Vec<u8>) -> Vec<Value> {
        String::from_utf8(output)
            .expect("utf8 output")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect()
    }

    #[test]
    fn parses_inbound_channels() {
        let start = parse_command(
            r#"{"channel":"start-chat","payload":{"messageId":3,"providerName":"qianfan","selectedModel":"ERNIE-4.0-8K","messages":[{"role":"user","content":"hi"}]}}"#,
        )
        .expect("start-chat");
        assert_eq!(
            start,
            HostCommand::StartChat(ChatRequest {
                correlation_id: 3,
                provider_name: "qianfan".to_string(),
                model: "ERNIE-4.0-8K".to_string(),
                messages: vec![ChatMessage::user("hi")],
            })
        );

        assert_eq!(
            parse_command(r#"{"channel":"cancel-chat","payload":{"messageId":3}}"#)
                .expect("cancel-chat"),
            HostCommand::CancelChat { correlation_id: 3 }
        );
        assert_eq!(
            parse_command(r#"{"channel":"config-updated"}"#).expect("config-updated"),
            HostCommand::ConfigUpdated
        );
        assert!(parse_command(r#"{"channel":"open-window"}"#).is_err());
    }

    #[tokio::test]
    async fn reports_errors_and_skips_malformed_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = concat!(
            "not json\n",
            "\n",
            r#"{"channel":"start-chat","payload":{"messageId":1,"providerName":"claude","selectedModel":"x","messages":[{"role":"user","content":"hi"}]}}"#,
            "\n",
            r#"{"channel":"start-chat","payload":{"messageId":2,"providerName":"deepseek","selectedModel":"deepseek-chat","messages":[{"role":"user","content":"hi"}]}}"#,
            "\n",
        );

        let output = serve(factory_for(dir.path()), input.as_bytes(), Vec::new())
            .await
            .expect("serve");
        let mut lines = output_lines(output);
        lines.sort_by_key(|line| line["payload"]["messageId"].as_i64());

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["channel"], "chat-error");
        assert_eq!(lines[0]["payload"]["code"], "UNKNOWN_PROVIDER");
        assert_eq!(lines[1]["channel"], "chat-error");
        assert_eq!(lines[1]["payload"]["code"], "MISSING_CONFIGURATION");
    }

    #[tokio::test]
    async fn streams_updates_for_a_configured_provider() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                concat!(
                    "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
                    "data: [DONE]\n\n",
                )
                .as_bytes()
                .to_vec(),
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        ConfigStore::from_dir(dir.path())
            .update_api_key(
                ProviderName::DeepSeek,
                ApiKeyUpdate {
                    api_key: Some("sk-abcdefghijklmnopqrstuvwx".to_string()),
                    base_url: Some(server.uri()),
                    ..Default::default()
                },
            )
            .expect("save settings");

        let input = concat!(
            r#"{"channel":"config-updated"}"#,
            "\n",
            r#"{"channel":"start-chat","payload":{"messageId":42,"providerName":"deepseek","selectedModel":"deepseek-chat","messages":[{"role":"user","content":"hi"}]}}"#,
            "\n",
        );
        let output = serve(factory_for(dir.path()), input.as_bytes(), Vec::new())
            .await
            .expect("serve");

        assert_eq!(
            output_lines(output),
            vec![
                json!({"channel":"update-message","payload":{"messageId":42,"data":{"is_end":false,"result":"Hi"}}}),
                json!({"channel":"update-message","payload":{"messageId":42,"data":{"is_end":false,"result":" there"}}}),
                json!({"channel":"update-message","payload":{"messageId":42,"data":{"is_end":true,"result":""}}}),
            ]
        );
    }
}
