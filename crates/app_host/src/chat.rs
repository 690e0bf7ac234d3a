use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use core_relay::{EventSink, RelayOutcome, RelayState, SinkClosed};
use core_types::{ChatMessage, ChatRequest, CorrelationId, ProviderName, RelayEvent, StreamError};
use providers::ProviderFactory;
use storage_sqlite::{NewConversation, NewMessage, SqliteStorage, builtin_provider};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

const ONE_SHOT_ID: CorrelationId = 1;
const TITLE_CHARS: usize = 30;

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub provider: ProviderName,
    pub model: String,
    pub system: Option<String>,
    pub image: Option<PathBuf>,
    pub prompt: String,
    /// Where to persist the exchange, if anywhere.
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ChatReport {
    pub outcome: RelayOutcome,
    pub text: String,
    pub answer_id: Option<i64>,
}

/// Prints chunk text as it arrives and remembers the terminal error, if any.
struct TerminalSink<W> {
    output: Mutex<W>,
    text: Mutex<String>,
    failure: Mutex<Option<StreamError>>,
}

#[async_trait]
impl<W> EventSink for TerminalSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn deliver(&self, event: RelayEvent) -> Result<(), SinkClosed> {
        match event {
            RelayEvent::Update(update) => {
                let mut output = self.output.lock().await;
                output
                    .write_all(update.chunk.text.as_bytes())
                    .await
                    .map_err(|_| SinkClosed)?;
                if update.chunk.is_end {
                    output.write_all(b"\n").await.map_err(|_| SinkClosed)?;
                }
                output.flush().await.map_err(|_| SinkClosed)?;
                self.text.lock().await.push_str(&update.chunk.text);
            }
            RelayEvent::Error(error) => {
                *self.failure.lock().await = Some(error);
            }
        }
        Ok(())
    }
}

/// Mirrors relay events onto a stored answer message before passing them on.
struct PersistingSink {
    inner: Arc<dyn EventSink>,
    storage: SqliteStorage,
    answer_id: i64,
}

#[async_trait]
impl EventSink for PersistingSink {
    async fn deliver(&self, event: RelayEvent) -> Result<(), SinkClosed> {
        let stored = match &event {
            RelayEvent::Update(update) => {
                self.storage
                    .apply_chunk(self.answer_id, &update.chunk)
                    .await
            }
            RelayEvent::Error(error) => {
                self.storage
                    .mark_message_failed(self.answer_id, &error.message)
                    .await
            }
        };
        if let Err(err) = stored {
            warn!(answer_id = self.answer_id, error = %format!("{err:#}"), "failed to persist chunk");
        }
        self.inner.deliver(event).await
    }
}

pub async fn run_chat<W>(
    factory: Arc<ProviderFactory>,
    options: ChatOptions,
    output: W,
) -> Result<ChatReport>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut messages = Vec::new();
    if let Some(system) = options.system.as_deref().filter(|s| !s.trim().is_empty()) {
        messages.push(ChatMessage::system(system));
    }
    let mut question = ChatMessage::user(&options.prompt);
    if let Some(image) = &options.image {
        question = question.with_image(image.display().to_string());
    }
    messages.push(question.clone());

    let terminal = Arc::new(TerminalSink {
        output: Mutex::new(output),
        text: Mutex::new(String::new()),
        failure: Mutex::new(None),
    });

    let mut answer_id = None;
    let sink: Arc<dyn EventSink> = match &options.database {
        Some(path) => {
            let storage = SqliteStorage::connect(path).await?;
            let id = record_question(&storage, &options, &question).await?;
            answer_id = Some(id);
            Arc::new(PersistingSink {
                inner: terminal.clone(),
                storage,
                answer_id: id,
            })
        }
        None => terminal.clone(),
    };
    let correlation_id = answer_id.unwrap_or(ONE_SHOT_ID);

    let request = ChatRequest {
        correlation_id,
        provider_name: options.provider.as_str().to_string(),
        model: options.model.clone(),
        messages,
    };
    let outcome = core_relay::run(factory, sink, request).await;
    info!(state = ?outcome.state, chunks = outcome.chunks, "one-shot chat finished");

    if outcome.state == RelayState::Failed {
        let failure = terminal.failure.lock().await.take();
        match failure {
            Some(error) => bail!("{}: {}", error.code, error.message),
            None => bail!("chat failed"),
        }
    }

    let text = terminal.text.lock().await.clone();
    Ok(ChatReport {
        outcome,
        text,
        answer_id,
    })
}

/// Creates the conversation, the question and an empty answer. Returns the
/// answer id, which doubles as the correlation id.
async fn record_question(
    storage: &SqliteStorage,
    options: &ChatOptions,
    question: &ChatMessage,
) -> Result<i64> {
    storage.seed_providers().await?;
    let provider = builtin_provider(options.provider)
        .with_context(|| format!("{} is not in the provider catalog", options.provider))?;

    let conversation = storage
        .create_conversation(NewConversation {
            title: options.prompt.chars().take(TITLE_CHARS).collect(),
            selected_model: options.model.clone(),
            provider_id: provider.id,
        })
        .await?;
    storage
        .create_message(NewMessage {
            image_path: question.image_path.clone(),
            ..NewMessage::question(conversation.id, question.content.clone())
        })
        .await?;
    let answer = storage
        .create_message(NewMessage::pending_answer(conversation.id))
        .await?;
    Ok(answer.id)
}
