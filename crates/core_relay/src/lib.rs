//! Drives provider streams for chat requests and forwards every chunk to the
//! UI boundary tagged with the request's correlation id.

mod sink;

use std::collections::HashMap;
use std::sync::Arc;

use core_types::{
    ChatRequest, CorrelationId, ProviderResolver, RelayError, RelayEvent, StreamError,
    StreamUpdate, UniversalChunk,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{Instrument, debug, info, info_span, warn};

pub use sink::{ChannelSink, EventSink, SinkClosed};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RelayState {
    Pending,
    Streaming,
    Completed,
    Failed,
    /// The sink went away mid-stream.
    Detached,
    Cancelled,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RelayOutcome {
    pub correlation_id: CorrelationId,
    pub state: RelayState,
    pub chunks: usize,
}

type ActiveMap = Arc<Mutex<HashMap<CorrelationId, AbortHandle>>>;

/// Relays any number of concurrent chat requests, one task per request.
pub struct ChatRelay {
    resolver: Arc<dyn ProviderResolver>,
    sink: Arc<dyn EventSink>,
    active: ActiveMap,
}

impl ChatRelay {
    pub fn new(resolver: Arc<dyn ProviderResolver>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            resolver,
            sink,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts relaying `request` on its own task. Returns `None` without
    /// emitting anything when the correlation id is already streaming.
    pub fn submit(&self, request: ChatRequest) -> Option<JoinHandle<RelayOutcome>> {
        let correlation_id = request.correlation_id;
        // Held across spawn so the task cannot deregister before it is registered.
        let mut active = self.active.lock();
        if active.contains_key(&correlation_id) {
            warn!(
                correlation_id,
                "rejected request reusing an active correlation id"
            );
            return None;
        }

        let span = info_span!(
            "relay",
            correlation_id,
            provider = %request.provider_name,
            model = %request.model,
        );
        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            correlation_id,
        };
        let task = run(Arc::clone(&self.resolver), Arc::clone(&self.sink), request);
        let handle = tokio::spawn(
            async move {
                let _guard = guard;
                task.await
            }
            .instrument(span),
        );
        active.insert(correlation_id, handle.abort_handle());
        Some(handle)
    }

    /// Aborts the relay task for `correlation_id`. Dropping the task drops the
    /// provider stream, which releases the upstream connection.
    pub fn cancel(&self, correlation_id: CorrelationId) -> bool {
        let handle = self.active.lock().get(&correlation_id).cloned();
        match handle {
            Some(handle) => {
                handle.abort();
                info!(correlation_id, state = ?RelayState::Cancelled, "relay cancelled");
                true
            }
            None => {
                debug!(correlation_id, "cancel for an id that is not active");
                false
            }
        }
    }

    pub fn is_active(&self, correlation_id: CorrelationId) -> bool {
        self.active.lock().contains_key(&correlation_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

struct ActiveGuard {
    active: ActiveMap,
    correlation_id: CorrelationId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.correlation_id);
    }
}

/// Runs one request through `Pending -> Streaming -> Completed | Failed`.
pub async fn run(
    resolver: Arc<dyn ProviderResolver>,
    sink: Arc<dyn EventSink>,
    request: ChatRequest,
) -> RelayOutcome {
    let correlation_id = request.correlation_id;
    let mut outcome = RelayOutcome {
        correlation_id,
        state: RelayState::Pending,
        chunks: 0,
    };

    if request.messages.is_empty() {
        let err = RelayError::InvalidRequest("messages must not be empty".to_string());
        return fail(sink.as_ref(), outcome, &err).await;
    }

    let provider = match resolver.create(&request.provider_name) {
        Ok(provider) => provider,
        Err(err) => return fail(sink.as_ref(), outcome, &err).await,
    };
    let mut stream = match provider.chat(&request.messages, &request.model).await {
        Ok(stream) => stream,
        Err(err) => return fail(sink.as_ref(), outcome, &err).await,
    };
    outcome.state = RelayState::Streaming;
    debug!(provider = %provider.name(), "stream opened");

    while let Some(item) = stream.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => return fail(sink.as_ref(), outcome, &err).await,
        };
        let is_end = chunk.is_end;
        if forward(sink.as_ref(), correlation_id, chunk).await.is_err() {
            return detach(outcome);
        }
        outcome.chunks += 1;
        if is_end {
            break;
        }
    }

    outcome.state = RelayState::Completed;
    info!(chunks = outcome.chunks, "relay completed");
    outcome
}

async fn forward(
    sink: &dyn EventSink,
    correlation_id: CorrelationId,
    chunk: UniversalChunk,
) -> Result<(), SinkClosed> {
    sink.deliver(RelayEvent::Update(StreamUpdate {
        correlation_id,
        chunk,
    }))
    .await
}

async fn fail(sink: &dyn EventSink, mut outcome: RelayOutcome, err: &RelayError) -> RelayOutcome {
    warn!(
        code = err.code(),
        chunks = outcome.chunks,
        error = %err,
        "relay failed"
    );
    let event = RelayEvent::Error(StreamError::from_error(outcome.correlation_id, err));
    if sink.deliver(event).await.is_err() {
        return detach(outcome);
    }
    outcome.state = RelayState::Failed;
    outcome
}

fn detach(mut outcome: RelayOutcome) -> RelayOutcome {
    info!(chunks = outcome.chunks, "event sink closed, detaching");
    outcome.state = RelayState::Detached;
    outcome
}
