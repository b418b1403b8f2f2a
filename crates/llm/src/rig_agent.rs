use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::channel::mpsc;
use nbchat_core::{
    AgentEvent, AgentEventStream, AgentMessage, AgentRequest, AgentRunnable, BoxFuture,
    ChatResult, ContentPart, Sender, SessionId,
};
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::{StreamedAssistantContent, ToolCallDeltaContent};
use snafu::{ResultExt, ensure};
use tokio::sync::Mutex;

use super::provider::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, MissingApiKeySnafu,
    ProviderConfig, ProviderError, ProviderResult,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

type SessionHistory = Arc<Mutex<HashMap<SessionId, Vec<RigMessage>>>>;
type EventSender = mpsc::UnboundedSender<ChatResult<AgentEvent>>;

/// OpenAI-compatible agent that remembers each session's conversation.
pub struct RigAgent {
    config: ProviderConfig,
    history: SessionHistory,
}

impl RigAgent {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-agent-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self {
            config,
            history: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &AgentMessage) -> Option<RigMessage> {
        match message.role {
            Sender::User => Some(RigMessage::user(message.content.clone())),
            Sender::Agent => Some(RigMessage::assistant(message.content.clone())),
            Sender::System | Sender::Tool => None,
        }
    }

    fn merged_preamble(config: &ProviderConfig, request: &AgentRequest) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &config.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        // Rig exposes a single preamble field, so system messages are folded into it.
        for message in &request.messages {
            if matches!(message.role, Sender::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        prior: Vec<RigMessage>,
        request: &AgentRequest,
    ) -> ProviderResult<(RigStreamingResponse, Vec<RigMessage>)> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(config.model.clone());

        let new_messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = new_messages.last().cloned() else {
            tracing::warn!(
                session = %request.session,
                model = %config.model,
                message_count = request.messages.len(),
                "cannot open stream because no user/agent messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-filter-messages",
                session: request.session,
            }
            .fail();
        };

        let mut context = prior;
        context.extend(new_messages[..new_messages.len() - 1].iter().cloned());

        let mut builder = model.completion_request(prompt).messages(context);

        if let Some(preamble) = Self::merged_preamble(config, request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = config.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = config.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        let stream = builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })?;
        Ok((stream, new_messages))
    }

    fn map_stream_item<R>(item: &StreamedAssistantContent<R>) -> Option<AgentEvent>
    where
        R: Clone + Unpin,
    {
        let part = match item {
            StreamedAssistantContent::Text(text) => ContentPart::text(text.text.clone()),
            StreamedAssistantContent::ToolCallDelta { content, .. } => match content {
                ToolCallDeltaContent::Name(name) => ContentPart::tool_use(Some(name), None),
                ToolCallDeltaContent::Delta(delta) => ContentPart::tool_use(None, Some(delta)),
            },
            // Complete tool calls only feed the final output; their deltas were already shown.
            StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::Final(_) => return None,
        };

        Some(AgentEvent::token(vec![part]))
    }

    fn send(event_tx: &EventSender, event: ChatResult<AgentEvent>) -> bool {
        event_tx.unbounded_send(event).is_ok()
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        history: SessionHistory,
        request: AgentRequest,
        event_tx: EventSender,
    ) {
        let session = request.session;
        if !Self::send(&event_tx, Ok(AgentEvent::TurnStart)) {
            return;
        }

        let prior = history
            .lock()
            .await
            .get(&session)
            .cloned()
            .unwrap_or_default();

        let (mut stream, new_messages) = match Self::open_stream(&config, prior, &request).await {
            Ok(opened) => opened,
            Err(error) => {
                tracing::error!(
                    session = %session,
                    provider_id = %config.provider_id,
                    model = %config.model,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::send(&event_tx, Err(error.into()));
                return;
            }
        };

        let mut output = TurnOutput::default();
        while let Some(next_item) = stream.next().await {
            match next_item {
                Ok(item) => {
                    output.record(&item);
                    if let Some(event) = Self::map_stream_item(&item)
                        && !Self::send(&event_tx, Ok(event))
                    {
                        // Consumer is gone; stop provider IO promptly.
                        tracing::debug!(
                            session = %session,
                            "event consumer dropped, cancelling stream"
                        );
                        stream.cancel();
                        return;
                    }
                }
                Err(source) => {
                    tracing::warn!(
                        session = %session,
                        error = %source,
                        "provider stream emitted an error chunk"
                    );
                    let error = ProviderError::CompletionsFailed {
                        stage: "stream-chunk",
                        source,
                    };
                    Self::send(&event_tx, Err(error.into()));
                    return;
                }
            }
        }

        {
            let mut history = history.lock().await;
            let entry = history.entry(session).or_default();
            entry.extend(new_messages);
            if !output.text.is_empty() {
                entry.push(RigMessage::assistant(output.text.clone()));
            }
        }

        Self::send(&event_tx, Ok(AgentEvent::turn_end(output.into_parts())));
    }
}

/// Authoritative output of one model call, assembled from the stream.
#[derive(Debug, Default)]
struct TurnOutput {
    text: String,
    parts: Vec<ContentPart>,
}

impl TurnOutput {
    fn record<R>(&mut self, item: &StreamedAssistantContent<R>)
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) => {
                self.text.push_str(&text.text);
                if let Some(ContentPart::Text { text: last }) = self.parts.last_mut() {
                    last.push_str(&text.text);
                } else {
                    self.parts.push(ContentPart::text(text.text.clone()));
                }
            }
            StreamedAssistantContent::ToolCall { tool_call, .. } => {
                let input = serde_json::to_string_pretty(&tool_call.function.arguments)
                    .unwrap_or_else(|_| tool_call.function.arguments.to_string());
                self.parts.push(ContentPart::tool_use(
                    Some(&tool_call.function.name),
                    Some(&input),
                ));
            }
            _ => {}
        }
    }

    fn into_parts(self) -> Vec<ContentPart> {
        self.parts
    }
}

impl AgentRunnable for RigAgent {
    fn stream_events<'a>(
        &'a self,
        request: AgentRequest,
    ) -> BoxFuture<'a, ChatResult<AgentEventStream>> {
        Box::pin(async move {
            if request.messages.is_empty() {
                return Err(ProviderError::EmptyMessageSet {
                    stage: "stream-events",
                    session: request.session,
                }
                .into());
            }

            let (event_tx, event_rx) = mpsc::unbounded();
            tokio::spawn(Self::run_stream_worker(
                self.config.clone(),
                Arc::clone(&self.history),
                request,
                event_tx,
            ));

            Ok(event_rx.boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProviderConfig {
        ProviderConfig::new(RIG_OPENAI_PROVIDER_ID, "sk-test", "")
    }

    #[test]
    fn rejects_missing_api_key() {
        let result = RigAgent::new(ProviderConfig::new("openai", "  ", ""));
        assert!(matches!(result, Err(ProviderError::MissingApiKey { .. })));
    }

    #[test]
    fn system_messages_fold_into_preamble() {
        let request = AgentRequest::new(
            SessionId::new_v4(),
            vec![
                AgentMessage::new(Sender::System, "Answer briefly."),
                AgentMessage::new(Sender::User, "hello"),
            ],
        );
        let with_preamble = config().with_preamble("You are helpful.");
        assert_eq!(
            RigAgent::merged_preamble(&with_preamble, &request).as_deref(),
            Some("You are helpful.\n\nAnswer briefly.")
        );
        assert_eq!(
            RigAgent::merged_preamble(&config(), &request).as_deref(),
            Some("Answer briefly.")
        );
    }

    #[test]
    fn only_user_and_agent_messages_reach_the_model() {
        assert!(RigAgent::to_rig_message(&AgentMessage::new(Sender::User, "hi")).is_some());
        assert!(RigAgent::to_rig_message(&AgentMessage::new(Sender::Agent, "hi")).is_some());
        assert!(RigAgent::to_rig_message(&AgentMessage::new(Sender::System, "hi")).is_none());
        assert!(RigAgent::to_rig_message(&AgentMessage::new(Sender::Tool, "{}")).is_none());
    }

    #[tokio::test]
    async fn empty_request_is_rejected_before_streaming() {
        let agent = RigAgent::new(config()).expect("api key present");
        let result = agent
            .stream_events(AgentRequest::new(SessionId::new_v4(), Vec::new()))
            .await;
        assert!(matches!(
            result,
            Err(nbchat_core::ChatError::AgentStream {
                stage: "stream-events",
                ..
            })
        ));
    }
}
