use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use futures::stream::{self, BoxStream, StreamExt};
use snafu::ResultExt;
use uuid::Uuid;

use crate::error::{ChatResult, ReadReplaySnafu};
use crate::events::AgentEvent;
use crate::thread_item::AgentMessage;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type AgentEventStream = BoxStream<'static, ChatResult<AgentEvent>>;

/// Conversation key under which an agent keeps its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// New input for one turn. Earlier history is owned by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub session: SessionId,
    pub messages: Vec<AgentMessage>,
}

impl AgentRequest {
    pub fn new(session: SessionId, messages: Vec<AgentMessage>) -> Self {
        Self { session, messages }
    }
}

/// Something that can answer a request with a stream of events.
pub trait AgentRunnable: Send + Sync {
    fn stream_events<'a>(
        &'a self,
        request: AgentRequest,
    ) -> BoxFuture<'a, ChatResult<AgentEventStream>>;
}

/// Agent that answers every request by replaying a recorded JSON-lines event log.
#[derive(Debug, Clone)]
pub struct ReplayAgent {
    lines: Vec<String>,
}

impl ReplayAgent {
    pub fn new(log: &str) -> Self {
        let lines = log
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Self { lines }
    }

    pub fn from_path(path: &Path) -> ChatResult<Self> {
        let log = std::fs::read_to_string(path).context(ReadReplaySnafu {
            stage: "read-replay-log",
            path: path.to_path_buf(),
        })?;
        Ok(Self::new(&log))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl AgentRunnable for ReplayAgent {
    fn stream_events<'a>(
        &'a self,
        request: AgentRequest,
    ) -> BoxFuture<'a, ChatResult<AgentEventStream>> {
        let lines = self.lines.clone();
        Box::pin(async move {
            tracing::debug!(
                session = %request.session,
                event_count = lines.len(),
                "replaying recorded agent events"
            );
            let events = stream::iter(lines).map(|line| AgentEvent::from_json_str(&line));
            Ok(events.boxed())
        })
    }
}
