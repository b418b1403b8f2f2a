use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRequest, AgentRunnable, SessionId};
use crate::error::{ChatError, ChatResult, NoRuntimeSnafu};
use crate::events::AgentEvent;
use crate::render::Renderer;
use crate::thread::{Thread, ThreadChange, ThreadReducer};
use crate::thread_item::{AgentMessage, ThreadItem};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

pub const STATUS_IDLE: &str = "Idle";
pub const STATUS_CANCELLED: &str = "Cancelled";

/// What to do when a prompt arrives while a turn is still streaming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubmitPolicy {
    /// Cancel the running turn and start the new one.
    #[default]
    CancelPrevious,
    /// Refuse the new prompt until the running turn finishes.
    RejectWhileBusy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayConfig {
    /// Keep every status line in an in-memory log.
    pub debug: bool,
    pub submit_policy: SubmitPolicy,
}

/// Identifies one submitted turn. Increases on every submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

/// Notification for the rendering surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayUpdate {
    ItemAppended(usize),
    ItemUpdated(usize),
    StatusChanged(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedItem {
    pub item: ThreadItem,
    pub label: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySnapshot {
    pub items: Vec<RenderedItem>,
    pub status: String,
    pub debug_log: Vec<String>,
}

struct ActiveTask {
    turn: TurnId,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct DisplayState {
    thread: Thread,
    rendered: Vec<String>,
    reducer: ThreadReducer,
    status: String,
    debug_log: Option<Vec<String>>,
    active_turn: Option<TurnId>,
    next_turn: u64,
    task: Option<ActiveTask>,
}

struct DisplayInner {
    agent: Arc<dyn AgentRunnable>,
    session: SessionId,
    config: DisplayConfig,
    renderer: Renderer,
    state: Mutex<DisplayState>,
    updates: broadcast::Sender<DisplayUpdate>,
}

/// A chat thread bound to one agent session.
///
/// Each submit appends the prompt and streams the agent's answer into the
/// thread on a background task. At most one turn mutates the thread at a time:
/// a turn that has been replaced or cancelled stops at its next await point and
/// any event it was holding is discarded.
#[derive(Clone)]
pub struct ChatDisplay {
    inner: Arc<DisplayInner>,
}

impl ChatDisplay {
    pub fn new(agent: Arc<dyn AgentRunnable>, config: DisplayConfig) -> Self {
        Self::with_session(agent, config, SessionId::new_v4())
    }

    pub fn with_session(
        agent: Arc<dyn AgentRunnable>,
        config: DisplayConfig,
        session: SessionId,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let state = DisplayState {
            thread: Thread::new(),
            rendered: Vec::new(),
            reducer: ThreadReducer::new(),
            status: STATUS_IDLE.to_string(),
            debug_log: config.debug.then(Vec::new),
            active_turn: None,
            next_turn: 1,
            task: None,
        };

        Self {
            inner: Arc::new(DisplayInner {
                agent,
                session,
                config,
                renderer: Renderer::new(),
                state: Mutex::new(state),
                updates,
            }),
        }
    }

    pub fn session(&self) -> SessionId {
        self.inner.session
    }

    pub fn renderer(&self) -> &Renderer {
        &self.inner.renderer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DisplayUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn status(&self) -> String {
        self.inner.lock_state().status.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock_state().active_turn.is_some()
    }

    pub fn snapshot(&self) -> DisplaySnapshot {
        let state = self.inner.lock_state();
        let items = state
            .thread
            .items()
            .iter()
            .zip(&state.rendered)
            .map(|(item, html)| RenderedItem {
                item: item.clone(),
                label: item.label(),
                html: html.clone(),
            })
            .collect();

        DisplaySnapshot {
            items,
            status: state.status.clone(),
            debug_log: state.debug_log.clone().unwrap_or_default(),
        }
    }

    /// Appends `text` as a user item and starts streaming the agent's answer.
    ///
    /// Fails with [`ChatError::NoRuntime`] outside a tokio runtime, leaving the
    /// thread untouched.
    pub fn submit(&self, text: impl Into<String>) -> ChatResult<TurnId> {
        let runtime = Handle::try_current().context(NoRuntimeSnafu { stage: "submit" })?;
        let text = text.into();
        let inner = &self.inner;
        let mut state = inner.lock_state();

        if let Some(active) = state.active_turn {
            match inner.config.submit_policy {
                SubmitPolicy::RejectWhileBusy => {
                    tracing::debug!(
                        session = %inner.session,
                        turn = active.0,
                        "rejecting submit while a turn is streaming"
                    );
                    return Err(ChatError::TurnInProgress {
                        stage: "submit",
                        session: inner.session.to_string(),
                    });
                }
                SubmitPolicy::CancelPrevious => {
                    if let Some(task) = &state.task {
                        task.cancel.cancel();
                    }
                    tracing::info!(
                        session = %inner.session,
                        turn = active.0,
                        "cancelled streaming turn for a new submit"
                    );
                }
            }
        }

        let item = ThreadItem::user(text);
        let message = item.to_message();
        let index = state.thread.push(item);
        inner.apply_change(&mut state, ThreadChange::Appended(index));
        inner.set_status(&mut state, "Message appended");

        let turn = TurnId(state.next_turn);
        state.next_turn += 1;
        state.active_turn = Some(turn);
        state.reducer = ThreadReducer::new();

        let cancel = CancellationToken::new();
        let handle = runtime.spawn(Arc::clone(inner).run_turn(turn, message, cancel.clone()));
        state.task = Some(ActiveTask {
            turn,
            cancel,
            handle: Some(handle),
        });

        tracing::info!(session = %inner.session, turn = turn.0, "started turn");
        Ok(turn)
    }

    /// Stops the streaming turn, if any. Returns whether a turn was running.
    pub fn cancel(&self) -> bool {
        let mut state = self.inner.lock_state();
        let Some(active) = state.active_turn.take() else {
            return false;
        };

        if let Some(task) = &state.task {
            task.cancel.cancel();
        }
        self.inner.set_status(&mut state, STATUS_CANCELLED);
        tracing::info!(session = %self.inner.session, turn = active.0, "cancelled turn");
        true
    }

    /// Waits for the most recently started turn task to exit.
    pub async fn wait(&self) {
        let pending = {
            let mut state = self.inner.lock_state();
            state
                .task
                .as_mut()
                .and_then(|task| task.handle.take().map(|handle| (task.turn, handle)))
        };

        if let Some((turn, handle)) = pending
            && let Err(error) = handle.await
        {
            tracing::warn!(
                session = %self.inner.session,
                turn = turn.0,
                error = %error,
                "turn task did not exit cleanly"
            );
        }
    }

    pub fn render_page(&self) -> String {
        crate::page::render_page(&self.snapshot(), &self.inner.renderer)
    }
}

impl DisplayInner {
    fn lock_state(&self) -> MutexGuard<'_, DisplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, update: DisplayUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    fn set_status(&self, state: &mut DisplayState, status: impl Into<String>) {
        let status = status.into();
        tracing::debug!(session = %self.session, status = %status, "status changed");
        if let Some(log) = state.debug_log.as_mut() {
            log.push(status.clone());
        }
        state.status = status.clone();
        self.notify(DisplayUpdate::StatusChanged(status));
    }

    fn apply_change(&self, state: &mut DisplayState, change: ThreadChange) {
        let index = change.index();
        let Some(html) = state
            .thread
            .get(index)
            .map(|item| item.render_html(&self.renderer))
        else {
            return;
        };

        match change {
            ThreadChange::Appended(_) => {
                state.rendered.push(html);
                self.notify(DisplayUpdate::ItemAppended(index));
            }
            ThreadChange::Updated(_) => {
                if let Some(slot) = state.rendered.get_mut(index) {
                    *slot = html;
                }
                self.notify(DisplayUpdate::ItemUpdated(index));
            }
        }
    }

    /// Locks state for `turn`, or returns `None` once the turn is superseded.
    fn lock_for(&self, turn: TurnId) -> Option<MutexGuard<'_, DisplayState>> {
        let state = self.lock_state();
        (state.active_turn == Some(turn)).then_some(state)
    }

    fn turn_status(&self, turn: TurnId, status: &str) -> bool {
        let Some(mut state) = self.lock_for(turn) else {
            return false;
        };
        self.set_status(&mut state, status);
        true
    }

    async fn run_turn(
        self: Arc<Self>,
        turn: TurnId,
        message: AgentMessage,
        cancel: CancellationToken,
    ) {
        if !self.turn_status(turn, "Sending message") {
            return;
        }

        let request = AgentRequest::new(self.session, vec![message]);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.log_cancelled(turn),
            opened = self.agent.stream_events(request) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => return self.fail_turn(turn, error),
        };

        if !self.turn_status(turn, "Stream created") {
            return;
        }

        let mut model_turn_open = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.log_cancelled(turn),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    match &event {
                        AgentEvent::TurnStart | AgentEvent::Token { .. } => model_turn_open = true,
                        AgentEvent::TurnEnd { .. } => model_turn_open = false,
                        AgentEvent::Other { .. } => {}
                    }
                    if !self.apply_event(turn, &event) {
                        return;
                    }
                }
                Some(Err(error)) => return self.fail_turn(turn, error),
                None => break,
            }
        }

        if model_turn_open {
            return self.fail_turn(
                turn,
                ChatError::StreamTruncated {
                    stage: "stream-closed",
                },
            );
        }

        self.finish_turn(turn);
    }

    fn apply_event(&self, turn: TurnId, event: &AgentEvent) -> bool {
        let Some(mut state) = self.lock_for(turn) else {
            tracing::debug!(
                session = %self.session,
                turn = turn.0,
                event = event.name(),
                "dropping event from a superseded turn"
            );
            return false;
        };

        self.set_status(&mut state, event.name());
        let state = &mut *state;
        let changes = state.reducer.apply(&mut state.thread, event);
        for change in changes {
            self.apply_change(state, change);
        }
        true
    }

    fn fail_turn(&self, turn: TurnId, error: ChatError) {
        let Some(mut state) = self.lock_for(turn) else {
            return;
        };

        tracing::warn!(
            session = %self.session,
            turn = turn.0,
            error = %error,
            "agent turn failed"
        );
        let message = error.to_string();
        let index = state.thread.push(ThreadItem::error(message.clone()));
        self.apply_change(&mut state, ThreadChange::Appended(index));
        state.active_turn = None;
        self.set_status(&mut state, format!("Error: {message}"));
    }

    fn finish_turn(&self, turn: TurnId) {
        let Some(mut state) = self.lock_for(turn) else {
            return;
        };

        state.active_turn = None;
        self.set_status(&mut state, STATUS_IDLE);
        tracing::info!(session = %self.session, turn = turn.0, "turn finished");
    }

    fn log_cancelled(&self, turn: TurnId) {
        tracing::debug!(session = %self.session, turn = turn.0, "turn task stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use futures::stream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::agent::{AgentEventStream, BoxFuture};
    use crate::events::ContentPart;
    use crate::sender::Sender;
    use crate::thread_item::ItemKind;

    type Script = Vec<ChatResult<AgentEvent>>;

    /// Answers each request with the next scripted event list.
    struct ScriptedAgent {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<AgentRequest>>,
    }

    impl ScriptedAgent {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    impl AgentRunnable for ScriptedAgent {
        fn stream_events<'a>(
            &'a self,
            request: AgentRequest,
        ) -> BoxFuture<'a, ChatResult<AgentEventStream>> {
            self.requests.lock().unwrap().push(request);
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            Box::pin(async move { Ok(stream::iter(script).boxed()) })
        }
    }

    /// Streams whatever the test pushes through a channel.
    struct ChannelAgent {
        receivers: Mutex<VecDeque<mpsc::UnboundedReceiver<ChatResult<AgentEvent>>>>,
    }

    impl AgentRunnable for ChannelAgent {
        fn stream_events<'a>(
            &'a self,
            _request: AgentRequest,
        ) -> BoxFuture<'a, ChatResult<AgentEventStream>> {
            let receiver = self.receivers.lock().unwrap().pop_front();
            Box::pin(async move {
                let receiver = receiver.expect("a receiver per turn");
                Ok(stream::unfold(receiver, |mut receiver| async move {
                    receiver.recv().await.map(|event| (event, receiver))
                })
                .boxed())
            })
        }
    }

    struct FailingAgent;

    impl AgentRunnable for FailingAgent {
        fn stream_events<'a>(
            &'a self,
            _request: AgentRequest,
        ) -> BoxFuture<'a, ChatResult<AgentEventStream>> {
            Box::pin(async move {
                Err(ChatError::AgentStream {
                    stage: "open",
                    source: "connection refused".into(),
                })
            })
        }
    }

    fn text(value: &str) -> AgentEvent {
        AgentEvent::token(vec![ContentPart::text(value)])
    }

    fn items(display: &ChatDisplay) -> Vec<(Sender, ItemKind, String)> {
        display
            .snapshot()
            .items
            .into_iter()
            .map(|rendered| {
                (
                    rendered.item.sender(),
                    rendered.item.kind(),
                    rendered.item.text().to_string(),
                )
            })
            .collect()
    }

    async fn settle(display: &ChatDisplay) {
        for _ in 0..100 {
            if !display.is_busy() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn submit_streams_reply_into_one_agent_item() {
        let agent = ScriptedAgent::new(vec![vec![
            Ok(AgentEvent::TurnStart),
            Ok(text("Hi")),
            Ok(text(" there")),
            Ok(AgentEvent::turn_end(vec![ContentPart::text("Hi there")])),
        ]]);
        let display = ChatDisplay::new(agent.clone(), DisplayConfig::default());
        let mut updates = display.subscribe();

        display.submit("hello").expect("submit accepted");
        display.wait().await;

        assert_eq!(
            items(&display),
            vec![
                (Sender::User, ItemKind::Message, "hello".to_string()),
                (Sender::Agent, ItemKind::Message, "Hi there".to_string()),
            ]
        );
        let snapshot = display.snapshot();
        assert_eq!(snapshot.status, STATUS_IDLE);
        assert_eq!(snapshot.items[1].html, "<p>Hi there</p>\n");
        assert_eq!(snapshot.items[0].label, r"\(\color{green}{user:}\)");

        let requests = agent.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].session, display.session());
        assert_eq!(requests[0].messages, vec![AgentMessage::new(Sender::User, "hello")]);

        assert_eq!(updates.recv().await.ok(), Some(DisplayUpdate::ItemAppended(0)));
    }

    #[tokio::test]
    async fn streamed_turn_publishes_every_update() {
        let agent = ScriptedAgent::new(vec![vec![
            Ok(AgentEvent::TurnStart),
            Ok(text("Hi")),
            Ok(text(" there")),
            Ok(AgentEvent::turn_end(vec![ContentPart::text("Hi there")])),
        ]]);
        let display = ChatDisplay::new(agent, DisplayConfig::default());
        let mut updates = display.subscribe();

        display.submit("hello").expect("submit accepted");
        display.wait().await;

        let mut received = Vec::new();
        while let Ok(update) = updates.try_recv() {
            received.push(update);
        }

        let status = |name: &str| DisplayUpdate::StatusChanged(name.to_string());
        assert_eq!(
            received,
            vec![
                DisplayUpdate::ItemAppended(0),
                status("Message appended"),
                status("Sending message"),
                status("Stream created"),
                status("on_chat_model_start"),
                status("on_chat_model_stream"),
                DisplayUpdate::ItemAppended(1),
                status("on_chat_model_stream"),
                DisplayUpdate::ItemUpdated(1),
                status("on_chat_model_end"),
                DisplayUpdate::ItemUpdated(1),
                status(STATUS_IDLE),
            ]
        );
    }

    #[test]
    fn submit_outside_a_runtime_is_refused() {
        let display = ChatDisplay::new(ScriptedAgent::new(Vec::new()), DisplayConfig::default());

        let result = display.submit("hello");
        assert!(matches!(result, Err(ChatError::NoRuntime { stage: "submit", .. })));
        assert!(display.snapshot().items.is_empty());
        assert!(!display.is_busy());
        assert_eq!(display.status(), STATUS_IDLE);
    }

    #[tokio::test]
    async fn session_is_reused_across_turns() {
        let agent = ScriptedAgent::new(vec![Vec::new(), Vec::new()]);
        let display = ChatDisplay::new(agent.clone(), DisplayConfig::default());

        display.submit("one").expect("submit accepted");
        display.wait().await;
        display.submit("two").expect("submit accepted");
        display.wait().await;

        let requests = agent.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].session, requests[1].session);
        assert_eq!(requests[1].messages[0].content, "two");
    }

    #[tokio::test]
    async fn stream_error_becomes_error_item() {
        let agent = ScriptedAgent::new(vec![vec![
            Ok(AgentEvent::TurnStart),
            Ok(text("partial")),
            Err(ChatError::AgentStream {
                stage: "stream-chunk",
                source: "socket closed".into(),
            }),
        ]]);
        let display = ChatDisplay::new(agent, DisplayConfig::default());

        display.submit("hello").expect("submit accepted");
        display.wait().await;

        let items = items(&display);
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].2, "partial");
        assert_eq!(items[2].1, ItemKind::Error);
        assert!(items[2].2.contains("socket closed"));
        assert!(display.status().starts_with("Error: "));
        assert!(!display.is_busy());
    }

    #[tokio::test]
    async fn open_failure_becomes_error_item() {
        let display = ChatDisplay::new(Arc::new(FailingAgent), DisplayConfig::default());

        display.submit("hello").expect("submit accepted");
        display.wait().await;

        let items = items(&display);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].1, ItemKind::Error);
        assert!(items[1].2.contains("connection refused"));
    }

    #[tokio::test]
    async fn truncated_model_turn_is_reported() {
        let agent = ScriptedAgent::new(vec![vec![Ok(AgentEvent::TurnStart), Ok(text("Hi"))]]);
        let display = ChatDisplay::new(agent, DisplayConfig::default());

        display.submit("hello").expect("submit accepted");
        display.wait().await;

        let items = items(&display);
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].1, ItemKind::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn new_submit_cancels_the_running_turn() {
        let (first_tx, first_rx) = mpsc::unbounded_channel();
        let (second_tx, second_rx) = mpsc::unbounded_channel();
        let agent = Arc::new(ChannelAgent {
            receivers: Mutex::new(VecDeque::from([first_rx, second_rx])),
        });
        let display = ChatDisplay::new(agent, DisplayConfig::default());

        display.submit("first").expect("submit accepted");
        first_tx.send(Ok(AgentEvent::TurnStart)).unwrap();
        first_tx.send(Ok(text("old"))).unwrap();
        for _ in 0..100 {
            if items(&display).len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(items(&display).len(), 2);

        display.submit("second").expect("submit accepted");
        // Late events for the first turn must not land anywhere.
        let _ = first_tx.send(Ok(text(" stale")));
        second_tx.send(Ok(AgentEvent::TurnStart)).unwrap();
        second_tx.send(Ok(text("new"))).unwrap();
        second_tx
            .send(Ok(AgentEvent::turn_end(vec![ContentPart::text("new")])))
            .unwrap();
        drop(second_tx);
        display.wait().await;

        assert_eq!(
            items(&display)
                .into_iter()
                .map(|(sender, _, text)| (sender, text))
                .collect::<Vec<_>>(),
            vec![
                (Sender::User, "first".to_string()),
                (Sender::Agent, "old".to_string()),
                (Sender::User, "second".to_string()),
                (Sender::Agent, "new".to_string()),
            ]
        );
        assert_eq!(display.status(), STATUS_IDLE);
    }

    #[tokio::test(start_paused = true)]
    async fn reject_policy_refuses_submit_while_busy() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let agent = Arc::new(ChannelAgent {
            receivers: Mutex::new(VecDeque::from([rx])),
        });
        let display = ChatDisplay::new(
            agent,
            DisplayConfig {
                debug: false,
                submit_policy: SubmitPolicy::RejectWhileBusy,
            },
        );

        display.submit("first").expect("submit accepted");
        let rejected = display.submit("second");
        assert!(matches!(rejected, Err(ChatError::TurnInProgress { .. })));
        assert_eq!(items(&display).len(), 1);

        assert!(display.cancel());
        assert!(!display.cancel());
        assert_eq!(display.status(), STATUS_CANCELLED);
        display.wait().await;
        settle(&display).await;
        assert!(!display.is_busy());
    }

    #[tokio::test]
    async fn debug_log_mirrors_status_changes() {
        let agent = ScriptedAgent::new(vec![vec![
            Ok(AgentEvent::TurnStart),
            Ok(AgentEvent::Other {
                name: "on_tool_start".to_string(),
            }),
            Ok(AgentEvent::turn_end(Vec::new())),
        ]]);
        let display = ChatDisplay::new(
            agent,
            DisplayConfig {
                debug: true,
                submit_policy: SubmitPolicy::default(),
            },
        );

        display.submit("hello").expect("submit accepted");
        display.wait().await;

        let log = display.snapshot().debug_log;
        assert_eq!(log.first().map(String::as_str), Some("Message appended"));
        assert!(log.iter().any(|line| line == "on_chat_model_start"));
        assert!(log.iter().any(|line| line == "on_tool_start"));
    }
}
