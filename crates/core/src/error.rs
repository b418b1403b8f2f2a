use snafu::Snafu;

/// Error type produced by agent backends while opening or draining a stream.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("unknown sender '{sender}', expected one of user, system, agent, tool"))]
    InvalidSender {
        stage: &'static str,
        sender: String,
    },
    #[snafu(display("a turn is already streaming for session {session}"))]
    TurnInProgress {
        stage: &'static str,
        session: String,
    },
    #[snafu(display("no tokio runtime to run the turn on `{stage}`: {source}"))]
    NoRuntime {
        stage: &'static str,
        source: tokio::runtime::TryCurrentError,
    },
    #[snafu(display("failed to decode agent event on `{stage}`: {source}"))]
    DecodeEvent {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("agent event is missing `{field}`"))]
    MalformedEvent {
        stage: &'static str,
        field: &'static str,
    },
    #[snafu(display("failed to read replay log {path:?} on `{stage}`: {source}"))]
    ReadReplay {
        stage: &'static str,
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("agent stream ended before the model turn finished"))]
    StreamTruncated { stage: &'static str },
    #[snafu(display("agent stream failed on `{stage}`: {source}"))]
    AgentStream {
        stage: &'static str,
        source: BoxedError,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
