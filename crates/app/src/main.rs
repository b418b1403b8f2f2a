use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use nbchat_core::{AgentRunnable, ChatDisplay, ChatError, ItemKind, ReplayAgent, RenderedItem};
use nbchat_llm::{ProviderError, create_agent};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

mod settings;

use settings::{Settings, SettingsStore};

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to create agent on `{stage}`: {source}"))]
    CreateAgent {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to load replay log on `{stage}`: {source}"))]
    LoadReplay {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("failed to read prompt from stdin on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to create page directory at {path:?} on `{stage}`: {source}"))]
    CreatePageDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write page at {path:?} on `{stage}`: {source}"))]
    WritePage {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

type AppResult<T> = Result<T, AppError>;

/// Reads prompts from stdin, one per line, and prints each finished turn.
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "nbchat stopped");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> AppResult<()> {
    let store = SettingsStore::load();
    let settings = store.settings().clone();
    tracing::debug!(path = ?store.config_path(), "settings loaded");

    let chat = open_chat(&settings)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
        stage: "read-prompt-line",
    })? {
        let printed = chat.snapshot().items.len();

        if let Err(error) = chat.submit(line) {
            tracing::warn!(error = %error, "prompt was not submitted");
            continue;
        }
        chat.wait().await;

        let snapshot = chat.snapshot();
        for rendered in snapshot.items.iter().skip(printed) {
            println!("{}", plain_line(rendered));
        }

        if let Some(path) = &settings.output_path {
            write_page(path, &chat.render_page())?;
        }
    }

    Ok(())
}

fn build_agent(settings: &Settings) -> AppResult<Arc<dyn AgentRunnable>> {
    if let Some(path) = &settings.replay_path {
        let agent = ReplayAgent::from_path(path).context(LoadReplaySnafu {
            stage: "load-replay-agent",
        })?;
        tracing::info!(path = ?path, events = agent.len(), "replaying recorded events");
        return Ok(Arc::new(agent));
    }

    create_agent(settings.to_provider_config()).context(CreateAgentSnafu {
        stage: "create-provider-agent",
    })
}

fn open_chat(settings: &Settings) -> AppResult<ChatDisplay> {
    let agent = build_agent(settings)?;
    let chat = ChatDisplay::new(agent, settings.display_config());
    tracing::info!(session = %chat.session(), "chat display ready");
    Ok(chat)
}

fn plain_line(rendered: &RenderedItem) -> String {
    let item = &rendered.item;
    let name = match item.kind() {
        ItemKind::Error => "error".to_string(),
        ItemKind::Message => item.sender().to_string(),
    };
    match item.tool_name() {
        Some(tool) => format!("{name} ({tool}): {}", item.text()),
        None => format!("{name}: {}", item.text()),
    }
}

fn write_page(path: &Path, page: &str) -> AppResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreatePageDirSnafu {
            stage: "create-page-directory",
            path: parent.to_path_buf(),
        })?;
    }

    let temp_path = path.with_extension("html.tmp");
    std::fs::write(&temp_path, page).context(WritePageSnafu {
        stage: "write-temporary-page",
        path: temp_path.clone(),
    })?;
    std::fs::rename(&temp_path, path).context(WritePageSnafu {
        stage: "rename-temporary-page",
        path: path.to_path_buf(),
    })?;

    tracing::debug!(path = ?path, "page written");
    Ok(())
}
