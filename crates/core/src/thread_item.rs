use serde::{Deserialize, Serialize};

use crate::error::ChatResult;
use crate::render::Renderer;
use crate::sender::Sender;

/// Distinguishes regular messages from failures reported into the thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    #[default]
    Message,
    Error,
}

/// Message handed to an agent as input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: Sender,
    pub content: String,
}

impl AgentMessage {
    pub fn new(role: Sender, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One displayed message bubble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadItem {
    sender: Sender,
    kind: ItemKind,
    text: String,
    tool_name: Option<String>,
}

impl ThreadItem {
    pub fn new(text: impl Into<String>, sender: Sender, tool_name: Option<String>) -> Self {
        Self {
            sender,
            kind: ItemKind::Message,
            text: text.into(),
            tool_name,
        }
    }

    /// Builds an item from a textual sender name.
    pub fn parse(
        text: impl Into<String>,
        sender: &str,
        tool_name: Option<String>,
    ) -> ChatResult<Self> {
        let sender = Sender::parse(sender)?;
        Ok(Self::new(text, sender, tool_name))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(text, Sender::User, None)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            sender: Sender::System,
            kind: ItemKind::Error,
            text: message.into(),
            tool_name: None,
        }
    }

    pub fn sender(&self) -> Sender {
        self.sender
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.tool_name.as_deref()
    }

    pub fn set_sender(&mut self, sender: Sender) {
        self.sender = sender;
    }

    pub fn set_sender_name(&mut self, sender: &str) -> ChatResult<()> {
        self.sender = Sender::parse(sender)?;
        Ok(())
    }

    /// Replaces the text wholesale. A `None` tool name keeps the current one.
    pub fn update(&mut self, text: impl Into<String>, tool_name: Option<&str>) {
        self.text = text.into();
        self.replace_tool_name(tool_name);
    }

    pub fn append_text(&mut self, text: &str, tool_name: Option<&str>) {
        self.text.push_str(text);
        self.replace_tool_name(tool_name);
    }

    fn replace_tool_name(&mut self, tool_name: Option<&str>) {
        if let Some(name) = tool_name.filter(|name| !name.is_empty()) {
            self.tool_name = Some(name.to_string());
        }
    }

    /// Role label in MathJax form, e.g. `\(\color{green}{user:}\)`.
    pub fn label(&self) -> String {
        let (colour, name) = match self.kind {
            ItemKind::Error => ("red", "error"),
            ItemKind::Message => (self.sender.colour(), self.sender.as_str()),
        };
        format!(r"\(\color{{{colour}}}{{{name}:}}\)")
    }

    pub fn render_html(&self, renderer: &Renderer) -> String {
        match (self.kind, self.sender) {
            (ItemKind::Error, _) => renderer.error(&self.text),
            (ItemKind::Message, Sender::Tool) => {
                renderer.tool_call(self.tool_name.as_deref(), &self.text)
            }
            (ItemKind::Message, _) => renderer.markdown(&self.text),
        }
    }

    pub fn to_message(&self) -> AgentMessage {
        AgentMessage::new(self.sender, self.text.clone())
    }
}
