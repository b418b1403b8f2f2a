use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

/// Who a thread item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    System,
    Agent,
    Tool,
}

impl Sender {
    pub const ALL: [Sender; 4] = [Sender::User, Sender::System, Sender::Agent, Sender::Tool];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::Agent => "agent",
            Self::Tool => "tool",
        }
    }

    /// Label colour used by the rendering surface.
    pub const fn colour(self) -> &'static str {
        match self {
            Self::User => "green",
            Self::System => "red",
            Self::Agent => "blue",
            Self::Tool => "orange",
        }
    }

    pub fn parse(raw: &str) -> ChatResult<Self> {
        match raw {
            "user" => Ok(Self::User),
            "system" => Ok(Self::System),
            "agent" => Ok(Self::Agent),
            "tool" => Ok(Self::Tool),
            other => Err(ChatError::InvalidSender {
                stage: "parse-sender",
                sender: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for Sender {
    type Err = ChatError;

    fn from_str(raw: &str) -> ChatResult<Self> {
        Self::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_name_round_trips() {
        for sender in Sender::ALL {
            assert_eq!(sender.as_str().parse::<Sender>().ok(), Some(sender));
        }
    }

    #[test]
    fn unknown_names_are_rejected() {
        for raw in ["", "assistant", "User", "error", " agent"] {
            let error = Sender::parse(raw).expect_err("name should be rejected");
            assert!(matches!(error, ChatError::InvalidSender { sender, .. } if sender == raw));
        }
    }
}
