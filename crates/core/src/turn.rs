use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "user"),
            Speaker::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for Speaker {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Speaker::User),
            "agent" | "assistant" => Ok(Speaker::Agent),
            other => Err(format!("unknown speaker '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Provisional,
    Final,
}

/// One utterance or message attributed to a speaker.
///
/// Only `Final` turns are accepted by the context accumulator and the
/// persistence gateway. The timestamp is taken when the content is finalized,
/// not when the underlying audio started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub speaker: Speaker,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: TurnStatus,
}

impl Turn {
    /// Builds a final turn stamped with the current time.
    pub fn finalized(speaker: Speaker, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            speaker,
            content: content.into(),
            timestamp: Utc::now(),
            status: TurnStatus::Final,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::finalized(Speaker::User, content)
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::finalized(Speaker::Agent, content)
    }

    pub fn is_final(&self) -> bool {
        self.status == TurnStatus::Final
    }
}

/// An agent turn that is still being streamed by the responder.
///
/// It is bound to the generation that produced it and is either finalized into
/// a [`Turn`] on completion or dropped on interruption.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTurn {
    pub generation: Generation,
    pub content: String,
}

impl PendingTurn {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            content: String::new(),
        }
    }

    pub fn push(&mut self, fragment: &str) {
        self.content.push_str(fragment);
    }

    /// Converts the accumulated text into a final agent turn. Whitespace-only
    /// responses produce nothing.
    pub fn finalize(self) -> Option<Turn> {
        let content = self.content.trim();
        if content.is_empty() {
            None
        } else {
            Some(Turn::agent(content))
        }
    }
}

/// Tag identifying one agent-response attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}
