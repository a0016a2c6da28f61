use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Ai => "ai",
        }
    }
}

/// One conversation turn as the engine consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Sender,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub nickname: String,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnEntry {
    pub turn_id: String,
    pub sender: Sender,
    pub text: String,
    pub ts: String,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

/// File-backed conversation record for one stylist session.
///
/// Loading is tolerant: a missing or unreadable file yields a fresh
/// transcript, and individual turn entries that fail to decode are skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTranscript {
    pub path: PathBuf,
    pub schema_version: u64,
    pub transcript_id: String,
    pub created_at: String,
    pub turns: Vec<TurnEntry>,
}

impl ChatTranscript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: 1,
            transcript_id: Uuid::new_v4().to_string(),
            created_at: now_utc_iso(),
            turns: Vec::new(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut transcript = Self::new(path.clone());
        let payload = read_json(&path).unwrap_or(Value::Object(Map::new()));
        let Some(obj) = payload.as_object() else {
            return transcript;
        };

        transcript.schema_version = obj
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(transcript.schema_version);
        transcript.transcript_id = obj
            .get("transcript_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(transcript.transcript_id);
        transcript.created_at = obj
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(transcript.created_at);

        if let Some(turns) = obj.get("turns").and_then(Value::as_array) {
            for item in turns {
                if let Ok(parsed) = serde_json::from_value::<TurnEntry>(item.clone()) {
                    transcript.turns.push(parsed);
                }
            }
        }
        transcript
    }

    pub fn append(&mut self, sender: Sender, text: &str) -> TurnEntry {
        let turn = TurnEntry {
            turn_id: self.next_turn_id(),
            sender,
            text: text.to_string(),
            ts: now_utc_iso(),
            reactions: Vec::new(),
        };
        self.turns.push(turn.clone());
        turn
    }

    pub fn add_reaction(&mut self, turn_id: &str, nickname: &str, emoji: &str) -> bool {
        let Some(turn) = self
            .turns
            .iter_mut()
            .find(|entry| entry.turn_id == turn_id)
        else {
            return false;
        };
        turn.reactions.push(Reaction {
            nickname: nickname.to_string(),
            emoji: emoji.to_string(),
        });
        true
    }

    /// The ordered sender/text pairs a prompt is assembled from.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .map(|turn| ChatMessage {
                sender: turn.sender,
                text: turn.text.clone(),
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let mut payload = Map::new();
        payload.insert(
            "schema_version".to_string(),
            Value::Number(self.schema_version.into()),
        );
        payload.insert(
            "transcript_id".to_string(),
            Value::String(self.transcript_id.clone()),
        );
        payload.insert(
            "created_at".to_string(),
            Value::String(self.created_at.clone()),
        );
        payload.insert(
            "turns".to_string(),
            Value::Array(
                self.turns
                    .iter()
                    .map(|entry| serde_json::to_value(entry).unwrap_or(Value::Null))
                    .collect(),
            ),
        );

        write_json(&self.path, Value::Object(payload))
    }

    fn next_turn_id(&self) -> String {
        format!("t{}", self.turns.len() + 1)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json(path: &Path, payload: Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}
