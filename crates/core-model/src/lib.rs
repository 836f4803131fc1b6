use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    #[default]
    Sms,
    Mms,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Sms => "SMS",
            MessageKind::Mms => "MMS",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sms" => Ok(MessageKind::Sms),
            "mms" => Ok(MessageKind::Mms),
            _ => anyhow::bail!("unknown message kind: {s}"),
        }
    }
}

/// Where a record came from. Push records carry a provisional id until they
/// are reconciled with the store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[default]
    Store,
    Push,
}

/// Risk annotation attached by an external scorer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Risk {
    #[default]
    Unscored,
    Scored { score: f64, reason: String },
}

impl Risk {
    /// Returns `None` when `score` is outside `[0.0, 1.0]` (or NaN).
    pub fn scored(score: f64, reason: impl Into<String>) -> Option<Self> {
        if !(0.0..=1.0).contains(&score) {
            return None;
        }
        Some(Risk::Scored {
            score,
            reason: reason.into(),
        })
    }

    pub fn score(&self) -> Option<f64> {
        match self {
            Risk::Unscored => None,
            Risk::Scored { score, .. } => Some(*score),
        }
    }

    pub fn is_scored(&self) -> bool {
        matches!(self, Risk::Scored { .. })
    }

    pub fn exceeds(&self, threshold: f64) -> bool {
        self.score().is_some_and(|s| s > threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub body: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub kind: MessageKind,
    /// Empty for push records that have not been reconciled yet.
    pub thread_key: String,
    pub is_read: bool,
    #[serde(default)]
    pub risk: Risk,
    #[serde(default)]
    pub origin: Origin,
}

impl Message {
    /// Normalizes a push payload. Missing sender/body become empty strings,
    /// a missing timestamp falls back to `received_at`.
    pub fn from_push(raw: RawPush, provisional_id: String, received_at: i64) -> Self {
        let kind = raw
            .kind
            .as_deref()
            .and_then(|k| k.parse().ok())
            .unwrap_or_default();
        Message {
            id: provisional_id,
            sender: raw.sender.unwrap_or_default(),
            body: raw.body.unwrap_or_default(),
            timestamp: raw.timestamp.unwrap_or(received_at),
            kind,
            thread_key: String::new(),
            is_read: false,
            risk: Risk::Unscored,
            origin: Origin::Push,
        }
    }

    /// Identity used to pair a push record with its store row.
    pub fn same_content(&self, other: &Message) -> bool {
        self.sender == other.sender && self.timestamp == other.timestamp && self.body == other.body
    }

    pub fn scoring_input(&self) -> ScoringInput {
        ScoringInput {
            id: self.id.clone(),
            sender: self.sender.clone(),
            body: self.body.clone(),
            timestamp: self.timestamp,
            kind: self.kind,
        }
    }
}

/// Read-only projection handed to a phishing scorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringInput {
    pub id: String,
    pub sender: String,
    pub body: String,
    pub timestamp: i64,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_key: String,
    pub peer_address: String,
    pub last_snippet: String,
    pub last_timestamp: i64,
    pub message_count: usize,
    pub unread_count: usize,
    pub thread_risk: bool,
}

/// Push payload exactly as the transport handed it over. Every field is
/// optional; see [`Message::from_push`] for the coercion rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPush {
    pub sender: Option<String>,
    pub body: Option<String>,
    pub timestamp: Option<i64>,
    pub kind: Option<String>,
}

impl RawPush {
    /// Lenient decoding of a transport payload. Wrongly typed fields are
    /// treated as absent instead of failing the whole payload.
    pub fn from_value(value: &Value) -> Self {
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| value.get(*k).and_then(Value::as_str))
                .map(ToOwned::to_owned)
        };
        let timestamp = ["timestamp", "date"].iter().find_map(|k| {
            let v = value.get(*k)?;
            v.as_i64()
                .or_else(|| v.as_f64().map(|f| f as i64))
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        });
        RawPush {
            sender: text(&["sender", "address"]),
            body: text(&["body"]),
            timestamp,
            kind: text(&["kind", "messageType", "type"]),
        }
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.sender.is_none() {
            out.push("sender");
        }
        if self.body.is_none() {
            out.push("body");
        }
        if self.timestamp.is_none() {
            out.push("timestamp");
        }
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store cannot be opened at all (permission, missing file, not a
    /// database). Usually needs user action; never retried silently.
    #[error("message store unavailable: {0}")]
    Unavailable(String),
    #[error("message store query failed: {0}")]
    Query(String),
}

/// Access to the device's persistent message log.
pub trait MessageStore {
    /// Every message, newest first.
    fn load_all(&self) -> Result<Vec<Message>, StoreError>;
    /// Messages of one thread, oldest first. Unknown keys yield an empty list.
    fn load_by_thread(&self, thread_key: &str) -> Result<Vec<Message>, StoreError>;
    /// `Ok(false)` when no row matched.
    fn delete(&self, message_id: &str) -> Result<bool, StoreError>;
    /// `Ok(false)` when no row matched.
    fn mark_read(&self, message_id: &str) -> Result<bool, StoreError>;
}

pub fn deterministic_id(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0x1f]);
    }
    hasher.finalize().to_hex().to_string()
}

pub fn content_fingerprint(sender: &str, timestamp: i64, body: &str, kind: MessageKind) -> String {
    deterministic_id(&[sender, &timestamp.to_string(), body, kind.as_str()])
}
