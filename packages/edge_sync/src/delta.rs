//! Domain events decoded from delta entries and topic payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};

/// Events handed to the consumer. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeltaEvent {
    Message(Message),
    MessageReply(MessageReply),
    TypingNotification(TypingNotification),
    PresenceUpdate(PresenceUpdate),
}

impl DeltaEvent {
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            Self::Message(m) => Some(&m.thread_id),
            Self::MessageReply(r) => Some(&r.message.thread_id),
            Self::TypingNotification(t) => Some(&t.thread_id),
            Self::PresenceUpdate(_) => None,
        }
    }

    pub fn sender_id(&self) -> &str {
        match self {
            Self::Message(m) => &m.sender_id,
            Self::MessageReply(r) => &r.message.sender_id,
            Self::TypingNotification(t) => &t.sender_id,
            Self::PresenceUpdate(p) => &p.user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub thread_id: String,
    pub sender_id: String,
    pub message_id: String,
    pub body: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Group threads are keyed by thread id, one-to-one threads by the peer.
    pub is_group: bool,
    pub attachments: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageReply {
    pub message: Message,
    /// The message being replied to, when the server included it.
    pub replied_to: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypingNotification {
    pub thread_id: String,
    pub sender_id: String,
    pub is_typing: bool,
    pub from_mobile: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceUpdate {
    pub user_id: String,
    /// Raw status: 0 idle, 2 active.
    pub status: u8,
    pub last_active: Option<DateTime<Utc>>,
}

impl PresenceUpdate {
    pub fn is_active(&self) -> bool {
        self.status == 2
    }
}

/// Strip the `fbid:` / `id.` style prefixes some payloads put on thread ids.
pub fn normalize_thread_id(raw: &str) -> String {
    for prefix in ["fbid:", "fbid.", "id:", "id."] {
        if let Some(rest) = raw.strip_prefix(prefix) {
            return rest.to_string();
        }
    }
    raw.to_string()
}

// =============================================================================
// Wire shapes
// =============================================================================

/// Ids arrive as JSON strings or numbers depending on the topic.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum IdValue {
    Str(String),
    Num(u64),
}

impl IdValue {
    pub(crate) fn from_json(value: &Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }

    pub(crate) fn into_string(self) -> String {
        match self {
            Self::Str(s) => s,
            Self::Num(n) => n.to_string(),
        }
    }

    pub(crate) fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Str(s) => s.parse().ok(),
            Self::Num(n) => Some(*n),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawThreadKey {
    thread_fb_id: Option<IdValue>,
    other_user_fb_id: Option<IdValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessageMetadata {
    thread_key: RawThreadKey,
    actor_fb_id: IdValue,
    message_id: String,
    timestamp: Option<IdValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    message_metadata: RawMessageMetadata,
    body: Option<String>,
    #[serde(default)]
    attachments: Vec<Value>,
}

impl RawMessage {
    fn into_message(self) -> Result<Message> {
        let meta = self.message_metadata;
        let (thread_id, is_group) = match (
            meta.thread_key.thread_fb_id,
            meta.thread_key.other_user_fb_id,
        ) {
            (Some(id), _) => (id.into_string(), true),
            (None, Some(id)) => (id.into_string(), false),
            (None, None) => {
                return Err(SyncError::Parse(format!(
                    "message {} has an empty thread key",
                    meta.message_id
                )));
            }
        };
        Ok(Message {
            thread_id,
            sender_id: meta.actor_fb_id.into_string(),
            message_id: meta.message_id,
            body: self.body.filter(|b| !b.is_empty()),
            timestamp: meta
                .timestamp
                .and_then(|t| t.as_u64())
                .and_then(|ms| DateTime::from_timestamp_millis(ms as i64)),
            is_group,
            attachments: self.attachments,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessageReply {
    message: RawMessage,
    replied_to_message: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawClientPayload {
    #[serde(default)]
    deltas: Vec<Value>,
}

// =============================================================================
// Decoding
// =============================================================================

/// Turn one delta entry into zero or one event.
///
/// Unhandled classes yield `Ok(None)`. Entries that claim a handled class but
/// do not have its shape are `Parse` errors.
pub fn parse_delta(entry: &Value) -> Result<Option<DeltaEvent>> {
    let class = entry
        .get("class")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Parse("delta entry has no class".into()))?;

    match class {
        "NewMessage" => {
            let raw = RawMessage::deserialize(entry)
                .map_err(|e| SyncError::Parse(format!("NewMessage: {e}")))?;
            Ok(Some(DeltaEvent::Message(raw.into_message()?)))
        }
        "ClientPayload" => parse_client_payload(entry),
        _ => Ok(None),
    }
}

/// `ClientPayload` wraps a JSON document encoded as an array of bytes.
fn parse_client_payload(entry: &Value) -> Result<Option<DeltaEvent>> {
    let bytes: Vec<u8> = entry
        .get("payload")
        .map(|p| Vec::<u8>::deserialize(p))
        .transpose()
        .map_err(|e| SyncError::Parse(format!("ClientPayload bytes: {e}")))?
        .ok_or_else(|| SyncError::Parse("ClientPayload without payload".into()))?;

    let inner: RawClientPayload = serde_json::from_slice(&bytes)
        .map_err(|e| SyncError::Parse(format!("ClientPayload body: {e}")))?;

    let Some(reply) = inner
        .deltas
        .iter()
        .find_map(|d| d.get("deltaMessageReply"))
    else {
        return Ok(None);
    };

    let raw = RawMessageReply::deserialize(reply)
        .map_err(|e| SyncError::Parse(format!("deltaMessageReply: {e}")))?;
    Ok(Some(DeltaEvent::MessageReply(MessageReply {
        message: raw.message.into_message()?,
        replied_to: raw
            .replied_to_message
            .map(RawMessage::into_message)
            .transpose()?,
    })))
}

#[derive(Debug, Deserialize)]
struct RawTyping {
    #[serde(default)]
    state: Option<Value>,
    sender_fbid: Option<IdValue>,
    thread: Option<IdValue>,
    #[serde(default)]
    from_mobile: bool,
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Typing payloads omit `thread` in one-to-one chats; the sender is the thread.
pub fn parse_typing(payload: &Value) -> Result<TypingNotification> {
    let raw = RawTyping::deserialize(payload)
        .map_err(|e| SyncError::Parse(format!("typing payload: {e}")))?;
    let sender_id = raw
        .sender_fbid
        .map(IdValue::into_string)
        .unwrap_or_default();
    let thread = raw
        .thread
        .map(IdValue::into_string)
        .unwrap_or_else(|| sender_id.clone());
    Ok(TypingNotification {
        thread_id: normalize_thread_id(&thread),
        sender_id,
        is_typing: raw.state.as_ref().is_some_and(truthy),
        from_mobile: raw.from_mobile,
    })
}

#[derive(Debug, Deserialize)]
struct RawPresenceEntry {
    u: IdValue,
    #[serde(default)]
    p: u8,
    /// Last active, seconds since epoch.
    l: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawPresenceList {
    #[serde(default)]
    list: Vec<Value>,
}

/// Each entry of a presence `list` is decoded independently; the second
/// element of the pair holds the failures.
pub fn parse_presence(payload: &Value) -> Result<(Vec<PresenceUpdate>, Vec<SyncError>)> {
    let raw = RawPresenceList::deserialize(payload)
        .map_err(|e| SyncError::Parse(format!("presence payload: {e}")))?;

    let mut updates = Vec::with_capacity(raw.list.len());
    let mut failures = Vec::new();
    for entry in &raw.list {
        match RawPresenceEntry::deserialize(entry) {
            Ok(e) => updates.push(PresenceUpdate {
                user_id: e.u.into_string(),
                status: e.p,
                last_active: e.l.and_then(|secs| DateTime::from_timestamp(secs, 0)),
            }),
            Err(e) => failures.push(SyncError::Parse(format!("presence entry: {e}"))),
        }
    }
    Ok((updates, failures))
}
