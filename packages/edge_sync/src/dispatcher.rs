//! Routes inbound topic payloads to the delta decoder and keeps the cursor
//! in step with the inbox sync stream.
//!
//! Dispatch is a pure function of (cursor, topic, payload): the only state it
//! touches is the cursor it is handed, so replaying a payload yields the same
//! events and never moves the cursor backwards.

use serde_json::Value;
use tracing::{debug, warn};

use crate::delta::{self, DeltaEvent, IdValue};
use crate::session::SyncCursor;
use crate::topics::Topic;

/// What one inbound payload produced.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// Events in payload order.
    pub events: Vec<DeltaEvent>,
    /// Set when the server reports that our sync queue is gone. The cursor
    /// must be re-bootstrapped and the connection replaced.
    pub resync_required: Option<String>,
    /// Entries that failed to decode and were dropped.
    pub skipped: usize,
}

pub fn dispatch(cursor: &mut SyncCursor, topic: &str, payload: &[u8]) -> DispatchOutcome {
    let kind = Topic::parse(topic);
    match kind {
        Topic::Ignored => return DispatchOutcome::default(),
        Topic::Unknown => {
            debug!(topic, "Dropping payload on unrecognized topic");
            return DispatchOutcome::default();
        }
        _ => {}
    }

    let json: Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!(topic, error = %e, "Discarding undecodable payload");
            return DispatchOutcome {
                skipped: 1,
                ..Default::default()
            };
        }
    };

    match kind {
        Topic::InboxSync => dispatch_inbox_sync(cursor, topic, &json),
        Topic::MessageMirror => extract_deltas(topic, &json),
        Topic::Typing => match delta::parse_typing(&json) {
            Ok(t) => DispatchOutcome {
                events: vec![DeltaEvent::TypingNotification(t)],
                ..Default::default()
            },
            Err(e) => {
                warn!(topic, error = %e, "Discarding typing payload");
                DispatchOutcome {
                    skipped: 1,
                    ..Default::default()
                }
            }
        },
        Topic::Presence => match delta::parse_presence(&json) {
            Ok((updates, failures)) => {
                for e in &failures {
                    warn!(topic, error = %e, "Skipping presence entry");
                }
                DispatchOutcome {
                    events: updates.into_iter().map(DeltaEvent::PresenceUpdate).collect(),
                    skipped: failures.len(),
                    ..Default::default()
                }
            }
            Err(e) => {
                warn!(topic, error = %e, "Discarding presence payload");
                DispatchOutcome {
                    skipped: 1,
                    ..Default::default()
                }
            }
        },
        Topic::Ignored | Topic::Unknown => DispatchOutcome::default(),
    }
}

fn seq_field(json: &Value, key: &str) -> Option<u64> {
    json.get(key)
        .and_then(IdValue::from_json)
        .and_then(|id| id.as_u64())
}

/// `/t_ms`: the cursor authority.
fn dispatch_inbox_sync(cursor: &mut SyncCursor, topic: &str, json: &Value) -> DispatchOutcome {
    if let Some(code) = json.get("errorCode").and_then(Value::as_str) {
        warn!(topic, error_code = code, "Sync queue rejected, cursor needs a fresh bootstrap");
        return DispatchOutcome {
            resync_required: Some(code.to_string()),
            ..Default::default()
        };
    }

    if let Some(token) = json.get("syncToken").and_then(Value::as_str) {
        if cursor.sync_token.as_deref() != Some(token) {
            debug!("Sync token issued");
            cursor.set_sync_token(token);
        }
    }

    for key in ["firstDeltaSeqId", "lastIssuedSeqId"] {
        if let Some(seq_id) = seq_field(json, key) {
            if cursor.advance(seq_id) {
                debug!(seq_id, "Cursor advanced");
            }
        }
    }

    // Cursor is settled before any event leaves this function
    extract_deltas(topic, json)
}

/// Decode every entry of `deltas` independently.
fn extract_deltas(topic: &str, json: &Value) -> DispatchOutcome {
    let mut outcome = DispatchOutcome::default();
    let Some(entries) = json.get("deltas").and_then(Value::as_array) else {
        return outcome;
    };

    for entry in entries {
        match delta::parse_delta(entry) {
            Ok(Some(event)) => outcome.events.push(event),
            Ok(None) => {}
            Err(e) => {
                warn!(topic, error = %e, "Skipping malformed delta");
                outcome.skipped += 1;
            }
        }
    }
    outcome
}
