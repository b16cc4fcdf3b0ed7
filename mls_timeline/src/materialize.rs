//! Raw row to display [`Message`] conversion.
//!
//! The payload envelope decodes once into a closed [`MessageBody`] variant;
//! exhaustive matching decides timeline content vs control traffic, so a new
//! kind added to the enum has to be handled here to compile.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::canonicalize;
use crate::storage::{RawStoredMessage, RowKind};
use crate::types::{Message, ProfileEntry};

/// Sentinel bodies written by the processing pipeline while a row has no real
/// user content. These are bookkeeping artifacts, not messages.
const PLACEHOLDER_SENTINELS: &[&str] = &[
    "decryption failed",
    "message unavailable",
    "self-sent message placeholder",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextContent {
    pub content: String,
    #[serde(default)]
    pub embed: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReactionContent {
    pub reference_id: String,
    pub emoji: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReadReceiptContent {
    pub reference_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemberChangeContent {
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AdminActionContent {
    pub action: String,
}

/// Decoded payload envelope. Everything except `Text` is control traffic:
/// reaction rows are re-read through the reaction store path, the rest is
/// consumed by other subsystems or dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text(TextContent),
    Reaction(ReactionContent),
    ReadReceipt(ReadReceiptContent),
    Typing,
    MemberChange(MemberChangeContent),
    AdminAction(AdminActionContent),
    #[serde(other)]
    Unknown,
}

impl MessageBody {
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

pub(crate) fn is_placeholder_text(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty()
        || PLACEHOLDER_SENTINELS
            .iter()
            .any(|s| trimmed.eq_ignore_ascii_case(s))
}

/// Convert a stored row into a display message, or filter it out.
///
/// Filtered: non-application rows, absent/expired payloads, control bodies,
/// and placeholder-error rows. Surviving rows start with an empty reaction
/// set; the reconciliation engine attaches reactions afterwards, and only to
/// displayable messages.
pub fn materialize(
    row: &RawStoredMessage,
    profiles: &HashMap<String, ProfileEntry>,
    now_ns: i64,
) -> Option<Message> {
    if row.kind != RowKind::Application {
        return None;
    }

    let payload = row.decrypted_payload.as_deref()?;
    if row.expire_at_ns.is_some_and(|at| at <= now_ns) {
        return None;
    }

    let body = match MessageBody::decode(payload) {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(message_id = %row.id, "undecodable payload envelope: {e}");
            return None;
        }
    };

    let text = match body {
        MessageBody::Text(text) => text,
        MessageBody::Reaction(_)
        | MessageBody::ReadReceipt(_)
        | MessageBody::Typing
        | MessageBody::MemberChange(_)
        | MessageBody::AdminAction(_) => return None,
        MessageBody::Unknown => {
            tracing::debug!(message_id = %row.id, "unknown content kind, skipping");
            return None;
        }
    };

    if row.processing_error.is_some() && is_placeholder_text(&text.content) {
        return None;
    }

    let profile = profiles.get(&canonicalize(&row.sender_id)).cloned();

    Some(Message {
        id: row.id.clone(),
        conversation_id: row.conversation_id.clone(),
        sender_id: row.sender_id.clone(),
        text: text.content,
        embed: text.embed,
        epoch: row.epoch,
        sequence: row.sequence,
        sent_at_ns: row.sent_at_ns,
        reactions: vec![],
        send_state: row.delivery_status,
        processing_error: row.processing_error.clone(),
        validation_failure_reason: row.validation_failure_reason.clone(),
        processing_attempts: row.processing_attempts,
        profile,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SendState;

    fn row(id: &str, body: &MessageBody) -> RawStoredMessage {
        RawStoredMessage {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "Alice".to_string(),
            kind: RowKind::Application,
            epoch: Some(2),
            sequence: Some(7),
            sent_at_ns: 1_000,
            decrypted_payload: Some(serde_json::to_vec(body).expect("encodes")),
            expire_at_ns: None,
            delivery_status: SendState::Delivered,
            processing_error: None,
            validation_failure_reason: None,
            processing_attempts: 1,
        }
    }

    fn text_body(content: &str) -> MessageBody {
        MessageBody::Text(TextContent {
            content: content.to_string(),
            embed: None,
        })
    }

    #[test]
    fn text_rows_materialize_with_resolved_profile() {
        let mut profiles = HashMap::new();
        profiles.insert(
            "alice".to_string(),
            ProfileEntry {
                canonical_sender_id: "alice".to_string(),
                display_name: Some("Alice".to_string()),
                avatar_url: None,
                handle: None,
            },
        );

        let message = materialize(&row("m1", &text_body("hello")), &profiles, 0)
            .expect("text row survives");

        assert_eq!(message.text, "hello");
        assert!(message.reactions.is_empty());
        assert_eq!(
            message.profile.as_ref().and_then(|p| p.display_name.as_deref()),
            Some("Alice")
        );
    }

    #[test]
    fn control_bodies_never_become_timeline_entries() {
        let profiles = HashMap::new();
        let controls = [
            MessageBody::Reaction(ReactionContent {
                reference_id: "m0".to_string(),
                emoji: "👍".to_string(),
                action: "add".to_string(),
            }),
            MessageBody::ReadReceipt(ReadReceiptContent {
                reference_id: "m0".to_string(),
            }),
            MessageBody::Typing,
            MessageBody::MemberChange(MemberChangeContent {
                added: vec!["bob".to_string()],
                removed: vec![],
            }),
            MessageBody::AdminAction(AdminActionContent {
                action: "promote".to_string(),
            }),
        ];

        for body in &controls {
            assert!(materialize(&row("m1", body), &profiles, 0).is_none());
        }
    }

    #[test]
    fn non_application_rows_are_filtered() {
        let mut r = row("m1", &text_body("hello"));
        r.kind = RowKind::Commit;
        assert!(materialize(&r, &HashMap::new(), 0).is_none());
    }

    #[test]
    fn absent_and_expired_payloads_are_filtered() {
        let mut missing = row("m1", &text_body("hello"));
        missing.decrypted_payload = None;
        assert!(materialize(&missing, &HashMap::new(), 0).is_none());

        let mut expired = row("m2", &text_body("hello"));
        expired.expire_at_ns = Some(5);
        assert!(materialize(&expired, &HashMap::new(), 10).is_none());
    }

    #[test]
    fn placeholder_error_rows_are_suppressed() {
        for sentinel in ["", "decryption failed", "Message Unavailable"] {
            let mut r = row("m1", &text_body(sentinel));
            r.processing_error = Some("ciphertext for stale epoch".to_string());
            assert!(
                materialize(&r, &HashMap::new(), 0).is_none(),
                "sentinel {sentinel:?} should be suppressed"
            );
        }
    }

    #[test]
    fn error_rows_with_real_text_stay_but_are_not_displayable() {
        let mut r = row("m1", &text_body("partially recovered content"));
        r.processing_error = Some("validation incomplete".to_string());

        let message = materialize(&r, &HashMap::new(), 0).expect("kept");
        assert!(!message.is_displayable());
    }

    #[test]
    fn placeholder_text_without_error_is_ordinary_content() {
        let message = materialize(&row("m1", &text_body("decryption failed")), &HashMap::new(), 0)
            .expect("kept");
        assert_eq!(message.text, "decryption failed");
        assert!(message.is_displayable());
    }

    #[test]
    fn unknown_kinds_decode_and_are_skipped() {
        let body = MessageBody::decode(br#"{"kind":"poll","question":"?"}"#).expect("decodes");
        assert_eq!(body, MessageBody::Unknown);

        let mut r = row("m1", &text_body("x"));
        r.decrypted_payload = Some(br#"{"kind":"poll"}"#.to_vec());
        assert!(materialize(&r, &HashMap::new(), 0).is_none());
    }
}
