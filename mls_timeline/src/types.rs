//! Display-facing data model for a materialized conversation timeline.

use serde::{Deserialize, Serialize};

/// Delivery progress of a message as shown to the user.
#[repr(i32)]
#[derive(Debug, Copy, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum SendState {
    Sending = 1,
    Sent = 2,
    Delivered = 3,
    Read = 4,
    Failed = 5,
}

/// A reaction attached to a timeline message. At most one per
/// `(message_id, sender_id, emoji)`; `sender_id` is always canonical.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Reaction {
    pub message_id: String,
    pub emoji: String,
    pub sender_id: String,
    pub reacted_at_ns: i64,
}

impl Reaction {
    /// Uniqueness key within a single message's reaction set.
    pub fn key(&self) -> (String, String) {
        (self.sender_id.clone(), self.emoji.clone())
    }
}

/// Wire form of a reaction mutation. Unknown values never construct a
/// variant; callers log and drop them.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum ReactionAction {
    Add,
    Remove,
}

impl ReactionAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "add" | "added" => Some(Self::Add),
            "remove" | "removed" => Some(Self::Remove),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReactionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// Best-effort display identity for a sender. Created by the membership
/// fallback or a network resolution, upgraded whenever a higher-fidelity
/// tier resolves the same identity, never deleted within a session.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProfileEntry {
    pub canonical_sender_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub handle: Option<String>,
}

/// A row from the conversation's known-members table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemberRecord {
    pub id: String,
    pub handle: Option<String>,
    pub display_name: Option<String>,
}

/// Canonical sort key for the timeline: protocol `(epoch, sequence)`
/// ascending. Wall-clock only breaks ties where either member is unbounded,
/// the id keeps the order total so repeated sorts are stable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderKey {
    epoch: u64,
    sequence: u64,
    sent_at_ns: i64,
    id: String,
}

/// Sentinel for a row the protocol has not sequenced yet; sorts after every
/// bounded value.
const UNBOUNDED: u64 = u64::MAX;

/// A display-ready timeline entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// Sender identifier exactly as stored; canonicalize before keyed use.
    pub sender_id: String,
    pub text: String,
    pub embed: Option<serde_json::Value>,
    pub epoch: Option<u64>,
    pub sequence: Option<u64>,
    /// Client-supplied wall clock, advisory only.
    pub sent_at_ns: i64,
    pub reactions: Vec<Reaction>,
    pub send_state: SendState,
    pub processing_error: Option<String>,
    pub validation_failure_reason: Option<String>,
    pub processing_attempts: i32,
    /// Resolved display identity, upgraded in place as richer tiers land.
    pub profile: Option<ProfileEntry>,
}

impl Message {
    /// A message that failed processing or validation must never render
    /// attached reactions, whatever the reconciliation cache holds.
    pub fn is_displayable(&self) -> bool {
        self.processing_error.is_none() && self.validation_failure_reason.is_none()
    }

    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            epoch: self.epoch.unwrap_or(UNBOUNDED),
            sequence: self.sequence.unwrap_or(UNBOUNDED),
            sent_at_ns: self.sent_at_ns,
            id: self.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, epoch: Option<u64>, sequence: Option<u64>, sent_at_ns: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "s1".to_string(),
            text: "hi".to_string(),
            embed: None,
            epoch,
            sequence,
            sent_at_ns,
            reactions: vec![],
            send_state: SendState::Sent,
            processing_error: None,
            validation_failure_reason: None,
            processing_attempts: 0,
            profile: None,
        }
    }

    #[test]
    fn sequence_orders_within_epoch_regardless_of_wall_clock() {
        let earlier = message("a", Some(3), Some(10), 9_000);
        let later = message("b", Some(3), Some(11), 1_000);

        assert!(earlier.order_key() < later.order_key());
    }

    #[test]
    fn unbounded_sorts_after_every_bounded_key() {
        let sequenced = message("a", Some(7), Some(999), 9_000);
        let optimistic = message("b", None, None, 1);

        assert!(sequenced.order_key() < optimistic.order_key());
    }

    #[test]
    fn wall_clock_breaks_ties_between_unbounded_rows() {
        let first = message("a", None, None, 100);
        let second = message("b", None, None, 200);

        assert!(first.order_key() < second.order_key());
    }

    #[test]
    fn unknown_action_values_do_not_parse() {
        assert_eq!(ReactionAction::parse("add"), Some(ReactionAction::Add));
        assert_eq!(ReactionAction::parse("Removed"), Some(ReactionAction::Remove));
        assert_eq!(ReactionAction::parse("boost"), None);
    }

    #[test]
    fn error_rows_are_not_displayable() {
        let mut m = message("a", Some(1), Some(1), 0);
        assert!(m.is_displayable());

        m.processing_error = Some("decrypt failed at epoch 4".to_string());
        assert!(!m.is_displayable());
    }
}
