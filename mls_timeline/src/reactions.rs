//! Reaction reconciliation: the per-message reaction cache, orphan adoption,
//! replace-vs-merge loading, and the display-safety rebuild.
//!
//! The ledger owns the cache exclusively. Messages are only touched through
//! [`ReactionLedger::rebuild`], which regenerates the `reactions` field, so
//! no other component ever races the timeline on a message.

use std::collections::{HashMap, HashSet};

use crate::configuration::ORPHAN_SCAN_LIMIT;
use crate::identity::canonicalize;
use crate::retry::Retry;
use crate::retry_async;
use crate::storage::{RawReaction, StoreError, TimelineStore};
use crate::types::{Message, Reaction, ReactionAction};

/// How a fetched reaction set lands in the cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoadMode {
    /// Fresh load: the fetched set replaces whatever was cached for every id
    /// in the batch. The cache may be stale from a previous conversation
    /// state.
    Replace,
    /// Pagination and delayed reload: fetched rows union into the cache,
    /// never destructively. Protects optimistic, not-yet-persisted entries
    /// from a concurrent background fetch.
    Merge,
}

type ReactionKey = (String, String);

#[derive(Default)]
pub struct ReactionLedger {
    cache: HashMap<String, HashMap<ReactionKey, Reaction>>,
}

impl ReactionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt pending orphans for the batch, then read and cache the durable
    /// reaction sets for `message_ids`. Only the reaction read itself is
    /// retried; orphan bookkeeping failures degrade to a warning and the
    /// next pass picks them up.
    pub async fn load<S: TimelineStore + ?Sized>(
        &mut self,
        store: &S,
        conversation_id: &str,
        message_ids: &[String],
        mode: LoadMode,
        retry: Retry,
    ) -> Result<(), StoreError> {
        if message_ids.is_empty() {
            return Ok(());
        }

        self.adopt_orphans_for(store, conversation_id, message_ids).await;

        let fetched = retry_async!(
            retry,
            (async { store.fetch_reactions(message_ids).await })
        )?;

        self.apply_fetched(mode, message_ids, fetched);
        Ok(())
    }

    /// Reactions can be durably stored before their parent message exists
    /// locally. Re-parent every orphan whose parent is in this batch so the
    /// read that follows returns it normally. Adoption is idempotent on the
    /// storage side; a second pass over an adopted id is a no-op.
    async fn adopt_orphans_for<S: TimelineStore + ?Sized>(
        &self,
        store: &S,
        conversation_id: &str,
        message_ids: &[String],
    ) {
        let orphans = match store
            .fetch_orphaned_reaction_parents(conversation_id, ORPHAN_SCAN_LIMIT)
            .await
        {
            Ok(orphans) => orphans,
            Err(e) => {
                tracing::warn!("orphaned-reaction scan failed: {e}");
                return;
            }
        };
        if orphans.is_empty() {
            return;
        }

        let batch: HashSet<&str> = message_ids.iter().map(String::as_str).collect();
        for (parent_id, pending) in orphans {
            if !batch.contains(parent_id.as_str()) {
                continue;
            }
            match store.adopt_orphans(&parent_id).await {
                Ok(adopted) => {
                    tracing::debug!(
                        message_id = %parent_id,
                        pending,
                        adopted,
                        "adopted orphaned reactions"
                    );
                }
                Err(e) => {
                    tracing::warn!(message_id = %parent_id, "orphan adoption failed: {e}");
                }
            }
        }
    }

    /// Land a fetched reaction map in the cache under the given mode.
    /// Duplicate `(sender, emoji)` rows within a fetch collapse to one entry.
    pub fn apply_fetched(
        &mut self,
        mode: LoadMode,
        message_ids: &[String],
        fetched: HashMap<String, Vec<RawReaction>>,
    ) {
        match mode {
            LoadMode::Replace => {
                for id in message_ids {
                    let rows = fetched.get(id).map(Vec::as_slice).unwrap_or_default();
                    self.cache.insert(id.clone(), Self::keyed(rows));
                }
            }
            LoadMode::Merge => {
                for (id, rows) in fetched {
                    let entry = self.cache.entry(id).or_default();
                    for reaction in rows.iter().map(Self::ingest_row) {
                        entry.insert(reaction.key(), reaction);
                    }
                }
            }
        }
    }

    fn keyed(rows: &[RawReaction]) -> HashMap<ReactionKey, Reaction> {
        rows.iter()
            .map(|row| {
                let reaction = Self::ingest_row(row);
                (reaction.key(), reaction)
            })
            .collect()
    }

    fn ingest_row(row: &RawReaction) -> Reaction {
        Reaction {
            message_id: row.message_id.clone(),
            emoji: row.emoji.clone(),
            sender_id: canonicalize(&row.sender_id),
            reacted_at_ns: row.reacted_at_ns,
        }
    }

    /// Apply one reaction mutation. `sender_id` must already be canonical.
    /// Returns whether the cached set changed.
    pub fn apply(
        &mut self,
        action: ReactionAction,
        message_id: &str,
        emoji: &str,
        sender_id: &str,
        reacted_at_ns: i64,
    ) -> bool {
        let key = (sender_id.to_string(), emoji.to_string());
        match action {
            ReactionAction::Add => {
                let entry = self.cache.entry(message_id.to_string()).or_default();
                if entry.contains_key(&key) {
                    return false;
                }
                entry.insert(
                    key,
                    Reaction {
                        message_id: message_id.to_string(),
                        emoji: emoji.to_string(),
                        sender_id: sender_id.to_string(),
                        reacted_at_ns,
                    },
                );
                true
            }
            ReactionAction::Remove => self
                .cache
                .get_mut(message_id)
                .map(|entry| entry.remove(&key).is_some())
                .unwrap_or(false),
        }
    }

    pub fn contains(&self, message_id: &str, sender_id: &str, emoji: &str) -> bool {
        self.cache
            .get(message_id)
            .is_some_and(|entry| entry.contains_key(&(sender_id.to_string(), emoji.to_string())))
    }

    /// Inspection hook: the cached set for a message regardless of whether
    /// its parent may display them. Sorted for stable output.
    pub fn cached_reactions(&self, message_id: &str) -> Vec<Reaction> {
        let mut reactions: Vec<Reaction> = self
            .cache
            .get(message_id)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default();
        reactions.sort_by(|a, b| {
            (a.reacted_at_ns, &a.sender_id, &a.emoji).cmp(&(b.reacted_at_ns, &b.sender_id, &b.emoji))
        });
        reactions
    }

    /// Regenerate a message's `reactions` field. A parent that failed
    /// processing or validation gets an empty list; its cached entries are
    /// retained for when it becomes displayable.
    pub fn rebuild(&self, message: &mut Message) {
        message.reactions = if message.is_displayable() {
            self.cached_reactions(&message.id)
        } else {
            vec![]
        };
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(message_id: &str, emoji: &str, sender_id: &str, at: i64) -> RawReaction {
        RawReaction {
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
            sender_id: sender_id.to_string(),
            reacted_at_ns: at,
        }
    }

    fn fetched(rows: &[RawReaction]) -> HashMap<String, Vec<RawReaction>> {
        let mut map: HashMap<String, Vec<RawReaction>> = HashMap::new();
        for row in rows {
            map.entry(row.message_id.clone()).or_default().push(row.clone());
        }
        map
    }

    #[test]
    fn duplicate_rows_across_fetches_collapse_to_one_entry() {
        let mut ledger = ReactionLedger::new();
        let ids = vec!["m1".to_string()];

        ledger.apply_fetched(
            LoadMode::Replace,
            &ids,
            fetched(&[raw("m1", "👍", "Alice", 10)]),
        );
        ledger.apply_fetched(
            LoadMode::Merge,
            &ids,
            fetched(&[raw("m1", "👍", "@alice", 20)]),
        );

        let cached = ledger.cached_reactions("m1");
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].sender_id, "alice");
    }

    #[test]
    fn replace_mode_clears_ids_missing_from_the_fetch() {
        let mut ledger = ReactionLedger::new();
        let ids = vec!["m1".to_string(), "m2".to_string()];

        ledger.apply_fetched(
            LoadMode::Replace,
            &ids,
            fetched(&[raw("m1", "🔥", "bob", 5), raw("m2", "👀", "bob", 6)]),
        );
        // Second fetch no longer returns anything for m2.
        ledger.apply_fetched(LoadMode::Replace, &ids, fetched(&[raw("m1", "🔥", "bob", 5)]));

        assert_eq!(ledger.cached_reactions("m1").len(), 1);
        assert!(ledger.cached_reactions("m2").is_empty());
    }

    #[test]
    fn merge_mode_preserves_optimistic_entries() {
        let mut ledger = ReactionLedger::new();
        let ids = vec!["m1".to_string()];

        // Optimistic local add, not yet durable.
        assert!(ledger.apply(ReactionAction::Add, "m1", "🎉", "me", 50));

        // Background fetch lands without it.
        ledger.apply_fetched(
            LoadMode::Merge,
            &ids,
            fetched(&[raw("m1", "👍", "alice", 10)]),
        );

        let cached = ledger.cached_reactions("m1");
        assert_eq!(cached.len(), 2);
        assert!(ledger.contains("m1", "me", "🎉"));
    }

    #[test]
    fn remove_of_absent_entry_is_a_noop() {
        let mut ledger = ReactionLedger::new();
        assert!(!ledger.apply(ReactionAction::Remove, "m1", "👍", "alice", 0));

        assert!(ledger.apply(ReactionAction::Add, "m1", "👍", "alice", 1));
        assert!(ledger.apply(ReactionAction::Remove, "m1", "👍", "alice", 2));
        assert!(ledger.cached_reactions("m1").is_empty());
    }

    #[test]
    fn rebuild_suppresses_reactions_on_unsafe_parents() {
        let mut ledger = ReactionLedger::new();
        ledger.apply(ReactionAction::Add, "m1", "👍", "alice", 1);

        let mut message = crate::types::Message {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "bob".to_string(),
            text: "hi".to_string(),
            embed: None,
            epoch: Some(1),
            sequence: Some(1),
            sent_at_ns: 0,
            reactions: vec![],
            send_state: crate::types::SendState::Delivered,
            processing_error: Some("decrypt failed".to_string()),
            validation_failure_reason: None,
            processing_attempts: 2,
            profile: None,
        };

        ledger.rebuild(&mut message);
        assert!(message.reactions.is_empty());
        // Cache retains the entry for when the parent becomes displayable.
        assert_eq!(ledger.cached_reactions("m1").len(), 1);

        message.processing_error = None;
        ledger.rebuild(&mut message);
        assert_eq!(message.reactions.len(), 1);
    }
}
