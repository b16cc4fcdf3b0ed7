//! In-memory collaborator fakes for exercising the engine without a real
//! row store or identity service. Fault injection covers the transient
//! storage errors the retry controller must absorb.

#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::identity::{IdentityApi, ResolveError};
use crate::materialize::{MessageBody, TextContent};
use crate::storage::{
    RawReaction, RawStoredMessage, RowKind, StoreError, TimelineStore,
};
use crate::types::{MemberRecord, ProfileEntry, Reaction, ReactionAction, SendState};

#[derive(Default)]
struct StoreInner {
    rows: Vec<RawStoredMessage>,
    reactions: HashMap<String, Vec<RawReaction>>,
    orphans: HashMap<String, Vec<RawReaction>>,
    members: Vec<MemberRecord>,
    published: Vec<(String, Reaction, ReactionAction)>,
    reaction_fetch_faults: VecDeque<StoreError>,
    fetch_rows_calls: usize,
    fetch_reactions_calls: usize,
    adoption_calls: Vec<String>,
}

/// In-memory [`TimelineStore`] with observability hooks for tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a row by id.
    pub fn upsert_row(&self, row: RawStoredMessage) {
        let mut inner = self.inner.lock();
        match inner.rows.iter_mut().find(|r| r.id == row.id) {
            Some(existing) => *existing = row,
            None => inner.rows.push(row),
        }
    }

    /// Insert a durably parented reaction row.
    pub fn insert_reaction(&self, row: RawReaction) {
        let mut inner = self.inner.lock();
        inner.reactions.entry(row.message_id.clone()).or_default().push(row);
    }

    /// Insert a reaction stored before its parent, awaiting adoption.
    pub fn insert_orphan(&self, row: RawReaction) {
        let mut inner = self.inner.lock();
        inner.orphans.entry(row.message_id.clone()).or_default().push(row);
    }

    pub fn set_members(&self, members: Vec<MemberRecord>) {
        self.inner.lock().members = members;
    }

    /// Queue a fault returned by the next reaction fetch.
    pub fn inject_reaction_fetch_fault(&self, error: StoreError) {
        self.inner.lock().reaction_fetch_faults.push_back(error);
    }

    pub fn fetch_rows_calls(&self) -> usize {
        self.inner.lock().fetch_rows_calls
    }

    pub fn fetch_reactions_calls(&self) -> usize {
        self.inner.lock().fetch_reactions_calls
    }

    pub fn adoption_calls(&self) -> Vec<String> {
        self.inner.lock().adoption_calls.clone()
    }

    pub fn published_reactions(&self) -> Vec<(String, Reaction, ReactionAction)> {
        self.inner.lock().published.clone()
    }

    fn row_key(row: &RawStoredMessage) -> (u64, u64, i64, String) {
        (
            row.epoch.unwrap_or(u64::MAX),
            row.sequence.unwrap_or(u64::MAX),
            row.sent_at_ns,
            row.id.clone(),
        )
    }
}

#[async_trait]
impl TimelineStore for MemoryStore {
    async fn fetch_rows(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<(u64, u64)>,
    ) -> Result<Vec<RawStoredMessage>, StoreError> {
        let mut inner = self.inner.lock();
        inner.fetch_rows_calls += 1;
        let mut rows: Vec<RawStoredMessage> = inner
            .rows
            .iter()
            .filter(|r| r.conversation_id == conversation_id)
            .filter(|r| match before {
                None => true,
                Some(bound) => match (r.epoch, r.sequence) {
                    (Some(e), Some(s)) => (e, s) < bound,
                    _ => false,
                },
            })
            .cloned()
            .collect();
        // Newest first, like a reverse-chronological page query.
        rows.sort_by(|a, b| Self::row_key(b).cmp(&Self::row_key(a)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn fetch_reactions(
        &self,
        message_ids: &[String],
    ) -> Result<HashMap<String, Vec<RawReaction>>, StoreError> {
        let mut inner = self.inner.lock();
        inner.fetch_reactions_calls += 1;
        if let Some(fault) = inner.reaction_fetch_faults.pop_front() {
            return Err(fault);
        }
        Ok(message_ids
            .iter()
            .filter_map(|id| inner.reactions.get(id).map(|rows| (id.clone(), rows.clone())))
            .collect())
    }

    async fn fetch_orphaned_reaction_parents(
        &self,
        _conversation_id: &str,
        limit: u32,
    ) -> Result<HashMap<String, u32>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .orphans
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .take(limit as usize)
            .map(|(id, rows)| (id.clone(), rows.len() as u32))
            .collect())
    }

    async fn adopt_orphans(&self, message_id: &str) -> Result<u32, StoreError> {
        let mut inner = self.inner.lock();
        inner.adoption_calls.push(message_id.to_string());
        let adopted = inner.orphans.remove(message_id).unwrap_or_default();
        let count = adopted.len() as u32;
        inner
            .reactions
            .entry(message_id.to_string())
            .or_default()
            .extend(adopted);
        Ok(count)
    }

    async fn fetch_members(
        &self,
        _conversation_id: &str,
    ) -> Result<Vec<MemberRecord>, StoreError> {
        Ok(self.inner.lock().members.clone())
    }

    async fn publish_reaction(
        &self,
        conversation_id: &str,
        reaction: &Reaction,
        action: ReactionAction,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .published
            .push((conversation_id.to_string(), reaction.clone(), action));
        Ok(())
    }
}

/// Scripted [`IdentityApi`] recording every batch it is asked to resolve.
#[derive(Default)]
pub struct StaticIdentityApi {
    profiles: Mutex<HashMap<String, ProfileEntry>>,
    calls: Mutex<Vec<Vec<String>>>,
    fail: Mutex<bool>,
}

impl StaticIdentityApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_profile(&self, entry: ProfileEntry) {
        self.profiles
            .lock()
            .insert(entry.canonical_sender_id.clone(), entry);
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl IdentityApi for StaticIdentityApi {
    async fn batch_resolve(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ProfileEntry>, ResolveError> {
        self.calls.lock().push(ids.to_vec());
        if *self.fail.lock() {
            return Err(ResolveError::Unavailable("scripted outage".to_string()));
        }
        let profiles = self.profiles.lock();
        Ok(ids
            .iter()
            .filter_map(|id| profiles.get(id).map(|p| (id.clone(), p.clone())))
            .collect())
    }
}

pub fn profile(id: &str, name: &str, avatar: Option<&str>) -> ProfileEntry {
    ProfileEntry {
        canonical_sender_id: id.to_string(),
        display_name: Some(name.to_string()),
        avatar_url: avatar.map(str::to_string),
        handle: None,
    }
}

pub fn member(id: &str, handle: Option<&str>) -> MemberRecord {
    MemberRecord {
        id: id.to_string(),
        handle: handle.map(str::to_string),
        display_name: None,
    }
}

pub fn text_row(
    conversation_id: &str,
    id: &str,
    sender_id: &str,
    epoch: u64,
    sequence: u64,
    sent_at_ns: i64,
    text: &str,
) -> RawStoredMessage {
    RawStoredMessage {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        kind: RowKind::Application,
        epoch: Some(epoch),
        sequence: Some(sequence),
        sent_at_ns,
        decrypted_payload: Some(
            serde_json::to_vec(&MessageBody::Text(TextContent {
                content: text.to_string(),
                embed: None,
            }))
            .unwrap(),
        ),
        expire_at_ns: None,
        delivery_status: SendState::Delivered,
        processing_error: None,
        validation_failure_reason: None,
        processing_attempts: 1,
    }
}

/// A row whose ciphertext never decrypted: no payload, pipeline error set.
pub fn undecrypted_row(
    conversation_id: &str,
    id: &str,
    sender_id: &str,
    epoch: u64,
    sequence: u64,
) -> RawStoredMessage {
    let mut row = text_row(conversation_id, id, sender_id, epoch, sequence, 0, "");
    row.decrypted_payload = None;
    row.processing_error = Some("decryption failed".to_string());
    row.processing_attempts = 3;
    row
}

pub fn reaction_row(message_id: &str, emoji: &str, sender_id: &str, at: i64) -> RawReaction {
    RawReaction {
        message_id: message_id.to_string(),
        emoji: emoji.to_string(),
        sender_id: sender_id.to_string(),
        reacted_at_ns: at,
    }
}
