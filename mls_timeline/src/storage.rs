//! Narrow read/write contract against the encrypted-at-rest row store.
//!
//! The engine never sees the database; it consumes decrypted rows and issues
//! the handful of writes below. Implementations are expected to classify
//! their failures through [`StoreError`] so the retry controller can tell
//! transient contention from permanent faults.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryableError;
use crate::types::{MemberRecord, Reaction, ReactionAction, SendState};

/// Protocol-level classification of a stored row. Only application rows can
/// carry timeline content; commits and proposals drive group state elsewhere.
#[repr(i32)]
#[derive(Debug, Copy, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum RowKind {
    Application = 1,
    Commit = 2,
    Proposal = 3,
}

/// A decrypted (or failed-to-decrypt) message row as handed over by storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawStoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub kind: RowKind,
    /// Protocol-assigned ordering pair; `None` until the row is sequenced.
    pub epoch: Option<u64>,
    pub sequence: Option<u64>,
    pub sent_at_ns: i64,
    /// Serialized payload envelope; absent while decryption is pending or
    /// after it failed.
    pub decrypted_payload: Option<Vec<u8>>,
    /// Disappearing-message deadline; an expired payload is treated as absent.
    pub expire_at_ns: Option<i64>,
    pub delivery_status: SendState,
    pub processing_error: Option<String>,
    pub validation_failure_reason: Option<String>,
    pub processing_attempts: i32,
}

/// A reaction row as durably stored. `sender_id` is the surface form; the
/// reconciliation engine canonicalizes on ingest.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RawReaction {
    pub message_id: String,
    pub emoji: String,
    pub sender_id: String,
    pub reacted_at_ns: i64,
}

/// Storage failures, split typed into transient contention (retryable) and
/// permanent faults.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Storage busy.
    ///
    /// Another writer holds the store. Retryable.
    #[error("storage busy")]
    Busy,
    /// Database locked.
    ///
    /// The underlying database is locked. Retryable.
    #[error("database is locked")]
    Locked,
    /// Out of memory.
    ///
    /// The store could not allocate. Retryable.
    #[error("storage out of memory")]
    OutOfMemory,
    /// Not found.
    ///
    /// Requested record does not exist. Not retryable.
    #[error("{0} not found")]
    NotFound(String),
    /// Corrupted row.
    ///
    /// A row failed to deserialize. Not retryable.
    #[error("corrupted row: {0}")]
    Corrupted(String),
    /// Query failed.
    ///
    /// Backend rejected the query. Not retryable.
    #[error("query failed: {0}")]
    Query(String),
}

impl RetryableError for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy | Self::Locked | Self::OutOfMemory)
    }
}

/// Read/write surface the timeline engine requires from durable storage.
#[async_trait]
pub trait TimelineStore: Send + Sync {
    /// Newest-first page of rows for a conversation; `before` restricts to
    /// rows strictly older than the given `(epoch, sequence)` pair.
    async fn fetch_rows(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<(u64, u64)>,
    ) -> Result<Vec<RawStoredMessage>, StoreError>;

    /// Durably stored reactions for the given parents, keyed by message id.
    async fn fetch_reactions(
        &self,
        message_ids: &[String],
    ) -> Result<HashMap<String, Vec<RawReaction>>, StoreError>;

    /// Parents of reactions stored before their message was materialized,
    /// with the count of orphans awaiting each.
    async fn fetch_orphaned_reaction_parents(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> Result<HashMap<String, u32>, StoreError>;

    /// Re-parent any orphans waiting on the given message id so future reads
    /// return them normally. Idempotent; returns the number adopted.
    async fn adopt_orphans(&self, message_id: &str) -> Result<u32, StoreError>;

    /// The conversation's known-members table.
    async fn fetch_members(&self, conversation_id: &str)
        -> Result<Vec<MemberRecord>, StoreError>;

    /// Durable write backing an optimistic local reaction mutation.
    async fn publish_reaction(
        &self,
        conversation_id: &str,
        reaction: &Reaction,
        action: ReactionAction,
    ) -> Result<(), StoreError>;
}
