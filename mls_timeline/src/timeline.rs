//! Ordering & merge engine: the single owner of the canonical message list
//! and the pagination cursor.
//!
//! Three entry points share one invariant: the canonical order key is
//! `(epoch, sequence)` ascending. Protocol sequence numbers are
//! tamper-evident and monotonic per writer epoch; wall-clock timestamps are
//! client-supplied and only break ties for unsequenced rows.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::configuration::DEFAULT_PAGE_SIZE;
use crate::cursor::PageCursor;
use crate::error::TimelineError;
use crate::identity::{canonicalize, IdentityApi, ProfileResolver};
use crate::materialize::materialize;
use crate::reactions::{LoadMode, ReactionLedger};
use crate::retry::Retry;
use crate::storage::{RawStoredMessage, TimelineStore};
use crate::time::now_ns;
use crate::types::{Message, ProfileEntry, Reaction, ReactionAction};

pub struct Timeline<S, A> {
    store: Arc<S>,
    resolver: ProfileResolver<A>,
    ledger: ReactionLedger,
    retry: Retry,
    conversation_id: String,
    local_sender_id: String,
    page_size: usize,
    messages: Vec<Message>,
    index: HashMap<String, usize>,
    cursor: PageCursor,
    is_loading: bool,
    last_error: Option<TimelineError>,
    members_loaded: bool,
    generation: u64,
}

impl<S, A> Timeline<S, A>
where
    S: TimelineStore + 'static,
    A: IdentityApi,
{
    pub fn new(
        store: Arc<S>,
        api: Arc<A>,
        conversation_id: impl Into<String>,
        local_sender_id: &str,
    ) -> Self {
        Self {
            store,
            resolver: ProfileResolver::new(api),
            ledger: ReactionLedger::new(),
            retry: Retry::default(),
            conversation_id: conversation_id.into(),
            local_sender_id: canonicalize(local_sender_id),
            page_size: DEFAULT_PAGE_SIZE,
            messages: Vec::new(),
            index: HashMap::new(),
            cursor: PageCursor::default(),
            is_loading: false,
            last_error: None,
            members_loaded: false,
            generation: 0,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    /// Seed tier-1 of the profile chain, e.g. with the local user's profile.
    pub fn preload_profiles(&mut self, entries: impl IntoIterator<Item = ProfileEntry>) {
        self.resolver.preload(entries);
    }

    /// The canonical, display-ordered timeline.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn has_more_messages(&self) -> bool {
        self.cursor.has_more()
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    /// Most recent degradation; cleared when a new load pass begins.
    pub fn last_error(&self) -> Option<&TimelineError> {
        self.last_error.as_ref()
    }

    /// Reaction-cache inspection hook.
    pub fn reaction_ledger(&self) -> &ReactionLedger {
        &self.ledger
    }

    /// Point the engine at a different conversation. The only path that
    /// resets the cursor, the reaction cache, and the profile chain.
    pub fn reset(&mut self, conversation_id: impl Into<String>) {
        self.generation += 1;
        self.conversation_id = conversation_id.into();
        self.messages.clear();
        self.index.clear();
        self.cursor.reset();
        self.ledger.clear();
        self.resolver.reset();
        self.members_loaded = false;
        self.last_error = None;
        self.is_loading = false;
    }

    /// Fresh load: materialize the newest page and reconcile reactions in
    /// replace mode. Safe to re-enter; a load already in flight wins.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn load_initial(&mut self) -> Result<(), TimelineError> {
        if self.is_loading {
            return Ok(());
        }
        self.is_loading = true;
        self.last_error = None;
        let result = self.load_initial_inner().await;
        self.is_loading = false;
        self.finish(result)
    }

    async fn load_initial_inner(&mut self) -> Result<(), TimelineError> {
        let generation = self.generation;
        self.ensure_members().await;

        let rows = self
            .store
            .fetch_rows(&self.conversation_id, self.page_size, None)
            .await?;
        self.guard(generation)?;

        let batch_ids = self.merge_rows(&rows, true);
        self.reconcile_reactions(&batch_ids, LoadMode::Replace).await;
        self.resolve_profiles(&rows, generation).await
    }

    /// Older-page load, driven by the pagination cursor. A short page marks
    /// the conversation exhausted; results fetched against a cursor that
    /// moved while suspended are discarded.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn load_older(&mut self) -> Result<(), TimelineError> {
        if self.is_loading || !self.cursor.has_more() {
            return Ok(());
        }
        let Some(before) = self.cursor.before() else {
            // Nothing loaded yet; an older-page request means a fresh one.
            return self.load_initial().await;
        };
        self.is_loading = true;
        self.last_error = None;
        let result = self.load_older_inner(before).await;
        self.is_loading = false;
        self.finish(result)
    }

    async fn load_older_inner(&mut self, before: (u64, u64)) -> Result<(), TimelineError> {
        let generation = self.generation;
        let rows = self
            .store
            .fetch_rows(&self.conversation_id, self.page_size, Some(before))
            .await?;
        self.guard(generation)?;
        if self.cursor.before() != Some(before) {
            // A fresh load moved the cursor underneath us.
            return Err(TimelineError::Cancelled);
        }

        if rows.len() < self.page_size {
            self.cursor.mark_exhausted();
        }

        let batch_ids = self.merge_rows(&rows, false);
        self.reconcile_reactions(&batch_ids, LoadMode::Merge).await;
        self.resolve_profiles(&rows, generation).await
    }

    /// Re-run materialization over the full currently-loaded range. Rows
    /// that failed to decrypt on an earlier pass may materialize now.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn refresh_after_decrypt(&mut self) -> Result<(), TimelineError> {
        if self.is_loading {
            return Ok(());
        }
        self.is_loading = true;
        self.last_error = None;
        let result = self.refresh_inner().await;
        self.is_loading = false;
        self.finish(result)
    }

    async fn refresh_inner(&mut self) -> Result<(), TimelineError> {
        let generation = self.generation;
        self.ensure_members().await;

        let limit = self.messages.len().max(self.page_size);
        let rows = self
            .store
            .fetch_rows(&self.conversation_id, limit, None)
            .await?;
        self.guard(generation)?;

        let batch_ids = self.merge_rows(&rows, true);
        self.reconcile_reactions(&batch_ids, LoadMode::Merge).await;
        self.resolve_profiles(&rows, generation).await
    }

    /// Debounced reaction reload over everything loaded; catches reactions
    /// landing shortly after their messages.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn reload_reactions(&mut self) {
        let ids: Vec<String> = self.messages.iter().map(|m| m.id.clone()).collect();
        self.reconcile_reactions(&ids, LoadMode::Merge).await;
    }

    /// Apply a reaction event from the realtime transport. Unknown actions
    /// are logged and dropped; mutations for parents not yet materialized
    /// (or not displayable) stay cache-only until a later pass.
    pub fn apply_reaction_event(
        &mut self,
        message_id: &str,
        emoji: &str,
        sender_id: &str,
        action: &str,
    ) {
        let Some(action) = ReactionAction::parse(action) else {
            tracing::warn!(action, "ignoring unknown reaction action");
            return;
        };
        let sender_id = canonicalize(sender_id);
        let changed = self
            .ledger
            .apply(action, message_id, emoji, &sender_id, now_ns());
        if changed {
            self.rebuild_message(message_id);
        }
    }

    /// Optimistic local reaction plus a fire-and-forget durable write.
    pub fn add_reaction(&mut self, message_id: &str, emoji: &str) {
        self.local_mutation(ReactionAction::Add, message_id, emoji);
    }

    /// Remove the local user's reaction if present, add it otherwise.
    pub fn toggle_reaction(&mut self, message_id: &str, emoji: &str) {
        let action = if self
            .ledger
            .contains(message_id, &self.local_sender_id, emoji)
        {
            ReactionAction::Remove
        } else {
            ReactionAction::Add
        };
        self.local_mutation(action, message_id, emoji);
    }

    fn local_mutation(&mut self, action: ReactionAction, message_id: &str, emoji: &str) {
        let reaction = Reaction {
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
            sender_id: self.local_sender_id.clone(),
            reacted_at_ns: now_ns(),
        };
        let changed = self.ledger.apply(
            action,
            message_id,
            emoji,
            &self.local_sender_id,
            reaction.reacted_at_ns,
        );
        if changed {
            self.rebuild_message(message_id);
        }

        let store = self.store.clone();
        let conversation_id = self.conversation_id.clone();
        tokio::spawn(async move {
            if let Err(e) = store
                .publish_reaction(&conversation_id, &reaction, action)
                .await
            {
                tracing::warn!(
                    message_id = %reaction.message_id,
                    "failed to publish reaction {action}: {e}"
                );
            }
        });
    }

    /// Merge a fetched batch into the canonical list. Returns the ids that
    /// materialized from this batch. The most recently materialized version
    /// of an id always wins; nothing already visible is removed.
    fn merge_rows(&mut self, rows: &[RawStoredMessage], fresh: bool) -> Vec<String> {
        let now = now_ns();
        let sender_ids: HashSet<String> =
            rows.iter().map(|r| canonicalize(&r.sender_id)).collect();
        let profiles = self.resolver.snapshot(&sender_ids);

        let incoming: Vec<Message> = rows
            .iter()
            .filter_map(|row| materialize(row, &profiles, now))
            .collect();
        let batch_ids: Vec<String> = incoming.iter().map(|m| m.id.clone()).collect();

        // The cursor tracks the raw page, filtered rows included, so the
        // next older-page fetch resumes below control traffic as well.
        for row in rows {
            if let (Some(epoch), Some(sequence)) = (row.epoch, row.sequence) {
                self.cursor.observe(epoch, sequence);
            }
        }

        let incoming_ids: HashSet<&str> = incoming.iter().map(|m| m.id.as_str()).collect();
        let wholesale = fresh
            && self
                .messages
                .iter()
                .all(|m| incoming_ids.contains(m.id.as_str()));
        if wholesale {
            self.messages = incoming;
        } else {
            for message in incoming {
                match self.index.get(&message.id) {
                    Some(&pos) => self.messages[pos] = message,
                    None => self.messages.push(message),
                }
            }
        }
        self.sort_canonical();

        tracing::debug!(
            batch = batch_ids.len(),
            total = self.messages.len(),
            wholesale,
            "merged message batch"
        );
        batch_ids
    }

    fn sort_canonical(&mut self) {
        self.messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        self.index = self
            .messages
            .iter()
            .enumerate()
            .map(|(pos, m)| (m.id.clone(), pos))
            .collect();
    }

    /// Load and attach reactions for a batch. Fetch failure after retries is
    /// a degradation, never a blocker: messages stay displayed without
    /// reactions and `last_error` records what happened.
    async fn reconcile_reactions(&mut self, batch_ids: &[String], mode: LoadMode) {
        if let Err(e) = self
            .ledger
            .load(
                self.store.as_ref(),
                &self.conversation_id,
                batch_ids,
                mode,
                self.retry,
            )
            .await
        {
            tracing::warn!("reaction reconciliation degraded: {e}");
            self.last_error = Some(e.into());
        }
        for message in &mut self.messages {
            self.ledger.rebuild(message);
        }
    }

    fn rebuild_message(&mut self, message_id: &str) {
        if let Some(&pos) = self.index.get(message_id) {
            self.ledger.rebuild(&mut self.messages[pos]);
        }
    }

    /// Resolve sender identities for a batch and upgrade affected messages.
    /// Per-id failures stay on their fallback identity.
    async fn resolve_profiles(
        &mut self,
        rows: &[RawStoredMessage],
        generation: u64,
    ) -> Result<(), TimelineError> {
        let sender_ids: HashSet<String> =
            rows.iter().map(|r| canonicalize(&r.sender_id)).collect();
        if sender_ids.is_empty() {
            return Ok(());
        }

        let (profiles, newly) = self.resolver.resolve(&sender_ids).await;
        // The conversation may have been switched while we were on the
        // network; the cache population is harmless, the rebuild is not.
        self.guard(generation)?;

        if !profiles.is_empty() {
            for message in &mut self.messages {
                if let Some(entry) = profiles.get(&canonicalize(&message.sender_id)) {
                    message.profile = Some(entry.clone());
                }
            }
        }
        if !newly.is_empty() {
            tracing::debug!(count = newly.len(), "upgraded sender identities");
        }
        Ok(())
    }

    async fn ensure_members(&mut self) {
        if self.members_loaded {
            return;
        }
        match self.store.fetch_members(&self.conversation_id).await {
            Ok(members) => {
                self.resolver.set_members(members);
                self.members_loaded = true;
            }
            Err(e) => {
                // Next load retries; until then tier-3 covers identity.
                tracing::warn!("membership fetch failed: {e}");
            }
        }
    }

    fn guard(&self, generation: u64) -> Result<(), TimelineError> {
        if self.generation == generation {
            Ok(())
        } else {
            Err(TimelineError::Cancelled)
        }
    }

    fn finish(&mut self, result: Result<(), TimelineError>) -> Result<(), TimelineError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancellation() => {
                tracing::debug!("timeline load superseded, result discarded");
                Ok(())
            }
            Err(e) => {
                tracing::error!("timeline load failed: {e}");
                self.last_error = Some(e.clone());
                Err(e)
            }
        }
    }
}
