//! Sender identity: canonicalization plus the three-tier profile resolution
//! chain (resolved cache, membership fallback, network batch resolve).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::configuration::PROFILE_RESOLVE_BATCH_SIZE;
use crate::types::{MemberRecord, ProfileEntry};

/// Normalize a sender identifier so every keyed lookup agrees on the key.
/// Pure and total: trims, drops a single leading `@`, lowercases.
pub fn canonicalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('@').unwrap_or(trimmed);
    trimmed.to_ascii_lowercase()
}

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// Identity service unavailable.
    ///
    /// The batch endpoint could not be reached. Affected ids stay unresolved.
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
    /// Malformed response.
    ///
    /// The batch endpoint returned something undecodable.
    #[error("malformed identity response: {0}")]
    Malformed(String),
}

/// Network identity resolution collaborator. One call resolves a bounded
/// batch; the resolver chunks larger sets.
#[async_trait]
pub trait IdentityApi: Send + Sync {
    async fn batch_resolve(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ProfileEntry>, ResolveError>;
}

/// Three-tier, per-conversation profile resolution. Tier-1 holds
/// network-resolved (or preloaded) entries and is never re-requested; tier-2
/// synthesizes a partial identity from the membership table so something is
/// always displayable; tier-3 batch-resolves the rest.
pub struct ProfileResolver<A> {
    api: Arc<A>,
    resolved: HashMap<String, ProfileEntry>,
    members: HashMap<String, MemberRecord>,
    first_pass_done: bool,
}

impl<A: IdentityApi> ProfileResolver<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self {
            api,
            resolved: HashMap::new(),
            members: HashMap::new(),
            first_pass_done: false,
        }
    }

    /// Seed tier-1 directly, e.g. with the local user's own profile.
    pub fn preload(&mut self, entries: impl IntoIterator<Item = ProfileEntry>) {
        for entry in entries {
            let id = canonicalize(&entry.canonical_sender_id);
            self.resolved.insert(id, entry);
        }
    }

    /// Replace the tier-2 membership table.
    pub fn set_members(&mut self, members: Vec<MemberRecord>) {
        self.members = members
            .into_iter()
            .map(|m| (canonicalize(&m.id), m))
            .collect();
    }

    /// Forget everything; only valid on conversation identity change.
    pub fn reset(&mut self) {
        self.resolved.clear();
        self.members.clear();
        self.first_pass_done = false;
    }

    fn member_fallback(&self, canonical_id: &str) -> Option<ProfileEntry> {
        let member = self.members.get(canonical_id)?;
        Some(ProfileEntry {
            canonical_sender_id: canonical_id.to_string(),
            display_name: member.display_name.clone(),
            avatar_url: None,
            handle: member.handle.clone(),
        })
    }

    /// Synchronous best-effort view over tiers 1 and 2, for materializing
    /// before (or without) a network round trip.
    pub fn snapshot(&self, ids: &HashSet<String>) -> HashMap<String, ProfileEntry> {
        let mut out = HashMap::new();
        for raw in ids {
            let id = canonicalize(raw);
            if let Some(entry) = self.resolved.get(&id) {
                out.insert(id, entry.clone());
            } else if let Some(entry) = self.member_fallback(&id) {
                out.insert(id, entry);
            }
        }
        out
    }

    /// Resolve a set of sender ids, first hit per tier winning. Returns the
    /// merged view and the ids newly resolved over the network so the caller
    /// can rebuild the affected messages. Network failures are swallowed
    /// per-chunk; the ids simply stay on their fallback identity.
    pub async fn resolve(
        &mut self,
        ids: &HashSet<String>,
    ) -> (HashMap<String, ProfileEntry>, HashSet<String>) {
        let mut out = HashMap::new();
        let mut unresolved = Vec::new();

        for raw in ids {
            let id = canonicalize(raw);
            if let Some(entry) = self.resolved.get(&id) {
                out.insert(id, entry.clone());
            } else {
                if let Some(fallback) = self.member_fallback(&id) {
                    out.insert(id.clone(), fallback);
                }
                unresolved.push(id);
            }
        }

        let mut newly = HashSet::new();
        if unresolved.is_empty() {
            self.first_pass_done = true;
            return (out, newly);
        }

        // Redundant network traffic guard: after the first pass, senders the
        // membership table can already name are not worth a round trip.
        let all_have_fallback = unresolved.iter().all(|id| self.members.contains_key(id));
        if self.first_pass_done && all_have_fallback {
            return (out, newly);
        }

        unresolved.sort();
        unresolved.dedup();
        for chunk in unresolved.chunks(PROFILE_RESOLVE_BATCH_SIZE) {
            match self.api.batch_resolve(chunk).await {
                Ok(entries) => {
                    for (id, entry) in entries {
                        let id = canonicalize(&id);
                        self.resolved.insert(id.clone(), entry.clone());
                        out.insert(id.clone(), entry);
                        newly.insert(id);
                    }
                }
                Err(e) => {
                    tracing::warn!("profile batch resolve failed, keeping fallbacks: {e}");
                }
            }
        }

        self.first_pass_done = true;
        (out, newly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingApi {
        profiles: HashMap<String, ProfileEntry>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingApi {
        fn with(profiles: impl IntoIterator<Item = ProfileEntry>) -> Self {
            Self {
                profiles: profiles
                    .into_iter()
                    .map(|p| (p.canonical_sender_id.clone(), p))
                    .collect(),
                calls: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl IdentityApi for RecordingApi {
        async fn batch_resolve(
            &self,
            ids: &[String],
        ) -> Result<HashMap<String, ProfileEntry>, ResolveError> {
            self.calls.lock().push(ids.to_vec());
            Ok(ids
                .iter()
                .filter_map(|id| self.profiles.get(id).map(|p| (id.clone(), p.clone())))
                .collect())
        }
    }

    fn entry(id: &str, name: &str, avatar: Option<&str>) -> ProfileEntry {
        ProfileEntry {
            canonical_sender_id: id.to_string(),
            display_name: Some(name.to_string()),
            avatar_url: avatar.map(str::to_string),
            handle: None,
        }
    }

    fn ids(raw: &[&str]) -> HashSet<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn canonicalize_is_deterministic_over_surface_forms() {
        assert_eq!(canonicalize("  @Alice.Example  "), "alice.example");
        assert_eq!(canonicalize("alice.example"), "alice.example");
        assert_eq!(canonicalize("ALICE.EXAMPLE"), canonicalize("@alice.example"));
    }

    #[tokio::test]
    async fn network_results_win_over_membership_fallback() {
        let api = Arc::new(RecordingApi::with([entry("alice", "Alice", Some("a.png"))]));
        let mut resolver = ProfileResolver::new(api);
        resolver.set_members(vec![MemberRecord {
            id: "alice".to_string(),
            handle: Some("al".to_string()),
            display_name: None,
        }]);

        let (map, newly) = resolver.resolve(&ids(&["@Alice"])).await;

        assert!(newly.contains("alice"));
        assert_eq!(map["alice"].avatar_url.as_deref(), Some("a.png"));
    }

    #[tokio::test]
    async fn tier_one_hits_are_never_rerequested() {
        let api = Arc::new(RecordingApi::with([entry("alice", "Alice", None)]));
        let mut resolver = ProfileResolver::new(api.clone());

        resolver.resolve(&ids(&["alice"])).await;
        resolver.resolve(&ids(&["alice"])).await;

        assert_eq!(api.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn network_skipped_when_fallbacks_cover_and_first_pass_is_done() {
        let api = Arc::new(RecordingApi::default());
        let mut resolver = ProfileResolver::new(api.clone());
        resolver.set_members(vec![MemberRecord {
            id: "bob".to_string(),
            handle: Some("bobby".to_string()),
            display_name: None,
        }]);

        // First pass goes to the network even with a fallback available.
        let (map, _) = resolver.resolve(&ids(&["bob"])).await;
        assert_eq!(map["bob"].handle.as_deref(), Some("bobby"));
        assert_eq!(api.calls.lock().len(), 1);

        // Incremental merges with covered ids skip the network tier.
        resolver.resolve(&ids(&["bob"])).await;
        assert_eq!(api.calls.lock().len(), 1);

        // A brand-new sender with no fallback still triggers a call.
        resolver.resolve(&ids(&["carol"])).await;
        assert_eq!(api.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn resolution_failure_keeps_fallback_identity() {
        struct FailingApi;

        #[async_trait]
        impl IdentityApi for FailingApi {
            async fn batch_resolve(
                &self,
                _ids: &[String],
            ) -> Result<HashMap<String, ProfileEntry>, ResolveError> {
                Err(ResolveError::Unavailable("offline".to_string()))
            }
        }

        let mut resolver = ProfileResolver::new(Arc::new(FailingApi));
        resolver.set_members(vec![MemberRecord {
            id: "dora".to_string(),
            handle: None,
            display_name: Some("Dora".to_string()),
        }]);

        let (map, newly) = resolver.resolve(&ids(&["dora"])).await;

        assert!(newly.is_empty());
        assert_eq!(map["dora"].display_name.as_deref(), Some("Dora"));
        assert!(map["dora"].avatar_url.is_none());
    }
}
