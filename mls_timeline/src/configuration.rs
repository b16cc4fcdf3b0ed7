use std::time::Duration;

/// Rows requested per timeline page (fresh load and older-page load).
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Total attempts for a reaction-cache read before degrading to partial data.
pub const MAX_REACTION_FETCH_ATTEMPTS: usize = 3;

/// Unit for the linear backoff between reaction-read attempts.
pub const REACTION_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Delay before the single debounced reaction reload that follows a fresh
/// materialization. Covers the window between message and reaction delivery.
pub const REACTION_RELOAD_DELAY: Duration = Duration::from_secs(2);

/// Upper bound on ids per identity batch-resolve call; larger sets are chunked.
pub const PROFILE_RESOLVE_BATCH_SIZE: usize = 25;

/// Maximum orphaned-reaction parents scanned per reconciliation pass.
pub const ORPHAN_SCAN_LIMIT: u32 = 100;

/// Interval for the background refresh tick driven by the service loop.
pub const PERIODIC_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
