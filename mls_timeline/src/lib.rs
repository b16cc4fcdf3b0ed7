#![warn(clippy::unwrap_used)]

pub mod configuration;
pub mod cursor;
pub mod error;
pub mod identity;
pub mod materialize;
pub mod reactions;
pub mod retry;
pub mod service;
pub mod storage;
pub mod time;
pub mod timeline;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::TimelineError;
pub use service::{TimelineHandle, TimelineSnapshot};
pub use storage::{StoreError, TimelineStore};
pub use timeline::Timeline;
pub use types::{Message, ProfileEntry, Reaction, ReactionAction, SendState};

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Once;

    static INIT: Once = Once::new();

    /// Install a subscriber for test output, once per process.
    pub(crate) fn logger() {
        INIT.call_once(|| {
            let filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy();
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_test_writer()
                .try_init();
        });
    }

    // Execute once before any tests are run
    #[ctor::ctor]
    fn _setup() {
        logger();
    }
}
