//! Time primitives shared across the crate.

pub use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn duration_since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

pub fn now_ns() -> i64 {
    duration_since_epoch().as_nanos() as i64
}

#[doc(hidden)]
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await
}
