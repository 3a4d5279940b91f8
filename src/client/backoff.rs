use std::{sync::Arc, time::Duration};

/// Computes the delay before a connection attempt from its attempt number.
pub(crate) type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

const BACKOFF_STEP_SECS: f64 = 1.5;
const MAX_BACKOFF_STEPS: u32 = 5;

/// The default delay before connection attempt number `attempt`.
///
/// Attempts are numbered from 1, and the counter goes back to 1 whenever a
/// connection succeeds, so the first attempt after a good connection is
/// immediate.  After that each attempt waits 1.5s longer than the last, up to
/// 7.5s, plus up to a second of jitter.
pub fn default_backoff(attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }

    let steps = (attempt - 1).min(MAX_BACKOFF_STEPS);

    Duration::from_secs_f64(f64::from(steps) * BACKOFF_STEP_SECS + rand::random::<f64>())
}
