//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Longest pause between failed receives.
pub const RECEIVE_MAX_DELAY: Duration = Duration::from_secs(5);

/// Backoff for failed channel receives in poll loops.
///
/// - Min delay: 50ms
/// - Max delay: 5s
/// - Max attempts: 20, after which callers stay at the max delay
/// - Jitter enabled
pub fn receive_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(RECEIVE_MAX_DELAY)
        .with_max_times(20)
        .with_jitter()
}

/// Backoff for registry connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}
