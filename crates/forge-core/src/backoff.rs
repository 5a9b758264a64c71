//! The fixed 3-attempt backoff schedule used by the Dispatcher and the
//! Result Ingester when retrying a `VersionConflict` or talking to an
//! unavailable store/queue.

use std::time::Duration;

/// `100ms, 400ms, 1.6s` — reused for retriable `VersionConflict` handling
/// in both the dispatcher and the ingester.
pub const SCHEDULE_MS: [u64; 3] = [100, 400, 1_600];

/// Sleep for the delay at `attempt` (0-based). Attempts past the end of the
/// schedule reuse the last (longest) delay.
pub async fn wait(attempt: usize) {
    let ms = SCHEDULE_MS
        .get(attempt)
        .copied()
        .unwrap_or(*SCHEDULE_MS.last().unwrap());
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Maximum number of attempts for both the dispatcher's reservation retry
/// and the ingester's version-conflict retry.
pub const MAX_ATTEMPTS: usize = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_100_400_1600_ms() {
        assert_eq!(SCHEDULE_MS, [100, 400, 1_600]);
    }

    #[tokio::test]
    async fn wait_past_schedule_end_uses_last_delay() {
        let start = std::time::Instant::now();
        wait(10).await;
        assert!(start.elapsed() >= Duration::from_millis(1_600));
    }
}
