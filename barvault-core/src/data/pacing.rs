//! Sleeps between requests, retries and batches.
//!
//! All waiting goes through [`Pacer`] so tests can observe the schedule
//! without spending wall-clock time.

use std::sync::Mutex;
use std::time::Duration;

pub trait Pacer {
    fn pause(&self, duration: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Records requested pauses instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingPacer {
    pauses: Mutex<Vec<Duration>>,
}

impl RecordingPacer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pauses(&self) -> Vec<Duration> {
        self.pauses.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.pauses().iter().sum()
    }
}

impl Pacer for RecordingPacer {
    fn pause(&self, duration: Duration) {
        if let Ok(mut pauses) = self.pauses.lock() {
            pauses.push(duration);
        }
    }
}

/// Exponential backoff: `base × 2^attempt`, saturating.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(4000));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let d = backoff_delay(Duration::from_secs(u64::MAX / 2), 40);
        assert_eq!(d, Duration::MAX);
    }

    #[test]
    fn recording_pacer_keeps_order() {
        let pacer = RecordingPacer::new();
        pacer.pause(Duration::from_secs(1));
        pacer.pause(Duration::from_secs(2));
        assert_eq!(
            pacer.pauses(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(pacer.total(), Duration::from_secs(3));
    }
}
