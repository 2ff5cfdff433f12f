use std::time::Duration;

/// Timing and threshold knobs for connect, capture and reconnect.
///
/// Every wait the manager performs comes from here, so tests can shrink them to
/// milliseconds.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Budget for the TCP reachability probe.
    pub probe_timeout: Duration,
    /// First-frame reads attempted while connecting.
    pub frame_attempts: u32,
    pub frame_retry_delay: Duration,
    /// Attempts made by `connect_with_retry`.
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    /// Consecutive read failures after which the source is reopened.
    pub soft_failure_threshold: u32,
    /// Consecutive read failures at which the capture loop gives up.
    pub hard_failure_threshold: u32,
    /// Reopen attempts allowed per failure episode.
    pub max_reconnect_attempts: u32,
    /// Pause after a failed read; doubles every few failures up to the max.
    pub failure_pause: Duration,
    pub max_failure_pause: Duration,
    /// Wait after tearing down a failing stream before reopening it.
    pub reconnect_delay: Duration,
    /// Reads discarded on disconnect to flush decoder buffers.
    pub drain_reads: u32,
    /// Frames whose mean brightness falls outside this range are discarded.
    pub min_brightness: f64,
    pub max_brightness: f64,
    /// How long `stop` waits for the capture worker before detaching it.
    pub join_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            frame_attempts: 5,
            frame_retry_delay: Duration::from_millis(200),
            connect_attempts: 3,
            connect_retry_delay: Duration::from_secs(2),
            soft_failure_threshold: 15,
            hard_failure_threshold: 20,
            max_reconnect_attempts: 5,
            failure_pause: Duration::from_millis(50),
            max_failure_pause: Duration::from_millis(500),
            reconnect_delay: Duration::from_secs(3),
            drain_reads: 3,
            min_brightness: 5.0,
            max_brightness: 250.0,
            join_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Pause after the `failures`-th consecutive failed read.
    pub fn failure_pause_for(&self, failures: u32) -> Duration {
        let exponent = (failures.saturating_sub(1) / 5).min(16);
        self.failure_pause
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_failure_pause)
    }

    /// Cheap corruption screen: nearly black or blown-out frames.
    pub fn is_corrupt(&self, mean_brightness: f64) -> bool {
        mean_brightness < self.min_brightness || mean_brightness > self.max_brightness
    }

    pub fn should_reconnect(&self, failures: u32) -> bool {
        failures > self.soft_failure_threshold
    }

    pub fn should_give_up(&self, failures: u32) -> bool {
        failures >= self.hard_failure_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.failure_pause_for(1), Duration::from_millis(50));
        assert_eq!(policy.failure_pause_for(5), Duration::from_millis(50));
        assert_eq!(policy.failure_pause_for(6), Duration::from_millis(100));
        assert_eq!(policy.failure_pause_for(11), Duration::from_millis(200));
        assert_eq!(policy.failure_pause_for(1000), Duration::from_millis(500));
    }

    #[test]
    fn thresholds() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_reconnect(15));
        assert!(policy.should_reconnect(16));
        assert!(!policy.should_give_up(19));
        assert!(policy.should_give_up(20));
    }

    #[test]
    fn brightness_screen() {
        let policy = RetryPolicy::default();
        assert!(policy.is_corrupt(0.0));
        assert!(policy.is_corrupt(254.0));
        assert!(!policy.is_corrupt(120.0));
    }
}
