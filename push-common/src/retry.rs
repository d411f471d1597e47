use std::time;

#[derive(Copy, Clone, Debug)]
/// The retry policy transient-infrastructure errors are retried under (capped exponential backoff).
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
    /// How many attempts (including the first) are made before giving up.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
        max_attempts: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Calculate the time until the next retry for a given RetryableJob.
    pub fn time_until_next_retry(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(attempt);

        match (preferred_retry_interval, self.maximum_interval) {
            (Some(duration), Some(max_interval)) => std::cmp::min(
                std::cmp::max(std::cmp::min(candidate_interval, max_interval), duration),
                max_interval,
            ),
            (Some(duration), None) => std::cmp::max(candidate_interval, duration),
            (None, Some(max_interval)) => std::cmp::min(candidate_interval, max_interval),
            (None, None) => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: Some(time::Duration::from_secs(3)),
            max_attempts: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_caps_at_three_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(
            policy.time_until_next_retry(0, None),
            time::Duration::from_millis(100)
        );
        // 100ms * 2^4 = 1.6s, still under the 3s cap
        assert_eq!(
            policy.time_until_next_retry(4, None),
            time::Duration::from_millis(1600)
        );
        // 100ms * 2^6 = 6.4s, capped to 3s
        assert_eq!(
            policy.time_until_next_retry(6, None),
            time::Duration::from_secs(3)
        );
    }
}
