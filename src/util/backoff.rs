use std::cmp::min;
use std::time::Duration;

/// Delays between attempts after consecutive I/O failures, growing exponentially up to a
///  maximum. A single success resets the delay.
pub struct FailureBackoff {
    consecutive_failures: u32,
    current_delay: Duration,

    config_initial_delay: Duration,
    config_max_delay: Duration,
    config_delay_factor_eighths: u32,
    config_sustained_threshold: u32,
}

impl FailureBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, sustained_threshold: u32) -> Self {
        let result = FailureBackoff {
            consecutive_failures: 0,
            current_delay: initial_delay,
            config_initial_delay: initial_delay,
            config_max_delay: max_delay,
            config_delay_factor_eighths: 8*2,
            config_sustained_threshold: sustained_threshold,
        };

        assert!(result.config_delay_factor_eighths >= 8);

        result
    }

    /// Registers a failure and returns the delay before the next attempt
    #[must_use]
    pub fn on_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let delay = self.current_delay;
        let next = self.current_delay
            .checked_mul(self.config_delay_factor_eighths)
            .map(|d| d / 8)
            .unwrap_or(self.config_max_delay);
        self.current_delay = min(next, self.config_max_delay);
        delay
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.current_delay = self.config_initial_delay;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// true exactly when the most recent failure made the failure streak reach the threshold,
    ///  so that callers report a sustained failure once rather than on every attempt
    pub fn just_became_sustained(&self) -> bool {
        self.consecutive_failures == self.config_sustained_threshold
    }

    pub fn is_sustained(&self) -> bool {
        self.consecutive_failures >= self.config_sustained_threshold
    }
}
