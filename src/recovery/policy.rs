//! # Redelivery Policy
//!
//! Decides whether a failed delivery attempt gets another try and how long
//! to wait before it. Delays grow exponentially from a base delay by a
//! configurable multiplier (1.0 keeps them fixed) up to a cap. Faults
//! classified permanent — or matched by the exclusion predicate — are never
//! redelivered.

use crate::config::RedeliveryConfig;
use crate::constants::defaults;
use crate::exchange::ProcessingFault;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type FaultPredicate = Arc<dyn Fn(&ProcessingFault) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RedeliveryPolicy {
    /// Redeliveries allowed after the initial attempt; 0 disables retry.
    pub max_redeliveries: u32,
    /// Delay before the first redelivery.
    pub initial_delay: Duration,
    /// Growth factor applied per redelivery; 1.0 keeps the delay fixed.
    pub backoff_multiplier: f64,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Redeliver even faults marked permanent. Off by default.
    pub retry_permanent_faults: bool,
    /// Faults matched here are excluded from redelivery regardless of the
    /// attempt budget.
    exclude: Option<FaultPredicate>,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: defaults::MAX_REDELIVERIES,
            initial_delay: Duration::from_millis(defaults::INITIAL_DELAY_MS),
            backoff_multiplier: defaults::BACKOFF_MULTIPLIER,
            max_delay: Duration::from_millis(defaults::MAX_DELAY_MS),
            retry_permanent_faults: false,
            exclude: None,
        }
    }
}

impl fmt::Debug for RedeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedeliveryPolicy")
            .field("max_redeliveries", &self.max_redeliveries)
            .field("initial_delay", &self.initial_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_delay", &self.max_delay)
            .field("retry_permanent_faults", &self.retry_permanent_faults)
            .field("has_exclusion", &self.exclude.is_some())
            .finish()
    }
}

impl RedeliveryPolicy {
    pub fn new(max_redeliveries: u32, initial_delay: Duration) -> Self {
        Self {
            max_redeliveries,
            initial_delay,
            ..Self::default()
        }
    }

    /// Build a policy from deserialized configuration.
    pub fn from_config(config: &RedeliveryConfig) -> Self {
        Self {
            max_redeliveries: config.max_redeliveries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            ..Self::default()
        }
    }

    /// A policy that never retries: every fault dead-letters immediately.
    pub fn no_retry() -> Self {
        Self {
            max_redeliveries: 0,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.backoff_multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    /// Exclude matching faults from redelivery (permanent business errors,
    /// validation failures).
    pub fn exclude_faults(
        mut self,
        predicate: impl Fn(&ProcessingFault) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.exclude = Some(Arc::new(predicate));
        self
    }

    pub fn retry_permanent_faults(mut self, retry: bool) -> Self {
        self.retry_permanent_faults = retry;
        self
    }

    /// Decide whether another attempt is allowed after `redeliveries`
    /// retries have already happened.
    pub fn should_redeliver(&self, redeliveries: u32, fault: &ProcessingFault) -> bool {
        if redeliveries >= self.max_redeliveries {
            return false;
        }
        if fault.permanent && !self.retry_permanent_faults {
            return false;
        }
        if let Some(exclude) = &self.exclude {
            if exclude(fault) {
                return false;
            }
        }
        true
    }

    /// Delay before redelivery number `redelivery` (1-based):
    /// `initial_delay * multiplier^(redelivery - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, redelivery: u32) -> Duration {
        if redelivery <= 1 || self.backoff_multiplier <= 1.0 {
            return self.initial_delay.min(self.max_delay);
        }
        let factor = self.backoff_multiplier.powi((redelivery - 1) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        // powi can overflow to infinity for large attempts; the cap keeps
        // the duration finite
        if delay.is_finite() {
            Duration::from_secs_f64(delay).min(self.max_delay)
        } else {
            self.max_delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_bound() {
        let policy = RedeliveryPolicy::new(2, Duration::from_millis(10));
        let fault = ProcessingFault::new("transient");

        assert!(policy.should_redeliver(0, &fault));
        assert!(policy.should_redeliver(1, &fault));
        assert!(!policy.should_redeliver(2, &fault));
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RedeliveryPolicy::no_retry();
        assert!(!policy.should_redeliver(0, &ProcessingFault::new("x")));
    }

    #[test]
    fn test_permanent_faults_dead_letter_immediately() {
        let policy = RedeliveryPolicy::default();
        let fault = ProcessingFault::new("bad input").permanent();

        assert!(!policy.should_redeliver(0, &fault));
        assert!(policy
            .clone()
            .retry_permanent_faults(true)
            .should_redeliver(0, &fault));
    }

    #[test]
    fn test_exclusion_predicate() {
        let policy = RedeliveryPolicy::default()
            .exclude_faults(|fault| fault.message.contains("validation"));

        assert!(!policy.should_redeliver(0, &ProcessingFault::new("validation: bad field")));
        assert!(policy.should_redeliver(0, &ProcessingFault::new("connection reset")));
    }

    #[test]
    fn test_exponential_delays_are_non_decreasing() {
        let policy = RedeliveryPolicy::new(10, Duration::from_millis(100))
            .with_backoff(2.0, Duration::from_secs(60));

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));

        let mut last = Duration::ZERO;
        for n in 1..=20 {
            let delay = policy.delay_for(n);
            assert!(delay >= last);
            last = delay;
        }
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RedeliveryPolicy::new(30, Duration::from_secs(1))
            .with_backoff(2.0, Duration::from_secs(60));

        // 1 * 2^9 = 512s, capped at 60s
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
        // far past any representable growth
        assert_eq!(policy.delay_for(4000), Duration::from_secs(60));
    }

    #[test]
    fn test_fixed_delay_with_unit_multiplier() {
        let policy = RedeliveryPolicy::new(5, Duration::from_millis(250))
            .with_backoff(1.0, Duration::from_secs(60));

        for n in 1..=5 {
            assert_eq!(policy.delay_for(n), Duration::from_millis(250));
        }
    }
}
