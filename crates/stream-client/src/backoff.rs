use std::time::Duration;

/// Exponential reconnection schedule: `base * 2^(attempt - 1)`, capped by an attempt budget.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            attempts: 0,
        }
    }

    /// Counts one more attempt and returns how long to wait before it, or
    /// `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let factor = 2u32.saturating_pow(self.attempts - 1);
        Some(self.base_delay.saturating_mul(factor))
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_the_budget_is_spent() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(1000), 5);
        let delays: Vec<_> = std::iter::from_fn(|| policy.next_delay()).collect();
        assert_eq!(
            delays,
            [1000, 2000, 4000, 8000, 16000].map(Duration::from_millis).to_vec()
        );
        assert_eq!(policy.attempts(), 5);
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn reset_starts_over_from_the_base_delay() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(250), 3);
        policy.next_delay();
        policy.next_delay();
        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn zero_budget_never_retries() {
        let mut policy = ReconnectPolicy::new(Duration::from_secs(1), 0);
        assert_eq!(policy.next_delay(), None);
    }
}
