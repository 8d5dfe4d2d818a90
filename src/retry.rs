/// Number of failed publish attempts after which a message is dropped.
///
/// The fifth consecutive nack for one correlation id is terminal, so a
/// message is published at most five times in total.
pub const MAX_RETRIES: u32 = 5;

// ── Decision ───────────────────────────────────────────────────────────────────

/// What to do with a message whose publish was just nacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-publish the same envelope.
    Retry {
        /// 1-based number of this retry (equals the recorded failure count).
        attempt: u32,
    },

    /// Budget exhausted; drop and report a permanent publish failure.
    GiveUp,
}

// ── Policy ─────────────────────────────────────────────────────────────────────

/// Bounded retry policy for rejected publishes.
///
/// The policy does not look at the nack reason: a malformed message and a
/// transiently overloaded broker are retried alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decide based on `failures`, the failure count **after** recording the
    /// nack that is being handled.
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if failures < self.max_retries {
            RetryDecision::Retry { attempt: failures }
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_until_the_budget_is_spent() {
        let policy = RetryPolicy::default();
        for failures in 1..MAX_RETRIES {
            assert_eq!(
                policy.decide(failures),
                RetryDecision::Retry { attempt: failures }
            );
        }
        assert_eq!(policy.decide(MAX_RETRIES), RetryDecision::GiveUp);
        assert_eq!(policy.decide(MAX_RETRIES + 3), RetryDecision::GiveUp);
    }

    #[test]
    fn zero_budget_never_retries() {
        let policy = RetryPolicy::new(0);
        assert_eq!(policy.decide(0), RetryDecision::GiveUp);
        assert_eq!(policy.decide(1), RetryDecision::GiveUp);
    }
}
