use std::time::Duration;

/// Bounds the attempts spent on one job and the pause between them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            delay: Duration::from_secs(10),
        }
    }
}

/// Per-job attempt state. Success is recorded by the job store and ends the
/// machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// The n-th attempt (1-based) is running or about to run.
    Attempt(u32),
    /// Out of attempts. Only an operator reset brings the job back.
    Failed,
}

/// What the worker does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// State of a job that has already finished `attempts` attempts.
    pub fn state_after(&self, attempts: u32) -> AttemptState {
        if attempts >= self.policy.max_attempts {
            AttemptState::Failed
        } else {
            AttemptState::Attempt(attempts + 1)
        }
    }

    pub fn on_failure(&self, state: AttemptState) -> (AttemptState, RetryDecision) {
        match state {
            AttemptState::Attempt(n) if n < self.policy.max_attempts => (
                AttemptState::Attempt(n + 1),
                RetryDecision::RetryAfter(self.policy.delay),
            ),
            AttemptState::Attempt(_) | AttemptState::Failed => {
                (AttemptState::Failed, RetryDecision::GiveUp)
            }
        }
    }

    /// Decision for a job whose failed attempt brought it to `attempts`.
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        self.on_failure(AttemptState::Attempt(attempts.max(1))).1
    }
}
