//! Commit executor: applies a confirmed mutation through the repository port,
//! retrying transient failures with bounded exponential backoff.
use super::clock::Clock;
use super::error::{ErrorKind, StoreError};
use super::ports::RepositoryPort;
use super::request::{MutationRequest, MutationResult};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of `apply` calls, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Delay before the `retry`-th retry (1-based): doubles from `base_delay`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Upper bound on the total time spent waiting between attempts.
    pub fn elapsed_ceiling(&self) -> Duration {
        self.max_delay.saturating_mul(self.max_attempts)
    }
}

/// Progress of a single commit. Lives only for the duration of that commit.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempt: u32,
    pub last_error: Option<StoreError>,
    pub next_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub result: MutationResult,
    /// Number of `apply` calls made.
    pub attempts: u32,
}

pub struct CommitExecutor {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl CommitExecutor {
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }

    pub fn commit<P, R: RepositoryPort<P> + ?Sized>(
        &self,
        repository: &R,
        request: &MutationRequest<P>,
    ) -> MutationResult {
        self.commit_with(repository, request, |_| {}).result
    }

    /// Like [`CommitExecutor::commit`], calling `on_retry` before each backoff sleep.
    pub fn commit_with<P, R: RepositoryPort<P> + ?Sized>(
        &self,
        repository: &R,
        request: &MutationRequest<P>,
        mut on_retry: impl FnMut(&RetryState),
    ) -> CommitOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let ceiling = self.policy.elapsed_ceiling();
        let mut waited = Duration::ZERO;
        let mut state = RetryState {
            attempt: 0,
            last_error: None,
            next_delay: self.policy.base_delay,
        };

        loop {
            state.attempt += 1;
            match repository.apply(request) {
                Ok(version) => {
                    return CommitOutcome {
                        result: MutationResult::succeeded(version),
                        attempts: state.attempt,
                    };
                }
                Err(StoreError::Terminal { kind, message }) => {
                    return CommitOutcome {
                        result: MutationResult::failed(
                            kind,
                            format!("{}: {message}", kind.default_message()),
                        ),
                        attempts: state.attempt,
                    };
                }
                Err(err) => {
                    state.last_error = Some(err);
                    if state.attempt >= max_attempts {
                        break;
                    }
                    state.next_delay = self.policy.delay_for(state.attempt);
                    if waited + state.next_delay > ceiling {
                        break;
                    }
                    on_retry(&state);
                    self.clock.sleep(state.next_delay);
                    waited += state.next_delay;
                }
            }
        }

        CommitOutcome {
            result: MutationResult::failed(
                ErrorKind::ConnectionInterrupted,
                format!(
                    "{} after {} attempts",
                    ErrorKind::ConnectionInterrupted.default_message(),
                    state.attempt
                ),
            ),
            attempts: state.attempt,
        }
    }
}
