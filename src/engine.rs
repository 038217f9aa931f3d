//! Mutation engine: the state machine tying guard, validator, duplicate
//! checker, confirmation gate and commit executor together.
//!
//! ```text
//! Idle -> Validating -> Rejected
//!                    -> DuplicateRejected
//!                    -> PendingConfirmation -> Committing -> Retrying* -> Succeeded | Failed
//!                                           -> Cancelled
//!                                           -> Expired
//! ```
//!
//! Everything that touches the gate for a target key runs under that key's
//! lock. Keys never share a lock. The repository call and its retries run
//! after the pending entry has left the gate and the key lock is released, so
//! a new submission for the key is possible while an earlier one commits.
use super::clock::{Clock, SystemClock};
use super::config::EngineConfig;
use super::error::{ConfigError, ErrorKind, StoreError};
use super::executor::CommitExecutor;
use super::fingerprint::{Admission, Fingerprint, Guard};
use super::gate::{CancelOutcome, ConfirmationGate, PendingMutation, Token};
use super::ports::{DuplicateChecker, NoDuplicates, RepositoryPort, Validator};
use super::recent::RecentMap;
use super::request::{FieldError, MutationRequest, MutationResult, Payload};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Idle,
    Validating,
    Rejected,
    DuplicateRejected,
    PendingConfirmation,
    Committing,
    /// Waiting to make `attempt` after a transient failure.
    Retrying { attempt: u32 },
    Succeeded,
    Failed,
    Cancelled,
    Expired,
}

impl MutationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Expired
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAck {
    pub token: Token,
    pub target_key: String,
    pub expires_at: DateTime<Utc>,
}

impl<P> From<&PendingMutation<P>> for PendingAck {
    fn from(pending: &PendingMutation<P>) -> Self {
        Self {
            token: pending.token.clone(),
            target_key: pending.request.target_key().to_string(),
            expires_at: pending.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Awaiting confirmation under the acknowledged token.
    Pending(PendingAck),
    Refused(MutationResult),
}

impl Submission {
    pub fn token(&self) -> Option<&Token> {
        match self {
            Self::Pending(ack) => Some(&ack.token),
            Self::Refused(_) => None,
        }
    }
    pub fn refusal(&self) -> Option<&MutationResult> {
        match self {
            Self::Pending(_) => None,
            Self::Refused(result) => Some(result),
        }
    }
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.refusal().and_then(MutationResult::error_kind)
    }
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    Cancelled,
    AlreadyResolved,
}

#[derive(Debug, Clone)]
struct StatusEntry {
    state: MutationState,
    // the pending token this state belongs to, once one exists
    token: Option<Token>,
}

/// One mutex per target key, created on demand and dropped when unused.
#[derive(Default)]
struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    fn with<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let lock = self.locks.entry(key.to_string()).or_default().value().clone();
        let result = {
            let _held = lock.lock();
            f()
        };
        drop(lock);
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }
}

pub struct MutationEngine<P> {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    guard: Guard,
    gate: ConfirmationGate<P>,
    executor: CommitExecutor,
    validator: Arc<dyn Validator<P>>,
    duplicates: Arc<dyn DuplicateChecker<P>>,
    repository: Arc<dyn RepositoryPort<P>>,
    locks: KeyLocks,
    status: Mutex<RecentMap<String, StatusEntry>>,
}

pub struct MutationEngineBuilder<P> {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    validator: Option<Arc<dyn Validator<P>>>,
    duplicates: Arc<dyn DuplicateChecker<P>>,
    repository: Arc<dyn RepositoryPort<P>>,
}

impl<P: Payload> MutationEngineBuilder<P> {
    pub fn set_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }
    pub fn set_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
    pub fn set_validator(mut self, validator: Arc<dyn Validator<P>>) -> Self {
        self.validator = Some(validator);
        self
    }
    pub fn set_duplicate_checker(mut self, duplicates: Arc<dyn DuplicateChecker<P>>) -> Self {
        self.duplicates = duplicates;
        self
    }

    pub fn build(self) -> Result<MutationEngine<P>, ConfigError> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock;
        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(|_: &P| Vec::<FieldError>::new()));

        Ok(MutationEngine {
            guard: Guard::new(
                config.cooldown,
                config.guard_history_capacity,
                clock.clone(),
            ),
            gate: ConfirmationGate::new(
                config.pending_ttl,
                config.resolved_token_capacity,
                clock.clone(),
            ),
            executor: CommitExecutor::new(config.retry_policy(), clock.clone()),
            status: Mutex::new(RecentMap::new(config.guard_history_capacity)),
            locks: KeyLocks::default(),
            validator,
            duplicates: self.duplicates,
            repository: self.repository,
            config,
            clock,
        })
    }
}

impl<P: Payload> MutationEngine<P> {
    /// Starts a builder committing through `repository`, with default
    /// configuration, the system clock, no validation rules and no duplicates.
    pub fn builder(repository: Arc<dyn RepositoryPort<P>>) -> MutationEngineBuilder<P> {
        MutationEngineBuilder {
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            validator: None,
            duplicates: Arc::new(NoDuplicates),
            repository,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs the guard, validator and duplicate checker, then opens a pending
    /// confirmation. Nothing is persisted.
    pub fn submit(&self, request: MutationRequest<P>) -> Submission {
        let key = request.target_key().to_string();
        let fingerprint = match Fingerprint::of(&key, request.payload()) {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                return Submission::Refused(MutationResult::failed(
                    ErrorKind::Validation,
                    err.to_string(),
                ));
            }
        };

        self.locks.with(&key, || {
            // a lapsed entry no longer holds the key, swept or not
            if let Some(lapsed) = self.gate.expire(&key) {
                self.update_status(&key, &lapsed.token, MutationState::Expired);
            }

            match self
                .guard
                .admit(&key, &fingerprint, self.gate.is_pending(&key))
            {
                Admission::Admitted => {}
                Admission::AlreadyPending => {
                    return Submission::Refused(MutationResult::failed_with(
                        ErrorKind::AlreadyPending,
                    ));
                }
                Admission::TooSoon { retry_after } => {
                    return Submission::Refused(MutationResult::failed(
                        ErrorKind::TooSoon,
                        format!(
                            "{} (retry in {}ms)",
                            ErrorKind::TooSoon.default_message(),
                            retry_after.as_millis()
                        ),
                    ));
                }
            }

            self.set_status(&key, MutationState::Validating, None);
            let field_errors = self.validator.validate(request.payload());
            if !field_errors.is_empty() {
                self.set_status(&key, MutationState::Rejected, None);
                return Submission::Refused(MutationResult::rejected(field_errors));
            }

            match self.duplicates.exists(request.payload()) {
                Ok(false) => {}
                Ok(true) => {
                    self.set_status(&key, MutationState::DuplicateRejected, None);
                    return Submission::Refused(MutationResult::failed_with(ErrorKind::Duplicate));
                }
                Err(err) => {
                    self.clear_status(&key);
                    return Submission::Refused(store_failure(err));
                }
            }

            match self.gate.open(request, fingerprint) {
                Ok(pending) => {
                    self.set_status(
                        &key,
                        MutationState::PendingConfirmation,
                        Some(pending.token.clone()),
                    );
                    Submission::Pending(PendingAck::from(&pending))
                }
                Err(err) => {
                    self.clear_status(&key);
                    Submission::Refused(MutationResult::failed(err.kind(), err.to_string()))
                }
            }
        })
    }

    /// Claims the pending mutation and commits it, retrying transient failures.
    pub fn confirm_submission(&self, token: &Token) -> MutationResult {
        let claimed = match self.gate_key(token) {
            Some(key) => self.locks.with(&key, || self.claim(&key, token)),
            // already left the gate: the gate still knows how it ended
            None => self
                .gate
                .confirm(token)
                .map_err(|err| MutationResult::failed_with(err.kind())),
        };
        let pending = match claimed {
            Ok(pending) => pending,
            Err(result) => return result,
        };

        let key = pending.request.target_key();
        let outcome = self
            .executor
            .commit_with(self.repository.as_ref(), &pending.request, |retry| {
                self.update_status(
                    key,
                    token,
                    MutationState::Retrying {
                        attempt: retry.attempt + 1,
                    },
                );
            });

        let terminal = if outcome.result.is_success() {
            MutationState::Succeeded
        } else {
            MutationState::Failed
        };
        self.locks.with(key, || {
            self.update_status(key, token, terminal);
            self.guard.record_resolution(key, &pending.fingerprint);
        });

        outcome.result
    }

    /// Withdraws a pending mutation. Nothing is ever persisted for it.
    pub fn cancel_submission(&self, token: &Token) -> CancelAck {
        let Some(key) = self.gate_key(token) else {
            return CancelAck::AlreadyResolved;
        };

        self.locks.with(&key, || match self.gate.cancel(token) {
            CancelOutcome::Cancelled(_) => {
                self.update_status(&key, token, MutationState::Cancelled);
                CancelAck::Cancelled
            }
            CancelOutcome::AlreadyResolved => CancelAck::AlreadyResolved,
        })
    }

    /// Last observed state for `target_key`. Never changes anything.
    pub fn status(&self, target_key: &str) -> MutationState {
        if let Some(pending) = self.gate.pending_for(target_key) {
            if pending.is_expired_at(self.clock.now()) {
                return MutationState::Expired;
            }
            return MutationState::PendingConfirmation;
        }

        self.status
            .lock()
            .get(&target_key.to_string())
            .map_or(MutationState::Idle, |entry| entry.state)
    }

    /// The confirmation currently open for `target_key`, if any.
    pub fn pending_for(&self, target_key: &str) -> Option<PendingAck> {
        self.gate
            .pending_for(target_key)
            .map(|pending| PendingAck::from(&pending))
    }

    /// Evicts every expired pending mutation, returning how many were evicted.
    pub fn sweep_expired(&self) -> usize {
        self.gate
            .expired_keys()
            .into_iter()
            .filter(|key| {
                self.locks.with(key, || match self.gate.expire(key) {
                    Some(pending) => {
                        self.update_status(key, &pending.token, MutationState::Expired);
                        true
                    }
                    None => false,
                })
            })
            .count()
    }

    /// Runs [`MutationEngine::sweep_expired`] every `interval` on a background
    /// thread until the returned handle is stopped or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> std::io::Result<ExpirySweeper> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let (stop, stopped) = mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name("expiry-sweeper".into())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    let expired = engine.sweep_expired();
                    if expired > 0 {
                        tracing::debug!(expired, "evicted expired pending mutations");
                    }
                }
            })?;

        Ok(ExpirySweeper {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    fn gate_key(&self, token: &Token) -> Option<String> {
        self.gate.pending_key_of(token)
    }

    fn claim(&self, key: &str, token: &Token) -> Result<PendingMutation<P>, MutationResult> {
        match self.gate.confirm(token) {
            Ok(pending) => {
                self.update_status(key, token, MutationState::Committing);
                Ok(pending)
            }
            Err(err) => {
                if err.kind() == ErrorKind::Expired {
                    self.update_status(key, token, MutationState::Expired);
                }
                Err(MutationResult::failed_with(err.kind()))
            }
        }
    }

    fn set_status(&self, key: &str, state: MutationState, token: Option<Token>) {
        self.status
            .lock()
            .insert(key.to_string(), StatusEntry { state, token });
    }

    // Only moves the key forward if it still belongs to `token`; a newer
    // submission for the same key keeps its own state. An entry evicted by
    // capacity pressure is written again by its token's next transition.
    fn update_status(&self, key: &str, token: &Token, state: MutationState) {
        let mut status = self.status.lock();
        match status.get_mut(&key.to_string()) {
            Some(entry) if entry.token.as_ref() == Some(token) => entry.state = state,
            Some(_) => {}
            None => {
                status.insert(
                    key.to_string(),
                    StatusEntry {
                        state,
                        token: Some(token.clone()),
                    },
                );
            }
        }
    }

    fn clear_status(&self, key: &str) {
        self.status.lock().remove(&key.to_string());
    }
}

fn store_failure(err: StoreError) -> MutationResult {
    match err {
        StoreError::Transient(message) => MutationResult::failed(
            ErrorKind::ConnectionInterrupted,
            format!(
                "{}: {message}",
                ErrorKind::ConnectionInterrupted.default_message()
            ),
        ),
        StoreError::Terminal { kind, message } => {
            MutationResult::failed(kind, format!("{}: {message}", kind.default_message()))
        }
    }
}

/// Handle to the background expiry sweeper. Stops the thread when dropped.
pub struct ExpirySweeper {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ExpirySweeper {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("expiry sweeper thread panicked");
            }
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
