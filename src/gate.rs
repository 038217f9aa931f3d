//! Confirmation gate: one pending mutation per target key, awaiting an
//! explicit confirm or cancel before it may be committed.
//!
//! Every removal from the gate is a single atomic step on the key's slot, so
//! confirm, cancel and expiry can never all claim the same token. The token of
//! every removed entry is remembered for a while together with how it ended,
//! which lets late callers learn the difference between "expired" and "gone".
use super::clock::{Clock, add};
use super::error::GateError;
use super::fingerprint::Fingerprint;
use super::recent::RecentMap;
use super::request::{MutationRequest, Payload};
use super::utils;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const TOKEN_HRP: &str = "pending";

/// Opaque handle a caller uses to confirm or cancel a pending mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    pub fn generate() -> Self {
        Self(utils::new_prefixed_id(TOKEN_HRP))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone)]
pub struct PendingMutation<P> {
    pub token: Token,
    pub request: MutationRequest<P>,
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: PendingState,
}

impl<P> PendingMutation<P> {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub enum CancelOutcome<P> {
    Cancelled(PendingMutation<P>),
    /// Nothing pending under the token, either resolved earlier or never issued.
    AlreadyResolved,
}

pub struct ConfirmationGate<P> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    pending: DashMap<String, PendingMutation<P>>,
    tokens: DashMap<Token, String>,
    resolved: Mutex<RecentMap<Token, PendingState>>,
}

impl<P: Payload> ConfirmationGate<P> {
    pub fn new(ttl: Duration, resolved_capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            pending: DashMap::new(),
            tokens: DashMap::new(),
            resolved: Mutex::new(RecentMap::new(resolved_capacity)),
        }
    }

    /// Opens a pending entry for the request's target key.
    pub fn open(
        &self,
        request: MutationRequest<P>,
        fingerprint: Fingerprint,
    ) -> Result<PendingMutation<P>, GateError> {
        let key = request.target_key().to_string();
        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => Err(GateError::Conflict(key)),
            Entry::Vacant(slot) => {
                let now = self.clock.now();
                let pending = PendingMutation {
                    token: Token::generate(),
                    request,
                    fingerprint,
                    created_at: now,
                    expires_at: add(now, self.ttl),
                    state: PendingState::Pending,
                };
                self.tokens.insert(pending.token.clone(), key);
                slot.insert(pending.clone());
                Ok(pending)
            }
        }
    }

    /// Claims the pending entry for commit. The entry leaves the gate whether
    /// or not it had expired.
    pub fn confirm(&self, token: &Token) -> Result<PendingMutation<P>, GateError> {
        let now = self.clock.now();
        let Some(key) = self.pending_key_of(token) else {
            return Err(self.resolved_error(token));
        };

        match self.pending.entry(key) {
            Entry::Occupied(slot) if slot.get().token == *token => {
                let mut pending = slot.remove();
                if pending.is_expired_at(now) {
                    self.resolve(token, PendingState::Expired);
                    return Err(GateError::Expired);
                }
                self.resolve(token, PendingState::Confirmed);
                pending.state = PendingState::Confirmed;
                Ok(pending)
            }
            _ => Err(self.resolved_error(token)),
        }
    }

    pub fn cancel(&self, token: &Token) -> CancelOutcome<P> {
        let Some(key) = self.pending_key_of(token) else {
            return CancelOutcome::AlreadyResolved;
        };

        match self.pending.entry(key) {
            Entry::Occupied(slot) if slot.get().token == *token => {
                let mut pending = slot.remove();
                self.resolve(token, PendingState::Cancelled);
                pending.state = PendingState::Cancelled;
                CancelOutcome::Cancelled(pending)
            }
            _ => CancelOutcome::AlreadyResolved,
        }
    }

    /// Target keys whose entries are past their expiry.
    pub fn expired_keys(&self) -> Vec<String> {
        let now = self.clock.now();
        self.pending
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Evicts the entry for `target_key` if it has expired.
    pub fn expire(&self, target_key: &str) -> Option<PendingMutation<P>> {
        let now = self.clock.now();
        let (_, mut pending) = self
            .pending
            .remove_if(target_key, |_, pending| pending.is_expired_at(now))?;
        self.resolve(&pending.token, PendingState::Expired);
        pending.state = PendingState::Expired;
        Some(pending)
    }

    /// Evicts every expired entry.
    pub fn sweep(&self) -> Vec<PendingMutation<P>> {
        self.expired_keys()
            .iter()
            .filter_map(|key| self.expire(key))
            .collect()
    }

    pub fn pending_for(&self, target_key: &str) -> Option<PendingMutation<P>> {
        self.pending.get(target_key).map(|entry| entry.value().clone())
    }

    pub fn is_pending(&self, target_key: &str) -> bool {
        self.pending.contains_key(target_key)
    }

    /// How a token that left the gate ended, while it is still remembered.
    pub fn resolution_of(&self, token: &Token) -> Option<PendingState> {
        self.resolved.lock().get(token).copied()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Target key of the entry still pending under `token`.
    pub fn pending_key_of(&self, token: &Token) -> Option<String> {
        self.tokens.get(token).map(|key| key.value().clone())
    }

    // The tombstone is written before the token index entry goes away, so a
    // racing caller that misses the index still finds the tombstone.
    fn resolve(&self, token: &Token, state: PendingState) {
        self.resolved.lock().insert(token.clone(), state);
        self.tokens.remove(token);
    }

    fn resolved_error(&self, token: &Token) -> GateError {
        match self.resolution_of(token) {
            Some(PendingState::Expired) => GateError::Expired,
            _ => GateError::NotFound,
        }
    }
}
