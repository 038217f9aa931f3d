//! Submission identity and the resubmission guard
use super::clock::{Clock, elapsed};
use super::error::FingerprintError;
use super::recent::RecentMap;
use super::request::Payload;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// sha256 over the CBOR encoding of a submission, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
#[cbor(array)]
pub struct Fingerprint(#[n(0)] String);

impl Fingerprint {
    /// Identity of "the same request": target key plus normalised payload.
    /// Requester and submission time deliberately do not take part.
    pub fn of<P: Payload>(target_key: &str, payload: &P) -> Result<Self, FingerprintError> {
        let contents =
            minicbor::to_vec((target_key, payload)).map_err(|e| FingerprintError(e.to_string()))?;
        Ok(Self(sha256::digest(&contents)))
    }

    /// Identity of the payload alone, used to find equivalent records under any key.
    pub fn of_payload<P: Payload>(payload: &P) -> Result<Self, FingerprintError> {
        let contents = minicbor::to_vec(payload).map_err(|e| FingerprintError(e.to_string()))?;
        Ok(Self(sha256::digest(&contents)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    AlreadyPending,
    TooSoon { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Blocks accidental resubmission of a request that is pending or that
/// resolved less than `cooldown` ago. Never touches storage.
///
/// Only resolutions are remembered, one per target key and fingerprint, so
/// neither a refused submission nor the resolution of a different change can
/// shorten a running cooldown.
pub struct Guard {
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    resolved: Mutex<RecentMap<(String, Fingerprint), DateTime<Utc>>>,
}

impl Guard {
    pub fn new(cooldown: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            cooldown,
            clock,
            resolved: Mutex::new(RecentMap::new(capacity)),
        }
    }

    /// Decides whether a submission may proceed. `has_pending` is whether the
    /// confirmation gate currently holds an entry for `target_key`.
    pub fn admit(
        &self,
        target_key: &str,
        fingerprint: &Fingerprint,
        has_pending: bool,
    ) -> Admission {
        if has_pending {
            return Admission::AlreadyPending;
        }

        let key = (target_key.to_string(), fingerprint.clone());
        if let Some(resolved_at) = self.resolved.lock().get(&key) {
            let since = elapsed(*resolved_at, self.clock.now());
            if since < self.cooldown {
                return Admission::TooSoon {
                    retry_after: self.cooldown - since,
                };
            }
        }
        Admission::Admitted
    }

    /// Starts the cooldown for `fingerprint` on `target_key`.
    pub fn record_resolution(&self, target_key: &str, fingerprint: &Fingerprint) {
        let now = self.clock.now();
        self.resolved
            .lock()
            .insert((target_key.to_string(), fingerprint.clone()), now);
    }

    pub fn tracked_resolutions(&self) -> usize {
        self.resolved.lock().len()
    }
}
