//! Capabilities the engine consumes but does not implement
use super::error::StoreError;
use super::request::{CommittedVersion, FieldError, MutationRequest};

/// Pure check of a payload. An empty list means the payload is acceptable.
pub trait Validator<P>: Send + Sync {
    fn validate(&self, payload: &P) -> Vec<FieldError>;
}

impl<P, F> Validator<P> for F
where
    F: Fn(&P) -> Vec<FieldError> + Send + Sync,
{
    fn validate(&self, payload: &P) -> Vec<FieldError> {
        self(payload)
    }
}

pub trait DuplicateChecker<P>: Send + Sync {
    /// Whether a record equivalent to `payload` already exists.
    fn exists(&self, payload: &P) -> Result<bool, StoreError>;
}

/// Finds no duplicates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDuplicates;

impl<P> DuplicateChecker<P> for NoDuplicates {
    fn exists(&self, _: &P) -> Result<bool, StoreError> {
        Ok(false)
    }
}

/// The remote store. `apply` is all-or-nothing: on error nothing is visible.
pub trait RepositoryPort<P>: Send + Sync {
    fn apply(&self, request: &MutationRequest<P>) -> Result<CommittedVersion, StoreError>;
}
