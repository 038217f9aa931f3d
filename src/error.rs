//! Error taxonomy shared by the engine and its collaborators
use std::fmt;

/// Why a mutation did not succeed. Carried by every failed [`crate::request::MutationResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Field-level problems, fixed by resubmitting corrected data.
    Validation,
    /// An equivalent record already exists.
    Duplicate,
    /// A confirmation is already open for the target key.
    AlreadyPending,
    /// The same request resolved less than a cooldown ago.
    TooSoon,
    NotFound,
    Expired,
    /// The store stayed unreachable after every retry.
    ConnectionInterrupted,
    /// Internal invariant violation, reported as a server fault.
    Conflict,
    /// Terminal storage failure that is none of the above.
    Storage,
}

impl ErrorKind {
    /// Generic user facing message for the kind.
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::Validation => "The submitted data is not valid",
            Self::Duplicate => "An equivalent record already exists",
            Self::AlreadyPending => "A change for this record is already awaiting confirmation",
            Self::TooSoon => "This change was just processed, please wait before resubmitting",
            Self::NotFound => "No pending change matches this confirmation",
            Self::Expired => "The confirmation window for this change has expired",
            Self::ConnectionInterrupted => "Connection to the server interrupted",
            Self::Conflict => "The server could not process this change",
            Self::Storage => "The change was refused by the server",
        }
    }

    pub fn is_server_fault(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "Validation",
            Self::Duplicate => "Duplicate",
            Self::AlreadyPending => "AlreadyPending",
            Self::TooSoon => "TooSoon",
            Self::NotFound => "NotFound",
            Self::Expired => "Expired",
            Self::ConnectionInterrupted => "ConnectionInterrupted",
            Self::Conflict => "Conflict",
            Self::Storage => "Storage",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("No pending mutation for token")]
    NotFound,
    #[error("Pending mutation expired before confirmation")]
    Expired,
    #[error("Target key {0} already has a pending mutation")]
    Conflict(String),
}

impl GateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::Expired => ErrorKind::Expired,
            Self::Conflict(_) => ErrorKind::Conflict,
        }
    }
}

/// Failure reported by a store port. Only `Transient` is ever retried.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("{kind} store failure: {message}")]
    Terminal { kind: ErrorKind, message: String },
}

impl StoreError {
    pub fn terminal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Terminal {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("max_attempts must be at least 1")]
    NoAttempts,
    #[error("base_delay {base_ms}ms exceeds max_delay {max_ms}ms")]
    DelayOrder { base_ms: u128, max_ms: u128 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(thiserror::Error, Debug)]
#[error("payload could not be encoded: {0}")]
pub struct FingerprintError(pub String);
