//! Requests submitted to the engine and the results handed back
use super::error::ErrorKind;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;

/// Anything that can be normalised into CBOR can be the body of a mutation.
pub trait Payload: minicbor::Encode<()> + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Payload for T where T: minicbor::Encode<()> + Clone + fmt::Debug + Send + Sync + 'static {}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl From<DateTime<Utc>> for TimeStamp<Utc> {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// What is being changed, and by whom. Immutable once built.
#[derive(Debug, Clone)]
pub struct MutationRequest<P> {
    target_key: String,
    payload: P,
    submitted_at: TimeStamp<Utc>,
    requester_id: String,
}

impl<P: Payload> MutationRequest<P> {
    pub fn new(target_key: impl Into<String>, payload: P, requester_id: impl Into<String>) -> Self {
        Self {
            target_key: target_key.into(),
            payload,
            submitted_at: TimeStamp::new(),
            requester_id: requester_id.into(),
        }
    }
}

impl<P> MutationRequest<P> {
    pub fn target_key(&self) -> &str {
        &self.target_key
    }
    pub fn payload(&self) -> &P {
        &self.payload
    }
    pub fn submitted_at(&self) -> &TimeStamp<Utc> {
        &self.submitted_at
    }
    pub fn requester_id(&self) -> &str {
        &self.requester_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Opaque version handed back by the repository on a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
#[cbor(array)]
pub struct CommittedVersion(#[n(0)] pub String);

impl fmt::Display for CommittedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome returned to callers. Either a success carrying a version or a
/// failure carrying an [`ErrorKind`], never a mix of the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationResult {
    success: bool,
    error_kind: Option<ErrorKind>,
    message: String,
    committed_version: Option<CommittedVersion>,
    field_errors: Vec<FieldError>,
}

impl MutationResult {
    pub fn succeeded(version: CommittedVersion) -> Self {
        Self {
            success: true,
            error_kind: None,
            message: "Change committed".to_string(),
            committed_version: Some(version),
            field_errors: vec![],
        }
    }
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_kind: Some(kind),
            message: message.into(),
            committed_version: None,
            field_errors: vec![],
        }
    }
    /// Failure using the kind's generic message.
    pub fn failed_with(kind: ErrorKind) -> Self {
        Self::failed(kind, kind.default_message())
    }
    /// Validation failure aggregating every field error.
    pub fn rejected(field_errors: Vec<FieldError>) -> Self {
        let details = field_errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            success: false,
            error_kind: Some(ErrorKind::Validation),
            message: format!("{}: {details}", ErrorKind::Validation.default_message()),
            committed_version: None,
            field_errors,
        }
    }
    pub fn is_success(&self) -> bool {
        self.success
    }
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }
    pub fn message(&self) -> &str {
        &self.message
    }
    pub fn committed_version(&self) -> Option<&CommittedVersion> {
        self.committed_version.as_ref()
    }
    pub fn field_errors(&self) -> &[FieldError] {
        &self.field_errors
    }
}
