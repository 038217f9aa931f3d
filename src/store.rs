//! sled-backed repository, duplicate checker and commit journal
use super::error::{ErrorKind, StoreError};
use super::fingerprint::Fingerprint;
use super::ports::{DuplicateChecker, RepositoryPort};
use super::request::{CommittedVersion, MutationRequest, Payload, TimeStamp};
use anyhow::Context;
use chrono::Utc;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
};
use std::sync::Arc;

const RECORD_PREFIX: &str = "record/";
const PAYLOAD_PREFIX: &str = "payload/";
const JOURNAL_PREFIX: &[u8] = b"journal/";

/// One committed mutation, as stored and as journaled.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    #[n(0)]
    pub target_key: String,
    #[n(1)]
    pub requester_id: String,
    #[n(2)]
    pub fingerprint: Fingerprint, // target key + payload
    #[n(3)]
    pub payload_hash: Fingerprint, // payload only, indexes duplicates
    #[n(4)]
    pub version: CommittedVersion,
    #[n(5)]
    pub submitted_at: TimeStamp<Utc>,
    #[n(6)]
    pub committed_at: TimeStamp<Utc>,
    #[n(7)]
    #[cbor(with = "minicbor::bytes")]
    pub payload: Vec<u8>, // cbor
}

pub struct SledStore {
    instance: Arc<sled::Db>,
}

impl SledStore {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    /// Latest committed record for `target_key`.
    pub fn current(&self, target_key: &str) -> anyhow::Result<Option<CommitRecord>> {
        let Some(bytes) = self.instance.get(record_key(target_key))? else {
            return Ok(None);
        };
        let record = minicbor::decode(&bytes)
            .with_context(|| format!("corrupt record for {target_key}"))?;
        Ok(Some(record))
    }

    /// Every commit for `target_key`, oldest first.
    pub fn history(&self, target_key: &str) -> anyhow::Result<Vec<CommitRecord>> {
        let mut records = vec![];
        for entry in self.instance.scan_prefix(JOURNAL_PREFIX) {
            let (_, bytes) = entry?;
            let record: CommitRecord =
                minicbor::decode(&bytes).context("corrupt journal entry")?;
            if record.target_key == target_key {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn view_history(&self, target_key: &str) -> anyhow::Result<()> {
        for record in self.history(target_key)? {
            tracing::info!(
                target_key = %record.target_key,
                version = %record.version,
                requester = %record.requester_id,
                committed_at = %record.committed_at.to_datetime_utc(),
                "commit"
            );
        }
        Ok(())
    }
}

impl<P: Payload> RepositoryPort<P> for SledStore {
    fn apply(&self, request: &MutationRequest<P>) -> Result<CommittedVersion, StoreError> {
        let target_key = request.target_key();
        let payload = minicbor::to_vec(request.payload())
            .map_err(|e| StoreError::terminal(ErrorKind::Validation, e.to_string()))?;
        let fingerprint = Fingerprint::of(target_key, request.payload())
            .map_err(|e| StoreError::terminal(ErrorKind::Validation, e.to_string()))?;
        let payload_hash = Fingerprint::of_payload(request.payload())
            .map_err(|e| StoreError::terminal(ErrorKind::Validation, e.to_string()))?;

        let id = self.instance.generate_id().map_err(classify)?;
        let version = CommittedVersion(format!("{id:016x}"));
        let record = CommitRecord {
            target_key: target_key.to_string(),
            requester_id: request.requester_id().to_string(),
            fingerprint,
            payload_hash: payload_hash.clone(),
            version: version.clone(),
            submitted_at: request.submitted_at().clone(),
            committed_at: TimeStamp::new(),
            payload,
        };
        let encoded = minicbor::to_vec(&record)
            .map_err(|e| StoreError::terminal(ErrorKind::Storage, e.to_string()))?;

        // One transaction: read the current record, move the duplicate index
        // off its payload, write the new record and append to the journal.
        let outcome = self
            .instance
            .transaction(|tx| -> ConflictableTransactionResult<(), StoreError> {
                if let Some(bytes) = tx.get(record_key(target_key))? {
                    let previous: CommitRecord = minicbor::decode(&bytes).map_err(|e| {
                        ConflictableTransactionError::Abort(StoreError::terminal(
                            ErrorKind::Storage,
                            format!("corrupt record for {target_key}: {e}"),
                        ))
                    })?;
                    let index = payload_key(&previous.payload_hash);
                    // the index may already belong to another key
                    if tx.get(index.clone())?.as_deref() == Some(target_key.as_bytes()) {
                        tx.remove(index)?;
                    }
                }
                tx.insert(record_key(target_key), encoded.clone())?;
                tx.insert(payload_key(&payload_hash), target_key.as_bytes())?;
                tx.insert(journal_key(id), encoded.clone())?;
                Ok(())
            });

        match outcome {
            Ok(()) => {}
            Err(TransactionError::Abort(err)) => return Err(err),
            Err(TransactionError::Storage(err)) => return Err(classify(err)),
        }

        tracing::debug!(target_key, %version, "mutation applied");
        Ok(version)
    }
}

impl<P: Payload> DuplicateChecker<P> for SledStore {
    fn exists(&self, payload: &P) -> Result<bool, StoreError> {
        let hash = Fingerprint::of_payload(payload)
            .map_err(|e| StoreError::terminal(ErrorKind::Validation, e.to_string()))?;
        let found = self
            .instance
            .contains_key(payload_key(&hash))
            .map_err(classify)?;
        tracing::debug!(payload_hash = %hash, found, "duplicate lookup");
        Ok(found)
    }
}

fn record_key(target_key: &str) -> Vec<u8> {
    format!("{RECORD_PREFIX}{target_key}").into_bytes()
}

fn payload_key(hash: &Fingerprint) -> Vec<u8> {
    format!("{PAYLOAD_PREFIX}{hash}").into_bytes()
}

// big-endian so the journal scans in commit order
fn journal_key(id: u64) -> Vec<u8> {
    let mut key = JOURNAL_PREFIX.to_vec();
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn classify(err: sled::Error) -> StoreError {
    match err {
        sled::Error::Io(io) => {
            tracing::warn!(error = %io, "sled i/o failure, reporting as transient");
            StoreError::Transient(io.to_string())
        }
        other => StoreError::terminal(ErrorKind::Storage, other.to_string()),
    }
}
