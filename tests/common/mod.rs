//! Shared fixtures for the integration tests
#![allow(dead_code)]

use mutation_approval::{
    EngineConfig, FieldError, MutationEngine, MutationRequest,
    clock::ManualClock,
    error::StoreError,
    ports::{DuplicateChecker, RepositoryPort},
    request::CommittedVersion,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::time::Duration;

/// Tourist profile, the payload used throughout the tests.
#[derive(minicbor::Encode, minicbor::Decode, Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub city: String,
}

pub fn profile(name: &str) -> Profile {
    Profile {
        name: name.into(),
        city: "Salerno".into(),
    }
}

pub fn request(key: &str, name: &str) -> MutationRequest<Profile> {
    MutationRequest::new(key, profile(name), "user_1")
}

/// Rejects empty names and empty cities.
pub fn profile_rules(profile: &Profile) -> Vec<FieldError> {
    let mut errors = vec![];
    if profile.name.trim().is_empty() {
        errors.push(FieldError::new("name", "must not be empty"));
    }
    if profile.city.trim().is_empty() {
        errors.push(FieldError::new("city", "must not be empty"));
    }
    errors
}

/// Replays scripted failures, then either succeeds or repeats `fallback`.
pub struct ScriptedRepository {
    script: Mutex<VecDeque<StoreError>>,
    fallback: Option<StoreError>,
    calls: AtomicU32,
}

impl ScriptedRepository {
    pub fn succeeding() -> Self {
        Self::failing_first(vec![])
    }
    pub fn failing_first(failures: Vec<StoreError>) -> Self {
        Self {
            script: Mutex::new(failures.into()),
            fallback: None,
            calls: AtomicU32::new(0),
        }
    }
    pub fn always(error: StoreError) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(error),
            calls: AtomicU32::new(0),
        }
    }
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RepositoryPort<Profile> for ScriptedRepository {
    fn apply(&self, _: &MutationRequest<Profile>) -> Result<CommittedVersion, StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.script.lock().pop_front() {
            return Err(error);
        }
        match &self.fallback {
            Some(error) => Err(error.clone()),
            None => Ok(CommittedVersion(format!("v{call}"))),
        }
    }
}

/// Reports every payload whose name is listed as already existing.
pub struct KnownNames(pub Vec<String>);

impl DuplicateChecker<Profile> for KnownNames {
    fn exists(&self, payload: &Profile) -> Result<bool, StoreError> {
        Ok(self.0.contains(&payload.name))
    }
}

/// Fails transiently `failures` times, then blocks inside `apply` until
/// released, announcing when it has been entered.
pub struct BlockingRepository {
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
    failures: AtomicU32,
}

impl BlockingRepository {
    pub fn new(entered: Sender<()>, release: Receiver<()>) -> Self {
        Self {
            entered: Mutex::new(entered),
            release: Mutex::new(release),
            failures: AtomicU32::new(0),
        }
    }
    pub fn set_failures(self, failures: u32) -> Self {
        self.failures.store(failures, Ordering::SeqCst);
        self
    }
}

impl RepositoryPort<Profile> for BlockingRepository {
    fn apply(&self, _: &MutationRequest<Profile>) -> Result<CommittedVersion, StoreError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Transient("connection reset".into()));
        }
        let _ = self.entered.lock().send(());
        let _ = self.release.lock().recv();
        Ok(CommittedVersion("blocked".into()))
    }
}

/// Defaults with test friendly delays.
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .set_base_delay(Duration::from_millis(10))
        .set_max_delay(Duration::from_millis(40))
}

pub fn engine(
    repository: Arc<dyn RepositoryPort<Profile>>,
    clock: Arc<ManualClock>,
) -> anyhow::Result<MutationEngine<Profile>> {
    Ok(MutationEngine::builder(repository)
        .set_config(test_config())
        .set_clock(clock)
        .build()?)
}
