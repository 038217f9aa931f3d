//! Walkthrough of the engine over a local sled database.
//!
//! Run with `RUST_LOG=debug cargo run --example sled` to see the store's logs.
//! An optional `mutation.toml` in the working directory overrides the defaults.
use mutation_approval::{
    EngineConfig, FieldError, MutationEngine, MutationRequest, Submission, store::SledStore,
};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// a point of interest in a tourist guide
#[derive(Debug, Clone, minicbor::Encode, minicbor::Decode)]
struct Landmark {
    #[n(0)]
    name: String,
    #[n(1)]
    city: String,
    #[n(2)]
    year_built: Option<u16>,
}

impl Landmark {
    fn new(name: &str, city: &str) -> Self {
        Self {
            name: name.to_string(),
            city: city.to_string(),
            year_built: None,
        }
    }
    fn set_year_built(mut self, year: u16) -> Self {
        self.year_built = Some(year);
        self
    }
}

fn landmark_rules(landmark: &Landmark) -> Vec<FieldError> {
    let mut errors = vec![];
    if landmark.name.trim().is_empty() {
        errors.push(FieldError::new("name", "must not be empty"));
    }
    if landmark.city.trim().is_empty() {
        errors.push(FieldError::new("city", "must not be empty"));
    }
    if landmark.year_built.is_some_and(|year| year > 2100) {
        errors.push(FieldError::new("year_built", "is in the future"));
    }
    errors
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::load(Path::new("mutation.toml"));
    let temp_dir = tempfile::tempdir()?;
    let db = sled::open(temp_dir.path().join("landmarks.db"))?;
    let store = Arc::new(SledStore::new(Arc::new(db)));

    let engine = Arc::new(
        MutationEngine::<Landmark>::builder(store.clone())
            .set_duplicate_checker(store.clone())
            .set_validator(Arc::new(landmark_rules))
            .set_config(config.clone())
            .build()?,
    );
    let _sweeper = engine.spawn_sweeper(config.sweep_interval)?;

    // 1. invalid data is refused with every problem listed
    let invalid = MutationRequest::new(
        "L1",
        Landmark::new("", "").set_year_built(3000),
        "editor_1",
    );
    if let Submission::Refused(result) = engine.submit(invalid) {
        println!("refused: {}", result.message());
    }

    // 2. a valid change waits for confirmation, then commits
    let duomo = MutationRequest::new(
        "L1",
        Landmark::new("Duomo", "Salerno").set_year_built(1084),
        "editor_1",
    );
    let submission = engine.submit(duomo);
    let Some(token) = submission.token().cloned() else {
        anyhow::bail!("submission refused: {:?}", submission.refusal());
    };
    println!("pending: {token} ({:?})", engine.status("L1"));

    // a second submission for the same landmark is refused while one is open
    let again = engine.submit(MutationRequest::new(
        "L1",
        Landmark::new("Duomo", "Salerno"),
        "editor_2",
    ));
    println!("second submission: {:?}", again.error_kind());

    let result = engine.confirm_submission(&token);
    println!("confirmed: {} ({:?})", result.message(), engine.status("L1"));

    // 3. the same landmark under another key is a duplicate
    let duplicate = MutationRequest::new(
        "L2",
        Landmark::new("Duomo", "Salerno").set_year_built(1084),
        "editor_3",
    );
    println!("duplicate: {:?}", engine.submit(duplicate).error_kind());

    // 4. a cancelled change is never written
    let castle = MutationRequest::new(
        "L3",
        Landmark::new("Castello di Arechi", "Salerno"),
        "editor_1",
    );
    if let Some(token) = engine.submit(castle).token() {
        println!("cancel: {:?}", engine.cancel_submission(token));
        let late = engine.confirm_submission(token);
        println!("confirm after cancel: {:?}", late.error_kind());
    }

    store.view_history("L1")?;
    println!("L3 commits: {}", store.history("L3")?.len());

    Ok(())
}
