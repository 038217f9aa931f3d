mod common;

use anyhow::Context;
use common::*;
use mutation_approval::{
    CancelAck, ErrorKind, MutationEngine, MutationState, Submission,
    clock::{Clock, ManualClock},
    error::StoreError,
    store::SledStore,
};
use sled::open;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use tempfile::tempdir; // Use for test db cleanup.

fn sled_engine(
    db_name: &str,
    clock: Arc<ManualClock>,
) -> anyhow::Result<(tempfile::TempDir, Arc<SledStore>, MutationEngine<Profile>)> {
    // sled locks its files, so every test gets its own database under a temp dir.
    let temp_dir = tempdir()?;
    let db = open(temp_dir.path().join(db_name))?;
    let store = Arc::new(SledStore::new(Arc::new(db)));

    let engine = MutationEngine::<Profile>::builder(store.clone())
        .set_duplicate_checker(store.clone())
        .set_validator(Arc::new(profile_rules))
        .set_config(test_config())
        .set_clock(clock)
        .build()?;

    Ok((temp_dir, store, engine))
}

#[test]
fn submit_and_confirm_profile() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::default());
    let (_dir, store, engine) = sled_engine("submit_and_confirm.db", clock)?;

    let submission = engine.submit(request("P1", "A"));
    let token = submission
        .token()
        .cloned()
        .context("submission was refused")?;

    assert_eq!(engine.status("P1"), MutationState::PendingConfirmation);
    // nothing is persisted before confirmation
    assert!(store.current("P1")?.is_none());

    let result = engine.confirm_submission(&token);

    assert!(result.is_success(), "{}", result.message());
    assert_eq!(engine.status("P1"), MutationState::Succeeded);

    let record = store.current("P1")?.context("record not stored")?;
    assert_eq!(Some(&record.version), result.committed_version());
    assert_eq!(store.history("P1")?.len(), 1);

    Ok(())
}

#[test]
fn transient_failures_then_success() -> anyhow::Result<()> {
    let repo = Arc::new(ScriptedRepository::failing_first(vec![
        StoreError::Transient("connection reset".into()),
        StoreError::Transient("connection reset".into()),
    ]));
    let clock = Arc::new(ManualClock::default());
    let engine = engine(repo.clone(), clock.clone())?;

    let token = engine
        .submit(request("P1", "A"))
        .token()
        .cloned()
        .context("submission was refused")?;
    let result = engine.confirm_submission(&token);

    assert!(result.is_success());
    assert_eq!(repo.calls(), 3);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(10), Duration::from_millis(20)]
    );
    Ok(())
}

#[test]
fn connection_stays_down() -> anyhow::Result<()> {
    let repo = Arc::new(ScriptedRepository::always(StoreError::Transient(
        "server unreachable".into(),
    )));
    let engine = engine(repo.clone(), Arc::new(ManualClock::default()))?;

    let token = engine
        .submit(request("P1", "A"))
        .token()
        .cloned()
        .context("submission was refused")?;
    let result = engine.confirm_submission(&token);

    assert!(!result.is_success());
    assert_eq!(result.error_kind(), Some(ErrorKind::ConnectionInterrupted));
    assert_eq!(repo.calls(), 3);
    assert_eq!(engine.status("P1"), MutationState::Failed);

    // the key is free again for a fresh attempt with different data
    assert!(engine.submit(request("P1", "B")).is_pending());
    Ok(())
}

#[test]
fn terminal_failure_is_not_retried() -> anyhow::Result<()> {
    let repo = Arc::new(ScriptedRepository::always(StoreError::terminal(
        ErrorKind::Conflict,
        "version mismatch",
    )));
    let engine = engine(repo.clone(), Arc::new(ManualClock::default()))?;

    let token = engine
        .submit(request("P1", "A"))
        .token()
        .cloned()
        .context("submission was refused")?;
    let result = engine.confirm_submission(&token);

    assert_eq!(result.error_kind(), Some(ErrorKind::Conflict));
    assert_eq!(repo.calls(), 1);
    Ok(())
}

#[test]
fn second_submit_while_pending() -> anyhow::Result<()> {
    let engine = engine(
        Arc::new(ScriptedRepository::succeeding()),
        Arc::new(ManualClock::default()),
    )?;

    let first = engine.submit(request("P1", "A"));
    let same = engine.submit(request("P1", "A"));
    let different = engine.submit(request("P1", "B"));

    assert!(first.is_pending());
    assert_eq!(same.error_kind(), Some(ErrorKind::AlreadyPending));
    assert_eq!(different.error_kind(), Some(ErrorKind::AlreadyPending));
    // the caller can pick up the confirmation that is already open
    assert_eq!(
        engine.pending_for("P1").map(|ack| ack.token),
        first.token().cloned()
    );
    Ok(())
}

#[test]
fn cancel_leaves_no_trace() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::default());
    let (_dir, store, engine) = sled_engine("cancel.db", clock)?;

    let token = engine
        .submit(request("P1", "A"))
        .token()
        .cloned()
        .context("submission was refused")?;

    assert_eq!(engine.cancel_submission(&token), CancelAck::Cancelled);
    assert_eq!(engine.status("P1"), MutationState::Cancelled);
    assert_eq!(engine.cancel_submission(&token), CancelAck::AlreadyResolved);

    let result = engine.confirm_submission(&token);
    assert_eq!(result.error_kind(), Some(ErrorKind::NotFound));
    assert!(store.history("P1")?.is_empty());

    // cancelling does not start a cooldown
    assert!(engine.submit(request("P1", "A")).is_pending());
    Ok(())
}

#[test]
fn confirm_after_expiry() -> anyhow::Result<()> {
    let repo = Arc::new(ScriptedRepository::succeeding());
    let clock = Arc::new(ManualClock::default());
    let engine = engine(repo.clone(), clock.clone())?;

    let token = engine
        .submit(request("P1", "A"))
        .token()
        .cloned()
        .context("submission was refused")?;
    clock.advance(Duration::from_secs(5 * 60));

    assert_eq!(engine.status("P1"), MutationState::Expired);
    let result = engine.confirm_submission(&token);

    assert_eq!(result.error_kind(), Some(ErrorKind::Expired));
    assert_eq!(repo.calls(), 0);
    assert_eq!(engine.status("P1"), MutationState::Expired);
    Ok(())
}

#[test]
fn swept_token_still_reports_expiry() -> anyhow::Result<()> {
    let repo = Arc::new(ScriptedRepository::succeeding());
    let clock = Arc::new(ManualClock::default());
    let engine = engine(repo.clone(), clock.clone())?;

    let token = engine
        .submit(request("P1", "A"))
        .token()
        .cloned()
        .context("submission was refused")?;
    clock.advance(Duration::from_secs(6 * 60));

    assert_eq!(engine.sweep_expired(), 1);
    assert!(engine.pending_for("P1").is_none());
    assert_eq!(
        engine.confirm_submission(&token).error_kind(),
        Some(ErrorKind::Expired)
    );
    assert_eq!(repo.calls(), 0);
    Ok(())
}

#[test]
fn resubmission_cooldown() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::default());
    let engine = engine(Arc::new(ScriptedRepository::succeeding()), clock.clone())?;

    let token = engine
        .submit(request("P1", "A"))
        .token()
        .cloned()
        .context("submission was refused")?;
    assert!(engine.confirm_submission(&token).is_success());

    clock.advance(Duration::from_secs(1));
    let too_soon = engine.submit(request("P1", "A"));
    assert_eq!(too_soon.error_kind(), Some(ErrorKind::TooSoon));
    // a refused submission does not disturb the key's state
    assert_eq!(engine.status("P1"), MutationState::Succeeded);

    clock.advance(Duration::from_secs(1));
    assert!(engine.submit(request("P1", "A")).is_pending());
    Ok(())
}

#[test]
fn duplicate_record_is_rejected() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::default());
    let (_dir, _store, engine) = sled_engine("duplicate.db", clock)?;

    let token = engine
        .submit(request("H1", "Duomo"))
        .token()
        .cloned()
        .context("submission was refused")?;
    assert!(engine.confirm_submission(&token).is_success());

    let duplicate = engine.submit(request("H2", "Duomo"));

    assert_eq!(duplicate.error_kind(), Some(ErrorKind::Duplicate));
    assert_eq!(engine.status("H2"), MutationState::DuplicateRejected);
    Ok(())
}

#[test]
fn invalid_fields_are_aggregated() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::default());
    let (_dir, _store, engine) = sled_engine("validation.db", clock)?;

    let invalid = mutation_approval::MutationRequest::new(
        "P1",
        Profile {
            name: " ".into(),
            city: String::new(),
        },
        "user_1",
    );
    let submission = engine.submit(invalid);

    let Submission::Refused(result) = submission else {
        anyhow::bail!("invalid profile was accepted");
    };
    assert_eq!(result.error_kind(), Some(ErrorKind::Validation));
    assert_eq!(result.field_errors().len(), 2);
    assert_eq!(engine.status("P1"), MutationState::Rejected);

    // corrected data goes straight through
    assert!(engine.submit(request("P1", "A")).is_pending());
    Ok(())
}

#[test]
fn concurrent_submit_storm_opens_one_confirmation() -> anyhow::Result<()> {
    let engine = engine(
        Arc::new(ScriptedRepository::succeeding()),
        Arc::new(ManualClock::default()),
    )?;
    let callers = 16;

    let submissions: Vec<Submission> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..callers)
            .map(|i| {
                let engine = &engine;
                scope.spawn(move || engine.submit(request("P1", &format!("name {i}"))))
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .collect()
    });

    assert_eq!(submissions.len(), callers);
    assert_eq!(submissions.iter().filter(|s| s.is_pending()).count(), 1);
    assert_eq!(
        submissions
            .iter()
            .filter(|s| s.error_kind() == Some(ErrorKind::AlreadyPending))
            .count(),
        callers - 1
    );
    Ok(())
}

#[test]
fn different_keys_do_not_interfere() -> anyhow::Result<()> {
    let engine = engine(
        Arc::new(ScriptedRepository::succeeding()),
        Arc::new(ManualClock::default()),
    )?;

    let submissions: Vec<Submission> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = &engine;
                scope.spawn(move || engine.submit(request(&format!("P{i}"), "A")))
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .collect()
    });

    assert!(submissions.iter().all(Submission::is_pending));
    Ok(())
}

#[test]
fn key_is_free_while_commit_is_in_flight() -> anyhow::Result<()> {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let repo = Arc::new(BlockingRepository::new(entered_tx, release_rx));
    let engine = engine(repo, Arc::new(ManualClock::default()))?;

    let token = engine
        .submit(request("P1", "A"))
        .token()
        .cloned()
        .context("submission was refused")?;

    std::thread::scope(|scope| -> anyhow::Result<()> {
        let confirming = scope.spawn(|| engine.confirm_submission(&token));
        entered_rx.recv_timeout(Duration::from_secs(5))?;

        assert_eq!(engine.status("P1"), MutationState::Committing);
        let fresh = engine.submit(request("P1", "B"));
        assert!(fresh.is_pending());

        release_tx.send(())?;
        let result = confirming
            .join()
            .map_err(|_| anyhow::anyhow!("confirm thread panicked"))?;
        assert!(result.is_success());

        // the fresh submission keeps its own state
        assert_eq!(engine.status("P1"), MutationState::PendingConfirmation);
        Ok(())
    })
}

#[test]
fn background_sweeper_expires_entries() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::default());
    let engine = Arc::new(engine(
        Arc::new(ScriptedRepository::succeeding()),
        clock.clone(),
    )?);

    let token = engine
        .submit(request("P1", "A"))
        .token()
        .cloned()
        .context("submission was refused")?;
    let sweeper = engine.spawn_sweeper(Duration::from_millis(5))?;
    clock.advance(Duration::from_secs(301));

    let mut swept = false;
    for _ in 0..400 {
        if engine.pending_for("P1").is_none() {
            swept = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    sweeper.stop();

    assert!(swept, "sweeper never evicted the expired entry");
    assert_eq!(engine.status("P1"), MutationState::Expired);
    assert_eq!(
        engine.confirm_submission(&token).error_kind(),
        Some(ErrorKind::Expired)
    );
    Ok(())
}

#[test]
fn known_name_is_a_duplicate() -> anyhow::Result<()> {
    let repo = Arc::new(ScriptedRepository::succeeding());
    let engine = MutationEngine::<Profile>::builder(repo.clone())
        .set_duplicate_checker(Arc::new(KnownNames(vec!["Anna".into()])))
        .set_config(test_config())
        .set_clock(Arc::new(ManualClock::default()))
        .build()?;

    assert_eq!(
        engine.submit(request("P1", "Anna")).error_kind(),
        Some(ErrorKind::Duplicate)
    );
    assert!(engine.submit(request("P1", "Bruno")).is_pending());
    assert_eq!(repo.calls(), 0);
    Ok(())
}

struct Unreachable;

impl mutation_approval::ports::DuplicateChecker<Profile> for Unreachable {
    fn exists(&self, _: &Profile) -> Result<bool, StoreError> {
        Err(StoreError::Transient("lookup timed out".into()))
    }
}

#[test]
fn duplicate_lookup_failure_is_reported() -> anyhow::Result<()> {
    let engine = MutationEngine::<Profile>::builder(Arc::new(ScriptedRepository::succeeding()))
        .set_duplicate_checker(Arc::new(Unreachable))
        .set_config(test_config())
        .set_clock(Arc::new(ManualClock::default()))
        .build()?;

    let submission = engine.submit(request("P1", "Anna"));

    assert_eq!(
        submission.error_kind(),
        Some(ErrorKind::ConnectionInterrupted)
    );
    assert!(engine.pending_for("P1").is_none());
    assert_eq!(engine.status("P1"), MutationState::Idle);
    Ok(())
}

#[test]
fn lapsed_confirmation_frees_the_key_without_a_sweeper() -> anyhow::Result<()> {
    let repo = Arc::new(ScriptedRepository::succeeding());
    let clock = Arc::new(ManualClock::default());
    let engine = engine(repo.clone(), clock.clone())?;

    let stale = engine
        .submit(request("P1", "A"))
        .token()
        .cloned()
        .context("submission was refused")?;
    clock.advance(Duration::from_secs(3600));
    assert_eq!(engine.status("P1"), MutationState::Expired);

    let fresh = engine.submit(request("P1", "B"));

    assert!(fresh.is_pending(), "{:?}", fresh.error_kind());
    assert_eq!(
        engine.pending_for("P1").map(|ack| ack.token),
        fresh.token().cloned()
    );
    assert_eq!(
        engine.confirm_submission(&stale).error_kind(),
        Some(ErrorKind::Expired)
    );
    assert_eq!(repo.calls(), 0);
    Ok(())
}

#[test]
fn refused_submission_keeps_the_cooldown() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::default());
    let (_dir, _store, engine) = sled_engine("cooldown_kept.db", clock.clone())?;

    let token = engine
        .submit(request("P1", "A"))
        .token()
        .cloned()
        .context("submission was refused")?;
    assert!(engine.confirm_submission(&token).is_success());

    clock.advance(Duration::from_millis(100));
    assert_eq!(
        engine.submit(request("P1", "")).error_kind(),
        Some(ErrorKind::Validation)
    );

    clock.advance(Duration::from_millis(100));
    let again = engine.submit(request("P1", "A"));

    assert_eq!(again.error_kind(), Some(ErrorKind::TooSoon));
    assert_eq!(engine.status("P1"), MutationState::Rejected);
    Ok(())
}

#[test]
fn retrying_is_visible_while_the_retry_runs() -> anyhow::Result<()> {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let repo = Arc::new(BlockingRepository::new(entered_tx, release_rx).set_failures(1));
    let engine = engine(repo, Arc::new(ManualClock::default()))?;

    let token = engine
        .submit(request("P1", "A"))
        .token()
        .cloned()
        .context("submission was refused")?;

    std::thread::scope(|scope| -> anyhow::Result<()> {
        let confirming = scope.spawn(|| engine.confirm_submission(&token));
        let entered = entered_rx.recv_timeout(Duration::from_secs(5));
        let observed = engine.status("P1");
        release_tx.send(())?;

        let result = confirming
            .join()
            .map_err(|_| anyhow::anyhow!("confirm thread panicked"))?;
        entered?;
        assert_eq!(observed, MutationState::Retrying { attempt: 2 });
        assert!(result.is_success());
        assert_eq!(engine.status("P1"), MutationState::Succeeded);
        Ok(())
    })
}

#[test]
fn evicted_status_is_restored_by_the_commit() -> anyhow::Result<()> {
    let repo = Arc::new(ScriptedRepository::succeeding());
    let engine = MutationEngine::<Profile>::builder(repo)
        .set_config(test_config().set_guard_history_capacity(1))
        .set_clock(Arc::new(ManualClock::default()))
        .build()?;

    let token = engine
        .submit(request("P1", "A"))
        .token()
        .cloned()
        .context("submission was refused")?;
    // the board only holds one key, so P2 pushes P1 out
    assert!(engine.submit(request("P2", "A")).is_pending());
    assert_eq!(engine.status("P1"), MutationState::PendingConfirmation);

    assert!(engine.confirm_submission(&token).is_success());

    assert_eq!(engine.status("P1"), MutationState::Succeeded);
    Ok(())
}

/// Clock that panics once tripped, taking down whichever thread reads it.
struct TrippingClock {
    inner: ManualClock,
    tripped: std::sync::atomic::AtomicBool,
}

impl Clock for TrippingClock {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        if self.tripped.load(std::sync::atomic::Ordering::SeqCst) {
            panic!("clock tripped");
        }
        self.inner.now()
    }
    fn sleep(&self, duration: Duration) {
        self.inner.sleep(duration);
    }
}

#[test]
fn stopping_a_crashed_sweeper_returns() -> anyhow::Result<()> {
    let clock = Arc::new(TrippingClock {
        inner: ManualClock::default(),
        tripped: std::sync::atomic::AtomicBool::new(false),
    });
    let engine = Arc::new(
        MutationEngine::<Profile>::builder(Arc::new(ScriptedRepository::succeeding()))
            .set_config(test_config())
            .set_clock(clock.clone())
            .build()?,
    );

    let sweeper = engine.spawn_sweeper(Duration::from_millis(5))?;
    clock
        .tripped
        .store(true, std::sync::atomic::Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));

    // the sweeper thread has died on the clock; joining it must not panic here
    sweeper.stop();
    Ok(())
}
