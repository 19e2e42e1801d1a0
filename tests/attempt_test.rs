//! Integration tests for the attempt state machine.

use std::cell::Cell;

use serde_json::Value;
use task_logger::model::fields;
use task_logger::{
    ArgKey, Attempt, AttemptRecord, Entry, Error, ErrorPolicy, LogStore, NonSuppressedError,
    Outcome, State,
};

fn store_with(path: &std::path::Path, key: &ArgKey, state: &str) -> LogStore {
    let mut store = LogStore::open_at(path).unwrap();
    let mut record = AttemptRecord::new();
    record.set(fields::STATE, state);
    store.insert(key.clone(), record).unwrap();
    store
}

fn on_disk_state(path: &std::path::Path, key: &ArgKey) -> Option<String> {
    let store = LogStore::open_at(path).unwrap();
    store
        .get(key)
        .unwrap()
        .and_then(|r| r.state_raw().map(str::to_string))
}

/// `started`, `stopped` and `elapsed` are present and `stopped >= started`.
fn assert_timed(record: &AttemptRecord) {
    let started = record.get_str(fields::STARTED).expect("started");
    let stopped = record.get_str(fields::STOPPED).expect("stopped");
    assert!(started <= stopped, "{started} > {stopped}");
    assert!(record.get_str(fields::ELAPSED).is_some());
}

#[test]
fn successful_step_completes_and_records_timing() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = LogStore::open_at(dir.path().join("log.json")).unwrap();
    let key = ArgKey::from("a.sdf");

    let outcome = Attempt::new(&mut store, key.clone())
        .run(|record| {
            record.set(fields::RESULTS, "12 molecules");
            Ok(())
        })
        .unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let record = store.get(&key).unwrap().unwrap();
    assert_eq!(record.state().unwrap(), State::Completed);
    assert_eq!(record.get_str(fields::RESULTS), Some("12 molecules"));
    assert_timed(record);
    assert!(record.get_str(fields::ELAPSED).unwrap().starts_with("0:00:0"));
    assert!(!record.contains(fields::EXC_TYPE));
}

#[test]
fn completed_record_is_skipped_without_running() {
    let dir = tempfile::tempdir().unwrap();
    let key = ArgKey::from("done");
    let mut store = store_with(&dir.path().join("log.json"), &key, "completed");

    let ran = Cell::new(false);
    let outcome = Attempt::new(&mut store, key.clone())
        .run(|_| {
            ran.set(true);
            Ok(())
        })
        .unwrap();

    assert_eq!(outcome, Outcome::SkippedCompleted);
    assert!(!ran.get());
    let record = store.get(&key).unwrap().unwrap();
    assert_eq!(record.state().unwrap(), State::Completed);
    assert_timed(record);
}

#[test]
fn stale_attempting_record_blocks_reentry() {
    let dir = tempfile::tempdir().unwrap();
    let key = ArgKey::from("crashed");
    let mut store = store_with(&dir.path().join("log.json"), &key, "attempting");

    let ran = Cell::new(false);
    let outcome = Attempt::new(&mut store, key.clone())
        .run(|_| {
            ran.set(true);
            Ok(())
        })
        .unwrap();

    assert_eq!(outcome, Outcome::SkippedInProgress);
    assert!(!ran.get());
    let record = store.get(&key).unwrap().unwrap();
    assert_eq!(record.state().unwrap(), State::Attempting);
    assert_timed(record);
}

#[test]
fn errored_record_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let key = ArgKey::from("flaky");
    let mut store = store_with(&dir.path().join("log.json"), &key, "errored");

    let outcome = Attempt::new(&mut store, key.clone()).run(|_| Ok(())).unwrap();
    assert_eq!(outcome, Outcome::Completed);
}

#[test]
fn successful_retry_clears_the_previous_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = LogStore::open_at(dir.path().join("log.json")).unwrap();
    let key = ArgKey::from("flaky");

    Attempt::new(&mut store, key.clone())
        .run(|_| anyhow::bail!("boom"))
        .unwrap();
    assert!(store.get(&key).unwrap().unwrap().contains(fields::EXC_TYPE));

    Attempt::new(&mut store, key.clone()).run(|_| Ok(())).unwrap();
    let record = store.get(&key).unwrap().unwrap();
    assert_eq!(record.state().unwrap(), State::Completed);
    assert!(record.error_detail().is_none());
    assert!(!record.contains(fields::EXC_VALUE));
    assert!(!record.summary(&key).contains("boom"));
}

#[test]
fn suppressed_failure_is_recorded_and_returned_as_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = LogStore::open_at(dir.path().join("log.json")).unwrap();
    let key = ArgKey::from(["b.sdf", "strict"]);

    let outcome = Attempt::new(&mut store, key.clone())
        .run(|_| {
            let count: i32 = "twelve".parse()?;
            let _ = count;
            Ok(())
        })
        .unwrap();

    let Outcome::Errored(detail) = outcome else {
        panic!("expected errored outcome");
    };
    assert_eq!(detail.exc_type, "ParseIntError");

    let record = store.get(&key).unwrap().unwrap();
    assert_eq!(record.state().unwrap(), State::Errored);
    assert_eq!(record.get_str(fields::EXC_TYPE), Some("ParseIntError"));
    assert_eq!(record.get_str(fields::EXC_VALUE), Some(detail.exc_value.as_str()));
    assert!(record.contains(fields::EXC_TRACEBACK));
    assert_timed(record);
}

#[test]
fn propagate_policy_returns_the_failure_after_recording_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = LogStore::open_at(dir.path().join("log.json")).unwrap();
    let key = ArgKey::from("c.sdf");

    let err = Attempt::new(&mut store, key.clone())
        .policy(ErrorPolicy::Propagate)
        .run(|_| anyhow::bail!("bad header"))
        .unwrap_err();

    assert!(matches!(err, Error::Propagated { key: ref k, .. } if k == &key));
    let record = store.get(&key).unwrap().unwrap();
    assert_eq!(record.state().unwrap(), State::Errored);
    assert_eq!(record.get_str(fields::EXC_VALUE), Some("bad header"));
    assert_timed(record);
}

#[test]
fn non_suppressed_error_escapes_even_when_suppressing() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = LogStore::open_at(dir.path().join("log.json")).unwrap();
    let key = ArgKey::from("d.sdf");

    let err = Attempt::new(&mut store, key.clone())
        .policy(ErrorPolicy::Suppress)
        .run(|_| Err(NonSuppressedError::new("disk full").into()))
        .unwrap_err();

    assert!(matches!(err, Error::NonSuppressed { .. }));
    let record = store.get(&key).unwrap().unwrap();
    assert_eq!(record.state().unwrap(), State::Errored);
    assert_eq!(record.get_str(fields::EXC_TYPE), Some("NonSuppressedError"));
    assert_timed(record);
}

#[test]
fn unrecognised_state_fails_without_running_or_rewriting() {
    let dir = tempfile::tempdir().unwrap();
    let key = ArgKey::from("weird");
    let mut store = store_with(&dir.path().join("log.json"), &key, "paused");

    let ran = Cell::new(false);
    let err = Attempt::new(&mut store, key.clone())
        .run(|_| {
            ran.set(true);
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err, Error::InvalidState(ref s) if s == "paused"));
    assert!(!ran.get());
    let record = store.get(&key).unwrap().unwrap();
    assert_eq!(record.state_raw(), Some("paused"));
    assert!(!record.contains(fields::STOPPED));
}

#[test]
fn state_aliases_are_accepted_on_entry() {
    let dir = tempfile::tempdir().unwrap();
    let key = ArgKey::from("legacy");
    let mut store = store_with(&dir.path().join("log.json"), &key, "Done");

    let outcome = Attempt::new(&mut store, key.clone()).run(|_| Ok(())).unwrap();
    assert_eq!(outcome, Outcome::SkippedCompleted);
    assert_eq!(store.get(&key).unwrap().unwrap().state_raw(), Some("completed"));
}

#[test]
fn checkpoint_on_entry_leaves_attempting_on_disk_during_the_step() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.json");
    let mut store = LogStore::open_at(&path).unwrap();
    let key = ArgKey::from("long-job");

    let seen = Attempt::new(&mut store, key.clone())
        .checkpoint_on_entry(true)
        .run(|_| {
            assert_eq!(on_disk_state(&path, &key).as_deref(), Some("attempting"));
            Ok(())
        });
    assert_eq!(seen.unwrap(), Outcome::Completed);
}

#[test]
fn without_checkpoint_nothing_is_written_until_flush() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.json");
    let mut store = LogStore::open_at(&path).unwrap();
    let key = ArgKey::from("quiet");

    Attempt::new(&mut store, key.clone())
        .checkpoint_on_entry(false)
        .run(|_| {
            assert_eq!(on_disk_state(&path, &key), None);
            Ok(())
        })
        .unwrap();
}

#[test]
fn dropping_an_entered_attempt_records_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = LogStore::open_at(dir.path().join("log.json")).unwrap();
    let key = ArgKey::from("abandoned");

    {
        let mut attempt = Attempt::new(&mut store, key.clone());
        assert_eq!(attempt.enter().unwrap(), Entry::Proceed);
        assert_eq!(
            attempt.record().unwrap().unwrap().state().unwrap(),
            State::Attempting
        );
    }

    let record = store.get(&key).unwrap().unwrap();
    assert_eq!(record.state().unwrap(), State::Errored);
    assert_eq!(record.get_str(fields::EXC_TYPE), Some("AttemptCanceled"));
    assert_timed(record);
}

#[test]
fn run_after_enter_reuses_the_entry_decision() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.json");
    let mut store = LogStore::open_at(&path).unwrap();
    let key = ArgKey::from("entered-first");

    let ran = Cell::new(false);
    let mut attempt = Attempt::new(&mut store, key.clone()).checkpoint_on_entry(true);
    assert_eq!(attempt.enter().unwrap(), Entry::Proceed);
    assert_eq!(attempt.enter().unwrap(), Entry::Proceed);
    let outcome = attempt
        .run(|_| {
            ran.set(true);
            Ok(())
        })
        .unwrap();

    assert_eq!(outcome, Outcome::Completed);
    assert!(ran.get());
    store.close().unwrap();
    assert_eq!(on_disk_state(&path, &key).as_deref(), Some("completed"));
}

#[test]
fn explicit_close_records_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = LogStore::open_at(dir.path().join("log.json")).unwrap();
    let key = ArgKey::from("closed-early");

    let mut attempt = Attempt::new(&mut store, key.clone());
    attempt.enter().unwrap();
    let outcome = attempt.close().unwrap();
    assert!(matches!(outcome, Outcome::Errored(ref d) if d.exc_type == "AttemptCanceled"));
}

#[test]
fn dropping_an_unentered_attempt_leaves_no_record() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = LogStore::open_at(dir.path().join("log.json")).unwrap();
    let key = ArgKey::from("never-entered");

    drop(Attempt::new(&mut store, key.clone()));
    assert!(store.get(&key).unwrap().is_none());
}

#[test]
fn step_results_persist_through_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.json");
    let key = ArgKey::from("counted");

    let mut store = LogStore::open_at(&path).unwrap();
    Attempt::new(&mut store, key.clone())
        .run(|record| {
            record.set(fields::RESULTS, 3);
            Ok(())
        })
        .unwrap();
    store.close().unwrap();

    let store = LogStore::open_at(&path).unwrap();
    let record = store.get(&key).unwrap().unwrap();
    assert_eq!(record.get(fields::RESULTS), Some(&Value::String("3".into())));
}
