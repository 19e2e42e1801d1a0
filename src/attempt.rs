//! The attempt state machine.
//!
//! One [`Attempt`] governs one try at processing one argument key. On entry
//! it reads the key's record and decides whether the processing step may
//! run; on exit it writes the outcome, state and timing back into the same
//! record. Every exit path writes timing, including an attempt dropped
//! mid-step (recorded as [`AttemptCanceled`]).
//!
//! ```text
//! new ──► attempting ──► completed
//!              │
//!              └──────► errored ──► attempting (retry)
//! ```

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Local, TimeDelta};
use opentelemetry::KeyValue;
use tracing::{Span, debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{ArgKey, AttemptRecord, ErrorDetail, State, fields};
use crate::store::LogStore;
use crate::telemetry::attempt::{record_state_transition, start_attempt_span};
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Step errors
// ---------------------------------------------------------------------------

/// Raised by a processing step to stop the whole batch, not just one attempt.
///
/// The attempt records it as `errored` like any failure, then hands it back
/// to the caller as [`Error::NonSuppressed`] regardless of the error policy.
#[derive(Debug)]
pub struct NonSuppressedError {
    message: String,
    wrapped: Option<anyhow::Error>,
}

impl NonSuppressedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            wrapped: None,
        }
    }

    /// Carry an inner error along for diagnostics.
    pub fn wrapping(message: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            message: message.into(),
            wrapped: Some(cause.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn wrapped(&self) -> Option<&anyhow::Error> {
        self.wrapped.as_ref()
    }
}

impl fmt::Display for NonSuppressedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.wrapped {
            Some(cause) => write!(f, "{}: {cause:#}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for NonSuppressedError {}

/// Recorded when an attempt is closed without an outcome.
#[derive(Debug, thiserror::Error)]
#[error("attempt closed before processing finished")]
pub struct AttemptCanceled;

/// Best-effort type name for `exc_type`, from the first recognised error in the chain.
pub fn error_type_name(err: &anyhow::Error) -> String {
    if err.is::<NonSuppressedError>() {
        return "NonSuppressedError".to_string();
    }
    if err.is::<AttemptCanceled>() {
        return "AttemptCanceled".to_string();
    }
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<std::io::Error>() {
            return format!("io::Error({:?})", e.kind());
        }
        if cause.is::<serde_json::Error>() {
            return "serde_json::Error".to_string();
        }
        if cause.is::<std::num::ParseIntError>() {
            return "ParseIntError".to_string();
        }
        if cause.is::<std::num::ParseFloatError>() {
            return "ParseFloatError".to_string();
        }
        if cause.is::<std::str::Utf8Error>() || cause.is::<std::string::FromUtf8Error>() {
            return "Utf8Error".to_string();
        }
    }
    "Error".to_string()
}

/// Everything recorded about a failed step.
pub fn error_detail(err: &anyhow::Error) -> ErrorDetail {
    ErrorDetail {
        exc_type: error_type_name(err),
        exc_value: err.to_string(),
        exc_traceback: format!("{err:?}"),
    }
}

// ---------------------------------------------------------------------------
// Entry / Exit / Outcome
// ---------------------------------------------------------------------------

/// Decision taken on entry, from the record's persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// `new` or `errored`: run the processing step.
    Proceed,
    /// `attempting`: another run holds this key, or crashed holding it.
    AlreadyInProgress,
    /// `completed`: nothing to do.
    PreviouslyCompleted,
}

impl Entry {
    fn from_state(state: State) -> Self {
        match state {
            State::New | State::Errored => Entry::Proceed,
            State::Attempting => Entry::AlreadyInProgress,
            State::Completed => Entry::PreviouslyCompleted,
        }
    }
}

/// How the attempt ended, before write-back.
enum Exit {
    Success,
    AlreadyInProgress,
    PreviouslyCompleted,
    Failed(anyhow::Error),
    NonSuppressed(anyhow::Error),
    Canceled,
}

fn classify(result: anyhow::Result<()>) -> Exit {
    match result {
        Ok(()) => Exit::Success,
        Err(err) if err.is::<NonSuppressedError>() => Exit::NonSuppressed(err),
        Err(err) => Exit::Failed(err),
    }
}

/// What an attempt did, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The step ran and returned normally.
    Completed,
    /// Skipped: the record was already `attempting`.
    SkippedInProgress,
    /// Skipped: the record was already `completed`.
    SkippedCompleted,
    /// The step failed (or was canceled); the failure is in the log.
    Errored(ErrorDetail),
}

impl Outcome {
    /// State left in the record.
    pub fn state(&self) -> State {
        match self {
            Outcome::Completed | Outcome::SkippedCompleted => State::Completed,
            Outcome::SkippedInProgress => State::Attempting,
            Outcome::Errored(_) => State::Errored,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Outcome::SkippedInProgress | Outcome::SkippedCompleted)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::SkippedInProgress => "skipped_in_progress",
            Outcome::SkippedCompleted => "skipped_completed",
            Outcome::Errored(_) => "errored",
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// What happens to ordinary step failures once they are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Record and carry on with the batch.
    #[default]
    Suppress,
    /// Record and return the failure to the caller.
    Propagate,
}

impl ErrorPolicy {
    pub fn from_suppress_flag(suppress: bool) -> Self {
        if suppress {
            ErrorPolicy::Suppress
        } else {
            ErrorPolicy::Propagate
        }
    }
}

// ---------------------------------------------------------------------------
// Attempt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Entered,
    Finished,
}

/// One processing attempt for one key, bound to an open [`LogStore`].
pub struct Attempt<'s> {
    store: &'s mut LogStore,
    key: ArgKey,
    policy: ErrorPolicy,
    checkpoint_on_entry: bool,
    started: DateTime<Local>,
    clock: Instant,
    span: Span,
    phase: Phase,
    entry: Option<Entry>,
}

impl<'s> Attempt<'s> {
    /// Start timing an attempt for `key`. The record is not touched until
    /// [`Attempt::enter`] (or [`Attempt::run`]).
    pub fn new(store: &'s mut LogStore, key: impl Into<ArgKey>) -> Self {
        let key = key.into();
        let span = start_attempt_span(&key);
        Self {
            store,
            key,
            policy: ErrorPolicy::default(),
            checkpoint_on_entry: false,
            started: Local::now(),
            clock: Instant::now(),
            span,
            phase: Phase::Pending,
            entry: None,
        }
    }

    pub fn policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Flush the whole store once the record is marked `attempting`, so a
    /// crash during the step leaves `attempting` on disk.
    pub fn checkpoint_on_entry(mut self, enabled: bool) -> Self {
        self.checkpoint_on_entry = enabled;
        self
    }

    pub fn key(&self) -> &ArgKey {
        &self.key
    }

    pub fn started(&self) -> DateTime<Local> {
        self.started
    }

    /// Current record for this key, if one exists.
    pub fn record(&self) -> Result<Option<&AttemptRecord>> {
        self.store.get(&self.key)
    }

    /// Read the persisted state and decide whether processing may run.
    ///
    /// Creates the record (state `new`) if the key was never attempted. On
    /// [`Entry::Proceed`] the record moves to `attempting`. A state outside
    /// the recognised set is [`Error::InvalidState`] and leaves the attempt
    /// unentered.
    ///
    /// Entering is done once per attempt; later calls return the first
    /// decision without reading the record again.
    pub fn enter(&mut self) -> Result<Entry> {
        if let Some(entry) = self.entry {
            return Ok(entry);
        }

        let record = self.store.get_or_create(&self.key)?;
        if !record.contains(fields::STATE) {
            record.set_state(State::New);
        }
        let state = record.state()?;
        let entry = Entry::from_state(state);

        if entry == Entry::Proceed {
            record.set_state(State::Attempting);
            record_state_transition(&self.span, state, State::Attempting);
        }
        self.phase = Phase::Entered;
        self.entry = Some(entry);

        if entry == Entry::Proceed && self.checkpoint_on_entry {
            self.store.flush()?;
        }
        debug!(key = %self.key, %state, ?entry, "attempt entered");
        Ok(entry)
    }

    /// Run `step` under this attempt and record how it went.
    ///
    /// Enters the attempt first unless [`Attempt::enter`] already did.
    ///
    /// The step receives the live record and may write its own fields
    /// (e.g. `results`); they persist because the outcome is written into
    /// the same record afterwards.
    ///
    /// Returns `Ok` for completed, skipped and suppressed-error attempts.
    /// Returns [`Error::NonSuppressed`] when the step raised
    /// [`NonSuppressedError`], and [`Error::Propagated`] for any other step
    /// failure under [`ErrorPolicy::Propagate`]. Both are recorded first.
    pub fn run<F>(mut self, step: F) -> Result<Outcome>
    where
        F: FnOnce(&mut AttemptRecord) -> anyhow::Result<()>,
    {
        let span = self.span.clone();
        let _entered = span.enter();

        let exit = match self.enter()? {
            Entry::Proceed => {
                let record = self.store.get_or_create(&self.key)?;
                classify(step(record))
            }
            Entry::AlreadyInProgress => Exit::AlreadyInProgress,
            Entry::PreviouslyCompleted => Exit::PreviouslyCompleted,
        };
        self.finish(exit)
    }

    /// Close the attempt as [`AttemptCanceled`].
    ///
    /// Used when the caller drove [`Attempt::enter`] itself and gives up
    /// before an outcome. Canceled attempts are recorded, never propagated.
    pub fn close(mut self) -> Result<Outcome> {
        self.finish(Exit::Canceled)
    }

    fn finish(&mut self, exit: Exit) -> Result<Outcome> {
        self.phase = Phase::Finished;

        let elapsed = TimeDelta::from_std(self.clock.elapsed()).unwrap_or(TimeDelta::zero());
        let stopped = self.started + elapsed;

        let record = self.store.get_or_create(&self.key)?;
        let from = record.state().unwrap_or(State::New);
        record.set_timing(self.started, stopped);

        let (result, to) = match exit {
            Exit::Success => {
                record.set_state(State::Completed);
                record.clear_error();
                (Ok(Outcome::Completed), State::Completed)
            }
            Exit::AlreadyInProgress => {
                record.set_state(State::Attempting);
                (Ok(Outcome::SkippedInProgress), State::Attempting)
            }
            Exit::PreviouslyCompleted => {
                record.set_state(State::Completed);
                (Ok(Outcome::SkippedCompleted), State::Completed)
            }
            Exit::NonSuppressed(cause) => {
                record.set_error(&error_detail(&cause));
                let err = Error::NonSuppressed {
                    key: self.key.clone(),
                    cause,
                };
                (Err(err), State::Errored)
            }
            Exit::Failed(cause) => {
                let detail = error_detail(&cause);
                record.set_error(&detail);
                let result = match self.policy {
                    ErrorPolicy::Suppress => Ok(Outcome::Errored(detail)),
                    ErrorPolicy::Propagate => Err(Error::Propagated {
                        key: self.key.clone(),
                        cause,
                    }),
                };
                (result, State::Errored)
            }
            Exit::Canceled => {
                let detail = canceled_detail();
                record.set_error(&detail);
                (Ok(Outcome::Errored(detail)), State::Errored)
            }
        };

        if from != to {
            record_state_transition(&self.span, from, to);
        }

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(Error::NonSuppressed { .. }) => "fatal",
            Err(_) => "errored",
        };
        metrics::attempts().add(1, &[KeyValue::new("outcome", label)]);
        metrics::attempt_duration_ms().record(
            elapsed.num_microseconds().unwrap_or(i64::MAX) as f64 / 1000.0,
            &[KeyValue::new("outcome", label)],
        );

        match &result {
            Ok(outcome) if outcome.is_skip() => {
                info!(key = %self.key, outcome = label, "attempt skipped")
            }
            Ok(Outcome::Errored(detail)) => {
                warn!(key = %self.key, exc_type = %detail.exc_type, error = %detail.exc_value, "attempt errored")
            }
            Ok(_) => info!(key = %self.key, outcome = label, "attempt finished"),
            Err(e) => warn!(key = %self.key, outcome = label, error = %e, "attempt failed"),
        }
        result
    }
}

fn canceled_detail() -> ErrorDetail {
    let trace = Backtrace::capture();
    ErrorDetail {
        exc_type: "AttemptCanceled".to_string(),
        exc_value: String::new(),
        exc_traceback: match trace.status() {
            BacktraceStatus::Captured => trace.to_string(),
            _ => String::new(),
        },
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if self.phase != Phase::Entered {
            return;
        }
        warn!(key = %self.key, panicking = std::thread::panicking(), "attempt dropped before finishing");
        if let Err(e) = self.finish(Exit::Canceled) {
            warn!(key = %self.key, error = %e, "failed to record canceled attempt");
        }
    }
}

impl fmt::Debug for Attempt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attempt")
            .field("key", &self.key)
            .field("policy", &self.policy)
            .field("started", &self.started)
            .field("phase", &self.phase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_separates_non_suppressed_errors() {
        assert!(matches!(classify(Ok(())), Exit::Success));
        assert!(matches!(
            classify(Err(anyhow::anyhow!("plain"))),
            Exit::Failed(_)
        ));
        assert!(matches!(
            classify(Err(NonSuppressedError::new("stop").into())),
            Exit::NonSuppressed(_)
        ));
        let wrapped: anyhow::Error = anyhow::Error::new(NonSuppressedError::new("stop"))
            .context("while importing");
        assert!(matches!(classify(Err(wrapped)), Exit::NonSuppressed(_)));
    }

    #[test]
    fn non_suppressed_display_appends_wrapped_cause() {
        let plain = NonSuppressedError::new("database offline");
        assert_eq!(plain.to_string(), "database offline");

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let wrapped = NonSuppressedError::wrapping("database offline", io);
        assert_eq!(wrapped.to_string(), "database offline: refused");
        assert!(wrapped.wrapped().is_some());
    }

    #[test]
    fn error_type_name_recognises_common_errors() {
        let io: anyhow::Error =
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(error_type_name(&io), "io::Error(NotFound)");

        let parse: anyhow::Error = "x".parse::<i32>().unwrap_err().into();
        assert_eq!(error_type_name(&parse.context("reading count")), "ParseIntError");

        assert_eq!(error_type_name(&anyhow::anyhow!("custom")), "Error");
        assert_eq!(
            error_type_name(&NonSuppressedError::new("x").into()),
            "NonSuppressedError"
        );
    }

    #[test]
    fn error_detail_captures_message_and_chain() {
        let err = anyhow::anyhow!("inner failure").context("outer step");
        let detail = error_detail(&err);
        assert_eq!(detail.exc_value, "outer step");
        assert!(detail.exc_traceback.contains("inner failure"));
    }

    #[test]
    fn outcome_reports_resulting_state() {
        assert_eq!(Outcome::Completed.state(), State::Completed);
        assert_eq!(Outcome::SkippedInProgress.state(), State::Attempting);
        assert!(Outcome::SkippedCompleted.is_skip());
        assert!(!Outcome::Completed.is_skip());
    }

    #[test]
    fn policy_from_flag() {
        assert_eq!(ErrorPolicy::from_suppress_flag(true), ErrorPolicy::Suppress);
        assert_eq!(ErrorPolicy::from_suppress_flag(false), ErrorPolicy::Propagate);
    }
}
