//! Log sessions: the window during which a log store is open for mutation.
//!
//! A session owns its [`LogStore`], hands out [`Attempt`]s bound to it, and
//! writes the store back to disk when it ends: on `close`, at the end of
//! [`Session::scope`] whether or not the body failed, or on drop.

use std::path::Path;

use serde_json::Value;
use tracing::{info, warn};

use crate::attempt::{Attempt, ErrorPolicy, Outcome};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{ArgKey, AttemptRecord, State};
use crate::store::LogStore;

/// Per-session attempt settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub policy: ErrorPolicy,
    pub checkpoint_on_entry: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            policy: ErrorPolicy::Suppress,
            checkpoint_on_entry: true,
        }
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            policy: ErrorPolicy::from_suppress_flag(config.suppress_errors),
            checkpoint_on_entry: config.checkpoint_on_entry,
        }
    }
}

/// An open (or openable) log plus the attempts issued against it.
#[derive(Debug)]
pub struct Session {
    store: LogStore,
    options: SessionOptions,
    attempts: Vec<ArgKey>,
}

impl Session {
    /// A closed session for the log at `path`.
    pub fn new(path: impl AsRef<Path>, options: SessionOptions) -> Self {
        Self {
            store: LogStore::new(path),
            options,
            attempts: Vec::new(),
        }
    }

    /// Open a session on the log at `path` with default options.
    pub fn open_session(path: impl AsRef<Path>) -> Result<Self> {
        let mut session = Self::new(path, SessionOptions::default());
        session.open()?;
        Ok(session)
    }

    /// Open the log at `path` for review. Nothing is ever written back, and a
    /// missing or malformed log is an error instead of being reinitialized.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            store: LogStore::open_read_only(path)?,
            options: SessionOptions::default(),
            attempts: Vec::new(),
        })
    }

    /// Open `path`, run `body`, then close the session even if `body` failed.
    ///
    /// The store is written back on every exit path. If both `body` and the
    /// final write fail, the body's error is returned and the write failure
    /// is logged.
    pub fn scope<T, E, F>(path: impl AsRef<Path>, options: SessionOptions, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Session) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let mut session = Self::new(path, options);
        session.open()?;
        let result = body(&mut session);
        let closed = session.close();
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!(error = %close_err, "failed to write log while unwinding session");
                Err(e)
            }
        }
    }

    pub fn open(&mut self) -> Result<()> {
        self.store.open()?;
        info!(path = %self.store.path().display(), "log session opened");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.store.is_open()
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::SessionNotOpen)
        }
    }

    /// A new attempt for `key`, bound to this session's store.
    ///
    /// The attempt borrows the session, so only one can be live at a time
    /// and the session cannot be closed underneath it.
    pub fn attempt(&mut self, key: impl Into<ArgKey>) -> Result<Attempt<'_>> {
        self.ensure_open()?;
        let key = key.into();
        self.attempts.push(key.clone());
        Ok(Attempt::new(&mut self.store, key)
            .policy(self.options.policy)
            .checkpoint_on_entry(self.options.checkpoint_on_entry))
    }

    /// Keys of every attempt issued by this session, in order.
    pub fn attempts(&self) -> &[ArgKey] {
        &self.attempts
    }

    /// Run one step for one key.
    pub fn call<F>(&mut self, key: impl Into<ArgKey>, step: F) -> Result<Outcome>
    where
        F: FnOnce(&mut AttemptRecord) -> anyhow::Result<()>,
    {
        self.attempt(key)?.run(step)
    }

    /// Drive one attempt per key, in order.
    ///
    /// `step` gets the key and its live record. Per-key failures are left in
    /// the log; the batch stops early only on an error that crosses the
    /// attempt boundary (non-suppressed, propagated, or misuse).
    pub fn run_batch<I, K, F>(&mut self, keys: I, mut step: F) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<ArgKey>,
        F: FnMut(&ArgKey, &mut AttemptRecord) -> anyhow::Result<()>,
    {
        for key in keys {
            let key = key.into();
            self.attempt(key.clone())?
                .run(|record| step(&key, record))?;
        }
        Ok(())
    }

    /// Force a record into `state`, e.g. to clear a stale `attempting` left by
    /// a crashed run. Error fields are dropped unless the new state is
    /// `errored`. Returns the previous state, or `None` if the key has no record.
    pub fn reset(&mut self, key: &ArgKey, state: State) -> Result<Option<State>> {
        self.ensure_open()?;
        let Some(record) = self.store.get_mut(key)? else {
            return Ok(None);
        };
        let previous = record.state().ok();
        record.set_state(state);
        if state != State::Errored {
            record.clear_error();
        }
        info!(%key, from = ?previous, to = %state, "record reset");
        Ok(previous)
    }

    /// Multi-line report of every record, for display only.
    pub fn summarize(&self) -> Result<String> {
        Ok(self
            .store
            .iter()?
            .map(|(key, record)| record.summary(key))
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    /// Values of `field` across all records that have it.
    pub fn pluck(&self, field: &str) -> Result<Vec<Value>> {
        Ok(self
            .store
            .values()?
            .filter_map(|record| record.get(field).cloned())
            .collect())
    }

    /// Write the store without ending the session.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.store.flush()
    }

    /// Write the store to disk and end the session.
    pub fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.store.close()?;
        info!(
            path = %self.store.path().display(),
            attempts = self.attempts.len(),
            "log session closed"
        );
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                warn!(path = %self.store.path().display(), error = %e, "failed to write log on drop");
            }
        }
    }
}
