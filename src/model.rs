//! Core data model.
//!
//! An argument key names one unit of work. Each key owns at most one attempt
//! record in the log; the record's `state` field drives the attempt state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, TimeDelta};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Record field names written by the state machine.
pub mod fields {
    pub const STATE: &str = "state";
    pub const STARTED: &str = "started";
    pub const STOPPED: &str = "stopped";
    pub const ELAPSED: &str = "elapsed";
    pub const EXC_TYPE: &str = "exc_type";
    pub const EXC_VALUE: &str = "exc_value";
    pub const EXC_TRACEBACK: &str = "exc_traceback";
    pub const RESULTS: &str = "results";
}

// ---------------------------------------------------------------------------
// Argument Key
// ---------------------------------------------------------------------------

/// Identifier for one unit of work: an ordered tuple of text parts.
///
/// A bare path is a one-part key. Keys are written to the log as JSON arrays
/// and always come back as tuples of text, so a key survives a save/load
/// cycle unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArgKey(Vec<String>);

impl ArgKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.0.iter().cloned().map(Value::String).collect())
    }

    /// Rebuild a key from its serialized form.
    ///
    /// Arrays become tuples with every element rendered as text; a bare
    /// scalar becomes a one-part key. Objects and `null` are not keys.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) => Some(Self(items.iter().map(leaf_text).collect())),
            Value::Object(_) | Value::Null => None,
            scalar => Some(Self(vec![leaf_text(scalar)])),
        }
    }
}

fn leaf_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl fmt::Display for ArgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

impl From<&str> for ArgKey {
    fn from(part: &str) -> Self {
        Self(vec![part.to_string()])
    }
}

impl From<String> for ArgKey {
    fn from(part: String) -> Self {
        Self(vec![part])
    }
}

impl From<&std::path::Path> for ArgKey {
    fn from(path: &std::path::Path) -> Self {
        Self(vec![path.display().to_string()])
    }
}

impl From<Vec<String>> for ArgKey {
    fn from(parts: Vec<String>) -> Self {
        Self(parts)
    }
}

impl<const N: usize> From<[&str; N]> for ArgKey {
    fn from(parts: [&str; N]) -> Self {
        Self::new(parts)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of an attempt record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Never tried.
    New,
    /// Processing started and has not recorded an outcome. Blocks re-entry.
    Attempting,
    /// Done successfully. Terminal until explicitly reset.
    Completed,
    /// Failed; the next run retries it.
    Errored,
}

/// Accepted spellings for each state. Canonical names come first.
const STATE_ALIASES: &[(&str, State)] = &[
    ("new", State::New),
    ("untried", State::New),
    ("attempting", State::Attempting),
    ("attempted", State::Attempting),
    ("in progress", State::Attempting),
    ("in_progress", State::Attempting),
    ("running", State::Attempting),
    ("completed", State::Completed),
    ("complete", State::Completed),
    ("done", State::Completed),
    ("finished", State::Completed),
    ("errored", State::Errored),
    ("error", State::Errored),
    ("exception", State::Errored),
    ("stopped", State::Errored),
];

impl State {
    /// Can the state machine move a record from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (New, Attempting)
                | (Errored, Attempting) // retry
                | (Attempting, Completed)
                | (Attempting, Errored)
                | (New, Errored) // canceled before processing began
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::New => "new",
            State::Attempting => "attempting",
            State::Completed => "completed",
            State::Errored => "errored",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let needle = s.trim().to_ascii_lowercase();
        STATE_ALIASES
            .iter()
            .find(|(alias, _)| *alias == needle)
            .map(|(_, state)| *state)
            .ok_or_else(|| Error::InvalidState(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error Detail
// ---------------------------------------------------------------------------

/// What went wrong in an errored attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub exc_type: String,
    pub exc_value: String,
    pub exc_traceback: String,
}

// ---------------------------------------------------------------------------
// Attempt Record
// ---------------------------------------------------------------------------

/// Field map persisted for one argument key.
///
/// Holds the state machine's fields plus anything the processing step writes
/// (conventionally `results`).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttemptRecord {
    fields: Map<String, Value>,
}

impl AttemptRecord {
    /// A fresh record in state `new`.
    pub fn new() -> Self {
        let mut record = Self::default();
        record.set_state(State::New);
        record
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Raw text of the `state` field, if any.
    pub fn state_raw(&self) -> Option<&str> {
        self.get_str(fields::STATE)
    }

    /// Parsed state. A missing or unrecognised value is [`Error::InvalidState`].
    pub fn state(&self) -> Result<State> {
        match self.get(fields::STATE) {
            Some(Value::String(s)) => s.parse(),
            Some(other) => Err(Error::InvalidState(other.to_string())),
            None => Err(Error::InvalidState(String::new())),
        }
    }

    pub fn set_state(&mut self, state: State) {
        self.set(fields::STATE, state.as_str());
    }

    pub fn set_error(&mut self, detail: &ErrorDetail) {
        self.set_state(State::Errored);
        self.set(fields::EXC_TYPE, detail.exc_type.clone());
        self.set(fields::EXC_VALUE, detail.exc_value.clone());
        self.set(fields::EXC_TRACEBACK, detail.exc_traceback.clone());
    }

    /// Drop `exc_type`, `exc_value` and `exc_traceback`.
    pub fn clear_error(&mut self) {
        self.remove(fields::EXC_TYPE);
        self.remove(fields::EXC_VALUE);
        self.remove(fields::EXC_TRACEBACK);
    }

    pub fn error_detail(&self) -> Option<ErrorDetail> {
        Some(ErrorDetail {
            exc_type: self.get_str(fields::EXC_TYPE)?.to_string(),
            exc_value: self.get_str(fields::EXC_VALUE)?.to_string(),
            exc_traceback: self.get_str(fields::EXC_TRACEBACK)?.to_string(),
        })
    }

    pub fn set_timing(&mut self, started: DateTime<Local>, stopped: DateTime<Local>) {
        self.set(fields::STARTED, format_timestamp(started));
        self.set(fields::STOPPED, format_timestamp(stopped));
        self.set(fields::ELAPSED, format_elapsed(stopped - started));
    }

    /// One-paragraph description of this record, for display only.
    pub fn summary(&self, key: &ArgKey) -> String {
        let state = self.state_raw().unwrap_or("?");
        let mut message = match self.get_str(fields::STOPPED) {
            Some(stopped) => format!("{stopped}: {state} <-- {key}"),
            None => format!("{state} <-- {key}"),
        };
        if let Some(detail) = self.error_detail() {
            message.push_str(&format!(
                "\n{}{}: {}",
                detail.exc_traceback, detail.exc_type, detail.exc_value
            ));
        }
        message
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Rebuild a record from its serialized form, rendering every scalar leaf
    /// as text. Returns `None` if the value is not an object.
    pub fn from_json(value: &Value) -> Option<Self> {
        match normalize_leaves(value) {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }
}

impl From<Map<String, Value>> for AttemptRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

/// Numbers and booleans become text; `null` and structure are kept.
fn normalize_leaves(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(s) => Value::String(s.clone()),
        Value::Bool(_) | Value::Number(_) => Value::String(value.to_string()),
        Value::Array(items) => Value::Array(items.iter().map(normalize_leaves).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize_leaves(v)))
                .collect(),
        ),
    }
}

// ---------------------------------------------------------------------------
// Time formatting
// ---------------------------------------------------------------------------

/// Local wall-clock time, e.g. `2026-10-17 09:15:02.531077`. Whole seconds
/// carry no fraction (`2026-10-17 09:15:02`).
pub fn format_timestamp(at: DateTime<Local>) -> String {
    if at.timestamp_subsec_micros() == 0 {
        at.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        at.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
    }
}

/// Duration as `[D day[s], ]H:MM:SS[.ffffff]`.
pub fn format_elapsed(elapsed: TimeDelta) -> String {
    let negative = elapsed < TimeDelta::zero();
    let total_us = elapsed.num_microseconds().unwrap_or(i64::MAX).unsigned_abs();

    let micros = total_us % 1_000_000;
    let total_secs = total_us / 1_000_000;
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if days > 0 {
        let unit = if days == 1 { "day" } else { "days" };
        out.push_str(&format!("{days} {unit}, "));
    }
    out.push_str(&format!("{hours}:{minutes:02}:{seconds:02}"));
    if micros != 0 {
        out.push_str(&format!(".{micros:06}"));
    }
    out
}
