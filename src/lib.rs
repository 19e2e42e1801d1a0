//! # task-logger
//!
//! Per-item processing tracker for long-running batch jobs.
//!
//! Each unit of work is named by an [`ArgKey`]. A [`Session`] opens a JSON
//! log, runs one [`Attempt`] per key, and records whether the item is new,
//! in progress, completed or errored, so a re-run skips finished items,
//! retries failed ones, and refuses to touch items a crashed run left
//! mid-flight.
//!
//! ```no_run
//! use task_logger::{Session, SessionOptions};
//!
//! # fn main() -> Result<(), task_logger::Error> {
//! Session::scope("import-log.json", SessionOptions::default(), |session| {
//!     session.run_batch(["a.sdf", "b.sdf"], |key, record| {
//!         let text = std::fs::read_to_string(&key.parts()[0])?;
//!         record.set("results", text.lines().count());
//!         Ok(())
//!     })
//! })
//! # }
//! ```

pub mod attempt;
pub mod config;
pub mod error;
pub mod model;
pub mod session;
pub mod store;
pub mod telemetry;

pub use attempt::{Attempt, AttemptCanceled, Entry, ErrorPolicy, NonSuppressedError, Outcome};
pub use error::{Error, Result};
pub use model::{ArgKey, AttemptRecord, ErrorDetail, State};
pub use session::{Session, SessionOptions};
pub use store::LogStore;
