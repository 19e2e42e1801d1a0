//! Metric instrument factories for task-logger.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider (no OTLP endpoint) every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Meter (and default service) name for task-logger instruments.
pub const METER_NAME: &str = "task-logger";

fn meter() -> Meter {
    opentelemetry::global::meter(METER_NAME)
}

/// Counter: finished attempts.
/// Labels: `outcome` ("completed" | "skipped_in_progress" | "skipped_completed" | "errored" | "fatal").
pub fn attempts() -> Counter<u64> {
    meter()
        .u64_counter("task_logger.attempts")
        .with_description("Number of finished processing attempts")
        .build()
}

/// Histogram: wall-clock attempt duration in milliseconds.
/// Labels: `outcome`.
pub fn attempt_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("task_logger.attempt.duration_ms")
        .with_description("Attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: whole-document writes of a log store.
pub fn store_flushes() -> Counter<u64> {
    meter()
        .u64_counter("task_logger.store.flushes")
        .with_description("Number of log store writes")
        .build()
}
