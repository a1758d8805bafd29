//! Metric instrument factories for cmdq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"cmdq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for cmdq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("cmdq")
}

/// Counter: commands pushed.
/// Labels: `name`, `result` ("ok" | "duplicate").
pub fn commands_pushed() -> Counter<u64> {
    meter()
        .u64_counter("cmdq.command.pushed")
        .with_description("Number of commands pushed")
        .build()
}

/// Counter: command status transitions.
/// Labels: `from`, `to`.
pub fn command_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("cmdq.command.state_transitions")
        .with_description("Number of command status transitions")
        .build()
}

/// Histogram: time from start to terminal status, in milliseconds.
/// Labels: `name`.
pub fn command_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("cmdq.command.duration_ms")
        .with_description("Command execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: commands failed because no executor handles their kind.
/// Labels: `name`.
pub fn commands_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("cmdq.command.unroutable")
        .with_description("Commands with no matching executor")
        .build()
}

/// Counter: started commands orphaned by the recovery pass.
pub fn commands_orphaned() -> Counter<u64> {
    meter()
        .u64_counter("cmdq.command.orphaned")
        .with_description("Commands orphaned at startup")
        .build()
}
