//! Command execution span helpers.

use tracing::Span;

use crate::model::{CommandId, Status};

/// Start a span for one command execution.
///
/// The `command.status` field is declared empty and is filled in by
/// [`record_state_transition`].
pub fn start_command_span(name: &str, id: CommandId) -> Span {
    tracing::info_span!(
        "command.execute",
        "command.name" = name,
        "command.id" = id.0,
        "command.status" = tracing::field::Empty,
    )
}

/// Record a status transition on `span`.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("command.status", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}
