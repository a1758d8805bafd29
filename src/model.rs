//! Core data model.
//!
//! A command model is the authoritative lifecycle record for one accepted
//! command: identity, payload, priority, trigger, status, and timing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::Error;

// ---------------------------------------------------------------------------
// Command Model
// ---------------------------------------------------------------------------

/// Lifecycle record for an accepted command.
///
/// Records handed out by the manager are snapshots. Only the manager moves a
/// record through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandModel {
    /// Store-assigned identifier. [`CommandId::UNASSIGNED`] until inserted.
    pub id: CommandId,

    /// Kind name, mirrored from the body for querying.
    pub name: String,

    /// The command payload.
    pub body: Command,

    pub priority: Priority,
    pub trigger: Trigger,
    pub status: Status,

    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// `ended_at - started_at` in milliseconds, set with `ended_at`.
    pub duration_ms: Option<i64>,

    /// Failure detail recorded by `failed`.
    pub exception: Option<String>,

    /// Latest progress message. Never persisted.
    #[serde(skip)]
    pub message: Option<String>,
}

impl CommandModel {
    /// A fresh queued record for `body`. The id is assigned on insert.
    pub fn queued(body: Command, priority: Priority, trigger: Trigger) -> Self {
        Self {
            id: CommandId::UNASSIGNED,
            name: body.name.clone(),
            body,
            priority,
            trigger,
            status: Status::Queued,
            queued_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration_ms: None,
            exception: None,
            message: None,
        }
    }

    /// Queued → Started.
    pub(crate) fn start(&mut self, now: DateTime<Utc>) -> crate::error::Result<()> {
        self.transition(Status::Started)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Started → terminal. Stamps `ended_at` and the derived duration.
    pub(crate) fn finish(
        &mut self,
        status: Status,
        now: DateTime<Utc>,
    ) -> crate::error::Result<()> {
        self.transition(status)?;
        self.ended_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds());
        Ok(())
    }

    fn transition(&mut self, to: Status) -> crate::error::Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InconsistentState {
                id: self.id,
                status: self.status,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Newtype for command ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommandId(pub i64);

impl CommandId {
    /// Placeholder carried by a record that has not been inserted yet.
    pub const UNASSIGNED: CommandId = CommandId(0);
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Accepted, waiting for a dispatcher.
    Queued,
    /// Claimed by `pop`, executing.
    Started,
    /// Executor reported success. Terminal.
    Completed,
    /// Executor reported failure. Terminal.
    Failed,
    /// Was started when the process went away. Terminal, never retried.
    Orphaned,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Queued, Started) | (Started, Completed) | (Started, Failed) | (Started, Orphaned)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Orphaned)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Queued => "queued",
            Status::Started => "started",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Orphaned => "orphaned",
        };
        f.pad(s)
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Status::Queued),
            "started" => Ok(Status::Started),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            "orphaned" => Ok(Status::Orphaned),
            _ => Err(Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Priority band. Declared low to high so `Ord` ranks `High` greatest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        };
        f.pad(s)
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            _ => Err(Error::Other(format!("unknown priority: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// What caused a command to be pushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Unspecified,
    Manual,
    Scheduled,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trigger::Unspecified => "unspecified",
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
        };
        f.pad(s)
    }
}

impl FromStr for Trigger {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unspecified" => Ok(Trigger::Unspecified),
            "manual" => Ok(Trigger::Manual),
            "scheduled" => Ok(Trigger::Scheduled),
            _ => Err(Error::Other(format!("unknown trigger: {s}"))),
        }
    }
}
