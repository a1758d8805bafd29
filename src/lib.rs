//! # cmdq
//!
//! In-process command queue. Deduplicates equivalent in-flight commands,
//! orders pending work by priority then arrival, tracks each command's
//! lifecycle, and orphans work left started by a previous run.
//!
//! The durable store is pluggable ([`store::CommandStore`]); a Postgres
//! implementation and an in-memory one ship with the crate.

pub mod cache;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod manager;
pub mod model;
pub mod registry;
pub mod store;
pub mod telemetry;

pub use command::{Command, CommandKind};
pub use error::{Error, Result};
pub use manager::CommandQueueManager;
pub use model::{CommandId, CommandModel, Priority, Status, Trigger};
