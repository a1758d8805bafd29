//! Durable command store.
//!
//! The store is the single source of truth once cache entries are evicted.
//! Implementations: [`MemoryCommandStore`] for tests and ephemeral runs,
//! [`PgCommandStore`] for Postgres.

pub mod memory;
pub mod postgres;

pub use memory::MemoryCommandStore;
pub use postgres::PgCommandStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{CommandId, CommandModel};

/// Persistence contract consumed by the queue manager.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Persist a new record and return its assigned id. The record's own
    /// `id` is ignored.
    async fn insert(&self, record: &CommandModel) -> Result<CommandId>;

    /// Overwrite the record matching `record.id`. `NotFound` if absent.
    async fn update(&self, record: &CommandModel) -> Result<()>;

    /// Fetch a record by id. `NotFound` if absent.
    async fn get(&self, id: CommandId) -> Result<CommandModel>;

    /// All queued records, oldest first.
    async fn list_queued(&self) -> Result<Vec<CommandModel>>;

    /// All started records, oldest first.
    async fn list_started(&self) -> Result<Vec<CommandModel>>;

    /// Move every started record to orphaned. Returns how many moved.
    /// Running it twice is harmless.
    async fn mark_all_started_as_orphaned(&self) -> Result<u64>;
}
