//! Command queue manager. The public API for pushing and claiming commands.
//!
//! The manager owns the volatile caches and coordinates them with the
//! durable store. Push, pop, recovery, and terminal transitions share one
//! async mutex; `get` and `set_message` never take it.
//!
//! Push and pop write the store before the cache. A terminal report marks
//! the cached record first and restores it if the store write fails, so a
//! failed store write always leaves the cache as it was.

use std::cmp::Reverse;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::{Mutex, Notify, OnceCell};
use tracing::{debug, info, trace, warn};

use crate::cache::Cache;
use crate::command::{Command, CommandKind};
use crate::error::Result;
use crate::event::{HandleLifecycle, LifecycleEvent};
use crate::model::{CommandId, CommandModel, Priority, Status, Trigger};
use crate::registry::KindRegistry;
use crate::store::CommandStore;
use crate::telemetry::metrics;

/// The command queue. Share it behind an `Arc`.
pub struct CommandQueueManager {
    store: Arc<dyn CommandStore>,
    kinds: KindRegistry,
    commands: Cache<CommandModel>,
    messages: Cache<String>,
    lock: Mutex<()>,
    recovered: OnceCell<()>,
    work_ready: Notify,
}

impl CommandQueueManager {
    pub fn new(store: Arc<dyn CommandStore>, kinds: KindRegistry) -> Self {
        Self {
            store,
            kinds,
            commands: Cache::new(),
            messages: Cache::new(),
            lock: Mutex::new(()),
            recovered: OnceCell::new(),
            work_ready: Notify::new(),
        }
    }

    /// Kinds known to `push_named`.
    pub fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    /// Push a command.
    ///
    /// If a non-terminal duplicate is already cached, that record is returned
    /// unchanged and nothing is written. Waits for the startup recovery pass
    /// so records queued by a previous run take part in the duplicate check.
    pub async fn push(
        &self,
        mut command: Command,
        priority: Priority,
        trigger: Trigger,
    ) -> Result<CommandModel> {
        command.validate()?;
        command.trigger = trigger;
        trace!(name = %command.name, "publishing command");

        self.ensure_recovered().await?;

        let _guard = self.lock.lock().await;

        let existing = self
            .commands
            .values()
            .into_iter()
            .filter(|c| !c.status.is_terminal() && c.body.is_duplicate_of(&command))
            .min_by_key(|c| c.id);

        if let Some(existing) = existing {
            trace!(name = %command.name, id = %existing.id, "command is already in progress");
            record_push(&existing.name, "duplicate");
            return Ok(existing);
        }

        let mut model = CommandModel::queued(command, priority, trigger);
        model.id = self.store.insert(&model).await?;
        self.commands.set(model.id, model.clone());

        debug!(id = %model.id, name = %model.name, %priority, %trigger, "command queued");
        record_push(&model.name, "ok");
        self.work_ready.notify_one();

        Ok(model)
    }

    /// Push a typed command.
    pub async fn push_kind<K: CommandKind>(
        &self,
        kind: &K,
        priority: Priority,
        trigger: Trigger,
    ) -> Result<CommandModel> {
        self.push(Command::from_kind(kind)?, priority, trigger).await
    }

    /// Push a default-valued command resolved by kind name.
    pub async fn push_named(
        &self,
        name: &str,
        last_execution_time: Option<DateTime<Utc>>,
        priority: Priority,
        trigger: Trigger,
    ) -> Result<CommandModel> {
        let command = self
            .kinds
            .resolve(name)?
            .create()
            .last_execution_time(last_execution_time)
            .trigger(trigger);

        self.push(command, priority, trigger).await
    }

    /// Claim the next queued command: highest priority, then oldest.
    ///
    /// Waits for the startup recovery pass if it has not run yet.
    pub async fn pop(&self) -> Result<Option<CommandModel>> {
        self.ensure_recovered().await?;

        let _guard = self.lock.lock().await;

        let next = self
            .commands
            .values()
            .into_iter()
            .filter(|c| c.status == Status::Queued)
            .min_by_key(|c| (Reverse(c.priority), c.queued_at, c.id));

        let Some(mut claimed) = next else {
            return Ok(None);
        };

        claimed.start(Utc::now())?;
        self.store.update(&claimed).await?;
        self.commands.set(claimed.id, claimed.clone());

        record_transition(Status::Queued, Status::Started);
        debug!(id = %claimed.id, name = %claimed.name, "command started");

        Ok(Some(claimed))
    }

    /// Get a command from the store, with its latest progress message.
    pub async fn get(&self, id: CommandId) -> Result<CommandModel> {
        let mut model = self.store.get(id).await?;
        model.message = self.messages.find(id);
        Ok(model)
    }

    /// All started commands in the store.
    pub async fn get_started(&self) -> Result<Vec<CommandModel>> {
        self.store.list_started().await
    }

    /// Set the progress message for a command, replacing any earlier one.
    pub fn set_message(&self, command: &CommandModel, message: impl Into<String>) {
        self.messages.set(command.id, message.into());
    }

    /// Report that a started command finished successfully.
    pub async fn completed(&self, command: &CommandModel) -> Result<()> {
        self.finish(command, Status::Completed, None).await
    }

    /// Report that a started command failed. The error text is persisted.
    pub async fn failed(
        &self,
        command: &CommandModel,
        error: impl std::fmt::Display,
    ) -> Result<()> {
        self.finish(command, Status::Failed, Some(error.to_string()))
            .await
    }

    /// Number of commands currently cached (queued or started).
    pub fn cached_len(&self) -> usize {
        self.commands.len()
    }

    /// Wait until a new command is queued.
    pub async fn work_ready(&self) {
        self.work_ready.notified().await;
    }

    /// Run the startup recovery pass unless it already ran.
    pub async fn ensure_recovered(&self) -> Result<()> {
        self.recovered
            .get_or_try_init(|| async { self.recover().await })
            .await?;
        Ok(())
    }

    /// Orphan every started record, then reload queued records into the cache.
    async fn recover(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        let orphaned = self.store.mark_all_started_as_orphaned().await?;
        if orphaned > 0 {
            warn!(orphaned, "orphaned commands left started by a previous run");
            metrics::commands_orphaned().add(orphaned, &[]);
        }

        let queued = self.store.list_queued().await?;
        let reloaded = queued.len();
        for command in queued {
            self.commands.set(command.id, command);
        }

        info!(orphaned, reloaded, "command queue recovered");
        if reloaded > 0 {
            self.work_ready.notify_one();
        }
        Ok(())
    }

    async fn finish(
        &self,
        command: &CommandModel,
        status: Status,
        exception: Option<String>,
    ) -> Result<()> {
        // Check and flip the cached copy under the lock, so a second report
        // for the same record sees a terminal status and is rejected.
        let (previous, finished) = {
            let _guard = self.lock.lock().await;
            let (current, cached) = match self.commands.find(command.id) {
                Some(current) => (current, true),
                None => (self.store.get(command.id).await?, false),
            };

            let mut finished = current.clone();
            finished.finish(status, Utc::now())?;
            if exception.is_some() {
                finished.exception = exception;
            }
            self.commands.set(finished.id, finished.clone());
            (cached.then_some(current), finished)
        };

        if let Err(e) = self.store.update(&finished).await {
            let _guard = self.lock.lock().await;
            match previous {
                Some(previous) => self.commands.set(previous.id, previous),
                None => {
                    self.commands.remove(finished.id);
                }
            }
            return Err(e);
        }

        {
            let _guard = self.lock.lock().await;
            self.commands.remove(finished.id);
        }
        self.messages.remove(finished.id);

        record_transition(Status::Started, status);
        if let Some(duration_ms) = finished.duration_ms {
            metrics::command_duration_ms().record(
                duration_ms as f64,
                &[KeyValue::new("name", finished.name.clone())],
            );
        }
        match status {
            Status::Failed => warn!(
                id = %finished.id,
                name = %finished.name,
                duration_ms = finished.duration_ms,
                error = finished.exception.as_deref().unwrap_or_default(),
                "command failed"
            ),
            _ => debug!(
                id = %finished.id,
                name = %finished.name,
                duration_ms = finished.duration_ms,
                "command finished"
            ),
        }

        Ok(())
    }
}

#[async_trait]
impl HandleLifecycle for CommandQueueManager {
    async fn handle(&self, event: LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::ApplicationStarted => self.ensure_recovered().await,
            LifecycleEvent::ApplicationShutdown => Ok(()),
        }
    }
}

fn record_push(name: &str, result: &'static str) {
    metrics::commands_pushed().add(
        1,
        &[
            KeyValue::new("name", name.to_string()),
            KeyValue::new("result", result),
        ],
    );
}

fn record_transition(from: Status, to: Status) {
    metrics::command_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}
