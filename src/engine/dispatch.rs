//! Dispatch loop: waits for work, pops commands, runs executors, reports outcomes.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{Instrument, error, info, warn};

use super::executor::{ExecutorRegistry, Progress};
use crate::error::Result;
use crate::event::{HandleLifecycle, LifecycleEvent};
use crate::manager::CommandQueueManager;
use crate::model::{CommandModel, Status};
use crate::telemetry::command::{record_state_transition, start_command_span};
use crate::telemetry::metrics;

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Poll interval fallback when no work-ready signal arrives.
    pub poll_interval: Duration,
    /// Maximum commands executing at once.
    pub max_concurrent: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_concurrent: 4,
        }
    }
}

/// The dispatch loop. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    manager: Arc<CommandQueueManager>,
    executors: Arc<ExecutorRegistry>,
    config: DispatchConfig,
    shutdown: Arc<Notify>,
    slot_freed: Arc<Notify>,
    active: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(
        manager: Arc<CommandQueueManager>,
        executors: Arc<ExecutorRegistry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            manager,
            executors,
            config,
            shutdown: Arc::new(Notify::new()),
            slot_freed: Arc::new(Notify::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Signal the dispatcher to stop. Running commands are not interrupted.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Commands currently executing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Run recovery, then dispatch until shutdown.
    pub async fn run(&self) -> Result<()> {
        self.manager
            .handle(LifecycleEvent::ApplicationStarted)
            .await?;

        info!(
            max_concurrent = self.config.max_concurrent,
            "dispatcher started, waiting for commands"
        );

        loop {
            if let Err(e) = self.dispatch_available().await {
                error!("dispatch error: {e}");
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("dispatcher shutting down");
                    return Ok(());
                }
                _ = self.manager.work_ready() => {}
                _ = self.slot_freed.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Pop and spawn commands until the queue is empty or capacity is used.
    /// Returns how many were spawned.
    pub async fn dispatch_available(&self) -> Result<usize> {
        let mut spawned = 0;
        while self.active.load(Ordering::Acquire) < self.config.max_concurrent {
            let Some(command) = self.manager.pop().await? else {
                break;
            };

            self.active.fetch_add(1, Ordering::AcqRel);
            let claimed = command.clone();
            let this = self.clone();
            let task = tokio::spawn(async move { this.execute(command).await });

            // Watch the task so a panicking executor still frees its slot
            // and its command leaves Started.
            let this = self.clone();
            tokio::spawn(async move {
                match task.await {
                    Err(e) if e.is_panic() => {
                        let detail = panic_message(e.into_panic());
                        error!(id = %claimed.id, name = %claimed.name, "executor panicked: {detail}");
                        this.report_failed(&claimed, format!("executor panicked: {detail}"))
                            .await;
                    }
                    _ => {}
                }
                this.active.fetch_sub(1, Ordering::AcqRel);
                this.slot_freed.notify_one();
            });
            spawned += 1;
        }
        Ok(spawned)
    }

    /// Execute one started command and report exactly one outcome.
    pub async fn execute(&self, command: CommandModel) {
        let span = start_command_span(&command.name, command.id);

        async {
            let Some(executor) = self.executors.get(&command.name) else {
                warn!(id = %command.id, name = %command.name, "no executor for command kind");
                metrics::commands_unroutable()
                    .add(1, &[KeyValue::new("name", command.name.clone())]);
                record_state_transition(&span, Status::Started, Status::Failed);
                self.report_failed(&command, "no executor registered for this command kind")
                    .await;
                return;
            };

            let progress = Progress::new(Arc::clone(&self.manager), command.clone());
            match executor.execute(&command, &progress).await {
                Ok(()) => {
                    record_state_transition(&span, Status::Started, Status::Completed);
                    if let Err(e) = self.manager.completed(&command).await {
                        error!(id = %command.id, "could not record completion: {e}");
                    }
                }
                Err(e) => {
                    record_state_transition(&span, Status::Started, Status::Failed);
                    self.report_failed(&command, format!("{e:#}")).await;
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    async fn report_failed(&self, command: &CommandModel, error: impl std::fmt::Display) {
        if let Err(e) = self.manager.failed(command, error).await {
            error!(id = %command.id, "could not record failure: {e}");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
