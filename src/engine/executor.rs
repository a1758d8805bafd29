//! Executors run popped commands.
//!
//! An executor is chosen by command kind. It reports progress through a
//! [`Progress`] handle and returns `Err` when the work itself fails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::manager::CommandQueueManager;
use crate::model::CommandModel;
use crate::registry::KindRegistry;

/// Runs commands of one or more kinds.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, command: &CommandModel, progress: &Progress) -> anyhow::Result<()>;
}

/// Progress reporting for one executing command.
#[derive(Clone)]
pub struct Progress {
    manager: Arc<CommandQueueManager>,
    command: CommandModel,
}

impl Progress {
    pub fn new(manager: Arc<CommandQueueManager>, command: CommandModel) -> Self {
        Self { manager, command }
    }

    /// Replace the command's progress message.
    pub fn set_message(&self, message: impl Into<String>) {
        self.manager.set_message(&self.command, message);
    }
}

/// Executors keyed by kind name, matched ignoring ASCII case.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: &str, executor: Arc<dyn Executor>) -> &mut Self {
        self.executors.insert(kind.to_ascii_lowercase(), executor);
        self
    }

    /// A [`ProcessExecutor`] for every kind that declares a hook.
    pub fn from_kinds(kinds: &KindRegistry) -> Self {
        let mut registry = Self::empty();
        for entry in kinds.entries() {
            if let Some(hook) = entry.hook() {
                registry.register(entry.name(), Arc::new(ProcessExecutor::new(hook)));
            }
        }
        registry
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(&kind.to_ascii_lowercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

/// Runs an external executable per command.
///
/// The command record is written to stdin as JSON while stdout is read.
/// Each non-empty stdout line becomes the progress message. A non-zero exit fails the command
/// with the captured stderr.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, command: &CommandModel, progress: &Progress) -> anyhow::Result<()> {
        let program = if self.program.is_relative() {
            std::env::current_dir()?.join(&self.program)
        } else {
            self.program.clone()
        };

        debug!(
            id = %command.id,
            program = %program.display(),
            "running hook"
        );

        let mut child = tokio::process::Command::new(&program)
            .env("CMDQ_COMMAND_ID", command.id.to_string())
            .env("CMDQ_COMMAND_NAME", &command.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {}", program.display()))?;

        // Stdin is fed on its own task so a hook that writes output before
        // reading its input cannot deadlock against us.
        let payload = serde_json::to_vec(command).context("serialize command")?;
        let mut stdin = child.stdin.take().context("hook stdin not captured")?;
        let stdin_task = tokio::spawn(async move {
            // The hook may exit without reading stdin.
            let _ = stdin.write_all(&payload).await;
        });

        let mut stderr = child.stderr.take().context("hook stderr not captured")?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let stdout = child.stdout.take().context("hook stdout not captured")?;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if !line.is_empty() {
                progress.set_message(line);
            }
        }

        let status = child.wait().await?;
        let _ = stdin_task.await;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            match stderr.trim() {
                "" => bail!("hook exited with status {code}"),
                detail => bail!("hook exited with status {code}: {detail}"),
            }
        }
        Ok(())
    }
}
