//! Process lifecycle events.
//!
//! The queue manager reacts to `ApplicationStarted` by running its
//! recovery pass. Hosts publish these through [`LifecycleEvent`] and any
//! [`HandleLifecycle`] subscriber.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The host process finished starting up.
    ApplicationStarted,
    /// The host process is about to exit.
    ApplicationShutdown,
}

/// A subscriber to lifecycle events.
#[async_trait]
pub trait HandleLifecycle: Send + Sync {
    async fn handle(&self, event: LifecycleEvent) -> Result<()>;
}
