//! Command execution: executors and the dispatch loop.

pub mod dispatch;
pub mod executor;

pub use dispatch::{DispatchConfig, Dispatcher};
pub use executor::{Executor, ExecutorRegistry, Progress, ProcessExecutor};
