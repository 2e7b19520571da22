//! Execution Fabric Library
//!
//! This crate provides the task execution substrate for the DU: a shared
//! worker pool, strands that sequentialize work over it, priority strands,
//! cancellable per-UE executors with drain semantics, and scoped resource
//! usage measurement.

pub mod rusage;
pub mod strand;
pub mod ue_executor;
pub mod worker_pool;

use std::sync::Arc;
use thiserror::Error;

pub use strand::{PriorityStrand, PriorityStrandExecutor, Strand};
pub use ue_executor::{CancellableExecutor, IoUlExecutor, UeExecutorMapper, UeExecutorPool};
pub use worker_pool::{PoolExecutor, QueuePolicy, WorkerPool, WorkerPoolConfig};

/// A task submitted to an executor
pub type UniqueTask = Box<dyn FnOnce() + Send + 'static>;

/// Fabric errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricError {
    #[error("task queue full")]
    QueueFull,

    #[error("executor stopped")]
    Stopped,

    #[error("drain barrier lost before completion")]
    DrainFailed,

    #[error("invalid configuration")]
    InvalidConfig,
}

/// Anything that can run tasks.
///
/// `execute` may run the task inline when the caller already sits on the
/// right execution context; `defer` never runs inline.
pub trait TaskExecutor: Send + Sync {
    /// Run or enqueue a task
    fn execute(&self, task: UniqueTask) -> Result<(), FabricError>;

    /// Enqueue a task, never running it on the caller's stack
    fn defer(&self, task: UniqueTask) -> Result<(), FabricError>;
}

/// Shared handle to a task executor
pub type SharedExecutor = Arc<dyn TaskExecutor>;

/// Executor that runs every task on the caller's thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn execute(&self, task: UniqueTask) -> Result<(), FabricError> {
        task();
        Ok(())
    }

    fn defer(&self, task: UniqueTask) -> Result<(), FabricError> {
        // Inline execution has no queue to defer onto.
        task();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_inline_executor_runs_on_caller() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        InlineExecutor.execute(Box::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }))
        .unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
